use serde::Deserialize;
use std::env::VarError;
use std::path::PathBuf;
use thiserror::Error;

/// Environment variable holding the path of the shared feedback-map file.
/// When absent the runtime keeps writing to its private fallback buffer and
/// the process behaves like an ordinary, unsupervised execution.
pub const SHM_PATH_ENV: &str = "WARREN_SHM_PATH";

/// Set (to any value) by the controller to enable the persistent loop in the
/// target: the forked child then self-suspends between logical inputs instead
/// of exiting.
pub const PERSISTENT_ENV: &str = "WARREN_PERSISTENT";

/// Percentage (1-100) of guard slots that receive a location id when the
/// guard table is populated. Anything else is a fatal configuration error.
pub const INST_RATIO_ENV: &str = "WARREN_INST_RATIO";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid instrumentation ratio '{0}': must be an integer between 1 and 100")]
    InvalidRatio(String),
}

/// Fraction of eligible guard slots to instrument, as a whole percentage.
///
/// Out-of-range values are rejected, never clamped: a build that asked for
/// 0% or 250% coverage is misconfigured, and silently "fixing" the value
/// would make the resulting maps unexplainable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstrumentationRatio(u8);

impl InstrumentationRatio {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.trim().parse::<u8>() {
            Ok(percent) if (1..=100).contains(&percent) => Ok(Self(percent)),
            _ => Err(ConfigError::InvalidRatio(raw.to_string())),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(INST_RATIO_ENV) {
            Ok(raw) => Self::parse(&raw),
            Err(VarError::NotPresent) => Ok(Self::default()),
            Err(VarError::NotUnicode(raw)) => {
                Err(ConfigError::InvalidRatio(raw.to_string_lossy().into_owned()))
            }
        }
    }

    pub fn percent(self) -> u8 {
        self.0
    }
}

impl Default for InstrumentationRatio {
    fn default() -> Self {
        Self(100)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ControllerSettings {
    pub command: Vec<String>,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default = "default_iterations")]
    pub iterations: u64,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

pub fn default_iterations() -> u64 {
    10_000
}

impl ControllerSettings {
    pub fn for_command(command: Vec<String>) -> Self {
        Self {
            command,
            persistent: false,
            iterations: default_iterations(),
            working_dir: None,
        }
    }

    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let settings: ControllerSettings = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(settings)
    }
}
