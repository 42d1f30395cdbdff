use clap::Parser;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Instant;

use warren_core::config::ControllerSettings;
use warren_core::controller::Controller;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    #[clap(long)]
    target_command: Option<String>,
    #[clap(short, long)]
    iterations: Option<u64>,
    /// Run the target in persistent mode (self-suspending children).
    #[clap(long)]
    persistent: bool,
    /// Arm the one-shot operand capture for this branch site, run once,
    /// print the operands, and exit.
    #[clap(long)]
    capture_branch: Option<i32>,
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let mut settings = match cli.config_file {
        Some(config_path) => {
            println!("Loading configuration from specified path: {config_path:?}");
            ControllerSettings::load_from_file(&config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("config.toml");
            if default_config_path.exists() {
                println!(
                    "No config file specified via CLI, loading default: {default_config_path:?}",
                );
                ControllerSettings::load_from_file(&default_config_path)?
            } else {
                let command = cli.target_command.clone().ok_or_else(|| {
                    anyhow::anyhow!(
                        "No config file found and no --target-command given; nothing to run"
                    )
                })?;
                ControllerSettings::for_command(vec![command])
            }
        }
    };

    if let Some(target_cmd_str) = cli.target_command {
        if !settings.command.is_empty() {
            settings.command[0] = target_cmd_str;
        } else {
            settings.command.push(target_cmd_str);
        }
    }
    if let Some(iterations) = cli.iterations {
        settings.iterations = iterations;
    }
    if cli.persistent {
        settings.persistent = true;
    }

    println!("Effective configuration: {settings:#?}");

    let mut controller = Controller::launch(&settings)?;

    if let Some(branch_id) = cli.capture_branch {
        controller.arm_capture(branch_id);
        let report = controller.run_once()?;
        match controller.captured_operands() {
            Some(operands) => println!(
                "Branch {}: lhs={} rhs={} (child {} -> {:?})",
                branch_id, operands.lhs, operands.rhs, report.pid, report.outcome
            ),
            None => println!(
                "Branch {} never fired (child {} -> {:?})",
                branch_id, report.pid, report.outcome
            ),
        }
        controller.shutdown();
        return Ok(());
    }

    println!("Starting execution loop against the target's fork server...");
    let start_time = Instant::now();
    let mut seen_maps: HashSet<[u8; 16]> = HashSet::new();
    let mut new_coverage = 0u64;
    let mut crashes = 0u64;

    let progress_every = (settings.iterations / 100).max(1);

    for i in 0..settings.iterations {
        let report = controller.run_once()?;

        if seen_maps.insert(controller.coverage_digest()) {
            new_coverage += 1;
        }
        if report.outcome.is_crash() {
            crashes += 1;
            println!(
                "\n!!! CRASH (Execution {}) !!!\n  Child: {}\n  Outcome: {:?}",
                i + 1,
                report.pid,
                report.outcome
            );
        }

        if i % progress_every == 0 && i > 0 {
            let elapsed = start_time.elapsed().as_secs_f32();
            let exec_per_sec = (i + 1) as f32 / elapsed;
            print!(
                "\rIter: {}/{}, Coverage shapes: {}, Crashes: {}, Execs/sec: {:.2}",
                i + 1,
                settings.iterations,
                seen_maps.len(),
                crashes,
                exec_per_sec
            );
            use std::io::Write;
            std::io::stdout().flush()?;
        }
    }

    let elapsed_total = start_time.elapsed();
    println!("\nExecution loop finished in {elapsed_total:.2?}.");
    println!(
        "Total Executions: {}, Distinct coverage shapes: {} ({} first-seen), Crashes: {}",
        settings.iterations,
        seen_maps.len(),
        new_coverage,
        crashes
    );

    controller.shutdown();
    Ok(())
}
