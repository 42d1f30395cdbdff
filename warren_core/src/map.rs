use core::ffi::c_void;
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap};
use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use thiserror::Error;

use crate::config::SHM_PATH_ENV;

/// Size of the feedback map in bytes. A power of two, so edge keys can be
/// masked instead of reduced modulo.
pub const MAP_SIZE: usize = 1 << 16;

/// Errors raised while wiring the map up to a shared region.
///
/// Every one of these is fatal for a supervised run: without the shared map
/// the controller is blind, so callers on the target side terminate rather
/// than continue unobserved.
#[derive(Error, Debug)]
pub enum MapError {
    #[error("couldn't open shared map file {path:?}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("shared map file {path:?} is {len} bytes, need at least {MAP_SIZE}")]
    TooSmall { path: PathBuf, len: u64 },
    #[error("mmap of shared map file failed: {0}")]
    Mmap(#[from] nix::errno::Errno),
}

/// A `MAP_SHARED` mapping of an ordinary file, unmapped on drop.
///
/// Both ends of the system use this: the target maps the file the controller
/// created, and the controller maps the same file to read coverage back
/// between executions.
pub struct SharedRegion {
    ptr: NonNull<c_void>,
    len: usize,
}

impl SharedRegion {
    pub fn map_file(file: &File, len: usize) -> Result<Self, MapError> {
        let length = NonZeroUsize::new(len).ok_or(MapError::Mmap(nix::errno::Errno::EINVAL))?;
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file,
                0,
            )
        }?;
        Ok(Self { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast::<u8>(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().cast::<u8>(), self.len) }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        let _ = unsafe { munmap(self.ptr, self.len) };
    }
}

/// The feedback map: a fixed-size byte region every recorder writes into.
///
/// Until a shared region is attached, writes land in a private fallback
/// buffer so that code running before the handshake (static initializers,
/// standalone invocations) can record safely. Exactly one buffer is active
/// at any time; the active pointer only moves at attach time and when the
/// persistent loop retires the map after its last iteration, never during
/// an execution.
pub struct CoverageMap {
    private: Box<[u8]>,
    shared: Option<SharedRegion>,
    active: NonNull<u8>,
}

impl CoverageMap {
    /// A map backed only by the private fallback buffer.
    pub fn new() -> Self {
        let mut private = vec![0u8; MAP_SIZE].into_boxed_slice();
        let active = NonNull::from(&mut private[0]);
        Self {
            private,
            shared: None,
            active,
        }
    }

    /// Attach the shared map file at `path` and make it the active buffer.
    ///
    /// The first byte is set immediately so a consumer never mistakes
    /// "no instrumentation ran yet" for "the target died before main".
    pub fn attach(&mut self, path: &Path) -> Result<(), MapError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| MapError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        let len = file
            .metadata()
            .map_err(|source| MapError::Open {
                path: path.to_path_buf(),
                source,
            })?
            .len();
        if len < MAP_SIZE as u64 {
            return Err(MapError::TooSmall {
                path: path.to_path_buf(),
                len,
            });
        }

        let mut region = SharedRegion::map_file(&file, MAP_SIZE)?;
        self.active = NonNull::from(&mut region.as_mut_slice()[0]);
        self.shared = Some(region);
        self.mark_alive();
        Ok(())
    }

    /// Build a map from the environment: attached if the shared-map variable
    /// is set, private otherwise (standalone / unsupervised execution).
    pub fn from_env() -> Result<Self, MapError> {
        let mut map = Self::new();
        if let Some(path) = std::env::var_os(SHM_PATH_ENV) {
            map.attach(Path::new(&path))?;
        }
        Ok(map)
    }

    pub fn is_attached(&self) -> bool {
        self.shared.is_some()
    }

    /// Whether recorder writes currently land in the shared region.
    pub fn shared_is_active(&self) -> bool {
        match &self.shared {
            Some(region) => std::ptr::eq(region.as_slice().as_ptr(), self.active.as_ptr()),
            None => false,
        }
    }

    /// Saturating-by-wrap increment of one map cell. Hottest operation in
    /// the whole system; the index mask keeps it branch-free.
    #[inline]
    pub fn bump(&mut self, index: usize) {
        unsafe {
            let slot = self.active.as_ptr().add(index & (MAP_SIZE - 1));
            *slot = (*slot).wrapping_add(1);
        }
    }

    #[inline]
    pub fn slot(&self, index: usize) -> u8 {
        unsafe { *self.active.as_ptr().add(index & (MAP_SIZE - 1)) }
    }

    #[inline]
    pub fn set_slot(&mut self, index: usize, value: u8) {
        unsafe {
            *self.active.as_ptr().add(index & (MAP_SIZE - 1)) = value;
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.active.as_ptr(), MAP_SIZE) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.active.as_ptr(), MAP_SIZE) }
    }

    pub fn clear(&mut self) {
        self.as_mut_slice().fill(0);
    }

    /// Non-zero byte at offset 0: the liveness mark consumers rely on.
    pub fn mark_alive(&mut self) {
        self.as_mut_slice()[0] = 1;
    }

    /// Point the active buffer back at the private fallback, so code running
    /// after a persistent loop is not attributed to the shared map.
    pub fn retire_to_private(&mut self) {
        self.active = NonNull::from(&mut self.private[0]);
    }
}

impl Default for CoverageMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn sized_map_file() -> NamedTempFile {
        let file = NamedTempFile::new().expect("temp file");
        file.as_file()
            .set_len(MAP_SIZE as u64)
            .expect("set_len on temp file");
        file
    }

    #[test]
    fn fresh_map_is_private_and_zeroed() {
        let map = CoverageMap::new();
        assert!(!map.is_attached());
        assert!(!map.shared_is_active());
        assert!(map.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn attach_marks_the_shared_region_alive() {
        let file = sized_map_file();
        let mut map = CoverageMap::new();
        map.attach(file.path()).expect("attach");
        assert!(map.is_attached());
        assert!(map.shared_is_active());

        // A second, independent mapping of the same file sees the mark byte.
        let other = SharedRegion::map_file(file.as_file(), MAP_SIZE).expect("second mapping");
        assert_eq!(other.as_slice()[0], 1, "mark byte missing after attach");
    }

    #[test]
    fn writes_after_attach_are_visible_through_the_file() {
        let file = sized_map_file();
        let mut map = CoverageMap::new();
        map.attach(file.path()).expect("attach");

        map.bump(0x1a2b);
        map.bump(0x1a2b);

        let other = SharedRegion::map_file(file.as_file(), MAP_SIZE).expect("second mapping");
        assert_eq!(other.as_slice()[0x1a2b], 2);
    }

    #[test]
    fn bump_wraps_at_256() {
        let mut map = CoverageMap::new();
        for _ in 0..256 {
            map.bump(7);
        }
        assert_eq!(map.slot(7), 0, "hit counter should wrap, not stick");
        map.bump(7);
        assert_eq!(map.slot(7), 1);
    }

    #[test]
    fn attach_rejects_missing_file() {
        let mut map = CoverageMap::new();
        let err = map.attach(Path::new("/nonexistent/warren-map")).unwrap_err();
        assert!(matches!(err, MapError::Open { .. }));
        assert!(!map.is_attached());
    }

    #[test]
    fn attach_rejects_undersized_file() {
        let file = NamedTempFile::new().expect("temp file");
        file.as_file().set_len(128).expect("set_len");
        let mut map = CoverageMap::new();
        let err = map.attach(file.path()).unwrap_err();
        assert!(matches!(err, MapError::TooSmall { len: 128, .. }));
    }

    #[test]
    fn retire_redirects_writes_to_the_private_buffer() {
        let file = sized_map_file();
        let mut map = CoverageMap::new();
        map.attach(file.path()).expect("attach");
        map.retire_to_private();
        assert!(!map.shared_is_active());

        map.bump(99);
        let other = SharedRegion::map_file(file.as_file(), MAP_SIZE).expect("second mapping");
        assert_eq!(
            other.as_slice()[99], 0,
            "retired map must not leak writes into the shared region"
        );
        assert_eq!(map.slot(99), 1);
    }

    #[test]
    fn index_is_masked_into_range() {
        let mut map = CoverageMap::new();
        map.bump(MAP_SIZE + 5);
        assert_eq!(map.slot(5), 1);
    }
}
