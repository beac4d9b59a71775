//! Segment and result-slot keys.
//!
//! A segment is named after a token file: the device and inode numbers of the
//! file, plus a project byte, are hashed into a [`SegmentKey`] much like
//! `ftok(3)` does, so every process that can see the file derives the same
//! shared memory name.

use crate::error::{ForkFutError, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tempfile::TempPath;

/// Key of a shared memory segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentKey(u64);

impl SegmentKey {
    /// Project byte used when none is given.
    pub const DEFAULT_PROJECT: u8 = b'a';

    /// Derive the key from an existing file.
    pub fn from_path(path: &Path, project: u8) -> io::Result<Self> {
        let meta = fs::metadata(path)?;
        Ok(Self::from_ids(meta.dev(), meta.ino(), project))
    }

    /// Derive the key from raw device and inode numbers (FNV-1a).
    pub fn from_ids(dev: u64, ino: u64, project: u8) -> Self {
        const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

        let mut hash = FNV_OFFSET;
        let bytes = dev
            .to_le_bytes()
            .into_iter()
            .chain(ino.to_le_bytes())
            .chain([project]);
        for byte in bytes {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        Self(hash)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// POSIX shared memory object name for this key.
    ///
    /// Short enough for the 31-byte limit on macOS.
    pub fn shm_name(&self) -> String {
        format!("/forkfut-{:016x}", self.0)
    }
}

impl std::fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Handle of one result slot inside a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResultKey(u32);

impl ResultKey {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ResultKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// File a segment key is derived from.
#[derive(Debug)]
pub enum SegmentToken {
    /// Created for one orchestrator; deleted on teardown.
    Transient(TempPath),
    /// Supplied by the caller; left in place.
    Stable(PathBuf),
}

impl SegmentToken {
    /// Create a fresh token file in `dir`.
    pub fn transient(dir: &Path) -> io::Result<Self> {
        let file = tempfile::Builder::new()
            .prefix("forkfut-")
            .suffix(".token")
            .tempfile_in(dir)?;
        Ok(Self::Transient(file.into_temp_path()))
    }

    /// Use `path` as the token, creating an empty file if it does not exist.
    pub fn stable(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if !path.exists() {
            OpenOptions::new().create(true).append(true).open(&path)?;
        }
        Ok(Self::Stable(path))
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Transient(path) => path,
            Self::Stable(path) => path,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn key(&self) -> io::Result<SegmentKey> {
        SegmentKey::from_path(self.path(), SegmentKey::DEFAULT_PROJECT)
    }

    /// Take the exclusive lock that makes this process the segment's owner.
    ///
    /// Fails with [`ForkFutError::SegmentInUse`] while another orchestrator,
    /// in this process or any other, holds the lock for the same file.
    pub fn lock(&self) -> Result<TokenLock> {
        let file = File::open(self.path())?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(TokenLock(lock)),
            Err((_, Errno::EWOULDBLOCK)) => Err(ForkFutError::SegmentInUse {
                path: self.path().to_path_buf(),
            }),
            Err((_, errno)) => Err(io::Error::from(errno).into()),
        }
    }

    /// Delete the token file if it is transient.
    pub fn remove(self) -> io::Result<()> {
        match self {
            Self::Transient(path) => path.close(),
            Self::Stable(_) => Ok(()),
        }
    }
}

/// Exclusive `flock` on a token file, released on drop.
///
/// Forked workers share the locked file description. Dropping the guard
/// in the orchestrating process releases it for all of them.
#[derive(Debug)]
pub struct TokenLock(Flock<File>);
