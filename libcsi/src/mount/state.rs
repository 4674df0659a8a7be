//! Mount state detection.
//!
//! [`MountTableDetector`] classifies a path into a [`MountState`] without
//! side effects.  The primary check asks whether the path is a mount point;
//! when that check itself fails with an I/O error, a raw `stat(2)` of the
//! path decides between a corrupted mount (`ENOTCONN`, the FUSE provider
//! exited while the kernel still holds the mount entry), an absent path, and
//! an unknown failure.

use std::ffi::OsString;
use std::fmt;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::errno::Errno;
use tracing::debug;

/// Kernel mount table of the calling process.
pub const PROC_MOUNTINFO: &str = "/proc/self/mountinfo";

/// Observed state of a mountpoint.  Computed on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountState {
    /// Nothing is mounted at the path (or the path does not exist).
    NotMounted,
    /// A healthy mount is present.
    Mounted,
    /// The mount entry exists but its provider disconnected.
    Corrupted,
    /// The probe failed for an unrecognised reason; carries the failure.
    Unknown(String),
}

impl fmt::Display for MountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotMounted => f.write_str("NOT_MOUNTED"),
            Self::Mounted => f.write_str("MOUNTED"),
            Self::Corrupted => f.write_str("CORRUPTED"),
            Self::Unknown(reason) => write!(f, "UNKNOWN ({reason})"),
        }
    }
}

/// Classifies paths into [`MountState`]s.
#[async_trait]
pub trait StateDetector: Send + Sync {
    /// Probe `path`.  Must not modify anything.
    async fn detect(&self, path: &Path) -> MountState;
}

/// Detector backed by `stat(2)` and the kernel mount table.
#[derive(Debug, Clone)]
pub struct MountTableDetector {
    mountinfo: PathBuf,
}

impl Default for MountTableDetector {
    fn default() -> Self {
        Self {
            mountinfo: PathBuf::from(PROC_MOUNTINFO),
        }
    }
}

impl MountTableDetector {
    /// Detector reading [`PROC_MOUNTINFO`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Detector reading an alternative mountinfo-formatted file.
    pub fn with_mountinfo(mountinfo: impl Into<PathBuf>) -> Self {
        Self {
            mountinfo: mountinfo.into(),
        }
    }

    /// Return whether `path` is a mount point.
    ///
    /// A device number differing from the parent's is conclusive.  Bind
    /// mounts of the same filesystem keep the device number, so otherwise
    /// the mount table is consulted.
    async fn is_mount_point(&self, path: &Path) -> std::io::Result<bool> {
        let meta = tokio::fs::metadata(path).await?;
        if let Some(parent) = path.parent() {
            let parent_meta = tokio::fs::metadata(parent).await?;
            if meta.dev() != parent_meta.dev() {
                return Ok(true);
            }
        }

        let canonical = tokio::fs::canonicalize(path).await?;
        let table = tokio::fs::read_to_string(&self.mountinfo).await?;
        Ok(mount_points(&table).any(|p| p == canonical))
    }
}

#[async_trait]
impl StateDetector for MountTableDetector {
    async fn detect(&self, path: &Path) -> MountState {
        let state = match self.is_mount_point(path).await {
            Ok(true) => MountState::Mounted,
            Ok(false) => MountState::NotMounted,
            Err(probe_err) => match nix::sys::stat::stat(path) {
                Err(errno) => state_from_errno(path, errno),
                // stat works, so the failure came from the mount table.
                Ok(_) => MountState::Unknown(format!(
                    "mount point check for {}: {probe_err}",
                    path.display()
                )),
            },
        };
        debug!(path = %path.display(), %state, "probed mount state");
        state
    }
}

/// Map a failed `stat(2)` to a mount state.
fn state_from_errno(path: &Path, errno: Errno) -> MountState {
    match errno {
        Errno::ENOTCONN => MountState::Corrupted,
        Errno::ENOENT => MountState::NotMounted,
        other => MountState::Unknown(format!("stat {}: {other}", path.display())),
    }
}

/// Iterate over the mount point column of a `/proc/<pid>/mountinfo` table.
fn mount_points(table: &str) -> impl Iterator<Item = PathBuf> + '_ {
    // Format: <id> <parent> <major:minor> <root> <mountpoint> <options> ...
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(unescape_octal)
}

/// Undo the kernel's octal escaping (`\040` for space, `\011` for tab, ...).
fn unescape_octal(field: &str) -> PathBuf {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            out.push(value as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    PathBuf::from(OsString::from_vec(out))
}
