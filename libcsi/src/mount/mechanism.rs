//! Mount mechanisms.
//!
//! Two ways of putting a volume at a path share one `mount` / `unmount`
//! contract:
//!
//! * [`MountMechanism::Direct`] starts the FUSE provider on the staging path.
//! * [`MountMechanism::Bind`] recursively bind-mounts the staging path into a
//!   workload's publish path with slave propagation: mount events flow from
//!   the shared staging root into the bind mount, never back.  Unmounting one
//!   Pod's publish path therefore cannot tear down mounts other Pods on the
//!   node still use through the same staging root.
//!
//! Unmounting is idempotent for both: `umount` has no dedicated exit codes
//! for "already clean", so its output is matched against known benign
//! messages.

use std::fmt;
use std::path::Path;

use crate::error::CsiError;

/// Program used for bind mounts.
pub const MOUNT_PROGRAM: &str = "mount";
/// Program used for all unmounts.
pub const UMOUNT_PROGRAM: &str = "umount";

/// Lower-cased fragments of `umount` output meaning "nothing to do".
const BENIGN_UNMOUNT_ERRORS: [&str; 3] = [
    "not mounted",
    "no such file or directory",
    // The path exists but is not a mount point.
    "invalid argument",
];

/// How a path gets mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MountMechanism {
    /// Start the FUSE provider at the target; there is no source.
    Direct,
    /// Recursive, slave-propagating bind mount from a staging path.
    Bind,
}

/// A fully resolved program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    /// Program to execute, looked up in `PATH` when not absolute.
    pub program: String,
    /// Arguments, not including the program itself.
    pub args: Vec<String>,
}

impl CommandLine {
    fn new(program: &str, args: impl IntoIterator<Item = String>) -> Self {
        Self {
            program: program.to_owned(),
            args: args.into_iter().collect(),
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

impl MountMechanism {
    /// Short lowercase name for log fields.
    pub fn name(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Bind => "bind",
        }
    }

    /// Build the command that mounts `source` (if any) at `target`.
    ///
    /// `fuse_helper` is the provider binary started by [`Self::Direct`]; it
    /// takes the mountpoint as its only argument.  [`Self::Bind`] requires a
    /// source.
    pub fn mount_command(
        self,
        fuse_helper: &str,
        source: Option<&Path>,
        target: &Path,
    ) -> Result<CommandLine, CsiError> {
        let target = target.display().to_string();
        match self {
            Self::Direct => Ok(CommandLine::new(fuse_helper, [target])),
            Self::Bind => {
                let source = source.ok_or_else(|| {
                    CsiError::Internal(format!("bind mount into {target} without a source"))
                })?;
                Ok(CommandLine::new(
                    MOUNT_PROGRAM,
                    [
                        "--rbind".to_owned(),
                        "--make-slave".to_owned(),
                        source.display().to_string(),
                        target,
                    ],
                ))
            }
        }
    }

    /// Build the command that unmounts `target`.
    ///
    /// Bind mounts are removed recursively: FUSE mounts nested under the
    /// staging root are live inside the bind mount, and unmounting only the
    /// top would fail with `EBUSY`.
    pub fn unmount_command(self, target: &Path) -> CommandLine {
        let target = target.display().to_string();
        match self {
            Self::Direct => CommandLine::new(UMOUNT_PROGRAM, [target]),
            Self::Bind => CommandLine::new(UMOUNT_PROGRAM, ["--recursive".to_owned(), target]),
        }
    }
}

impl fmt::Display for MountMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether a failed unmount's output means the path was already clean.
pub fn is_benign_unmount_error(output: &str) -> bool {
    let output = output.to_lowercase();
    BENIGN_UNMOUNT_ERRORS
        .iter()
        .any(|pattern| output.contains(pattern))
}
