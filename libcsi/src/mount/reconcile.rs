//! Mount reconciliation.
//!
//! [`Mounter::reconcile`] drives a path towards a healthy mount:
//!
//! ```text
//! Corrupted   -> unmount -> NotMounted
//! NotMounted  -> mount   -> Mounted
//! Mounted     -> (nothing)
//! Unknown     -> error, nothing touched
//! ```
//!
//! A failing step aborts with its error.  There are no internal retries; the
//! orchestrator retries the whole RPC and the state machine picks up from
//! whatever state the previous attempt left behind.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::CsiError;
use crate::exec::{Executor, SystemExecutor};
use crate::mount::mechanism::{MountMechanism, is_benign_unmount_error};
use crate::mount::state::{MountState, MountTableDetector, StateDetector};

/// Performs mounts, unmounts and reconciliation for both mechanisms.
#[derive(Clone)]
pub struct Mounter {
    executor: Arc<dyn Executor>,
    detector: Arc<dyn StateDetector>,
    fuse_helper: String,
}

impl Mounter {
    /// Create a mounter from explicit collaborators.
    ///
    /// * `executor`: runs `mount`, `umount` and the FUSE helper
    /// * `detector`: classifies paths before reconciling
    /// * `fuse_helper`: provider binary used by [`MountMechanism::Direct`]
    pub fn new(
        executor: Arc<dyn Executor>,
        detector: Arc<dyn StateDetector>,
        fuse_helper: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            detector,
            fuse_helper: fuse_helper.into(),
        }
    }

    /// Mounter that runs real processes and reads the kernel mount table.
    pub fn system(fuse_helper: impl Into<String>) -> Self {
        Self::new(
            Arc::new(SystemExecutor),
            Arc::new(MountTableDetector::new()),
            fuse_helper,
        )
    }

    /// Probe the mount state of `path`.
    pub async fn detect(&self, path: &Path) -> MountState {
        self.detector.detect(path).await
    }

    /// Mount `source` (bind only) at `target` using `mechanism`.
    pub async fn mount(
        &self,
        mechanism: MountMechanism,
        source: Option<&Path>,
        target: &Path,
    ) -> Result<(), CsiError> {
        let cmd = mechanism.mount_command(&self.fuse_helper, source, target)?;
        let out = self
            .executor
            .output(&cmd.program, &cmd.args)
            .await
            .map_err(|e| CsiError::mount_failed(target, format!("`{cmd}`: {e}")))?;

        if !out.success() {
            return Err(CsiError::mount_failed(
                target,
                format!("`{cmd}` failed with {}: {}", out.status_text(), out.combined()),
            ));
        }

        info!(path = %target.display(), %mechanism, "mounted");
        Ok(())
    }

    /// Unmount `target`.  Idempotent: an already clean or missing path is
    /// a success.
    pub async fn unmount(&self, mechanism: MountMechanism, target: &Path) -> Result<(), CsiError> {
        let cmd = mechanism.unmount_command(target);
        let out = self
            .executor
            .output(&cmd.program, &cmd.args)
            .await
            .map_err(|e| CsiError::unmount_failed(target, format!("`{cmd}`: {e}")))?;

        if out.success() {
            info!(path = %target.display(), %mechanism, "unmounted");
            return Ok(());
        }

        let output = out.combined();
        if is_benign_unmount_error(&output) {
            debug!(path = %target.display(), %output, "nothing to unmount");
            return Ok(());
        }

        Err(CsiError::unmount_failed(
            target,
            format!("`{cmd}` failed with {}: {output}", out.status_text()),
        ))
    }

    /// Bring `path` to a healthy mount made with `mechanism`.
    ///
    /// `source` is the bind source for [`MountMechanism::Bind`] and ignored
    /// for [`MountMechanism::Direct`].
    pub async fn reconcile(
        &self,
        path: &Path,
        mechanism: MountMechanism,
        source: Option<&Path>,
    ) -> Result<(), CsiError> {
        match self.detect(path).await {
            MountState::Mounted => {
                debug!(path = %path.display(), "already mounted");
                Ok(())
            }
            MountState::NotMounted => self.mount(mechanism, source, path).await,
            MountState::Corrupted => {
                warn!(path = %path.display(), %mechanism, "corrupted mount detected, remounting");
                self.unmount(mechanism, path).await.map_err(|e| {
                    CsiError::unmount_failed(path, format!("during mount recovery: {e}"))
                })?;
                self.mount(mechanism, source, path).await
            }
            MountState::Unknown(reason) => Err(CsiError::ProbeFailed {
                path: path.display().to_string(),
                reason,
            }),
        }
    }
}
