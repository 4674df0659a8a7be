//! CSI Node service trait.
//!
//! The Node service runs on each worker node and handles the local filesystem
//! operations required to make a volume available to Pod containers:
//!
//! 1. **Stage**: FUSE-mount the volume at a global staging path.
//! 2. **Publish**: bind-mount the staging path into the Pod's target path.
//! 3. **Unpublish**: remove the bind-mount and its mountpoint directory.
//! 4. **Unstage**: unmount the FUSE mount.
//!
//! All four are idempotent and may be retried by the orchestrator at any
//! time; mutating calls for the same volume never run concurrently.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    NodeCapability, NodeInfo, NodePublishVolumeRequest, NodeStageVolumeRequest, VolumeId,
};

/// Node service: local mount / unmount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume: FUSE-mount the backing provider at the staging path.
    ///
    /// Calling it again for an already-staged volume succeeds without
    /// mounting anything; a corrupted staging mount is repaired.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unstage a volume: unmount the FUSE filesystem from the staging path.
    ///
    /// Succeeds when the path is already unmounted or no longer exists.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Publish a volume: bind-mount the staging path into the target path.
    ///
    /// Calling it again for the same `target_path` succeeds without error.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume: unmount the bind-mount and remove the mountpoint.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    /// Report usage statistics for a published volume.
    ///
    /// Unsupported by default; there is no statistics payload to return.
    async fn get_volume_stats(
        &self,
        _volume_id: &VolumeId,
        _volume_path: &str,
    ) -> Result<(), CsiError> {
        Err(CsiError::Unimplemented("NodeGetVolumeStats".to_owned()))
    }

    /// Grow a published volume online.  Unsupported by default.
    async fn expand_volume(
        &self,
        _volume_id: &VolumeId,
        _volume_path: &str,
        _required_bytes: u64,
    ) -> Result<(), CsiError> {
        Err(CsiError::Unimplemented("NodeExpandVolume".to_owned()))
    }

    /// Advertise the optional node RPCs this plugin implements.
    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;
}
