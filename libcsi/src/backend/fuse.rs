//! FUSE-backed CSI node plugin.
//!
//! [`FuseBackend`] implements [`CsiIdentity`] and [`CsiNode`].  Staging
//! starts the FUSE provider directly on the staging path; publishing
//! bind-mounts the staging path into the workload's target path.
//!
//! Every mutating RPC runs as: validate, admit the volume, reconcile or
//! unmount, then update the mount cache.
//!
//! # On-disk layout
//!
//! ```text
//! <staging_target_path>   # FUSE mount made by the provider
//! <target_path>           # rbind of the staging path, created 0750 on demand
//! <mount_cache_root>/
//!   staged/<volume-id>      # {"stagingPath": ...}
//!   published/<volume-id>   # {"stagingPath": ..., "targetPath": ...}
//! ```

use std::io::ErrorKind;
use std::path::Path;

use async_trait::async_trait;
use tokio::fs::DirBuilder;
use tracing::{debug, info, instrument};

use crate::admission::PendingVolumes;
use crate::cache::{MountCache, RecoveryReport};
use crate::driver::{DriverOpts, ServiceRole};
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::mount::{MountMechanism, Mounter};
use crate::node::CsiNode;
use crate::types::*;
use crate::validate;

/// Permissions of target directories created by publish.
const MOUNTPOINT_MODE: u32 = 0o750;

/// Node plugin serving FUSE volumes.
///
/// # Thread safety
///
/// Calls for different volumes run concurrently; a second mutating call for
/// a volume already in flight fails fast with [`CsiError::VolumeBusy`].
pub struct FuseBackend {
    /// Name reported through `GetPluginInfo`.
    driver_name: String,
    /// Node identifier reported through `NodeGetInfo`.
    node_id: String,
    /// Whether the controller role is enabled and advertised.
    has_controller: bool,
    mounter: Mounter,
    cache: MountCache,
    pending: PendingVolumes,
}

impl FuseBackend {
    /// Create a backend from validated options.
    ///
    /// Call [`Self::recover`] afterwards to remount volumes recorded by a
    /// previous process run.
    pub fn new(opts: &DriverOpts, mounter: Mounter) -> Self {
        Self {
            driver_name: opts.driver_name.clone(),
            node_id: opts.node_id.clone(),
            has_controller: opts.roles.contains(&ServiceRole::Controller),
            mounter,
            cache: MountCache::new(opts.mount_cache_root.clone()),
            pending: PendingVolumes::new(),
        }
    }

    /// Remount everything recorded in the mount cache.
    pub async fn recover(&self) -> RecoveryReport {
        self.cache.recover(&self.mounter).await
    }

    /// The mount cache this backend writes to.
    pub fn cache(&self) -> &MountCache {
        &self.cache
    }

    /// Volumes with a mutating call in flight.
    pub fn pending(&self) -> &PendingVolumes {
        &self.pending
    }
}

/// Create `path` (and parents) when it does not exist yet.
async fn make_mountpoint(path: &Path) -> Result<(), CsiError> {
    match tokio::fs::metadata(path).await {
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "creating mountpoint");
            let created = DirBuilder::new()
                .recursive(true)
                .mode(MOUNTPOINT_MODE)
                .create(path)
                .await;
            match created {
                Err(e) if e.kind() != ErrorKind::AlreadyExists => Err(CsiError::mount_failed(
                    path,
                    format!("create mountpoint: {e}"),
                )),
                _ => Ok(()),
            }
        }
        _ => Ok(()),
    }
}

/// Remove the (now empty) mountpoint left behind by an unmount.
async fn remove_mountpoint(path: &Path) -> Result<(), CsiError> {
    match tokio::fs::remove_dir(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CsiError::unmount_failed(
            path,
            format!("remove mountpoint: {e}"),
        )),
    }
}

// ---------------------------------------------------------------------------
// CsiIdentity
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiIdentity for FuseBackend {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: self.driver_name.clone(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        Ok(true)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        if self.has_controller {
            Ok(vec![PluginCapability::ControllerService])
        } else {
            Ok(Vec::new())
        }
    }
}

// ---------------------------------------------------------------------------
// CsiNode
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiNode for FuseBackend {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        validate::stage_request(&req)?;
        let _guard = self.pending.acquire(&req.volume_id)?;

        let staging = Path::new(&req.staging_target_path);
        self.mounter
            .reconcile(staging, MountMechanism::Direct, None)
            .await?;
        self.cache
            .record_stage(&req.volume_id, &req.staging_target_path)
            .await;

        info!(path = %req.staging_target_path, "volume staged");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        validate::unstage_request(volume_id, staging_target_path)?;
        let _guard = self.pending.acquire(volume_id)?;

        self.mounter
            .unmount(MountMechanism::Direct, Path::new(staging_target_path))
            .await?;
        self.cache.forget_stage(volume_id).await;

        info!(%volume_id, path = staging_target_path, "volume unstaged");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        validate::publish_request(&req)?;
        let _guard = self.pending.acquire(&req.volume_id)?;

        let staging = Path::new(&req.staging_target_path);
        let target = Path::new(&req.target_path);

        // A dead FUSE provider under the staging path is repaired here too,
        // otherwise the bind below would expose a broken mount.
        self.mounter
            .reconcile(staging, MountMechanism::Direct, None)
            .await?;
        make_mountpoint(target).await?;
        self.mounter
            .reconcile(target, MountMechanism::Bind, Some(staging))
            .await?;
        self.cache
            .record_publish(&req.volume_id, &req.staging_target_path, &req.target_path)
            .await;

        info!(
            staging = %req.staging_target_path,
            target = %req.target_path,
            "volume published"
        );
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        validate::unpublish_request(volume_id, target_path)?;
        let _guard = self.pending.acquire(volume_id)?;

        let target = Path::new(target_path);
        self.mounter.unmount(MountMechanism::Bind, target).await?;
        remove_mountpoint(target).await?;
        self.cache.forget_publish(volume_id).await;

        info!(%volume_id, %target_path, "volume unpublished");
        Ok(())
    }

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(vec![NodeCapability::StageUnstageVolume])
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: self.node_id.clone(),
            max_volumes: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::sync::Arc;

    use super::*;
    use crate::cache::CacheScope;
    use crate::exec::ExecOutput;
    use crate::mount::MountState;
    use crate::mount::fake::FakeSystem;

    struct Harness {
        _tmp: tempfile::TempDir,
        fake: Arc<FakeSystem>,
        backend: FuseBackend,
        staging: PathBuf,
        target: PathBuf,
    }

    fn harness_with(roles: &[ServiceRole]) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeSystem::default());
        let opts = DriverOpts {
            node_id: "test-node".into(),
            mount_cache_root: Some(tmp.path().join("cache")),
            roles: roles.iter().copied().collect(),
            ..Default::default()
        };
        let mounter = Mounter::new(fake.clone(), fake.clone(), "dummy-fuse");
        let backend = FuseBackend::new(&opts, mounter);
        let staging = tmp.path().join("globalmount");
        let target = tmp.path().join("pods/uid/volumes/mount");
        Harness {
            _tmp: tmp,
            fake,
            backend,
            staging,
            target,
        }
    }

    fn harness() -> Harness {
        harness_with(&[ServiceRole::Identity, ServiceRole::Node])
    }

    fn stage_req(h: &Harness) -> NodeStageVolumeRequest {
        NodeStageVolumeRequest {
            volume_id: "vol-1".into(),
            staging_target_path: h.staging.display().to_string(),
            volume_capability: Some(VolumeCapability::mount(AccessMode::MultiNodeReaderOnly)),
            ..Default::default()
        }
    }

    fn publish_req(h: &Harness) -> NodePublishVolumeRequest {
        NodePublishVolumeRequest {
            volume_id: "vol-1".into(),
            staging_target_path: h.staging.display().to_string(),
            target_path: h.target.display().to_string(),
            volume_capability: Some(VolumeCapability::mount(AccessMode::MultiNodeReaderOnly)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn identity_reports_name_and_roles() {
        let h = harness();
        let info = h.backend.get_plugin_info().await.unwrap();
        assert_eq!(info.name, crate::driver::DEFAULT_DRIVER_NAME);
        assert!(!info.vendor_version.is_empty());
        assert!(h.backend.probe().await.unwrap());
        assert!(h.backend.get_plugin_capabilities().await.unwrap().is_empty());

        let h = harness_with(&[ServiceRole::Identity, ServiceRole::Controller]);
        assert_eq!(
            h.backend.get_plugin_capabilities().await.unwrap(),
            vec![PluginCapability::ControllerService]
        );
    }

    #[tokio::test]
    async fn node_info_and_capabilities() {
        let h = harness();
        let info = h.backend.get_info().await.unwrap();
        assert_eq!(info.node_id, "test-node");
        assert_eq!(info.max_volumes, 0);
        assert_eq!(
            h.backend.get_capabilities().await.unwrap(),
            vec![NodeCapability::StageUnstageVolume]
        );
    }

    #[tokio::test]
    async fn stats_and_expand_are_unimplemented() {
        let h = harness();
        let id = VolumeId::from("vol-1");
        let err = h.backend.get_volume_stats(&id, "/x").await.unwrap_err();
        assert!(matches!(err, CsiError::Unimplemented(_)));
        let err = h.backend.expand_volume(&id, "/x", 1).await.unwrap_err();
        assert!(matches!(err, CsiError::Unimplemented(_)));
    }

    #[tokio::test]
    async fn stage_is_idempotent() {
        let h = harness();
        h.backend.stage_volume(stage_req(&h)).await.unwrap();
        h.backend.stage_volume(stage_req(&h)).await.unwrap();

        assert_eq!(h.fake.count("dummy-fuse"), 1);
        assert_eq!(h.fake.state(&h.staging), MountState::Mounted);

        let entry = h
            .backend
            .cache()
            .get(CacheScope::Staged, &"vol-1".into())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.staging_path, h.staging.display().to_string());
    }

    #[tokio::test]
    async fn stage_repairs_corrupted_mount() {
        let h = harness();
        h.fake.set_state(&h.staging, MountState::Corrupted);
        h.backend.stage_volume(stage_req(&h)).await.unwrap();

        let staging = h.staging.display().to_string();
        assert_eq!(
            h.fake.calls(),
            vec![
                format!("umount {staging}"),
                format!("dummy-fuse {staging}"),
            ]
        );
        assert_eq!(h.fake.state(&h.staging), MountState::Mounted);
    }

    #[tokio::test]
    async fn stage_unknown_state_fails_without_mounting() {
        let h = harness();
        h.fake
            .set_state(&h.staging, MountState::Unknown("EACCES".into()));
        let err = h.backend.stage_volume(stage_req(&h)).await.unwrap_err();
        assert!(matches!(err, CsiError::ProbeFailed { .. }));
        assert!(h.fake.calls().is_empty());
        assert!(!h.backend.pending().is_pending(&"vol-1".into()));
    }

    #[tokio::test]
    async fn block_capability_is_rejected_before_any_mount() {
        let h = harness();
        let mut req = stage_req(&h);
        req.volume_capability = Some(VolumeCapability::block(AccessMode::MultiNodeReaderOnly));
        let err = h.backend.stage_volume(req).await.unwrap_err();
        assert!(matches!(err, CsiError::InvalidArgument(_)));

        let mut req = publish_req(&h);
        req.volume_capability = Some(VolumeCapability::block(AccessMode::MultiNodeReaderOnly));
        assert!(h.backend.publish_volume(req).await.is_err());

        assert!(h.fake.calls().is_empty());
        assert!(!h.target.exists());
    }

    #[tokio::test]
    async fn busy_volume_fails_fast() {
        let h = harness();
        let id = VolumeId::from("vol-1");
        let guard = h.backend.pending().acquire(&id).unwrap();

        let err = h.backend.stage_volume(stage_req(&h)).await.unwrap_err();
        assert!(matches!(err, CsiError::VolumeBusy(_)));
        assert!(err.is_retryable());
        let err = h
            .backend
            .unpublish_volume(&id, &h.target.display().to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::VolumeBusy(_)));
        assert!(h.fake.calls().is_empty());

        drop(guard);
        h.backend.stage_volume(stage_req(&h)).await.unwrap();
    }

    #[tokio::test]
    async fn full_lifecycle() {
        let h = harness();
        let id = VolumeId::from("vol-1");
        let staging = h.staging.display().to_string();
        let target = h.target.display().to_string();

        h.backend.stage_volume(stage_req(&h)).await.unwrap();
        h.backend.publish_volume(publish_req(&h)).await.unwrap();

        assert_eq!(h.fake.state(&h.target), MountState::Mounted);
        let mode = std::fs::metadata(&h.target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, MOUNTPOINT_MODE);
        assert_eq!(
            h.fake.calls().last().unwrap(),
            &format!("mount --rbind --make-slave {staging} {target}")
        );
        let entry = h
            .backend
            .cache()
            .get(CacheScope::Published, &id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.target_path.as_deref(), Some(target.as_str()));

        // Second publish is a no-op.
        let calls = h.fake.calls().len();
        h.backend.publish_volume(publish_req(&h)).await.unwrap();
        assert_eq!(h.fake.calls().len(), calls);

        h.backend.unpublish_volume(&id, &target).await.unwrap();
        assert!(!h.target.exists());
        assert_eq!(h.fake.state(&h.target), MountState::NotMounted);
        assert!(
            h.backend
                .cache()
                .get(CacheScope::Published, &id)
                .await
                .unwrap()
                .is_none()
        );

        h.backend.unstage_volume(&id, &staging).await.unwrap();
        assert_eq!(h.fake.state(&h.staging), MountState::NotMounted);
        assert!(
            h.backend
                .cache()
                .get(CacheScope::Staged, &id)
                .await
                .unwrap()
                .is_none()
        );
        assert!(h.backend.pending().is_empty());
    }

    #[tokio::test]
    async fn unmount_paths_are_idempotent() {
        let h = harness();
        let id = VolumeId::from("vol-1");

        // Nothing mounted, nothing on disk: both succeed twice.
        for _ in 0..2 {
            h.backend
                .unpublish_volume(&id, &h.target.display().to_string())
                .await
                .unwrap();
            h.backend
                .unstage_volume(&id, &h.staging.display().to_string())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn publish_repairs_dead_staging_mount() {
        let h = harness();
        h.fake.set_state(&h.staging, MountState::Corrupted);
        h.backend.publish_volume(publish_req(&h)).await.unwrap();

        assert_eq!(h.fake.state(&h.staging), MountState::Mounted);
        assert_eq!(h.fake.state(&h.target), MountState::Mounted);
        assert_eq!(h.fake.count("dummy-fuse"), 1);
    }

    #[tokio::test]
    async fn failed_mount_is_not_cached() {
        let h = harness();
        h.fake
            .script("dummy-fuse", ExecOutput::failed(1, "fuse: device not found"));
        let err = h.backend.stage_volume(stage_req(&h)).await.unwrap_err();
        assert!(matches!(err, CsiError::MountFailed { .. }));
        assert!(err.to_string().contains("device not found"));
        assert!(
            h.backend
                .cache()
                .get(CacheScope::Staged, &"vol-1".into())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn recovery_remounts_cached_volumes() {
        let h = harness();
        h.backend.stage_volume(stage_req(&h)).await.unwrap();
        h.backend.publish_volume(publish_req(&h)).await.unwrap();

        // Simulate a restart that left both mounts dead.
        h.fake.set_state(&h.staging, MountState::Corrupted);
        h.fake.set_state(&h.target, MountState::Corrupted);

        let report = h.backend.recover().await;
        assert_eq!(report.remounted, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(h.fake.state(&h.staging), MountState::Mounted);
        assert_eq!(h.fake.state(&h.target), MountState::Mounted);
    }
}
