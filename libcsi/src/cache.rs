//! Crash-persistent mount cache.
//!
//! Every successful stage / publish leaves a small JSON record under the
//! configured cache root, which is expected to live on storage that outlives
//! the plugin process (a hostPath directory).  After a restart the records
//! tell [`MountCache::recover`] which mounts to re-establish.
//!
//! # On-disk layout
//!
//! ```text
//! <cache_root>/
//!   staged/<volume-id>      # {"stagingPath": "..."}
//!   published/<volume-id>   # {"stagingPath": "...", "targetPath": "..."}
//! ```
//!
//! Records are only written or removed by the node RPC handlers while they
//! hold the volume's admission guard, and only read during startup before
//! the server accepts connections, so no additional locking is needed.
//!
//! Failing to write or remove a record never fails the RPC that triggered
//! it: the mount itself succeeded and only future crash recovery degrades.
//! With no cache root configured the whole cache is a no-op.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::CsiError;
use crate::mount::{MountMechanism, Mounter};
use crate::types::VolumeId;

/// Sub-directory holding stage-scope records.
pub const STAGED_DIR: &str = "staged";
/// Sub-directory holding publish-scope records.
pub const PUBLISHED_DIR: &str = "published";

/// Which RPC a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheScope {
    /// Written by `NodeStageVolume`, removed by `NodeUnstageVolume`.
    Staged,
    /// Written by `NodePublishVolume`, removed by `NodeUnpublishVolume`.
    Published,
}

impl CacheScope {
    fn dir_name(self) -> &'static str {
        match self {
            Self::Staged => STAGED_DIR,
            Self::Published => PUBLISHED_DIR,
        }
    }
}

/// Persisted record of one active mount.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Where the FUSE provider is mounted.
    pub staging_path: String,
    /// Where the staging path is bind-mounted; absent for stage-only records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_path: Option<String>,
}

/// Counters returned by [`MountCache::recover`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Records successfully remounted.
    pub remounted: usize,
    /// Records whose remount failed.
    pub failed: usize,
}

/// Mount records kept under an optional cache root.
#[derive(Debug, Clone, Default)]
pub struct MountCache {
    root: Option<PathBuf>,
}

impl MountCache {
    /// Cache rooted at `root`; `None` disables persistence entirely.
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    /// Cache that persists nothing.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// `true` when a cache root is configured.
    pub fn is_enabled(&self) -> bool {
        self.root.is_some()
    }

    fn scope_dir(&self, scope: CacheScope) -> Option<PathBuf> {
        self.root.as_ref().map(|r| r.join(scope.dir_name()))
    }

    fn entry_path(&self, scope: CacheScope, volume_id: &VolumeId) -> Option<PathBuf> {
        self.scope_dir(scope)
            .map(|dir| dir.join(encode_file_name(volume_id.as_str())))
    }

    /// Remember a successful stage of `volume_id` at `staging_path`.
    pub async fn record_stage(&self, volume_id: &VolumeId, staging_path: &str) {
        let entry = CacheEntry {
            staging_path: staging_path.to_owned(),
            target_path: None,
        };
        self.record(CacheScope::Staged, volume_id, &entry).await;
    }

    /// Remember a successful publish of `volume_id` into `target_path`.
    pub async fn record_publish(&self, volume_id: &VolumeId, staging_path: &str, target_path: &str) {
        let entry = CacheEntry {
            staging_path: staging_path.to_owned(),
            target_path: Some(target_path.to_owned()),
        };
        self.record(CacheScope::Published, volume_id, &entry).await;
    }

    /// Drop the stage-scope record of `volume_id`.
    pub async fn forget_stage(&self, volume_id: &VolumeId) {
        self.forget(CacheScope::Staged, volume_id).await;
    }

    /// Drop the publish-scope record of `volume_id`.
    pub async fn forget_publish(&self, volume_id: &VolumeId) {
        self.forget(CacheScope::Published, volume_id).await;
    }

    async fn record(&self, scope: CacheScope, volume_id: &VolumeId, entry: &CacheEntry) {
        let Some(path) = self.entry_path(scope, volume_id) else {
            return;
        };
        match write_entry(&path, entry).await {
            Ok(()) => debug!(%volume_id, path = %path.display(), "saved mount cache entry"),
            Err(e) => warn!(%volume_id, path = %path.display(), error = %e,
                "failed to save mount cache entry"),
        }
    }

    async fn forget(&self, scope: CacheScope, volume_id: &VolumeId) {
        let Some(path) = self.entry_path(scope, volume_id) else {
            return;
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(%volume_id, path = %path.display(), "forgot mount cache entry"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(%volume_id, path = %path.display(), error = %e,
                "failed to remove mount cache entry"),
        }
    }

    /// Read a single record.
    pub async fn get(
        &self,
        scope: CacheScope,
        volume_id: &VolumeId,
    ) -> Result<Option<CacheEntry>, CsiError> {
        let Some(path) = self.entry_path(scope, volume_id) else {
            return Ok(None);
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| CsiError::Internal(format!("parse {}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CsiError::Internal(format!("read {}: {e}", path.display()))),
        }
    }

    /// List all records of `scope`, sorted by volume id.
    ///
    /// Unreadable or unparsable records are skipped with a warning.
    pub async fn entries(&self, scope: CacheScope) -> Result<Vec<(VolumeId, CacheEntry)>, CsiError> {
        let Some(dir) = self.scope_dir(scope) else {
            return Ok(Vec::new());
        };

        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(d) => d,
            // Nothing cached yet.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CsiError::Internal(format!(
                    "read_dir {}: {e}",
                    dir.display()
                )));
            }
        };

        let mut entries = Vec::new();
        while let Some(item) = read_dir.next_entry().await.map_err(CsiError::internal)? {
            let path = item.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            // In-flight temporary files.
            if file_name.starts_with('.') {
                continue;
            }
            let Some(volume_id) = decode_file_name(file_name) else {
                warn!(path = %path.display(), "unrecognised mount cache file name, skipping");
                continue;
            };

            let entry: CacheEntry = match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "failed to parse mount cache entry, skipping");
                        continue;
                    }
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read mount cache entry, skipping");
                    continue;
                }
            };
            entries.push((VolumeId(volume_id), entry));
        }

        entries.sort_by(|a, b| a.0.0.cmp(&b.0.0));
        Ok(entries)
    }

    /// Best-effort remount of every recorded mount.
    ///
    /// Staged records are handled before published ones so that bind
    /// sources exist again.  Each record is unmounted and then mounted with
    /// its mechanism; failures are logged and counted, never returned.  A
    /// record that fails stays on disk and is repaired lazily by the next
    /// matching RPC.
    pub async fn recover(&self, mounter: &Mounter) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        if !self.is_enabled() {
            return report;
        }

        for scope in [CacheScope::Staged, CacheScope::Published] {
            let entries = match self.entries(scope).await {
                Ok(e) => e,
                Err(e) => {
                    warn!(?scope, error = %e, "failed to list mount cache");
                    continue;
                }
            };
            if entries.is_empty() {
                debug!(?scope, "no mount cache entries");
            }

            for (volume_id, entry) in entries {
                match remount(mounter, scope, &entry).await {
                    Ok(()) => {
                        report.remounted += 1;
                        info!(%volume_id, ?scope, "remounted from cache");
                    }
                    Err(e) => {
                        report.failed += 1;
                        warn!(%volume_id, ?scope, error = %e, "failed to remount from cache");
                    }
                }
            }
        }

        info!(
            remounted = report.remounted,
            failed = report.failed,
            "mount cache recovery complete",
        );
        report
    }
}

async fn remount(mounter: &Mounter, scope: CacheScope, entry: &CacheEntry) -> Result<(), CsiError> {
    let staging = Path::new(&entry.staging_path);
    match scope {
        CacheScope::Staged => {
            mounter.unmount(MountMechanism::Direct, staging).await?;
            mounter.mount(MountMechanism::Direct, None, staging).await
        }
        CacheScope::Published => {
            let target = entry.target_path.as_deref().ok_or_else(|| {
                CsiError::Internal(format!(
                    "published record for {} has no target path",
                    entry.staging_path
                ))
            })?;
            let target = Path::new(target);
            mounter.unmount(MountMechanism::Bind, target).await?;
            mounter
                .mount(MountMechanism::Bind, Some(staging), target)
                .await
        }
    }
}

/// Write `entry` to a hidden temporary file next to `path` and rename it
/// into place, so a crash never leaves a half-written record.
async fn write_entry(path: &Path, entry: &CacheEntry) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    tokio::fs::create_dir_all(dir).await?;

    let json = serde_json::to_vec(entry)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{file_name}.tmp"));
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Map a volume id to a single, non-hidden file name.
fn encode_file_name(volume_id: &str) -> String {
    let mut out = String::with_capacity(volume_id.len());
    for (i, c) in volume_id.chars().enumerate() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            '.' if i == 0 => out.push_str("%2E"),
            c => out.push(c),
        }
    }
    out
}

/// Inverse of [`encode_file_name`].
fn decode_file_name(name: &str) -> Option<String> {
    let mut out = String::with_capacity(name.len());
    let mut rest = name;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let escape = rest.get(pos + 1..pos + 3)?;
        out.push(match escape {
            "25" => '%',
            "2F" => '/',
            "2E" => '.',
            _ => return None,
        });
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    Some(out)
}
