//! Per-volume admission control.
//!
//! At most one mutating node RPC may operate on a given volume at a time.
//! A call that finds its volume busy fails fast with
//! [`CsiError::VolumeBusy`] instead of queueing; the orchestrator retries
//! later, as the CSI contract expects.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::error::CsiError;
use crate::types::VolumeId;

/// Set of volumes with a mutating call in flight.
#[derive(Debug, Default)]
pub struct PendingVolumes {
    inflight: DashMap<VolumeId, ()>,
}

impl PendingVolumes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically mark `volume_id` as in flight.
    ///
    /// The returned guard releases the volume when dropped, whichever way
    /// the caller exits (return, `?`, panic or a dropped future).
    pub fn acquire(&self, volume_id: &VolumeId) -> Result<VolumeGuard<'_>, CsiError> {
        match self.inflight.entry(volume_id.clone()) {
            Entry::Occupied(_) => {
                debug!(%volume_id, "volume busy, rejecting call");
                Err(CsiError::VolumeBusy(volume_id.to_string()))
            }
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(VolumeGuard {
                    pending: self,
                    volume_id: volume_id.clone(),
                })
            }
        }
    }

    /// `true` while a guard for `volume_id` is alive.
    pub fn is_pending(&self, volume_id: &VolumeId) -> bool {
        self.inflight.contains_key(volume_id)
    }

    /// Number of volumes currently in flight.
    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }

    fn release(&self, volume_id: &VolumeId) {
        self.inflight.remove(volume_id);
    }
}

/// Scoped hold on one volume; see [`PendingVolumes::acquire`].
#[derive(Debug)]
#[must_use = "the volume is released as soon as the guard is dropped"]
pub struct VolumeGuard<'a> {
    pending: &'a PendingVolumes,
    volume_id: VolumeId,
}

impl VolumeGuard<'_> {
    pub fn volume_id(&self) -> &VolumeId {
        &self.volume_id
    }
}

impl Drop for VolumeGuard<'_> {
    fn drop(&mut self) {
        self.pending.release(&self.volume_id);
    }
}
