//! Core CSI types: volume identity, capabilities, node requests and
//! plugin / node information.
//!
//! These types form the data model shared by the CSI traits, the transport
//! layer and the FUSE backend.  They are all [`Serialize`]/[`Deserialize`] so
//! they can be transmitted over the plugin socket as JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Opaque, orchestrator-assigned identifier for a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeId(pub String);

impl VolumeId {
    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `true` when the orchestrator sent no identifier at all.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed, mirroring the CSI access modes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    /// Single-node read-write.
    SingleNodeWriter,
    /// Single-node read-only.
    SingleNodeReaderOnly,
    /// Multi-node read-only.  The only mode this plugin serves.
    MultiNodeReaderOnly,
    /// Multi-node, one writer.
    MultiNodeSingleWriter,
    /// Multi-node read-write.
    MultiNodeMultiWriter,
}

/// How the volume is presented to the workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessType {
    /// Mounted filesystem.
    Mount {
        /// Requested filesystem type; empty means "driver default".
        #[serde(default)]
        fs_type: String,
        /// Additional mount flags (e.g. `"noatime"`).
        #[serde(default)]
        mount_flags: Vec<String>,
    },
    /// Raw block device.  Never supported here.
    Block,
}

/// Describes the capabilities required from a volume.
///
/// Both halves are optional on the wire so that an incomplete request can be
/// rejected with a precise message instead of a decoding failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCapability {
    /// Requested access type.
    #[serde(default)]
    pub access_type: Option<AccessType>,
    /// Requested access mode.
    #[serde(default)]
    pub access_mode: Option<AccessMode>,
}

impl VolumeCapability {
    /// Filesystem capability with the given access mode.
    pub fn mount(mode: AccessMode) -> Self {
        Self {
            access_type: Some(AccessType::Mount {
                fs_type: String::new(),
                mount_flags: Vec::new(),
            }),
            access_mode: Some(mode),
        }
    }

    /// Block capability with the given access mode.
    pub fn block(mode: AccessMode) -> Self {
        Self {
            access_type: Some(AccessType::Block),
            access_mode: Some(mode),
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Request to stage (FUSE-mount) a volume at the node-global staging path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    /// Volume to stage.
    pub volume_id: VolumeId,
    /// Global staging mount point,
    /// e.g. `/var/lib/kubelet/plugins/kubernetes.io/csi/<driver>/<hash>/globalmount`.
    pub staging_target_path: String,
    /// Requested capability.
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    /// Opaque volume context (storage class / PV attributes).
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Request to publish (bind-mount) a staged volume into a Pod.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    /// Volume to publish.
    pub volume_id: VolumeId,
    /// The global staging mount point (source of the bind mount).
    pub staging_target_path: String,
    /// Workload-visible path,
    /// e.g. `/var/lib/kubelet/pods/<pod-uid>/volumes/kubernetes.io~csi/<pv>/mount`.
    pub target_path: String,
    /// Requested capability.
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    /// Opaque volume context (storage class / PV attributes).
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginInfo {
    /// Plugin name, e.g. `"fuse.csi.rk8s.io"`.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Capabilities advertised by the Identity service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
}

/// Capabilities advertised by the Node service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeCapability {
    /// Node implements `NodeStageVolume` / `NodeUnstageVolume`.
    StageUnstageVolume,
}

/// Information about the node on which the CSI Node service runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    /// Unique node identifier.
    pub node_id: String,
    /// Maximum number of volumes the node can host; `0` means unlimited.
    pub max_volumes: u64,
}
