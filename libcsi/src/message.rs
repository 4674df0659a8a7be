//! CSI protocol messages transmitted over the plugin socket.
//!
//! [`CsiMessage`] is the top-level envelope for all request and response
//! variants exchanged between the orchestrator-side client and the node
//! plugin server.

use serde::{Deserialize, Serialize};

use crate::error::CsiError;
use crate::types::*;

/// Top-level message envelope for CSI over a unix socket.
///
/// Each connection carries exactly one request followed by one response.
/// The client sends a *request* variant and the server replies with the
/// corresponding *response* variant (or [`CsiMessage::Error`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CsiMessage {
    // ----- Requests --------------------------------------------------------
    /// Health probe (Identity).
    Probe,
    /// Query plugin info (Identity).
    GetPluginInfo,
    /// Query plugin capabilities (Identity).
    GetPluginCapabilities,

    /// Stage (FUSE-mount) a volume at a global path (Node).
    StageVolume(NodeStageVolumeRequest),
    /// Unstage a previously staged volume (Node).
    UnstageVolume {
        volume_id: VolumeId,
        staging_target_path: String,
    },
    /// Publish (bind-mount) a staged volume into a Pod (Node).
    PublishVolume(NodePublishVolumeRequest),
    /// Unpublish a previously published volume (Node).
    UnpublishVolume {
        volume_id: VolumeId,
        target_path: String,
    },
    /// Query volume usage statistics (Node, unsupported).
    GetVolumeStats {
        volume_id: VolumeId,
        volume_path: String,
    },
    /// Grow a published volume (Node, unsupported).
    ExpandVolume {
        volume_id: VolumeId,
        volume_path: String,
        required_bytes: u64,
    },
    /// Query node capabilities (Node).
    GetNodeCapabilities,
    /// Query node info (Node).
    GetNodeInfo,

    // ----- Responses -------------------------------------------------------
    /// Plugin information.
    PluginInfoResponse(PluginInfo),
    /// Plugin capabilities.
    PluginCapabilitiesResponse(Vec<PluginCapability>),
    /// Node capabilities.
    NodeCapabilitiesResponse(Vec<NodeCapability>),
    /// Node information.
    NodeInfoResponse(NodeInfo),

    /// Generic success acknowledgement (no payload).
    Ok,
    /// Probe result.
    ProbeResult(bool),
    /// An error occurred.
    Error(CsiError),
}

impl std::fmt::Display for CsiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Probe => f.write_str("Probe"),
            Self::GetPluginInfo => f.write_str("GetPluginInfo"),
            Self::GetPluginCapabilities => f.write_str("GetPluginCapabilities"),
            Self::StageVolume(req) => write!(f, "StageVolume({})", req.volume_id),
            Self::UnstageVolume { volume_id, .. } => write!(f, "UnstageVolume({})", volume_id),
            Self::PublishVolume(req) => write!(f, "PublishVolume({})", req.volume_id),
            Self::UnpublishVolume { volume_id, .. } => {
                write!(f, "UnpublishVolume({})", volume_id)
            }
            Self::GetVolumeStats { volume_id, .. } => write!(f, "GetVolumeStats({})", volume_id),
            Self::ExpandVolume { volume_id, .. } => write!(f, "ExpandVolume({})", volume_id),
            Self::GetNodeCapabilities => f.write_str("GetNodeCapabilities"),
            Self::GetNodeInfo => f.write_str("GetNodeInfo"),
            Self::PluginInfoResponse(info) => {
                write!(f, "PluginInfo(name={})", info.name)
            }
            Self::PluginCapabilitiesResponse(caps) => {
                write!(f, "PluginCapabilities(count={})", caps.len())
            }
            Self::NodeCapabilitiesResponse(caps) => {
                write!(f, "NodeCapabilities(count={})", caps.len())
            }
            Self::NodeInfoResponse(info) => write!(f, "NodeInfo({})", info.node_id),
            Self::Ok => f.write_str("Ok"),
            Self::ProbeResult(ok) => write!(f, "ProbeResult({})", ok),
            Self::Error(e) => write!(f, "Error({}: {})", e.code() as i32, e),
        }
    }
}

impl CsiMessage {
    /// `true` for variants a client may send.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Self::Probe
                | Self::GetPluginInfo
                | Self::GetPluginCapabilities
                | Self::StageVolume(_)
                | Self::UnstageVolume { .. }
                | Self::PublishVolume(_)
                | Self::UnpublishVolume { .. }
                | Self::GetVolumeStats { .. }
                | Self::ExpandVolume { .. }
                | Self::GetNodeCapabilities
                | Self::GetNodeInfo
        )
    }

    /// Collapse a response into `Ok(())` or the carried error.
    ///
    /// Used by callers of the mutating node RPCs, which answer with a bare
    /// [`CsiMessage::Ok`].
    pub fn into_unit(self) -> Result<(), CsiError> {
        match self {
            Self::Ok => Ok(()),
            Self::Error(e) => Err(e),
            other => Err(CsiError::TransportError(format!(
                "unexpected response: {other}"
            ))),
        }
    }
}
