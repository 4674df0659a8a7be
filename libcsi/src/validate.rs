//! Request validation for the node RPCs.
//!
//! Validation runs before admission control and before any side effect; the
//! first failing check wins and is reported as
//! [`CsiError::InvalidArgument`].

use std::collections::HashMap;

use crate::error::CsiError;
use crate::types::{
    AccessMode, AccessType, NodePublishVolumeRequest, NodeStageVolumeRequest, VolumeCapability,
    VolumeId,
};

/// Volume context keys this driver refuses.
pub const UNSUPPORTED_VOLUME_PARAMS: [&str; 2] = ["hash", "tag"];

fn invalid(msg: impl Into<String>) -> CsiError {
    CsiError::InvalidArgument(msg.into())
}

fn require_volume_id(volume_id: &VolumeId) -> Result<(), CsiError> {
    if volume_id.is_empty() {
        return Err(invalid("volume ID missing in request"));
    }
    Ok(())
}

/// Access type must be a filesystem mount; block volumes are not served.
fn check_access_type(capability: &VolumeCapability) -> Result<(), CsiError> {
    match capability.access_type {
        Some(AccessType::Block) => Err(invalid("volume access type Block is unsupported")),
        Some(AccessType::Mount { .. }) => Ok(()),
        None => Err(invalid("volume access type must be Mount")),
    }
}

fn check_access_mode(capability: &VolumeCapability) -> Result<(), CsiError> {
    if capability.access_mode != Some(AccessMode::MultiNodeReaderOnly) {
        return Err(invalid("volume access mode must be ReadOnlyMany"));
    }
    Ok(())
}

fn check_volume_context(context: &HashMap<String, String>) -> Result<(), CsiError> {
    if let Some(key) = UNSUPPORTED_VOLUME_PARAMS
        .iter()
        .find(|key| context.contains_key(**key))
    {
        return Err(invalid(format!("volume parameter {key} is not supported")));
    }
    Ok(())
}

/// Checks shared by stage and publish that precede the path checks.
fn require_capability(
    capability: Option<&VolumeCapability>,
) -> Result<&VolumeCapability, CsiError> {
    let capability = capability.ok_or_else(|| invalid("volume capability missing in request"))?;
    check_access_type(capability)?;
    Ok(capability)
}

pub fn stage_request(req: &NodeStageVolumeRequest) -> Result<(), CsiError> {
    require_volume_id(&req.volume_id)?;
    let capability = require_capability(req.volume_capability.as_ref())?;
    if req.staging_target_path.is_empty() {
        return Err(invalid("volume staging target path missing in request"));
    }
    check_access_mode(capability)?;
    check_volume_context(&req.volume_context)
}

pub fn publish_request(req: &NodePublishVolumeRequest) -> Result<(), CsiError> {
    require_volume_id(&req.volume_id)?;
    let capability = require_capability(req.volume_capability.as_ref())?;
    if req.staging_target_path.is_empty() {
        return Err(invalid("volume staging target path missing in request"));
    }
    if req.target_path.is_empty() {
        return Err(invalid("volume target path missing in request"));
    }
    check_access_mode(capability)?;
    check_volume_context(&req.volume_context)
}

pub fn unstage_request(volume_id: &VolumeId, staging_target_path: &str) -> Result<(), CsiError> {
    require_volume_id(volume_id)?;
    if staging_target_path.is_empty() {
        return Err(invalid("staging target path missing in request"));
    }
    Ok(())
}

pub fn unpublish_request(volume_id: &VolumeId, target_path: &str) -> Result<(), CsiError> {
    require_volume_id(volume_id)?;
    if target_path.is_empty() {
        return Err(invalid("target path missing in request"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage_req() -> NodeStageVolumeRequest {
        NodeStageVolumeRequest {
            volume_id: "v1".into(),
            staging_target_path: "/stage".into(),
            volume_capability: Some(VolumeCapability::mount(AccessMode::MultiNodeReaderOnly)),
            volume_context: HashMap::new(),
        }
    }

    fn publish_req() -> NodePublishVolumeRequest {
        NodePublishVolumeRequest {
            volume_id: "v1".into(),
            staging_target_path: "/stage".into(),
            target_path: "/target".into(),
            volume_capability: Some(VolumeCapability::mount(AccessMode::MultiNodeReaderOnly)),
            volume_context: HashMap::new(),
        }
    }

    fn message(err: CsiError) -> String {
        match err {
            CsiError::InvalidArgument(msg) => msg,
            other => panic!("expected InvalidArgument, got {other}"),
        }
    }

    #[test]
    fn valid_requests_pass() {
        stage_request(&stage_req()).unwrap();
        publish_request(&publish_req()).unwrap();
        unstage_request(&"v1".into(), "/stage").unwrap();
        unpublish_request(&"v1".into(), "/target").unwrap();
    }

    #[test]
    fn stage_rejections() {
        let mut req = stage_req();
        req.volume_id = VolumeId::default();
        assert_eq!(message(stage_request(&req).unwrap_err()), "volume ID missing in request");

        let mut req = stage_req();
        req.volume_capability = None;
        assert_eq!(
            message(stage_request(&req).unwrap_err()),
            "volume capability missing in request"
        );

        let mut req = stage_req();
        req.volume_capability = Some(VolumeCapability::block(AccessMode::MultiNodeReaderOnly));
        assert_eq!(
            message(stage_request(&req).unwrap_err()),
            "volume access type Block is unsupported"
        );

        let mut req = stage_req();
        req.staging_target_path.clear();
        assert!(message(stage_request(&req).unwrap_err()).contains("staging target path"));

        let mut req = stage_req();
        req.volume_capability = Some(VolumeCapability::mount(AccessMode::SingleNodeWriter));
        assert_eq!(
            message(stage_request(&req).unwrap_err()),
            "volume access mode must be ReadOnlyMany"
        );

        let mut req = stage_req();
        req.volume_context.insert("tag".into(), "latest".into());
        assert_eq!(
            message(stage_request(&req).unwrap_err()),
            "volume parameter tag is not supported"
        );
    }

    #[test]
    fn missing_access_type() {
        let mut req = stage_req();
        req.volume_capability = Some(VolumeCapability {
            access_type: None,
            access_mode: Some(AccessMode::MultiNodeReaderOnly),
        });
        assert_eq!(
            message(stage_request(&req).unwrap_err()),
            "volume access type must be Mount"
        );
    }

    #[test]
    fn block_is_checked_before_paths() {
        let mut req = publish_req();
        req.target_path.clear();
        req.volume_capability = Some(VolumeCapability::block(AccessMode::MultiNodeReaderOnly));
        assert_eq!(
            message(publish_request(&req).unwrap_err()),
            "volume access type Block is unsupported"
        );
    }

    #[test]
    fn publish_requires_target() {
        let mut req = publish_req();
        req.target_path.clear();
        assert_eq!(
            message(publish_request(&req).unwrap_err()),
            "volume target path missing in request"
        );

        let mut req = publish_req();
        req.volume_context.insert("hash".into(), "abc".into());
        assert!(publish_request(&req).is_err());
    }

    #[test]
    fn teardown_rejections() {
        assert!(unstage_request(&VolumeId::default(), "/stage").is_err());
        assert!(unstage_request(&"v1".into(), "").is_err());
        assert!(unpublish_request(&VolumeId::default(), "/target").is_err());
        assert!(unpublish_request(&"v1".into(), "").is_err());
    }
}
