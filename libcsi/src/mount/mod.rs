//! Mount lifecycle: state detection, mount mechanisms and reconciliation.
//!
//! | Module | Purpose |
//! |---|---|
//! | [`state`] | [`MountState`] and the side-effect-free [`StateDetector`]. |
//! | [`mechanism`] | [`MountMechanism`]: direct FUSE mount vs. slave bind mount. |
//! | [`reconcile`] | [`Mounter`]: drives a path to a healthy mount. |

pub mod mechanism;
pub mod reconcile;
pub mod state;

#[cfg(test)]
pub(crate) mod fake;

pub use mechanism::{MountMechanism, is_benign_unmount_error};
pub use reconcile::Mounter;
pub use state::{MountState, MountTableDetector, StateDetector};
