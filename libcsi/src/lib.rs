//! # libcsi, a FUSE CSI node plugin for RK8s
//!
//! `libcsi` implements a [Container Storage Interface][csi] node plugin that
//! serves volumes backed by a FUSE provider.  Staging starts the provider on
//! a node-global path; publishing bind-mounts that path into each workload.
//! Calls arrive as JSON messages over a unix socket and follow the RK8s
//! conventions (Tokio async runtime, `tracing` for observability,
//! `thiserror` for structured errors).
//!
//! Mounts are repaired in place: a path whose provider died is unmounted and
//! mounted again on the next call touching it, and mounts recorded in the
//! optional on-disk cache are replayed when the plugin restarts.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `VolumeId`, capabilities, requests. |
//! | [`error`] | [`CsiError`] enum and its gRPC-style status codes. |
//! | [`message`] | [`CsiMessage`] protocol envelope for the socket transport. |
//! | [`identity`] | [`CsiIdentity`] trait: plugin discovery & health. |
//! | [`node`] | [`CsiNode`] trait: stage, publish, unpublish, unstage. |
//! | [`exec`] | Running `mount`, `umount` and the FUSE helper. |
//! | [`mount`] | Mount state detection, mechanisms and reconciliation. |
//! | [`cache`] | Crash-persistent record of staged and published mounts. |
//! | [`admission`] | One in-flight mutating call per volume. |
//! | [`validate`] | Request checks run before any side effect. |
//! | [`backend`] | The FUSE backend implementing the services. |
//! | [`transport`] | Unix-socket client/server. |
//! | [`driver`] | Driver options and bootstrap. |
//! | [`eviction`] | Deleting pods left with dead mounts after a restart. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod admission;
pub mod backend;
pub mod cache;
pub mod driver;
pub mod error;
pub mod eviction;
pub mod exec;
pub mod identity;
pub mod message;
pub mod mount;
pub mod node;
pub mod transport;
pub mod types;
pub mod validate;

// Re-export the most commonly used items at crate root for convenience.
pub use backend::fuse::FuseBackend;
pub use driver::{Driver, DriverOpts, ServiceRole};
pub use error::{Code, CsiError};
pub use identity::CsiIdentity;
pub use message::CsiMessage;
pub use node::CsiNode;
pub use types::*;
