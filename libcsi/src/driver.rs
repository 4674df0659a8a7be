//! Driver configuration and bootstrap.
//!
//! [`DriverOpts`] is the init-time configuration handed over by the binary;
//! [`Driver::run`] replays the mount cache and then serves the CSI socket
//! until the process is stopped.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use tracing::info;

use crate::backend::fuse::FuseBackend;
use crate::cache::RecoveryReport;
use crate::error::CsiError;
use crate::mount::Mounter;
use crate::transport::server::CsiServer;

/// Driver name advertised when none is configured.
pub const DEFAULT_DRIVER_NAME: &str = "fuse.csi.rk8s.io";

/// FUSE provider binary started for every staged volume.
pub const DEFAULT_FUSE_HELPER: &str = "dummy-fuse";

/// Upper bound on the driver name length imposed by CSI.
pub const MAX_DRIVER_NAME_LEN: usize = 63;

const UNIX_SCHEME: &str = "unix://";

/// Default socket endpoint under the kubelet plugin directory.
pub fn default_endpoint() -> String {
    format!("{UNIX_SCHEME}/var/lib/kubelet/plugins/{DEFAULT_DRIVER_NAME}/csi.sock")
}

/// Service a driver instance may serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceRole {
    /// Plugin discovery and health.
    Identity,
    /// Stage / publish on this node.
    Node,
    /// Only advertised; no controller RPCs are implemented.
    Controller,
}

impl FromStr for ServiceRole {
    type Err = CsiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "identity" => Ok(Self::Identity),
            "node" => Ok(Self::Node),
            "controller" => Ok(Self::Controller),
            other => Err(CsiError::InvalidArgument(format!("unknown role {other}"))),
        }
    }
}

impl fmt::Display for ServiceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Identity => "identity",
            Self::Node => "node",
            Self::Controller => "controller",
        })
    }
}

/// Init-time driver configuration.
#[derive(Debug, Clone)]
pub struct DriverOpts {
    /// Name advertised through `GetPluginInfo`.
    pub driver_name: String,
    /// `unix://<absolute path>` or a bare absolute socket path.
    pub endpoint: String,
    /// Identifier of the node this plugin instance runs on.
    pub node_id: String,
    /// Directory for the crash-persistent mount cache; `None` disables it.
    pub mount_cache_root: Option<PathBuf>,
    /// Services to serve.
    pub roles: HashSet<ServiceRole>,
    /// Provider binary used for staging mounts.
    pub fuse_helper: String,
}

impl Default for DriverOpts {
    fn default() -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_owned(),
            endpoint: default_endpoint(),
            node_id: String::new(),
            mount_cache_root: None,
            roles: HashSet::from([ServiceRole::Identity, ServiceRole::Node]),
            fuse_helper: DEFAULT_FUSE_HELPER.to_owned(),
        }
    }
}

impl DriverOpts {
    /// Check the configuration before anything is started.
    pub fn validate(&self) -> Result<(), CsiError> {
        fn required(name: &str, value: &str) -> Result<(), CsiError> {
            if value.is_empty() {
                return Err(CsiError::InvalidArgument(format!(
                    "{name} is a required parameter"
                )));
            }
            Ok(())
        }

        required("drivername", &self.driver_name)?;
        if self.driver_name.len() > MAX_DRIVER_NAME_LEN {
            return Err(CsiError::InvalidArgument(format!(
                "driver name too long: is {} characters, maximum is {MAX_DRIVER_NAME_LEN}",
                self.driver_name.len()
            )));
        }
        if !is_dns1123_subdomain(&self.driver_name.to_lowercase()) {
            return Err(CsiError::InvalidArgument(format!(
                "driver name {} is invalid: must consist of lower case alphanumeric \
                 characters, '-' or '.', and must start and end with an alphanumeric character",
                self.driver_name
            )));
        }

        required("endpoint", &self.endpoint)?;
        socket_path(&self.endpoint)?;
        required("nodeid", &self.node_id)?;
        required("fuse helper", &self.fuse_helper)?;

        if self.roles.is_empty() {
            return Err(CsiError::InvalidArgument(
                "at least one service role must be enabled".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Resolve an endpoint URL to the socket path it names.
pub fn socket_path(endpoint: &str) -> Result<PathBuf, CsiError> {
    let path = Path::new(endpoint.strip_prefix(UNIX_SCHEME).unwrap_or(endpoint));
    if !path.is_absolute() {
        return Err(CsiError::InvalidArgument(format!(
            "endpoint {endpoint}: expected a UNIX domain socket URL unix://<absolute path to socket>"
        )));
    }
    Ok(path.to_path_buf())
}

/// DNS-1123 subdomain: dot-separated labels of `[a-z0-9-]`, each starting and
/// ending alphanumeric, at most 253 characters overall.
fn is_dns1123_subdomain(name: &str) -> bool {
    fn is_label(label: &str) -> bool {
        let bytes = label.as_bytes();
        let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
        match (bytes.first(), bytes.last()) {
            (Some(first), Some(last)) => {
                alnum(first) && alnum(last) && bytes.iter().all(|b| alnum(b) || *b == b'-')
            }
            _ => false,
        }
    }

    !name.is_empty() && name.len() <= 253 && name.split('.').all(is_label)
}

/// A configured driver, ready to serve.
pub struct Driver {
    opts: DriverOpts,
    backend: Arc<FuseBackend>,
}

impl Driver {
    /// Validate `opts` and build a driver mounting through real processes.
    pub fn new(opts: DriverOpts) -> Result<Self, CsiError> {
        let mounter = Mounter::system(opts.fuse_helper.clone());
        Self::with_mounter(opts, mounter)
    }

    /// Validate `opts` and build a driver around an explicit [`Mounter`].
    pub fn with_mounter(opts: DriverOpts, mounter: Mounter) -> Result<Self, CsiError> {
        opts.validate()
            .map_err(|e| CsiError::InvalidArgument(format!("invalid driver options: {e}")))?;

        info!(driver = %opts.driver_name, version = env!("CARGO_PKG_VERSION"), "driver initialised");
        let backend = Arc::new(FuseBackend::new(&opts, mounter));
        Ok(Self { opts, backend })
    }

    /// The services backing this driver.
    pub fn backend(&self) -> &Arc<FuseBackend> {
        &self.backend
    }

    /// Replay the mount cache, if one is configured.
    pub async fn recover(&self) -> RecoveryReport {
        if self.opts.mount_cache_root.is_some() {
            info!("attempting to re-mount volumes from the mount cache");
        }
        self.backend.recover().await
    }

    /// Bind the endpoint socket without serving yet.
    pub fn bind(&self) -> Result<CsiServer<FuseBackend>, CsiError> {
        let path = socket_path(&self.opts.endpoint)?;
        CsiServer::bind(&path, Arc::clone(&self.backend), self.opts.roles.clone())
    }

    /// Recover cached mounts, then serve until the listener fails.
    pub async fn run(self) -> Result<(), CsiError> {
        self.recover().await;
        let server = self.bind()?;
        server.serve().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> DriverOpts {
        DriverOpts {
            node_id: "node-1".into(),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_are_valid_once_node_is_set() {
        assert!(DriverOpts::default().validate().is_err());
        opts().validate().unwrap();
    }

    #[test]
    fn driver_name_rules() {
        assert!(is_dns1123_subdomain("fuse.csi.rk8s.io"));
        assert!(is_dns1123_subdomain("a-b.c1"));
        assert!(!is_dns1123_subdomain("-leading.dash"));
        assert!(!is_dns1123_subdomain("double..dot"));
        assert!(!is_dns1123_subdomain("under_score"));
        assert!(!is_dns1123_subdomain(""));

        let mut o = opts();
        o.driver_name = "Fuse.CSI.example".into();
        o.validate().unwrap();

        o.driver_name = "x".repeat(MAX_DRIVER_NAME_LEN + 1);
        let err = o.validate().unwrap_err();
        assert!(err.to_string().contains("too long"));

        o.driver_name = "bad name".into();
        assert!(o.validate().is_err());
    }

    #[test]
    fn endpoint_parsing() {
        assert_eq!(
            socket_path("unix:///run/csi/csi.sock").unwrap(),
            PathBuf::from("/run/csi/csi.sock")
        );
        assert_eq!(
            socket_path("/run/csi/csi.sock").unwrap(),
            PathBuf::from("/run/csi/csi.sock")
        );
        assert!(socket_path("unix://relative/csi.sock").is_err());
        assert!(socket_path("tcp://127.0.0.1:10000").is_err());
    }

    #[test]
    fn required_fields() {
        let mut o = opts();
        o.node_id.clear();
        assert!(o.validate().unwrap_err().to_string().contains("nodeid"));

        let mut o = opts();
        o.roles.clear();
        assert!(o.validate().is_err());
    }

    #[test]
    fn role_parsing() {
        assert_eq!("node".parse::<ServiceRole>().unwrap(), ServiceRole::Node);
        assert_eq!(
            "controller".parse::<ServiceRole>().unwrap(),
            ServiceRole::Controller
        );
        assert!("snapshotter".parse::<ServiceRole>().is_err());
        assert_eq!(ServiceRole::Identity.to_string(), "identity");
    }

    #[test]
    fn driver_rejects_invalid_opts() {
        let err = Driver::new(DriverOpts::default()).err().unwrap();
        assert!(err.to_string().contains("invalid driver options"));
    }
}
