//! Command-line flags of the node plugin.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use libcsi::driver::{DEFAULT_DRIVER_NAME, DEFAULT_FUSE_HELPER, default_endpoint};
use libcsi::{DriverOpts, ServiceRole};

#[derive(Parser, Debug)]
#[command(name = "rkcsi")]
#[command(about = "CSI node plugin serving FUSE-backed read-only volumes")]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// CSI endpoint, `unix://<absolute path>`.
    #[arg(long, env = "CSI_ENDPOINT", default_value_t = default_endpoint())]
    pub endpoint: String,

    /// Name of the driver.
    #[arg(long = "drivername", env = "CSI_DRIVER_NAME", default_value = DEFAULT_DRIVER_NAME)]
    pub driver_name: String,

    /// Node ID.
    #[arg(long = "nodeid", env = "NODE_NAME")]
    pub node_id: Option<String>,

    /// Services to serve; may be repeated or comma separated.
    #[arg(
        long = "role",
        env = "CSI_ROLES",
        value_delimiter = ',',
        default_values_t = [ServiceRole::Identity, ServiceRole::Node],
    )]
    pub roles: Vec<ServiceRole>,

    /// Directory where mounts are recorded for re-mounting after a restart.
    /// Mounts are not recorded when unset.
    #[arg(long, env = "CSI_MOUNT_CACHE_ROOT")]
    pub mount_cache_root: Option<PathBuf>,

    /// FUSE provider binary started on every staging path.
    #[arg(long, env = "CSI_FUSE_HELPER", default_value = DEFAULT_FUSE_HELPER)]
    pub fuse_helper: String,

    /// Log output format.
    #[arg(long, env = "CSI_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the version and exit.
    Version,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl Cli {
    /// Driver options described by the flags; validated by the driver.
    pub fn driver_opts(&self) -> DriverOpts {
        DriverOpts {
            driver_name: self.driver_name.clone(),
            endpoint: self.endpoint.clone(),
            node_id: self.node_id.clone().unwrap_or_default(),
            mount_cache_root: self.mount_cache_root.clone(),
            roles: self.roles.iter().copied().collect(),
            fuse_helper: self.fuse_helper.clone(),
        }
    }
}
