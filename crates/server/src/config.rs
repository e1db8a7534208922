//! Command line and resolved server configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use armdock_connectors::{PromptMarkers, ToolConfig};
use clap::builder::BoolishValueParser;
use clap::{Parser, Subcommand};

/// Lines of process output kept per session; oldest are evicted first.
pub const LOG_CAPACITY: usize = 500;
/// How long an interrupted process gets before it is killed.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(3);
/// Presence-offline reports are ignored this long after a teleop start.
pub const TELEOP_PRESENCE_GRACE: Duration = Duration::from_millis(2500);
/// Joints whose captured span is below this (raw units) count as stuck.
pub const NEAR_ZERO_SPAN: f64 = 1.0;
/// Finished sessions nobody touched for this long are dropped from the registry.
pub const SESSION_IDLE_TTL: Duration = Duration::from_secs(30 * 60);

/// ArmDock robot arm control server
#[derive(Parser, Debug)]
#[command(name = "armdock")]
#[command(about = "Calibration and teleoperation control for robot arms")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Address to listen on
    #[arg(long, env = "ARMDOCK_BIND", default_value = "127.0.0.1:4100", global = true)]
    pub bind: SocketAddr,

    /// Data directory (robot store and logs); defaults to ~/.armdock
    #[arg(long, env = "ARMDOCK_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Device presence poll interval
    #[arg(
        long,
        env = "ARMDOCK_POLL_INTERVAL_MS",
        default_value_t = 2000,
        global = true
    )]
    pub poll_interval_ms: u64,

    /// Force dry-run on or off; unset means dry-run only when the tool is missing
    #[arg(
        long,
        env = "ARMDOCK_DRY_RUN",
        value_parser = BoolishValueParser::new(),
        num_args = 0..=1,
        default_missing_value = "true",
        global = true
    )]
    pub dry_run: Option<bool>,

    /// Python interpreter that has the external tool installed
    #[arg(long, env = "ARMDOCK_PYTHON", global = true)]
    pub python: Option<PathBuf>,

    /// JSON file overriding prompt marker strings
    #[arg(long, env = "ARMDOCK_MARKERS", global = true)]
    pub markers: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Run the server (default)
    Serve,
    /// Print attached serial devices and exit
    Ports,
}

/// Everything the running server needs, resolved once at startup
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub poll_interval: Duration,
    pub dry_run: bool,
    pub tool: ToolConfig,
    pub markers: PromptMarkers,
}

impl ServerConfig {
    /// Probe the external tool and load marker overrides.
    pub fn resolve(cli: &Cli) -> anyhow::Result<Self> {
        let tool = ToolConfig::detect(cli.python.as_deref());
        let markers = match &cli.markers {
            Some(path) => PromptMarkers::from_json_file(path).map_err(|e| {
                anyhow::anyhow!("failed to load markers from {}: {e}", path.display())
            })?,
            None => PromptMarkers::default(),
        };
        Ok(Self {
            bind: cli.bind,
            poll_interval: Duration::from_millis(cli.poll_interval_ms.max(100)),
            dry_run: tool.dry_run(cli.dry_run),
            tool,
            markers,
        })
    }
}
