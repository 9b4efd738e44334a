//! RAID Provision CLI
//!
//! Command line front end for provisioning and tearing down RAID virtual
//! drives on benchmark hosts. The desired configuration is given either
//! as a JSON spec file or inline via flags; results are printed as JSON
//! on stdout so a harness can consume them.

use anyhow::{bail, Context};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use raid_provision::{
    BackendFactory, ProvisionerConfig, RaidBackend, RaidSpec, ReadinessState, SettlePolicy,
    SystemRunner, VirtualDrive,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Provision and tear down RAID virtual drives via mdadm, storcli or arcconf
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// RAID management backend (mdadm, storcli, arcconf)
    #[arg(long, env = "RAID_BACKEND")]
    backend: String,

    /// Hardware controller index
    #[arg(long, env = "RAID_CONTROLLER", default_value = "0")]
    controller: u32,

    /// Post-creation discovery attempts
    #[arg(long, env = "RAID_SETTLE_ATTEMPTS", default_value = "10")]
    settle_attempts: u32,

    /// Pause between discovery attempts, in seconds
    #[arg(long, env = "RAID_SETTLE_INTERVAL", default_value = "1")]
    settle_interval_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

/// Desired RAID configuration, from a file or inline flags.
#[derive(ClapArgs, Debug)]
struct SpecArgs {
    /// JSON spec file; overrides the inline flags
    #[arg(long)]
    spec: Option<PathBuf>,

    /// RAID level
    #[arg(long, required_unless_present = "spec")]
    level: Option<u32>,

    /// OS block device path the drive must appear as (e.g. /dev/md0)
    #[arg(long, required_unless_present = "spec")]
    device_path: Option<PathBuf>,

    /// Member physical devices (repeatable or comma separated)
    #[arg(long, value_delimiter = ',', required_unless_present = "spec")]
    device: Vec<String>,

    /// Read policy token, passed to the tool verbatim
    #[arg(long)]
    read_policy: Option<String>,

    /// Write policy token, passed to the tool verbatim
    #[arg(long)]
    write_policy: Option<String>,

    /// Strip/stripe size
    #[arg(long)]
    strip_size: Option<u32>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the virtual drive, or bind an existing one serving the same devices
    Provision {
        #[command(flatten)]
        spec: SpecArgs,

        /// Poll until the drive reports ready before exiting
        #[arg(long)]
        wait_ready: bool,

        /// Give up waiting for readiness after this many seconds
        #[arg(long, default_value = "3600")]
        ready_timeout_secs: u64,
    },
    /// Delete the virtual drive serving the given configuration
    Teardown {
        #[command(flatten)]
        spec: SpecArgs,
    },
    /// Report the drive's readiness state
    Status {
        #[command(flatten)]
        spec: SpecArgs,
    },
    /// Report whether a drive serving the given configuration exists
    Check {
        #[command(flatten)]
        spec: SpecArgs,
    },
}

impl SpecArgs {
    fn load(self) -> anyhow::Result<RaidSpec> {
        if let Some(path) = &self.spec {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading spec file {}", path.display()))?;
            let spec: RaidSpec = serde_json::from_str(&raw)
                .with_context(|| format!("parsing spec file {}", path.display()))?;
            return Ok(spec);
        }
        // clap enforces presence when no file is given
        let level = self.level.context("missing --level")?;
        let device_path = self.device_path.context("missing --device-path")?;
        Ok(RaidSpec {
            level,
            device_path,
            devices: self.device.iter().map(|d| d.as_str().into()).collect(),
            read_policy: self.read_policy,
            write_policy: self.write_policy,
            strip_size: self.strip_size,
        })
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&cli);

    info!(
        version = raid_provision::VERSION,
        backend = %cli.backend,
        "starting raid-provision"
    );

    let config = ProvisionerConfig {
        settle: SettlePolicy {
            attempts: cli.settle_attempts,
            interval: Duration::from_secs(cli.settle_interval_secs),
        },
        controller: cli.controller,
        ..ProvisionerConfig::default()
    };
    let runner = Arc::new(SystemRunner::new());

    let make_backend = |spec: RaidSpec| -> anyhow::Result<Box<dyn RaidBackend>> {
        BackendFactory::create(&cli.backend, spec, config.clone(), runner.clone())
            .context("constructing backend")
    };

    match cli.command {
        Command::Provision {
            spec,
            wait_ready,
            ready_timeout_secs,
        } => {
            let spec = spec.load()?;
            let mut backend = make_backend(spec.clone())?;
            backend.initialize().await?;

            let vd = if backend.path_exists().await? {
                info!(path = %spec.device_path.display(), "virtual drive already present");
                bound_drive(backend.as_ref(), &spec)?
            } else {
                backend.create_virtual_drive().await?
            };

            if wait_ready {
                wait_until_ready(backend.as_ref(), ready_timeout_secs).await?;
            }
            emit(&vd)?;
        }
        Command::Teardown { spec } => {
            let spec = spec.load()?;
            let mut backend = make_backend(spec.clone())?;
            backend.initialize().await?;

            if !backend.path_exists().await? {
                warn!(path = %spec.device_path.display(), "no virtual drive to tear down");
                return Ok(());
            }
            let vd = bound_drive(backend.as_ref(), &spec)?;
            backend.delete_virtual_drive(&vd).await?;
            info!(id = %vd.id, "teardown complete");
        }
        Command::Status { spec } => {
            let spec = spec.load()?;
            let mut backend = make_backend(spec)?;
            backend.initialize().await?;

            // binds the drive so hardware backends can query it
            backend.path_exists().await?;
            let state = backend.is_ready().await?;
            println!("{state}");
        }
        Command::Check { spec } => {
            let spec = spec.load()?;
            let mut backend = make_backend(spec)?;
            backend.initialize().await?;

            let exists = backend.path_exists().await?;
            println!("{exists}");
            if !exists {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// The drive a backend is currently bound to, as a [`VirtualDrive`].
///
/// Software RAID carries no controller-side identifier; the OS device
/// name stands in for it.
fn bound_drive(backend: &dyn RaidBackend, spec: &RaidSpec) -> anyhow::Result<VirtualDrive> {
    let id = match backend.bound_vd() {
        Some(id) => id.to_string(),
        None => spec.os_name()?.to_string(),
    };
    Ok(VirtualDrive {
        id,
        devices: spec.devices.clone(),
        device_path: spec.device_path.clone(),
        state: ReadinessState::Unknown,
        created_at: chrono::Utc::now(),
    })
}

/// Poll readiness once a second until the drive reports ready.
async fn wait_until_ready(backend: &dyn RaidBackend, timeout_secs: u64) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    loop {
        match backend.is_ready().await? {
            ReadinessState::Ready => {
                info!("virtual drive is ready");
                return Ok(());
            }
            state => {
                if tokio::time::Instant::now() >= deadline {
                    bail!("drive still {state} after {timeout_secs}s");
                }
                info!(%state, "waiting for virtual drive");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

fn emit(vd: &VirtualDrive) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(vd).context("serializing result")?;
    println!("{json}");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(cli: &Cli) {
    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
