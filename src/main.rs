//! jit-launcher: command-line front end.
//!
//! `launch` enables JIT (unless told not to), starts the VM on its worker
//! thread and waits for it to finish. `save` and `load` talk to a running
//! VM through its monitor socket.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use jit_launcher::config::LauncherConfig;
use jit_launcher::paths::LauncherPaths;
use jit_launcher::vm::{BootSlots, EngineLocator, LaunchRequest, Launcher, MonitorClient};
use jit_launcher::{jit, logging};

/// Run a VM monitor with self-debug JIT enablement
#[derive(Parser, Debug)]
#[command(name = "jit-launcher", version, about)]
struct Args {
    /// Launcher config file (defaults to the config directory's launcher.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a VM and wait for it to power off
    Launch(LaunchArgs),
    /// Snapshot the running VM
    Save {
        /// Snapshot name; defaults to the next instant-boot slot
        #[arg(long)]
        tag: Option<String>,
    },
    /// Restore a snapshot into the running VM
    Load {
        #[arg(long)]
        tag: String,
    },
}

#[derive(clap::Args, Debug)]
struct LaunchArgs {
    /// Engine shared library; omit to use the statically linked engine
    #[arg(long)]
    engine: Option<PathBuf>,

    #[arg(long)]
    kernel: PathBuf,

    #[arg(long)]
    initrd: PathBuf,

    /// Firmware search directory
    #[arg(long)]
    bios: PathBuf,

    /// Persistent disk image
    #[arg(long)]
    disk: Option<PathBuf>,

    /// Resume from this snapshot
    #[arg(long, conflicts_with = "instant_boot")]
    snapshot: Option<String>,

    /// Resume from the current instant-boot slot
    #[arg(long)]
    instant_boot: bool,

    /// Host directory exported to the guest
    #[arg(long)]
    shared_folder: Option<PathBuf>,

    /// File receiving the engine's own log
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Skip JIT enablement and use the interpreter
    #[arg(long)]
    no_jit: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let paths = LauncherPaths::resolve();
    let _log_guard = logging::init(paths.as_ref().map(|p| p.logs.clone()));

    let config_path = match (&args.config, &paths) {
        (Some(path), _) => Some(path.clone()),
        (None, Some(paths)) => Some(paths.config_file()),
        (None, None) => None,
    };
    let config = match config_path {
        Some(path) => LauncherConfig::load(&path)?,
        None => LauncherConfig::default(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")?;

    match args.command {
        Command::Launch(launch) => run_launch(&runtime, config, paths.as_ref(), launch),
        Command::Save { tag } => runtime.block_on(run_save(&config, paths.as_ref(), tag)),
        Command::Load { tag } => runtime.block_on(run_load(&config, &tag)),
    }
}

fn slots(paths: Option<&LauncherPaths>) -> Result<BootSlots> {
    let paths = paths.context("HOME is not set; cannot locate the instant-boot marker")?;
    paths.ensure().context("Failed to create launcher directories")?;
    Ok(BootSlots::new(paths.slot_file()))
}

fn run_launch(
    runtime: &tokio::runtime::Runtime,
    config: LauncherConfig,
    paths: Option<&LauncherPaths>,
    args: LaunchArgs,
) -> Result<()> {
    let engine = match args.engine {
        Some(path) => EngineLocator::Library(path),
        None => EngineLocator::Static,
    };

    let snapshot = if args.instant_boot {
        Some(slots(paths)?.current()?.tag())
    } else {
        args.snapshot
    };

    let request = LaunchRequest {
        disk_path: args.disk,
        shared_folder: args.shared_folder,
        snapshot,
        log_path: args.log_file,
        jit_enabled: !args.no_jit,
        ..LaunchRequest::new(engine, args.kernel, args.initrd, args.bios)
    };

    let launcher = Launcher::new(config);
    let receipt = launcher
        .launch_with_receipt(&request)
        .context("Failed to launch VM")?;
    info!(jit = ?jit::process_state(), "VM worker started");

    runtime
        .block_on(receipt.finished())
        .context("VM worker failed")?;
    info!("VM exited");
    Ok(())
}

fn monitor_port(config: &LauncherConfig) -> Result<u16> {
    match config.monitor_port {
        Some(port) => Ok(port),
        None => bail!("monitor_port is not configured; the VM has no monitor socket"),
    }
}

async fn run_save(
    config: &LauncherConfig,
    paths: Option<&LauncherPaths>,
    tag: Option<String>,
) -> Result<()> {
    let mut monitor = MonitorClient::connect_local(monitor_port(config)?).await?;
    match tag {
        Some(tag) => monitor.save_state(&tag).await?,
        None => {
            let slot = monitor.background_save(&slots(paths)?).await?;
            info!(slot = %slot, "instant-boot image updated");
        }
    }
    Ok(())
}

async fn run_load(config: &LauncherConfig, tag: &str) -> Result<()> {
    let mut monitor = MonitorClient::connect_local(monitor_port(config)?).await?;
    monitor.load_state(tag).await?;
    Ok(())
}
