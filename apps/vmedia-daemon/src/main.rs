use anyhow::{Context, Result};
use clap::Parser;
use std::{cell::RefCell, path::PathBuf, rc::Rc, time::Duration};
use tokio::{signal, task::LocalSet};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use vmedia_core::{
    bus::ObjectServer,
    machine::RegisterDbusEvent,
    monitor::{self, DeviceMonitor},
    rpc::MountPointRpc,
    Configuration, Event, MountPointStateMachine, System,
};

const DEVICE_POLL_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(name = "vmediad")]
#[command(about = "Expose remote storage images as USB mass-storage devices", long_about = None)]
struct Args {
    /// Path to the mount-point configuration file.
    #[arg(long, value_name = "PATH", default_value = "/etc/vmedia/config.json")]
    config: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Configuration::load(&args.config).context("load configuration")?;

    // Machines, timers, and subprocess callbacks all share one cooperative
    // event loop.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build runtime")?;
    let local = LocalSet::new();
    local.block_on(&runtime, run(config))
}

async fn run(config: Configuration) -> Result<()> {
    let system = System::host();
    let (server, mut completions) = ObjectServer::new();
    let server = Rc::new(RefCell::new(server));
    let monitor = Rc::new(RefCell::new(DeviceMonitor::new()));

    for mount_point in config.mount_points {
        let name = mount_point.name.clone();
        let (machine, events) = MountPointStateMachine::new(mount_point, system.clone());
        monitor.borrow_mut().add_machine(Rc::clone(&machine));
        tokio::task::spawn_local(MountPointStateMachine::run(Rc::clone(&machine), events));

        let object = MountPointRpc::new(Rc::clone(&machine));
        machine
            .borrow_mut()
            .emit(Event::RegisterDbus(RegisterDbusEvent {
                server: Rc::clone(&server),
                object,
            }))
            .with_context(|| format!("register mount point {name}"))?;
        info!(name = %name, "mount point ready");
    }

    tokio::task::spawn_local(monitor::run_sysfs_monitor(
        Rc::clone(&monitor),
        DEVICE_POLL_PERIOD,
    ));
    tokio::task::spawn_local(async move {
        while let Some(signal) = completions.recv().await {
            info!(
                path = %signal.path,
                interface = %signal.interface,
                errno = signal.errno,
                "completion signal"
            );
        }
    });

    match signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(err) => warn!(%err, "ctrl-c listener failed"),
    }
    Ok(())
}
