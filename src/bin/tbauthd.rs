// Thunderbolt/USB4 peripheral authorization daemon
//
// Copyright (C) 2025, Intel Corporation
// Author: Mika Westerberg <mika.westerberg@linux.intel.com>

use std::error::Error;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use log::{error, info, warn};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use tbauthd::{
    dbus,
    manager::Manager,
    monitor::{KernelMonitor, Monitor},
    store::Store,
    sysfs::Sysfs,
};

#[derive(Parser, Debug)]
#[command(version)]
#[command(about = "Thunderbolt/USB4 peripheral authorization daemon", long_about = None)]
struct Args {
    /// Enrollment store directory
    #[arg(long, default_value = "/var/lib/tbauthd")]
    store: PathBuf,
    /// Connect to the session bus instead of the system bus
    #[arg(long)]
    session_bus: bool,
    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let mut manager = Manager::new(Sysfs::new(), Store::new(&args.store));

    // Both hot-plug channels come up before the initial scan so nothing is missed in between.
    let mut monitor = Monitor::new()?;
    let mut kernel = KernelMonitor::new()?;

    let (commands_tx, mut commands_rx) = mpsc::unbounded_channel();
    let connection = dbus::connect(commands_tx.clone(), !args.session_bus).await?;

    manager.start()?;
    dbus::publish(&connection, &commands_tx, manager.take_notifications()).await?;

    let mut sigterm = signal(SignalKind::terminate())?;
    info!("ready");

    loop {
        // Bus traffic and uevents first; deferred authorizations run one per idle turn so that
        // sysfs writes never hold up dispatch.
        tokio::select! {
            biased;
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, exiting");
                break;
            }
            _ = sigterm.recv() => {
                info!("terminated, exiting");
                break;
            }
            command = commands_rx.recv() => {
                match command {
                    Some(command) => dbus::dispatch(&mut manager, command),
                    None => break,
                }
            }
            events = monitor.next_events() => {
                match events {
                    Ok(events) => {
                        for event in &events {
                            manager.handle_uevent(event);
                        }
                    }
                    Err(err) => {
                        error!("uevent monitor failed: {err}");
                        break;
                    }
                }
            }
            result = kernel.trace_next() => {
                if let Err(err) = result {
                    warn!("kernel uevent channel failed: {err}");
                }
            }
            _ = std::future::ready(()), if manager.has_pending_auth() => {
                manager.process_next_auth();
            }
        }

        if let Err(err) = dbus::publish(&connection, &commands_tx, manager.take_notifications()).await {
            warn!("bus publish failed: {err}");
        }
    }

    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();

    init_logging(args.verbose);

    if let Err(err) = run(args).await {
        error!("{err}");
        process::exit(1);
    }
}
