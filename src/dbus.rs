// Thunderbolt/USB4 peripheral authorization daemon
//
// Copyright (C) 2025, Intel Corporation
// Author: Mika Westerberg <mika.westerberg@linux.intel.com>

//! D-Bus façade publishing the manager and the device objects.
//!
//! The interfaces never touch the device set directly. Method handlers send [`Command`]s to the
//! main loop and wait for the reply; properties are served from a per-object [`Device`]
//! snapshot that [`publish()`] refreshes whenever the manager reports a change. Keeping the
//! properties local means emitting a property-changed signal never has to call back into the
//! main loop.

use log::warn;
use tokio::sync::{mpsc, oneshot};
use zbus::object_server::SignalEmitter;
use zbus::zvariant::{ObjectPath, OwnedObjectPath};
use zbus::{fdo, Connection};
use zbus_macros::interface;

use crate::{
    error::Result,
    manager::{Manager, Notification},
    Device, Policy,
};

/// Well-known bus name of the daemon.
pub const BUS_NAME: &str = "com.intel.Tbauthd";
/// Object path of the manager.
pub const MANAGER_PATH: &str = "/com/intel/tbauthd";

/// Requests routed from bus handlers to the main loop.
#[derive(Debug)]
pub enum Command {
    ListDevices(oneshot::Sender<Vec<String>>),
    Authorize(String, oneshot::Sender<Result<()>>),
    Enroll(String, Policy, oneshot::Sender<Result<()>>),
    Forget(String, oneshot::Sender<Result<()>>),
}

type CommandSender = mpsc::UnboundedSender<Command>;

async fn request<T>(
    commands: &CommandSender,
    make: impl FnOnce(oneshot::Sender<T>) -> Command,
) -> fdo::Result<T> {
    let (tx, rx) = oneshot::channel();

    commands
        .send(make(tx))
        .map_err(|_| fdo::Error::Failed(String::from("manager is gone")))?;

    rx.await
        .map_err(|_| fdo::Error::Failed(String::from("manager dropped the request")))
}

/// Runs one command against the manager. Called from the main loop.
pub fn dispatch(manager: &mut Manager, command: Command) {
    match command {
        Command::ListDevices(reply) => {
            let uids = manager
                .devices()
                .iter()
                .map(|d| d.uid().to_string())
                .collect();
            let _ = reply.send(uids);
        }
        Command::Authorize(uid, reply) => {
            let _ = reply.send(manager.authorize(&uid));
        }
        Command::Enroll(uid, policy, reply) => {
            let _ = reply.send(manager.enroll(&uid, policy));
        }
        Command::Forget(uid, reply) => {
            let _ = reply.send(manager.forget(&uid));
        }
    }
}

fn object_path(uid: &str) -> fdo::Result<OwnedObjectPath> {
    ObjectPath::try_from(crate::object_path_for_uid(uid))
        .map(OwnedObjectPath::from)
        .map_err(|err| fdo::Error::Failed(err.to_string()))
}

/// The `com.intel.tbauthd.Manager` interface.
pub struct ManagerIface {
    commands: CommandSender,
}

impl ManagerIface {
    pub fn new(commands: CommandSender) -> Self {
        ManagerIface { commands }
    }
}

#[interface(name = "com.intel.tbauthd.Manager")]
impl ManagerIface {
    /// Object paths of all known devices.
    async fn list_devices(&self) -> fdo::Result<Vec<OwnedObjectPath>> {
        let uids = request(&self.commands, Command::ListDevices).await?;

        uids.iter().map(|uid| object_path(uid)).collect()
    }

    #[zbus(property)]
    fn version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    #[zbus(signal)]
    pub async fn device_added(
        emitter: &SignalEmitter<'_>,
        device: OwnedObjectPath,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn device_removed(
        emitter: &SignalEmitter<'_>,
        device: OwnedObjectPath,
    ) -> zbus::Result<()>;
}

/// The `com.intel.tbauthd.Device` interface, one object per uid.
pub struct DeviceIface {
    device: Device,
    commands: CommandSender,
}

impl DeviceIface {
    pub fn new(device: Device, commands: CommandSender) -> Self {
        DeviceIface { device, commands }
    }

    fn update(&mut self, device: Device) {
        self.device = device;
    }
}

#[interface(name = "com.intel.tbauthd.Device")]
impl DeviceIface {
    /// Starts authorization of the device. Completion is reported through the Status property.
    async fn authorize(&self) -> fdo::Result<()> {
        request(&self.commands, |tx| {
            Command::Authorize(self.device.uid().to_string(), tx)
        })
        .await??;
        Ok(())
    }

    /// Persists the device in the enrollment store with the given policy and authorizes it.
    async fn enroll(&self, policy: &str) -> fdo::Result<()> {
        let policy: Policy = policy.parse()?;

        request(&self.commands, |tx| {
            Command::Enroll(self.device.uid().to_string(), policy, tx)
        })
        .await??;
        Ok(())
    }

    /// Drops the device from the enrollment store.
    async fn forget(&self) -> fdo::Result<()> {
        request(&self.commands, |tx| {
            Command::Forget(self.device.uid().to_string(), tx)
        })
        .await??;
        Ok(())
    }

    #[zbus(property)]
    fn uid(&self) -> String {
        self.device.uid().to_string()
    }

    #[zbus(property)]
    fn name(&self) -> String {
        self.device.name().to_string()
    }

    #[zbus(property)]
    fn vendor(&self) -> String {
        self.device.vendor().to_string()
    }

    #[zbus(property)]
    fn status(&self) -> String {
        self.device.status().to_string()
    }

    #[zbus(property)]
    fn policy(&self) -> String {
        self.device.policy().to_string()
    }

    #[zbus(property)]
    fn stored(&self) -> bool {
        self.device.stored()
    }

    #[zbus(property)]
    fn syspath(&self) -> String {
        self.device
            .syspath()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    }

    #[zbus(property)]
    fn security(&self) -> String {
        self.device.security().to_string()
    }

    #[zbus(property)]
    fn parent(&self) -> String {
        self.device.parent_uid().unwrap_or_default().to_string()
    }
}

/// Connects to the bus, claims the well-known name and serves the manager object.
pub async fn connect(commands: CommandSender, system: bool) -> zbus::Result<Connection> {
    let builder = if system {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };

    builder
        .name(BUS_NAME)?
        .serve_at(MANAGER_PATH, ManagerIface::new(commands))?
        .build()
        .await
}

/// Publishes drained manager notifications onto the bus.
pub async fn publish(
    connection: &Connection,
    commands: &CommandSender,
    notifications: Vec<Notification>,
) -> zbus::Result<()> {
    let server = connection.object_server();

    for notification in notifications {
        match notification {
            Notification::DeviceAdded { device } => {
                let path = object_path(device.uid())?;
                server
                    .at(path.as_str(), DeviceIface::new(device, commands.clone()))
                    .await?;
                let manager = server.interface::<_, ManagerIface>(MANAGER_PATH).await?;
                ManagerIface::device_added(manager.signal_emitter(), path).await?;
            }
            Notification::DeviceRemoved { uid } => {
                let path = object_path(&uid)?;
                if !server.remove::<DeviceIface, _>(path.as_str()).await? {
                    warn!("{uid} had no bus object");
                }
                let manager = server.interface::<_, ManagerIface>(MANAGER_PATH).await?;
                ManagerIface::device_removed(manager.signal_emitter(), path).await?;
            }
            Notification::StatusChanged { device } => {
                let path = object_path(device.uid())?;
                if let Ok(iface) = server.interface::<_, DeviceIface>(path.as_str()).await {
                    let mut guard = iface.get_mut().await;
                    guard.update(device);
                    guard.status_changed(iface.signal_emitter()).await?;
                }
            }
            Notification::PolicyChanged { device } => {
                let path = object_path(device.uid())?;
                if let Ok(iface) = server.interface::<_, DeviceIface>(path.as_str()).await {
                    let mut guard = iface.get_mut().await;
                    guard.update(device);
                    guard.policy_changed(iface.signal_emitter()).await?;
                }
            }
            Notification::StoredChanged { device } => {
                let path = object_path(device.uid())?;
                if let Ok(iface) = server.interface::<_, DeviceIface>(path.as_str()).await {
                    let mut guard = iface.get_mut().await;
                    guard.update(device);
                    guard.stored_changed(iface.signal_emitter()).await?;
                }
            }
        }
    }

    Ok(())
}
