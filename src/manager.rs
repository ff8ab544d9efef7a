// Thunderbolt/USB4 peripheral authorization daemon
//
// Copyright (C) 2025, Intel Corporation
// Author: Mika Westerberg <mika.westerberg@linux.intel.com>

//! The reconciliation loop tying sysfs, uevents and the enrollment store together.

use std::collections::VecDeque;
use std::path::Path;

use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    key::Key,
    monitor::{Action, Event},
    nhi,
    store::Store,
    sysfs::{self, Sysfs},
    AuthKey, Device, KeyState, Policy, SecurityLevel, Status,
};

/// What caused an authorization to be scheduled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuthTrigger {
    /// Auto policy on an enrolled device.
    Auto,
    /// Explicit user request.
    User,
}

/// State change notifications consumed by the bus façade.
///
/// The variants carry a snapshot of the device so publishing them never has to reach back into
/// the manager.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Notification {
    DeviceAdded { device: Device },
    DeviceRemoved { uid: String },
    StatusChanged { device: Device },
    PolicyChanged { device: Device },
    StoredChanged { device: Device },
}

/// Owns the device set and reconciles kernel events with the enrollment store.
///
/// The manager runs on the main loop and is never shared; the bus façade talks to it through a
/// command channel and reads back [`Notification`]s.
pub struct Manager {
    sysfs: Sysfs,
    store: Store,
    devices: Vec<Device>,
    pending_auth: VecDeque<(String, AuthTrigger)>,
    notifications: VecDeque<Notification>,
}

/// Caller supplied uids must be well formed UUIDs.
fn validate_uid(uid: &str) -> Result<()> {
    Uuid::parse_str(uid)
        .map(|_| ())
        .map_err(|_| Error::InvalidArgument(format!("bad uid {uid:?}")))
}

impl Manager {
    pub fn new(sysfs: Sysfs, store: Store) -> Self {
        Manager {
            sysfs,
            store,
            devices: Vec::new(),
            pending_auth: VecDeque::new(),
            notifications: VecDeque::new(),
        }
    }

    /// Loads enrolled devices from the store and attaches everything currently in sysfs.
    ///
    /// A stored record that fails to load is skipped with a warning; startup continues.
    pub fn start(&mut self) -> Result<()> {
        for uid in self.store.list()? {
            match self.store.get(&uid) {
                Ok(device) => {
                    debug!("loaded enrolled device {uid}");
                    // Enrolled devices get a bus object even while unplugged.
                    self.notify(Notification::DeviceAdded {
                        device: device.clone(),
                    });
                    self.devices.push(device);
                }
                Err(err) => warn!("skipping enrolled device {uid}: {err}"),
            }
        }

        match self.sysfs.count_hosts() {
            Ok(hosts) => info!("{hosts} Thunderbolt host(s) active"),
            Err(err) => warn!("host enumeration failed: {err}"),
        }

        for node in self.sysfs.enumerate()? {
            let sysname = node
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            let uid = match sysfs::read_attr(&node, "unique_id") {
                Ok(uid) => uid,
                Err(err) => {
                    warn!("{sysname}: {err}");
                    continue;
                }
            };
            self.handle_uevent(&Event {
                action: Action::Add,
                syspath: node,
                sysname,
                uid: Some(uid),
            });
        }

        Ok(())
    }

    /// Dispatches one uevent. Failures are contained here; the loop goes on.
    pub fn handle_uevent(&mut self, event: &Event) {
        let result = match event.action {
            Action::Add | Action::Change => self.add_or_change(event),
            Action::Remove => self.remove(event),
        };

        if let Err(err) = result {
            error!("{} {}: {}", event.action, event.sysname, err);
        }
    }

    fn add_or_change(&mut self, event: &Event) -> Result<()> {
        let Some(uid) = event.uid.clone() else {
            return Ok(());
        };

        match self.device_index_by_uid(&uid) {
            None => self.device_added(&event.syspath, &uid),
            Some(index) if self.devices[index].syspath().is_none() => {
                self.device_attached(index, &event.syspath)
            }
            Some(index) => self.device_changed(index),
        }
    }

    fn remove(&mut self, event: &Event) -> Result<()> {
        let Some(index) = self.device_index_by_syspath(&event.syspath) else {
            debug!("remove for unknown {}", event.syspath.display());
            return Ok(());
        };

        if self.devices[index].stored() {
            self.device_detached(index)
        } else {
            self.device_removed(index)
        }
    }

    fn device_added(&mut self, node: &Path, uid: &str) -> Result<()> {
        let mut device = Device::new_from_sysfs(&self.sysfs, node)?;
        device.set_parent_uid(self.parent_uid_for(node));

        info!("device added: {} {} ({})", uid, device.name(), device.status());
        self.notify(Notification::DeviceAdded {
            device: device.clone(),
        });
        self.devices.push(device);
        self.maybe_auto_authorize(uid);

        Ok(())
    }

    fn device_attached(&mut self, index: usize, node: &Path) -> Result<()> {
        let parent_uid = self.parent_uid_for(node);
        let device = &mut self.devices[index];

        device.connected(&self.sysfs, node)?;
        device.set_parent_uid(parent_uid);
        let uid = device.uid().to_string();
        let snapshot = device.clone();

        info!("device attached: {} ({})", uid, snapshot.status());
        self.notify(Notification::StatusChanged { device: snapshot });
        self.maybe_auto_authorize(&uid);

        Ok(())
    }

    fn device_changed(&mut self, index: usize) -> Result<()> {
        let device = &mut self.devices[index];
        let uid = device.uid().to_string();
        let old = device.status();
        let status = device.update_from_sysfs()?;

        if status != old {
            debug!("device changed: {uid} {old} -> {status}");
            let snapshot = self.devices[index].clone();
            self.notify(Notification::StatusChanged { device: snapshot });
        }
        if !old.is_authorized() && status.is_authorized() {
            self.cascade_children(&uid);
        }

        Ok(())
    }

    fn device_detached(&mut self, index: usize) -> Result<()> {
        let device = &mut self.devices[index];
        device.disconnected();
        let snapshot = device.clone();

        info!("device detached: {}", snapshot.uid());
        self.notify(Notification::StatusChanged { device: snapshot });

        Ok(())
    }

    fn device_removed(&mut self, index: usize) -> Result<()> {
        let device = self.devices.remove(index);
        let uid = device.uid().to_string();

        info!("device removed: {uid}");
        self.notify(Notification::DeviceRemoved { uid });

        Ok(())
    }

    /// Once a device authorizes, its enrolled children become eligible.
    fn cascade_children(&mut self, parent_uid: &str) {
        let children: Vec<String> = self
            .devices
            .iter()
            .filter(|d| d.parent_uid() == Some(parent_uid))
            .map(|d| d.uid().to_string())
            .collect();

        for child in children {
            self.maybe_auto_authorize(&child);
        }
    }

    /// Schedules authorization if the device satisfies the auto rule: enrolled, Auto policy,
    /// currently connected and the parent (when there is one) already authorized.
    fn maybe_auto_authorize(&mut self, uid: &str) {
        let Some(device) = self.device_by_uid(uid) else {
            return;
        };
        if !device.stored() || device.policy() != Policy::Auto {
            return;
        }
        if device.status() != Status::Connected {
            return;
        }
        if !self.parent_authorized(device) {
            debug!("{uid}: waiting for parent authorization");
            return;
        }

        self.schedule_auth(uid, AuthTrigger::Auto);
    }

    fn parent_authorized(&self, device: &Device) -> bool {
        match device.parent_uid() {
            // Directly below the host domain.
            None => true,
            Some(parent) => self
                .device_by_uid(parent)
                .map(|p| p.status().is_authorized())
                .unwrap_or(false),
        }
    }

    /// Queues an authorization for an idle turn of the main loop. Dispatch must not block on
    /// sysfs writes.
    fn schedule_auth(&mut self, uid: &str, trigger: AuthTrigger) {
        if self.pending_auth.iter().any(|(queued, _)| queued == uid) {
            return;
        }
        debug!("scheduling authorization of {uid} ({trigger:?})");
        self.pending_auth.push_back((uid.to_string(), trigger));
    }

    /// Returns `true` while deferred authorizations are queued.
    pub fn has_pending_auth(&self) -> bool {
        !self.pending_auth.is_empty()
    }

    /// Runs one deferred authorization.
    pub fn process_next_auth(&mut self) {
        let Some((uid, trigger)) = self.pending_auth.pop_front() else {
            return;
        };

        if let Err(err) = self.run_authorize(&uid, trigger) {
            warn!("authorization of {uid} failed: {err}");
        }
    }

    fn run_authorize(&mut self, uid: &str, trigger: AuthTrigger) -> Result<()> {
        let Some(index) = self.device_index_by_uid(uid) else {
            debug!("{uid}: gone before authorization");
            return Ok(());
        };

        // Events may have come in since this was scheduled; check the rules against the current
        // state before touching sysfs.
        {
            let device = &self.devices[index];
            let eligible = match device.status() {
                Status::Connected => true,
                Status::AuthError => trigger == AuthTrigger::User,
                status => {
                    debug!("{uid}: skipping authorization ({status})");
                    false
                }
            };
            if !eligible {
                return Ok(());
            }
            if trigger == AuthTrigger::Auto
                && (!device.stored() || device.policy() != Policy::Auto)
            {
                return Ok(());
            }
            if !self.parent_authorized(device) {
                debug!("{uid}: parent not authorized, not writing");
                return Ok(());
            }
        }

        let auth_key = self.auth_key_for(index)?;
        let result = self.devices[index].authorize(auth_key.as_ref());

        match result {
            Ok(status) => {
                info!("{uid}: {status}");
                if let Some(AuthKey::New(key)) = &auth_key {
                    if self.devices[index].stored() {
                        match self.store.put_key(uid, key) {
                            Ok(()) => self.devices[index].set_key_state(KeyState::Stored),
                            Err(err) => warn!("{uid}: failed to persist key: {err}"),
                        }
                    }
                }
                let snapshot = self.devices[index].clone();
                self.notify(Notification::StatusChanged { device: snapshot });
                self.cascade_children(uid);
                Ok(())
            }
            Err(err) => {
                let snapshot = self.devices[index].clone();
                self.notify(Notification::StatusChanged { device: snapshot });
                Err(err)
            }
        }
    }

    fn auth_key_for(&self, index: usize) -> Result<Option<AuthKey>> {
        let device = &self.devices[index];
        if device.security() != SecurityLevel::Secure {
            return Ok(None);
        }

        let uid = device.uid();
        if self.store.has_key(uid) {
            Ok(Some(AuthKey::Stored(self.store.load_key(uid)?)))
        } else {
            Ok(Some(AuthKey::New(Key::generate())))
        }
    }

    /// Enrolls the device into the store with `policy` and authorizes it when connected.
    pub fn enroll(&mut self, uid: &str, policy: Policy) -> Result<()> {
        validate_uid(uid)?;
        let index = self
            .device_index_by_uid(uid)
            .ok_or_else(|| Error::NotFound(uid.to_string()))?;

        let was_stored = self.devices[index].stored();
        {
            let device = &mut self.devices[index];
            device.set_policy(policy);
            device.set_stored(true);
        }
        if let Err(err) = self.store.put(&self.devices[index]) {
            self.devices[index].set_stored(was_stored);
            return Err(err);
        }

        info!("enrolled {uid} with policy {policy}");
        if self.devices[index].is_host() {
            self.warn_unstable_host(index);
        }
        let snapshot = self.devices[index].clone();
        if !was_stored {
            self.notify(Notification::StoredChanged {
                device: snapshot.clone(),
            });
        }
        self.notify(Notification::PolicyChanged { device: snapshot });
        self.boot_acl_add(index);

        match self.devices[index].status() {
            Status::Connected | Status::AuthError => self.schedule_auth(uid, AuthTrigger::User),
            _ => (),
        }

        Ok(())
    }

    /// Removes the device from the store. A disconnected device is evicted from the set.
    pub fn forget(&mut self, uid: &str) -> Result<()> {
        validate_uid(uid)?;
        let index = self
            .device_index_by_uid(uid)
            .ok_or_else(|| Error::NotFound(uid.to_string()))?;
        if !self.devices[index].stored() {
            return Err(Error::NotFound(format!("{uid} is not enrolled")));
        }

        self.store.delete(uid)?;
        self.boot_acl_remove(index);

        let disconnected = {
            let device = &mut self.devices[index];
            device.set_stored(false);
            device.set_key_state(KeyState::None);
            device.syspath().is_none()
        };
        info!("forgot {uid}");

        if disconnected {
            self.devices.remove(index);
            self.notify(Notification::DeviceRemoved {
                uid: uid.to_string(),
            });
        } else {
            let snapshot = self.devices[index].clone();
            self.notify(Notification::StoredChanged { device: snapshot });
        }

        Ok(())
    }

    /// Schedules authorization of a connected device on user request.
    ///
    /// Completion shows up as a status change.
    pub fn authorize(&mut self, uid: &str) -> Result<()> {
        validate_uid(uid)?;
        let device = self
            .device_by_uid(uid)
            .ok_or_else(|| Error::NotFound(uid.to_string()))?;

        match device.status() {
            Status::Connected | Status::AuthError => (),
            Status::Disconnected => {
                return Err(Error::Auth(format!("{uid} is not connected")));
            }
            status if status.is_authorized() => {
                return Err(Error::Auth(format!("{uid} is already authorized")));
            }
            status => {
                return Err(Error::Auth(format!("{uid} is busy ({status})")));
            }
        }
        if !self.parent_authorized(device) {
            return Err(Error::Auth(format!("parent of {uid} is not authorized")));
        }

        self.schedule_auth(uid, AuthTrigger::User);
        Ok(())
    }

    fn warn_unstable_host(&self, index: usize) {
        let device = &self.devices[index];
        let Some(node) = device.syspath() else {
            return;
        };
        let Some(domain) = sysfs::domain_of(node) else {
            return;
        };

        match sysfs::nhi_pci_id(&domain).and_then(nhi::uuid_stable) {
            Ok(true) => (),
            Ok(false) => warn!(
                "{}: host uid does not survive reboots, expect re-enrollment",
                device.uid()
            ),
            Err(err) => {
                debug!("{err}");
                warn!(
                    "{}: unknown NHI, assuming host uid does not survive reboots",
                    device.uid()
                );
            }
        }
    }

    /// Places the uid into the first free boot ACL slot of its domain.
    fn boot_acl_add(&self, index: usize) {
        let device = &self.devices[index];
        if device.is_host() {
            return;
        }
        let uid = device.uid().to_string();
        let Some(node) = device.syspath() else {
            return;
        };
        let Some(domain) = sysfs::domain_of(node) else {
            return;
        };

        match sysfs::read_boot_acl(&domain) {
            Ok(Some(mut slots)) => {
                if slots.iter().any(|slot| *slot == uid) {
                    return;
                }
                match slots.iter().position(String::is_empty) {
                    Some(free) => {
                        slots[free] = uid;
                        if let Err(err) = sysfs::write_boot_acl(&domain, &slots) {
                            warn!("boot ACL update failed: {err}");
                        }
                    }
                    None => warn!("boot ACL of {} is full", domain.display()),
                }
            }
            // The domain does not do pre-boot authorization.
            Ok(None) => (),
            Err(err) => warn!("boot ACL read failed: {err}"),
        }
    }

    /// Clears the uid from the boot ACL of its domain.
    fn boot_acl_remove(&self, index: usize) {
        let device = &self.devices[index];
        let uid = device.uid();
        let Some(node) = device.syspath() else {
            return;
        };
        let Some(domain) = sysfs::domain_of(node) else {
            return;
        };

        match sysfs::read_boot_acl(&domain) {
            Ok(Some(mut slots)) => {
                if let Some(slot) = slots.iter().position(|slot| slot == uid) {
                    slots[slot] = String::new();
                    if let Err(err) = sysfs::write_boot_acl(&domain, &slots) {
                        warn!("boot ACL update failed: {err}");
                    }
                }
            }
            Ok(None) => (),
            Err(err) => warn!("boot ACL read failed: {err}"),
        }
    }

    /// All known devices, connected or not.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Returns the device with the given uid.
    pub fn device_by_uid(&self, uid: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.uid() == uid)
    }

    fn device_index_by_uid(&self, uid: &str) -> Option<usize> {
        self.devices.iter().position(|d| d.uid() == uid)
    }

    fn device_index_by_syspath(&self, syspath: &Path) -> Option<usize> {
        self.devices
            .iter()
            .position(|d| d.syspath() == Some(syspath))
    }

    /// The parent is the device one path segment above in sysfs. No match means the device sits
    /// directly below the host domain.
    fn parent_uid_for(&self, node: &Path) -> Option<String> {
        let parent = node.parent()?;
        self.devices
            .iter()
            .find(|d| d.syspath() == Some(parent))
            .map(|d| d.uid().to_string())
    }

    /// Drains queued bus notifications.
    pub fn take_notifications(&mut self) -> Vec<Notification> {
        self.notifications.drain(..).collect()
    }

    fn notify(&mut self, notification: Notification) {
        self.notifications.push_back(notification);
    }
}
