// Thunderbolt/USB4 peripheral authorization daemon
//
// Copyright (C) 2025, Intel Corporation
// Author: Mika Westerberg <mika.westerberg@linux.intel.com>

//! End-to-end scenarios against a faked sysfs tree and store directory.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use tbauthd::{
    manager::{Manager, Notification},
    monitor::{Action, Event},
    store::Store,
    sysfs::Sysfs,
    Error, KeyState, Policy, Status,
};

const HOST_UID: &str = "00000000-0000-0000-ffff-ffffffffffff";
const U1: &str = "11111111-1111-1111-ffff-ffffffffffff";
const U2: &str = "22222222-2222-2222-ffff-ffffffffffff";
const U3: &str = "33333333-3333-3333-ffff-ffffffffffff";

fn fake_root() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("sys/bus/thunderbolt/devices")).unwrap();

    let dmi = dir.path().join("sys/class/dmi/id");
    fs::create_dir_all(&dmi).unwrap();
    fs::write(dmi.join("sys_vendor"), "Dell Inc.\n").unwrap();
    fs::write(dmi.join("product_name"), "XPS 13\n").unwrap();

    dir
}

fn add_domain(root: &Path, security: &str) -> PathBuf {
    let domain = root.join("sys/bus/thunderbolt/devices/domain0");
    fs::create_dir_all(&domain).unwrap();
    fs::write(domain.join("security"), format!("{security}\n")).unwrap();
    fs::write(domain.join("uevent"), "DEVTYPE=thunderbolt_domain\n").unwrap();
    symlink(root.join("sys/bus/thunderbolt"), domain.join("subsystem")).unwrap();
    domain
}

fn add_device(parent: &Path, name: &str, uid: &str, authorized: &str) -> PathBuf {
    let node = parent.join(name);
    fs::create_dir_all(&node).unwrap();
    fs::write(node.join("unique_id"), format!("{uid}\n")).unwrap();
    fs::write(node.join("authorized"), format!("{authorized}\n")).unwrap();
    fs::write(node.join("vendor_name"), "Acme\n").unwrap();
    fs::write(node.join("device_name"), "Dock\n").unwrap();
    fs::write(node.join("generation"), "3\n").unwrap();
    node
}

fn manager_for(root: &TempDir) -> Manager {
    Manager::new(
        Sysfs::with_root(root.path()),
        Store::new(root.path().join("var/lib/tbauthd")),
    )
}

fn store_for(root: &TempDir) -> Store {
    Store::new(root.path().join("var/lib/tbauthd"))
}

fn event(action: Action, node: &Path, uid: Option<&str>) -> Event {
    let syspath = fs::canonicalize(node).unwrap();
    Event {
        action,
        sysname: syspath
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap()
            .to_string(),
        syspath,
        uid: uid.map(String::from),
    }
}

fn add_event(node: &Path, uid: &str) -> Event {
    event(Action::Add, node, Some(uid))
}

fn remove_event(node: &Path) -> Event {
    event(Action::Remove, node, None)
}

fn drain_auth(manager: &mut Manager) {
    while manager.has_pending_auth() {
        manager.process_next_auth();
    }
}

fn read(node: &Path, attr: &str) -> String {
    fs::read_to_string(node.join(attr))
        .unwrap()
        .trim_end()
        .to_string()
}

#[test]
fn first_seen_device_waits_for_the_user() {
    let root = fake_root();
    let domain = add_domain(root.path(), "user");
    let host = add_device(&domain, "0-0", HOST_UID, "1");
    let mut manager = manager_for(&root);
    manager.start().unwrap();
    manager.take_notifications();

    let node = add_device(&host, "0-1", U1, "0");
    manager.handle_uevent(&add_event(&node, U1));

    let device = manager.device_by_uid(U1).unwrap();
    assert_eq!(device.status(), Status::Connected);
    assert_eq!(device.policy(), Policy::Default);
    assert!(!device.stored());
    assert_eq!(device.parent_uid(), Some(HOST_UID));

    // Nothing was scheduled, nothing was written.
    assert!(!manager.has_pending_auth());
    assert_eq!(read(&node, "authorized"), "0");

    let notifications = manager.take_notifications();
    assert_eq!(notifications.len(), 1);
    assert!(matches!(
        &notifications[0],
        Notification::DeviceAdded { device } if device.uid() == U1
    ));
}

#[test]
fn enroll_then_reconnect_authorizes_automatically() {
    let root = fake_root();
    let domain = add_domain(root.path(), "user");
    let host = add_device(&domain, "0-0", HOST_UID, "1");
    let node = add_device(&host, "0-1", U1, "0");
    let mut manager = manager_for(&root);
    manager.start().unwrap();

    manager.enroll(U1, Policy::Auto).unwrap();
    assert!(manager.has_pending_auth());
    drain_auth(&mut manager);

    assert_eq!(read(&node, "authorized"), "1");
    assert_eq!(manager.device_by_uid(U1).unwrap().status(), Status::Authorized);
    assert_eq!(store_for(&root).get(U1).unwrap().policy(), Policy::Auto);

    // Unplug. The device stays around because it is enrolled.
    manager.handle_uevent(&remove_event(&node));
    let device = manager.device_by_uid(U1).unwrap();
    assert_eq!(device.status(), Status::Disconnected);
    assert!(device.stored());
    assert_eq!(device.policy(), Policy::Auto);

    // Plug back in; no user action needed this time.
    fs::write(node.join("authorized"), "0\n").unwrap();
    manager.handle_uevent(&add_event(&node, U1));
    assert_eq!(manager.device_by_uid(U1).unwrap().status(), Status::Connected);
    drain_auth(&mut manager);

    assert_eq!(read(&node, "authorized"), "1");
    assert_eq!(manager.device_by_uid(U1).unwrap().status(), Status::Authorized);
}

#[test]
fn secure_enrollment_establishes_a_key() {
    let root = fake_root();
    let domain = add_domain(root.path(), "secure");
    let host = add_device(&domain, "0-0", HOST_UID, "1");
    let node = add_device(&host, "0-1", U2, "0");
    let mut manager = manager_for(&root);
    manager.start().unwrap();

    manager.enroll(U2, Policy::Auto).unwrap();
    drain_auth(&mut manager);

    let store = store_for(&root);
    assert!(store.has_key(U2));
    let key = store.load_key(U2).unwrap();

    assert_eq!(read(&node, "key"), key.to_string());
    assert_eq!(read(&node, "authorized"), "1");
    let device = manager.device_by_uid(U2).unwrap();
    assert_eq!(device.status(), Status::AuthorizedSecure);
    assert_eq!(device.key_state(), KeyState::Stored);
}

#[test]
fn secure_reconnect_challenges_with_the_stored_key() {
    let root = fake_root();
    let domain = add_domain(root.path(), "secure");
    let host = add_device(&domain, "0-0", HOST_UID, "1");
    let node = add_device(&host, "0-1", U2, "0");
    let mut manager = manager_for(&root);
    manager.start().unwrap();

    manager.enroll(U2, Policy::Auto).unwrap();
    drain_auth(&mut manager);
    let store = store_for(&root);
    let key = store.load_key(U2).unwrap();

    // Unplug and forget everything connection scoped.
    manager.handle_uevent(&remove_event(&node));
    fs::write(node.join("authorized"), "0\n").unwrap();
    fs::remove_file(node.join("key")).unwrap();

    manager.handle_uevent(&add_event(&node, U2));
    let device = manager.device_by_uid(U2).unwrap();
    assert_eq!(device.key_state(), KeyState::Stored);
    drain_auth(&mut manager);

    // The stored key is challenged, not regenerated.
    assert_eq!(read(&node, "authorized"), "2");
    assert_eq!(store.load_key(U2).unwrap(), key);
    assert_eq!(
        manager.device_by_uid(U2).unwrap().status(),
        Status::AuthorizedSecure
    );
}

#[test]
fn authorization_cascades_down_the_chain() {
    let root = fake_root();
    let domain = add_domain(root.path(), "user");
    let host = add_device(&domain, "0-0", HOST_UID, "1");
    let parent = add_device(&host, "0-1", U1, "0");
    let child = add_device(&parent, "0-301", U3, "0");
    let mut manager = manager_for(&root);
    manager.start().unwrap();

    assert_eq!(manager.device_by_uid(U3).unwrap().parent_uid(), Some(U1));

    // Enrolling the child first goes nowhere: the parent is not authorized, so no write may
    // happen.
    manager.enroll(U3, Policy::Auto).unwrap();
    drain_auth(&mut manager);
    assert_eq!(read(&child, "authorized"), "0");
    assert_eq!(manager.device_by_uid(U3).unwrap().status(), Status::Connected);

    // Authorizing the parent pulls the child along.
    manager.enroll(U1, Policy::Auto).unwrap();
    drain_auth(&mut manager);

    assert_eq!(read(&parent, "authorized"), "1");
    assert_eq!(read(&child, "authorized"), "1");
    assert_eq!(manager.device_by_uid(U1).unwrap().status(), Status::Authorized);
    assert_eq!(manager.device_by_uid(U3).unwrap().status(), Status::Authorized);
}

#[test]
fn forget_evicts_an_unplugged_device() {
    let root = fake_root();
    let domain = add_domain(root.path(), "user");
    let host = add_device(&domain, "0-0", HOST_UID, "1");
    let node = add_device(&host, "0-1", U3, "0");
    let mut manager = manager_for(&root);
    manager.start().unwrap();

    manager.enroll(U3, Policy::Auto).unwrap();
    drain_auth(&mut manager);
    manager.handle_uevent(&remove_event(&node));
    assert_eq!(manager.device_by_uid(U3).unwrap().status(), Status::Disconnected);
    manager.take_notifications();

    manager.forget(U3).unwrap();

    assert!(manager.device_by_uid(U3).is_none());
    assert!(store_for(&root).list().unwrap().is_empty());
    assert_eq!(
        manager.take_notifications(),
        vec![Notification::DeviceRemoved { uid: U3.into() }]
    );
}

#[test]
fn duplicate_add_events_are_idempotent() {
    let root = fake_root();
    let domain = add_domain(root.path(), "user");
    let host = add_device(&domain, "0-0", HOST_UID, "1");
    let node = add_device(&host, "0-1", U1, "0");
    let mut manager = manager_for(&root);
    manager.start().unwrap();
    manager.take_notifications();

    manager.handle_uevent(&add_event(&node, U1));
    manager.handle_uevent(&add_event(&node, U1));

    let matching = manager
        .devices()
        .iter()
        .filter(|d| d.uid() == U1)
        .count();
    assert_eq!(matching, 1);
    assert_eq!(manager.device_by_uid(U1).unwrap().status(), Status::Connected);
    // The duplicate did not produce another DeviceAdded.
    assert!(manager
        .take_notifications()
        .iter()
        .all(|n| !matches!(n, Notification::DeviceAdded { .. })));
}

#[test]
fn manual_policy_waits_on_reconnect() {
    let root = fake_root();
    let domain = add_domain(root.path(), "user");
    let host = add_device(&domain, "0-0", HOST_UID, "1");
    let node = add_device(&host, "0-1", U1, "0");
    let mut manager = manager_for(&root);
    manager.start().unwrap();

    // Enrollment itself is a user action and authorizes.
    manager.enroll(U1, Policy::Manual).unwrap();
    drain_auth(&mut manager);
    assert_eq!(read(&node, "authorized"), "1");

    manager.handle_uevent(&remove_event(&node));
    fs::write(node.join("authorized"), "0\n").unwrap();
    manager.handle_uevent(&add_event(&node, U1));

    // Manual means exactly that.
    assert!(!manager.has_pending_auth());
    assert_eq!(read(&node, "authorized"), "0");
    assert_eq!(manager.device_by_uid(U1).unwrap().status(), Status::Connected);
}

#[test]
fn user_can_authorize_without_enrolling() {
    let root = fake_root();
    let domain = add_domain(root.path(), "user");
    let host = add_device(&domain, "0-0", HOST_UID, "1");
    let node = add_device(&host, "0-1", U1, "0");
    let mut manager = manager_for(&root);
    manager.start().unwrap();

    manager.authorize(U1).unwrap();
    drain_auth(&mut manager);

    assert_eq!(read(&node, "authorized"), "1");
    let device = manager.device_by_uid(U1).unwrap();
    assert_eq!(device.status(), Status::Authorized);
    assert!(!device.stored());
    assert!(store_for(&root).list().unwrap().is_empty());
}

#[test]
fn enrollment_fills_a_boot_acl_slot() {
    let root = fake_root();
    let domain = add_domain(root.path(), "user");
    fs::write(domain.join("boot_acl"), ",,,\n").unwrap();
    let host = add_device(&domain, "0-0", HOST_UID, "1");
    let node = add_device(&host, "0-1", U1, "0");
    let mut manager = manager_for(&root);
    manager.start().unwrap();

    manager.enroll(U1, Policy::Auto).unwrap();
    drain_auth(&mut manager);
    assert_eq!(read(&domain, "boot_acl"), format!("{U1},,,"));

    // Forgetting while still plugged in clears the slot but keeps the device.
    manager.forget(U1).unwrap();
    assert_eq!(read(&domain, "boot_acl"), ",,,");
    let device = manager.device_by_uid(U1).unwrap();
    assert!(!device.stored());
    assert!(device.syspath().is_some());
    let _ = node;
}

#[test]
fn startup_attaches_enrolled_devices() {
    let root = fake_root();
    let domain = add_domain(root.path(), "user");
    let host = add_device(&domain, "0-0", HOST_UID, "1");
    let node = add_device(&host, "0-1", U1, "0");

    // First life: enroll.
    let mut manager = manager_for(&root);
    manager.start().unwrap();
    manager.enroll(U1, Policy::Auto).unwrap();
    drain_auth(&mut manager);
    drop(manager);

    // Second life: the stored record is loaded, the node is attached and authorization happens
    // without any user action.
    fs::write(node.join("authorized"), "0\n").unwrap();
    let mut manager = manager_for(&root);
    manager.start().unwrap();
    drain_auth(&mut manager);

    assert_eq!(read(&node, "authorized"), "1");
    let device = manager.device_by_uid(U1).unwrap();
    assert_eq!(device.status(), Status::Authorized);
    assert!(device.stored());
}

#[test]
fn bad_arguments_are_rejected() {
    let root = fake_root();
    add_domain(root.path(), "user");
    let mut manager = manager_for(&root);
    manager.start().unwrap();

    assert!(matches!(
        manager.enroll("not-a-uuid", Policy::Auto),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        manager.authorize("also bogus"),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(manager.forget(U1), Err(Error::NotFound(_))));
}
