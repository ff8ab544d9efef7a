// Thunderbolt/USB4 peripheral authorization daemon
//
// Copyright (C) 2025, Intel Corporation
// Author: Mika Westerberg <mika.westerberg@linux.intel.com>

//! Access to the kernel Thunderbolt/USB4 sysfs hierarchy.
//!
//! Attributes are read and written as plain files below a device node so that tests can point
//! [`Sysfs`] at a faked tree instead of `/`.

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use lazy_static::lazy_static;
use log::debug;
use regex::Regex;

use crate::{
    error::{Error, Result},
    util, LinkSpeed, SecurityLevel,
};

lazy_static! {
    static ref SPEED_RE: Regex = Regex::new(r"(\d+).0 Gb/s").unwrap();
    static ref DOMAIN_RE: Regex = Regex::new(r"^domain\d+$").unwrap();
    static ref DEVICE_RE: Regex = Regex::new(r"^\d+-\d+$").unwrap();
    static ref HOST_RE: Regex = Regex::new(r"^\d+-0$").unwrap();
}

/// How many times a busy `authorized` write is retried.
const BUSY_RETRIES: u32 = 4;
/// Initial delay between busy retries. Doubles on every attempt.
const BUSY_DELAY: Duration = Duration::from_millis(50);

/// Reads a sysfs attribute of the device node, trimming the trailing newline.
///
/// A missing attribute is reported as a typed error; use [`read_attr_opt()`] for attributes
/// that may legitimately be absent.
pub fn read_attr(node: &Path, attr: &str) -> Result<String> {
    match fs::read_to_string(node.join(attr)) {
        Ok(value) => Ok(value.trim_end().to_string()),
        Err(err) if err.kind() == ErrorKind::NotFound => Err(Error::missing_attr(node, attr)),
        Err(err) => Err(Error::udev_io(node, attr, err)),
    }
}

/// Reads an attribute that may not exist. `Ok(None)` means the attribute is absent.
pub fn read_attr_opt(node: &Path, attr: &str) -> Result<Option<String>> {
    match fs::read_to_string(node.join(attr)) {
        Ok(value) => Ok(Some(value.trim_end().to_string())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(Error::udev_io(node, attr, err)),
    }
}

/// Writes a sysfs attribute of the device node.
pub fn write_attr(node: &Path, attr: &str, value: &str) -> Result<()> {
    fs::write(node.join(attr), value).map_err(|err| Error::udev_io(node, attr, err))
}

/// Writes an attribute, retrying with bounded backoff while the kernel reports `EBUSY`.
///
/// The connection manager rejects authorization writes with `EBUSY` while it is still probing
/// the device.
pub fn write_attr_busy_retry(node: &Path, attr: &str, value: &str) -> Result<()> {
    let mut delay = BUSY_DELAY;

    for attempt in 0.. {
        match fs::write(node.join(attr), value) {
            Ok(()) => return Ok(()),
            Err(err)
                if err.raw_os_error() == Some(nix::libc::EBUSY) && attempt < BUSY_RETRIES =>
            {
                debug!("{}: {} busy, retrying", node.display(), attr);
                thread::sleep(delay);
                delay *= 2;
            }
            Err(err) => return Err(Error::udev_io(node, attr, err)),
        }
    }

    unreachable!();
}

fn sysname(node: &Path) -> Option<&str> {
    node.file_name().and_then(OsStr::to_str)
}

/// Returns `true` if the node is a host router.
pub fn is_host(node: &Path) -> bool {
    sysname(node).map(|name| HOST_RE.is_match(name)).unwrap_or(false)
}

/// Returns the `DEVTYPE` of the node from its `uevent` attribute.
pub fn devtype(node: &Path) -> Option<String> {
    fs::read_to_string(node.join("uevent"))
        .ok()?
        .lines()
        .find_map(|line| line.strip_prefix("DEVTYPE=").map(String::from))
}

fn is_domain(node: &Path) -> bool {
    let Ok(subsystem) = fs::read_link(node.join("subsystem")) else {
        return false;
    };
    if !subsystem.ends_with("thunderbolt") {
        return false;
    }

    devtype(node).as_deref() == Some("thunderbolt_domain")
}

/// Walks up from `node` to the Thunderbolt domain it belongs to.
pub fn domain_of(node: &Path) -> Option<PathBuf> {
    let mut parent = node.parent();

    while let Some(dir) = parent {
        if is_domain(dir) {
            return Some(dir.to_path_buf());
        }
        parent = dir.parent();
    }

    None
}

/// Reads the security level of a domain.
pub fn security_of(domain: &Path) -> Result<SecurityLevel> {
    Ok(SecurityLevel::from(read_attr(domain, "security")?.as_str()))
}

/// Returns the PCI device id of the NHI behind the domain.
pub fn nhi_pci_id(domain: &Path) -> Result<u32> {
    let parent = domain
        .parent()
        .ok_or_else(|| Error::Udev(format!("{}: no PCI parent", domain.display())))?;
    let value = read_attr(parent, "device")?;

    util::parse_hex::<u32>(&value)
        .ok_or_else(|| Error::Udev(format!("{}: bad PCI id {}", parent.display(), value)))
}

fn speed_attr(node: &Path, attr: &str) -> Result<u32> {
    match read_attr_opt(node, attr)? {
        Some(value) => SPEED_RE
            .captures(&value)
            .and_then(|caps| caps[1].parse().ok())
            .ok_or_else(|| Error::Udev(format!("{}: bad speed {}", node.display(), value))),
        None => Ok(0),
    }
}

fn lanes_attr(node: &Path, attr: &str) -> Result<u32> {
    match read_attr_opt(node, attr)? {
        Some(value) => value
            .parse()
            .map_err(|_| Error::Udev(format!("{}: bad lane count {}", node.display(), value))),
        None => Ok(0),
    }
}

/// Reads the negotiated link parameters of a device. Missing attributes read as zero.
pub fn read_link_speed(node: &Path) -> Result<LinkSpeed> {
    Ok(LinkSpeed {
        rx_speed: speed_attr(node, "rx_speed")?,
        rx_lanes: lanes_attr(node, "rx_lanes")?,
        tx_speed: speed_attr(node, "tx_speed")?,
        tx_lanes: lanes_attr(node, "tx_lanes")?,
    })
}

/// Reads the boot ACL slots of a domain.
///
/// Returns `None` when the domain has no `boot_acl` which is different from an ACL with all
/// slots free.
pub fn read_boot_acl(domain: &Path) -> Result<Option<Vec<String>>> {
    match read_attr_opt(domain, "boot_acl")? {
        Some(value) if value.is_empty() => Ok(Some(Vec::new())),
        Some(value) => Ok(Some(value.split(',').map(String::from).collect())),
        None => Ok(None),
    }
}

/// Writes the boot ACL slots of a domain. The kernel expects all slots in one write.
pub fn write_boot_acl(domain: &Path, slots: &[String]) -> Result<()> {
    write_attr(domain, "boot_acl", &slots.join(","))
}

/// Access to the Thunderbolt bus below a filesystem root.
///
/// The root is `/` in production; tests point it at a faked tree.
#[derive(Clone, Debug)]
pub struct Sysfs {
    root: PathBuf,
}

impl Sysfs {
    pub fn new() -> Self {
        Self::with_root("/")
    }

    /// A probe rooted somewhere else than `/`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Sysfs { root: root.into() }
    }

    /// Path of the bus device directory.
    pub fn devices_path(&self) -> PathBuf {
        self.root.join("sys/bus/thunderbolt/devices")
    }

    fn dmi_path(&self) -> PathBuf {
        self.root.join("sys/class/dmi/id")
    }

    /// Returns human readable `(name, vendor)` of a device.
    ///
    /// Prefers the DROM provided `device_name`/`vendor_name` pair and falls back to the numeric
    /// ids. A host router exposing neither is identified through DMI.
    pub fn identify(&self, node: &Path) -> Result<(String, String)> {
        let mut name = read_attr_opt(node, "device_name")?;
        if name.is_none() {
            name = read_attr_opt(node, "device")?;
        }
        let mut vendor = read_attr_opt(node, "vendor_name")?;
        if vendor.is_none() {
            vendor = read_attr_opt(node, "vendor")?;
        }

        match (name, vendor) {
            (Some(name), Some(vendor)) => Ok((name, vendor)),
            _ if is_host(node) => self.identify_dmi(),
            (None, _) => Err(Error::missing_attr(node, "device_name")),
            (_, None) => Err(Error::missing_attr(node, "vendor_name")),
        }
    }

    fn identify_dmi(&self) -> Result<(String, String)> {
        let dmi = self.dmi_path();
        let vendor = read_attr(&dmi, "sys_vendor")?;

        if vendor.eq_ignore_ascii_case("lenovo") {
            // Lenovo puts the model name in product_version.
            let name = read_attr(&dmi, "product_version")?;
            Ok((name, String::from("Lenovo")))
        } else {
            let name = read_attr(&dmi, "product_name")?;
            Ok((name, vendor))
        }
    }

    /// Number of domains that currently have at least one device.
    pub fn count_hosts(&self) -> Result<usize> {
        let devices = self.devices_path();
        let entries = match fs::read_dir(&devices) {
            Ok(entries) => entries,
            // The bus is not registered at all.
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(Error::Udev(format!("{}: {}", devices.display(), err))),
        };
        let mut count = 0;

        for entry in entries.flatten() {
            let Some(name) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            if !DOMAIN_RE.is_match(&name) {
                continue;
            }
            let Ok(domain) = fs::canonicalize(entry.path()) else {
                continue;
            };
            let Ok(children) = fs::read_dir(&domain) else {
                continue;
            };
            if children.flatten().any(|child| {
                child
                    .file_name()
                    .to_str()
                    .map(|name| DEVICE_RE.is_match(name))
                    .unwrap_or(false)
            }) {
                count += 1;
            }
        }

        Ok(count)
    }

    /// Enumerates all Thunderbolt device nodes currently in sysfs.
    ///
    /// Returns canonicalized syspaths ordered so that a parent always comes before its
    /// children.
    pub fn enumerate(&self) -> Result<Vec<PathBuf>> {
        let devices = self.devices_path();
        let entries = match fs::read_dir(&devices) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(Error::Udev(format!("{}: {}", devices.display(), err))),
        };
        let mut seen = BTreeSet::new();
        let mut queue: Vec<PathBuf> = entries
            .flatten()
            .filter_map(|entry| fs::canonicalize(entry.path()).ok())
            .collect();

        // The bus directory is a flat list of links on a real system but nested device
        // directories also appear below their parents, so walk both ways and dedupe.
        while let Some(dir) = queue.pop() {
            if !seen.insert(dir.clone()) {
                continue;
            }
            let Ok(children) = fs::read_dir(&dir) else {
                continue;
            };
            for child in children.flatten() {
                let Some(name) = child.file_name().to_str().map(String::from) else {
                    continue;
                };
                if DEVICE_RE.is_match(&name) || DOMAIN_RE.is_match(&name) {
                    if let Ok(path) = fs::canonicalize(child.path()) {
                        queue.push(path);
                    }
                }
            }
        }

        let mut nodes: Vec<PathBuf> = seen
            .into_iter()
            .filter(|node| {
                sysname(node).map(|name| DEVICE_RE.is_match(name)).unwrap_or(false)
                    && node.join("unique_id").is_file()
            })
            .collect();

        nodes.sort_by(|a, b| {
            a.components()
                .count()
                .cmp(&b.components().count())
                .then_with(|| a.cmp(b))
        });

        Ok(nodes)
    }
}

impl Default for Sysfs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::unix::fs::symlink;

    fn fake_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sys/bus/thunderbolt/devices")).unwrap();
        fs::create_dir_all(dir.path().join("sys/class/dmi/id")).unwrap();
        dir
    }

    fn add_domain(root: &Path, index: u32, security: &str) -> PathBuf {
        let domain = root
            .join("sys/bus/thunderbolt/devices")
            .join(format!("domain{index}"));
        fs::create_dir_all(&domain).unwrap();
        fs::write(domain.join("security"), format!("{security}\n")).unwrap();
        fs::write(domain.join("uevent"), "DEVTYPE=thunderbolt_domain\n").unwrap();
        symlink(root.join("sys/bus/thunderbolt"), domain.join("subsystem")).unwrap();
        domain
    }

    fn add_device(parent: &Path, name: &str, uid: &str) -> PathBuf {
        let node = parent.join(name);
        fs::create_dir_all(&node).unwrap();
        fs::write(node.join("unique_id"), format!("{uid}\n")).unwrap();
        fs::write(node.join("authorized"), "0\n").unwrap();
        node
    }

    #[test]
    fn read_attr_trims_newline() {
        let root = fake_root();
        let domain = add_domain(root.path(), 0, "user");

        assert_eq!(read_attr(&domain, "security").unwrap(), "user");
    }

    #[test]
    fn missing_attr_is_typed() {
        let root = fake_root();
        let domain = add_domain(root.path(), 0, "user");

        assert!(matches!(read_attr(&domain, "nope"), Err(Error::Udev(_))));
        assert_eq!(read_attr_opt(&domain, "nope").unwrap(), None);
    }

    #[test]
    fn domain_walk() {
        let root = fake_root();
        let domain = add_domain(root.path(), 0, "secure");
        let host = add_device(&domain, "0-0", "00000000-0000-0000-ffff-ffffffffffff");
        let device = add_device(&host, "0-1", "11111111-1111-1111-ffff-ffffffffffff");

        assert_eq!(domain_of(&device).unwrap(), domain);
        assert_eq!(domain_of(&host).unwrap(), domain);
        assert_eq!(security_of(&domain).unwrap(), SecurityLevel::Secure);
    }

    #[test]
    fn identify_prefers_names() {
        let root = fake_root();
        let domain = add_domain(root.path(), 0, "user");
        let host = add_device(&domain, "0-0", "00000000-0000-0000-ffff-ffffffffffff");
        fs::write(host.join("vendor"), "0x8086\n").unwrap();
        fs::write(host.join("device"), "0x15eb\n").unwrap();

        let sysfs = Sysfs::with_root(root.path());
        assert_eq!(
            sysfs.identify(&host).unwrap(),
            (String::from("0x15eb"), String::from("0x8086"))
        );

        fs::write(host.join("vendor_name"), "Intel\n").unwrap();
        fs::write(host.join("device_name"), "Titan Ridge\n").unwrap();
        assert_eq!(
            sysfs.identify(&host).unwrap(),
            (String::from("Titan Ridge"), String::from("Intel"))
        );
    }

    #[test]
    fn identify_host_falls_back_to_dmi() {
        let root = fake_root();
        let domain = add_domain(root.path(), 0, "user");
        let host = add_device(&domain, "0-0", "00000000-0000-0000-ffff-ffffffffffff");

        let dmi = root.path().join("sys/class/dmi/id");
        fs::write(dmi.join("sys_vendor"), "LENOVO\n").unwrap();
        fs::write(dmi.join("product_name"), "20QT\n").unwrap();
        fs::write(dmi.join("product_version"), "ThinkPad X1 Extreme\n").unwrap();

        let sysfs = Sysfs::with_root(root.path());
        assert_eq!(
            sysfs.identify(&host).unwrap(),
            (String::from("ThinkPad X1 Extreme"), String::from("Lenovo"))
        );

        fs::write(dmi.join("sys_vendor"), "Dell Inc.\n").unwrap();
        assert_eq!(
            sysfs.identify(&host).unwrap(),
            (String::from("20QT"), String::from("Dell Inc."))
        );
    }

    #[test]
    fn link_speed_parses_gbs() {
        let root = fake_root();
        let domain = add_domain(root.path(), 0, "user");
        let device = add_device(&domain, "0-1", "11111111-1111-1111-ffff-ffffffffffff");
        fs::write(device.join("rx_speed"), "20.0 Gb/s\n").unwrap();
        fs::write(device.join("rx_lanes"), "2\n").unwrap();

        let speed = read_link_speed(&device).unwrap();
        assert_eq!(speed.rx_speed, 20);
        assert_eq!(speed.rx_lanes, 2);
        // Missing attributes read as zero.
        assert_eq!(speed.tx_speed, 0);
        assert_eq!(speed.tx_lanes, 0);
    }

    #[test]
    fn boot_acl_absence_is_distinct_from_empty() {
        let root = fake_root();
        let domain = add_domain(root.path(), 0, "user");

        assert_eq!(read_boot_acl(&domain).unwrap(), None);

        fs::write(domain.join("boot_acl"), ",,,\n").unwrap();
        let slots = read_boot_acl(&domain).unwrap().unwrap();
        assert_eq!(slots.len(), 4);
        assert!(slots.iter().all(String::is_empty));

        let slots = vec![
            String::from("11111111-1111-1111-ffff-ffffffffffff"),
            String::new(),
            String::new(),
            String::new(),
        ];
        write_boot_acl(&domain, &slots).unwrap();
        assert_eq!(read_boot_acl(&domain).unwrap().unwrap(), slots);
    }

    #[test]
    fn count_and_enumerate() {
        let root = fake_root();
        let domain = add_domain(root.path(), 0, "user");
        let empty = add_domain(root.path(), 1, "user");
        let host = add_device(&domain, "0-0", "00000000-0000-0000-ffff-ffffffffffff");
        let parent = add_device(&host, "0-1", "11111111-1111-1111-ffff-ffffffffffff");
        let child = add_device(&parent, "0-301", "22222222-2222-2222-ffff-ffffffffffff");

        let sysfs = Sysfs::with_root(root.path());
        assert_eq!(sysfs.count_hosts().unwrap(), 1);
        let _ = empty;

        let nodes = sysfs.enumerate().unwrap();
        let canonical = |p: &Path| fs::canonicalize(p).unwrap();
        assert_eq!(
            nodes,
            vec![canonical(&host), canonical(&parent), canonical(&child)]
        );
    }
}
