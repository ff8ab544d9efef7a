// Thunderbolt/USB4 peripheral authorization daemon
//
// Copyright (C) 2025, Intel Corporation
// Author: Mika Westerberg <mika.westerberg@linux.intel.com>

use std::fmt::{self, Display};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;

use crate::{
    error::{Error, Result},
    key::Key,
    sysfs,
};

/// D-Bus object path prefix of device objects.
pub const DEVICE_PATH_PREFIX: &str = "/com/intel/tbauthd/devices/";

/// D-Bus object path for a device uid.
///
/// The uid forms the path suffix with everything outside `[A-Za-z0-9_]` mapped to `_`.
pub fn object_path_for_uid(uid: &str) -> String {
    let suffix: String = uid
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{DEVICE_PATH_PREFIX}{suffix}")
}

/// Thunderbolt security level.
///
/// This is a property of the domain and determines what it takes to authorize PCIe tunnels to a
/// device. It is copied onto each device when the device connects. There is more information in
/// the kernel [Thunderbolt/USB4 documentation].
///
/// [Thunderbolt/USB4 documentation]: https://docs.kernel.org/admin-guide/thunderbolt.html#security-levels-and-how-to-use-them
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SecurityLevel {
    /// PCIe tunnels are created automatically.
    None,
    /// User approval is needed.
    User,
    /// User approval is needed and the device must match the stored challenge.
    Secure,
    /// Only DisplayPort and USB tunneling is done.
    DpOnly,
    /// Only one PCIe tunnel to the first level USB controller is created.
    UsbOnly,
    /// Unknown security level.
    Unknown,
}

impl From<&str> for SecurityLevel {
    fn from(s: &str) -> Self {
        match s {
            "none" => Self::None,
            "user" => Self::User,
            "secure" => Self::Secure,
            "dponly" => Self::DpOnly,
            "usbonly" => Self::UsbOnly,
            _ => Self::Unknown,
        }
    }
}

impl Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::None => "none",
            Self::User => "user",
            Self::Secure => "secure",
            Self::DpOnly => "dponly",
            Self::UsbOnly => "usbonly",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Authorization status of a device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    /// Device is not currently plugged in.
    Disconnected,
    /// Device just appeared and is being evaluated.
    Connecting,
    /// Device is connected but tunnels are not authorized.
    Connected,
    /// The last authorization attempt failed. Stays until the device is unplugged or the user
    /// retries.
    AuthError,
    /// Authorization writes are in flight.
    Authorizing,
    /// Device is authorized.
    Authorized,
    /// Device is authorized and matched the stored challenge key.
    AuthorizedSecure,
    /// Only DisplayPort tunneling is authorized.
    AuthorizedDponly,
}

impl Status {
    /// Returns `true` in any of the authorized states.
    pub fn is_authorized(&self) -> bool {
        matches!(
            self,
            Self::Authorized | Self::AuthorizedSecure | Self::AuthorizedDponly
        )
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::AuthError => "auth-error",
            Self::Authorizing => "authorizing",
            Self::Authorized => "authorized",
            Self::AuthorizedSecure => "authorized-secure",
            Self::AuthorizedDponly => "authorized-dponly",
        };
        write!(f, "{s}")
    }
}

/// User preference for re-authorization of an enrolled device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Policy {
    /// Treated as manual unless overridden.
    Default,
    /// Never authorize without user action.
    Manual,
    /// Authorize automatically when the device reconnects.
    Auto,
}

impl FromStr for Policy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default" => Ok(Self::Default),
            "manual" => Ok(Self::Manual),
            "auto" => Ok(Self::Auto),
            _ => Err(Error::InvalidArgument(format!("bad policy {s:?}"))),
        }
    }
}

impl Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Default => "default",
            Self::Manual => "manual",
            Self::Auto => "auto",
        };
        write!(f, "{s}")
    }
}

/// Presence of challenge key material for a device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyState {
    /// No key exists.
    None,
    /// A key was generated for this connection but is not persisted yet.
    New,
    /// A key exists in the enrollment store.
    Stored,
}

/// Negotiated link parameters of a connected device, speeds in Gb/s.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LinkSpeed {
    pub rx_speed: u32,
    pub rx_lanes: u32,
    pub tx_speed: u32,
    pub tx_lanes: u32,
}

/// Key material passed to [`Device::authorize()`].
#[derive(Clone, Debug)]
pub enum AuthKey {
    /// Freshly generated key to be established on the device.
    New(Key),
    /// Previously stored key used to challenge the device.
    Stored(Key),
}

/// A device on the Thunderbolt/USB4 bus.
///
/// Covers both currently connected devices and enrolled devices that are unplugged. The `uid`
/// (kernel `unique_id`) is the primary key; two appearances with the same uid are the same
/// logical device.
#[derive(Clone, Debug)]
pub struct Device {
    uid: String,
    name: String,
    vendor: String,
    status: Status,
    policy: Policy,
    stored: bool,
    key: KeyState,
    syspath: Option<PathBuf>,
    parent_uid: Option<String>,
    security: SecurityLevel,
    ctime: u64,
    generation: u8,
    link_speed: LinkSpeed,
    boot: bool,
    iommu: bool,
    host: bool,
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Device {
    /// Builds a device from a live sysfs node.
    ///
    /// `unique_id` and `authorized` must be readable; everything else degrades to defaults with
    /// a warning.
    pub fn new_from_sysfs(probe: &sysfs::Sysfs, node: &Path) -> Result<Self> {
        let uid = sysfs::read_attr(node, "unique_id")?;

        let mut device = Device {
            uid,
            name: String::new(),
            vendor: String::new(),
            status: Status::Connecting,
            policy: Policy::Default,
            stored: false,
            key: KeyState::None,
            syspath: Some(node.to_path_buf()),
            parent_uid: None,
            security: SecurityLevel::Unknown,
            ctime: now(),
            generation: 1,
            link_speed: LinkSpeed::default(),
            boot: false,
            iommu: false,
            host: sysfs::is_host(node),
        };

        device.read_identity(probe, node);
        device.update_from_sysfs()?;

        Ok(device)
    }

    /// Reconstructs an enrolled device from its store record.
    pub(crate) fn from_stored(
        uid: &str,
        name: String,
        vendor: String,
        policy: Policy,
        ctime: u64,
        security: SecurityLevel,
        has_key: bool,
    ) -> Self {
        Device {
            uid: uid.to_string(),
            name,
            vendor,
            status: Status::Disconnected,
            policy,
            stored: true,
            key: if has_key { KeyState::Stored } else { KeyState::None },
            syspath: None,
            parent_uid: None,
            security,
            ctime,
            generation: 1,
            link_speed: LinkSpeed::default(),
            boot: false,
            iommu: false,
            host: false,
        }
    }

    // Non-essential attributes; failures degrade to defaults.
    fn read_identity(&mut self, probe: &sysfs::Sysfs, node: &Path) {
        match probe.identify(node) {
            Ok((name, vendor)) => {
                self.name = name;
                self.vendor = vendor;
            }
            Err(err) => warn!("{}: identification failed: {}", node.display(), err),
        }

        match sysfs::domain_of(node) {
            Some(domain) => {
                match sysfs::security_of(&domain) {
                    Ok(level) => self.security = level,
                    Err(err) => warn!("{}: {}", self.uid, err),
                }
                self.iommu = sysfs::read_attr_opt(&domain, "iommu_dma_protection")
                    .ok()
                    .flatten()
                    .map(|v| v == "1")
                    .unwrap_or(false);
            }
            None => warn!("{}: no domain found", self.uid),
        }

        match sysfs::read_attr_opt(node, "generation") {
            Ok(Some(generation)) => self.generation = generation.parse().unwrap_or(1),
            Ok(None) => (),
            Err(err) => warn!("{}: {}", self.uid, err),
        }

        self.host = sysfs::is_host(node);
    }

    fn compute_status(&self, authorized: u32) -> Status {
        if authorized == 0 {
            // An authorization error sticks until the device goes away or the
            // user retries.
            if self.status == Status::AuthError {
                Status::AuthError
            } else {
                Status::Connected
            }
        } else if self.status.is_authorized() {
            // The level granted when the device connected never degrades.
            self.status
        } else if authorized == 2 {
            Status::AuthorizedSecure
        } else {
            match self.security {
                SecurityLevel::DpOnly => Status::AuthorizedDponly,
                _ => Status::Authorized,
            }
        }
    }

    /// Re-reads the mutable sysfs attributes of a connected device and recomputes the status.
    pub fn update_from_sysfs(&mut self) -> Result<Status> {
        let node = self
            .syspath
            .clone()
            .ok_or_else(|| Error::NotFound(format!("{} is not connected", self.uid)))?;

        let authorized = sysfs::read_attr(&node, "authorized")?
            .parse::<u32>()
            .map_err(|_| Error::Udev(format!("{}: bad authorized value", node.display())))?;

        match sysfs::read_link_speed(&node) {
            Ok(speed) => self.link_speed = speed,
            Err(err) => warn!("{}: {}", self.uid, err),
        }
        self.boot = sysfs::read_attr_opt(&node, "boot")
            .ok()
            .flatten()
            .map(|v| v == "1")
            .unwrap_or(false);

        self.status = self.compute_status(authorized);
        Ok(self.status)
    }

    /// Binds an enrolled device to a sysfs node when it reappears.
    ///
    /// The security level and identity are captured anew for this connection.
    pub fn connected(&mut self, probe: &sysfs::Sysfs, node: &Path) -> Result<Status> {
        self.syspath = Some(node.to_path_buf());
        self.status = Status::Connecting;
        self.read_identity(probe, node);
        self.update_from_sysfs()
    }

    /// Marks the device disconnected, retaining the enrollment state.
    pub fn disconnected(&mut self) {
        self.syspath = None;
        self.parent_uid = None;
        self.status = Status::Disconnected;
        // An unpersisted key dies with the connection.
        if self.key == KeyState::New {
            self.key = KeyState::None;
        }
    }

    /// Runs the authorization protocol against sysfs.
    ///
    /// The security level is the one captured for this connection. On failure the device is
    /// left in [`AuthError`](Status::AuthError).
    pub fn authorize(&mut self, key: Option<&AuthKey>) -> Result<Status> {
        let node = self
            .syspath
            .clone()
            .ok_or_else(|| Error::NotFound(format!("{} is not connected", self.uid)))?;

        self.status = Status::Authorizing;

        match Self::authorize_writes(&node, self.security, key) {
            Ok(status) => {
                if let Some(AuthKey::New(_)) = key {
                    self.key = KeyState::New;
                }
                self.status = status;
                Ok(status)
            }
            Err(err) => {
                self.status = Status::AuthError;
                match err {
                    Error::Udev(e) => Err(Error::Auth(e)),
                    other => Err(other),
                }
            }
        }
    }

    fn authorize_writes(
        node: &Path,
        security: SecurityLevel,
        key: Option<&AuthKey>,
    ) -> Result<Status> {
        match (security, key) {
            (SecurityLevel::Secure, Some(AuthKey::New(key))) => {
                let key = key.to_string();
                sysfs::write_attr(node, "key", &key)?;
                sysfs::write_attr_busy_retry(node, "authorized", "1")?;
                // Make sure the device took the key before it is persisted.
                if sysfs::read_attr(node, "key")? != key {
                    return Err(Error::Auth(format!(
                        "{}: key readback mismatch",
                        node.display()
                    )));
                }
                Ok(Status::AuthorizedSecure)
            }
            (SecurityLevel::Secure, Some(AuthKey::Stored(key))) => {
                sysfs::write_attr(node, "key", &key.to_string())?;
                sysfs::write_attr_busy_retry(node, "authorized", "2")
                    .map_err(|err| Error::Auth(format!("challenge failed: {err}")))?;
                Ok(Status::AuthorizedSecure)
            }
            (SecurityLevel::Secure, None) => Err(Error::InvalidArgument(String::from(
                "secure domain requires a key",
            ))),
            (SecurityLevel::DpOnly, _) => {
                sysfs::write_attr_busy_retry(node, "authorized", "1")?;
                Ok(Status::AuthorizedDponly)
            }
            _ => {
                sysfs::write_attr_busy_retry(node, "authorized", "1")?;
                Ok(Status::Authorized)
            }
        }
    }

    /// Returns uid of the device.
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Returns human readable name of the device.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns human readable vendor of the device.
    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    /// Returns current status.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Returns re-authorization policy.
    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub(crate) fn set_policy(&mut self, policy: Policy) {
        self.policy = policy;
    }

    /// Returns `true` if the device has a record in the enrollment store.
    pub fn stored(&self) -> bool {
        self.stored
    }

    pub(crate) fn set_stored(&mut self, stored: bool) {
        self.stored = stored;
    }

    /// Returns whether challenge key material exists for the device.
    pub fn key_state(&self) -> KeyState {
        self.key
    }

    pub(crate) fn set_key_state(&mut self, key: KeyState) {
        self.key = key;
    }

    /// Returns path in sysfs while the device is connected.
    pub fn syspath(&self) -> Option<&Path> {
        self.syspath.as_deref()
    }

    /// Returns uid of the parent device, or `None` when the device sits directly below the host
    /// domain.
    pub fn parent_uid(&self) -> Option<&str> {
        self.parent_uid.as_deref()
    }

    pub(crate) fn set_parent_uid(&mut self, parent_uid: Option<String>) {
        self.parent_uid = parent_uid;
    }

    /// Returns security level of the domain captured when the device connected.
    pub fn security(&self) -> SecurityLevel {
        self.security
    }

    /// Returns when the device was first seen, seconds since the epoch.
    pub fn ctime(&self) -> u64 {
        self.ctime
    }

    /// Returns Thunderbolt generation of the device.
    pub fn generation(&self) -> u8 {
        self.generation
    }

    /// Returns negotiated link parameters.
    pub fn link_speed(&self) -> LinkSpeed {
        self.link_speed
    }

    /// Returns `true` if the boot firmware authorized the device.
    pub fn boot(&self) -> bool {
        self.boot
    }

    /// Returns `true` if DMA is protected by an IOMMU.
    pub fn iommu_dma_protection(&self) -> bool {
        self.iommu
    }

    /// Returns `true` if this is the host router.
    pub fn is_host(&self) -> bool {
        self.host
    }

    /// Returns the D-Bus object path of the device.
    pub fn object_path(&self) -> String {
        object_path_for_uid(&self.uid)
    }
}

impl Eq for Device {}

// Same uid, same logical device.
impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}
