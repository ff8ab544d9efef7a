// Thunderbolt/USB4 peripheral authorization daemon
//
// Copyright (C) 2025, Intel Corporation
// Author: Mika Westerberg <mika.westerberg@linux.intel.com>

//! On-disk enrollment store.
//!
//! The store is a directory with one subdirectory per enrolled device:
//!
//! ```text
//! <root>/devices/<uid>/device   # record, stable key=value lines
//! <root>/devices/<uid>/key      # 64 hex characters, mode 0600
//! ```
//!
//! Records are written atomically (temp file, fsync, rename) so a crash leaves either the old
//! or the new record behind, never a torn one. The daemon is the only writer.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use log::debug;

use crate::{
    error::{Error, Result},
    key::Key,
    util, Device, Policy, SecurityLevel,
};

/// Filesystem backed map from device uid to enrollment record.
#[derive(Clone, Debug)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Store { root: root.into() }
    }

    fn devices_path(&self) -> PathBuf {
        self.root.join("devices")
    }

    fn device_dir(&self, uid: &str) -> PathBuf {
        self.devices_path().join(uid)
    }

    /// Lists stored uids in arbitrary order.
    pub fn list(&self) -> Result<Vec<String>> {
        let path = self.devices_path();
        let entries = match fs::read_dir(&path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(Error::store_io(&path, err)),
        };

        Ok(entries
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().to_str().map(String::from))
            .collect())
    }

    /// Loads the enrolled device with the given uid.
    pub fn get(&self, uid: &str) -> Result<Device> {
        let path = self.device_dir(uid).join("device");
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(Error::NotFound(uid.to_string()))
            }
            Err(err) => return Err(Error::store_io(&path, err)),
        };

        let record = Record::parse(uid, &text)?;
        Ok(Device::from_stored(
            uid,
            record.name,
            record.vendor,
            record.policy,
            record.ctime,
            record.security,
            self.has_key(uid),
        ))
    }

    /// Persists the device record.
    pub fn put(&self, device: &Device) -> Result<()> {
        let dir = self.device_dir(device.uid());
        fs::create_dir_all(&dir).map_err(|err| Error::store_io(&dir, err))?;

        let record = Record {
            name: device.name().to_string(),
            vendor: device.vendor().to_string(),
            policy: device.policy(),
            ctime: device.ctime(),
            security: device.security(),
        };

        let path = dir.join("device");
        debug!("writing record for {}", device.uid());
        util::atomic_write(&path, record.format().as_bytes(), 0o644)
            .map_err(|err| Error::store_io(&path, err))
    }

    /// Removes the record and any key. Removing an absent uid succeeds.
    pub fn delete(&self, uid: &str) -> Result<()> {
        let dir = self.device_dir(uid);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::store_io(&dir, err)),
        }
    }

    /// Returns `true` if a challenge key is stored for the uid.
    pub fn has_key(&self, uid: &str) -> bool {
        self.device_dir(uid).join("key").is_file()
    }

    /// Loads the stored challenge key.
    pub fn load_key(&self, uid: &str) -> Result<Key> {
        let path = self.device_dir(uid).join("key");
        if !path.is_file() {
            return Err(Error::NotFound(uid.to_string()));
        }
        Key::load(&path)
    }

    /// Stores the challenge key with mode 0600.
    pub fn put_key(&self, uid: &str, key: &Key) -> Result<()> {
        let dir = self.device_dir(uid);
        fs::create_dir_all(&dir).map_err(|err| Error::store_io(&dir, err))?;
        key.save(&dir.join("key"))
    }
}

struct Record {
    name: String,
    vendor: String,
    policy: Policy,
    ctime: u64,
    security: SecurityLevel,
}

impl Record {
    // Field order is part of the on-disk format.
    fn format(&self) -> String {
        format!(
            "name={}\nvendor={}\npolicy={}\nctime={}\nsecurity={}\n",
            self.name, self.vendor, self.policy, self.ctime, self.security
        )
    }

    fn parse(uid: &str, text: &str) -> Result<Self> {
        let mut record = Record {
            name: String::new(),
            vendor: String::new(),
            policy: Policy::Default,
            ctime: 0,
            security: SecurityLevel::Unknown,
        };

        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::Store(format!("{uid}: malformed line {line:?}")));
            };
            match key {
                "name" => record.name = value.to_string(),
                "vendor" => record.vendor = value.to_string(),
                "policy" => {
                    record.policy = value
                        .parse()
                        .map_err(|_| Error::Store(format!("{uid}: bad policy {value:?}")))?
                }
                "ctime" => {
                    record.ctime = value
                        .parse()
                        .map_err(|_| Error::Store(format!("{uid}: bad ctime {value:?}")))?
                }
                "security" => record.security = SecurityLevel::from(value),
                // Unknown keys from newer versions are ignored.
                _ => (),
            }
        }

        Ok(record)
    }
}
