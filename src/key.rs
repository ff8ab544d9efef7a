// Thunderbolt/USB4 peripheral authorization daemon
//
// Copyright (C) 2025, Intel Corporation
// Author: Mika Westerberg <mika.westerberg@linux.intel.com>

//! Pre-shared keys used for challenge-response device authorization.

use std::fmt::{self, Display};
use std::fs;
use std::path::Path;
use std::str::FromStr;

use rand::prelude::*;

use crate::{
    error::{Error, Result},
    util,
};

/// Length of a key in bytes.
pub const KEY_BYTES: usize = 32;

/// A 32-byte pre-shared key.
///
/// Keys travel to the kernel and the enrollment store encoded as 64 lowercase hexadecimal
/// characters.
#[derive(Clone, Eq, PartialEq)]
pub struct Key([u8; KEY_BYTES]);

impl Key {
    /// Generates a new random key.
    pub fn generate() -> Self {
        let mut data = [0u8; KEY_BYTES];

        rand::thread_rng().fill_bytes(&mut data);

        Key(data)
    }

    /// Reads a key back from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let s = fs::read_to_string(path).map_err(|err| Error::store_io(path, err))?;

        s.trim()
            .parse()
            .map_err(|_| Error::Store(format!("{}: malformed key", path.display())))
    }

    /// Writes the key to `path` with mode 0600.
    ///
    /// The key goes to a sibling temporary file which is fsynced before being renamed over the
    /// final path.
    pub fn save(&self, path: &Path) -> Result<()> {
        util::atomic_write(path, self.to_string().as_bytes(), 0o600)
            .map_err(|err| Error::store_io(path, err))
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

// Keep the key material out of debug output.
impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key(..)")
    }
}

impl FromStr for Key {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != KEY_BYTES * 2 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidArgument(String::from("malformed key")));
        }

        let mut data = [0u8; KEY_BYTES];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk).expect("checked above");
            data[i] = u8::from_str_radix(hex, 16).expect("checked above");
        }

        Ok(Key(data))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn format_is_lowercase_hex() {
        let key = Key::generate();
        let s = key.to_string();

        assert_eq!(s.len(), 64);
        assert!(s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
    }

    #[test]
    fn parse_round_trip() {
        let key = Key::generate();
        let parsed: Key = key.to_string().parse().unwrap();

        assert_eq!(parsed, key);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("deadbeef".parse::<Key>().is_err());
        assert!("zz".repeat(32).parse::<Key>().is_err());
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");
        let key = Key::generate();

        key.save(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        assert_eq!(Key::load(&path).unwrap(), key);
    }
}
