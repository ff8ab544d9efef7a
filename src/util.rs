// Thunderbolt/USB4 peripheral authorization daemon
//
// Copyright (C) 2025, Intel Corporation
// Author: Mika Westerberg <mika.westerberg@linux.intel.com>

//! Miscellaneous utility functions.

use std::{
    fs,
    io::{self, Write},
    os::unix::fs::OpenOptionsExt,
    path::Path,
    str::FromStr,
};

use lazy_static::lazy_static;
use num_traits::Num;
use regex::Regex;

/// Parse hexadecimal from string.
///
/// Assumes the string is hexadecimal and converts it to a number if possible, or `None` if no such
/// conversion is possible.
///
/// # Examples
/// ```
/// use tbauthd::util;
///
/// if let Some(number) = util::parse_hex::<u32>("0x1234") {
///     assert_eq!(number, 0x1234);
/// }
/// ```
pub fn parse_hex<T: Num + FromStr>(s: &str) -> Option<T> {
    let val = match s.strip_prefix("0x") {
        Some(s) => s,
        None => s,
    };

    <T>::from_str_radix(val, 16).ok()
}

/// Parse any number hexadecimal or not.
///
/// Parses numeric string into binary regardless whether it is in hexadecimal format or not. If
/// conversion is not possible returns `None`.
/// # Examples
/// ```
/// use tbauthd::util;
///
/// if let Some(number) = util::parse_number::<i32>("1234") {
///     assert_eq!(number, 1234);
/// }
/// ```
pub fn parse_number<T: Num + FromStr>(s: &str) -> Option<T> {
    // Try to match decimal digits first and if that matches use standard
    // functions to parse it.
    lazy_static! {
        static ref RE: Regex = Regex::new(r"^\d+$").unwrap();
    }
    if RE.is_match(s) {
        return s.parse::<T>().ok();
    }
    parse_hex(s)
}

/// Writes a file so that either the previous or the new contents are observable after a crash.
///
/// The contents go to a sibling temporary file which is fsynced and then renamed over `path`.
/// `mode` applies when the file is created.
pub(crate) fn atomic_write(path: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
    let tmp = path.with_extension("tmp");

    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(mode)
        .open(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;

    fs::rename(&tmp, path)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn atomic_write_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record");

        atomic_write(&path, b"first\n", 0o644).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "first\n");

        atomic_write(&path, b"second\n", 0o644).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second\n");

        // No temporary file is left behind.
        assert!(!path.with_extension("tmp").exists());
    }
}
