// Thunderbolt/USB4 peripheral authorization daemon
//
// Copyright (C) 2025, Intel Corporation
// Author: Mika Westerberg <mika.westerberg@linux.intel.com>

//! Error types shared by the daemon components.

use std::io;
use std::path::Path;

use thiserror::Error;

/// Errors the daemon components can produce.
#[derive(Debug, Error)]
pub enum Error {
    /// Sysfs or uevent access failed, or an attribute that was expected to be present was
    /// missing.
    #[error("udev: {0}")]
    Udev(String),
    /// I/O or parse failure against the enrollment store.
    #[error("store: {0}")]
    Store(String),
    /// An authorization write failed or the challenge did not match.
    #[error("authorization: {0}")]
    Auth(String),
    /// Caller passed a malformed uid or policy value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The uid is not known in the relevant scope.
    #[error("not found: {0}")]
    NotFound(String),
}

impl Error {
    /// An attribute that should be present was not.
    pub(crate) fn missing_attr(node: &Path, attr: &str) -> Self {
        Error::Udev(format!("{} missing from {}", attr, node.display()))
    }

    pub(crate) fn udev_io(node: &Path, attr: &str, err: io::Error) -> Self {
        Error::Udev(format!("{}/{}: {}", node.display(), attr, err))
    }

    pub(crate) fn store_io(path: &Path, err: io::Error) -> Self {
        Error::Store(format!("{}: {}", path.display(), err))
    }
}

/// Crate wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for zbus::fdo::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidArgument(e) => zbus::fdo::Error::InvalidArgs(e),
            Error::NotFound(e) => zbus::fdo::Error::UnknownObject(e),
            other => zbus::fdo::Error::Failed(other.to_string()),
        }
    }
}
