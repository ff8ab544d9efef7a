// Thunderbolt/USB4 peripheral authorization daemon
//
// Copyright (C) 2025, Intel Corporation
// Author: Mika Westerberg <mika.westerberg@linux.intel.com>

//! Hot-plug event sources.
//!
//! The daemon listens on both uevent channels. The processed "udev" stream is authoritative and
//! drives all state changes; the raw "kernel" stream is consumed only for trace logging.

use std::fmt::{self, Display};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;

use log::trace;
use nix::sys::socket::{self, sockopt, AddressFamily, MsgFlags, NetlinkAddr, SockFlag,
                       SockProtocol, SockType};
use nix::unistd;
use tokio::io::unix::AsyncFd;

/// Uevent action.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Action {
    Add,
    Change,
    Remove,
}

impl Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Add => "add",
            Self::Change => "change",
            Self::Remove => "remove",
        };
        write!(f, "{s}")
    }
}

/// A hot-plug event on the Thunderbolt bus.
///
/// Plain values, so the manager can be driven without a udev socket in tests.
#[derive(Clone, Debug)]
pub struct Event {
    pub action: Action,
    pub syspath: PathBuf,
    pub sysname: String,
    pub uid: Option<String>,
}

impl Event {
    fn parse(event: &udev::Event) -> Option<Self> {
        let action = match event.event_type() {
            udev::EventType::Add => Action::Add,
            udev::EventType::Change => Action::Change,
            udev::EventType::Remove => Action::Remove,
            _ => return None,
        };

        let device = event.device();
        let sysname = device.sysname().to_str()?.to_string();

        // Domain events carry nothing the device set tracks.
        if sysname.starts_with("domain") {
            return None;
        }

        let uid = device
            .attribute_value("unique_id")
            .and_then(|u| u.to_str())
            .map(String::from);

        // Without a uid there is nothing to key an add or change on.
        if uid.is_none() && action != Action::Remove {
            return None;
        }

        Some(Event {
            action,
            syspath: device.syspath().to_path_buf(),
            sysname,
            uid,
        })
    }
}

/// Authoritative udev event stream filtered to the Thunderbolt subsystem.
pub struct Monitor {
    socket: AsyncFd<udev::MonitorSocket>,
}

impl Monitor {
    /// Opens the monitor socket.
    pub fn new() -> io::Result<Self> {
        let socket = udev::MonitorBuilder::new()?
            .match_subsystem("thunderbolt")?
            .listen()?;

        Ok(Monitor {
            socket: AsyncFd::new(socket)?,
        })
    }

    /// Waits for the next batch of events.
    pub async fn next_events(&mut self) -> io::Result<Vec<Event>> {
        loop {
            let mut guard = self.socket.readable().await?;

            let events: Vec<Event> = guard
                .get_inner()
                .iter()
                .filter_map(|e| Event::parse(&e))
                .collect();
            guard.clear_ready();

            // Everything pending may have been filtered out; wait again.
            if !events.is_empty() {
                return Ok(events);
            }
        }
    }
}

/// Kernel uevent multicast group.
const KERNEL_GROUP: u32 = 1;
const UEVENT_BUF_SIZE: usize = 64 * 1024;

struct KernelSocket(RawFd);

impl AsRawFd for KernelSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for KernelSocket {
    fn drop(&mut self) {
        let _ = unistd::close(self.0);
    }
}

/// Raw `NETLINK_KOBJECT_UEVENT` socket bound to the kernel multicast group.
///
/// Only used for tracing; the udev stream above drives the actual state.
pub struct KernelMonitor {
    socket: AsyncFd<KernelSocket>,
}

impl KernelMonitor {
    pub fn new() -> io::Result<Self> {
        let fd = socket::socket(
            AddressFamily::Netlink,
            SockType::Datagram,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkKObjectUEvent,
        )?;
        let socket = KernelSocket(fd);

        socket::setsockopt(fd, sockopt::RcvBuf, &UEVENT_BUF_SIZE)?;
        socket::bind(fd, &NetlinkAddr::new(0, KERNEL_GROUP))?;

        Ok(KernelMonitor {
            socket: AsyncFd::new(socket)?,
        })
    }

    /// Logs the next kernel uevent at trace level.
    pub async fn trace_next(&mut self) -> io::Result<()> {
        let mut buf = [0u8; UEVENT_BUF_SIZE];

        loop {
            let mut guard = self.socket.readable().await?;

            match guard.try_io(|inner| {
                socket::recv(inner.get_ref().as_raw_fd(), &mut buf, MsgFlags::empty())
                    .map_err(io::Error::from)
            }) {
                Ok(Ok(len)) => {
                    if let Some(header) = parse_uevent(&buf[..len]) {
                        trace!("kernel uevent: {header}");
                    }
                    return Ok(());
                }
                Ok(Err(err)) => return Err(err),
                Err(_would_block) => continue,
            }
        }
    }
}

/// Extracts the `action@devpath` header of a Thunderbolt kernel uevent packet.
fn parse_uevent(data: &[u8]) -> Option<String> {
    let mut parts = data.split(|b| *b == 0);
    let header = std::str::from_utf8(parts.next()?).ok()?;

    if !header.contains('@') {
        return None;
    }

    let subsystem = parts
        .filter_map(|part| std::str::from_utf8(part).ok())
        .find_map(|part| part.strip_prefix("SUBSYSTEM="))?;

    (subsystem == "thunderbolt").then(|| header.to_string())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_kernel_packet() {
        let packet = b"add@/devices/pci0000:00/0000:00:0d.2/domain0/0-0/0-1\0\
                       ACTION=add\0\
                       DEVPATH=/devices/pci0000:00/0000:00:0d.2/domain0/0-0/0-1\0\
                       SUBSYSTEM=thunderbolt\0\
                       DEVTYPE=thunderbolt_device\0";

        assert_eq!(
            parse_uevent(packet).unwrap(),
            "add@/devices/pci0000:00/0000:00:0d.2/domain0/0-0/0-1"
        );
    }

    #[test]
    fn other_subsystems_are_skipped() {
        let packet = b"add@/devices/foo\0ACTION=add\0SUBSYSTEM=usb\0";
        assert_eq!(parse_uevent(packet), None);

        // Packets without the header are udev internal.
        let packet = b"libudev\0whatever\0SUBSYSTEM=thunderbolt\0";
        assert_eq!(parse_uevent(packet), None);
    }
}
