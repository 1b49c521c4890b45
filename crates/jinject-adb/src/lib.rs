//! Device capability for jinject: `adb` port forwarding to a process's JDWP
//! agent, run through a bounded, cancellable command runner.

mod device;
pub mod runner;

use std::{fmt, io, net::Ipv4Addr};

pub use device::{AdbDevice, Device, DeviceError};
pub use runner::{BoundedOutput, CommandResult, CommandSpec, RunCommandError, RunOptions};

/// A host TCP port forwarded to the JDWP agent of a device process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Forward {
    pub local_port: u16,
    pub pid: u32,
}

impl fmt::Display for Forward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp:{} -> jdwp:{}", self.local_port, self.pid)
    }
}

/// Asks the OS for a currently unused loopback port.
///
/// The port is released before returning, so another process could grab it
/// first; `adb forward` reports that as a normal forwarding failure.
pub fn local_free_tcp_port() -> io::Result<u16> {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_port_is_bindable() {
        let port = local_free_tcp_port().unwrap();
        assert_ne!(port, 0);
        std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, port)).unwrap();
    }

    #[test]
    fn forward_display() {
        let forward = Forward {
            local_port: 4711,
            pid: 1234,
        };
        assert_eq!(forward.to_string(), "tcp:4711 -> jdwp:1234");
    }
}
