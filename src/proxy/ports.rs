//! Free local TCP port discovery
//!
//! Ports are found by binding and immediately releasing them, so a port
//! handed out here may still be taken by another process before the engine
//! binds it. The engine session reports that as an early exit.

use crate::error::{ForgeError, Result};
use std::net::{Ipv4Addr, TcpListener};

/// Default first port to try
pub const DEFAULT_FIRST_PORT: u16 = 1024;

/// Lazy ascending scan of ports that are currently bindable
#[derive(Debug, Clone)]
pub struct FreePorts {
    next: u32,
}

impl FreePorts {
    pub fn starting_from(port: u16) -> Self {
        Self { next: port as u32 }
    }
}

impl Default for FreePorts {
    fn default() -> Self {
        Self::starting_from(DEFAULT_FIRST_PORT)
    }
}

impl Iterator for FreePorts {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        while self.next <= u16::MAX as u32 {
            let port = self.next as u16;
            self.next += 1;
            if is_bindable(port) {
                return Some(port);
            }
        }
        None
    }
}

fn is_bindable(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
}

/// Find the first free port at or above `start`
pub fn next_free_port(start: u16) -> Result<u16> {
    FreePorts::starting_from(start)
        .next()
        .ok_or(ForgeError::PortsExhausted { start })
}

/// Ports leased to one engine session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortLease {
    pub mixed: u16,
    pub controller: u16,
}

impl PortLease {
    /// Lease two distinct free ports from one scan
    pub fn acquire(start: u16) -> Result<Self> {
        let mut ports = FreePorts::starting_from(start);
        let mixed = ports.next().ok_or(ForgeError::PortsExhausted { start })?;
        let controller = ports.next().ok_or(ForgeError::PortsExhausted { start })?;
        Ok(Self { mixed, controller })
    }
}
