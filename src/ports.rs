use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::Mutex;

use crate::error::HubError;

/// Default SSE port range: 3000..4000, same window the dashboard
/// tooling expects when predicting endpoints without asking us.
pub const DEFAULT_PORT_BASE: u16 = 3000;
pub const DEFAULT_PORT_WINDOW: u16 = 1000;

/// Attempt budget for the gateway's own listening socket.
pub const FREE_PORT_ATTEMPTS: u16 = 100;

/// Assigns SSE ports to server names.
///
/// The candidate port is derived from a hash of the name, so the same
/// name maps to the same port across restarts and external callers can
/// predict endpoints. Assignments are recorded, and a candidate already
/// held by a different name probes linearly within the window instead of
/// silently colliding.
///
/// Allocation never reserves anything against the OS — a bind failure by
/// the spawned process is a runtime error, not an allocator error.
pub struct PortAllocator {
    base: u16,
    window: u16,
    assigned: Mutex<HashMap<String, u16>>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_PORT_BASE, DEFAULT_PORT_WINDOW)
    }
}

impl PortAllocator {
    pub fn new(base: u16, window: u16) -> Self {
        Self {
            base,
            window,
            assigned: Mutex::new(HashMap::new()),
        }
    }

    /// Port for `name`, stable for the lifetime of this allocator.
    pub fn allocate(&self, name: &str) -> u16 {
        let mut assigned = self.assigned.lock().expect("port map poisoned");
        if let Some(&port) = assigned.get(name) {
            return port;
        }

        let offset = fnv1a(name.as_bytes()) % u64::from(self.window);
        for probe in 0..u64::from(self.window) {
            let slot = (offset + probe) % u64::from(self.window);
            let port = self.base + slot as u16;
            if !assigned.values().any(|&p| p == port) {
                assigned.insert(name.to_string(), port);
                return port;
            }
        }

        // More names than ports in the window; the hash slot is the best
        // we can do and the caller will see the bind failure at spawn.
        let port = self.base + offset as u16;
        assigned.insert(name.to_string(), port);
        port
    }

    /// Record an explicitly configured port for `name`.
    pub fn assign(&self, name: &str, port: u16) {
        let mut assigned = self.assigned.lock().expect("port map poisoned");
        assigned.insert(name.to_string(), port);
    }

    /// Port previously assigned to `name`, if any.
    pub fn port_of(&self, name: &str) -> Option<u16> {
        self.assigned.lock().expect("port map poisoned").get(name).copied()
    }

    /// Port for `name` without recording an assignment: the recorded
    /// port when one exists, the hash candidate otherwise. Lets the
    /// gateway answer for servers that were never started here.
    pub fn predict(&self, name: &str) -> u16 {
        if let Some(port) = self.port_of(name) {
            return port;
        }
        self.base + (fnv1a(name.as_bytes()) % u64::from(self.window)) as u16
    }
}

/// Probe upward from `start` until a local bind succeeds.
pub fn find_free_port(start: u16, attempts: u16) -> Result<u16, HubError> {
    for port in start..start.saturating_add(attempts) {
        if TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return Ok(port);
        }
    }
    Err(HubError::PortUnavailable { start, attempts })
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
