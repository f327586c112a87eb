//! Port allocation for per-session emulator transports.

use crate::error::BridgeError;
use std::collections::BTreeSet;
use std::sync::Mutex;

/// Default first transport port.
pub const DEFAULT_PORT_RANGE_START: u16 = 10000;
/// Default last transport port (inclusive).
pub const DEFAULT_PORT_RANGE_END: u16 = 10099;

/// Hands out transport ports from a fixed inclusive range.
///
/// Allocation always returns the lowest free port, so a released port is the
/// first candidate for the next session.
pub struct PortPool {
    /// First port (inclusive).
    base_port: u16,
    /// Last port (inclusive).
    max_port: u16,
    /// Ports currently held by live sessions.
    used_ports: Mutex<BTreeSet<u16>>,
}

impl PortPool {
    /// Create a pool covering `base_port..=max_port`.
    pub fn new(base_port: u16, max_port: u16) -> Self {
        Self {
            base_port,
            max_port,
            used_ports: Mutex::new(BTreeSet::new()),
        }
    }

    /// Allocate the lowest unused port.
    pub fn allocate(&self) -> Result<u16, BridgeError> {
        let mut used = self.used_ports.lock().unwrap_or_else(|e| e.into_inner());
        let port = (self.base_port..=self.max_port)
            .find(|port| !used.contains(port))
            .ok_or(BridgeError::PortsExhausted)?;
        used.insert(port);
        Ok(port)
    }

    /// Release a port. Releasing a port that is not held does nothing.
    pub fn release(&self, port: u16) {
        let mut used = self.used_ports.lock().unwrap_or_else(|e| e.into_inner());
        used.remove(&port);
    }

    /// Number of ports currently held.
    pub fn allocated_count(&self) -> usize {
        let used = self.used_ports.lock().unwrap_or_else(|e| e.into_inner());
        used.len()
    }

    /// Number of ports still free.
    pub fn available_count(&self) -> usize {
        let total = if self.max_port < self.base_port {
            0
        } else {
            usize::from(self.max_port - self.base_port) + 1
        };
        total.saturating_sub(self.allocated_count())
    }
}

impl Default for PortPool {
    fn default() -> Self {
        Self::new(DEFAULT_PORT_RANGE_START, DEFAULT_PORT_RANGE_END)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_release() {
        let pool = PortPool::new(13400, 13402);

        // Allocate all ports
        assert_eq!(pool.allocate().unwrap(), 13400);
        assert_eq!(pool.allocate().unwrap(), 13401);
        assert_eq!(pool.allocate().unwrap(), 13402);
        assert!(matches!(pool.allocate(), Err(BridgeError::PortsExhausted)));

        // A released port is handed out again straight away
        pool.release(13401);
        assert_eq!(pool.allocate().unwrap(), 13401);

        assert!(pool.allocate().is_err());
    }

    #[test]
    fn test_lowest_port_first() {
        let pool = PortPool::new(5000, 5009);
        let ports: Vec<u16> = (0..4).map(|_| pool.allocate().unwrap()).collect();
        pool.release(5002);
        pool.release(5000);
        assert_eq!(pool.allocate().unwrap(), 5000);
        assert_eq!(pool.allocate().unwrap(), 5002);
        assert_eq!(ports, vec![5000, 5001, 5002, 5003]);
    }

    #[test]
    fn test_release_is_idempotent() {
        let pool = PortPool::new(6000, 6001);
        let port = pool.allocate().unwrap();
        pool.release(port);
        pool.release(port);
        pool.release(7000);
        assert_eq!(pool.allocated_count(), 0);
        assert_eq!(pool.available_count(), 2);
    }

    #[test]
    fn test_available_count() {
        let pool = PortPool::new(13400, 13404);
        assert_eq!(pool.available_count(), 5);
        assert_eq!(pool.allocated_count(), 0);

        pool.allocate().unwrap();
        pool.allocate().unwrap();
        assert_eq!(pool.available_count(), 3);
        assert_eq!(pool.allocated_count(), 2);
    }

    #[test]
    fn test_concurrent_allocations_are_unique() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let pool = Arc::new(PortPool::new(20000, 20063));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    (0..8).map(|_| pool.allocate().unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for port in handle.join().unwrap() {
                assert!(seen.insert(port), "port {port} handed out twice");
            }
        }
        assert_eq!(seen.len(), 64);
        assert_eq!(pool.available_count(), 0);
    }
}
