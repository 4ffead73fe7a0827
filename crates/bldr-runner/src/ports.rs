//! Process-wide port allocator.
//!
//! Dev servers get their port assigned by the runner, never by the
//! framework's own picker, so the injection proxy and tunnel always know
//! where to point. Reservations survive until explicitly released.

use anyhow::{bail, Result};
use std::collections::HashSet;
use std::sync::Mutex;

/// Mutex-serialized set of reserved ports within a configured range.
#[derive(Debug)]
pub struct PortAllocator {
    range_start: u16,
    range_len: u16,
    reserved: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(range_start: u16, range_len: u16) -> Self {
        Self {
            range_start,
            range_len,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    /// Reserve the lowest free port in the range.
    pub fn allocate(&self) -> Result<u16> {
        let mut reserved = self.reserved.lock().expect("port allocator poisoned");
        for offset in 0..self.range_len {
            let port = self.range_start + offset;
            if reserved.insert(port) {
                return Ok(port);
            }
        }
        bail!(
            "no free ports in range {}..{}",
            self.range_start,
            self.range_start + self.range_len
        );
    }

    /// Release a reservation. Releasing an unreserved port is a no-op.
    pub fn release(&self, port: u16) {
        let mut reserved = self.reserved.lock().expect("port allocator poisoned");
        reserved.remove(&port);
    }

    /// Whether a port is currently reserved.
    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved
            .lock()
            .expect("port allocator poisoned")
            .contains(&port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_release_cycle() {
        let allocator = PortAllocator::new(5000, 3);
        let a = allocator.allocate().unwrap();
        let b = allocator.allocate().unwrap();
        let c = allocator.allocate().unwrap();
        assert_eq!((a, b, c), (5000, 5001, 5002));
        assert!(allocator.allocate().is_err());

        allocator.release(b);
        assert!(!allocator.is_reserved(b));
        assert_eq!(allocator.allocate().unwrap(), 5001);
    }

    #[test]
    fn test_release_unreserved_is_noop() {
        let allocator = PortAllocator::new(5000, 2);
        allocator.release(5000);
        assert_eq!(allocator.allocate().unwrap(), 5000);
    }
}
