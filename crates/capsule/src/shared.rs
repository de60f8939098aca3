//! Shared-memory ABI between the supervisor and a running guest
//!
//! One region exists per running container. The read-only half is fixed at
//! start; the read-write half is the syscall exchange area. The service
//! only touches the RW half while the owning worker is parked inside
//! `service_syscall`, so the mutex is never contended.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::IO_BUF;

pub const SYSCALL_HEARTBEAT: u32 = 1;
pub const SYSCALL_OPEN: u32 = 2;
pub const SYSCALL_CLOSE: u32 = 3;
pub const SYSCALL_READ: u32 = 4;
pub const SYSCALL_WRITE: u32 = 5;

/// Capability bit guarding a syscall id, `1 << (id - 1)`.
pub fn syscall_capability_bit(syscall_id: u32) -> Option<u32> {
    match syscall_id {
        SYSCALL_HEARTBEAT..=SYSCALL_WRITE => Some(1 << (syscall_id - 1)),
        _ => None,
    }
}

/// Read-only half, written once at container start.
#[derive(Debug, Clone, Copy)]
pub struct SharedRo {
    /// Loop period from metadata, in milliseconds
    pub loop_period_ms: u32,
}

/// Read-write half: one record, interpreted according to `syscall_id`.
///
/// For OPEN, `fd` carries the endpoint id to open. For READ/WRITE, `fd` is
/// the endpoint fd and `size` the requested byte count; READ results and
/// WRITE payloads travel through `buffer`.
#[derive(Debug)]
pub struct SharedRw {
    pub syscall_id: u32,
    pub fd: i32,
    pub size: u32,
    pub buffer: [u8; IO_BUF],
}

impl Default for SharedRw {
    fn default() -> Self {
        Self {
            syscall_id: 0,
            fd: -1,
            size: 0,
            buffer: [0; IO_BUF],
        }
    }
}

/// The per-container shared region.
#[derive(Debug)]
pub struct SharedMemory {
    pub ro: SharedRo,
    rw: Mutex<SharedRw>,
}

impl SharedMemory {
    pub fn new(loop_period_ms: u32) -> Arc<Self> {
        Arc::new(Self {
            ro: SharedRo { loop_period_ms },
            rw: Mutex::new(SharedRw::default()),
        })
    }

    /// Borrow the RW half. The lock is only ever held across straight-line
    /// code, never across a suspension point.
    pub fn rw(&self) -> MutexGuard<'_, SharedRw> {
        self.rw.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_bits() {
        assert_eq!(syscall_capability_bit(SYSCALL_HEARTBEAT), Some(0b00001));
        assert_eq!(syscall_capability_bit(SYSCALL_OPEN), Some(0b00010));
        assert_eq!(syscall_capability_bit(SYSCALL_WRITE), Some(0b10000));
        assert_eq!(syscall_capability_bit(0), None);
        assert_eq!(syscall_capability_bit(6), None);
    }
}
