//! File-descriptor table for open endpoints
//!
//! One fd per open `(slot, endpoint)` pair, never more. Identifiers are
//! positive and not reused while any open fd exists with that value.

use capsule_seal::Direction;

use crate::config::MAX_FDS;

/// What the far side of an fd is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    /// Another container on this device
    Container { slot_id: u8, endpoint_id: u32 },
    /// A driver fd for a local peripheral
    Local { peer_fd: i32 },
    /// A driver fd for a remote network peer
    Remote { peer_fd: i32 },
}

#[derive(Debug, Clone)]
pub struct FdEntry {
    pub fd: i32,
    pub owner_slot: u8,
    pub endpoint_id: u32,
    pub direction: Direction,
    pub peer: Option<Peer>,
}

/// The endpoint fd table.
#[derive(Debug)]
pub struct FdTable {
    entries: Vec<FdEntry>,
    next_id: i32,
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
        }
    }

    fn mint_id(&mut self) -> i32 {
        loop {
            let id = self.next_id;
            self.next_id = if self.next_id == i32::MAX {
                1
            } else {
                self.next_id + 1
            };
            if !self.entries.iter().any(|entry| entry.fd == id) {
                return id;
            }
        }
    }

    /// Allocate a new fd for `(owner_slot, endpoint_id)`. Fails when the
    /// table is full or the pair already has an open fd.
    pub fn open(&mut self, owner_slot: u8, endpoint_id: u32, direction: Direction) -> Option<i32> {
        if self.entries.len() >= MAX_FDS {
            return None;
        }
        if self.is_open(owner_slot, endpoint_id) {
            return None;
        }
        let fd = self.mint_id();
        self.entries.push(FdEntry {
            fd,
            owner_slot,
            endpoint_id,
            direction,
            peer: None,
        });
        Some(fd)
    }

    /// Bind the far side of an fd.
    pub fn bind_peer(&mut self, fd: i32, peer: Peer) {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.fd == fd) {
            entry.peer = Some(peer);
        }
    }

    /// Close an fd, returning its entry for downstream release.
    pub fn close(&mut self, fd: i32) -> Option<FdEntry> {
        let index = self.entries.iter().position(|entry| entry.fd == fd)?;
        Some(self.entries.swap_remove(index))
    }

    /// Close every fd owned by `slot`, returning the removed entries.
    pub fn close_all_for(&mut self, slot: u8) -> Vec<FdEntry> {
        let mut removed = Vec::new();
        let mut index = 0;
        while index < self.entries.len() {
            if self.entries[index].owner_slot == slot {
                removed.push(self.entries.swap_remove(index));
            } else {
                index += 1;
            }
        }
        removed
    }

    pub fn get(&self, fd: i32) -> Option<&FdEntry> {
        self.entries.iter().find(|entry| entry.fd == fd)
    }

    pub fn is_open(&self, slot: u8, endpoint_id: u32) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.owner_slot == slot && entry.endpoint_id == endpoint_id)
    }

    /// True when `fd` belongs to `slot` and its endpoint direction allows
    /// the container to read.
    pub fn readable_by(&self, slot: u8, fd: i32) -> bool {
        self.get(fd)
            .is_some_and(|entry| entry.owner_slot == slot && entry.direction.readable())
    }

    /// True when `fd` belongs to `slot` and its endpoint direction allows
    /// the container to write.
    pub fn writable_by(&self, slot: u8, fd: i32) -> bool {
        self.get(fd)
            .is_some_and(|entry| entry.owner_slot == slot && entry.direction.writable())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_fd_per_endpoint() {
        let mut table = FdTable::new();
        let fd = table.open(0, 1, Direction::In).unwrap();
        assert!(fd > 0);
        assert!(table.open(0, 1, Direction::In).is_none());

        table.close(fd);
        assert!(table.open(0, 1, Direction::In).is_some());
    }

    #[test]
    fn ids_are_not_reused_while_open() {
        let mut table = FdTable::new();
        let first = table.open(0, 1, Direction::In).unwrap();
        let second = table.open(0, 2, Direction::Out).unwrap();
        table.close(first);
        let third = table.open(0, 3, Direction::Both).unwrap();
        assert_ne!(third, second);
        assert_ne!(third, first);
    }

    #[test]
    fn table_is_bounded() {
        let mut table = FdTable::new();
        for endpoint in 0..MAX_FDS as u32 {
            assert!(table.open(0, endpoint, Direction::Both).is_some());
        }
        assert!(table.open(0, 99, Direction::Both).is_none());
    }

    #[test]
    fn direction_gating() {
        let mut table = FdTable::new();
        let read_fd = table.open(1, 1, Direction::In).unwrap();
        let write_fd = table.open(1, 2, Direction::Out).unwrap();
        let both_fd = table.open(1, 3, Direction::Both).unwrap();

        assert!(table.readable_by(1, read_fd));
        assert!(!table.writable_by(1, read_fd));
        assert!(table.writable_by(1, write_fd));
        assert!(!table.readable_by(1, write_fd));
        assert!(table.readable_by(1, both_fd) && table.writable_by(1, both_fd));

        // fds are scoped to their owner
        assert!(!table.readable_by(2, read_fd));
        assert!(!table.writable_by(2, write_fd));
    }

    #[test]
    fn close_all_for_slot() {
        let mut table = FdTable::new();
        table.open(0, 1, Direction::In).unwrap();
        table.open(1, 1, Direction::In).unwrap();
        table.open(0, 2, Direction::Out).unwrap();

        let removed = table.close_all_for(0);
        assert_eq!(removed.len(), 2);
        assert_eq!(table.len(), 1);
    }
}
