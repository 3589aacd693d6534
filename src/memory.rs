//! Sparse virtual backing store
//!
//! A flat byte-addressed address space backed by lazily allocated
//! pages. Ranges must be reserved before use; accessing an unreserved
//! range is a fatal fault. Reserving the same range twice is
//! idempotent when the permissions match.

use bitflags::bitflags;
use std::collections::HashMap;
use thiserror::Error;

use crate::MemAddr;

/// Size of a backing-store page in bytes.
pub const PAGE_SIZE: u64 = 4096;

bitflags! {
    /// Access permissions of a reserved range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u8 {
        /// The range may be read.
        const READ = 0b001;
        /// The range may be written.
        const WRITE = 0b010;
        /// The range may be executed.
        const EXEC = 0b100;
    }
}

/// Backing-store faults. All fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    /// An access touched an address outside every reserved range.
    #[error("access to unreserved address {address:#x} (size {size})")]
    Unreserved {
        /// First faulting address.
        address: MemAddr,
        /// Size of the faulting access.
        size: usize,
    },

    /// A range was re-reserved with different permissions.
    #[error("address {address:#x} re-reserved with {requested:?}, already {existing:?}")]
    PermissionMismatch {
        /// Conflicting address.
        address: MemAddr,
        /// Permissions of the existing reservation.
        existing: Permissions,
        /// Permissions of the new request.
        requested: Permissions,
    },
}

/// The simulated physical memory contents.
#[derive(Debug, Default)]
pub struct VirtualMemory {
    pages: HashMap<u64, Box<[u8]>>,
    reserved: HashMap<u64, Permissions>,
}

impl VirtualMemory {
    /// Create an empty address space.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `[address, address + size)` with the given permissions.
    /// Re-reserving pages is idempotent if the permissions match.
    pub fn reserve(
        &mut self,
        address: MemAddr,
        size: u64,
        perms: Permissions,
    ) -> Result<(), MemoryError> {
        let first = address / PAGE_SIZE;
        let last = (address + size.max(1) - 1) / PAGE_SIZE;
        for page in first..=last {
            match self.reserved.get(&page) {
                Some(&existing) if existing != perms => {
                    return Err(MemoryError::PermissionMismatch {
                        address: page * PAGE_SIZE,
                        existing,
                        requested: perms,
                    });
                }
                Some(_) => {}
                None => {
                    self.reserved.insert(page, perms);
                }
            }
        }
        Ok(())
    }

    /// Permissions of the page containing `address`, if reserved.
    pub fn permissions(&self, address: MemAddr) -> Option<Permissions> {
        self.reserved.get(&(address / PAGE_SIZE)).copied()
    }

    /// Read `buf.len()` bytes starting at `address`.
    pub fn read(&self, address: MemAddr, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.check_reserved(address, buf.len())?;

        let mut offset = 0usize;
        while offset < buf.len() {
            let addr = address + offset as u64;
            let page = addr / PAGE_SIZE;
            let in_page = (addr % PAGE_SIZE) as usize;
            let chunk = (buf.len() - offset).min(PAGE_SIZE as usize - in_page);

            match self.pages.get(&page) {
                Some(data) => buf[offset..offset + chunk].copy_from_slice(&data[in_page..in_page + chunk]),
                // Reserved but never written: reads as zeroes.
                None => buf[offset..offset + chunk].fill(0),
            }
            offset += chunk;
        }
        Ok(())
    }

    /// Write `data` starting at `address`.
    pub fn write(&mut self, address: MemAddr, data: &[u8]) -> Result<(), MemoryError> {
        self.check_reserved(address, data.len())?;

        let mut offset = 0usize;
        while offset < data.len() {
            let addr = address + offset as u64;
            let page = addr / PAGE_SIZE;
            let in_page = (addr % PAGE_SIZE) as usize;
            let chunk = (data.len() - offset).min(PAGE_SIZE as usize - in_page);

            let page_data = self
                .pages
                .entry(page)
                .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
            page_data[in_page..in_page + chunk].copy_from_slice(&data[offset..offset + chunk]);
            offset += chunk;
        }
        Ok(())
    }

    fn check_reserved(&self, address: MemAddr, size: usize) -> Result<(), MemoryError> {
        let first = address / PAGE_SIZE;
        let last = (address + size.max(1) as u64 - 1) / PAGE_SIZE;
        for page in first..=last {
            if !self.reserved.contains_key(&page) {
                return Err(MemoryError::Unreserved { address, size });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_then_read_write() {
        let mut mem = VirtualMemory::new();
        mem.reserve(0x1000, 0x1000, Permissions::READ | Permissions::WRITE)
            .unwrap();

        let mut buf = [0xAAu8; 16];
        mem.read(0x1000, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16], "untouched memory reads as zero");

        mem.write(0x1008, &[1, 2, 3, 4]).unwrap();
        mem.read(0x1000, &mut buf).unwrap();
        assert_eq!(&buf[8..12], &[1, 2, 3, 4]);
        assert_eq!(&buf[..8], &[0u8; 8]);
    }

    #[test]
    fn test_unreserved_access_faults() {
        let mut mem = VirtualMemory::new();
        let mut buf = [0u8; 4];
        assert!(matches!(
            mem.read(0x5000, &mut buf),
            Err(MemoryError::Unreserved { .. })
        ));
        assert!(matches!(
            mem.write(0x5000, &buf),
            Err(MemoryError::Unreserved { .. })
        ));
    }

    #[test]
    fn test_idempotent_reservation() {
        let mut mem = VirtualMemory::new();
        let perms = Permissions::READ | Permissions::WRITE;
        mem.reserve(0x2000, 0x100, perms).unwrap();
        mem.reserve(0x2000, 0x100, perms).unwrap();

        assert!(matches!(
            mem.reserve(0x2000, 0x100, Permissions::READ),
            Err(MemoryError::PermissionMismatch { .. })
        ));
    }

    #[test]
    fn test_cross_page_access() {
        let mut mem = VirtualMemory::new();
        mem.reserve(0, 2 * PAGE_SIZE, Permissions::READ | Permissions::WRITE)
            .unwrap();

        let data: Vec<u8> = (0..32).collect();
        let base = PAGE_SIZE - 16;
        mem.write(base, &data).unwrap();

        let mut buf = [0u8; 32];
        mem.read(base, &mut buf).unwrap();
        assert_eq!(&buf[..], &data[..]);
    }

    #[test]
    fn test_partial_reservation_faults() {
        let mut mem = VirtualMemory::new();
        mem.reserve(0, PAGE_SIZE, Permissions::READ).unwrap();

        // Access straddling into the unreserved second page.
        let mut buf = [0u8; 32];
        assert!(matches!(
            mem.read(PAGE_SIZE - 16, &mut buf),
            Err(MemoryError::Unreserved { .. })
        ));
    }
}
