//! Merge-store buffer
//!
//! A small fixed-capacity buffer of pending writes, indexed by line
//! address. While a line is loading, later writes to it land here
//! byte-merged instead of stalling the bus; their acknowledgements are
//! deferred until the line completes with priority and all tokens, at
//! which point the slot is merged into the line atomically and every
//! queued write is acked.
//!
//! A slot becomes *locked* when a read needed bytes that neither the
//! slot nor the line could provide; a locked slot admits no further
//! writes until it is merged and freed.

use crate::cache::line::CacheLine;
use crate::client::ClientId;
use crate::protocol::MAX_LINE_SIZE;
use crate::{MemAddr, WriteId};

/// One pending write queued in a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingWrite {
    /// Client to acknowledge.
    pub client: ClientId,
    /// Write identifier for the acknowledgement.
    pub wid: WriteId,
}

#[derive(Debug, Clone)]
struct MsbEntry {
    valid: bool,
    locked: bool,
    tag: u64,
    data: [u8; MAX_LINE_SIZE],
    bitmask: [bool; MAX_LINE_SIZE],
    queue: Vec<PendingWrite>,
}

impl MsbEntry {
    fn empty() -> Self {
        Self {
            valid: false,
            locked: false,
            tag: 0,
            data: [0; MAX_LINE_SIZE],
            bitmask: [false; MAX_LINE_SIZE],
            queue: Vec::new(),
        }
    }
}

/// The merged bytes and deferred acknowledgements of one freed slot.
#[derive(Debug)]
pub struct MergedSlot {
    /// Byte-merged write data.
    pub data: [u8; MAX_LINE_SIZE],
    /// Which bytes the slot holds.
    pub bitmask: [bool; MAX_LINE_SIZE],
    /// Writes awaiting acknowledgement.
    pub queue: Vec<PendingWrite>,
}

/// Per-cache merge-store buffer.
#[derive(Debug)]
pub struct MergeStoreBuffer {
    entries: Vec<MsbEntry>,
    line_size: usize,
}

impl MergeStoreBuffer {
    /// Create a buffer with `size` slots for `line_size`-byte lines.
    pub fn new(size: usize, line_size: usize) -> Self {
        Self {
            entries: vec![MsbEntry::empty(); size],
            line_size,
        }
    }

    #[inline]
    fn tag_of(&self, address: MemAddr) -> u64 {
        address / self.line_size as u64
    }

    fn find(&self, address: MemAddr) -> Option<usize> {
        let tag = self.tag_of(address);
        self.entries.iter().position(|e| e.valid && e.tag == tag)
    }

    /// Whether a slot exists for this line address.
    pub fn is_present(&self, address: MemAddr) -> bool {
        self.find(address).is_some()
    }

    /// Whether the slot for this address is locked.
    pub fn is_locked(&self, address: MemAddr) -> bool {
        self.find(address)
            .map(|i| self.entries[i].locked)
            .unwrap_or(false)
    }

    /// Merge a write into the slot for its line, allocating one if
    /// needed. Returns `false` when the buffer is out of slots or the
    /// slot is locked; the write then stalls on the bus.
    pub fn write(
        &mut self,
        address: MemAddr,
        offset: usize,
        data: &[u8],
        pending: PendingWrite,
    ) -> bool {
        let index = match self.find(address) {
            Some(i) if self.entries[i].locked => return false,
            Some(i) => i,
            None => {
                let Some(i) = self.entries.iter().position(|e| !e.valid) else {
                    return false;
                };
                let tag = self.tag_of(address);
                let entry = &mut self.entries[i];
                entry.valid = true;
                entry.locked = false;
                entry.tag = tag;
                entry.data.fill(0);
                entry.bitmask.fill(false);
                entry.queue.clear();
                i
            }
        };

        let entry = &mut self.entries[index];
        entry.data[offset..offset + data.len()].copy_from_slice(data);
        entry.bitmask[offset..offset + data.len()].fill(true);
        entry.queue.push(pending);
        true
    }

    /// Assemble a full line for a local read from the slot plus the
    /// line's valid bytes. When some byte exists in neither, the slot
    /// is locked and `None` returned: the read must wait for the
    /// pending completion.
    pub fn load(&mut self, address: MemAddr, line: &CacheLine) -> Option<[u8; MAX_LINE_SIZE]> {
        let index = self.find(address)?;
        let entry = &mut self.entries[index];

        let mut out = [0u8; MAX_LINE_SIZE];
        for i in 0..self.line_size {
            if entry.bitmask[i] {
                out[i] = entry.data[i];
            } else if line.valid_bytes[i] {
                out[i] = line.data[i];
            } else {
                entry.locked = true;
                return None;
            }
        }
        Some(out)
    }

    /// Copy out the merged bytes of the slot for this address without
    /// freeing it.
    pub fn peek(
        &self,
        address: MemAddr,
    ) -> Option<([u8; MAX_LINE_SIZE], [bool; MAX_LINE_SIZE])> {
        self.find(address)
            .map(|i| (self.entries[i].data, self.entries[i].bitmask))
    }

    /// Free the slot for this address, handing back its merged bytes
    /// and deferred acknowledgements.
    pub fn take(&mut self, address: MemAddr) -> Option<MergedSlot> {
        let index = self.find(address)?;
        let entry = &mut self.entries[index];
        entry.valid = false;
        entry.locked = false;
        Some(MergedSlot {
            data: entry.data,
            bitmask: entry.bitmask,
            queue: std::mem::take(&mut entry.queue),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::line::LineState;

    const LINE: usize = 64;

    fn pending(wid: WriteId) -> PendingWrite {
        PendingWrite { client: 0, wid }
    }

    #[test]
    fn test_writes_merge_bytewise() {
        let mut msb = MergeStoreBuffer::new(2, LINE);
        assert!(msb.write(0x1000, 0, &[1, 2], pending(1)));
        assert!(msb.write(0x1000, 4, &[9], pending(2)));
        assert!(msb.write(0x1000, 1, &[7], pending(3)));

        let slot = msb.take(0x1000).unwrap();
        assert_eq!(slot.data[0], 1);
        assert_eq!(slot.data[1], 7, "later write wins the byte");
        assert_eq!(slot.data[4], 9);
        assert!(slot.bitmask[0] && slot.bitmask[1] && slot.bitmask[4]);
        assert!(!slot.bitmask[2]);
        assert_eq!(slot.queue.len(), 3);
        assert!(!msb.is_present(0x1000));
    }

    #[test]
    fn test_capacity_exhaustion() {
        let mut msb = MergeStoreBuffer::new(1, LINE);
        assert!(msb.write(0x1000, 0, &[1], pending(1)));
        assert!(!msb.write(0x2000, 0, &[2], pending(2)), "no free slot");
        // The occupied slot keeps accepting writes to its own line.
        assert!(msb.write(0x1000, 16, &[3], pending(3)));

        let slot = msb.take(0x1000).unwrap();
        assert_eq!(slot.data[0], 1);
        assert_eq!(slot.data[16], 3);
        assert_eq!(slot.queue.len(), 2);
    }

    #[test]
    fn test_load_locks_on_missing_bytes() {
        let mut msb = MergeStoreBuffer::new(1, LINE);
        msb.write(0x1000, 0, &[1, 2, 3, 4], pending(1));

        let mut line = CacheLine::empty();
        line.state = LineState::Loading;
        // Line has no valid bytes: coverage is incomplete.
        assert!(msb.load(0x1000, &line).is_none());
        assert!(msb.is_locked(0x1000));

        // A locked slot refuses further writes.
        assert!(!msb.write(0x1000, 8, &[5], pending(2)));
    }

    #[test]
    fn test_load_with_full_coverage() {
        let mut msb = MergeStoreBuffer::new(1, LINE);
        msb.write(0x1000, 0, &[0xAA, 0xBB], pending(1));

        let mut line = CacheLine::empty();
        line.state = LineState::Loading;
        line.data = [0x11; MAX_LINE_SIZE];
        line.valid_bytes = [true; MAX_LINE_SIZE];

        let out = msb.load(0x1000, &line).unwrap();
        assert_eq!(out[0], 0xAA);
        assert_eq!(out[1], 0xBB);
        assert_eq!(out[2], 0x11);
        assert!(!msb.is_locked(0x1000));
    }
}
