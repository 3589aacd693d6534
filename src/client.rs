//! Memory client interface
//!
//! The only boundary the coherence core exposes upward. Processors
//! are modeled as clients that submit reads and writes to their cache
//! and consume completion callbacks. Callbacks return `false` when
//! the client cannot accept the event this cycle; the delivering
//! process then fails and retries, so clients must treat repeated
//! deliveries idempotently.

use crate::{MemAddr, WriteId};
use thiserror::Error;

/// Identifier of a client slot on one cache bus, allocated from
/// `[0, clients_per_cache)`.
pub type ClientId = usize;

/// Invalid client requests. These are programmer errors in the
/// client and fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    /// Read address was not aligned to the cache line size.
    #[error("read address {0:#x} is not aligned to a cache line")]
    UnalignedRead(MemAddr),

    /// Write size exceeded the cache line size.
    #[error("write of {0} bytes exceeds the cache line size")]
    WriteTooLarge(usize),

    /// The write straddles a cache-line boundary.
    #[error("write at {address:#x} of {size} bytes crosses a line boundary")]
    CrossesLine {
        /// Write start address.
        address: MemAddr,
        /// Write size in bytes.
        size: usize,
    },

    /// All client slots of the cache are taken.
    #[error("no free client slot on this cache")]
    NoFreeSlot,

    /// The client id does not name a registered client.
    #[error("unknown client {0}")]
    UnknownClient(ClientId),
}

/// Callback interface a processor installs on its cache.
pub trait MemoryClient {
    /// A line read completed; `data` is the full line. Broadcast to
    /// every client on the cache. Return `false` to defer delivery.
    fn on_read_completed(&mut self, address: MemAddr, data: &[u8]) -> bool;

    /// The write identified by `wid` is globally consistent.
    fn on_write_completed(&mut self, wid: WriteId) -> bool;

    /// The cache is about to drop this line; the client must discard
    /// any state it mirrors at line granularity.
    fn on_memory_invalidated(&mut self, address: MemAddr) -> bool;

    /// A peer client on the same cache is writing; update any local
    /// mirror. Return `false` to refuse the snoop, which defers the
    /// peer's write.
    fn on_memory_snooped(&mut self, address: MemAddr, data: &[u8]) -> bool;
}

/// Client slots of one cache.
pub struct ClientRegistry {
    slots: Vec<Option<Box<dyn MemoryClient>>>,
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let taken: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
            .collect();
        f.debug_struct("ClientRegistry")
            .field("capacity", &self.slots.len())
            .field("registered", &taken)
            .finish()
    }
}

impl ClientRegistry {
    /// Create a registry with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots }
    }

    /// Install a client in the first free slot.
    pub fn register(&mut self, client: Box<dyn MemoryClient>) -> Result<ClientId, RequestError> {
        for (id, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(client);
                return Ok(id);
            }
        }
        Err(RequestError::NoFreeSlot)
    }

    /// Remove a client.
    pub fn unregister(&mut self, id: ClientId) -> Result<(), RequestError> {
        match self.slots.get_mut(id) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(RequestError::UnknownClient(id)),
        }
    }

    /// Whether `id` names a registered client.
    pub fn is_registered(&self, id: ClientId) -> bool {
        matches!(self.slots.get(id), Some(Some(_)))
    }

    /// Mutable access to one client.
    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut (dyn MemoryClient + '_)> {
        match self.slots.get_mut(id) {
            Some(Some(client)) => Some(client.as_mut()),
            _ => None,
        }
    }

    /// Iterate over `(id, client)` for every registered client.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ClientId, &mut Box<dyn MemoryClient>)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_mut().map(|c| (id, c)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Recorder {
        invalidated: Vec<MemAddr>,
    }

    struct TestClient(Rc<RefCell<Recorder>>);

    impl MemoryClient for TestClient {
        fn on_read_completed(&mut self, _address: MemAddr, _data: &[u8]) -> bool {
            true
        }
        fn on_write_completed(&mut self, _wid: WriteId) -> bool {
            true
        }
        fn on_memory_invalidated(&mut self, address: MemAddr) -> bool {
            self.0.borrow_mut().invalidated.push(address);
            true
        }
        fn on_memory_snooped(&mut self, _address: MemAddr, _data: &[u8]) -> bool {
            true
        }
    }

    #[test]
    fn test_slot_allocation() {
        let mut registry = ClientRegistry::new(2);
        let rec = Rc::new(RefCell::new(Recorder::default()));

        let a = registry.register(Box::new(TestClient(rec.clone()))).unwrap();
        let b = registry.register(Box::new(TestClient(rec.clone()))).unwrap();
        assert_eq!((a, b), (0, 1));
        assert!(matches!(
            registry.register(Box::new(TestClient(rec.clone()))),
            Err(RequestError::NoFreeSlot)
        ));

        registry.unregister(a).unwrap();
        assert!(!registry.is_registered(a));
        let c = registry.register(Box::new(TestClient(rec))).unwrap();
        assert_eq!(c, 0, "freed slot is reused");
    }

    #[test]
    fn test_unregister_unknown_fails() {
        let mut registry = ClientRegistry::new(1);
        assert_eq!(registry.unregister(0), Err(RequestError::UnknownClient(0)));
        assert_eq!(registry.unregister(7), Err(RequestError::UnknownClient(7)));
    }

    #[test]
    fn test_broadcast_reaches_all() {
        let mut registry = ClientRegistry::new(3);
        let rec = Rc::new(RefCell::new(Recorder::default()));
        for _ in 0..3 {
            registry.register(Box::new(TestClient(rec.clone()))).unwrap();
        }

        for (_, client) in registry.iter_mut() {
            client.on_memory_invalidated(0x1000);
        }
        assert_eq!(rec.borrow().invalidated, vec![0x1000, 0x1000, 0x1000]);
    }
}
