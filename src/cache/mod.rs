//! L2 cache
//!
//! Each cache holds lines, serves read/write requests from the
//! processor clients on its bus, and participates in the token
//! protocol on its local ring. Requests from clients are admitted
//! through the bus arbitrator into a bounded buffer; ring messages
//! arrive on the `prev` interface (requests) and the `next` interface
//! (responses) and are handled by one process each. All line
//! mutations are serialized by the `p_lines` arbitrator, all client
//! callbacks by `p_bus`; incoming ring traffic outranks local
//! requests.
//!
//! Every handler verifies its gates (arbitration grants, output
//! buffer slack) before mutating any state, so a failed activation
//! leaves the cache exactly as it was and is retried next cycle.

mod line;
mod msb;

pub use line::{CacheLine, LineState};
pub use msb::{MergeStoreBuffer, MergedSlot, PendingWrite};

use crate::client::{ClientId, ClientRegistry, MemoryClient, RequestError};
use crate::config::SimConfig;
use crate::kernel::{Arbitrator, Buffer, Cycle, ProcessResult, Requester, MINSPACE_FORWARD};
use crate::protocol::{Message, MessageKind, MAX_LINE_SIZE, NO_CLIENT};
use crate::ring::NodePort;
use crate::stats::CacheStats;
use crate::{CacheId, MemAddr, WriteId};

/// One admitted bus request.
#[derive(Debug, Clone)]
struct BusRequest {
    write: bool,
    address: MemAddr,
    size: usize,
    data: [u8; MAX_LINE_SIZE],
    client: ClientId,
    wid: WriteId,
}

/// An L2 cache on a local ring.
#[derive(Debug)]
pub struct Cache {
    id: CacheId,
    line_size: usize,
    assoc: usize,
    sets: usize,
    num_tokens: i64,
    inject_evictions: bool,

    lines: Vec<CacheLine>,
    clients: ClientRegistry,
    msb: MergeStoreBuffer,
    requests: Buffer<BusRequest>,

    /// Ring interfaces towards both neighbors.
    pub port: NodePort,

    p_lines: Arbitrator,
    p_bus: Arbitrator,

    /// Event counters.
    pub stats: CacheStats,
}

impl Cache {
    /// Create a cache with every line empty.
    pub fn new(id: CacheId, config: &SimConfig) -> Self {
        let assoc = config.l2_cache_associativity;
        let sets = config.l2_cache_num_sets;
        Self {
            id,
            line_size: config.cache_line_size,
            assoc,
            sets,
            num_tokens: config.num_caches() as i64,
            inject_evictions: config.inject_evicted_lines,
            lines: vec![CacheLine::empty(); assoc * sets],
            clients: ClientRegistry::new(config.num_processors_per_cache),
            msb: MergeStoreBuffer::new(config.msb_size, config.cache_line_size),
            requests: Buffer::bounded(
                format!("cache{id}.requests"),
                config.cache_request_buffer_size,
            ),
            port: NodePort::new(&format!("cache{id}"), config.cache_response_buffer_size),
            p_lines: Arbitrator::new(format!("cache{id}.p_lines")),
            p_bus: Arbitrator::new(format!("cache{id}.p_bus")),
            stats: CacheStats::default(),
        }
    }

    /// Cache identifier.
    #[inline]
    pub fn id(&self) -> CacheId {
        self.id
    }

    /// Whether the cache has no queued bus requests.
    pub fn is_idle(&self) -> bool {
        self.requests.is_empty()
            && self.port.prev.incoming.is_empty()
            && self.port.prev.outgoing.is_empty()
            && self.port.next.incoming.is_empty()
            && self.port.next.outgoing.is_empty()
    }

    // ========================================================================
    // Client interface
    // ========================================================================

    /// Install a processor client, returning its slot id.
    pub fn register_client(
        &mut self,
        client: Box<dyn MemoryClient>,
    ) -> Result<ClientId, RequestError> {
        self.clients.register(client)
    }

    /// Remove a processor client.
    pub fn unregister_client(&mut self, id: ClientId) -> Result<(), RequestError> {
        self.clients.unregister(id)
    }

    /// Submit a line read. The address must be line-aligned; the size
    /// is always one line. Returns whether the request was admitted.
    pub fn read(
        &mut self,
        now: Cycle,
        client: ClientId,
        address: MemAddr,
    ) -> Result<bool, RequestError> {
        if address % self.line_size as u64 != 0 {
            return Err(RequestError::UnalignedRead(address));
        }
        if !self.clients.is_registered(client) {
            return Err(RequestError::UnknownClient(client));
        }

        if !self.p_bus.invoke(Requester::Client(client), now) {
            return Ok(false);
        }
        if !self.requests.has_space(1) {
            return Ok(false);
        }

        let req = BusRequest {
            write: false,
            address,
            size: self.line_size,
            data: [0; MAX_LINE_SIZE],
            client,
            wid: 0,
        };
        self.requests.push(req).ok().expect("space checked");
        Ok(true)
    }

    /// Submit a write of `data.len()` bytes. The write may not cross
    /// a line boundary. The data is snooped to every other client
    /// before admission; a refused snoop rejects the write.
    pub fn write(
        &mut self,
        now: Cycle,
        client: ClientId,
        address: MemAddr,
        data: &[u8],
        wid: WriteId,
    ) -> Result<bool, RequestError> {
        if data.is_empty() || data.len() > self.line_size {
            return Err(RequestError::WriteTooLarge(data.len()));
        }
        let line = self.line_size as u64;
        if address / line != (address + data.len() as u64 - 1) / line {
            return Err(RequestError::CrossesLine {
                address,
                size: data.len(),
            });
        }
        if !self.clients.is_registered(client) {
            return Err(RequestError::UnknownClient(client));
        }

        if !self.p_bus.invoke(Requester::Client(client), now) {
            return Ok(false);
        }
        if !self.requests.has_space(1) {
            return Ok(false);
        }

        // Snoop the write to the other clients on this bus first; any
        // refusal defers the write entirely.
        for (cid, peer) in self.clients.iter_mut() {
            if cid != client && !peer.on_memory_snooped(address, data) {
                return Ok(false);
            }
        }

        let mut req = BusRequest {
            write: true,
            address,
            size: data.len(),
            data: [0; MAX_LINE_SIZE],
            client,
            wid,
        };
        req.data[..data.len()].copy_from_slice(data);
        self.requests.push(req).ok().expect("space checked");
        Ok(true)
    }

    // ========================================================================
    // Line lookup and allocation
    // ========================================================================

    #[inline]
    fn addr_tag(&self, address: MemAddr) -> u64 {
        (address / self.line_size as u64) / self.sets as u64
    }

    #[inline]
    fn addr_set(&self, address: MemAddr) -> usize {
        ((address / self.line_size as u64) % self.sets as u64) as usize
    }

    fn line_address(&self, index: usize) -> MemAddr {
        let set = (index / self.assoc) as u64;
        (self.lines[index].tag * self.sets as u64 + set) * self.line_size as u64
    }

    /// Index of the non-empty line matching `address`, attracted
    /// lines included.
    fn find_index(&self, address: MemAddr) -> Option<usize> {
        let tag = self.addr_tag(address);
        let base = self.addr_set(address) * self.assoc;
        (base..base + self.assoc)
            .find(|&i| self.lines[i].state != LineState::Empty && self.lines[i].tag == tag)
    }

    /// Index of the matching line, treating attracted lines as absent.
    fn find_genuine(&self, address: MemAddr) -> Option<usize> {
        self.find_index(address)
            .filter(|&i| !self.lines[i].attracted)
    }

    /// Inspect the line caching `address`, if any. Used by the
    /// invariant checker and tests.
    pub fn probe(&self, address: MemAddr) -> Option<&CacheLine> {
        self.find_index(address).map(|i| &self.lines[i])
    }

    /// Iterate over all lines with their line-aligned addresses.
    pub fn lines(&self) -> impl Iterator<Item = (MemAddr, &CacheLine)> {
        self.lines
            .iter()
            .enumerate()
            .filter(|(_, l)| l.state != LineState::Empty)
            .map(|(i, l)| (self.line_address(i), l))
    }

    /// A free way for `address`: empty, or an attracted line (which
    /// is reclaimable).
    fn find_free_way(&self, address: MemAddr) -> Option<usize> {
        let base = self.addr_set(address) * self.assoc;
        (base..base + self.assoc).find(|&i| {
            self.lines[i].state == LineState::Empty || self.lines[i].attracted
        })
    }

    /// The least-recently-used unpinned full line of the set.
    fn find_victim(&self, address: MemAddr) -> Option<usize> {
        let base = self.addr_set(address) * self.assoc;
        (base..base + self.assoc)
            .filter(|&i| self.lines[i].state == LineState::Full && !self.lines[i].is_pinned())
            .min_by_key(|&i| self.lines[i].access)
    }

    // ========================================================================
    // Client callback delivery
    // ========================================================================

    fn broadcast_invalidation(&mut self, now: Cycle, me: Requester, address: MemAddr) -> bool {
        if !self.p_bus.invoke(me, now) {
            return false;
        }
        for (_, client) in self.clients.iter_mut() {
            if !client.on_memory_invalidated(address) {
                return false;
            }
        }
        true
    }

    fn broadcast_read_completed(
        &mut self,
        now: Cycle,
        me: Requester,
        address: MemAddr,
        data: &[u8],
    ) -> bool {
        if !self.p_bus.invoke(me, now) {
            return false;
        }
        for (_, client) in self.clients.iter_mut() {
            if !client.on_read_completed(address, data) {
                return false;
            }
        }
        true
    }

    fn ack_write(&mut self, now: Cycle, me: Requester, client: ClientId, wid: WriteId) -> bool {
        if !self.p_bus.invoke(me, now) {
            return false;
        }
        match self.clients.get_mut(client) {
            Some(c) => c.on_write_completed(wid),
            // The client unregistered while its write was in flight;
            // nothing to acknowledge.
            None => true,
        }
    }

    /// Deliver the deferred acknowledgements of a merged MSB slot.
    /// Delivers nothing when the bus grant is lost this cycle; the
    /// caller retries next cycle.
    fn ack_queued(&mut self, now: Cycle, me: Requester, queue: &[PendingWrite]) -> bool {
        if !self.p_bus.invoke(me, now) {
            return false;
        }
        for pending in queue {
            if let Some(client) = self.clients.get_mut(pending.client) {
                if !client.on_write_completed(pending.wid) {
                    log::warn!(
                        "cache {}: dropped deferred write ack wid {}",
                        self.id,
                        pending.wid
                    );
                }
            }
        }
        true
    }

    // ========================================================================
    // Eviction
    // ========================================================================

    /// Push the victim's tokens, data and flags onto the ring and
    /// invalidate it locally.
    fn evict_line(&mut self, now: Cycle, me: Requester, index: usize) -> bool {
        let address = self.line_address(index);
        {
            let line = &self.lines[index];
            assert!(!line.is_pinned(), "evicting a pinned line");
            assert_eq!(line.state, LineState::Full);
        }
        if !self.port.next.can_send(me, now, MINSPACE_FORWARD) {
            return false;
        }
        if !self.broadcast_invalidation(now, me, address) {
            return false;
        }

        let line = &mut self.lines[index];
        let msg = Message::eviction(
            address,
            self.id,
            line.tokens,
            line.priority,
            line.dirty,
            &line.data[..self.line_size],
        );
        log::trace!(
            "cache {}: evicting {:#x} with {} tokens",
            self.id,
            address,
            line.tokens
        );
        line.clear();
        self.port.next.send(msg, me, now);
        self.stats.evictions += 1;
        true
    }

    // ========================================================================
    // Bus request handling
    // ========================================================================

    /// Process one admitted bus request.
    pub fn do_requests(&mut self, now: Cycle, me: Requester) -> ProcessResult {
        if self.requests.is_empty() {
            return ProcessResult::Delayed;
        }
        if !self.p_lines.invoke(me, now) {
            return ProcessResult::Failed;
        }

        let req = self.requests.pop().expect("non-empty requests");
        let result = if req.write {
            self.on_write_request(now, me, &req)
        } else {
            self.on_read_request(now, me, &req)
        };
        match result {
            ProcessResult::Success => ProcessResult::Success,
            ProcessResult::Delayed => {
                self.requests.push_front(req);
                ProcessResult::Success
            }
            ProcessResult::Failed => {
                self.requests.push_front(req);
                ProcessResult::Failed
            }
        }
    }

    fn on_read_request(&mut self, now: Cycle, me: Requester, req: &BusRequest) -> ProcessResult {
        let address = req.address;

        let index = match self.find_index(address) {
            Some(i) if self.lines[i].attracted => {
                // A passing read parked a copy here, but nobody is
                // waiting on it; adopt it as a genuine miss.
                if !self.port.next.can_send(me, now, MINSPACE_FORWARD) {
                    return ProcessResult::Failed;
                }
                self.lines[i].attracted = false;
                self.port.next.send(Message::read(address, self.id), me, now);
                self.stats.read_misses += 1;
                return ProcessResult::Success;
            }
            Some(i) => i,
            None => {
                // Miss: allocate, evicting if every way is occupied.
                let free = self.find_free_way(address);
                let index = match free {
                    Some(i) => i,
                    None => match self.find_victim(address) {
                        Some(victim) => {
                            if !self.evict_line(now, me, victim) {
                                return ProcessResult::Failed;
                            }
                            return ProcessResult::Delayed;
                        }
                        // Every candidate is pinned: back-pressure.
                        None => return ProcessResult::Failed,
                    },
                };

                if !self.port.next.can_send(me, now, MINSPACE_FORWARD) {
                    return ProcessResult::Failed;
                }
                let tag = self.addr_tag(address);
                self.lines[index].reset(tag, now);
                self.port.next.send(Message::read(address, self.id), me, now);
                self.stats.read_misses += 1;
                log::trace!("cache {}: read miss {:#x}", self.id, address);
                return ProcessResult::Success;
            }
        };

        let line = &self.lines[index];
        match line.state {
            LineState::Full => {
                assert!(line.tokens >= 1, "full line without tokens");
                if self.msb.is_locked(address) {
                    return ProcessResult::Failed;
                }
                // Merge pending buffered writes over the line data.
                let data = match self.msb.load(address, line) {
                    Some(merged) => merged,
                    None if self.msb.is_present(address) => {
                        // Coverage was incomplete; the slot is now
                        // locked and the read waits.
                        return ProcessResult::Failed;
                    }
                    None => line.data,
                };
                if !self.broadcast_read_completed(now, me, address, &data[..self.line_size]) {
                    return ProcessResult::Failed;
                }
                self.lines[index].access = now;
                self.stats.read_hits += 1;
                ProcessResult::Success
            }
            LineState::Loading => {
                if !line.dirty {
                    // The outstanding read's completion will put the
                    // line on the bus for every client.
                    ProcessResult::Success
                } else {
                    // Pending write: serve from line + buffered bytes
                    // if they cover the whole line, else wait.
                    if self.msb.is_locked(address) {
                        return ProcessResult::Failed;
                    }
                    match self.msb.load(address, line) {
                        Some(merged) => {
                            if !self
                                .broadcast_read_completed(now, me, address, &merged[..self.line_size])
                            {
                                return ProcessResult::Failed;
                            }
                            self.stats.read_hits += 1;
                            ProcessResult::Success
                        }
                        None => {
                            if line.is_complete(self.line_size) && !self.msb.is_present(address) {
                                let data = self.lines[index].data;
                                if !self
                                    .broadcast_read_completed(now, me, address, &data[..self.line_size])
                                {
                                    return ProcessResult::Failed;
                                }
                                self.stats.read_hits += 1;
                                ProcessResult::Success
                            } else {
                                ProcessResult::Failed
                            }
                        }
                    }
                }
            }
            LineState::Empty => unreachable!("find_index returned an empty line"),
        }
    }

    fn on_write_request(&mut self, now: Cycle, me: Requester, req: &BusRequest) -> ProcessResult {
        let address = req.address;
        let offset = (address % self.line_size as u64) as usize;
        let line_base = address - offset as u64;

        let found = match self.find_index(line_base) {
            Some(i) if self.lines[i].attracted => {
                // Reclaim the attracted copy; the miss path below
                // will allocate this way.
                self.lines[i].clear();
                None
            }
            other => other,
        };

        let Some(index) = found else {
            // Write miss: write-allocate and request every token.
            let free = self.find_free_way(line_base);
            let index = match free {
                Some(i) => i,
                None => match self.find_victim(line_base) {
                    Some(victim) => {
                        if !self.evict_line(now, me, victim) {
                            return ProcessResult::Failed;
                        }
                        return ProcessResult::Delayed;
                    }
                    None => return ProcessResult::Failed,
                },
            };

            if !self.port.next.can_send(me, now, MINSPACE_FORWARD) {
                return ProcessResult::Failed;
            }

            let tag = self.addr_tag(line_base);
            let line = &mut self.lines[index];
            line.reset(tag, now);
            line.dirty = true;
            line.updating = 1;
            line.write_bytes(offset, &req.data[..req.size]);

            let mut msg = Message::acquire_tokens(line_base, self.id);
            msg.client = req.client;
            msg.wid = req.wid;
            for i in 0..self.line_size {
                if line.valid_bytes[i] {
                    msg.data[i] = line.data[i];
                    msg.bitmask[i] = true;
                }
            }
            self.port.next.send(msg, me, now);
            self.stats.write_misses += 1;
            log::trace!("cache {}: write miss {:#x}", self.id, line_base);
            return ProcessResult::Success;
        };

        match self.lines[index].state {
            LineState::Full if self.lines[index].tokens == self.num_tokens => {
                // Exclusive: write locally and acknowledge at once.
                if !self.ack_write(now, me, req.client, req.wid) {
                    return ProcessResult::Failed;
                }
                let line = &mut self.lines[index];
                line.write_bytes(offset, &req.data[..req.size]);
                line.dirty = true;
                line.access = now;
                self.stats.write_hits += 1;
                ProcessResult::Success
            }
            LineState::Full => {
                // Shared: write locally, then go collect every token.
                if self.msb.is_locked(line_base) {
                    return ProcessResult::Failed;
                }
                if !self.port.next.can_send(me, now, MINSPACE_FORWARD) {
                    return ProcessResult::Failed;
                }

                let line = &mut self.lines[index];
                line.write_bytes(offset, &req.data[..req.size]);
                line.dirty = true;
                line.access = now;
                line.state = LineState::Loading;
                line.updating += 1;

                let mut msg = Message::acquire_tokens(line_base, self.id);
                msg.client = req.client;
                msg.wid = req.wid;
                // The priority token scouts ahead with the request.
                if line.priority {
                    msg.priority = true;
                    msg.tokens = 1;
                    line.tokens -= 1;
                    line.priority = false;
                }
                for i in 0..self.line_size {
                    if line.valid_bytes[i] {
                        msg.data[i] = line.data[i];
                        msg.bitmask[i] = true;
                    }
                }
                self.port.next.send(msg, me, now);
                self.stats.write_hits += 1;
                log::trace!(
                    "cache {}: write hit {:#x}, acquiring all tokens",
                    self.id,
                    line_base
                );
                ProcessResult::Success
            }
            LineState::Loading => {
                if self.msb.is_locked(line_base) {
                    return ProcessResult::Failed;
                }
                // One outstanding ring transaction per line: while it
                // is in flight, writes park in the merge-store buffer
                // and their acknowledgements ride on the completion.
                let pending = PendingWrite {
                    client: req.client,
                    wid: req.wid,
                };
                if self
                    .msb
                    .write(line_base, offset, &req.data[..req.size], pending)
                {
                    self.stats.write_hits += 1;
                    ProcessResult::Success
                } else {
                    ProcessResult::Failed
                }
            }
            LineState::Empty => unreachable!("find_index returned an empty line"),
        }
    }

    // ========================================================================
    // Ring: requests arriving from the previous neighbor
    // ========================================================================

    /// Handle one message from the previous neighbor.
    pub fn do_receive_prev(&mut self, now: Cycle, me: Requester) -> ProcessResult {
        if self.port.prev.incoming.is_empty() {
            return ProcessResult::Delayed;
        }
        if !self.p_lines.invoke(me, now) {
            return ProcessResult::Failed;
        }
        let msg = self.port.prev.incoming.pop().expect("non-empty incoming");
        match self.on_request_received(now, me, msg) {
            Ok(()) => ProcessResult::Success,
            Err(msg) => {
                self.port.prev.incoming.push_front(msg);
                ProcessResult::Failed
            }
        }
    }

    fn forward_next(&mut self, now: Cycle, me: Requester, msg: Message) -> Result<(), Message> {
        if !self.port.next.can_send(me, now, MINSPACE_FORWARD) {
            return Err(msg);
        }
        self.port.next.send(msg, me, now);
        Ok(())
    }

    fn on_request_received(
        &mut self,
        now: Cycle,
        me: Requester,
        mut msg: Message,
    ) -> Result<(), Message> {
        // A detoured message only re-ascends at the next directory;
        // caches pass it through untouched.
        if msg.ignore {
            return self.forward_next(now, me, msg);
        }

        match msg.kind {
            MessageKind::Read => self.on_remote_read(now, me, msg),
            MessageKind::AcquireTokens => {
                if msg.source == self.id {
                    self.on_acquire_returned(now, me, msg)
                } else {
                    self.on_remote_acquire(now, me, msg)
                }
            }
            MessageKind::Eviction => self.on_remote_eviction(now, me, msg),
            MessageKind::KillTokens => match self.find_genuine(msg.address) {
                Some(index) => {
                    self.lines[index].tokens -= msg.tokens;
                    log::trace!(
                        "cache {}: killed {} tokens at {:#x}",
                        self.id,
                        msg.tokens,
                        msg.address
                    );
                    Ok(())
                }
                None => {
                    if !self.port.next.can_send(me, now, MINSPACE_FORWARD) {
                        return Err(msg);
                    }
                    msg.hops += 1;
                    self.port.next.send(msg, me, now);
                    Ok(())
                }
            },
            MessageKind::LocaldirNotification => self.forward_next(now, me, msg),
            MessageKind::ReadResponse | MessageKind::ForwardResponse => {
                unreachable!("response on the request channel")
            }
        }
    }

    fn on_remote_read(
        &mut self,
        now: Cycle,
        me: Requester,
        mut msg: Message,
    ) -> Result<(), Message> {
        let address = msg.address;

        // Our own request came back around: nobody served it yet.
        // Park whatever it collected at the root with our line and
        // keep it circulating; the root line is still loading.
        if msg.source == self.id {
            if !self.port.next.can_send(me, now, MINSPACE_FORWARD) {
                return Err(msg);
            }
            if msg.tokens > 0 || msg.priority {
                if let Some(index) = self.find_genuine(address) {
                    if !self.lines[index].invalidated {
                        let line = &mut self.lines[index];
                        line.tokens += msg.tokens;
                        line.priority = line.priority || msg.priority;
                        msg.tokens = 0;
                        msg.priority = false;
                    }
                }
            }
            msg.hops += 1;
            self.port.next.send(msg, me, now);
            return Ok(());
        }

        let index = match self.find_genuine(address) {
            Some(i) if self.lines[i].invalidated => {
                // A raced line can serve nothing; pass the read along.
                if !self.port.next.can_send(me, now, MINSPACE_FORWARD) {
                    return Err(msg);
                }
                msg.hops += 1;
                self.port.next.send(msg, me, now);
                return Ok(());
            }
            Some(i) => i,
            None => {
                // Miss: attract a copy into a truly empty way, then
                // pass the request along.
                if !self.port.next.can_send(me, now, MINSPACE_FORWARD) {
                    return Err(msg);
                }
                if self.find_index(address).is_none() {
                    let base = self.addr_set(address) * self.assoc;
                    if let Some(way) =
                        (base..base + self.assoc).find(|&i| self.lines[i].state == LineState::Empty)
                    {
                        let tag = self.addr_tag(address);
                        self.lines[way].reset(tag, now);
                        self.lines[way].attracted = true;
                    }
                }
                msg.hops += 1;
                self.port.next.send(msg, me, now);
                return Ok(());
            }
        };

        // Tokens the read picked up at the root are parked with the
        // line before anything else; conversions below must not carry
        // them.
        if msg.tokens > 0 || msg.priority {
            let gains_priority = msg.priority && !self.lines[index].priority;
            let hook_needed =
                gains_priority && self.msb.is_present(address) && !self.lines[index].invalidated;
            let would_emit = hook_needed && !self.lines[index].dirty;
            let would_ack = hook_needed && self.lines[index].dirty;
            if would_emit && !self.port.next.can_send(me, now, MINSPACE_FORWARD) {
                return Err(msg);
            }
            if would_ack && !self.p_bus.would_grant(me, now) {
                return Err(msg);
            }
            let line = &mut self.lines[index];
            line.tokens += msg.tokens;
            line.priority = line.priority || msg.priority;
            msg.tokens = 0;
            msg.priority = false;
            if hook_needed {
                let folded = self.fold_pending_writes(now, me, index, address);
                assert!(folded, "pending-write fold lost a pre-checked gate");
            }
        }

        match self.lines[index].state {
            LineState::Full => {
                let line_tokens = self.lines[index].tokens;
                assert!(line_tokens >= 1);
                if line_tokens > (1 + msg.hops) as i64 {
                    // Serve the read: keep one token for ourselves
                    // and one per missed cache on the way back.
                    if !self.port.prev.can_send(me, now, MINSPACE_FORWARD) {
                        return Err(msg);
                    }
                    let line = &mut self.lines[index];
                    msg.kind = MessageKind::ReadResponse;
                    msg.tokens = line_tokens - (1 + msg.hops) as i64;
                    msg.data[..self.line_size].copy_from_slice(&line.data[..self.line_size]);
                    msg.bitmask[..self.line_size].fill(true);
                    line.tokens = (1 + msg.hops) as i64;
                    line.access = now;
                    log::trace!(
                        "cache {}: read hit {:#x}, responding with {} tokens",
                        self.id,
                        address,
                        msg.tokens
                    );
                    self.port.prev.send(msg, me, now);
                    Ok(())
                } else {
                    // No spare tokens to answer with: the copy moves
                    // to the reader wholesale and this line is done.
                    if !self.port.prev.can_send(me, now, MINSPACE_FORWARD) {
                        return Err(msg);
                    }
                    if !self.broadcast_invalidation(now, me, address) {
                        return Err(msg);
                    }
                    let line = &mut self.lines[index];
                    msg.kind = MessageKind::ReadResponse;
                    msg.tokens = line.tokens;
                    msg.priority = line.priority;
                    msg.dirty = line.dirty;
                    msg.data[..self.line_size].copy_from_slice(&line.data[..self.line_size]);
                    msg.bitmask[..self.line_size].fill(true);
                    line.clear();
                    log::trace!(
                        "cache {}: read hit {:#x} without spare tokens, surrendering copy",
                        self.id,
                        address
                    );
                    self.port.prev.send(msg, me, now);
                    Ok(())
                }
            }
            LineState::Loading => {
                if !self.lines[index].forward {
                    let line = &mut self.lines[index];
                    line.forward = true;
                    line.hops = msg.hops;
                    log::trace!(
                        "cache {}: loading hit {:#x}, forward flag set",
                        self.id,
                        address
                    );
                    Ok(())
                } else {
                    if !self.port.prev.can_send(me, now, MINSPACE_FORWARD) {
                        return Err(msg);
                    }
                    let line = &mut self.lines[index];
                    let new_hops = msg.hops;
                    msg.kind = MessageKind::ForwardResponse;
                    msg.tokens = line.hops as i64 - (1 + new_hops) as i64;
                    line.hops = new_hops;
                    self.port.prev.send(msg, me, now);
                    Ok(())
                }
            }
            LineState::Empty => unreachable!(),
        }
    }

    fn on_remote_acquire(
        &mut self,
        now: Cycle,
        me: Requester,
        mut msg: Message,
    ) -> Result<(), Message> {
        let address = msg.address;
        let Some(index) = self.find_genuine(address) else {
            return self.forward_next(now, me, msg);
        };

        // Every branch below forwards the request; gate the output
        // before touching any line state.
        if !self.port.next.can_send(me, now, MINSPACE_FORWARD) {
            return Err(msg);
        }

        match self.lines[index].state {
            LineState::Full => {
                // Surrender everything; the line is gone after this.
                assert_eq!(self.lines[index].updating, 0);
                if !self.broadcast_invalidation(now, me, address) {
                    return Err(msg);
                }

                let line = &mut self.lines[index];
                if msg.transient {
                    // Only the priority holder may confirm transient
                    // tokens.
                    assert!(line.priority);
                    msg.transient = false;
                }
                msg.tokens += line.visible_tokens();
                if line.priority {
                    msg.priority = true;
                }
                msg.dirty |= line.dirty;
                let (data, valid) = (line.data, line.valid_bytes);
                msg.merge_line_data(&data[..self.line_size], &valid[..self.line_size]);
                line.clear();
                log::trace!(
                    "cache {}: surrendered {:#x} to token request from cache {}",
                    self.id,
                    address,
                    msg.source
                );
                self.port.next.send(msg, me, now);
                Ok(())
            }
            LineState::Loading => {
                let dirty = self.lines[index].dirty;
                if !dirty {
                    // Pending read: the tokens move on, the line is
                    // marked as raced.
                    let line = &mut self.lines[index];
                    if msg.transient {
                        assert_eq!(line.tokens, 0);
                    }
                    msg.tokens += line.visible_tokens();
                    if line.priority {
                        msg.priority = true;
                        line.priority = false;
                    }
                    line.tokens = 0;
                    line.invalidated = true;
                    line.tlock = false;

                    let (data, valid) = (line.data, line.valid_bytes);
                    msg.merge_line_data(&data[..self.line_size], &valid[..self.line_size]);
                    // The acquirer's bytes are newer than whatever
                    // the pending read will deliver.
                    for i in 0..self.line_size {
                        if msg.bitmask[i] {
                            self.lines[index].data[i] = msg.data[i];
                            self.lines[index].valid_bytes[i] = true;
                        }
                    }
                    self.forward_next(now, me, msg)
                } else {
                    self.on_acquire_races_write(now, me, msg, index)
                }
            }
            LineState::Empty => unreachable!(),
        }
    }

    /// A remote token acquisition met our own pending write; the
    /// priority token decides who wins.
    fn on_acquire_races_write(
        &mut self,
        now: Cycle,
        me: Requester,
        mut msg: Message,
        index: usize,
    ) -> Result<(), Message> {
        if !self.port.next.can_send(me, now, MINSPACE_FORWARD) {
            return Err(msg);
        }
        let line = &mut self.lines[index];

        if msg.priority {
            // The request wins outright.
            assert!(!msg.transient);
            assert!(!line.priority);
            if line.tlock {
                msg.tokens += line.tokens;
                line.tokens = 0;
                line.tlock = false;
            } else if !line.invalidated {
                msg.tokens += line.visible_tokens();
                line.tokens = 0;
            }
            line.invalidated = true;
        } else if line.priority {
            // We win; the request's tokens stay here.
            assert!(!line.invalidated);
            assert!(!line.tlock);
            line.tokens += msg.tokens;
            msg.tokens = 0;
            msg.transient = false;
        } else {
            // Nobody holds priority yet: the request continues with a
            // transient copy while our tokens stay locked in place.
            msg.tokens += line.tokens;
            msg.transient = true;
            line.tlock = true;
            line.invalidated = true;
        }

        let (data, valid) = (line.data, line.valid_bytes);
        msg.merge_line_data(&data[..self.line_size], &valid[..self.line_size]);
        self.lines[index].absorb_bytes(&msg.data, &msg.bitmask);
        self.forward_next(now, me, msg)
    }

    /// Our own token acquisition came home.
    fn on_acquire_returned(
        &mut self,
        now: Cycle,
        me: Requester,
        msg: Message,
    ) -> Result<(), Message> {
        let address = msg.address;
        let index = self.find_genuine(address).expect("acquire without line");
        assert_eq!(self.lines[index].state, LineState::Loading);
        assert!(self.lines[index].dirty);

        let invalidated = self.lines[index].invalidated;
        let held_tokens = self.lines[index].tokens;

        // Short of the full set and not raced: circulate again until
        // the stragglers (evicted tokens parked in directories or
        // other pending lines) are picked up.
        if !invalidated && !msg.transient && held_tokens + msg.tokens < self.num_tokens {
            log::trace!(
                "cache {}: token request for {:#x} returned short ({} of {}), resending",
                self.id,
                address,
                held_tokens + msg.tokens,
                self.num_tokens
            );
            return self.forward_next(now, me, msg);
        }

        // Predict the final token count to pre-check every gate.
        let predicted = if invalidated {
            let kept = if msg.priority { held_tokens } else { 0 };
            kept + msg.permanent_tokens()
        } else {
            held_tokens + msg.tokens
        };
        let ends_empty = predicted == 0;
        let needs_notification = !invalidated && msg.transient && msg.tokens > 0;
        let msb_present = self.msb.is_present(address);
        let relaunch = ends_empty && msb_present;
        // A reader chained itself onto this line while we were
        // acquiring; it is served from the completed line, or re-read
        // on its behalf when the line was lost to the race.
        let forwarding = self.lines[index].forward;
        let chain_hops = self.lines[index].hops;

        if (needs_notification || relaunch || (forwarding && ends_empty))
            && !self.port.next.can_send(me, now, MINSPACE_FORWARD)
        {
            return Err(msg);
        }
        if forwarding && !ends_empty && !self.port.prev.can_send(me, now, MINSPACE_FORWARD) {
            return Err(msg);
        }
        // Completing with a merged slot delivers its deferred
        // acknowledgements; that needs the bus like any callback.
        if msb_present && !ends_empty && !self.p_bus.would_grant(me, now) {
            return Err(msg);
        }
        if msg.client != NO_CLIENT && !self.ack_write(now, me, msg.client, msg.wid) {
            return Err(msg);
        }

        let line = &mut self.lines[index];
        if line.invalidated {
            if !msg.priority {
                // The locked tokens die with the lost race.
                line.tokens = 0;
            }
            line.tlock = false;
            line.tokens += msg.permanent_tokens();
        } else if msg.transient {
            assert!(line.priority, "transient tokens without local priority");
            line.tokens += msg.tokens;
        } else {
            line.tokens += msg.tokens;
        }
        line.invalidated = false;
        line.updating = line.updating.saturating_sub(1);

        if line.tokens == 0 {
            // The competing writer absorbed our data along the way.
            line.clear();
            log::trace!(
                "cache {}: write race for {:#x} lost, line cleared",
                self.id,
                address
            );
        } else {
            assert_eq!(
                line.tokens, self.num_tokens,
                "completed write without every token"
            );
            line.state = LineState::Full;
            line.priority = true;
            line.access = now;
            line.absorb_bytes(&msg.data, &msg.bitmask);
            assert!(
                line.is_complete(self.line_size),
                "write completed with missing bytes"
            );
            log::trace!(
                "cache {}: write to {:#x} complete with all tokens",
                self.id,
                address
            );
        }

        if needs_notification {
            let note = Message::localdir_notification(address, self.id, msg.tokens);
            self.port.next.send(note, me, now);
        }

        // Fold the merge-store buffer slot in, or relaunch it if the
        // line was lost.
        if msb_present {
            if relaunch {
                self.relaunch_from_msb(now, me, address);
            } else if self.lines[index].state == LineState::Full {
                let slot = self.msb.take(address).expect("slot present");
                let line = &mut self.lines[index];
                for i in 0..self.line_size {
                    if slot.bitmask[i] {
                        line.data[i] = slot.data[i];
                        line.valid_bytes[i] = true;
                    }
                }
                let delivered = self.ack_queued(now, me, &slot.queue);
                assert!(delivered, "bus grant vanished within the cycle");
            }
        }

        if forwarding {
            if self.lines[index].state == LineState::Full {
                // Serve the chained reader from the fresh line.
                let keep = ((1 + chain_hops) as i64).min(self.num_tokens - 1);
                let line = &mut self.lines[index];
                line.forward = false;
                line.tokens = keep;

                let mut reply = Message::read(address, self.id);
                reply.kind = MessageKind::ReadResponse;
                reply.tokens = self.num_tokens - keep;
                reply.hops = chain_hops;
                reply.data[..self.line_size].copy_from_slice(&line.data[..self.line_size]);
                reply.bitmask[..self.line_size].fill(true);
                self.port.prev.send(reply, me, now);
            } else {
                // The race swept the line away; hunt the data down
                // again on the chained reader's behalf.
                let mut retry = Message::read(address, self.id);
                retry.hops = chain_hops;
                self.port.next.send(retry, me, now);
            }
        }
        Ok(())
    }

    /// The line was lost to a racing writer while buffered writes
    /// were still queued: start over from the merged slot.
    fn relaunch_from_msb(&mut self, now: Cycle, me: Requester, address: MemAddr) {
        let Some((data, bitmask)) = self.msb.peek(address) else {
            return;
        };
        let index = self
            .find_free_way(address)
            .expect("line just cleared for this set");
        let tag = self.addr_tag(address);
        let line = &mut self.lines[index];
        line.reset(tag, now);
        line.dirty = true;
        line.updating = 1;
        for i in 0..self.line_size {
            if bitmask[i] {
                line.data[i] = data[i];
                line.valid_bytes[i] = true;
            }
        }

        let mut msg = Message::acquire_tokens(address, self.id);
        for i in 0..self.line_size {
            if bitmask[i] {
                msg.data[i] = data[i];
                msg.bitmask[i] = true;
            }
        }
        log::trace!(
            "cache {}: relaunching buffered writes for {:#x}",
            self.id,
            address
        );
        self.port.next.send(msg, me, now);
    }

    fn on_remote_eviction(
        &mut self,
        now: Cycle,
        me: Requester,
        mut msg: Message,
    ) -> Result<(), Message> {
        let address = msg.address;

        let genuine = self.find_genuine(address);
        let Some(index) = genuine else {
            // Try to absorb the evicted line into a free way.
            if self.inject_evictions {
                let matching_attracted = self
                    .find_index(address)
                    .filter(|&i| self.lines[i].attracted);
                let way = matching_attracted.or_else(|| {
                    let base = self.addr_set(address) * self.assoc;
                    (base..base + self.assoc).find(|&i| self.lines[i].state == LineState::Empty)
                });
                if let Some(way) = way {
                    if !self.port.next.can_send(me, now, MINSPACE_FORWARD) {
                        return Err(msg);
                    }
                    let synthetic = (msg.hops + 1) as i64;
                    let tag = self.addr_tag(address);
                    let line = &mut self.lines[way];
                    line.reset(tag, now);
                    line.state = LineState::Full;
                    line.attracted = false;
                    // The line traveled hops + 1 caches; account for
                    // them with synthetic tokens and kill them again
                    // downstream.
                    line.tokens = msg.tokens + synthetic;
                    line.priority = msg.priority;
                    line.dirty = msg.dirty;
                    line.data = msg.data;
                    line.valid_bytes[..self.line_size].fill(true);

                    msg.kind = MessageKind::KillTokens;
                    msg.tokens = synthetic;
                    msg.hops = 0;
                    msg.source = self.id;
                    msg.priority = false;
                    msg.dirty = false;
                    self.stats.injections += 1;
                    log::trace!(
                        "cache {}: injected evicted line {:#x}, killing {} synthetic tokens",
                        self.id,
                        address,
                        synthetic
                    );
                    self.port.next.send(msg, me, now);
                    return Ok(());
                }
            }
            if !self.port.next.can_send(me, now, MINSPACE_FORWARD) {
                return Err(msg);
            }
            msg.hops += 1;
            self.port.next.send(msg, me, now);
            return Ok(());
        };

        if self.lines[index].state == LineState::Loading && self.lines[index].invalidated {
            // A raced line cannot adopt tokens; let the eviction find
            // a healthier home.
            return self.forward_next(now, me, msg);
        }

        // Merge the eviction into our line.
        let gains_priority = msg.priority && !self.lines[index].priority;
        let new_dirty = self.lines[index].dirty || msg.dirty;
        let would_emit =
            gains_priority && self.msb.is_present(address) && !new_dirty;
        let would_ack = gains_priority && self.msb.is_present(address) && new_dirty;
        if would_emit && !self.port.next.can_send(me, now, MINSPACE_FORWARD) {
            return Err(msg);
        }
        if would_ack && !self.p_bus.would_grant(me, now) {
            return Err(msg);
        }

        let line = &mut self.lines[index];
        let had_no_tokens = line.tokens == 0;
        line.tokens += msg.tokens;
        line.dirty = new_dirty;
        line.priority = line.priority || msg.priority;
        if had_no_tokens {
            line.absorb_bytes(&msg.data, &msg.bitmask);
        }
        log::trace!(
            "cache {}: merged eviction of {:#x}, now {} tokens",
            self.id,
            address,
            line.tokens
        );

        if gains_priority {
            let folded = self.fold_pending_writes(now, me, index, address);
            assert!(folded, "pending-write fold lost a pre-checked gate");
        }
        Ok(())
    }

    /// Fold a pending merge-store slot into its (present, non-raced)
    /// line: merge the bytes, and either let the acknowledgements
    /// ride on the already-outstanding acquisition or launch one for
    /// them. Returns `false` without touching anything when the bus
    /// grant is lost; callers have pre-checked the output gates.
    fn fold_pending_writes(
        &mut self,
        now: Cycle,
        me: Requester,
        index: usize,
        address: MemAddr,
    ) -> bool {
        if self.lines[index].invalidated || !self.msb.is_present(address) {
            return true;
        }
        // A clean loading line still has its read outstanding; the
        // completion folds the slot so the line never carries two
        // ring transactions at once.
        if self.lines[index].state == LineState::Loading && !self.lines[index].dirty {
            return true;
        }

        if self.lines[index].dirty {
            // Already acquiring every token; the buffered bytes ride
            // along and their acks are safe to deliver.
            if !self.p_bus.would_grant(me, now) {
                return false;
            }
            let slot = self.msb.take(address).expect("slot present");
            let line = &mut self.lines[index];
            for i in 0..self.line_size {
                if slot.bitmask[i] {
                    line.data[i] = slot.data[i];
                    line.valid_bytes[i] = true;
                }
            }
            let delivered = self.ack_queued(now, me, &slot.queue);
            assert!(delivered, "bus grant vanished within the cycle");
        } else {
            // Turn the buffered writes into a token acquisition of
            // their own; the slot stays put until it returns.
            let Some((data, bitmask)) = self.msb.peek(address) else {
                return true;
            };
            let line = &mut self.lines[index];
            line.dirty = true;
            line.state = LineState::Loading;
            line.updating += 1;
            for i in 0..self.line_size {
                if bitmask[i] {
                    line.data[i] = data[i];
                    line.valid_bytes[i] = true;
                }
            }

            let mut msg = Message::acquire_tokens(address, self.id);
            for i in 0..self.line_size {
                if line.valid_bytes[i] {
                    msg.data[i] = line.data[i];
                    msg.bitmask[i] = true;
                }
            }
            self.port.next.send(msg, me, now);
        }
        true
    }

    // ========================================================================
    // Ring: responses arriving from the next neighbor
    // ========================================================================

    /// Handle one response from the next neighbor.
    pub fn do_receive_next(&mut self, now: Cycle, me: Requester) -> ProcessResult {
        if self.port.next.incoming.is_empty() {
            return ProcessResult::Delayed;
        }
        if !self.p_lines.invoke(me, now) {
            return ProcessResult::Failed;
        }
        let msg = self.port.next.incoming.pop().expect("non-empty incoming");
        assert!(msg.kind.is_response(), "request on the response channel");

        let outcome = if msg.hops > 0 {
            self.on_response_passing(now, me, msg)
        } else {
            match msg.kind {
                MessageKind::ReadResponse => self.on_read_response(now, me, msg),
                MessageKind::ForwardResponse => self.on_forward_response(now, me, msg),
                _ => unreachable!(),
            }
        };
        match outcome {
            Ok(()) => ProcessResult::Success,
            Err(msg) => {
                self.port.next.incoming.push_front(msg);
                ProcessResult::Failed
            }
        }
    }

    /// A response for someone further along: decrement its hop count
    /// and let a waiting attracted copy take its share.
    fn on_response_passing(
        &mut self,
        now: Cycle,
        me: Requester,
        mut msg: Message,
    ) -> Result<(), Message> {
        if !self.port.prev.can_send(me, now, MINSPACE_FORWARD) {
            return Err(msg);
        }

        if msg.kind == MessageKind::ReadResponse {
            if let Some(index) = self.find_index(msg.address) {
                let line = &self.lines[index];
                if line.attracted && line.state == LineState::Loading {
                    if msg.tokens >= 2 {
                        // Keep one token and the data here.
                        let line = &mut self.lines[index];
                        line.state = LineState::Full;
                        line.attracted = false;
                        line.tokens = 1;
                        line.dirty = false;
                        line.data = msg.data;
                        line.valid_bytes[..self.line_size].fill(true);
                        line.access = now;
                        msg.tokens -= 1;
                        log::trace!(
                            "cache {}: attracted copy of {:#x} kept with 1 token",
                            self.id,
                            msg.address
                        );
                    } else {
                        // No surplus: give the copy back.
                        self.lines[index].clear();
                    }
                }
            }
        }

        msg.hops -= 1;
        self.port.prev.send(msg, me, now);
        Ok(())
    }

    /// A read reply reached its requester: this cache.
    fn on_read_response(
        &mut self,
        now: Cycle,
        me: Requester,
        mut msg: Message,
    ) -> Result<(), Message> {
        let address = msg.address;
        let index = self.find_genuine(address).expect("response without line");
        assert_eq!(self.lines[index].state, LineState::Loading);
        assert!(msg.tokens > 0);

        // Assemble the final line image without committing anything:
        // bytes written locally take precedence over fetched data.
        let mut merged = self.lines[index].data;
        for i in 0..self.line_size {
            if !self.lines[index].valid_bytes[i] && msg.bitmask[i] {
                merged[i] = msg.data[i];
            }
        }

        let line = &self.lines[index];
        let tokens_total = msg.tokens + line.tokens;
        assert!(tokens_total > 0, "read reply left the line token-less");
        let forwarding = line.forward;
        let surrenders = forwarding && tokens_total == 1;
        let msb_present = self.msb.is_present(address);
        // Writes buffered while the read was in flight turn into a
        // token acquisition of their own now that the line is here,
        // or start over from the slot when the copy moves on.
        let folds_msb = msb_present;
        let would_emit = (folds_msb && !line.dirty) || (surrenders && msb_present);

        if forwarding && !self.port.prev.can_send(me, now, MINSPACE_FORWARD) {
            return Err(msg);
        }
        if would_emit && !self.port.next.can_send(me, now, MINSPACE_FORWARD) {
            return Err(msg);
        }
        if !self.broadcast_read_completed(now, me, address, &merged[..self.line_size]) {
            return Err(msg);
        }

        let line = &mut self.lines[index];
        line.data = merged;
        line.valid_bytes[..self.line_size].fill(true);
        line.state = LineState::Full;
        line.priority = line.priority || msg.priority;
        line.dirty = line.dirty || msg.dirty;
        line.invalidated = false;
        line.tlock = false;
        line.access = now;
        self.stats.loads_completed += 1;

        let mut surrendered = false;
        if forwarding {
            // Pass the fresh line on to the cache that asked while we
            // were still loading. Keep one token per chained hop when
            // the reply brought enough; the chained reader always
            // gets at least one.
            let hops = line.hops;
            let keep = ((1 + hops) as i64).min(tokens_total - 1);
            line.forward = false;

            msg.hops = hops;
            msg.data = line.data;
            msg.bitmask[..self.line_size].fill(true);
            msg.dirty = false;

            if keep >= 1 {
                line.tokens = keep;
                msg.tokens = tokens_total - keep;
                msg.priority = false;
                self.port.prev.send(msg, me, now);
            } else {
                // A single token arrived: the copy moves on wholesale
                // (our clients already saw the data).
                msg.tokens = tokens_total;
                msg.priority = line.priority;
                msg.dirty = line.dirty;
                line.clear();
                surrendered = true;
                for (_, client) in self.clients.iter_mut() {
                    client.on_memory_invalidated(address);
                }
                self.port.prev.send(msg, me, now);
            }
        } else {
            line.tokens = tokens_total;
        }

        if surrendered {
            if msb_present {
                self.relaunch_from_msb(now, me, address);
            }
        } else if folds_msb {
            // The completion broadcast above already won this cycle's
            // bus grant, so the fold cannot lose it.
            let folded = self.fold_pending_writes(now, me, index, address);
            assert!(folded, "pending-write fold lost a pre-checked gate");
        }
        Ok(())
    }

    /// A forward-chain notice reached this cache.
    fn on_forward_response(
        &mut self,
        now: Cycle,
        me: Requester,
        mut msg: Message,
    ) -> Result<(), Message> {
        let address = msg.address;
        let chain = msg.tokens;
        assert!(chain >= 0, "negative forward chain distance");

        let Some(index) = self.find_genuine(address) else {
            // The line was evicted underneath the chain. Resend the
            // notice as a fresh read on the request channel so the
            // requester still gets served. The response channel now
            // depends on the request channel here; the drain property
            // test keeps this honest.
            if !self.port.next.can_send(me, now, MINSPACE_FORWARD) {
                return Err(msg);
            }
            log::warn!(
                "cache {}: forward chain for {:#x} raced an eviction, retrying as read",
                self.id,
                address
            );
            msg.kind = MessageKind::Read;
            msg.hops = (chain + 1) as u32;
            msg.tokens = 0;
            self.port.next.send(msg, me, now);
            return Ok(());
        };

        match self.lines[index].state {
            LineState::Full => {
                let line_tokens = self.lines[index].tokens;
                assert!(line_tokens > 0);
                if line_tokens > 1 + chain {
                    if !self.port.prev.can_send(me, now, MINSPACE_FORWARD) {
                        return Err(msg);
                    }
                    let line = &mut self.lines[index];
                    msg.kind = MessageKind::ReadResponse;
                    msg.tokens = line_tokens - (1 + chain);
                    msg.hops = chain as u32;
                    msg.data[..self.line_size].copy_from_slice(&line.data[..self.line_size]);
                    msg.bitmask[..self.line_size].fill(true);
                    line.tokens = 1 + chain;
                    line.access = now;
                    self.port.prev.send(msg, me, now);
                } else {
                    if !self.port.prev.can_send(me, now, MINSPACE_FORWARD) {
                        return Err(msg);
                    }
                    let line = &self.lines[index];
                    msg.kind = MessageKind::ForwardResponse;
                    msg.tokens = line.tokens - chain;
                    msg.hops = (line.tokens - 1).max(0) as u32;
                    self.port.prev.send(msg, me, now);
                }
                Ok(())
            }
            LineState::Loading => {
                if self.lines[index].forward {
                    if !self.port.prev.can_send(me, now, MINSPACE_FORWARD) {
                        return Err(msg);
                    }
                    let line = &mut self.lines[index];
                    if chain > (1 + line.hops) as i64 {
                        // The chain's target is further than our own;
                        // forward towards it with updated distances.
                        msg.hops = line.hops;
                        msg.tokens = chain - (1 + line.hops) as i64;
                    } else {
                        msg.hops = chain as u32;
                        msg.tokens = line.hops as i64 - (1 + chain);
                    }
                    self.port.prev.send(msg, me, now);
                } else {
                    let line = &mut self.lines[index];
                    line.forward = true;
                    line.hops = chain as u32;
                }
                Ok(())
            }
            LineState::Empty => unreachable!(),
        }
    }
}
