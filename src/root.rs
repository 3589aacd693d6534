//! Root directory
//!
//! The root sits on the backbone ring, owns a DDR channel, and is the
//! memory controller of its address shard. It is the only agent that
//! may originate tokens: a read or acquisition missing its table gets
//! all `NUM_TOKENS` plus the priority bit minted into it. It is also
//! the termination point of last-token evictions: once a line's full
//! token set has drained back, the line leaves the system, writing
//! back through the DDR channel when dirty.
//!
//! Addresses are sharded over the roots by
//! `(address / LINE_SIZE) mod NUM_ROOTS`; foreign messages pass
//! through untouched, detouring through the outgoing-requests buffer
//! with `ignore` set when the shortcut lacks slack, so the ring never
//! blocks on a root.

use crate::config::SimConfig;
use crate::ddr::DdrChannel;
use crate::kernel::{
    Arbitrator, Buffer, Cycle, Flag, ProcessResult, Requester, SimError, MINSPACE_FORWARD,
    MINSPACE_SHORTCUT,
};
use crate::memory::VirtualMemory;
use crate::protocol::{Message, MessageKind};
use crate::ring::NodePort;
use crate::stats::RootStats;
use crate::MemAddr;

/// One root table entry.
#[derive(Debug, Clone)]
pub struct RootLine {
    /// The entry is in use.
    pub valid: bool,
    /// Tag of the tracked address.
    pub tag: u64,
    /// Tokens parked at the root.
    pub tokens: i64,
    /// The priority token is parked here.
    pub priority: bool,
    /// An off-chip read is in flight for this line.
    pub loading: bool,
    /// The line's data is present somewhere in the system.
    pub data: bool,
    /// Hop count of the read awaiting the off-chip data, for routing
    /// the reply.
    pub hops: u32,
}

/// A root directory shard.
#[derive(Debug)]
pub struct RootDirectory {
    id: usize,
    num_roots: usize,
    line_size: usize,
    assoc: usize,
    sets: usize,
    num_tokens: i64,

    lines: Vec<RootLine>,

    /// Interfaces on the backbone ring.
    pub port: NodePort,

    /// Messages needing the DDR channel, plus detoured pass-throughs.
    requests: Buffer<Message>,
    /// Messages ready to re-enter the ring.
    responses: Buffer<Message>,
    /// Clear while an off-chip read is in flight.
    memready: Flag,
    /// The message whose off-chip read is in flight.
    active: Option<Message>,

    p_lines: Arbitrator,

    /// Event counters.
    pub stats: RootStats,
}

impl RootDirectory {
    /// Create root shard `id` of `NumRootDirectories`.
    pub fn new(id: usize, config: &SimConfig) -> Self {
        // Cover every line the caches can collectively hold.
        let assoc = config.l2_cache_associativity * config.num_caches();
        Self {
            id,
            num_roots: config.num_root_directories,
            line_size: config.cache_line_size,
            assoc,
            sets: config.l2_cache_num_sets,
            num_tokens: config.num_caches() as i64,
            lines: vec![
                RootLine {
                    valid: false,
                    tag: 0,
                    tokens: 0,
                    priority: false,
                    loading: false,
                    data: false,
                    hops: 0,
                };
                assoc * config.l2_cache_num_sets
            ],
            port: NodePort::new(&format!("root{id}"), config.cache_response_buffer_size),
            requests: Buffer::bounded(
                format!("root{id}.requests"),
                config.root_request_buffer_size,
            ),
            responses: Buffer::bounded(
                format!("root{id}.responses"),
                config.root_response_buffer_size,
            ),
            memready: Flag::new(true),
            active: None,
            p_lines: Arbitrator::new(format!("root{id}.p_lines")),
            stats: RootStats::default(),
        }
    }

    /// Root identifier.
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Whether this root has no queued or in-flight work.
    pub fn is_idle(&self) -> bool {
        self.requests.is_empty()
            && self.responses.is_empty()
            && self.active.is_none()
            && self.port.prev.incoming.is_empty()
            && self.port.prev.outgoing.is_empty()
            && self.port.next.incoming.is_empty()
            && self.port.next.outgoing.is_empty()
    }

    #[inline]
    fn owns(&self, address: MemAddr) -> bool {
        ((address / self.line_size as u64) % self.num_roots as u64) == self.id as u64
    }

    #[inline]
    fn addr_tag(&self, address: MemAddr) -> u64 {
        (address / self.line_size as u64) / self.sets as u64
    }

    #[inline]
    fn addr_set(&self, address: MemAddr) -> usize {
        ((address / self.line_size as u64) % self.sets as u64) as usize
    }

    fn find(&self, address: MemAddr) -> Option<usize> {
        let tag = self.addr_tag(address);
        let base = self.addr_set(address) * self.assoc;
        (base..base + self.assoc).find(|&i| self.lines[i].valid && self.lines[i].tag == tag)
    }

    fn allocate(&mut self, address: MemAddr) -> usize {
        let tag = self.addr_tag(address);
        let base = self.addr_set(address) * self.assoc;
        let index = (base..base + self.assoc)
            .find(|&i| !self.lines[i].valid)
            .expect("root directory set exhausted");
        let line = &mut self.lines[index];
        line.valid = true;
        line.tag = tag;
        line.tokens = 0;
        line.priority = false;
        line.loading = false;
        line.data = false;
        line.hops = 0;
        index
    }

    /// Inspect the entry for an address, if present.
    pub fn probe(&self, address: MemAddr) -> Option<&RootLine> {
        self.find(address).map(|i| &self.lines[i])
    }

    /// Iterate over valid entries with their line addresses.
    pub fn entries(&self) -> impl Iterator<Item = (MemAddr, &RootLine)> {
        self.lines
            .iter()
            .enumerate()
            .filter(|(_, l)| l.valid)
            .map(|(i, l)| {
                let set = (i / self.assoc) as u64;
                (
                    (l.tag * self.sets as u64 + set) * self.line_size as u64,
                    l,
                )
            })
    }

    /// Token contribution of queued and in-flight messages, for the
    /// conservation checker.
    pub fn in_flight_tokens(&self, address: MemAddr) -> i64 {
        self.requests
            .iter()
            .chain(self.responses.iter())
            .chain(self.active.iter())
            .filter(|m| m.address == address)
            .map(|m| m.token_contribution())
            .sum()
    }

    /// Addresses of every queued or in-flight message.
    pub fn queued_addresses(&self) -> Vec<MemAddr> {
        self.requests
            .iter()
            .chain(self.responses.iter())
            .chain(self.active.iter())
            .map(|m| m.address)
            .collect()
    }

    /// Queued or in-flight messages carrying the priority token for
    /// an address.
    pub fn queued_priority_holders(&self, address: MemAddr) -> usize {
        self.requests
            .iter()
            .chain(self.responses.iter())
            .chain(self.active.iter())
            .filter(|m| m.address == address && m.priority)
            .count()
    }

    // ========================================================================
    // Processes
    // ========================================================================

    /// Handle one request from the backbone ring.
    pub fn do_incoming(&mut self, now: Cycle, me: Requester) -> ProcessResult {
        if self.port.prev.incoming.is_empty() {
            return ProcessResult::Delayed;
        }
        if !self.p_lines.invoke(me, now) {
            return ProcessResult::Failed;
        }
        let msg = self.port.prev.incoming.pop().expect("non-empty");
        match self.on_message(now, me, msg) {
            Ok(()) => ProcessResult::Success,
            Err(msg) => {
                self.port.prev.incoming.push_front(msg);
                ProcessResult::Failed
            }
        }
    }

    /// Pass responses traveling the backbone through unchanged.
    pub fn do_in_next(&mut self, now: Cycle, me: Requester) -> ProcessResult {
        if self.port.next.incoming.is_empty() {
            return ProcessResult::Delayed;
        }
        if !self.port.prev.can_send(me, now, MINSPACE_FORWARD) {
            return ProcessResult::Failed;
        }
        let msg = self.port.next.incoming.pop().expect("non-empty");
        self.port.prev.send(msg, me, now);
        ProcessResult::Success
    }

    fn on_message(&mut self, now: Cycle, me: Requester, mut msg: Message) -> Result<(), Message> {
        if self.owns(msg.address) && !msg.ignore {
            match msg.kind {
                MessageKind::Read => return self.on_read(now, me, msg),
                MessageKind::AcquireTokens => {
                    if !msg.transient {
                        return self.on_acquire(now, me, msg);
                    }
                }
                MessageKind::Eviction => return self.on_eviction(msg),
                MessageKind::KillTokens => {
                    if let Some(index) = self.find(msg.address) {
                        // Sink of last resort for kills that found no
                        // cached line.
                        self.lines[index].tokens -= msg.tokens;
                        return Ok(());
                    }
                }
                MessageKind::LocaldirNotification => {
                    unreachable!("notifications are consumed on their local ring")
                }
                MessageKind::ReadResponse | MessageKind::ForwardResponse => {
                    unreachable!("response on the request channel")
                }
            }
        }

        self.pass_through(now, me, msg)
    }

    /// Forward a message along the backbone, taking the detour
    /// through the request buffer when the shortcut lacks slack.
    fn pass_through(&mut self, now: Cycle, me: Requester, mut msg: Message) -> Result<(), Message> {
        if self.port.next.can_send(me, now, MINSPACE_SHORTCUT) {
            msg.ignore = false;
            self.port.next.send(msg, me, now);
            return Ok(());
        }
        if !self.requests.has_space(1) {
            return Err(msg);
        }
        msg.ignore = true;
        self.requests.push(msg).ok().expect("space checked");
        Ok(())
    }

    fn on_read(&mut self, now: Cycle, me: Requester, mut msg: Message) -> Result<(), Message> {
        assert!(!msg.transient);

        let Some(index) = self.find(msg.address) else {
            // Cold miss: this address enters the system here. Mint
            // every token and fetch the data off-chip.
            assert_eq!(msg.tokens, 0);
            assert!(!msg.priority);
            if !self.requests.has_space(1) {
                return Err(msg);
            }

            let index = self.allocate(msg.address);
            let line = &mut self.lines[index];
            line.loading = true;
            line.data = false;
            line.hops = msg.hops;

            msg.tokens = self.num_tokens;
            msg.priority = true;
            log::trace!(
                "root {}: read miss {:#x}, minting {} tokens",
                self.id,
                msg.address,
                self.num_tokens
            );
            self.requests.push(msg).ok().expect("space checked");
            return Ok(());
        };

        if self.lines[index].loading {
            // Already fetching; the request keeps circulating until
            // the data lands in a cache. The ring is the buffer.
            return self.pass_through(now, me, msg);
        }

        if msg.has_complete_data(self.line_size) {
            // The message already carries the whole line (a write
            // brought it into the system); no off-chip read needed.
            let line = &mut self.lines[index];
            line.data = true;
            msg.tokens += line.tokens;
            msg.priority = msg.priority || line.priority;
            line.tokens = 0;
            line.priority = false;
            return self.pass_through(now, me, msg);
        }

        if !self.lines[index].data {
            // We track the line but its data never entered the
            // system: fetch it, attaching any parked tokens.
            if !self.requests.has_space(1) {
                return Err(msg);
            }
            let line = &mut self.lines[index];
            msg.tokens += line.tokens;
            msg.priority = msg.priority || line.priority;
            line.tokens = 0;
            line.priority = false;
            line.loading = true;
            line.hops = msg.hops;
            self.requests.push(msg).ok().expect("space checked");
            return Ok(());
        }

        // Data lives in some cache: attach our tokens and let the
        // request find it.
        let line = &mut self.lines[index];
        msg.tokens += line.tokens;
        msg.priority = msg.priority || line.priority;
        line.tokens = 0;
        line.priority = false;
        self.pass_through(now, me, msg)
    }

    fn on_acquire(&mut self, now: Cycle, me: Requester, mut msg: Message) -> Result<(), Message> {
        let index = match self.find(msg.address) {
            Some(index) => index,
            None => {
                // The address enters the system through a write.
                assert_eq!(msg.tokens, 0);
                assert!(!msg.priority);
                let index = self.allocate(msg.address);
                msg.tokens = self.num_tokens;
                msg.priority = true;
                log::trace!(
                    "root {}: token miss {:#x}, minting {} tokens",
                    self.id,
                    msg.address,
                    self.num_tokens
                );
                index
            }
        };

        if !self.lines[index].loading {
            if msg.has_complete_data(self.line_size) {
                // The writer assembled the full line; the data now
                // exists in the system without an off-chip read.
                self.lines[index].data = true;
            } else if !self.lines[index].data {
                // The write needs the missing bytes from off-chip.
                if !self.requests.has_space(1) {
                    return Err(msg);
                }
                let line = &mut self.lines[index];
                msg.tokens += line.tokens;
                msg.priority = msg.priority || line.priority;
                line.tokens = 0;
                line.priority = false;
                line.loading = true;
                line.hops = msg.hops;
                self.requests.push(msg).ok().expect("space checked");
                return Ok(());
            }
        }

        if self.lines[index].tokens > 0 || self.lines[index].priority {
            let line = &mut self.lines[index];
            msg.tokens += line.tokens;
            msg.priority = msg.priority || line.priority;
            line.tokens = 0;
            line.priority = false;
        }
        self.pass_through(now, me, msg)
    }

    fn on_eviction(&mut self, msg: Message) -> Result<(), Message> {
        let index = self.find(msg.address).expect("eviction for unknown line");
        assert!(!self.lines[index].loading);
        assert!(msg.tokens > 0);

        if self.lines[index].tokens + msg.tokens == self.num_tokens {
            // Last tokens are home: the line leaves the system.
            if msg.dirty && !self.requests.has_space(1) {
                return Err(msg);
            }
            let line = &mut self.lines[index];
            assert!(
                line.priority || msg.priority,
                "full token set without the priority token"
            );
            line.valid = false;
            self.stats.lines_retired += 1;
            log::trace!(
                "root {}: all tokens home for {:#x}, clearing line",
                self.id,
                msg.address
            );
            if msg.dirty {
                self.requests.push(msg).ok().expect("space checked");
            }
            Ok(())
        } else {
            let line = &mut self.lines[index];
            line.tokens += msg.tokens;
            line.priority = line.priority || msg.priority;
            log::trace!(
                "root {}: eviction parked {} tokens at {:#x} (now {})",
                self.id,
                msg.tokens,
                msg.address,
                line.tokens
            );
            Ok(())
        }
    }

    /// Drive the DDR channel from the request buffer.
    pub fn do_requests(
        &mut self,
        now: Cycle,
        _me: Requester,
        channel: &mut DdrChannel,
        memory: &mut VirtualMemory,
    ) -> Result<ProcessResult, SimError> {
        if self.requests.is_empty() {
            return Ok(ProcessResult::Delayed);
        }

        let msg = self.requests.front().expect("non-empty");
        if msg.ignore {
            // Detoured pass-through: recycle onto the ring.
            if !self.responses.has_space(1) {
                return Ok(ProcessResult::Failed);
            }
            let msg = self.requests.pop().expect("non-empty");
            self.responses.push(msg).ok().expect("space checked");
            return Ok(ProcessResult::Success);
        }

        match msg.kind {
            MessageKind::Read | MessageKind::AcquireTokens => {
                if !self.memready.is_set() {
                    // One off-chip read in flight per root.
                    return Ok(ProcessResult::Failed);
                }
                assert!(self.active.is_none());
                if !channel.read(msg.address, self.line_size, memory)? {
                    return Ok(ProcessResult::Failed);
                }
                let msg = self.requests.pop().expect("non-empty");
                log::trace!("root {}: off-chip read {:#x}", self.id, msg.address);
                self.memready.clear();
                self.active = Some(msg);
                self.stats.offchip_reads += 1;
                Ok(ProcessResult::Success)
            }
            MessageKind::Eviction => {
                if !channel.write(msg.address, &msg.data[..self.line_size], memory)? {
                    return Ok(ProcessResult::Failed);
                }
                let msg = self.requests.pop().expect("non-empty");
                log::trace!("root {}: writeback {:#x}", self.id, msg.address);
                self.stats.offchip_writes += 1;
                drop(msg);
                Ok(ProcessResult::Success)
            }
            _ => unreachable!("unexpected message kind in root request buffer"),
        }
    }

    /// Collect a completed off-chip read into the waiting message.
    pub fn do_completion(&mut self, _now: Cycle, channel: &mut DdrChannel) -> ProcessResult {
        if !channel.has_completion() {
            return ProcessResult::Delayed;
        }
        if !self.responses.has_space(1) {
            return ProcessResult::Failed;
        }

        let completion = channel.pop_completion().expect("completion available");
        let mut msg = self.active.take().expect("no active off-chip read");
        assert_eq!(msg.address, completion.address);

        // Bytes the system already wrote take precedence over the
        // backing store.
        for i in 0..self.line_size {
            if !msg.bitmask[i] {
                msg.data[i] = completion.data[i];
                msg.bitmask[i] = true;
            }
        }
        msg.dirty = false;

        self.responses.push(msg).ok().expect("space checked");
        self.memready.set();
        ProcessResult::Success
    }

    /// Re-inject completed and recycled messages onto the ring.
    pub fn do_responses(&mut self, now: Cycle, me: Requester) -> ProcessResult {
        if self.responses.is_empty() {
            return ProcessResult::Delayed;
        }
        if !self.p_lines.invoke(me, now) {
            return ProcessResult::Failed;
        }

        let msg = self.responses.front().expect("non-empty");
        if msg.ignore {
            // Recycled pass-through: back onto the request channel.
            if !self.port.next.can_send(me, now, MINSPACE_FORWARD) {
                return ProcessResult::Failed;
            }
            let mut msg = self.responses.pop().expect("non-empty");
            msg.ignore = false;
            self.port.next.send(msg, me, now);
            return ProcessResult::Success;
        }

        match msg.kind {
            MessageKind::Read => {
                // The off-chip data arrived: answer the requester over
                // the response channel.
                if !self.port.prev.can_send(me, now, MINSPACE_FORWARD) {
                    return ProcessResult::Failed;
                }
                let mut msg = self.responses.pop().expect("non-empty");
                let index = self.find(msg.address).expect("loading line vanished");
                let line = &mut self.lines[index];
                assert!(line.loading);
                line.loading = false;
                line.data = true;

                msg.kind = MessageKind::ReadResponse;
                msg.hops = line.hops;
                log::trace!(
                    "root {}: read response {:#x} with {} tokens, {} hops back",
                    self.id,
                    msg.address,
                    msg.tokens,
                    msg.hops
                );
                self.port.prev.send(msg, me, now);
                ProcessResult::Success
            }
            MessageKind::AcquireTokens => {
                // The missing bytes arrived; the acquisition resumes
                // its lap on the request channel.
                if !self.port.next.can_send(me, now, MINSPACE_FORWARD) {
                    return ProcessResult::Failed;
                }
                let msg = self.responses.pop().expect("non-empty");
                let index = self.find(msg.address).expect("loading line vanished");
                let line = &mut self.lines[index];
                assert!(line.loading);
                line.loading = false;
                line.data = true;
                self.port.next.send(msg, me, now);
                ProcessResult::Success
            }
            _ => unreachable!("unexpected message kind in root response buffer"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddr::DdrConfig;
    use crate::memory::Permissions;

    const ME: Requester = Requester::Process(0);

    fn harness() -> (RootDirectory, DdrChannel, VirtualMemory) {
        let config = SimConfig::default();
        let root = RootDirectory::new(0, &config);
        let channel = DdrChannel::new(DdrConfig::from_sim_config(&config));
        let mut memory = VirtualMemory::new();
        memory
            .reserve(0, 1 << 20, Permissions::READ | Permissions::WRITE)
            .unwrap();
        (root, channel, memory)
    }

    fn run_channel(channel: &mut DdrChannel, from: Cycle, cycles: Cycle) -> Cycle {
        let mut now = from;
        while now < from + cycles {
            channel.do_request(now);
            channel.do_pipeline(now);
            if channel.has_completion() {
                break;
            }
            now += 1;
        }
        now
    }

    #[test]
    fn test_cold_read_mints_all_tokens() {
        let (mut root, mut channel, mut memory) = harness();
        memory.write(0x1000, &[0x42; 8]).unwrap();

        let mut read = Message::read(0x1000, 0);
        read.hops = 3;
        root.port.prev.incoming.push(read).unwrap();
        assert_eq!(root.do_incoming(0, ME), ProcessResult::Success);

        let line = root.probe(0x1000).unwrap();
        assert!(line.loading);
        assert!(!line.data);
        assert_eq!(line.hops, 3);

        // Drive the off-chip read.
        assert_eq!(
            root.do_requests(1, ME, &mut channel, &mut memory).unwrap(),
            ProcessResult::Success
        );
        assert!(!root.memready.is_set());
        let now = run_channel(&mut channel, 1, 200);
        assert_eq!(root.do_completion(now, &mut channel), ProcessResult::Success);
        assert!(root.memready.is_set());
        assert_eq!(root.do_responses(now, ME), ProcessResult::Success);

        let reply = root.port.prev.outgoing.pop().unwrap();
        assert_eq!(reply.kind, MessageKind::ReadResponse);
        assert_eq!(reply.tokens, 4);
        assert!(reply.priority);
        assert_eq!(reply.hops, 3);
        assert_eq!(&reply.data[..8], &[0x42; 8]);

        let line = root.probe(0x1000).unwrap();
        assert!(!line.loading);
        assert!(line.data);
        assert_eq!(line.tokens, 0);
    }

    #[test]
    fn test_acquire_miss_mints_without_ddr_when_complete() {
        let (mut root, _channel, _memory) = harness();

        let mut acquire = Message::acquire_tokens(0x2000, 1);
        acquire.bitmask[..64].fill(true);
        root.port.prev.incoming.push(acquire).unwrap();
        assert_eq!(root.do_incoming(0, ME), ProcessResult::Success);

        let out = root.port.next.outgoing.pop().unwrap();
        assert_eq!(out.kind, MessageKind::AcquireTokens);
        assert_eq!(out.tokens, 4);
        assert!(out.priority);

        let line = root.probe(0x2000).unwrap();
        assert!(line.data, "the writer carries the full line");
        assert!(!line.loading);
        assert!(root.requests.is_empty(), "no off-chip read needed");
    }

    #[test]
    fn test_acquire_miss_with_partial_data_reads_offchip() {
        let (mut root, mut channel, mut memory) = harness();
        memory.write(0x3000, &[0x77; 64]).unwrap();

        let mut acquire = Message::acquire_tokens(0x3000, 1);
        acquire.data[0] = 0xAB;
        acquire.bitmask[0] = true;
        root.port.prev.incoming.push(acquire).unwrap();
        assert_eq!(root.do_incoming(0, ME), ProcessResult::Success);
        assert!(root.probe(0x3000).unwrap().loading);

        root.do_requests(1, ME, &mut channel, &mut memory).unwrap();
        let now = run_channel(&mut channel, 1, 200);
        assert_eq!(root.do_completion(now, &mut channel), ProcessResult::Success);
        assert_eq!(root.do_responses(now, ME), ProcessResult::Success);

        // Resumes on the request channel with the write byte intact.
        let out = root.port.next.outgoing.pop().unwrap();
        assert_eq!(out.kind, MessageKind::AcquireTokens);
        assert_eq!(out.tokens, 4);
        assert_eq!(out.data[0], 0xAB, "system write takes precedence");
        assert_eq!(out.data[1], 0x77);
        assert!(out.has_complete_data(64));
    }

    #[test]
    fn test_eviction_retires_line_and_writes_back() {
        let (mut root, mut channel, mut memory) = harness();

        // The line entered the system earlier.
        let mut acquire = Message::acquire_tokens(0x4000, 0);
        acquire.bitmask[..64].fill(true);
        root.port.prev.incoming.push(acquire).unwrap();
        root.do_incoming(0, ME);
        root.port.next.outgoing.pop().unwrap();

        // All four tokens come home dirty.
        let eviction = Message::eviction(0x4000, 2, 4, true, true, &[0xDD; 64]);
        root.port.prev.incoming.push(eviction).unwrap();
        assert_eq!(root.do_incoming(1, ME), ProcessResult::Success);

        assert!(root.probe(0x4000).is_none(), "line left the system");
        assert_eq!(root.stats.lines_retired, 1);

        // The writeback drains through the DDR channel.
        assert_eq!(
            root.do_requests(2, ME, &mut channel, &mut memory).unwrap(),
            ProcessResult::Success
        );
        assert_eq!(root.stats.offchip_writes, 1);
        let mut check = [0u8; 64];
        memory.read(0x4000, &mut check).unwrap();
        assert_eq!(check, [0xDD; 64]);
    }

    #[test]
    fn test_partial_eviction_parks_tokens() {
        let (mut root, _channel, _memory) = harness();

        let mut acquire = Message::acquire_tokens(0x5000, 0);
        acquire.bitmask[..64].fill(true);
        root.port.prev.incoming.push(acquire).unwrap();
        root.do_incoming(0, ME);
        root.port.next.outgoing.pop().unwrap();

        let eviction = Message::eviction(0x5000, 2, 1, false, false, &[0u8; 64]);
        root.port.prev.incoming.push(eviction).unwrap();
        assert_eq!(root.do_incoming(1, ME), ProcessResult::Success);

        let line = root.probe(0x5000).unwrap();
        assert_eq!(line.tokens, 1);
        assert!(line.valid);
    }

    #[test]
    fn test_foreign_address_passes_through_untouched() {
        let config = SimConfig {
            num_root_directories: 2,
            ..SimConfig::default()
        };
        let mut root = RootDirectory::new(0, &config);

        // Set index 1 maps to root 1.
        let mut read = Message::read(0x40, 5);
        read.tokens = 2;
        root.port.prev.incoming.push(read).unwrap();
        assert_eq!(root.do_incoming(0, ME), ProcessResult::Success);

        let out = root.port.next.outgoing.pop().unwrap();
        assert_eq!(out.tokens, 2, "no token change");
        assert!(root.probe(0x40).is_none(), "no line allocation");
    }

    #[test]
    fn test_backpressure_detours_with_ignore() {
        let config = SimConfig {
            num_root_directories: 2,
            ..SimConfig::default()
        };
        let mut root = RootDirectory::new(0, &config);

        // Fill the backbone output below shortcut slack.
        while root.port.next.outgoing.has_space(MINSPACE_SHORTCUT) {
            root.port
                .next
                .outgoing
                .push(Message::read(0x9000, 7))
                .unwrap();
        }

        let read = Message::read(0x40, 5);
        root.port.prev.incoming.push(read).unwrap();
        assert_eq!(root.do_incoming(0, ME), ProcessResult::Success);

        let queued = root.requests.front().unwrap();
        assert!(queued.ignore);

        // The detour recycles through the response buffer and back
        // onto the ring once space exists.
        assert_eq!(
            root.do_requests(1, ME, &mut DdrChannel::new(DdrConfig::from_sim_config(&config)), &mut VirtualMemory::new())
                .unwrap(),
            ProcessResult::Success
        );
        while root.port.next.outgoing.pop().is_some() {}
        assert_eq!(root.do_responses(2, ME), ProcessResult::Success);
        let out = root.port.next.outgoing.pop().unwrap();
        assert!(!out.ignore);
        assert_eq!(out.address, 0x40);
    }
}
