//! System assembly and scheduling
//!
//! Builds the full memory system from a [`SimConfig`]: local rings of
//! caches each gated by a sub-ring directory, a backbone ring of
//! directory tops and root directories, one DDR channel per root, and
//! a shared sparse backing store. Runs the discrete-event schedule:
//! every process activates at most once per cycle in a fixed order
//! (incoming traffic outranks local work), and a cycle in which
//! runnable processes exist but none makes progress counts towards
//! the deadlock grace period.
//!
//! The system also implements the protocol's checkable invariants:
//! token conservation, priority uniqueness, the data-token coupling
//! and the directory subset property.

use std::collections::HashSet;

use thiserror::Error;

use crate::cache::{Cache, LineState};
use crate::client::{ClientId, MemoryClient, RequestError};
use crate::config::{ConfigError, SimConfig};
use crate::ddr::{DdrChannel, DdrConfig};
use crate::directory::Directory;
use crate::kernel::{Cycle, ProcessResult, Requester, SimError, DEADLOCK_GRACE};
use crate::memory::{MemoryError, Permissions, VirtualMemory};
use crate::protocol::Message;
use crate::ring::{Interface, NodeId, Side};
use crate::root::RootDirectory;
use crate::stats::SystemStats;
use crate::{CacheId, MemAddr, WriteId};

/// A violated protocol invariant, reported by [`System::verify`].
#[derive(Debug, Error)]
pub enum InvariantViolation {
    /// The per-address token sum differs from `NUM_TOKENS`.
    #[error("token conservation broken at {address:#x}: counted {counted}, expected {expected}")]
    TokenConservation {
        /// Offending line address.
        address: MemAddr,
        /// Tokens counted across caches, roots and messages.
        counted: i64,
        /// The conserved total.
        expected: i64,
    },

    /// More than one agent holds the priority token.
    #[error("priority token duplicated at {address:#x}: {holders} holders")]
    PriorityDuplicated {
        /// Offending line address.
        address: MemAddr,
        /// Number of simultaneous holders.
        holders: usize,
    },

    /// A full cache line holds no token.
    #[error("cache {cache} holds {address:#x} full without tokens")]
    FullLineWithoutTokens {
        /// Offending cache.
        cache: CacheId,
        /// Offending line address.
        address: MemAddr,
    },

    /// A directory's aggregate disagrees with the ring below it.
    #[error(
        "directory {directory} tracks {tracked} tokens for {address:#x} but {below} are below"
    )]
    DirectorySubset {
        /// Offending directory.
        directory: usize,
        /// Offending line address.
        address: MemAddr,
        /// Aggregate recorded by the directory.
        tracked: i64,
        /// Tokens actually present below it.
        below: i64,
    },
}

#[derive(Debug, Clone, Copy)]
enum ProcessKind {
    DdrRequest(usize),
    DdrPipeline(usize),
    RootCompletion(usize),
    RootResponses(usize),
    RootRequests(usize),
    RootIncoming(usize),
    RootInNext(usize),
    DirInTopNext(usize),
    DirInTopPrev(usize),
    DirInBottomNext(usize),
    DirInBottomPrev(usize),
    CacheInNext(usize),
    CacheInPrev(usize),
    CacheRequests(usize),
    Transfer(NodeId, Side),
}

#[derive(Debug)]
struct ProcessEntry {
    name: String,
    kind: ProcessKind,
}

/// The assembled memory system.
#[derive(Debug)]
pub struct System {
    config: SimConfig,
    memory: VirtualMemory,
    caches: Vec<Cache>,
    directories: Vec<Directory>,
    roots: Vec<RootDirectory>,
    channels: Vec<DdrChannel>,
    nodes: Vec<NodeId>,
    processes: Vec<ProcessEntry>,
    cycle: Cycle,
    stall: u64,
    stop: bool,
}

impl System {
    /// Build the system described by `config`.
    pub fn new(config: SimConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let num_caches = config.num_caches();
        let caches: Vec<Cache> = (0..num_caches).map(|i| Cache::new(i, &config)).collect();
        let directories: Vec<Directory> = (0..config.num_rings)
            .map(|r| Directory::new(r, r * config.num_l2_caches_per_ring, &config))
            .collect();
        let roots: Vec<RootDirectory> = (0..config.num_root_directories)
            .map(|i| RootDirectory::new(i, &config))
            .collect();
        let channels: Vec<DdrChannel> = (0..config.num_root_directories)
            .map(|_| DdrChannel::new(DdrConfig::from_sim_config(&config)))
            .collect();

        // Ring membership, clockwise. Each local ring starts at its
        // directory's bottom node; the backbone carries the directory
        // tops followed by the roots.
        let mut nodes = Vec::new();
        for r in 0..config.num_rings {
            nodes.push(NodeId::DirBottom(r));
            for c in 0..config.num_l2_caches_per_ring {
                nodes.push(NodeId::Cache(r * config.num_l2_caches_per_ring + c));
            }
        }
        for r in 0..config.num_rings {
            nodes.push(NodeId::DirTop(r));
        }
        for i in 0..config.num_root_directories {
            nodes.push(NodeId::Root(i));
        }

        let mut system = Self {
            memory: VirtualMemory::new(),
            caches,
            directories,
            roots,
            channels,
            nodes,
            processes: Vec::new(),
            cycle: 0,
            stall: 0,
            stop: false,
            config,
        };
        system.build_process_table();

        log::info!(
            "system: {} rings x {} caches, {} roots, {} tokens per line, {}-byte lines",
            system.config.num_rings,
            system.config.num_l2_caches_per_ring,
            system.config.num_root_directories,
            system.config.num_caches(),
            system.config.cache_line_size
        );
        Ok(system)
    }

    fn build_process_table(&mut self) {
        let mut table = Vec::new();
        for i in 0..self.channels.len() {
            table.push(ProcessEntry {
                name: format!("ddr{i}.request"),
                kind: ProcessKind::DdrRequest(i),
            });
            table.push(ProcessEntry {
                name: format!("ddr{i}.pipeline"),
                kind: ProcessKind::DdrPipeline(i),
            });
        }
        for i in 0..self.roots.len() {
            table.push(ProcessEntry {
                name: format!("root{i}.completion"),
                kind: ProcessKind::RootCompletion(i),
            });
            table.push(ProcessEntry {
                name: format!("root{i}.responses"),
                kind: ProcessKind::RootResponses(i),
            });
            table.push(ProcessEntry {
                name: format!("root{i}.requests"),
                kind: ProcessKind::RootRequests(i),
            });
            table.push(ProcessEntry {
                name: format!("root{i}.incoming"),
                kind: ProcessKind::RootIncoming(i),
            });
            table.push(ProcessEntry {
                name: format!("root{i}.incoming-next"),
                kind: ProcessKind::RootInNext(i),
            });
        }
        for i in 0..self.directories.len() {
            table.push(ProcessEntry {
                name: format!("dir{i}.top-incoming-next"),
                kind: ProcessKind::DirInTopNext(i),
            });
            table.push(ProcessEntry {
                name: format!("dir{i}.top-incoming-prev"),
                kind: ProcessKind::DirInTopPrev(i),
            });
            table.push(ProcessEntry {
                name: format!("dir{i}.bottom-incoming-next"),
                kind: ProcessKind::DirInBottomNext(i),
            });
            table.push(ProcessEntry {
                name: format!("dir{i}.bottom-incoming-prev"),
                kind: ProcessKind::DirInBottomPrev(i),
            });
        }
        for i in 0..self.caches.len() {
            table.push(ProcessEntry {
                name: format!("cache{i}.incoming-next"),
                kind: ProcessKind::CacheInNext(i),
            });
            table.push(ProcessEntry {
                name: format!("cache{i}.incoming-prev"),
                kind: ProcessKind::CacheInPrev(i),
            });
            table.push(ProcessEntry {
                name: format!("cache{i}.requests"),
                kind: ProcessKind::CacheRequests(i),
            });
        }
        for &node in &self.nodes {
            table.push(ProcessEntry {
                name: format!("{node:?}.outgoing-next"),
                kind: ProcessKind::Transfer(node, Side::Next),
            });
            table.push(ProcessEntry {
                name: format!("{node:?}.outgoing-prev"),
                kind: ProcessKind::Transfer(node, Side::Prev),
            });
        }
        self.processes = table;
    }

    // ========================================================================
    // Topology
    // ========================================================================

    /// Clockwise neighbor of a node on its ring.
    fn next_of(&self, node: NodeId) -> NodeId {
        let ring = self.ring_of(node);
        let pos = ring.iter().position(|&n| n == node).expect("node on ring");
        ring[(pos + 1) % ring.len()]
    }

    /// Counter-clockwise neighbor of a node on its ring.
    fn prev_of(&self, node: NodeId) -> NodeId {
        let ring = self.ring_of(node);
        let pos = ring.iter().position(|&n| n == node).expect("node on ring");
        ring[(pos + ring.len() - 1) % ring.len()]
    }

    fn ring_of(&self, node: NodeId) -> Vec<NodeId> {
        match node {
            NodeId::Cache(c) => {
                let ring = c / self.config.num_l2_caches_per_ring;
                self.local_ring(ring)
            }
            NodeId::DirBottom(r) => self.local_ring(r),
            NodeId::DirTop(_) | NodeId::Root(_) => self.backbone(),
        }
    }

    fn local_ring(&self, ring: usize) -> Vec<NodeId> {
        let k = self.config.num_l2_caches_per_ring;
        let mut nodes = vec![NodeId::DirBottom(ring)];
        nodes.extend((0..k).map(|c| NodeId::Cache(ring * k + c)));
        nodes
    }

    fn backbone(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = (0..self.config.num_rings).map(NodeId::DirTop).collect();
        nodes.extend((0..self.config.num_root_directories).map(NodeId::Root));
        nodes
    }

    fn iface(&self, node: NodeId, side: Side) -> &Interface {
        match node {
            NodeId::Cache(i) => self.caches[i].port.side(side),
            NodeId::DirBottom(i) => self.directories[i].bottom.side(side),
            NodeId::DirTop(i) => self.directories[i].top.side(side),
            NodeId::Root(i) => self.roots[i].port.side(side),
        }
    }

    fn iface_mut(&mut self, node: NodeId, side: Side) -> &mut Interface {
        match node {
            NodeId::Cache(i) => self.caches[i].port.side_mut(side),
            NodeId::DirBottom(i) => self.directories[i].bottom.side_mut(side),
            NodeId::DirTop(i) => self.directories[i].top.side_mut(side),
            NodeId::Root(i) => self.roots[i].port.side_mut(side),
        }
    }

    /// Move one message across the link leaving `node` on `side`.
    fn do_transfer(&mut self, node: NodeId, side: Side) -> ProcessResult {
        if self.iface(node, side).outgoing.is_empty() {
            return ProcessResult::Delayed;
        }
        let (dest, dest_side) = match side {
            Side::Next => (self.next_of(node), Side::Prev),
            Side::Prev => (self.prev_of(node), Side::Next),
        };
        if !self.iface(dest, dest_side).incoming.has_space(1) {
            return ProcessResult::Failed;
        }
        let msg = self
            .iface_mut(node, side)
            .outgoing
            .pop()
            .expect("non-empty outgoing");
        self.iface_mut(dest, dest_side)
            .incoming
            .push(msg)
            .ok()
            .expect("space checked");
        ProcessResult::Success
    }

    // ========================================================================
    // Public interface
    // ========================================================================

    /// The configuration the system was built with.
    #[inline]
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Current cycle number.
    #[inline]
    pub fn current_cycle(&self) -> Cycle {
        self.cycle
    }

    /// Reserve a backing-store range.
    pub fn reserve(
        &mut self,
        address: MemAddr,
        size: u64,
        perms: Permissions,
    ) -> Result<(), MemoryError> {
        self.memory.reserve(address, size, perms)
    }

    /// The backing store.
    #[inline]
    pub fn memory(&self) -> &VirtualMemory {
        &self.memory
    }

    /// Install a client on a cache.
    pub fn register_client(
        &mut self,
        cache: CacheId,
        client: Box<dyn MemoryClient>,
    ) -> Result<ClientId, RequestError> {
        self.caches[cache].register_client(client)
    }

    /// Remove a client from a cache.
    pub fn unregister_client(
        &mut self,
        cache: CacheId,
        client: ClientId,
    ) -> Result<(), RequestError> {
        self.caches[cache].unregister_client(client)
    }

    /// Submit a line read on a cache. Returns the admission status.
    pub fn cache_read(
        &mut self,
        cache: CacheId,
        client: ClientId,
        address: MemAddr,
    ) -> Result<bool, RequestError> {
        let now = self.cycle;
        self.caches[cache].read(now, client, address)
    }

    /// Submit a write on a cache. Returns the admission status.
    pub fn cache_write(
        &mut self,
        cache: CacheId,
        client: ClientId,
        address: MemAddr,
        data: &[u8],
        wid: WriteId,
    ) -> Result<bool, RequestError> {
        let now = self.cycle;
        self.caches[cache].write(now, client, address, data, wid)
    }

    /// Inspect a cache.
    #[inline]
    pub fn cache(&self, id: CacheId) -> &Cache {
        &self.caches[id]
    }

    /// Inspect a sub-ring directory.
    #[inline]
    pub fn directory(&self, id: usize) -> &Directory {
        &self.directories[id]
    }

    /// Inspect a root directory.
    #[inline]
    pub fn root(&self, id: usize) -> &RootDirectory {
        &self.roots[id]
    }

    /// Ask the run loops to return after the current cycle.
    pub fn request_stop(&mut self) {
        self.stop = true;
    }

    /// Aggregate statistics.
    pub fn stats(&self) -> SystemStats {
        let mut stats = SystemStats {
            cycles: self.cycle,
            ..SystemStats::default()
        };
        for cache in &self.caches {
            stats.add_cache(&cache.stats);
        }
        for root in &self.roots {
            stats.add_root(&root.stats);
        }
        stats
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Advance the system by one cycle.
    pub fn step(&mut self) -> Result<(), SimError> {
        let now = self.cycle;
        let mut any_success = false;
        let mut stalled: Vec<usize> = Vec::new();

        for index in 0..self.processes.len() {
            let me = Requester::Process(index);
            let kind = self.processes[index].kind;
            let result = match kind {
                ProcessKind::DdrRequest(i) => self.channels[i].do_request(now),
                ProcessKind::DdrPipeline(i) => self.channels[i].do_pipeline(now),
                ProcessKind::RootCompletion(i) => {
                    let channel = &mut self.channels[i];
                    self.roots[i].do_completion(now, channel)
                }
                ProcessKind::RootResponses(i) => self.roots[i].do_responses(now, me),
                ProcessKind::RootRequests(i) => {
                    let (root, channel) = (&mut self.roots[i], &mut self.channels[i]);
                    root.do_requests(now, me, channel, &mut self.memory)?
                }
                ProcessKind::RootIncoming(i) => self.roots[i].do_incoming(now, me),
                ProcessKind::RootInNext(i) => self.roots[i].do_in_next(now, me),
                ProcessKind::DirInTopNext(i) => self.directories[i].do_in_top_next(now, me),
                ProcessKind::DirInTopPrev(i) => self.directories[i].do_in_top_prev(now, me),
                ProcessKind::DirInBottomNext(i) => self.directories[i].do_in_bottom_next(now, me),
                ProcessKind::DirInBottomPrev(i) => self.directories[i].do_in_bottom_prev(now, me),
                ProcessKind::CacheInNext(i) => self.caches[i].do_receive_next(now, me),
                ProcessKind::CacheInPrev(i) => self.caches[i].do_receive_prev(now, me),
                ProcessKind::CacheRequests(i) => self.caches[i].do_requests(now, me),
                ProcessKind::Transfer(node, side) => self.do_transfer(node, side),
            };
            match result {
                ProcessResult::Success => any_success = true,
                ProcessResult::Failed => stalled.push(index),
                ProcessResult::Delayed => {}
            }
        }

        if any_success || stalled.is_empty() {
            self.stall = 0;
        } else {
            self.stall += 1;
            if self.stall >= DEADLOCK_GRACE {
                let names = stalled
                    .iter()
                    .map(|&i| self.processes[i].name.clone())
                    .collect();
                log::warn!("deadlock detected at cycle {now}");
                return Err(SimError::Deadlock {
                    cycle: now,
                    grace: DEADLOCK_GRACE,
                    stalled: names,
                });
            }
        }

        self.cycle += 1;
        Ok(())
    }

    /// Run for `cycles` cycles or until a stop request.
    pub fn run(&mut self, cycles: u64) -> Result<(), SimError> {
        for _ in 0..cycles {
            if self.stop {
                break;
            }
            self.step()?;
        }
        Ok(())
    }

    /// Whether no component has pending work.
    pub fn is_idle(&self) -> bool {
        self.caches.iter().all(Cache::is_idle)
            && self.directories.iter().all(Directory::is_idle)
            && self.roots.iter().all(RootDirectory::is_idle)
            && self.channels.iter().all(DdrChannel::idle)
    }

    /// Run until every buffer and channel drains, up to `max_cycles`.
    /// Returns the number of cycles consumed.
    pub fn run_until_idle(&mut self, max_cycles: u64) -> Result<u64, SimError> {
        let start = self.cycle;
        while !self.is_idle() {
            if self.cycle - start >= max_cycles {
                return Err(SimError::NoQuiescence(max_cycles));
            }
            self.step()?;
        }
        Ok(self.cycle - start)
    }

    // ========================================================================
    // Invariant checking
    // ========================================================================

    fn for_each_message<F: FnMut(NodeId, &Message)>(&self, mut f: F) {
        for &node in &self.nodes {
            for side in [Side::Prev, Side::Next] {
                let iface = self.iface(node, side);
                for msg in iface.incoming.iter().chain(iface.outgoing.iter()) {
                    f(node, msg);
                }
            }
        }
    }

    fn touched_addresses(&self) -> HashSet<MemAddr> {
        let mut addresses = HashSet::new();
        for cache in &self.caches {
            for (address, _) in cache.lines() {
                addresses.insert(address);
            }
        }
        for dir in &self.directories {
            for address in dir.tracked_addresses() {
                addresses.insert(address);
            }
        }
        for root in &self.roots {
            for (address, _) in root.entries() {
                addresses.insert(address);
            }
            for address in root.queued_addresses() {
                addresses.insert(address);
            }
        }
        self.for_each_message(|_, msg| {
            addresses.insert(msg.address);
        });
        addresses
    }

    /// Check invariants 1-4 for every touched address. Exact at
    /// quiescent cycles; transient token shuffles may be in flight
    /// mid-protocol.
    pub fn verify(&self) -> Result<(), InvariantViolation> {
        let num_tokens = self.config.num_caches() as i64;

        for address in self.touched_addresses() {
            // Invariant 3: a full line holds at least one token.
            for cache in &self.caches {
                if let Some(line) = cache.probe(address) {
                    if line.state == LineState::Full && line.tokens < 1 {
                        return Err(InvariantViolation::FullLineWithoutTokens {
                            cache: cache.id(),
                            address,
                        });
                    }
                }
            }

            // Invariant 1: token conservation, counted while the root
            // tracks the address.
            let cache_tokens: i64 = self
                .caches
                .iter()
                .filter_map(|c| c.probe(address))
                .map(|l| l.tokens)
                .sum();
            let root_tokens: i64 = self
                .roots
                .iter()
                .filter_map(|r| r.probe(address))
                .map(|l| l.tokens)
                .sum();
            let mut in_flight: i64 = 0;
            self.for_each_message(|_, msg| {
                if msg.address == address {
                    in_flight += msg.token_contribution();
                }
            });
            for root in &self.roots {
                in_flight += root.in_flight_tokens(address);
            }

            let tracked_by_root = self.roots.iter().any(|r| r.probe(address).is_some());
            if tracked_by_root {
                let counted = cache_tokens + root_tokens + in_flight;
                if counted != num_tokens {
                    return Err(InvariantViolation::TokenConservation {
                        address,
                        counted,
                        expected: num_tokens,
                    });
                }
            }

            // Invariant 2: at most one priority holder.
            let mut holders = self
                .caches
                .iter()
                .filter_map(|c| c.probe(address))
                .filter(|l| l.priority)
                .count();
            holders += self
                .roots
                .iter()
                .filter_map(|r| r.probe(address))
                .filter(|l| l.priority)
                .count();
            self.for_each_message(|_, msg| {
                if msg.address == address && msg.priority {
                    holders += 1;
                }
            });
            for root in &self.roots {
                holders += root.queued_priority_holders(address);
            }
            if holders > 1 {
                return Err(InvariantViolation::PriorityDuplicated { address, holders });
            }

            // Invariant 4: each directory's aggregate equals the
            // tokens below it (lines plus local-ring messages).
            for (d, dir) in self.directories.iter().enumerate() {
                let k = self.config.num_l2_caches_per_ring;
                let below_caches = d * k..(d + 1) * k;
                let mut below: i64 = self
                    .caches
                    .iter()
                    .filter(|c| below_caches.contains(&c.id()))
                    .filter_map(|c| c.probe(address))
                    .map(|l| l.tokens)
                    .sum();
                self.for_each_message(|node, msg| {
                    if msg.address != address {
                        return;
                    }
                    let in_ring = match node {
                        NodeId::Cache(c) => below_caches.contains(&c),
                        NodeId::DirBottom(r) => r == d,
                        _ => false,
                    };
                    if in_ring {
                        below += msg.token_contribution();
                    }
                });
                let tracked = dir.probe(address).map(|l| l.tokens).unwrap_or(0);
                if tracked != below {
                    return Err(InvariantViolation::DirectorySubset {
                        directory: d,
                        address,
                        tracked,
                        below,
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction_rejects_invalid_config() {
        let config = SimConfig {
            cache_line_size: 48,
            ..SimConfig::default()
        };
        assert!(System::new(config).is_err());
    }

    #[test]
    fn test_fresh_system_is_idle_and_coherent() {
        let mut system = System::new(SimConfig::default()).unwrap();
        assert!(system.is_idle());
        assert!(system.verify().is_ok());
        system.run(10).unwrap();
        assert_eq!(system.current_cycle(), 10);
        assert!(system.is_idle());
    }

    #[test]
    fn test_ring_wiring_is_circular() {
        let config = SimConfig {
            num_rings: 2,
            num_l2_caches_per_ring: 2,
            num_root_directories: 2,
            ..SimConfig::default()
        };
        let system = System::new(config).unwrap();

        // Local ring 0: dir0 -> cache0 -> cache1 -> dir0.
        assert_eq!(system.next_of(NodeId::DirBottom(0)), NodeId::Cache(0));
        assert_eq!(system.next_of(NodeId::Cache(0)), NodeId::Cache(1));
        assert_eq!(system.next_of(NodeId::Cache(1)), NodeId::DirBottom(0));
        assert_eq!(system.prev_of(NodeId::DirBottom(0)), NodeId::Cache(1));

        // Backbone: dir0 -> dir1 -> root0 -> root1 -> dir0.
        assert_eq!(system.next_of(NodeId::DirTop(0)), NodeId::DirTop(1));
        assert_eq!(system.next_of(NodeId::DirTop(1)), NodeId::Root(0));
        assert_eq!(system.next_of(NodeId::Root(1)), NodeId::DirTop(0));
    }
}
