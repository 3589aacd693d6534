//! Sub-ring directory
//!
//! A directory sits between a local ring of caches and the backbone
//! ring. It holds no data: each line is a filter entry recording how
//! many tokens for an address live below it. Requests from below
//! always ascend; requests from above descend exactly when the
//! directory knows the address has tokens below, and otherwise
//! shortcut along the backbone. Responses ascend from the local ring
//! unconditionally (their reverse path went down here) and descend
//! when their remaining hop count lies within this group.
//!
//! A shortcut requires [`MINSPACE_SHORTCUT`] free slots so a plain
//! forward can always squeeze past; when the slack is missing, the
//! message detours down the local ring with its `ignore` flag set and
//! re-ascends untouched.

use crate::config::SimConfig;
use crate::kernel::{
    Arbitrator, Cycle, ProcessResult, Requester, MINSPACE_FORWARD, MINSPACE_SHORTCUT,
};
use crate::protocol::{Message, MessageKind};
use crate::ring::NodePort;
use crate::{CacheId, MemAddr};

/// One directory filter entry.
#[derive(Debug, Clone)]
pub struct DirLine {
    /// The entry is in use.
    pub valid: bool,
    /// Tag of the tracked address.
    pub tag: u64,
    /// Tokens held by the caches (and in-flight messages) below.
    pub tokens: i64,
}

/// A sub-ring directory.
#[derive(Debug)]
pub struct Directory {
    id: usize,
    line_size: usize,
    assoc: usize,
    sets: usize,
    group_size: usize,
    first_cache: CacheId,
    last_cache: CacheId,

    lines: Vec<DirLine>,

    /// Interfaces on the local ring.
    pub bottom: NodePort,
    /// Interfaces on the backbone ring.
    pub top: NodePort,

    p_lines: Arbitrator,
}

impl Directory {
    /// Create the directory guarding caches
    /// `[first_cache, first_cache + NumL2CachesPerRing)`.
    pub fn new(id: usize, first_cache: CacheId, config: &SimConfig) -> Self {
        let group_size = config.num_l2_caches_per_ring;
        // The directory must be able to track every line the caches
        // below can hold at once.
        let assoc = config.l2_cache_associativity * group_size;
        assert!(assoc >= config.l2_cache_associativity * group_size);

        Self {
            id,
            line_size: config.cache_line_size,
            assoc,
            sets: config.l2_cache_num_sets,
            group_size,
            first_cache,
            last_cache: first_cache + group_size - 1,
            lines: vec![
                DirLine {
                    valid: false,
                    tag: 0,
                    tokens: 0,
                };
                assoc * config.l2_cache_num_sets
            ],
            bottom: NodePort::new(&format!("dir{id}.bottom"), config.cache_response_buffer_size),
            top: NodePort::new(&format!("dir{id}.top"), config.cache_response_buffer_size),
            p_lines: Arbitrator::new(format!("dir{id}.p_lines")),
        }
    }

    /// Directory identifier.
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Whether all four interfaces are drained.
    pub fn is_idle(&self) -> bool {
        [&self.bottom, &self.top].iter().all(|port| {
            port.prev.incoming.is_empty()
                && port.prev.outgoing.is_empty()
                && port.next.incoming.is_empty()
                && port.next.outgoing.is_empty()
        })
    }

    #[inline]
    fn is_below(&self, cache: CacheId) -> bool {
        (self.first_cache..=self.last_cache).contains(&cache)
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

    /// Allocate an entry; the directory is sized to cover every cache
    /// below, so exhaustion is a protocol violation.
    fn allocate(&mut self, address: MemAddr) -> usize {
        let tag = self.addr_tag(address);
        let base = self.addr_set(address) * self.assoc;
        let index = (base..base + self.assoc)
            .find(|&i| !self.lines[i].valid)
            .expect("directory set exhausted: associativity no longer covers the caches below");
        let line = &mut self.lines[index];
        line.valid = true;
        line.tag = tag;
        line.tokens = 0;
        index
    }

    fn find_or_allocate(&mut self, address: MemAddr) -> usize {
        match self.find(address) {
            Some(i) => i,
            None => self.allocate(address),
        }
    }

    /// Inspect the entry for an address, if present.
    pub fn probe(&self, address: MemAddr) -> Option<&DirLine> {
        self.find(address).map(|i| &self.lines[i])
    }

    /// Iterate over the valid entries with their tags.
    pub fn entries(&self) -> impl Iterator<Item = &DirLine> {
        self.lines.iter().filter(|l| l.valid)
    }

    /// Line-aligned addresses of all valid entries.
    pub fn tracked_addresses(&self) -> Vec<MemAddr> {
        self.lines
            .iter()
            .enumerate()
            .filter(|(_, l)| l.valid)
            .map(|(i, l)| {
                let set = (i / self.assoc) as u64;
                (l.tag * self.sets as u64 + set) * self.line_size as u64
            })
            .collect()
    }

    // ========================================================================
    // Processes
    // ========================================================================

    /// Requests arriving from the last cache of the local ring.
    pub fn do_in_bottom_prev(&mut self, now: Cycle, me: Requester) -> ProcessResult {
        if self.bottom.prev.incoming.is_empty() {
            return ProcessResult::Delayed;
        }
        if !self.p_lines.invoke(me, now) {
            return ProcessResult::Failed;
        }
        let msg = self.bottom.prev.incoming.pop().expect("non-empty");
        match self.on_bottom_request(now, me, msg) {
            Ok(()) => ProcessResult::Success,
            Err(msg) => {
                self.bottom.prev.incoming.push_front(msg);
                ProcessResult::Failed
            }
        }
    }

    /// Responses ascending out of the local ring.
    pub fn do_in_bottom_next(&mut self, now: Cycle, me: Requester) -> ProcessResult {
        if self.bottom.next.incoming.is_empty() {
            return ProcessResult::Delayed;
        }
        if !self.p_lines.invoke(me, now) {
            return ProcessResult::Failed;
        }
        let msg = self.bottom.next.incoming.pop().expect("non-empty");
        match self.on_bottom_response(now, me, msg) {
            Ok(()) => ProcessResult::Success,
            Err(msg) => {
                self.bottom.next.incoming.push_front(msg);
                ProcessResult::Failed
            }
        }
    }

    /// Requests arriving on the backbone ring.
    pub fn do_in_top_prev(&mut self, now: Cycle, me: Requester) -> ProcessResult {
        if self.top.prev.incoming.is_empty() {
            return ProcessResult::Delayed;
        }
        if !self.p_lines.invoke(me, now) {
            return ProcessResult::Failed;
        }
        let msg = self.top.prev.incoming.pop().expect("non-empty");
        match self.on_top_request(now, me, msg) {
            Ok(()) => ProcessResult::Success,
            Err(msg) => {
                self.top.prev.incoming.push_front(msg);
                ProcessResult::Failed
            }
        }
    }

    /// Responses arriving on the backbone ring.
    pub fn do_in_top_next(&mut self, now: Cycle, me: Requester) -> ProcessResult {
        if self.top.next.incoming.is_empty() {
            return ProcessResult::Delayed;
        }
        if !self.p_lines.invoke(me, now) {
            return ProcessResult::Failed;
        }
        let msg = self.top.next.incoming.pop().expect("non-empty");
        match self.on_top_response(now, me, msg) {
            Ok(()) => ProcessResult::Success,
            Err(msg) => {
                self.top.next.incoming.push_front(msg);
                ProcessResult::Failed
            }
        }
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    fn on_bottom_request(
        &mut self,
        now: Cycle,
        me: Requester,
        mut msg: Message,
    ) -> Result<(), Message> {
        let consumed_here = !msg.ignore && msg.kind == MessageKind::LocaldirNotification;
        if !consumed_here && !self.top.next.can_send(me, now, MINSPACE_FORWARD) {
            return Err(msg);
        }

        if !msg.ignore {
            match msg.kind {
                MessageKind::Read => assert!(!msg.transient),
                MessageKind::AcquireTokens => {}
                MessageKind::Eviction => {
                    assert!(msg.tokens > 0);
                    assert!(!msg.transient);
                    assert!(self.is_below(msg.source), "evictions never descend");
                }
                MessageKind::KillTokens => {
                    // The synthetic tokens this kill will destroy stay
                    // below until it finds them; track them.
                    let index = self.find_or_allocate(msg.address);
                    self.lines[index].tokens += msg.tokens;
                }
                MessageKind::LocaldirNotification => {
                    // Transient tokens below became permanent.
                    let index = self.find_or_allocate(msg.address);
                    self.lines[index].tokens += msg.tokens;
                    log::trace!(
                        "dir {}: settled {} transient tokens for {:#x}",
                        self.id,
                        msg.tokens,
                        msg.address
                    );
                    return Ok(());
                }
                MessageKind::ReadResponse | MessageKind::ForwardResponse => {
                    unreachable!("response on the request channel")
                }
            }

            if msg.tokens > 0
                && !msg.transient
                && !matches!(msg.kind, MessageKind::KillTokens)
            {
                // Tokens are leaving the group.
                let index = self.find(msg.address).expect("tokens leaving unknown line");
                let line = &mut self.lines[index];
                line.tokens -= msg.tokens;
                assert!(line.tokens >= 0, "directory undercount");
                if line.tokens == 0 {
                    line.valid = false;
                }
            }
        }

        msg.ignore = false;
        self.top.next.send(msg, me, now);
        Ok(())
    }

    fn on_top_request(
        &mut self,
        now: Cycle,
        me: Requester,
        mut msg: Message,
    ) -> Result<(), Message> {
        let from_below = self.is_below(msg.source);

        let line = match msg.kind {
            MessageKind::Read | MessageKind::AcquireTokens => {
                if msg.kind == MessageKind::Read {
                    assert!(!msg.transient);
                }
                self.find(msg.address)
            }
            MessageKind::Eviction => {
                assert!(msg.tokens > 0);
                assert!(!msg.transient);
                // Evictions travel the backbone to their root.
                None
            }
            // A kill from another group descends to hunt below; one
            // of ours already searched down there.
            MessageKind::KillTokens => {
                if from_below {
                    None
                } else {
                    self.find(msg.address)
                }
            }
            MessageKind::LocaldirNotification => {
                unreachable!("notifications are consumed on their local ring")
            }
            MessageKind::ReadResponse | MessageKind::ForwardResponse => {
                unreachable!("response on the request channel")
            }
        };

        // Route: down when the address lives below, otherwise along
        // the backbone, detouring down when the shortcut lacks slack.
        enum Route {
            Down,
            Shortcut,
            Detour,
        }
        let route = if line.is_some()
            || (from_below && matches!(msg.kind, MessageKind::Read | MessageKind::AcquireTokens))
        {
            Route::Down
        } else if self.top.next.can_send(me, now, MINSPACE_SHORTCUT) {
            Route::Shortcut
        } else if self.bottom.next.can_send(me, now, MINSPACE_FORWARD) {
            Route::Detour
        } else {
            return Err(msg);
        };
        if matches!(route, Route::Down) && !self.bottom.next.can_send(me, now, MINSPACE_FORWARD) {
            return Err(msg);
        }

        // Wrap-around: a request from below finished its lap of the
        // backbone; whatever it carries re-enters the group.
        if from_below
            && !msg.transient
            && matches!(msg.kind, MessageKind::Read | MessageKind::AcquireTokens)
        {
            let index = self.find_or_allocate(msg.address);
            if line.is_none() {
                log::trace!(
                    "dir {}: tracking {:#x} for returning request of cache {}",
                    self.id,
                    msg.address,
                    msg.source
                );
            }
            self.lines[index].tokens += msg.tokens;
        } else if !from_below && msg.kind == MessageKind::KillTokens && line.is_some() {
            // The kill descends: the tokens it will destroy leave the
            // global count through this group.
            let index = line.expect("checked");
            self.lines[index].tokens -= msg.tokens;
        }

        match route {
            Route::Down => self.bottom.next.send(msg, me, now),
            Route::Shortcut => self.top.next.send(msg, me, now),
            Route::Detour => {
                msg.ignore = true;
                log::trace!(
                    "dir {}: shortcut full, detouring {:#x} down the local ring",
                    self.id,
                    msg.address
                );
                self.bottom.next.send(msg, me, now);
            }
        }
        Ok(())
    }

    fn on_bottom_response(
        &mut self,
        now: Cycle,
        me: Requester,
        msg: Message,
    ) -> Result<(), Message> {
        // Responses always re-ascend; their outbound path descended
        // through this directory.
        if !self.top.prev.can_send(me, now, MINSPACE_FORWARD) {
            return Err(msg);
        }

        let contribution = msg.token_contribution();
        if contribution != 0 {
            let index = self.find(msg.address).expect("response tokens leaving unknown line");
            let line = &mut self.lines[index];
            line.tokens -= contribution;
            assert!(line.tokens >= 0, "directory undercount on response");
            if line.tokens == 0 {
                line.valid = false;
            }
        }

        self.top.prev.send(msg, me, now);
        Ok(())
    }

    fn on_top_response(
        &mut self,
        now: Cycle,
        me: Requester,
        mut msg: Message,
    ) -> Result<(), Message> {
        if (msg.hops as usize) < self.group_size {
            // Destination is below: descend.
            if !self.bottom.prev.can_send(me, now, MINSPACE_FORWARD) {
                return Err(msg);
            }
            let contribution = msg.token_contribution();
            if contribution != 0 {
                let index = self.find_or_allocate(msg.address);
                self.lines[index].tokens += contribution;
            }
            self.bottom.prev.send(msg, me, now);
        } else {
            if !self.top.prev.can_send(me, now, MINSPACE_FORWARD) {
                return Err(msg);
            }
            msg.hops -= self.group_size as u32;
            self.top.prev.send(msg, me, now);
        }
        Ok(())
    }
}
