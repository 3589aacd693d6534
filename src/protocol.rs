//! Coherence protocol messages
//!
//! Every message on the ring is one fixed-size struct discriminated by
//! [`MessageKind`]. Requests travel clockwise (towards `next`);
//! responses travel counter-clockwise (towards `prev`) and are routed
//! purely by their hop count, decremented at every cache they pass.
//!
//! A message is owned exclusively by whichever buffer or process
//! currently holds it; handlers take it by value and either consume
//! it, mutate-and-forward it, or convert it in place (a READ becoming
//! its own READ_RESPONSE).

use crate::client::ClientId;
use crate::{CacheId, MemAddr, WriteId};

/// Upper bound of the coherence granularity; `CacheLineSize` may be
/// any power of two up to this.
pub const MAX_LINE_SIZE: usize = 64;

/// Sentinel client id for messages that do not acknowledge a single
/// bus request (merged merge-store-buffer writes are acknowledged from
/// the buffer slot instead).
pub const NO_CLIENT: ClientId = usize::MAX;

/// Discriminates the behavior of a ring message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Read request hunting for data and tokens.
    Read,
    /// Write-side request collecting every token for its address.
    AcquireTokens,
    /// An evicted line carrying its tokens (and possibly dirty data)
    /// towards a peer cache or the root directory.
    Eviction,
    /// Destroys tokens created when a cache injected a passing
    /// eviction into an empty slot.
    KillTokens,
    /// Settlement notice: transient tokens below a directory became
    /// permanent; the directory adds them to its aggregate.
    LocaldirNotification,
    /// Read reply carrying data and tokens, hop-routed to the
    /// requester.
    ReadResponse,
    /// Forward-chain notice, hop-routed; its `tokens` field encodes
    /// chain distances, not tokens.
    ForwardResponse,
}

impl MessageKind {
    /// Whether this kind travels on the response (counter-clockwise)
    /// channel.
    #[inline]
    pub fn is_response(self) -> bool {
        matches!(self, MessageKind::ReadResponse | MessageKind::ForwardResponse)
    }
}

/// One ring message.
#[derive(Debug, Clone)]
pub struct Message {
    /// Message discriminator.
    pub kind: MessageKind,
    /// Cache-line-aligned byte address the message concerns.
    pub address: MemAddr,
    /// Line data carried by the message.
    pub data: [u8; MAX_LINE_SIZE],
    /// Which bytes of `data` are valid.
    pub bitmask: [bool; MAX_LINE_SIZE],
    /// Tokens carried. Signed: a `ForwardResponse` stores chain
    /// arithmetic here and `KillTokens` counts tokens to destroy.
    pub tokens: i64,
    /// The tokens are transient: shadow copies that become permanent
    /// only when confirmed by the priority-token holder.
    pub transient: bool,
    /// The priority token travels with this message.
    pub priority: bool,
    /// Carried data differs from the backing store.
    pub dirty: bool,
    /// Cache that originated the message.
    pub source: CacheId,
    /// For requests: caches passed without service. For responses:
    /// remaining distance to the destination.
    pub hops: u32,
    /// Set when a shortcut was refused; the message takes a detour and
    /// directories skip their bookkeeping for one pass.
    pub ignore: bool,
    /// Client to acknowledge on write completion ([`NO_CLIENT`] when
    /// the acknowledgement is handled elsewhere).
    pub client: ClientId,
    /// Write identifier for the completion callback.
    pub wid: WriteId,
}

impl Message {
    fn blank(kind: MessageKind, address: MemAddr, source: CacheId) -> Self {
        Self {
            kind,
            address,
            data: [0; MAX_LINE_SIZE],
            bitmask: [false; MAX_LINE_SIZE],
            tokens: 0,
            transient: false,
            priority: false,
            dirty: false,
            source,
            hops: 0,
            ignore: false,
            client: NO_CLIENT,
            wid: 0,
        }
    }

    /// A fresh read request.
    pub fn read(address: MemAddr, source: CacheId) -> Self {
        Self::blank(MessageKind::Read, address, source)
    }

    /// A fresh token-acquisition request.
    pub fn acquire_tokens(address: MemAddr, source: CacheId) -> Self {
        Self::blank(MessageKind::AcquireTokens, address, source)
    }

    /// A fresh eviction carrying a victim line.
    pub fn eviction(
        address: MemAddr,
        source: CacheId,
        tokens: i64,
        priority: bool,
        dirty: bool,
        data: &[u8],
    ) -> Self {
        let mut msg = Self::blank(MessageKind::Eviction, address, source);
        msg.tokens = tokens;
        msg.priority = priority;
        msg.dirty = dirty;
        msg.data[..data.len()].copy_from_slice(data);
        msg.bitmask[..data.len()].fill(true);
        msg
    }

    /// A fresh token-kill request.
    pub fn kill_tokens(address: MemAddr, source: CacheId, tokens: i64) -> Self {
        let mut msg = Self::blank(MessageKind::KillTokens, address, source);
        msg.tokens = tokens;
        msg
    }

    /// A fresh transient-settlement notification.
    pub fn localdir_notification(address: MemAddr, source: CacheId, tokens: i64) -> Self {
        let mut msg = Self::blank(MessageKind::LocaldirNotification, address, source);
        msg.tokens = tokens;
        msg
    }

    /// Signed contribution of this message to the per-address token
    /// conservation sum: kills count negatively; transient tokens,
    /// forward-chain arithmetic and settlement notices (whose tokens
    /// were already made permanent at their source) count as zero.
    pub fn token_contribution(&self) -> i64 {
        match self.kind {
            MessageKind::KillTokens => -self.tokens,
            MessageKind::ForwardResponse | MessageKind::LocaldirNotification => 0,
            _ if self.transient => 0,
            _ => self.tokens,
        }
    }

    /// Permanent tokens delivered when this message returns to its
    /// source: transient tokens count only when the priority token
    /// confirmed them en route.
    pub fn permanent_tokens(&self) -> i64 {
        if self.transient && !self.priority {
            0
        } else {
            self.tokens
        }
    }

    /// Copy valid line bytes into this message's invalid bytes,
    /// marking them valid.
    pub fn merge_line_data(&mut self, data: &[u8], valid: &[bool]) {
        for i in 0..data.len() {
            if valid[i] && !self.bitmask[i] {
                self.data[i] = data[i];
                self.bitmask[i] = true;
            }
        }
    }

    /// Whether every byte of the first `line_size` bytes is valid.
    pub fn has_complete_data(&self, line_size: usize) -> bool {
        self.bitmask[..line_size].iter().all(|&b| b)
    }
}
