//! Cache line state

use crate::kernel::Cycle;
use crate::protocol::MAX_LINE_SIZE;

/// Lifecycle state of a cache line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    /// Empty, can be allocated.
    Empty,
    /// Allocated, a request for the line is outstanding.
    Loading,
    /// Allocated with data present.
    Full,
}

/// One way of one set.
#[derive(Debug, Clone)]
pub struct CacheLine {
    /// Lifecycle state.
    pub state: LineState,
    /// Tag (address / line size / number of sets).
    pub tag: u64,
    /// Line data.
    pub data: [u8; MAX_LINE_SIZE],
    /// Which bytes of `data` are known good. Writes can land before
    /// the read reply arrives.
    pub valid_bytes: [bool; MAX_LINE_SIZE],
    /// Tokens held here. Signed: token kills may be applied to a
    /// loading line before its reply integrates.
    pub tokens: i64,
    /// This line holds the priority token.
    pub priority: bool,
    /// Written since fetch.
    pub dirty: bool,
    /// In-flight token acquisitions launched from this line.
    pub updating: u32,
    /// Loading: a later remote reader waits for this data.
    pub forward: bool,
    /// Loading with `forward`: caches between us and that reader.
    pub hops: u32,
    /// Last access cycle, for LRU replacement.
    pub access: Cycle,
    /// The line was allocated opportunistically by a passing read; no
    /// local client awaits it and it may be reclaimed at any time.
    pub attracted: bool,
    /// The line lost a token race while loading; its token count is
    /// no longer globally visible.
    pub invalidated: bool,
    /// Tokens are locked in place pending race resolution by the
    /// priority token.
    pub tlock: bool,
}

impl CacheLine {
    /// An empty way.
    pub fn empty() -> Self {
        Self {
            state: LineState::Empty,
            tag: 0,
            data: [0; MAX_LINE_SIZE],
            valid_bytes: [false; MAX_LINE_SIZE],
            tokens: 0,
            priority: false,
            dirty: false,
            updating: 0,
            forward: false,
            hops: 0,
            access: 0,
            attracted: false,
            invalidated: false,
            tlock: false,
        }
    }

    /// Reset to a freshly allocated loading line.
    pub fn reset(&mut self, tag: u64, now: Cycle) {
        self.state = LineState::Loading;
        self.tag = tag;
        self.valid_bytes.fill(false);
        self.tokens = 0;
        self.priority = false;
        self.dirty = false;
        self.updating = 0;
        self.forward = false;
        self.hops = 0;
        self.access = now;
        self.attracted = false;
        self.invalidated = false;
        self.tlock = false;
    }

    /// Clear the line entirely.
    pub fn clear(&mut self) {
        self.state = LineState::Empty;
        self.tokens = 0;
        self.priority = false;
        self.dirty = false;
        self.updating = 0;
        self.forward = false;
        self.attracted = false;
        self.invalidated = false;
        self.tlock = false;
        self.valid_bytes.fill(false);
    }

    /// A pinned line may not be chosen as a replacement victim.
    /// Attracted lines are reclaimable regardless of state.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        !self.attracted && (self.state == LineState::Loading || self.updating > 0)
    }

    /// Tokens this line can surrender to a passing request: locked
    /// tokens are only locally visible.
    #[inline]
    pub fn visible_tokens(&self) -> i64 {
        if self.tlock {
            0
        } else {
            self.tokens.max(0)
        }
    }

    /// Whether the first `line_size` bytes are all valid.
    pub fn is_complete(&self, line_size: usize) -> bool {
        self.valid_bytes[..line_size].iter().all(|&v| v)
    }

    /// Write bytes into the line and mark them valid.
    pub fn write_bytes(&mut self, offset: usize, data: &[u8]) {
        self.data[offset..offset + data.len()].copy_from_slice(data);
        self.valid_bytes[offset..offset + data.len()].fill(true);
    }

    /// Fill invalid bytes from `data` where `mask` is set.
    pub fn absorb_bytes(&mut self, data: &[u8; MAX_LINE_SIZE], mask: &[bool; MAX_LINE_SIZE]) {
        for i in 0..MAX_LINE_SIZE {
            if mask[i] && !self.valid_bytes[i] {
                self.data[i] = data[i];
                self.valid_bytes[i] = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pinning_rules() {
        let mut line = CacheLine::empty();
        line.state = LineState::Loading;
        assert!(line.is_pinned());

        line.state = LineState::Full;
        assert!(!line.is_pinned());
        line.updating = 1;
        assert!(line.is_pinned());

        line.attracted = true;
        assert!(!line.is_pinned(), "attracted lines are reclaimable");
    }

    #[test]
    fn test_visible_tokens_respect_lock() {
        let mut line = CacheLine::empty();
        line.tokens = 3;
        assert_eq!(line.visible_tokens(), 3);
        line.tlock = true;
        assert_eq!(line.visible_tokens(), 0);
        line.tlock = false;
        line.tokens = -1;
        assert_eq!(line.visible_tokens(), 0);
    }

    #[test]
    fn test_absorb_respects_valid_bytes() {
        let mut line = CacheLine::empty();
        line.write_bytes(0, &[0xAA, 0xBB]);

        let data = [0x11u8; MAX_LINE_SIZE];
        let mask = [true; MAX_LINE_SIZE];
        line.absorb_bytes(&data, &mask);

        assert_eq!(line.data[0], 0xAA);
        assert_eq!(line.data[1], 0xBB);
        assert_eq!(line.data[2], 0x11);
        assert!(line.is_complete(MAX_LINE_SIZE));
    }
}
