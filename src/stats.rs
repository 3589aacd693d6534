//! Event counters
//!
//! Lightweight per-component statistics, aggregated by the system
//! into a [`SystemStats`] summary.

/// Counters of one L2 cache.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads served from a full line.
    pub read_hits: u64,
    /// Reads that allocated a line and went on the ring.
    pub read_misses: u64,
    /// Writes that hit an allocated line.
    pub write_hits: u64,
    /// Writes that allocated a line.
    pub write_misses: u64,
    /// Lines pushed back onto the ring to make room.
    pub evictions: u64,
    /// Passing evicted lines absorbed into empty ways.
    pub injections: u64,
    /// Line loads that completed.
    pub loads_completed: u64,
}

/// Counters of one root directory.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RootStats {
    /// Off-chip reads issued to the DDR channel.
    pub offchip_reads: u64,
    /// Off-chip writebacks issued to the DDR channel.
    pub offchip_writes: u64,
    /// Lines cleared after collecting every token.
    pub lines_retired: u64,
}

/// Whole-system summary.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SystemStats {
    /// Cycles simulated.
    pub cycles: u64,
    /// Sum over all caches.
    pub read_hits: u64,
    /// Sum over all caches.
    pub read_misses: u64,
    /// Sum over all caches.
    pub write_hits: u64,
    /// Sum over all caches.
    pub write_misses: u64,
    /// Sum over all caches.
    pub evictions: u64,
    /// Sum over all caches.
    pub injections: u64,
    /// Sum over all roots.
    pub offchip_reads: u64,
    /// Sum over all roots.
    pub offchip_writes: u64,
}

impl SystemStats {
    /// Fold one cache's counters into the summary.
    pub fn add_cache(&mut self, stats: &CacheStats) {
        self.read_hits += stats.read_hits;
        self.read_misses += stats.read_misses;
        self.write_hits += stats.write_hits;
        self.write_misses += stats.write_misses;
        self.evictions += stats.evictions;
        self.injections += stats.injections;
    }

    /// Fold one root's counters into the summary.
    pub fn add_root(&mut self, stats: &RootStats) {
        self.offchip_reads += stats.offchip_reads;
        self.offchip_writes += stats.offchip_writes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregation() {
        let mut summary = SystemStats::default();
        summary.add_cache(&CacheStats {
            read_hits: 3,
            read_misses: 1,
            ..CacheStats::default()
        });
        summary.add_cache(&CacheStats {
            read_hits: 2,
            evictions: 5,
            ..CacheStats::default()
        });
        summary.add_root(&RootStats {
            offchip_reads: 7,
            ..RootStats::default()
        });

        assert_eq!(summary.read_hits, 5);
        assert_eq!(summary.read_misses, 1);
        assert_eq!(summary.evictions, 5);
        assert_eq!(summary.offchip_reads, 7);
    }
}
