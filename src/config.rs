//! Simulation configuration
//!
//! All recognized parameters of the memory system, with the defaults
//! of the reference configuration (64-byte lines, 4-way 128-set
//! caches, DDR3-1600 timings). Configurations can be built in code,
//! deserialized from JSON, or parsed from `Key = value` pairs; every
//! fatal configuration rule is checked by [`SimConfig::validate`]
//! before a system is constructed.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::protocol::MAX_LINE_SIZE;

/// Configuration errors. All are fatal at construction; the simulator
/// refuses to start.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// `CacheLineSize` is not a power of two, zero, or too large.
    #[error("invalid cache line size {0}: must be a power of two between 4 and {MAX_LINE_SIZE}")]
    InvalidLineSize(usize),

    /// A parameter that must be positive was zero.
    #[error("parameter {0} must be positive")]
    ZeroParameter(&'static str),

    /// The number of root directories does not divide the set count,
    /// leaving the address-to-root mapping undefined.
    #[error("NumRootDirectories ({roots}) must divide L2CacheNumSets ({sets})")]
    RootShardMismatch {
        /// Configured root directory count.
        roots: usize,
        /// Configured set count.
        sets: usize,
    },

    /// A configuration key was not recognized.
    #[error("unrecognized configuration key: {0}")]
    UnknownKey(String),

    /// A configuration value could not be parsed.
    #[error("invalid value {value:?} for key {key}")]
    InvalidValue {
        /// The offending key.
        key: String,
        /// The unparseable value.
        value: String,
    },

    /// The configuration file could not be deserialized.
    #[error("malformed configuration: {0}")]
    Malformed(String),
}

/// Complete parameter set of the simulated memory system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimConfig {
    /// Coherence granularity in bytes; must be a power of two.
    #[serde(rename = "CacheLineSize")]
    pub cache_line_size: usize,

    /// Lines per set in each L2 cache.
    #[serde(rename = "L2CacheAssociativity")]
    pub l2_cache_associativity: usize,

    /// Sets per L2 cache.
    #[serde(rename = "L2CacheNumSets")]
    pub l2_cache_num_sets: usize,

    /// Number of local rings, each below one sub-ring directory.
    #[serde(rename = "NumRings")]
    pub num_rings: usize,

    /// Caches on each local ring.
    #[serde(rename = "NumL2CachesPerRing")]
    pub num_l2_caches_per_ring: usize,

    /// Processor clients sharing one cache bus.
    #[serde(rename = "NumProcessorsPerCache")]
    pub num_processors_per_cache: usize,

    /// Root directory shards on the backbone ring.
    #[serde(rename = "NumRootDirectories")]
    pub num_root_directories: usize,

    /// Depth of each cache's bus request buffer.
    #[serde(rename = "CacheRequestBufferSize")]
    pub cache_request_buffer_size: usize,

    /// Depth of each ring interface's incoming/outgoing buffers.
    #[serde(rename = "CacheResponseBufferSize")]
    pub cache_response_buffer_size: usize,

    /// Depth of a root directory's outgoing-requests buffer.
    #[serde(rename = "RootRequestBufferSize")]
    pub root_request_buffer_size: usize,

    /// Depth of a root directory's responses buffer.
    #[serde(rename = "RootResponseBufferSize")]
    pub root_response_buffer_size: usize,

    /// Merge-store buffer slots per cache.
    #[serde(rename = "MSBSize")]
    pub msb_size: usize,

    /// Whether caches may absorb passing evicted lines into empty slots.
    #[serde(rename = "InjectEvictedLines")]
    pub inject_evicted_lines: bool,

    /// DDR: RAS-to-CAS delay (row open), in memory cycles.
    #[serde(rename = "DDR_tRCD")]
    pub ddr_trcd: u64,

    /// DDR: row precharge delay (row close).
    #[serde(rename = "DDR_tRP")]
    pub ddr_trp: u64,

    /// DDR: CAS latency (column read delay).
    #[serde(rename = "DDR_tCL")]
    pub ddr_tcl: u64,

    /// DDR: write recovery time before the row may close.
    #[serde(rename = "DDR_tWR")]
    pub ddr_twr: u64,

    /// DDR: CAS-to-CAS delay between read commands.
    #[serde(rename = "DDR_tCCD")]
    pub ddr_tccd: u64,

    /// DDR: CAS write latency.
    #[serde(rename = "DDR_tCWL")]
    pub ddr_tcwl: u64,

    /// DDR: minimum row-active time before precharge.
    #[serde(rename = "DDR_tRAS")]
    pub ddr_tras: u64,

    /// DDR: words per burst.
    #[serde(rename = "DDRBurstLength")]
    pub ddr_burst_length: usize,

    /// DDR: devices accessed in parallel per rank.
    #[serde(rename = "DDRDevicesPerRank")]
    pub ddr_devices_per_rank: usize,

    /// DDR: log2 of the number of ranks on the DIMM.
    #[serde(rename = "DDRRankBits")]
    pub ddr_rank_bits: u32,

    /// DDR: log2 of the number of rows per bank.
    #[serde(rename = "DDRRowBits")]
    pub ddr_row_bits: u32,

    /// DDR: log2 of the number of columns per row.
    #[serde(rename = "DDRColumnBits")]
    pub ddr_column_bits: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            cache_line_size: 64,
            l2_cache_associativity: 4,
            l2_cache_num_sets: 128,
            num_rings: 1,
            num_l2_caches_per_ring: 4,
            num_processors_per_cache: 4,
            num_root_directories: 1,
            cache_request_buffer_size: 16,
            cache_response_buffer_size: 16,
            root_request_buffer_size: 16,
            root_response_buffer_size: 16,
            msb_size: 4,
            inject_evicted_lines: true,
            // DDR3-1600 (Micron MT41J128M8), latencies in I/O cycles.
            ddr_trcd: 22,
            ddr_trp: 22,
            ddr_tcl: 22,
            ddr_twr: 16,
            ddr_tccd: 8,
            ddr_tcwl: 16,
            ddr_tras: 56,
            ddr_burst_length: 8,
            ddr_devices_per_rank: 8,
            ddr_rank_bits: 1,
            ddr_row_bits: 18,
            ddr_column_bits: 10,
        }
    }
}

impl SimConfig {
    /// Total number of caches, which is also the number of tokens per
    /// cache-line address.
    #[inline]
    pub fn num_caches(&self) -> usize {
        self.num_rings * self.num_l2_caches_per_ring
    }

    /// Load a configuration from a JSON document using the canonical
    /// key names (e.g. `"CacheLineSize": 64`).
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SimConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from `Key = value` pairs, starting from
    /// the defaults. Unknown keys and unparseable values are errors.
    pub fn from_key_values(pairs: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for (key, value) in pairs {
            let parse_usize = || {
                value.parse::<usize>().map_err(|_| ConfigError::InvalidValue {
                    key: key.clone(),
                    value: value.clone(),
                })
            };
            let parse_u64 = || {
                value.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                    key: key.clone(),
                    value: value.clone(),
                })
            };
            let parse_u32 = || {
                value.parse::<u32>().map_err(|_| ConfigError::InvalidValue {
                    key: key.clone(),
                    value: value.clone(),
                })
            };

            match key.as_str() {
                "CacheLineSize" => config.cache_line_size = parse_usize()?,
                "L2CacheAssociativity" => config.l2_cache_associativity = parse_usize()?,
                "L2CacheNumSets" => config.l2_cache_num_sets = parse_usize()?,
                "NumRings" => config.num_rings = parse_usize()?,
                "NumL2CachesPerRing" => config.num_l2_caches_per_ring = parse_usize()?,
                "NumProcessorsPerCache" => config.num_processors_per_cache = parse_usize()?,
                "NumRootDirectories" => config.num_root_directories = parse_usize()?,
                "CacheRequestBufferSize" => config.cache_request_buffer_size = parse_usize()?,
                "CacheResponseBufferSize" => config.cache_response_buffer_size = parse_usize()?,
                "RootRequestBufferSize" => config.root_request_buffer_size = parse_usize()?,
                "RootResponseBufferSize" => config.root_response_buffer_size = parse_usize()?,
                "MSBSize" => config.msb_size = parse_usize()?,
                "InjectEvictedLines" => {
                    config.inject_evicted_lines = match value.as_str() {
                        "true" | "1" => true,
                        "false" | "0" => false,
                        _ => {
                            return Err(ConfigError::InvalidValue {
                                key: key.clone(),
                                value: value.clone(),
                            })
                        }
                    }
                }
                "DDR_tRCD" => config.ddr_trcd = parse_u64()?,
                "DDR_tRP" => config.ddr_trp = parse_u64()?,
                "DDR_tCL" => config.ddr_tcl = parse_u64()?,
                "DDR_tWR" => config.ddr_twr = parse_u64()?,
                "DDR_tCCD" => config.ddr_tccd = parse_u64()?,
                "DDR_tCWL" => config.ddr_tcwl = parse_u64()?,
                "DDR_tRAS" => config.ddr_tras = parse_u64()?,
                "DDRBurstLength" => config.ddr_burst_length = parse_usize()?,
                "DDRDevicesPerRank" => config.ddr_devices_per_rank = parse_usize()?,
                "DDRRankBits" => config.ddr_rank_bits = parse_u32()?,
                "DDRRowBits" => config.ddr_row_bits = parse_u32()?,
                "DDRColumnBits" => config.ddr_column_bits = parse_u32()?,
                _ => return Err(ConfigError::UnknownKey(key.clone())),
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Check every fatal configuration rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_line_size < 4
            || self.cache_line_size > MAX_LINE_SIZE
            || !self.cache_line_size.is_power_of_two()
        {
            return Err(ConfigError::InvalidLineSize(self.cache_line_size));
        }

        let positives: [(&'static str, usize); 12] = [
            ("L2CacheAssociativity", self.l2_cache_associativity),
            ("L2CacheNumSets", self.l2_cache_num_sets),
            ("NumRings", self.num_rings),
            ("NumL2CachesPerRing", self.num_l2_caches_per_ring),
            ("NumProcessorsPerCache", self.num_processors_per_cache),
            ("NumRootDirectories", self.num_root_directories),
            ("CacheRequestBufferSize", self.cache_request_buffer_size),
            ("CacheResponseBufferSize", self.cache_response_buffer_size),
            ("RootRequestBufferSize", self.root_request_buffer_size),
            ("RootResponseBufferSize", self.root_response_buffer_size),
            ("DDRBurstLength", self.ddr_burst_length),
            ("DDRDevicesPerRank", self.ddr_devices_per_rank),
        ];
        for (name, value) in positives {
            if value == 0 {
                return Err(ConfigError::ZeroParameter(name));
            }
        }

        let timings: [(&'static str, u64); 7] = [
            ("DDR_tRCD", self.ddr_trcd),
            ("DDR_tRP", self.ddr_trp),
            ("DDR_tCL", self.ddr_tcl),
            ("DDR_tWR", self.ddr_twr),
            ("DDR_tCCD", self.ddr_tccd),
            ("DDR_tCWL", self.ddr_tcwl),
            ("DDR_tRAS", self.ddr_tras),
        ];
        for (name, value) in timings {
            if value == 0 {
                return Err(ConfigError::ZeroParameter(name));
            }
        }

        if self.ddr_row_bits == 0 || self.ddr_column_bits == 0 {
            return Err(ConfigError::ZeroParameter("DDRRowBits/DDRColumnBits"));
        }

        // The address-to-root mapping by modulo is only well defined
        // when the shard count divides the set count.
        if self.l2_cache_num_sets % self.num_root_directories != 0 {
            return Err(ConfigError::RootShardMismatch {
                roots: self.num_root_directories,
                sets: self.l2_cache_num_sets,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SimConfig::default().validate().is_ok());
    }

    #[test]
    fn test_line_size_must_be_power_of_two() {
        let mut config = SimConfig::default();
        config.cache_line_size = 48;
        assert_eq!(config.validate(), Err(ConfigError::InvalidLineSize(48)));

        config.cache_line_size = 128;
        assert_eq!(config.validate(), Err(ConfigError::InvalidLineSize(128)));

        config.cache_line_size = 32;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_root_count_must_divide_sets() {
        let mut config = SimConfig::default();
        config.l2_cache_num_sets = 128;
        config.num_root_directories = 3;
        assert_eq!(
            config.validate(),
            Err(ConfigError::RootShardMismatch { roots: 3, sets: 128 })
        );

        config.num_root_directories = 4;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_parameters_rejected() {
        let mut config = SimConfig::default();
        config.ddr_trcd = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroParameter("DDR_tRCD")));
    }

    #[test]
    fn test_key_value_parsing() {
        let mut pairs = HashMap::new();
        pairs.insert("CacheLineSize".to_string(), "32".to_string());
        pairs.insert("NumL2CachesPerRing".to_string(), "8".to_string());
        pairs.insert("InjectEvictedLines".to_string(), "false".to_string());

        let config = SimConfig::from_key_values(&pairs).unwrap();
        assert_eq!(config.cache_line_size, 32);
        assert_eq!(config.num_l2_caches_per_ring, 8);
        assert!(!config.inject_evicted_lines);
        assert_eq!(config.num_caches(), 8);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let mut pairs = HashMap::new();
        pairs.insert("CacheLineWidth".to_string(), "64".to_string());
        assert!(matches!(
            SimConfig::from_key_values(&pairs),
            Err(ConfigError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_json_round_trip() {
        let config = SimConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed = SimConfig::from_json(&json).unwrap();
        assert_eq!(parsed.cache_line_size, config.cache_line_size);
        assert_eq!(parsed.ddr_tras, config.ddr_tras);
    }
}
