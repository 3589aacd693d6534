//! # RINGMEM - Ring-Based Cache-Coherence Memory Simulator
//!
//! A cycle-accurate simulator for a many-core COMA (Cache-Only Memory
//! Architecture) memory system built in Rust.
//!
//! ## Architecture
//!
//! - `kernel`: Discrete-event scheduling primitives (buffers, arbitrators)
//! - `config`: Simulation parameters and validation
//! - `memory`: Sparse virtual backing store
//! - `ddr`: Timing-accurate DDR channel model
//! - `protocol`: Ring message format of the token coherence protocol
//! - `ring`: Point-to-point ring fabric between nodes
//! - `client`: Memory client (processor-side) interface
//! - `cache`: L2 caches with token management and merge-store buffers
//! - `directory`: Sub-ring directories filtering local ring traffic
//! - `root`: Root directories owning the DDR channels
//! - `system`: Topology construction, scheduler and invariant checks
//!
//! The coherence protocol conserves a fixed number of tokens per
//! cache-line address; a line may only be written without remote
//! coordination by a cache holding every token, and a unique priority
//! token per address breaks ties between competing writers.

#![warn(missing_docs)]
#![warn(clippy::all)]

// Discrete-event kernel primitives
pub mod kernel;

// Configuration
pub mod config;

// Backing store
pub mod memory;

// DDR channel model
pub mod ddr;

// Coherence protocol messages
pub mod protocol;

// Ring fabric
pub mod ring;

// Memory client interface
pub mod client;

// L2 cache
pub mod cache;

// Sub-ring directory
pub mod directory;

// Root directory
pub mod root;

// Statistics
pub mod stats;

// System assembly and scheduling
pub mod system;

// Re-export commonly used types
pub use cache::{Cache, LineState};
pub use client::{ClientId, MemoryClient};
pub use config::{ConfigError, SimConfig};
pub use ddr::{DdrChannel, DdrConfig};
pub use kernel::{Cycle, ProcessResult, SimError};
pub use memory::{MemoryError, Permissions, VirtualMemory};
pub use protocol::{Message, MessageKind, MAX_LINE_SIZE};
pub use stats::SystemStats;
pub use system::System;

/// Byte address into the simulated flat virtual address space.
pub type MemAddr = u64;

/// Identifier of an L2 cache, unique across the whole system.
pub type CacheId = usize;

/// Identifier a client attaches to a write so the completion callback
/// can be matched to the request.
pub type WriteId = u64;

/// Re-export version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
