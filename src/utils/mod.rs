//! # Utility Modules
//!
//! Supporting utilities for compression and buffer reuse.
//!
//! ## Components
//! - **Compression**: LZ4 and Zstd with decompression-bomb limits
//! - **Buffer Pool**: per-thread free list of reusable byte buffers
//!
//! ## Security
//! - Decompressed bundles are capped at 64 MiB before allocation
//! - Claimed sizes are validated before any decompression work starts

pub mod buffer_pool;
pub mod compression;

pub use buffer_pool::PooledBuffer;
pub use compression::CompressionKind;
