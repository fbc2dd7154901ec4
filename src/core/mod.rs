//! # Core Payload Components
//!
//! The self-describing tagged payload format carried inside bundles.
//!
//! Framing and compression live in [`crate::transport`] and
//! [`crate::utils::compression`]; this module only defines what the bytes
//! inside a decompressed bundle mean to the protocol above.

pub mod tag;

pub use tag::{TagStructure, TagValue};
