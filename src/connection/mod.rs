//! # Connection Lifecycle
//!
//! State machines that bring a connection from a raw socket to a typed
//! protocol: the outbound resolve/connect sequence, and the inbound
//! header/selector demultiplexer with its client-side `Introduce` twin.

pub mod inbound;
pub mod outbound;

pub use inbound::{DemuxRegistry, Demultiplexer, Introduce};
pub use outbound::{connect_outbound, connect_outbound_with_timeout};
