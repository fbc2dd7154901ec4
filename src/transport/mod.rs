//! # Transport Layer
//!
//! TLS engines bound to logical remote identities, and the bundle channel
//! that layers framing and compression over them.
//!
//! ## Components
//! - **tls**: [`TlsTransport`] factory trait + rustls-backed provider
//! - **channel**: [`PacketBundleChannel`] and the [`ChannelState`] hook
//!   contract protocols are driven through

pub mod channel;
pub mod tls;

pub use channel::{
    encode_bundle, BundleDecoder, BundleReader, BundleWriter, ChannelControl, ChannelOptions,
    ChannelPhase, ChannelState, PacketBundleChannel,
};
pub use tls::{RemoteAddress, RustlsTransport, TlsTransport};
