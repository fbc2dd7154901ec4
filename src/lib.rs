//! # Bundle Transport
//!
//! Non-blocking TLS transport for discrete, length-framed, compressed
//! messages ("bundles"), plus a reference control protocol that
//! authenticates with a challenge/response exchange and then trades named
//! commands with structured payloads.
//!
//! ## Architecture
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ ConnectionManager  (accept loop, least-loaded placement) │
//! │   ┌──────────┐ ┌──────────┐ ┌──────────┐                 │
//! │   │ Worker 0 │ │ Worker 1 │ │ Worker N │  one OS thread  │
//! │   └────┬─────┘ └──────────┘ └──────────┘  each           │
//! └────────┼─────────────────────────────────────────────────┘
//!          │ cooperatively scheduled connections
//!   ┌──────▼──────────────┐
//!   │ PacketBundleChannel │  TLS ▸ compression ▸ u32-framed bundles
//!   └──────┬──────────────┘
//!          │ ChannelState hooks (consumer / producer)
//!   ┌──────▼───────────────┐
//!   │ ControlPanelProtocol │  challenge/response auth + named commands
//!   └──────────────────────┘
//! ```
//!
//! Every connection lives on exactly one worker thread, so per-connection
//! state never needs a lock; the only cross-thread state is each worker's
//! intake queue and the per-connection close/deadline atomics.
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use bundle_transport::connection::DemuxRegistry;
//! use bundle_transport::protocol::auth::{ChallengeCipher, SecretCipher};
//! use bundle_transport::protocol::{ControlPanel, ControlPanelProtocol};
//! use bundle_transport::transport::{ChannelOptions, RustlsTransport, TlsTransport};
//! use bundle_transport::worker::{ConnectionManager, Signal};
//! use std::collections::HashMap;
//!
//! #[tokio::main]
//! async fn main() -> bundle_transport::error::Result<()> {
//!     let transport: Arc<dyn TlsTransport> = Arc::new(
//!         RustlsTransport::builder()
//!             .with_server_pem("server.pem", "server-key.pem")
//!             .build()?,
//!     );
//!
//!     let mut directory: HashMap<String, Arc<dyn ChallengeCipher>> = HashMap::new();
//!     directory.insert("console-1".into(), Arc::new(SecretCipher::new(b"secret")));
//!     let directory = Arc::new(directory);
//!
//!     let mut registry = DemuxRegistry::new();
//!     registry.register(0x01, move |_ctl| {
//!         let panel = ControlPanel::new();
//!         Box::new(ControlPanelProtocol::server_salted(panel, directory.clone()))
//!     });
//!
//!     let manager = ConnectionManager::new(2)?;
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:9000").await?;
//!     manager
//!         .serve(
//!             listener,
//!             transport,
//!             ChannelOptions::default(),
//!             Arc::new(registry),
//!             Signal::new(),
//!         )
//!         .await
//! }
//! ```

pub mod config;
pub mod connection;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;
pub mod worker;

pub use config::NetworkConfig;
pub use core::tag::{TagStructure, TagValue};
pub use error::{ProtocolError, Result};
pub use protocol::{ControlPanel, ControlPanelProtocol};
pub use transport::{ChannelOptions, PacketBundleChannel, RemoteAddress, RustlsTransport};
pub use worker::{ConnectionManager, Signal, Worker};
