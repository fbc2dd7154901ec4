//! # Outbound Connect Sequence
//!
//! Resolve the logical address, open the socket, and establish the TLS
//! channel — all under one fixed absolute budget. Resolution happens off the
//! worker thread (tokio delegates it to the blocking pool); the whole
//! sequence fails fatally once the budget is spent, with no retry.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{lookup_host, TcpStream};
use tracing::trace;

use crate::config::CONNECT_TIMEOUT;
use crate::error::{ProtocolError, Result};
use crate::transport::channel::{ChannelOptions, PacketBundleChannel};
use crate::transport::tls::{RemoteAddress, TlsTransport};

/// Establish an outbound channel to `remote` within [`CONNECT_TIMEOUT`].
pub async fn connect_outbound(
    remote: &RemoteAddress,
    transport: &Arc<dyn TlsTransport>,
    options: ChannelOptions,
) -> Result<PacketBundleChannel> {
    connect_outbound_with_timeout(remote, transport, options, CONNECT_TIMEOUT).await
}

/// Establish an outbound channel to `remote` within `budget`.
pub async fn connect_outbound_with_timeout(
    remote: &RemoteAddress,
    transport: &Arc<dyn TlsTransport>,
    options: ChannelOptions,
    budget: Duration,
) -> Result<PacketBundleChannel> {
    let sequence = async {
        trace!(remote = %remote, "resolving");
        let addr = lookup_host(remote.authority())
            .await?
            .next()
            .ok_or_else(|| {
                ProtocolError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no addresses for {remote}"),
                ))
            })?;

        trace!(remote = %remote, %addr, "connecting");
        let stream = TcpStream::connect(addr).await?;
        PacketBundleChannel::connect(stream, remote, transport, options).await
    };

    tokio::time::timeout(budget, sequence)
        .await
        .map_err(|_| ProtocolError::Timeout)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RustlsTransport;

    #[tokio::test]
    async fn refused_connection_surfaces_io_error() {
        let transport: Arc<dyn TlsTransport> =
            Arc::new(RustlsTransport::builder().insecure().build().unwrap());
        // Port 1 on localhost is essentially never listening.
        let remote = RemoteAddress::new("127.0.0.1", 1);
        let err = connect_outbound_with_timeout(
            &remote,
            &transport,
            ChannelOptions::default(),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProtocolError::Io(_)));
    }

    #[tokio::test]
    async fn budget_exhaustion_is_a_timeout() {
        let transport: Arc<dyn TlsTransport> =
            Arc::new(RustlsTransport::builder().insecure().build().unwrap());
        // A listener that never completes the TLS handshake.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hold = tokio::spawn(async move {
            let _accepted = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let remote = RemoteAddress::new("127.0.0.1", port);
        let err = connect_outbound_with_timeout(
            &remote,
            &transport,
            ChannelOptions::default(),
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout));
        hold.abort();
    }
}
