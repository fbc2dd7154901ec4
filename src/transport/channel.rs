//! # Packet Bundle Channel
//!
//! Wraps one socket, one TLS session, and a compression filter to present
//! discrete framed messages ("bundles") to the layer above. The owning
//! protocol never sees the handshake, encryption, or compression — it
//! installs a [`ChannelState`] and is driven through it:
//!
//! - [`ChannelState::on_send_ready`] runs every turn; returning `true` queues
//!   whatever the callback wrote as one outbound bundle.
//! - [`ChannelState::on_bundle`] runs once per inbound bundle, exactly once
//!   per bundle; returning `true` queues a reply written during the callback.
//! - A callback may replace the installed state through [`ChannelControl`] —
//!   this is how multi-step handshakes advance and how a freshly accepted
//!   connection hands itself over to a concrete protocol.
//!
//! ## Wire Format
//! ```text
//! [length(4, big-endian)] [compressed payload(length)]
//! ```
//!
//! A zero length header, a compressed frame above 64 MiB, or a payload that
//! inflates past 64 MiB are all fatal framing errors. At most one bundle is
//! in flight per direction; within a channel, bundles are strictly ordered.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsStream;
use tracing::{debug, trace};

use crate::config::{TransportConfig, MAX_BUNDLE_SIZE, MAX_WIRE_BUNDLE_SIZE};
use crate::error::{ProtocolError, Result};
use crate::transport::tls::{run_verification, RemoteAddress, TlsTransport};
use crate::utils::compression::{self, CompressionKind};
use crate::utils::buffer_pool;
use crate::worker::{deadline_expired, ConnectionHandle};

/// Bytes in the bundle length prefix.
const BUNDLE_HEADER_LEN: usize = 4;

/// Initial capacity reserved for an outbound bundle under assembly.
const WRITER_RESERVE: usize = 512;

/// Channel lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    Handshake,
    Verify,
    Open,
    Closing,
    Closed,
}

/// Per-channel tuning taken from [`TransportConfig`].
#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    pub compression: CompressionKind,
    pub compression_level: i32,
    /// Idle window granted after each successful bundle exchange.
    pub activity_timeout: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            compression: CompressionKind::Zstd,
            compression_level: 3,
            activity_timeout: Duration::from_secs(300),
        }
    }
}

impl ChannelOptions {
    pub fn from_config(config: &TransportConfig) -> Result<Self> {
        let compression = CompressionKind::from_name(&config.compression).ok_or_else(|| {
            ProtocolError::Config(format!(
                "unknown compression algorithm: {}",
                config.compression
            ))
        })?;
        Ok(Self {
            compression,
            compression_level: config.compression_level,
            activity_timeout: config.activity_timeout,
        })
    }
}

/// Readable view of one decompressed inbound bundle.
pub struct BundleReader {
    data: Bytes,
}

impl BundleReader {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            data: Bytes::from(payload),
        }
    }

    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        if self.data.len() < 1 {
            return Err(truncated_bundle());
        }
        Ok(self.data.get_u8())
    }

    /// Read exactly `len` bytes.
    pub fn read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        if self.data.len() < len {
            return Err(truncated_bundle());
        }
        let mut out = vec![0u8; len];
        self.data.copy_to_slice(&mut out);
        Ok(out)
    }

    /// Read a length-prefixed UTF-8 string (u16 big-endian length).
    pub fn read_string(&mut self) -> Result<String> {
        if self.data.len() < 2 {
            return Err(truncated_bundle());
        }
        let len = self.data.get_u16() as usize;
        String::from_utf8(self.read_exact(len)?)
            .map_err(|_| ProtocolError::MalformedPayload("invalid UTF-8 string".into()))
    }

    /// Consume whatever is left of the bundle.
    pub fn read_to_end(&mut self) -> Vec<u8> {
        let rest = self.data.split_off(0);
        rest.to_vec()
    }
}

impl Buf for BundleReader {
    fn remaining(&self) -> usize {
        self.data.remaining()
    }

    fn chunk(&self) -> &[u8] {
        self.data.chunk()
    }

    fn advance(&mut self, cnt: usize) {
        self.data.advance(cnt)
    }
}

fn truncated_bundle() -> ProtocolError {
    ProtocolError::MalformedPayload("truncated bundle".into())
}

/// Writable view of the outbound bundle under assembly.
pub struct BundleWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> BundleWriter<'a> {
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        Self { buf }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Write a length-prefixed UTF-8 string (u16 big-endian length).
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        let len = u16::try_from(value.len())
            .map_err(|_| ProtocolError::MalformedPayload("string too long for bundle".into()))?;
        self.buf.put_u16(len);
        self.buf.extend_from_slice(value.as_bytes());
        Ok(())
    }

    /// Raw access for structured encoders.
    pub fn buffer(&mut self) -> &mut Vec<u8> {
        self.buf
    }
}

/// Side-effects a [`ChannelState`] callback may request; applied by the
/// channel after the callback returns.
pub struct ChannelControl<'a> {
    handle: &'a Arc<ConnectionHandle>,
    next_state: Option<Box<dyn ChannelState>>,
    close: bool,
}

impl<'a> ChannelControl<'a> {
    pub(crate) fn new(handle: &'a Arc<ConnectionHandle>) -> Self {
        Self {
            handle,
            next_state: None,
            close: false,
        }
    }

    /// The connection handle (close flag, deadline, wake).
    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        self.handle
    }

    /// Install a different state once this callback returns. The current
    /// state is dropped.
    pub fn replace_state(&mut self, next: Box<dyn ChannelState>) {
        self.next_state = Some(next);
    }

    /// Close the channel gracefully once pending output has flushed.
    pub fn request_close(&mut self) {
        self.close = true;
    }

    /// Grant the connection another activity window.
    pub fn extend_deadline(&self, window: Duration) {
        self.handle.extend_deadline(window);
    }

    /// Disable the connection deadline.
    pub fn clear_deadline(&self) {
        self.handle.clear_deadline();
    }
}

/// The pluggable pair of callbacks an owning protocol installs to drive a
/// channel without the channel knowing protocol semantics.
pub trait ChannelState: 'static {
    /// One inbound bundle, delivered exactly once. Return `true` if a reply
    /// bundle was written to `out`.
    fn on_bundle(
        &mut self,
        bundle: &mut BundleReader,
        out: &mut BundleWriter<'_>,
        ctl: &mut ChannelControl<'_>,
    ) -> Result<bool>;

    /// Invoked every turn when no outbound bundle is mid-flight. Return
    /// `true` if a bundle was written to `out` and should be flushed.
    fn on_send_ready(
        &mut self,
        out: &mut BundleWriter<'_>,
        ctl: &mut ChannelControl<'_>,
    ) -> Result<bool>;

    /// The channel is done: `Ok` for a graceful close, `Err` with the fatal
    /// error otherwise. Runs exactly once, on whatever state is installed at
    /// teardown.
    fn on_shutdown(&mut self, _result: &Result<()>) {}
}

/// Compress and frame one outbound bundle payload.
pub fn encode_bundle(payload: &[u8], kind: CompressionKind, level: i32) -> Result<Vec<u8>> {
    if payload.is_empty() {
        return Err(ProtocolError::EmptyBundle);
    }
    if payload.len() > MAX_BUNDLE_SIZE {
        return Err(ProtocolError::OversizedBundle(payload.len()));
    }
    let compressed = compression::compress(payload, kind, level)?;
    if compressed.len() > MAX_WIRE_BUNDLE_SIZE {
        return Err(ProtocolError::OversizedBundle(compressed.len()));
    }
    let mut frame = Vec::with_capacity(BUNDLE_HEADER_LEN + compressed.len());
    frame.put_u32(compressed.len() as u32);
    frame.extend_from_slice(&compressed);
    Ok(frame)
}

/// Incremental decoder for the inbound byte stream: length header, then
/// exactly that many compressed bytes, then decompression. At most one bundle
/// is assembled at a time.
#[derive(Default)]
pub struct BundleDecoder {
    expected: Option<usize>,
}

impl BundleDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to extract the next complete bundle from `buf`, returning its
    /// decompressed payload.
    pub fn decode(&mut self, buf: &mut BytesMut, kind: CompressionKind) -> Result<Option<Vec<u8>>> {
        if self.expected.is_none() {
            if buf.len() < BUNDLE_HEADER_LEN {
                return Ok(None);
            }
            let length = buf.get_u32() as usize;
            if length == 0 {
                return Err(ProtocolError::EmptyBundle);
            }
            if length > MAX_WIRE_BUNDLE_SIZE {
                return Err(ProtocolError::OversizedBundle(length));
            }
            self.expected = Some(length);
        }

        match self.expected {
            Some(length) if buf.len() >= length => {
                let frame = buf.split_to(length);
                self.expected = None;
                let payload = compression::decompress(&frame, kind)?;
                Ok(Some(payload))
            }
            _ => Ok(None),
        }
    }

    /// Whether a bundle is partially assembled (EOF here is not clean).
    pub fn mid_bundle(&self) -> bool {
        self.expected.is_some()
    }
}

/// One socket + TLS session presenting framed, compressed bundles.
pub struct PacketBundleChannel {
    stream: TlsStream<TcpStream>,
    remote: RemoteAddress,
    options: ChannelOptions,
    phase: ChannelPhase,
    inbound: BytesMut,
    decoder: BundleDecoder,
    pending_out: VecDeque<Vec<u8>>,
    state: Option<Box<dyn ChannelState>>,
    local_close: bool,
}

impl std::fmt::Debug for PacketBundleChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketBundleChannel")
            .field("remote", &self.remote)
            .field("phase", &self.phase)
            .field("local_close", &self.local_close)
            .finish_non_exhaustive()
    }
}

impl PacketBundleChannel {
    /// Establish the outbound side: TLS handshake against `remote`, then the
    /// transport's verification step (dispatched off-thread) if required.
    pub async fn connect(
        stream: TcpStream,
        remote: &RemoteAddress,
        transport: &Arc<dyn TlsTransport>,
        options: ChannelOptions,
    ) -> Result<Self> {
        let (connector, server_name) = transport.client_engine(remote)?;
        trace!(remote = %remote, phase = ?ChannelPhase::Handshake, "establishing");
        let tls = connector.connect(server_name, stream).await?;

        if transport.requires_verification() {
            let peer_certs = tls
                .get_ref()
                .1
                .peer_certificates()
                .map(<[rustls::Certificate]>::to_vec)
                .unwrap_or_default();
            trace!(remote = %remote, phase = ?ChannelPhase::Verify, "verifying session");
            run_verification(transport.clone(), remote.clone(), peer_certs).await?;
        }

        Ok(Self::established(tls.into(), remote.clone(), options))
    }

    /// Establish the inbound side on a freshly accepted socket.
    pub async fn accept(
        stream: TcpStream,
        peer: SocketAddr,
        transport: &Arc<dyn TlsTransport>,
        options: ChannelOptions,
    ) -> Result<Self> {
        let acceptor = transport.server_engine()?;
        let remote = RemoteAddress::from(peer);
        trace!(remote = %remote, phase = ?ChannelPhase::Handshake, "establishing");
        let tls = acceptor.accept(stream).await?;

        if transport.requires_verification() {
            let peer_certs = tls
                .get_ref()
                .1
                .peer_certificates()
                .map(<[rustls::Certificate]>::to_vec)
                .unwrap_or_default();
            trace!(remote = %remote, phase = ?ChannelPhase::Verify, "verifying session");
            run_verification(transport.clone(), remote.clone(), peer_certs).await?;
        }

        Ok(Self::established(tls.into(), remote, options))
    }

    fn established(
        stream: TlsStream<TcpStream>,
        remote: RemoteAddress,
        options: ChannelOptions,
    ) -> Self {
        trace!(remote = %remote, "channel open");
        Self {
            stream,
            remote,
            options,
            phase: ChannelPhase::Open,
            inbound: BytesMut::with_capacity(8 * 1024),
            decoder: BundleDecoder::new(),
            pending_out: VecDeque::new(),
            state: None,
            local_close: false,
        }
    }

    /// Install the owning protocol's state. Must happen before
    /// [`drive`](Self::drive).
    pub fn install(&mut self, state: Box<dyn ChannelState>) {
        self.state = Some(state);
    }

    pub fn remote(&self) -> &RemoteAddress {
        &self.remote
    }

    pub fn phase(&self) -> ChannelPhase {
        self.phase
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    /// Run the channel until it closes. The installed state's `on_shutdown`
    /// runs exactly once with the final result; TLS and buffer resources are
    /// released on every exit path.
    pub async fn drive(mut self, handle: &Arc<ConnectionHandle>) -> Result<()> {
        let result = self.run(handle).await;

        if let Some(mut state) = self.state.take() {
            state.on_shutdown(&result);
        }

        self.phase = ChannelPhase::Closing;
        if let Err(e) = self.stream.shutdown().await {
            // Teardown-time failure; the session is going away regardless.
            debug!(remote = %self.remote, error = %e, "TLS close handshake failed");
        }
        self.phase = ChannelPhase::Closed;
        trace!(remote = %self.remote, "channel closed");

        result
    }

    async fn run(&mut self, handle: &Arc<ConnectionHandle>) -> Result<()> {
        loop {
            if handle.close_requested() {
                self.local_close = true;
            }

            let produced = self.producer_turn(handle)?;
            self.flush_outbound().await?;

            if self.local_close && self.pending_out.is_empty() && !produced {
                return Ok(());
            }

            tokio::select! {
                biased;
                _ = deadline_expired(handle) => {
                    if handle.expired() {
                        return Err(ProtocolError::Timeout);
                    }
                }
                _ = handle.notified() => {}
                read = self.stream.read_buf(&mut self.inbound) => {
                    if read? == 0 {
                        return self.end_of_stream();
                    }
                    self.consume_inbound(handle)?;
                    self.flush_outbound().await?;
                }
            }
        }
    }

    /// Give the installed state a chance to emit the next outbound bundle.
    fn producer_turn(&mut self, handle: &Arc<ConnectionHandle>) -> Result<bool> {
        let mut state = self.take_state()?;
        let mut assembly = buffer_pool::with_capacity(WRITER_RESERVE);
        let mut ctl = ChannelControl::new(handle);

        let wrote = state.on_send_ready(&mut BundleWriter::new(&mut assembly), &mut ctl);
        self.state = Some(state);
        let wrote = wrote?;
        self.apply_control(ctl);

        if wrote {
            self.queue_bundle(&assembly)?;
        }
        Ok(wrote)
    }

    /// Deliver every complete inbound bundle, each exactly once.
    fn consume_inbound(&mut self, handle: &Arc<ConnectionHandle>) -> Result<()> {
        while let Some(payload) = self.decoder.decode(&mut self.inbound, self.options.compression)? {
            let mut state = self.take_state()?;
            let mut reader = BundleReader::new(payload);
            let mut assembly = buffer_pool::with_capacity(WRITER_RESERVE);
            let mut ctl = ChannelControl::new(handle);

            let replied =
                state.on_bundle(&mut reader, &mut BundleWriter::new(&mut assembly), &mut ctl);
            self.state = Some(state);
            let replied = replied?;
            self.apply_control(ctl);

            if replied {
                self.queue_bundle(&assembly)?;
            }
        }
        Ok(())
    }

    fn take_state(&mut self) -> Result<Box<dyn ChannelState>> {
        self.state
            .take()
            .ok_or_else(|| ProtocolError::Config("channel driven without an installed state".into()))
    }

    fn apply_control(&mut self, ctl: ChannelControl<'_>) {
        if let Some(next) = ctl.next_state {
            self.state = Some(next);
        }
        if ctl.close {
            self.local_close = true;
        }
    }

    fn queue_bundle(&mut self, payload: &[u8]) -> Result<()> {
        let frame = encode_bundle(
            payload,
            self.options.compression,
            self.options.compression_level,
        )?;
        self.pending_out.push_back(frame);
        Ok(())
    }

    async fn flush_outbound(&mut self) -> Result<()> {
        if self.pending_out.is_empty() {
            return Ok(());
        }
        while let Some(frame) = self.pending_out.pop_front() {
            self.stream.write_all(&frame).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    fn end_of_stream(&mut self) -> Result<()> {
        if self.decoder.mid_bundle() || !self.inbound.is_empty() {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        trace!(remote = %self.remote, "peer closed the stream");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let payload = b"a bundle of reasonable size".repeat(50);
        for kind in [CompressionKind::Lz4, CompressionKind::Zstd] {
            let frame = encode_bundle(&payload, kind, 3).unwrap();
            let mut buf = BytesMut::from(&frame[..]);
            let mut decoder = BundleDecoder::new();
            let decoded = decoder.decode(&mut buf, kind).unwrap().unwrap();
            assert_eq!(decoded, payload);
            assert!(buf.is_empty());
            assert!(!decoder.mid_bundle());
        }
    }

    #[test]
    fn partial_frames_wait_for_more_data() {
        let frame = encode_bundle(b"split across reads", CompressionKind::Zstd, 3).unwrap();
        let mut decoder = BundleDecoder::new();

        // Feed the header plus one payload byte first.
        let mut partial = BytesMut::from(&frame[..BUNDLE_HEADER_LEN + 1]);
        assert!(decoder
            .decode(&mut partial, CompressionKind::Zstd)
            .unwrap()
            .is_none());
        assert!(decoder.mid_bundle());

        partial.extend_from_slice(&frame[BUNDLE_HEADER_LEN + 1..]);
        let decoded = decoder
            .decode(&mut partial, CompressionKind::Zstd)
            .unwrap()
            .unwrap();
        assert_eq!(decoded, b"split across reads");
    }

    #[test]
    fn back_to_back_bundles_decode_in_order() {
        let mut buf = BytesMut::new();
        for i in 0..3u8 {
            let frame = encode_bundle(&[i + 1; 64], CompressionKind::Lz4, 0).unwrap();
            buf.extend_from_slice(&frame);
        }
        let mut decoder = BundleDecoder::new();
        for i in 0..3u8 {
            let payload = decoder.decode(&mut buf, CompressionKind::Lz4).unwrap().unwrap();
            assert_eq!(payload, vec![i + 1; 64]);
        }
        assert!(decoder.decode(&mut buf, CompressionKind::Lz4).unwrap().is_none());
    }

    #[test]
    fn zero_length_header_is_fatal() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0][..]);
        let mut decoder = BundleDecoder::new();
        assert!(matches!(
            decoder.decode(&mut buf, CompressionKind::Zstd),
            Err(ProtocolError::EmptyBundle)
        ));
    }

    #[test]
    fn oversized_header_is_fatal_before_reading_payload() {
        let claimed = (MAX_WIRE_BUNDLE_SIZE as u32) + 1;
        let mut buf = BytesMut::from(&claimed.to_be_bytes()[..]);
        let mut decoder = BundleDecoder::new();
        assert!(matches!(
            decoder.decode(&mut buf, CompressionKind::Zstd),
            Err(ProtocolError::OversizedBundle(_))
        ));
    }

    #[test]
    fn empty_payload_cannot_be_queued() {
        assert!(matches!(
            encode_bundle(&[], CompressionKind::Zstd, 3),
            Err(ProtocolError::EmptyBundle)
        ));
    }

    #[test]
    fn reader_helpers() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&5u16.to_be_bytes());
        payload.extend_from_slice(b"hello");
        payload.push(0x42);
        payload.extend_from_slice(b"rest");

        let mut reader = BundleReader::new(payload);
        assert_eq!(reader.read_string().unwrap(), "hello");
        assert_eq!(reader.read_u8().unwrap(), 0x42);
        assert_eq!(reader.read_to_end(), b"rest");
        assert!(reader.is_empty());
        assert!(reader.read_u8().is_err());
    }

    #[test]
    fn writer_helpers() {
        let mut buf = Vec::new();
        let mut writer = BundleWriter::new(&mut buf);
        writer.write_string("id").unwrap();
        writer.write_u8(7);
        writer.write_bytes(b"xy");
        assert_eq!(writer.len(), 2 + 2 + 1 + 2);
        assert_eq!(buf, [0, 2, b'i', b'd', 7, b'x', b'y']);
    }
}
