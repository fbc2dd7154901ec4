//! Property-based tests for bundle framing
//!
//! These validate the framing invariants across randomly generated payloads:
//! whatever goes through the outbound encode path comes back byte-identical
//! through the inbound decode path, and the 64 MiB caps reject oversized
//! input before any allocation happens.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bundle_transport::config::MAX_WIRE_BUNDLE_SIZE;
use bundle_transport::error::ProtocolError;
use bundle_transport::transport::{encode_bundle, BundleDecoder};
use bundle_transport::utils::compression::CompressionKind;
use bundle_transport::{TagStructure, TagValue};
use bytes::BytesMut;
use proptest::prelude::*;

// Property: every non-empty payload round-trips through encode + decode
proptest! {
    #[test]
    fn prop_bundle_roundtrip_zstd(payload in prop::collection::vec(any::<u8>(), 1..16384)) {
        let frame = encode_bundle(&payload, CompressionKind::Zstd, 3).expect("encode should not fail");
        let mut buf = BytesMut::from(&frame[..]);
        let mut decoder = BundleDecoder::new();
        let decoded = decoder
            .decode(&mut buf, CompressionKind::Zstd)
            .expect("decode should not fail")
            .expect("a complete frame must decode");
        prop_assert_eq!(decoded, payload);
        prop_assert!(buf.is_empty());
    }
}

proptest! {
    #[test]
    fn prop_bundle_roundtrip_lz4(payload in prop::collection::vec(any::<u8>(), 1..16384)) {
        let frame = encode_bundle(&payload, CompressionKind::Lz4, 0).expect("encode should not fail");
        let mut buf = BytesMut::from(&frame[..]);
        let mut decoder = BundleDecoder::new();
        let decoded = decoder
            .decode(&mut buf, CompressionKind::Lz4)
            .expect("decode should not fail")
            .expect("a complete frame must decode");
        prop_assert_eq!(decoded, payload);
    }
}

// Property: decoding is incremental — feeding a frame byte by byte yields
// exactly one bundle, at the end
proptest! {
    #[test]
    fn prop_incremental_decode(payload in prop::collection::vec(any::<u8>(), 1..2048)) {
        let frame = encode_bundle(&payload, CompressionKind::Zstd, 1).unwrap();
        let mut decoder = BundleDecoder::new();
        let mut buf = BytesMut::new();
        let mut decoded = None;

        for (i, byte) in frame.iter().enumerate() {
            buf.extend_from_slice(&[*byte]);
            if let Some(bundle) = decoder.decode(&mut buf, CompressionKind::Zstd).unwrap() {
                prop_assert_eq!(i, frame.len() - 1, "bundle must complete only on the last byte");
                decoded = Some(bundle);
            }
        }
        prop_assert_eq!(decoded.expect("bundle must decode"), payload);
    }
}

// Property: several bundles back to back decode in order with no bleed
proptest! {
    #[test]
    fn prop_back_to_back_ordering(payloads in prop::collection::vec(
        prop::collection::vec(any::<u8>(), 1..512), 1..8)) {
        let mut buf = BytesMut::new();
        for payload in &payloads {
            buf.extend_from_slice(&encode_bundle(payload, CompressionKind::Lz4, 0).unwrap());
        }

        let mut decoder = BundleDecoder::new();
        for payload in &payloads {
            let decoded = decoder.decode(&mut buf, CompressionKind::Lz4).unwrap().unwrap();
            prop_assert_eq!(&decoded, payload);
        }
        prop_assert!(decoder.decode(&mut buf, CompressionKind::Lz4).unwrap().is_none());
    }
}

// Property: tag structures survive the full payload + framing stack
proptest! {
    #[test]
    fn prop_tag_structure_through_framing(
        key in "[a-zA-Z][a-zA-Z0-9-]{0,16}",
        text in ".{0,64}",
        number in any::<i64>(),
        flag in any::<bool>(),
    ) {
        let original = TagStructure::new()
            .with(key.as_str(), text.as_str())
            .with("number", number)
            .with("flag", flag);

        let frame = encode_bundle(&original.encode_to_vec(), CompressionKind::Zstd, 3).unwrap();
        let mut buf = BytesMut::from(&frame[..]);
        let payload = BundleDecoder::new()
            .decode(&mut buf, CompressionKind::Zstd)
            .unwrap()
            .unwrap();
        let decoded = TagStructure::decode(&mut payload.as_slice()).unwrap();

        prop_assert_eq!(decoded.get(&key).and_then(TagValue::as_text), Some(text.as_str()));
        prop_assert_eq!(decoded.get("number").and_then(TagValue::as_int), Some(number));
        prop_assert_eq!(decoded.get("flag").and_then(TagValue::as_bool), Some(flag));
    }
}

#[test]
fn megabyte_payload_roundtrip() {
    let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
    let frame = encode_bundle(&payload, CompressionKind::Zstd, 3).unwrap();
    let mut buf = BytesMut::from(&frame[..]);
    let decoded = BundleDecoder::new()
        .decode(&mut buf, CompressionKind::Zstd)
        .unwrap()
        .unwrap();
    assert_eq!(decoded, payload);
}

#[test]
fn header_claiming_more_than_cap_is_fatal_without_reading_payload() {
    let claimed = (MAX_WIRE_BUNDLE_SIZE as u32) + 1;
    // Header only — the decoder must reject before waiting for payload bytes.
    let mut buf = BytesMut::from(&claimed.to_be_bytes()[..]);
    let err = BundleDecoder::new()
        .decode(&mut buf, CompressionKind::Zstd)
        .unwrap_err();
    assert!(matches!(err, ProtocolError::OversizedBundle(_)));
}

#[test]
fn zero_length_header_is_fatal() {
    let mut buf = BytesMut::from(&0u32.to_be_bytes()[..]);
    let err = BundleDecoder::new()
        .decode(&mut buf, CompressionKind::Zstd)
        .unwrap_err();
    assert!(matches!(err, ProtocolError::EmptyBundle));
}

#[test]
fn empty_payload_cannot_be_encoded() {
    assert!(matches!(
        encode_bundle(&[], CompressionKind::Zstd, 3),
        Err(ProtocolError::EmptyBundle)
    ));
}

#[test]
fn inflation_bomb_is_rejected() {
    // An LZ4 frame claiming to inflate far past the bundle cap: the claimed
    // size is validated before decompression allocates anything.
    let mut bomb = ((256u32 * 1024 * 1024) as u32).to_le_bytes().to_vec();
    bomb.extend_from_slice(&[0u8; 64]);
    let mut framed = BytesMut::new();
    framed.extend_from_slice(&(bomb.len() as u32).to_be_bytes());
    framed.extend_from_slice(&bomb);

    let err = BundleDecoder::new()
        .decode(&mut framed, CompressionKind::Lz4)
        .unwrap_err();
    assert!(matches!(err, ProtocolError::DecompressionFailure));
}
