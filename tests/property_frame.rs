//! Property tests for the frame codec (RFC 6455).
//!
//! Verifies mask involution, encode/decode round-trips across all payload
//! size classes, the no-mask rule for server-originated frames, and
//! opcode validation.

mod common;

use bytes::{Bytes, BytesMut};
use common::{init_test_logging, test_proptest_config};
use proptest::prelude::*;
use textsock::{apply_mask, Frame, FrameCodec, Opcode, SockError};
use tokio_util::codec::{Decoder, Encoder};

// ============================================================================
// Generators
// ============================================================================

fn arb_mask_key() -> impl Strategy<Value = [u8; 4]> {
    any::<[u8; 4]>()
}

fn arb_payload_any() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=4096)
}

/// Payload lengths straddling the 7-bit/16-bit/64-bit length encodings.
fn arb_boundary_len() -> impl Strategy<Value = usize> {
    prop_oneof![
        0usize..=125,
        Just(126usize),
        Just(65_535usize),
        Just(65_536usize),
        126usize..=1024,
    ]
}

fn arb_reserved_opcode() -> impl Strategy<Value = u8> {
    prop_oneof![0x3u8..=0x7u8, 0xBu8..=0xFu8]
}

// ============================================================================
// Mask involution
// ============================================================================

proptest! {
    #![proptest_config(test_proptest_config(500))]

    /// XOR masking is self-inverse.
    #[test]
    fn mask_is_involution(data in arb_payload_any(), key in arb_mask_key()) {
        init_test_logging();
        let original = data.clone();
        let mut buf = data;
        apply_mask(&mut buf, key);
        apply_mask(&mut buf, key);
        prop_assert_eq!(buf, original, "double masking must yield original data");
    }

    /// Masking with the zero key is the identity.
    #[test]
    fn mask_zero_key_is_identity(data in arb_payload_any()) {
        init_test_logging();
        let original = data.clone();
        let mut buf = data;
        apply_mask(&mut buf, [0, 0, 0, 0]);
        prop_assert_eq!(buf, original);
    }
}

// ============================================================================
// Round-trips
// ============================================================================

proptest! {
    #![proptest_config(test_proptest_config(300))]

    /// A masked client text frame decodes on the server to the original
    /// payload, with nothing left in the buffer.
    #[test]
    fn masked_client_frame_roundtrips(payload in arb_payload_any(), key in arb_mask_key()) {
        init_test_logging();
        let mut encoder = FrameCodec::client().max_receive_size(usize::MAX);
        let mut decoder = FrameCodec::server().max_receive_size(usize::MAX);
        let frame = Frame::text(Bytes::from(payload.clone())).mask(key);

        let mut buf = BytesMut::new();
        encoder.encode(frame, &mut buf).unwrap();
        prop_assert_eq!(buf[1] & 0x80, 0x80, "mask bit must be set");

        let parsed = decoder.decode(&mut buf).unwrap().unwrap();
        prop_assert!(parsed.fin);
        prop_assert_eq!(parsed.opcode, Opcode::Text);
        prop_assert_eq!(parsed.payload.as_ref(), payload.as_slice());
        prop_assert!(buf.is_empty(), "a frame must be consumed exactly");
    }

    /// Server-originated frames never carry the mask bit or a key, and
    /// the payload goes onto the wire verbatim.
    #[test]
    fn server_frames_are_unmasked(payload in arb_payload_any()) {
        init_test_logging();
        let mut encoder = FrameCodec::server().max_receive_size(usize::MAX);
        let mut buf = BytesMut::new();
        encoder.encode(Frame::text(Bytes::from(payload.clone())), &mut buf).unwrap();

        prop_assert_eq!(buf[1] & 0x80, 0, "server frame must not set the mask bit");
        let header_len = if payload.len() > 65_535 {
            10
        } else if payload.len() > 125 {
            4
        } else {
            2
        };
        prop_assert_eq!(buf.len(), header_len + payload.len());
        prop_assert_eq!(&buf[header_len..], payload.as_slice());
    }

    /// Boundary payload lengths pick the right size class and round-trip.
    #[test]
    fn boundary_lengths_roundtrip(len in arb_boundary_len(), key in arb_mask_key()) {
        init_test_logging();
        let mut encoder = FrameCodec::client().max_receive_size(usize::MAX);
        let mut decoder = FrameCodec::server().max_receive_size(usize::MAX);
        let payload = vec![0x5A; len];
        let frame = Frame::text(Bytes::from(payload)).mask(key);

        let mut buf = BytesMut::new();
        encoder.encode(frame, &mut buf).unwrap();

        let len7 = buf[1] & 0x7F;
        if len <= 125 {
            prop_assert_eq!(usize::from(len7), len);
        } else if len <= 65_535 {
            prop_assert_eq!(len7, 126);
        } else {
            prop_assert_eq!(len7, 127);
        }

        let parsed = decoder.decode(&mut buf).unwrap().unwrap();
        prop_assert_eq!(parsed.payload.len(), len);
    }

    /// Decoding and re-encoding a masked client frame reproduces the
    /// original wire bytes (the decoded frame keeps its mask key, so the
    /// encoder re-applies the identical mask).
    #[test]
    fn parse_then_serialize_is_identity(payload in arb_payload_any(), key in arb_mask_key()) {
        init_test_logging();
        let mut encoder = FrameCodec::client().max_receive_size(usize::MAX);
        let mut decoder = FrameCodec::server().max_receive_size(usize::MAX);
        let mut wire = BytesMut::new();
        encoder.encode(Frame::text(Bytes::from(payload)).mask(key), &mut wire).unwrap();
        let original = wire.clone();

        let parsed = decoder.decode(&mut wire).unwrap().unwrap();
        let mut rewire = BytesMut::new();
        encoder.encode(parsed, &mut rewire).unwrap();
        prop_assert_eq!(rewire.as_ref(), original.as_ref());
    }

    /// Feeding a frame one byte at a time never yields a partial result.
    #[test]
    fn incremental_input_never_yields_partial_frames(
        payload in prop::collection::vec(any::<u8>(), 0..=300),
        key in arb_mask_key(),
    ) {
        init_test_logging();
        let mut encoder = FrameCodec::client().max_receive_size(usize::MAX);
        let mut decoder = FrameCodec::server().max_receive_size(usize::MAX);
        let mut wire = BytesMut::new();
        encoder.encode(Frame::text(Bytes::from(payload.clone())).mask(key), &mut wire).unwrap();

        let mut fed = BytesMut::new();
        while wire.len() > 1 {
            fed.extend_from_slice(&wire.split_to(1));
            prop_assert!(decoder.decode(&mut fed).unwrap().is_none());
        }
        fed.extend_from_slice(&wire);
        let parsed = decoder.decode(&mut fed).unwrap().unwrap();
        prop_assert_eq!(parsed.payload.as_ref(), payload.as_slice());
    }
}

// ============================================================================
// Validation
// ============================================================================

proptest! {
    #![proptest_config(test_proptest_config(200))]

    /// Every reserved opcode value is rejected at decode.
    #[test]
    fn reserved_opcodes_are_rejected(opcode in arb_reserved_opcode(), key in arb_mask_key()) {
        init_test_logging();
        let mut decoder = FrameCodec::server();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x80 | opcode, 0x80]);
        buf.extend_from_slice(&key);

        let result = decoder.decode(&mut buf);
        prop_assert!(matches!(result, Err(SockError::DataFormat(_))));
    }

    /// Unmasked client frames are rejected whatever the opcode.
    #[test]
    fn unmasked_client_frames_are_rejected(payload_len in 0u8..=125) {
        init_test_logging();
        let mut decoder = FrameCodec::server();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x81, payload_len]);
        buf.extend_from_slice(&vec![0u8; usize::from(payload_len)]);

        let result = decoder.decode(&mut buf);
        prop_assert!(matches!(result, Err(SockError::DataFormat(_))));
    }

    /// Declared payload lengths beyond the receive limit are rejected
    /// before any payload arrives.
    #[test]
    fn declared_oversize_is_rejected(extra in 1u16..=1000) {
        init_test_logging();
        let max = 1024usize;
        let mut decoder = FrameCodec::server().max_receive_size(max);
        let declared = (max as u16) + extra;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x81, 0x80 | 126]);
        buf.extend_from_slice(&declared.to_be_bytes());

        let result = decoder.decode(&mut buf);
        let is_oversize = matches!(result, Err(SockError::Oversize { .. }));
        prop_assert!(is_oversize);
    }
}
