//! End-to-end tests for the framing engine.
//!
//! These cover encode/decode round trips across the length encodings,
//! split invariance of the decoder, fragmentation and control-frame
//! interleaving, close payload remapping and size limits.

use bytes::{Bytes, BytesMut};
use proptest::prelude::*;
use rstest::{fixture, rstest};
use sockudo_framing::{
    CloseInfo, DataKind, DecodeOutcome, Error, Frame, FrameDecoder, FrameEncoder, FrameHeader,
    FrameRole, Message, MessageAssembler, MessageFragmentState, OpCode, OutboundOpcode,
    ReadOutcome, Role, SizeLimits,
    alloc::default_allocator,
    mask::{apply_mask, unmask},
};

/// Frame bytes with a fixed mask key
fn masked_frame(b0: u8, payload: &[u8], key: [u8; 4]) -> BytesMut {
    let header = FrameHeader {
        fin: b0 & 0x80 != 0,
        rsv: 0,
        opcode: OpCode::from_u8(b0 & 0x0F).expect("valid opcode"),
        masked: true,
        payload_len: payload.len() as u64,
        mask: Some(key),
    };
    let mut buf = BytesMut::new();
    header.encode(&mut buf);
    let start = buf.len();
    buf.extend_from_slice(payload);
    apply_mask(&mut buf[start..], key);
    buf
}

fn unmasked_frame(b0: u8, payload: &[u8]) -> BytesMut {
    let header = FrameHeader {
        fin: b0 & 0x80 != 0,
        rsv: 0,
        opcode: OpCode::from_u8(b0 & 0x0F).expect("valid opcode"),
        masked: false,
        payload_len: payload.len() as u64,
        mask: None,
    };
    let mut buf = BytesMut::new();
    header.encode(&mut buf);
    buf.extend_from_slice(payload);
    buf
}

fn decode_whole(wire: &[u8]) -> Frame {
    let mut decoder = FrameDecoder::new(true, default_allocator());
    let outcome = decoder
        .process_next_buffer(BytesMut::from(wire))
        .expect("decode");
    assert_eq!(outcome, DecodeOutcome::ExactlyComplete);
    let mut frame = decoder.take_frame().expect("frame");
    frame.unmask();
    frame
}

fn frame_bytes(frame: &Frame) -> Vec<u8> {
    frame.payload().iter().flat_map(|b| b.iter().copied()).collect()
}

#[fixture]
fn client_assembler() -> MessageAssembler {
    MessageAssembler::new(Role::Client, SizeLimits::default(), false, default_allocator())
}

#[fixture]
fn server_assembler() -> MessageAssembler {
    MessageAssembler::new(Role::Server, SizeLimits::default(), false, default_allocator())
}

#[rstest]
fn round_trip_through_encoder(
    #[values(0, 1, 125, 126, 65535, 65536)] len: usize,
    #[values(DataKind::Text, DataKind::Binary)] kind: DataKind,
    mut server_assembler: MessageAssembler,
) {
    let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();

    let mut encoder = FrameEncoder::new(default_allocator());
    let buffers = if payload.is_empty() {
        Vec::new()
    } else {
        vec![BytesMut::from(&payload[..])]
    };
    encoder
        .format(buffers, OutboundOpcode::data(kind, FrameRole::Whole), true)
        .expect("format");
    let wire = encoder.wire_buffers().concat();
    encoder.cleanup();

    let frame = decode_whole(&wire);
    assert!(frame.is_final());
    assert_eq!(
        frame.opcode(),
        match kind {
            DataKind::Text => OpCode::Text,
            DataKind::Binary => OpCode::Binary,
        }
    );
    assert_eq!(frame_bytes(&frame), payload);

    let outcome = server_assembler
        .process_read(Some(BytesMut::from(&wire[..])))
        .expect("assemble");
    let received = match (kind, outcome) {
        (DataKind::Text, ReadOutcome::Complete(Message::Text(p)))
        | (DataKind::Binary, ReadOutcome::Complete(Message::Binary(p))) => p,
        (_, other) => panic!("unexpected outcome {other:?}"),
    };
    assert_eq!(received.len(), len);
    assert_eq!(&received.to_bytes()[..], &payload[..]);
}

#[rstest]
#[case(0, 6)]
#[case(125, 6)]
#[case(126, 8)]
#[case(65535, 8)]
#[case(65536, 14)]
fn header_width_matches_length(#[case] len: usize, #[case] header_len: usize) {
    let wire = masked_frame(0x82, &vec![7u8; len], [1, 2, 3, 4]);
    assert_eq!(wire.len() - len, header_len);
    assert_eq!(decode_whole(&wire).payload_len(), len as u64);
}

#[rstest]
fn hello_decodes_unmasked(mut client_assembler: MessageAssembler) {
    let input = BytesMut::from(&[0x81, 0x05, b'H', b'e', b'l', b'l', b'o'][..]);
    match client_assembler.process_read(Some(input)).expect("assemble") {
        ReadOutcome::Complete(Message::Text(p)) => assert_eq!(p.as_text().as_deref(), Some("Hello")),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn hello_encodes_masked() {
    let mut encoder = FrameEncoder::new(default_allocator());
    encoder
        .format(
            vec![BytesMut::from(&b"Hello"[..])],
            OutboundOpcode::Text(FrameRole::Whole),
            true,
        )
        .expect("format");
    let wire = encoder.wire_buffers().concat();

    assert_eq!(wire.len(), 2 + 4 + 5);
    assert_eq!(&wire[..2], &[0x81, 0x85]);
    let key = [wire[2], wire[3], wire[4], wire[5]];
    let mut payload = wire[6..].to_vec();
    apply_mask(&mut payload, key);
    assert_eq!(payload, b"Hello");
}

#[rstest]
fn fragments_assemble_in_order(mut server_assembler: MessageAssembler) {
    let key = [9, 8, 7, 6];
    let frames = [
        masked_frame(0x01, b"frag", key),
        masked_frame(0x00, b"men", key),
        masked_frame(0x80, b"ted", key),
    ];

    let mut last = ReadOutcome::FrameIncomplete;
    for frame in frames {
        last = server_assembler.process_read(Some(frame)).expect("assemble");
    }
    match last {
        ReadOutcome::Complete(Message::Text(p)) => {
            assert_eq!(p.chunks().len(), 3);
            assert_eq!(p.to_bytes(), Bytes::from_static(b"fragmented"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[rstest]
fn continuation_first_is_protocol_error(mut server_assembler: MessageAssembler) {
    let err = server_assembler
        .process_read(Some(masked_frame(0x80, b"x", [1, 1, 1, 1])))
        .expect_err("must fail");
    assert!(matches!(err, Error::Protocol(_)));
    assert_eq!(err.close_code(), 1002);
}

#[rstest]
fn ping_between_fragments_keeps_state(mut server_assembler: MessageAssembler) {
    let key = [0xAA, 0xBB, 0xCC, 0xDD];
    let mut input = masked_frame(0x01, b"Hel", key);
    input.extend_from_slice(&masked_frame(0x89, b"?", key));
    input.extend_from_slice(&masked_frame(0x80, b"lo", key));

    let outcome = server_assembler.process_read(Some(input)).expect("assemble");
    assert!(matches!(
        outcome,
        ReadOutcome::ControlMessageEmbedded(Message::Ping(_))
    ));
    assert_eq!(
        server_assembler.fragment_state(),
        MessageFragmentState::FirstOfMultiple
    );
    server_assembler.reset_control_frame_parameters();

    match server_assembler.process_read(None).expect("assemble") {
        ReadOutcome::Complete(Message::Text(p)) => assert_eq!(&p.to_bytes()[..], b"Hello"),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[rstest]
#[case::no_status_code(&[0x03, 0xED], Some(1002))]
#[case::normal_with_reason(&[0x03, 0xE8, b'o', b'k'], Some(1000))]
#[case::one_byte(&[0x03], Some(1002))]
#[case::bad_utf8(&[0x03, 0xE8, 0xC3, 0x28], Some(1007))]
#[case::empty(&[], None)]
fn close_payload_remapping(#[case] payload: &[u8], #[case] expected: Option<u16>) {
    let mut assembler =
        MessageAssembler::new(Role::Client, SizeLimits::default(), false, default_allocator());
    match assembler
        .process_read(Some(unmasked_frame(0x88, payload)))
        .expect("assemble")
    {
        ReadOutcome::Complete(Message::Close(info)) => {
            assert_eq!(info.as_ref().map(|i| i.code), expected);
            if expected == Some(1000) {
                assert_eq!(info, Some(CloseInfo::new(1000, "ok")));
            }
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn size_limit_trips_before_final_fragment() {
    let limits = SizeLimits {
        max_text: 10,
        max_binary: 10,
        consumer_override: None,
    };
    let mut assembler = MessageAssembler::new(Role::Client, limits, false, default_allocator());
    assembler
        .process_read(Some(unmasked_frame(0x01, b"123456")))
        .expect("first fragment fits");

    // Header of a 1000 byte continuation plus a few payload bytes
    let mut partial = unmasked_frame(0x00, &[0u8; 1000]);
    partial.truncate(8);
    let err = assembler.process_read(Some(partial)).expect_err("too large");
    assert!(matches!(err, Error::MessageTooLarge(_)));
    assert_eq!(err.close_code(), 1009);
    assert_eq!(assembler.fragment_state(), MessageFragmentState::ExpectingNew);
}

proptest! {
    #[test]
    fn split_decoding_matches_whole(
        payload in proptest::collection::vec(any::<u8>(), 0..400),
        key in any::<[u8; 4]>(),
        cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..6),
    ) {
        let wire = masked_frame(0x82, &payload, key);
        let whole = decode_whole(&wire);

        let mut points: Vec<usize> = cuts.iter().map(|i| 1 + i.index(wire.len() - 1)).collect();
        points.sort_unstable();
        points.dedup();

        let mut decoder = FrameDecoder::new(true, default_allocator());
        let mut start = 0;
        for point in points.into_iter().chain(std::iter::once(wire.len())) {
            let outcome = decoder
                .process_next_buffer(BytesMut::from(&wire[start..point]))
                .expect("decode");
            if point == wire.len() {
                prop_assert_eq!(outcome, DecodeOutcome::ExactlyComplete);
            } else {
                prop_assert_eq!(outcome, DecodeOutcome::Incomplete);
            }
            start = point;
        }
        let mut split = decoder.take_frame().expect("frame");
        split.unmask();

        prop_assert_eq!(&split.header, &whole.header);
        prop_assert_eq!(frame_bytes(&split), frame_bytes(&whole));
        prop_assert_eq!(frame_bytes(&split), payload);
    }

    #[test]
    fn masking_is_self_inverse(
        payload in proptest::collection::vec(any::<u8>(), 0..300),
        key in any::<[u8; 4]>(),
        split in any::<prop::sample::Index>(),
    ) {
        let mut once = payload.clone();
        apply_mask(&mut once, key);
        let mut twice = once.clone();
        apply_mask(&mut twice, key);
        prop_assert_eq!(&twice, &payload);

        let at = if payload.is_empty() { 0 } else { split.index(payload.len()) };
        let mut buffers = vec![BytesMut::from(&payload[..at]), BytesMut::from(&payload[at..])];
        unmask(key, &mut buffers);
        let joined: Vec<u8> = buffers.iter().flat_map(|b| b.iter().copied()).collect();
        prop_assert_eq!(joined, once);
    }
}
