//! Property tests for the wire formats

use proptest::prelude::*;
use serde::{Deserialize, Serialize};

use securemux::envelope_messages;
use securemux::packet::{encode_frame, FrameDecoder};
use securemux::{EnvelopeCodec, Packet, PacketKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Note {
    id: u64,
    body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Flag(bool);

envelope_messages! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Sample {
        Note(Note),
        Flag(Flag),
    }
}

fn packet_kind() -> impl Strategy<Value = PacketKind> {
    prop::sample::select(PacketKind::ALL.to_vec())
}

fn sample_message() -> impl Strategy<Value = Sample> {
    prop_oneof![
        (any::<u64>(), prop::collection::vec(any::<u8>(), 0..300))
            .prop_map(|(id, body)| Sample::Note(Note { id, body })),
        any::<bool>().prop_map(|flag| Sample::Flag(Flag(flag))),
    ]
}

proptest! {
    #[test]
    fn packet_survives_serialization(
        kind in packet_kind(),
        content in prop::collection::vec(any::<u8>(), 0..2048),
    ) {
        let packet = Packet::new(kind, content);
        let bytes = packet.to_bytes();
        prop_assert_eq!(Packet::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn frames_reassemble_from_any_split(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..512), 1..8),
        chunk in 1usize..64,
    ) {
        let mut wire = Vec::new();
        for payload in &payloads {
            wire.extend_from_slice(&encode_frame(payload));
        }

        let mut decoder = FrameDecoder::new(1024);
        let mut frames = Vec::new();
        for piece in wire.chunks(chunk) {
            decoder.push(piece);
            while let Some(frame) = decoder.decode().unwrap() {
                frames.push(frame.to_vec());
            }
        }
        prop_assert_eq!(frames, payloads);
    }

    #[test]
    fn envelopes_survive_fragmentation(
        messages in prop::collection::vec(sample_message(), 1..16),
        chunk in 1usize..40,
        write_limit in 1usize..128,
    ) {
        let mut sender = EnvelopeCodec::<Sample>::new();
        for message in &messages {
            sender.enqueue(message).unwrap();
        }

        let mut wire = Vec::new();
        while sender.has_outbound() {
            wire.extend_from_slice(&sender.write(write_limit));
        }

        let mut receiver = EnvelopeCodec::<Sample>::new();
        let mut received = Vec::new();
        for piece in wire.chunks(chunk) {
            receiver.feed(piece);
            while let Some(message) = receiver.try_dequeue().unwrap() {
                received.push(message);
            }
        }

        prop_assert_eq!(received, messages);
        prop_assert_eq!(receiver.buffered_inbound(), 0);
    }
}
