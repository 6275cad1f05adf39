//! Property tests for value encoding, framing and compression.

use bytes::BytesMut;
use proptest::prelude::*;
use tokio_util::codec::Decoder;
use weft_proto::compressor::{self, CompressorName};
use weft_proto::packet::Packet;
use weft_proto::packet::node::{ConnectPacket, MapObjectPacket};
use weft_proto::packet::object::{ObjectAddress, ObjectDataHeader, ObjectDataPacket, encode_data_frame};
use weft_proto::packet::ObjectCommand;
use weft_proto::{ConnectionDescription, FrameCodec, InstanceId, NodeId, ObjectId, Version, WireDecode, WireEncode};

fn arb_version() -> impl Strategy<Value = Version> {
    (any::<u64>(), any::<u64>()).prop_map(|(high, low)| Version::new(high, low))
}

proptest! {
    #[test]
    fn strings_survive_encoding(value in ".*") {
        let bytes = value.to_wire();
        let mut slice = bytes.as_slice();
        prop_assert_eq!(String::decode(&mut slice).unwrap(), value);
        prop_assert!(slice.is_empty());
    }

    #[test]
    fn version_order_matches_u128(a in arb_version(), b in arb_version()) {
        prop_assert_eq!(a.cmp(&b), a.as_u128().cmp(&b.as_u128()));
    }

    #[test]
    fn truncated_packets_never_panic(cut in 0usize..120, request_id in any::<u32>()) {
        let frame = MapObjectPacket {
            requested_version: Version::OLDEST,
            object_id: ObjectId::generate(),
            request_id,
            instance_id: InstanceId(3),
            ..Default::default()
        }
        .to_frame();
        let cut = cut.min(frame.len());
        let _ = MapObjectPacket::from_frame(&frame[..cut]);
    }

    #[test]
    fn codec_reassembles_split_frames(split in 1usize..64, hosts in proptest::collection::vec("[a-z]{1,12}", 0..4)) {
        let packet = ConnectPacket {
            request_id: 1,
            node_id: NodeId::generate(),
            node_type: 1,
            node_data: hosts.iter().map(|h| ConnectionDescription::tcp(h.clone(), 4242)).collect(),
        };
        let frame = packet.to_frame();
        let split = split.min(frame.len());

        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&frame[..split]);
        let mut decoded = codec.decode(&mut buf).unwrap();
        if decoded.is_none() {
            buf.extend_from_slice(&frame[split..]);
            decoded = codec.decode(&mut buf).unwrap();
        }
        let decoded = decoded.unwrap();
        prop_assert_eq!(ConnectPacket::from_frame(&decoded).unwrap(), packet);
    }

    #[test]
    fn rle_restores_input(input in proptest::collection::vec(prop_oneof![Just(0u8), Just(7u8), any::<u8>()], 0..2048)) {
        let rle = compressor::lookup(CompressorName::Rle).unwrap().unwrap();
        let chunks = rle.compress(&input).unwrap();
        let refs: Vec<&[u8]> = chunks.iter().map(Vec::as_slice).collect();
        let out = compressor::decompress_chunks(CompressorName::Rle as u32, &refs, input.len()).unwrap();
        prop_assert_eq!(out, input);
    }

    #[test]
    fn data_packet_chunks_survive(chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..256), 0..6)) {
        let header = ObjectDataHeader {
            address: ObjectAddress::new(ObjectId(1), InstanceId::ALL),
            version: Version::FIRST,
            ..Default::default()
        };
        let frame = encode_data_frame(ObjectCommand::Delta, &header, &chunks);
        let parsed = ObjectDataPacket::parse(&frame).unwrap();
        prop_assert_eq!(parsed.chunks.len(), chunks.len());
        for (got, want) in parsed.chunks.iter().zip(chunks.iter()) {
            prop_assert_eq!(*got, want.as_slice());
        }
    }
}
