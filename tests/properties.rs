//! Property tests for negotiation, handshake records and chunking.

use std::collections::BTreeSet;

use bytes::Bytes;
use jfap::codec::{ChunkFlag, Chunker, Reassembler};
use jfap::protocol::message::encode_fields;
use jfap::protocol::{
    CapabilityMask, FapBitmap, HandshakeKind, HandshakeRecord, ProtocolVersion,
    SupportedVersionTable,
};
use proptest::prelude::*;

fn level_set() -> impl Strategy<Value = BTreeSet<u16>> {
    prop::collection::btree_set(1u16..=40, 0..12)
}

proptest! {
    #[test]
    fn negotiation_picks_highest_common_level(local in level_set(), peer in level_set()) {
        let table = SupportedVersionTable::from_ordinals(local.iter().copied());
        let bitmap = FapBitmap::from_ordinals(peer.iter().copied());
        let expected = local.intersection(&peer).copied().max();

        match table.negotiate(&bitmap) {
            Ok(version) => prop_assert_eq!(Some(version.ordinal()), expected),
            Err(_) => prop_assert_eq!(expected, None),
        }
    }

    #[test]
    fn reserved_levels_are_never_negotiated(peer in level_set(), reserved in 1u16..=40) {
        let mut table = SupportedVersionTable::all_supported(40);
        table.set(reserved, false);
        let bitmap = FapBitmap::from_ordinals(peer.iter().copied());

        if let Ok(version) = table.negotiate(&bitmap) {
            prop_assert_ne!(version, ProtocolVersion(reserved));
            prop_assert!(peer.contains(&version.ordinal()));
        }
    }

    #[test]
    fn reserved_capability_bits_are_rejected(bits in any::<u16>()) {
        let result = CapabilityMask::from_wire(bits);
        prop_assert_eq!(result.is_ok(), bits & CapabilityMask::RESERVED == 0);
    }

    #[test]
    fn handshake_fields_decode_in_any_order(
        fap_level in 1u16..=20,
        max_message_size in 1u64..=u64::from(u32::MAX),
        heartbeat in 0u32..=60_000,
        capabilities in 0u16..0x80,
        seed in any::<u64>(),
    ) {
        let mut record = HandshakeRecord::new(HandshakeKind::MessagingEngine);
        record.product_version = Some((9, 0));
        record.fap_level = Some(fap_level);
        record.max_message_size = Some(max_message_size);
        record.max_transmission_size = Some(65_536);
        record.heartbeat_interval_ms = Some(heartbeat);
        record.heartbeat_timeout_ms = Some(heartbeat / 2);
        record.capabilities = Some(capabilities);
        record.product_id = Some(1);
        record.supported_faps = Some(SupportedVersionTable::legacy().to_bitmap());
        record.usage_type = Some(0);
        record.topology.cell = Some("cell01".to_string());

        // Rotate the field list by a random amount; order must not matter.
        let mut fields = record.fields();
        let shift = (seed % fields.len() as u64) as usize;
        fields.rotate_left(shift);
        if seed & 1 == 1 {
            fields.reverse();
        }

        let encoded = encode_fields(record.kind, &fields).unwrap();
        prop_assert_eq!(HandshakeRecord::decode(&encoded).unwrap(), record);
    }

    #[test]
    fn chunks_respect_size_and_reassemble(
        len in 0usize..6000,
        threshold in 1usize..3000,
        chunk_size in 1usize..700,
    ) {
        let payload: Bytes = (0..len).map(|i| (i % 256) as u8).collect::<Vec<_>>().into();
        let chunker = Chunker::new(threshold, chunk_size);
        let pieces = chunker.split(payload.clone());

        if pieces.len() == 1 {
            prop_assert_eq!(pieces[0].0, ChunkFlag::Whole);
        } else {
            prop_assert_eq!(pieces[0].0, ChunkFlag::First);
            prop_assert_eq!(pieces[pieces.len() - 1].0, ChunkFlag::Last);
            for (_, piece) in &pieces {
                prop_assert!(piece.len() <= chunk_size);
            }
        }

        let mut reassembler = Reassembler::new(usize::MAX);
        let mut complete = None;
        for (flag, piece) in pieces {
            complete = reassembler.accept(1, 1, flag, piece).unwrap();
        }
        prop_assert_eq!(complete, Some(payload));
        prop_assert_eq!(reassembler.in_progress(), 0);
    }
}
