//! Block encode/decode through the packet codec, with and without LZ4.

use bytes::BytesMut;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use qail_ch::protocol::{
    Block, ClientPacket, CodecContext, Column, CompressionMethod, EncodeError, PacketCodec, WireWrite,
    known_setting_kind, tag,
};

const REVISION: u64 = 54465;

fn uint64_column(name: &str, rows: u64) -> Column {
    let data: Vec<u8> = (0..rows).flat_map(|v| (v * 31).to_le_bytes()).collect();
    Column::new(tag::UINT64, name, data)
}

fn string_column(name: &str, values: &[String]) -> Column {
    let mut data = BytesMut::new();
    for v in values {
        data.put_str(v);
    }
    Column::new(tag::STRING, name, data.freeze())
}

fn round_trip(block: &Block, compression: CompressionMethod) -> Block {
    let ctx = CodecContext::negotiated(REVISION, compression);
    let mut wire = BytesMut::new();
    PacketCodec::encode_data("", block, &ctx, &mut wire).unwrap();
    match PacketCodec::decode_client(&mut wire, &ctx, &known_setting_kind).unwrap() {
        Some(ClientPacket::Data { table, block }) => {
            assert!(table.is_empty());
            assert!(wire.is_empty(), "trailing bytes after data packet");
            block
        }
        other => panic!("expected data packet, got {:?}", other),
    }
}

#[test]
fn test_round_trip_grid() {
    for compression in [CompressionMethod::None, CompressionMethod::Lz4] {
        for columns in [0usize, 1, 7] {
            for rows in [0u64, 1, 1000] {
                let mut block = Block::new(rows);
                for c in 0..columns {
                    block.push(uint64_column(&format!("c{}", c), rows));
                }

                if columns == 0 && rows > 0 {
                    let ctx = CodecContext::negotiated(REVISION, compression);
                    let err = PacketCodec::encode_data("", &block, &ctx, &mut BytesMut::new()).unwrap_err();
                    assert_eq!(err, EncodeError::RowsWithoutColumns(rows));
                    continue;
                }

                assert_eq!(round_trip(&block, compression), block, "{:?} {}x{}", compression, columns, rows);
            }
        }
    }
}

#[test]
fn test_mismatched_payload_is_fatal() {
    let block = Block::new(3).with_column(Column::new(tag::UINT32, "id", vec![0u8; 8]));
    let ctx = CodecContext::negotiated(REVISION, CompressionMethod::Lz4);
    let err = PacketCodec::encode_data("", &block, &ctx, &mut BytesMut::new()).unwrap_err();
    assert_eq!(
        err,
        EncodeError::RowCountMismatch {
            column: "id".to_string(),
            expected: 3,
            actual: 2
        }
    );
}

#[test]
fn test_compressed_packet_is_smaller_for_repetitive_data() {
    let block = Block::new(10_000).with_column(Column::new(tag::UINT8, "flag", vec![1u8; 10_000]));
    let mut plain = BytesMut::new();
    let mut packed = BytesMut::new();
    PacketCodec::encode_data("", &block, &CodecContext::negotiated(REVISION, CompressionMethod::None), &mut plain)
        .unwrap();
    PacketCodec::encode_data("", &block, &CodecContext::negotiated(REVISION, CompressionMethod::Lz4), &mut packed)
        .unwrap();
    assert!(packed.len() < plain.len() / 10);
}

proptest! {
    #[test]
    fn prop_mixed_columns_round_trip(
        values in proptest::collection::vec(("[a-z]{0,12}", any::<u32>()), 0..200),
        lz4 in any::<bool>(),
    ) {
        let rows = values.len() as u64;
        let names: Vec<String> = values.iter().map(|(s, _)| s.clone()).collect();
        let ids: Vec<u8> = values.iter().flat_map(|(_, n)| n.to_le_bytes()).collect();
        let block = Block::new(rows)
            .with_column(Column::new(tag::UINT32, "id", ids))
            .with_column(string_column("name", &names))
            .with_column(uint64_column("seq", rows));

        let compression = if lz4 { CompressionMethod::Lz4 } else { CompressionMethod::None };
        prop_assert_eq!(round_trip(&block, compression), block);
    }
}
