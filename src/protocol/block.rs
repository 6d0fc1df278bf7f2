//! Columnar blocks and their wire form.
//!
//! Body layout:
//!
//! ```text
//! [block info: (field varint, value)* 0]   // revision >= 51903
//! [column count: varint] [row count: varint]
//! per column: [name: string] [type: string] [payload]
//! ```
//!
//! Column payloads are opaque here. Their length is only derived from the
//! type tag to check the row count and to find column boundaries on decode.

use bytes::{BufMut, Bytes, BytesMut};

use super::compression::{self, CompressionMethod};
use super::error::EncodeError;
use super::revision;
use super::types::{self, tag};
use super::wire::{WireError, WireReader, WireResult, WireWrite};

/// Sanity bound on the column count of a decoded block.
const MAX_COLUMNS: u64 = 1 << 20;

/// One typed, named, already-serialized column.
///
/// Catalog types (see [`tag`]) get their row count from the payload. Any
/// other ClickHouse type is sent by name with the row count its encoder
/// declares; its payload is passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub type_tag: u8,
    pub name: String,
    pub data: Bytes,
    type_name: Option<String>,
    declared_rows: Option<u64>,
}

impl Column {
    pub fn new(type_tag: u8, name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            type_tag,
            name: name.into(),
            data: data.into(),
            type_name: None,
            declared_rows: None,
        }
    }

    /// A column of any type, e.g. `Nullable(UInt8)` or `Array(String)`,
    /// holding `rows` values the caller already serialized.
    pub fn with_type(
        name: impl Into<String>,
        type_name: impl Into<String>,
        rows: u64,
        data: impl Into<Bytes>,
    ) -> Self {
        let type_name = type_name.into();
        let type_tag = types::name_to_tag(&type_name);
        Self {
            type_tag,
            name: name.into(),
            data: data.into(),
            type_name: (type_tag == tag::OTHER).then_some(type_name),
            declared_rows: Some(rows),
        }
    }

    pub fn type_name(&self) -> &str {
        self.type_name
            .as_deref()
            .unwrap_or_else(|| types::tag_to_name(self.type_tag))
    }

    pub fn declared_rows(&self) -> Option<u64> {
        self.declared_rows
    }

    /// Number of values in the column.
    ///
    /// Uncatalogued types report their declared count. Catalog types are
    /// counted from the payload, which must agree with any declared count.
    pub fn rows(&self) -> Result<u64, EncodeError> {
        let invalid = |reason: String| EncodeError::InvalidPayload {
            column: self.name.clone(),
            reason,
        };
        match self.declared_rows {
            Some(declared) if self.type_tag == tag::OTHER => Ok(declared),
            declared => {
                let counted = types::count_rows(self.type_tag, &self.data).map_err(invalid)?;
                match declared {
                    Some(declared) if declared != counted => Err(invalid(format!(
                        "declares {} rows but the payload holds {}",
                        declared, counted
                    ))),
                    _ => Ok(counted),
                }
            }
        }
    }
}

/// Block info header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub is_overflows: bool,
    pub bucket_num: i32,
}

impl Default for BlockInfo {
    fn default() -> Self {
        Self {
            is_overflows: false,
            bucket_num: -1,
        }
    }
}

/// Ordered columns sharing one row count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Block {
    pub info: BlockInfo,
    rows: u64,
    columns: Vec<Column>,
}

impl Block {
    pub fn new(rows: u64) -> Self {
        Self {
            info: BlockInfo::default(),
            rows,
            columns: Vec::new(),
        }
    }

    /// The zero-column, zero-row block that ends a data stream.
    pub fn empty() -> Self {
        Self::new(0)
    }

    pub fn with_column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn push(&mut self, column: Column) {
        self.columns.push(column);
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() && self.rows == 0
    }

    pub fn into_columns(self) -> Vec<Column> {
        self.columns
    }

    /// Total payload bytes across columns.
    pub fn payload_bytes(&self) -> usize {
        self.columns.iter().map(|c| c.data.len()).sum()
    }

    /// Check that every column holds exactly `rows` values.
    pub fn validate(&self) -> Result<(), EncodeError> {
        if self.columns.is_empty() && self.rows != 0 {
            return Err(EncodeError::RowsWithoutColumns(self.rows));
        }
        for column in &self.columns {
            let actual = column.rows()?;
            if actual != self.rows {
                return Err(EncodeError::RowCountMismatch {
                    column: column.name.clone(),
                    expected: self.rows,
                    actual,
                });
            }
        }
        Ok(())
    }
}

/// Serializes blocks and applies the negotiated compression.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockCodec {
    compression: CompressionMethod,
}

impl BlockCodec {
    pub fn new(compression: CompressionMethod) -> Self {
        Self { compression }
    }

    pub fn compression(&self) -> CompressionMethod {
        self.compression
    }

    /// Append the (possibly compressed) body of `block` to `out`.
    pub fn encode(&self, block: &Block, revision: u64, out: &mut BytesMut) -> Result<(), EncodeError> {
        block.validate()?;
        match self.compression {
            CompressionMethod::None => write_body(block, revision, out),
            CompressionMethod::Lz4 => {
                let mut body = BytesMut::with_capacity(block.payload_bytes() + 64);
                write_body(block, revision, &mut body);
                compression::compress_frame(&body, out);
            }
        }
        Ok(())
    }

    /// Read one block body from `r`.
    ///
    /// `Incomplete` means more bytes are needed; everything else is a
    /// protocol violation.
    pub fn decode(&self, r: &mut WireReader<'_>, revision: u64) -> WireResult<Block> {
        match self.compression {
            CompressionMethod::None => {
                if compression::looks_compressed(r.rest()) {
                    return Err(WireError::Malformed(
                        "received a compressed block on a connection without compression".to_string(),
                    ));
                }
                read_body(r, revision)
            }
            CompressionMethod::Lz4 => {
                // A body may span several frames; pull frames until it parses.
                let mut plain = Vec::new();
                loop {
                    compression::decompress_frame(r, &mut plain)?;
                    let mut inner = WireReader::new(&plain);
                    match read_body(&mut inner, revision) {
                        Ok(block) => {
                            if !inner.is_empty() {
                                return Err(WireError::Malformed(format!(
                                    "{} bytes left after block of {} rows; column lengths disagree with the row count",
                                    inner.remaining(),
                                    block.rows()
                                )));
                            }
                            return Ok(block);
                        }
                        Err(WireError::Incomplete) => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    /// Decode a body that must occupy `buf` exactly.
    pub fn decode_exact(&self, buf: &[u8], revision: u64) -> WireResult<Block> {
        let mut r = WireReader::new(buf);
        let block = self.decode(&mut r, revision).map_err(|e| match e {
            WireError::Incomplete => {
                WireError::Malformed("block is shorter than its row count requires".to_string())
            }
            other => other,
        })?;
        if !r.is_empty() {
            return Err(WireError::Malformed(format!(
                "{} bytes left after block of {} rows; column lengths disagree with the row count",
                r.remaining(),
                block.rows()
            )));
        }
        Ok(block)
    }
}

fn write_body(block: &Block, revision: u64, out: &mut BytesMut) {
    if revision >= revision::BLOCK_INFO {
        out.put_uvarint(1);
        out.put_bool(block.info.is_overflows);
        out.put_uvarint(2);
        out.put_i32_le(block.info.bucket_num);
        out.put_uvarint(0);
    }
    out.put_uvarint(block.columns.len() as u64);
    out.put_uvarint(block.rows);
    for column in &block.columns {
        out.put_str(&column.name);
        out.put_str(column.type_name());
        out.extend_from_slice(&column.data);
    }
}

fn read_body(r: &mut WireReader<'_>, revision: u64) -> WireResult<Block> {
    let mut info = BlockInfo::default();
    if revision >= revision::BLOCK_INFO {
        loop {
            match r.uvarint()? {
                0 => break,
                1 => info.is_overflows = r.bool()?,
                2 => info.bucket_num = r.i32_le()?,
                field => {
                    return Err(WireError::Malformed(format!("unknown block info field {}", field)));
                }
            }
        }
    }

    let column_count = r.uvarint()?;
    let rows = r.uvarint()?;
    if column_count > MAX_COLUMNS {
        return Err(WireError::Malformed(format!("block declares {} columns", column_count)));
    }
    if column_count == 0 && rows != 0 {
        return Err(WireError::Malformed(format!("block declares {} rows but no columns", rows)));
    }

    let mut block = Block::new(rows);
    block.info = info;
    for _ in 0..column_count {
        let name = r.string()?;
        let type_name = r.string()?;
        let type_tag = types::name_to_tag(&type_name);
        if type_tag == tag::OTHER && rows > 0 {
            return Err(WireError::Malformed(format!(
                "column '{}' has unsupported type {} with {} rows",
                name, type_name, rows
            )));
        }
        let len = types::payload_len(type_tag, rows, r.rest())?;
        let data = Bytes::copy_from_slice(r.bytes(len)?);
        if type_tag == tag::OTHER {
            block.push(Column::with_type(name, type_name, rows, data));
        } else {
            block.push(Column::new(type_tag, name, data));
        }
    }
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::revision::CLIENT_REVISION;

    fn u32_column(name: &str, values: &[u32]) -> Column {
        let data: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Column::new(tag::UINT32, name, data)
    }

    #[test]
    fn test_empty_block_encodes_non_empty() {
        for method in [CompressionMethod::None, CompressionMethod::Lz4] {
            let codec = BlockCodec::new(method);
            let mut out = BytesMut::new();
            codec.encode(&Block::empty(), CLIENT_REVISION, &mut out).unwrap();
            assert!(!out.is_empty());
            let decoded = codec.decode_exact(&out, CLIENT_REVISION).unwrap();
            assert!(decoded.is_empty());
        }
    }

    #[test]
    fn test_uncompressed_layout() {
        let block = Block::new(1).with_column(u32_column("x", &[7]));
        let mut out = BytesMut::new();
        BlockCodec::default().encode(&block, CLIENT_REVISION, &mut out).unwrap();
        let expected: &[u8] = &[
            1, 0, // is_overflows = false
            2, 0xff, 0xff, 0xff, 0xff, // bucket_num = -1
            0, // end of block info
            1, 1, // 1 column, 1 row
            1, b'x', 6, b'U', b'I', b'n', b't', b'3', b'2', 7, 0, 0, 0,
        ];
        assert_eq!(&out[..], expected);
    }

    #[test]
    fn test_encode_rejects_row_mismatch() {
        let block = Block::new(3)
            .with_column(u32_column("a", &[1, 2, 3]))
            .with_column(u32_column("b", &[1, 2]));
        let err = BlockCodec::default()
            .encode(&block, CLIENT_REVISION, &mut BytesMut::new())
            .unwrap_err();
        assert_eq!(
            err,
            EncodeError::RowCountMismatch {
                column: "b".to_string(),
                expected: 3,
                actual: 2
            }
        );
    }

    #[test]
    fn test_decode_rejects_extra_column_bytes() {
        // Declares 1 row but carries two UInt32 values.
        let mut body = BytesMut::new();
        body.put_uvarint(0);
        body.put_uvarint(1);
        body.put_uvarint(1);
        body.put_str("x");
        body.put_str("UInt32");
        body.extend_from_slice(&[1, 0, 0, 0, 2, 0, 0, 0]);

        let plain = BlockCodec::new(CompressionMethod::None);
        assert!(plain.decode_exact(&body, CLIENT_REVISION).is_err());

        let mut framed = BytesMut::new();
        compression::compress_frame(&body, &mut framed);
        let lz4 = BlockCodec::new(CompressionMethod::Lz4);
        let err = lz4.decode(&mut WireReader::new(&framed), CLIENT_REVISION).unwrap_err();
        assert!(err.to_string().contains("disagree"));
    }

    #[test]
    fn test_compressed_block_rejected_without_compression() {
        let block = Block::new(2).with_column(u32_column("x", &[1, 2]));
        let mut out = BytesMut::new();
        BlockCodec::new(CompressionMethod::Lz4)
            .encode(&block, CLIENT_REVISION, &mut out)
            .unwrap();
        let err = BlockCodec::new(CompressionMethod::None)
            .decode(&mut WireReader::new(&out), CLIENT_REVISION)
            .unwrap_err();
        assert!(err.to_string().contains("compressed block"));
    }

    #[test]
    fn test_block_spanning_frames() {
        let block = Block::new(3).with_column(u32_column("x", &[1, 2, 3]));
        let mut body = BytesMut::new();
        write_body(&block, CLIENT_REVISION, &mut body);
        let (head, tail) = body.split_at(5);
        let mut framed = BytesMut::new();
        compression::compress_frame(head, &mut framed);
        compression::compress_frame(tail, &mut framed);

        let decoded = BlockCodec::new(CompressionMethod::Lz4)
            .decode_exact(&framed, CLIENT_REVISION)
            .unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn test_header_block_with_unknown_type() {
        let mut body = BytesMut::new();
        body.put_uvarint(0);
        body.put_uvarint(1);
        body.put_uvarint(0);
        body.put_str("tags");
        body.put_str("Array(LowCardinality(String))");
        let block = BlockCodec::default().decode_exact(&body, CLIENT_REVISION).unwrap();
        assert_eq!(block.columns()[0].type_tag, tag::OTHER);
        assert_eq!(block.columns()[0].name, "tags");
        assert_eq!(block.columns()[0].type_name(), "Array(LowCardinality(String))");
    }

    #[test]
    fn test_custom_type_sent_by_name() {
        // Nullable(UInt8): null map then values, serialized by the caller.
        let column = Column::with_type("flag", "Nullable(UInt8)", 2, vec![0u8, 1, 7, 0]);
        assert_eq!(column.type_tag, tag::OTHER);
        assert_eq!(column.rows(), Ok(2));

        let block = Block::new(2).with_column(column);
        let mut out = BytesMut::new();
        BlockCodec::default().encode(&block, CLIENT_REVISION, &mut out).unwrap();
        let mut expected = BytesMut::new();
        expected.extend_from_slice(&[1, 0, 2, 0xff, 0xff, 0xff, 0xff, 0, 1, 2]);
        expected.put_str("flag");
        expected.put_str("Nullable(UInt8)");
        expected.extend_from_slice(&[0, 1, 7, 0]);
        assert_eq!(&out[..], &expected[..]);
    }

    #[test]
    fn test_validate_uses_declared_rows() {
        let block = Block::new(3)
            .with_column(u32_column("id", &[1, 2, 3]))
            .with_column(Column::with_type("price", "Decimal(9, 2)", 2, vec![0u8; 8]));
        assert_eq!(
            block.validate(),
            Err(EncodeError::RowCountMismatch {
                column: "price".to_string(),
                expected: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn test_catalog_name_checks_declared_rows() {
        let column = Column::with_type("x", "UInt32", 2, vec![0u8; 12]);
        assert_eq!(column.type_tag, tag::UINT32);
        assert_eq!(column.type_name(), "UInt32");
        assert!(matches!(column.rows(), Err(EncodeError::InvalidPayload { .. })));
        assert_eq!(Column::with_type("x", "UInt32", 3, vec![0u8; 12]).rows(), Ok(3));
    }
}
