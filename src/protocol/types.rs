//! Column Type Tags
//!
//! One-byte discriminators for the column types the driver can size on its
//! own. Payload encoding stays with the caller's column encoder; the tag is
//! only used to name the type on the wire and to check that a payload holds
//! exactly `rows` values.
//!
//! Reference: https://clickhouse.com/docs/en/sql-reference/data-types

use super::wire::{WireError, WireReader, WireResult};

/// Column type tags.
pub mod tag {
    /// Any type outside the built-in catalog.
    pub const OTHER: u8 = 0;

    // Unsigned integers
    pub const UINT8: u8 = 1;
    pub const UINT16: u8 = 2;
    pub const UINT32: u8 = 3;
    pub const UINT64: u8 = 4;

    // Signed integers
    pub const INT8: u8 = 5;
    pub const INT16: u8 = 6;
    pub const INT32: u8 = 7;
    pub const INT64: u8 = 8;

    // Floats
    pub const FLOAT32: u8 = 9;
    pub const FLOAT64: u8 = 10;

    // Date/Time
    pub const DATE: u8 = 11;     // days since epoch, u16
    pub const DATETIME: u8 = 12; // seconds since epoch, u32

    pub const UUID: u8 = 13;

    // Variable width: varint length + bytes per value
    pub const STRING: u8 = 14;
}

/// Map a tag to its wire type name.
pub fn tag_to_name(tag: u8) -> &'static str {
    match tag {
        tag::UINT8 => "UInt8",
        tag::UINT16 => "UInt16",
        tag::UINT32 => "UInt32",
        tag::UINT64 => "UInt64",
        tag::INT8 => "Int8",
        tag::INT16 => "Int16",
        tag::INT32 => "Int32",
        tag::INT64 => "Int64",
        tag::FLOAT32 => "Float32",
        tag::FLOAT64 => "Float64",
        tag::DATE => "Date",
        tag::DATETIME => "DateTime",
        tag::UUID => "UUID",
        tag::STRING => "String",
        _ => "Nothing",
    }
}

/// Map a wire type name back to its tag; unknown names become `OTHER`.
pub fn name_to_tag(name: &str) -> u8 {
    match name {
        "UInt8" => tag::UINT8,
        "UInt16" => tag::UINT16,
        "UInt32" => tag::UINT32,
        "UInt64" => tag::UINT64,
        "Int8" => tag::INT8,
        "Int16" => tag::INT16,
        "Int32" => tag::INT32,
        "Int64" => tag::INT64,
        "Float32" => tag::FLOAT32,
        "Float64" => tag::FLOAT64,
        "Date" => tag::DATE,
        "DateTime" => tag::DATETIME,
        "UUID" => tag::UUID,
        "String" => tag::STRING,
        _ => tag::OTHER,
    }
}

/// Byte width of one value for fixed-width tags.
pub fn fixed_width(tag: u8) -> Option<usize> {
    match tag {
        tag::UINT8 | tag::INT8 => Some(1),
        tag::UINT16 | tag::INT16 | tag::DATE => Some(2),
        tag::UINT32 | tag::INT32 | tag::FLOAT32 | tag::DATETIME => Some(4),
        tag::UINT64 | tag::INT64 | tag::FLOAT64 => Some(8),
        tag::UUID => Some(16),
        _ => None,
    }
}

/// Measure how many bytes `rows` values of type `tag` occupy at the start of
/// `buf`.
///
/// Returns `Incomplete` when `buf` is too short, `Malformed` when the type
/// cannot be sized (an `OTHER` column with rows).
pub fn payload_len(tag: u8, rows: u64, buf: &[u8]) -> WireResult<usize> {
    if rows == 0 {
        return Ok(0);
    }
    if let Some(width) = fixed_width(tag) {
        let len = (rows as usize)
            .checked_mul(width)
            .ok_or_else(|| WireError::Malformed(format!("row count {} overflows", rows)))?;
        if buf.len() < len {
            return Err(WireError::Incomplete);
        }
        return Ok(len);
    }
    match tag {
        tag::STRING => {
            let mut r = WireReader::new(buf);
            for _ in 0..rows {
                r.blob()?;
            }
            Ok(r.position())
        }
        _ => Err(WireError::Malformed(format!(
            "cannot size {} rows of an unsupported column type",
            rows
        ))),
    }
}

/// Count the values held by a complete payload.
///
/// Fails when the payload is not a whole number of values.
pub fn count_rows(tag: u8, payload: &[u8]) -> Result<u64, String> {
    if let Some(width) = fixed_width(tag) {
        if payload.len() % width != 0 {
            return Err(format!(
                "{} payload of {} bytes is not a multiple of {}",
                tag_to_name(tag),
                payload.len(),
                width
            ));
        }
        return Ok((payload.len() / width) as u64);
    }
    match tag {
        tag::STRING => {
            let mut r = WireReader::new(payload);
            let mut rows = 0u64;
            while !r.is_empty() {
                r.blob().map_err(|e| format!("String payload is truncated: {}", e))?;
                rows += 1;
            }
            Ok(rows)
        }
        _ if payload.is_empty() => Ok(0),
        _ => Err("cannot count rows of an unsupported column type".to_string()),
    }
}
