//! Session settings and resource limits.
//!
//! Both are ordered, key-unique maps of typed values. Order is preserved so
//! the query packet is byte-for-byte deterministic. Values use the binary
//! setting encoding of revisions below 54429: the server decides how to read
//! each value from the setting's declared type, so the variant chosen here
//! must match that type.

use bytes::BytesMut;
use serde::Deserialize;

use super::wire::{WireReader, WireResult, WireWrite};

/// A typed setting value.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    UInt64(u64),
    Int64(i64),
    Float(f64),
    String(String),
}

/// Declared type of a setting, needed to read its binary value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    Bool,
    UInt64,
    Int64,
    Float,
    String,
}

impl SettingValue {
    pub fn kind(&self) -> SettingKind {
        match self {
            SettingValue::Bool(_) => SettingKind::Bool,
            SettingValue::UInt64(_) => SettingKind::UInt64,
            SettingValue::Int64(_) => SettingKind::Int64,
            SettingValue::Float(_) => SettingKind::Float,
            SettingValue::String(_) => SettingKind::String,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            SettingValue::Bool(v) => buf.put_uvarint(*v as u64),
            SettingValue::UInt64(v) => buf.put_uvarint(*v),
            SettingValue::Int64(v) => buf.put_varint(*v),
            // Floats travel as their decimal text.
            SettingValue::Float(v) => buf.put_str(&v.to_string()),
            SettingValue::String(v) => buf.put_str(v),
        }
    }

    pub fn decode(kind: SettingKind, r: &mut WireReader<'_>) -> WireResult<Self> {
        Ok(match kind {
            SettingKind::Bool => SettingValue::Bool(r.uvarint()? != 0),
            SettingKind::UInt64 => SettingValue::UInt64(r.uvarint()?),
            SettingKind::Int64 => SettingValue::Int64(r.varint()?),
            SettingKind::Float => {
                let text = r.string()?;
                let v = text.parse::<f64>().map_err(|_| {
                    super::wire::WireError::Malformed(format!("invalid float setting {:?}", text))
                })?;
                SettingValue::Float(v)
            }
            SettingKind::String => SettingValue::String(r.string()?),
        })
    }
}

impl From<bool> for SettingValue {
    fn from(v: bool) -> Self {
        SettingValue::Bool(v)
    }
}

impl From<u64> for SettingValue {
    fn from(v: u64) -> Self {
        SettingValue::UInt64(v)
    }
}

impl From<u32> for SettingValue {
    fn from(v: u32) -> Self {
        SettingValue::UInt64(v as u64)
    }
}

impl From<i64> for SettingValue {
    fn from(v: i64) -> Self {
        SettingValue::Int64(v)
    }
}

impl From<f64> for SettingValue {
    fn from(v: f64) -> Self {
        SettingValue::Float(v)
    }
}

impl From<&str> for SettingValue {
    fn from(v: &str) -> Self {
        SettingValue::String(v.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(v: String) -> Self {
        SettingValue::String(v)
    }
}

/// Ordered, key-unique setting map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    entries: Vec<(String, SettingValue)>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. A replaced entry keeps its original position.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<SettingValue>) -> &mut Self {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&SettingValue> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<SettingValue> {
        let idx = self.entries.iter().position(|(k, _)| k == name)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SettingValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K: Into<String>, V: Into<SettingValue>> FromIterator<(K, V)> for Settings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut settings = Settings::new();
        for (k, v) in iter {
            settings.set(k, v);
        }
        settings
    }
}

/// Resource limits (`max_memory_usage`, `max_execution_time`, ...).
///
/// On the wire limits are ordinary settings sent after the session settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Limits(Settings);

impl Limits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<SettingValue>) -> &mut Self {
        self.0.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&SettingValue> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SettingValue)> {
        self.0.iter()
    }
}

/// Kinds of the settings this driver itself sends or commonly sees.
pub fn known_setting_kind(name: &str) -> Option<SettingKind> {
    match name {
        "network_compression_method" | "readonly_overflow_mode" | "read_overflow_mode"
        | "result_overflow_mode" | "timeout_overflow_mode" | "format_csv_delimiter" => {
            Some(SettingKind::String)
        }
        "max_block_size" | "max_insert_block_size" | "min_insert_block_size_rows"
        | "min_insert_block_size_bytes" | "max_threads" | "max_memory_usage"
        | "max_rows_to_read" | "max_bytes_to_read" | "max_result_rows" | "max_result_bytes"
        | "max_execution_time" | "max_query_size" | "readonly" | "insert_quorum"
        | "network_zstd_compression_level" => Some(SettingKind::UInt64),
        "insert_deduplicate" | "input_format_skip_unknown_fields" | "async_insert"
        | "wait_for_async_insert" | "extremes" => Some(SettingKind::Bool),
        "totals_auto_threshold" | "max_streams_to_max_threads_ratio" => Some(SettingKind::Float),
        _ => None,
    }
}
