//! Server → client packets.

use std::fmt;

use bytes::{BufMut, BytesMut};

use super::block::Block;
use super::codec::CodecContext;
use super::error::EncodeError;
use super::revision;
use super::wire::{WireError, WireReader, WireResult, WireWrite};

/// Packet kinds sent by the server.
pub mod kind {
    pub const HELLO: u64 = 0;
    pub const DATA: u64 = 1;
    pub const EXCEPTION: u64 = 2;
    pub const PROGRESS: u64 = 3;
    pub const PONG: u64 = 4;
    pub const END_OF_STREAM: u64 = 5;
    pub const PROFILE_INFO: u64 = 6;
    pub const TOTALS: u64 = 7;
    pub const EXTREMES: u64 = 8;
}

/// Nesting bound for exception chains.
const MAX_EXCEPTION_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub name: String,
    pub version_major: u64,
    pub version_minor: u64,
    pub revision: u64,
    pub timezone: Option<String>,
    pub display_name: Option<String>,
    pub version_patch: Option<u64>,
}

/// A table-qualified block (data, totals, extremes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub table: String,
    pub block: Block,
}

/// Structured error reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerException {
    pub code: i32,
    pub name: String,
    pub message: String,
    pub stack_trace: String,
    pub nested: Option<Box<ServerException>>,
}

impl ServerException {
    /// Walk the cause chain, starting with `self`.
    pub fn chain(&self) -> impl Iterator<Item = &ServerException> {
        std::iter::successors(Some(self), |e| e.nested.as_deref())
    }
}

impl fmt::Display for ServerException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Code: {}. {}: {}", self.code, self.name, self.message)
    }
}

impl std::error::Error for ServerException {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.nested.as_deref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Rows/bytes processed so far. Values are deltas since the previous packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub rows: u64,
    pub bytes: u64,
    pub total_rows: u64,
    pub written_rows: u64,
    pub written_bytes: u64,
}

impl Progress {
    /// Accumulate a delta.
    pub fn add(&mut self, delta: &Progress) {
        self.rows = self.rows.saturating_add(delta.rows);
        self.bytes = self.bytes.saturating_add(delta.bytes);
        self.total_rows = self.total_rows.max(delta.total_rows);
        self.written_rows = self.written_rows.saturating_add(delta.written_rows);
        self.written_bytes = self.written_bytes.saturating_add(delta.written_bytes);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfileInfo {
    pub rows: u64,
    pub blocks: u64,
    pub bytes: u64,
    pub applied_limit: bool,
    pub rows_before_limit: u64,
    pub calculated_rows_before_limit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerPacket {
    Hello(ServerHello),
    Data(DataPacket),
    Exception(ServerException),
    Progress(Progress),
    Pong,
    EndOfStream,
    ProfileInfo(ProfileInfo),
    Totals(DataPacket),
    Extremes(DataPacket),
}

impl ServerPacket {
    pub fn kind(&self) -> u64 {
        match self {
            ServerPacket::Hello(_) => kind::HELLO,
            ServerPacket::Data(_) => kind::DATA,
            ServerPacket::Exception(_) => kind::EXCEPTION,
            ServerPacket::Progress(_) => kind::PROGRESS,
            ServerPacket::Pong => kind::PONG,
            ServerPacket::EndOfStream => kind::END_OF_STREAM,
            ServerPacket::ProfileInfo(_) => kind::PROFILE_INFO,
            ServerPacket::Totals(_) => kind::TOTALS,
            ServerPacket::Extremes(_) => kind::EXTREMES,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ServerPacket::Hello(_) => "Hello",
            ServerPacket::Data(_) => "Data",
            ServerPacket::Exception(_) => "Exception",
            ServerPacket::Progress(_) => "Progress",
            ServerPacket::Pong => "Pong",
            ServerPacket::EndOfStream => "EndOfStream",
            ServerPacket::ProfileInfo(_) => "ProfileInfo",
            ServerPacket::Totals(_) => "Totals",
            ServerPacket::Extremes(_) => "Extremes",
        }
    }

    pub fn decode(r: &mut WireReader<'_>, ctx: &CodecContext) -> WireResult<Self> {
        let rev = ctx.revision;
        match r.uvarint()? {
            kind::HELLO => {
                let name = r.string()?;
                let version_major = r.uvarint()?;
                let version_minor = r.uvarint()?;
                let server_revision = r.uvarint()?;
                let timezone = if rev >= revision::SERVER_TIMEZONE {
                    Some(r.string()?)
                } else {
                    None
                };
                let display_name = if rev >= revision::SERVER_DISPLAY_NAME {
                    Some(r.string()?)
                } else {
                    None
                };
                let version_patch = if rev >= revision::VERSION_PATCH {
                    Some(r.uvarint()?)
                } else {
                    None
                };
                Ok(ServerPacket::Hello(ServerHello {
                    name,
                    version_major,
                    version_minor,
                    revision: server_revision,
                    timezone,
                    display_name,
                    version_patch,
                }))
            }
            kind::DATA => Ok(ServerPacket::Data(decode_data(r, ctx)?)),
            kind::TOTALS => Ok(ServerPacket::Totals(decode_data(r, ctx)?)),
            kind::EXTREMES => Ok(ServerPacket::Extremes(decode_data(r, ctx)?)),
            kind::EXCEPTION => Ok(ServerPacket::Exception(decode_exception(r, 0)?)),
            kind::PROGRESS => {
                let mut progress = Progress {
                    rows: r.uvarint()?,
                    bytes: r.uvarint()?,
                    ..Progress::default()
                };
                if rev >= revision::TOTAL_ROWS_IN_PROGRESS {
                    progress.total_rows = r.uvarint()?;
                }
                if rev >= revision::CLIENT_WRITE_INFO {
                    progress.written_rows = r.uvarint()?;
                    progress.written_bytes = r.uvarint()?;
                }
                Ok(ServerPacket::Progress(progress))
            }
            kind::PONG => Ok(ServerPacket::Pong),
            kind::END_OF_STREAM => Ok(ServerPacket::EndOfStream),
            kind::PROFILE_INFO => Ok(ServerPacket::ProfileInfo(ProfileInfo {
                rows: r.uvarint()?,
                blocks: r.uvarint()?,
                bytes: r.uvarint()?,
                applied_limit: r.bool()?,
                rows_before_limit: r.uvarint()?,
                calculated_rows_before_limit: r.bool()?,
            })),
            other => Err(WireError::Malformed(format!("unknown server packet kind {}", other))),
        }
    }

    pub fn encode(&self, ctx: &CodecContext, out: &mut BytesMut) -> Result<(), EncodeError> {
        let rev = ctx.revision;
        out.put_uvarint(self.kind());
        match self {
            ServerPacket::Hello(hello) => {
                out.put_str(&hello.name);
                out.put_uvarint(hello.version_major);
                out.put_uvarint(hello.version_minor);
                out.put_uvarint(hello.revision);
                if rev >= revision::SERVER_TIMEZONE {
                    out.put_str(hello.timezone.as_deref().unwrap_or("UTC"));
                }
                if rev >= revision::SERVER_DISPLAY_NAME {
                    out.put_str(hello.display_name.as_deref().unwrap_or(&hello.name));
                }
                if rev >= revision::VERSION_PATCH {
                    out.put_uvarint(hello.version_patch.unwrap_or(0));
                }
            }
            ServerPacket::Data(data) | ServerPacket::Totals(data) | ServerPacket::Extremes(data) => {
                out.put_str(&data.table);
                ctx.block_codec().encode(&data.block, rev, out)?;
            }
            ServerPacket::Exception(exception) => encode_exception(exception, out),
            ServerPacket::Progress(progress) => {
                out.put_uvarint(progress.rows);
                out.put_uvarint(progress.bytes);
                if rev >= revision::TOTAL_ROWS_IN_PROGRESS {
                    out.put_uvarint(progress.total_rows);
                }
                if rev >= revision::CLIENT_WRITE_INFO {
                    out.put_uvarint(progress.written_rows);
                    out.put_uvarint(progress.written_bytes);
                }
            }
            ServerPacket::ProfileInfo(info) => {
                out.put_uvarint(info.rows);
                out.put_uvarint(info.blocks);
                out.put_uvarint(info.bytes);
                out.put_bool(info.applied_limit);
                out.put_uvarint(info.rows_before_limit);
                out.put_bool(info.calculated_rows_before_limit);
            }
            ServerPacket::Pong | ServerPacket::EndOfStream => {}
        }
        Ok(())
    }
}

fn decode_data(r: &mut WireReader<'_>, ctx: &CodecContext) -> WireResult<DataPacket> {
    let table = r.string()?;
    let block = ctx.block_codec().decode(r, ctx.revision)?;
    Ok(DataPacket { table, block })
}

fn decode_exception(r: &mut WireReader<'_>, depth: usize) -> WireResult<ServerException> {
    if depth > MAX_EXCEPTION_DEPTH {
        return Err(WireError::Malformed("exception chain is too deep".to_string()));
    }
    let code = r.i32_le()?;
    let name = r.string()?;
    let message = r.string()?;
    let stack_trace = r.string()?;
    let nested = if r.bool()? {
        Some(Box::new(decode_exception(r, depth + 1)?))
    } else {
        None
    };
    Ok(ServerException {
        code,
        name,
        message,
        stack_trace,
        nested,
    })
}

fn encode_exception(exception: &ServerException, out: &mut BytesMut) {
    for (i, e) in exception.chain().enumerate() {
        if i > 0 {
            // has_nested flag of the previous level
            out.put_bool(true);
        }
        out.put_i32_le(e.code);
        out.put_str(&e.name);
        out.put_str(&e.message);
        out.put_str(&e.stack_trace);
    }
    out.put_bool(false);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exception() -> ServerException {
        ServerException {
            code: 60,
            name: "DB::Exception".to_string(),
            message: "Table default.t doesn't exist".to_string(),
            stack_trace: "0. DB::Exception::Exception".to_string(),
            nested: Some(Box::new(ServerException {
                code: 1000,
                name: "Poco::Exception".to_string(),
                message: "inner".to_string(),
                stack_trace: String::new(),
                nested: None,
            })),
        }
    }

    fn round_trip(packet: &ServerPacket) -> ServerPacket {
        let ctx = CodecContext::handshake();
        let mut out = BytesMut::new();
        packet.encode(&ctx, &mut out).unwrap();
        let mut r = WireReader::new(&out);
        let decoded = ServerPacket::decode(&mut r, &ctx).unwrap();
        assert!(r.is_empty(), "{} left bytes behind", packet.name());
        decoded
    }

    #[test]
    fn test_exception_chain() {
        let packet = ServerPacket::Exception(exception());
        let decoded = round_trip(&packet);
        assert_eq!(decoded, packet);

        let ServerPacket::Exception(e) = decoded else {
            panic!("expected exception");
        };
        assert_eq!(e.to_string(), "Code: 60. DB::Exception: Table default.t doesn't exist");
        let codes: Vec<i32> = e.chain().map(|e| e.code).collect();
        assert_eq!(codes, vec![60, 1000]);
        assert!(std::error::Error::source(&e).is_some());
    }

    #[test]
    fn test_hello_fields_gated_by_revision() {
        let hello = ServerPacket::Hello(ServerHello {
            name: "ClickHouse".to_string(),
            version_major: 23,
            version_minor: 8,
            revision: 54465,
            timezone: Some("UTC".to_string()),
            display_name: None,
            version_patch: None,
        });
        // Client revision 54327 gets the timezone only.
        assert_eq!(round_trip(&hello), hello);
    }

    #[test]
    fn test_progress_and_profile_info() {
        let progress = ServerPacket::Progress(Progress {
            rows: 10,
            bytes: 400,
            total_rows: 100,
            ..Progress::default()
        });
        assert_eq!(round_trip(&progress), progress);

        let info = ServerPacket::ProfileInfo(ProfileInfo {
            rows: 1,
            blocks: 1,
            bytes: 8,
            applied_limit: true,
            rows_before_limit: 7,
            calculated_rows_before_limit: true,
        });
        assert_eq!(round_trip(&info), info);
    }

    #[test]
    fn test_unknown_kind_is_malformed() {
        let err = ServerPacket::decode(&mut WireReader::new(&[42]), &CodecContext::handshake()).unwrap_err();
        assert!(matches!(err, WireError::Malformed(_)));
    }

    #[test]
    fn test_progress_accumulates() {
        let mut total = Progress::default();
        total.add(&Progress { rows: 5, bytes: 50, total_rows: 20, ..Progress::default() });
        total.add(&Progress { rows: 3, bytes: 30, total_rows: 0, ..Progress::default() });
        assert_eq!(total.rows, 8);
        assert_eq!(total.bytes, 80);
        assert_eq!(total.total_rows, 20);
    }

    #[test]
    fn test_progress_saturates() {
        let mut total = Progress { rows: u64::MAX - 1, written_bytes: 10, ..Progress::default() };
        total.add(&Progress { rows: 5, written_bytes: u64::MAX, ..Progress::default() });
        assert_eq!(total.rows, u64::MAX);
        assert_eq!(total.written_bytes, u64::MAX);
    }
}
