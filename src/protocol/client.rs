//! Client → server packets.
//!
//! Every packet starts with a varint kind. Encoding is what the driver
//! sends; decoding exists so an in-process server (tests, proxies) can read
//! the same bytes back.

use std::fmt;

use bytes::{BufMut, BytesMut};

use super::block::Block;
use super::codec::CodecContext;
use super::error::EncodeError;
use super::revision;
use super::settings::{SettingKind, SettingValue, Settings};
use super::wire::{WireError, WireReader, WireResult, WireWrite};

/// Packet kinds sent by the client.
pub mod kind {
    pub const HELLO: u64 = 0;
    pub const QUERY: u64 = 1;
    pub const DATA: u64 = 2;
    pub const CANCEL: u64 = 3;
    pub const PING: u64 = 4;
}

/// Query processing stage: run the query to completion.
pub const STAGE_COMPLETE: u64 = 2;

/// Client info query kind: a query issued by this client.
pub const QUERY_KIND_INITIAL: u8 = 1;

/// Client info interface: native TCP.
pub const INTERFACE_TCP: u8 = 1;

/// Credentials for one operation's handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthData {
    pub database: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for AuthData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthData")
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub client_name: String,
    pub version_major: u64,
    pub version_minor: u64,
    pub revision: u64,
    pub auth: AuthData,
}

/// Who is asking, sent inside every query packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub query_kind: u8,
    pub initial_user: String,
    pub initial_query_id: String,
    pub initial_address: String,
    pub interface: u8,
    pub os_user: String,
    pub client_hostname: String,
    pub client_name: String,
    pub version_major: u64,
    pub version_minor: u64,
    pub revision: u64,
    pub quota_key: String,
}

impl ClientInfo {
    /// Client info for a query issued directly by this process.
    pub fn initial(client_name: &str, version_major: u64, version_minor: u64) -> Self {
        Self {
            query_kind: QUERY_KIND_INITIAL,
            initial_user: String::new(),
            initial_query_id: String::new(),
            initial_address: "0.0.0.0:0".to_string(),
            interface: INTERFACE_TCP,
            os_user: std::env::var("USER").unwrap_or_default(),
            client_hostname: std::env::var("HOSTNAME").unwrap_or_default(),
            client_name: client_name.to_string(),
            version_major,
            version_minor,
            revision: revision::CLIENT_REVISION,
            quota_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Empty lets the server generate one.
    pub query_id: String,
    pub client_info: ClientInfo,
    /// Settings and limits, already merged in wire order.
    pub settings: Settings,
    pub stage: u64,
    pub compression: bool,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientPacket {
    Hello(ClientHello),
    Query(Box<Query>),
    Data { table: String, block: Block },
    Cancel,
    Ping,
}

impl ClientPacket {
    pub fn kind(&self) -> u64 {
        match self {
            ClientPacket::Hello(_) => kind::HELLO,
            ClientPacket::Query(_) => kind::QUERY,
            ClientPacket::Data { .. } => kind::DATA,
            ClientPacket::Cancel => kind::CANCEL,
            ClientPacket::Ping => kind::PING,
        }
    }

    pub fn encode(&self, ctx: &CodecContext, out: &mut BytesMut) -> Result<(), EncodeError> {
        out.put_uvarint(self.kind());
        match self {
            ClientPacket::Hello(hello) => {
                out.put_str(&hello.client_name);
                out.put_uvarint(hello.version_major);
                out.put_uvarint(hello.version_minor);
                out.put_uvarint(hello.revision);
                out.put_str(&hello.auth.database);
                out.put_str(&hello.auth.username);
                out.put_str(&hello.auth.password);
            }
            ClientPacket::Query(query) => encode_query(query, ctx.revision, out),
            ClientPacket::Data { table, block } => {
                out.put_str(table);
                ctx.block_codec().encode(block, ctx.revision, out)?;
            }
            ClientPacket::Cancel | ClientPacket::Ping => {}
        }
        Ok(())
    }

    /// Decode one packet. `setting_kind` types the binary setting values.
    pub fn decode(
        r: &mut WireReader<'_>,
        ctx: &CodecContext,
        setting_kind: &dyn Fn(&str) -> Option<SettingKind>,
    ) -> WireResult<Self> {
        match r.uvarint()? {
            kind::HELLO => Ok(ClientPacket::Hello(ClientHello {
                client_name: r.string()?,
                version_major: r.uvarint()?,
                version_minor: r.uvarint()?,
                revision: r.uvarint()?,
                auth: AuthData {
                    database: r.string()?,
                    username: r.string()?,
                    password: r.string()?,
                },
            })),
            kind::QUERY => Ok(ClientPacket::Query(Box::new(decode_query(
                r,
                ctx.revision,
                setting_kind,
            )?))),
            kind::DATA => {
                let table = r.string()?;
                let block = ctx.block_codec().decode(r, ctx.revision)?;
                Ok(ClientPacket::Data { table, block })
            }
            kind::CANCEL => Ok(ClientPacket::Cancel),
            kind::PING => Ok(ClientPacket::Ping),
            other => Err(WireError::Malformed(format!("unknown client packet kind {}", other))),
        }
    }
}

fn encode_query(query: &Query, rev: u64, out: &mut BytesMut) {
    out.put_str(&query.query_id);

    if rev >= revision::CLIENT_INFO {
        let info = &query.client_info;
        out.put_u8(info.query_kind);
        out.put_str(&info.initial_user);
        out.put_str(&info.initial_query_id);
        out.put_str(&info.initial_address);
        out.put_u8(info.interface);
        out.put_str(&info.os_user);
        out.put_str(&info.client_hostname);
        out.put_str(&info.client_name);
        out.put_uvarint(info.version_major);
        out.put_uvarint(info.version_minor);
        out.put_uvarint(info.revision);
        if rev >= revision::QUOTA_KEY_IN_CLIENT_INFO {
            out.put_str(&info.quota_key);
        }
    }

    for (name, value) in query.settings.iter() {
        out.put_str(name);
        value.encode(out);
    }
    // Empty name ends the settings list.
    out.put_str("");

    out.put_uvarint(query.stage);
    out.put_uvarint(query.compression as u64);
    out.put_str(&query.text);
}

fn decode_query(
    r: &mut WireReader<'_>,
    rev: u64,
    setting_kind: &dyn Fn(&str) -> Option<SettingKind>,
) -> WireResult<Query> {
    let query_id = r.string()?;

    let mut client_info = ClientInfo {
        query_kind: 0,
        initial_user: String::new(),
        initial_query_id: String::new(),
        initial_address: String::new(),
        interface: INTERFACE_TCP,
        os_user: String::new(),
        client_hostname: String::new(),
        client_name: String::new(),
        version_major: 0,
        version_minor: 0,
        revision: 0,
        quota_key: String::new(),
    };
    if rev >= revision::CLIENT_INFO {
        client_info.query_kind = r.u8()?;
        if client_info.query_kind != 0 {
            client_info.initial_user = r.string()?;
            client_info.initial_query_id = r.string()?;
            client_info.initial_address = r.string()?;
            client_info.interface = r.u8()?;
            if client_info.interface != INTERFACE_TCP {
                return Err(WireError::Malformed(format!(
                    "unsupported client interface {}",
                    client_info.interface
                )));
            }
            client_info.os_user = r.string()?;
            client_info.client_hostname = r.string()?;
            client_info.client_name = r.string()?;
            client_info.version_major = r.uvarint()?;
            client_info.version_minor = r.uvarint()?;
            client_info.revision = r.uvarint()?;
            if rev >= revision::QUOTA_KEY_IN_CLIENT_INFO {
                client_info.quota_key = r.string()?;
            }
        }
    }

    let mut settings = Settings::new();
    loop {
        let name = r.string()?;
        if name.is_empty() {
            break;
        }
        let kind = setting_kind(&name)
            .ok_or_else(|| WireError::Malformed(format!("unknown setting '{}'", name)))?;
        let value = SettingValue::decode(kind, r)?;
        settings.set(name, value);
    }

    let stage = r.uvarint()?;
    let compression = match r.uvarint()? {
        0 => false,
        1 => true,
        other => return Err(WireError::Malformed(format!("invalid compression flag {}", other))),
    };
    let text = r.string()?;

    Ok(Query {
        query_id,
        client_info,
        settings,
        stage,
        compression,
        text,
    })
}
