//! Packet codec.
//!
//! Symmetric encode/decode over a growing receive buffer. Decoding returns
//! `Ok(None)` until a whole packet has arrived and only then consumes bytes,
//! so the caller can keep reading into the same buffer.

use bytes::{Buf, BytesMut};

use super::block::{Block, BlockCodec};
use super::client::{self, ClientPacket};
use super::compression::CompressionMethod;
use super::error::EncodeError;
use super::revision;
use super::server::ServerPacket;
use super::settings::SettingKind;
use super::wire::{WireError, WireReader, WireResult, WireWrite};

/// Negotiated state that parameterizes encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecContext {
    /// `min(client revision, server revision)` once the handshake is done.
    pub revision: u64,
    pub compression: CompressionMethod,
}

impl CodecContext {
    /// Context for the hello exchange: our revision, no compression.
    pub fn handshake() -> Self {
        Self {
            revision: revision::CLIENT_REVISION,
            compression: CompressionMethod::None,
        }
    }

    pub fn negotiated(server_revision: u64, compression: CompressionMethod) -> Self {
        Self {
            revision: server_revision.min(revision::CLIENT_REVISION),
            compression,
        }
    }

    pub fn block_codec(&self) -> BlockCodec {
        BlockCodec::new(self.compression)
    }
}

/// Frames packets to and from bytes.
pub struct PacketCodec;

impl PacketCodec {
    pub fn encode_client(packet: &ClientPacket, ctx: &CodecContext, out: &mut BytesMut) -> Result<(), EncodeError> {
        packet.encode(ctx, out)
    }

    /// Encode a data packet straight from a block (no intermediate packet).
    pub fn encode_data(table: &str, block: &Block, ctx: &CodecContext, out: &mut BytesMut) -> Result<(), EncodeError> {
        out.put_uvarint(client::kind::DATA);
        out.put_str(table);
        ctx.block_codec().encode(block, ctx.revision, out)
    }

    pub fn encode_server(packet: &ServerPacket, ctx: &CodecContext, out: &mut BytesMut) -> Result<(), EncodeError> {
        packet.encode(ctx, out)
    }

    /// Take one server packet off the front of `buf`, if complete.
    pub fn decode_server(buf: &mut BytesMut, ctx: &CodecContext) -> WireResult<Option<ServerPacket>> {
        decode_with(buf, |r| ServerPacket::decode(r, ctx))
    }

    /// Take one client packet off the front of `buf`, if complete.
    pub fn decode_client(
        buf: &mut BytesMut,
        ctx: &CodecContext,
        setting_kind: &dyn Fn(&str) -> Option<SettingKind>,
    ) -> WireResult<Option<ClientPacket>> {
        decode_with(buf, |r| ClientPacket::decode(r, ctx, setting_kind))
    }
}

fn decode_with<T>(buf: &mut BytesMut, parse: impl FnOnce(&mut WireReader<'_>) -> WireResult<T>) -> WireResult<Option<T>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut r = WireReader::new(&buf[..]);
    match parse(&mut r) {
        Ok(packet) => {
            let consumed = r.position();
            buf.advance(consumed);
            Ok(Some(packet))
        }
        Err(WireError::Incomplete) => Ok(None),
        Err(e) => Err(e),
    }
}
