//! Per-connection handler chain.
//!
//! An ordered list of named stages. Outbound messages walk from the tail
//! toward the head (closest to the wire) and must come out as bytes;
//! inbound bytes are offered to stages from the head until one yields a
//! packet.

use bytes::BytesMut;

use super::{ChError, ChResult};
use crate::protocol::{Block, ClientPacket, CodecContext, PacketCodec, ServerPacket};

pub const PACKET_DECODER: &str = "decoder";
pub const PACKET_ENCODER: &str = "encoder";
pub const BLOCK_ENCODER: &str = "blockEncoder";

/// A message on its way to the server.
#[derive(Debug)]
pub enum Outbound {
    Block(Block),
    Packet(ClientPacket),
    Bytes(BytesMut),
}

impl Outbound {
    fn describe(&self) -> &'static str {
        match self {
            Outbound::Block(_) => "block",
            Outbound::Packet(_) => "packet",
            Outbound::Bytes(_) => "bytes",
        }
    }
}

/// One handler in the chain. Both hooks default to pass-through.
pub trait Stage: Send + Sync {
    fn encode(&self, msg: Outbound, _ctx: &CodecContext) -> ChResult<Outbound> {
        Ok(msg)
    }

    fn decode(&self, _buf: &mut BytesMut, _ctx: &CodecContext) -> ChResult<Option<ServerPacket>> {
        Ok(None)
    }
}

/// Frames server packets out of the receive buffer.
#[derive(Debug, Default)]
pub struct PacketDecoder;

impl Stage for PacketDecoder {
    fn decode(&self, buf: &mut BytesMut, ctx: &CodecContext) -> ChResult<Option<ServerPacket>> {
        Ok(PacketCodec::decode_server(buf, ctx)?)
    }
}

/// Serializes client packets.
#[derive(Debug, Default)]
pub struct PacketEncoder;

impl Stage for PacketEncoder {
    fn encode(&self, msg: Outbound, ctx: &CodecContext) -> ChResult<Outbound> {
        match msg {
            Outbound::Packet(packet) => {
                let mut out = BytesMut::new();
                PacketCodec::encode_client(&packet, ctx, &mut out)?;
                Ok(Outbound::Bytes(out))
            }
            other => Ok(other),
        }
    }
}

/// Serializes (and compresses) blocks into data packets.
#[derive(Debug, Default)]
pub struct BlockEncoder;

impl Stage for BlockEncoder {
    fn encode(&self, msg: Outbound, ctx: &CodecContext) -> ChResult<Outbound> {
        match msg {
            Outbound::Block(block) => {
                let mut out = BytesMut::with_capacity(block.payload_bytes() + 64);
                PacketCodec::encode_data("", &block, ctx, &mut out)?;
                Ok(Outbound::Bytes(out))
            }
            other => Ok(other),
        }
    }
}

/// Named, ordered stages. Index 0 is the head.
pub struct Pipeline {
    stages: Vec<(String, Box<dyn Stage>)>,
}

impl Default for Pipeline {
    /// `decoder`, `encoder`, `blockEncoder`, head first.
    fn default() -> Self {
        let mut pipeline = Pipeline::empty();
        pipeline.add_last(PACKET_DECODER, PacketDecoder);
        pipeline.add_last(PACKET_ENCODER, PacketEncoder);
        pipeline.add_last(BLOCK_ENCODER, BlockEncoder);
        pipeline
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl Pipeline {
    pub fn empty() -> Self {
        Self { stages: Vec::new() }
    }

    /// Insert at the head. A stage with the same name is replaced.
    pub fn add_first(&mut self, name: impl Into<String>, stage: impl Stage + 'static) -> &mut Self {
        let name = name.into();
        self.remove(&name);
        self.stages.insert(0, (name, Box::new(stage)));
        self
    }

    /// Insert at the tail. A stage with the same name is replaced.
    pub fn add_last(&mut self, name: impl Into<String>, stage: impl Stage + 'static) -> &mut Self {
        let name = name.into();
        self.remove(&name);
        self.stages.push((name, Box::new(stage)));
        self
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.stages.len();
        self.stages.retain(|(n, _)| n != name);
        self.stages.len() != before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stages.iter().any(|(n, _)| n == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Run a message through the chain; the head must produce bytes.
    pub fn encode(&self, msg: Outbound, ctx: &CodecContext) -> ChResult<BytesMut> {
        let mut msg = msg;
        for (_, stage) in self.stages.iter().rev() {
            msg = stage.encode(msg, ctx)?;
        }
        match msg {
            Outbound::Bytes(bytes) => Ok(bytes),
            other => Err(ChError::Protocol(format!(
                "no stage in {:?} encodes a {}",
                self.names(),
                other.describe()
            ))),
        }
    }

    /// Next complete server packet from `buf`, if any.
    pub fn decode(&self, buf: &mut BytesMut, ctx: &CodecContext) -> ChResult<Option<ServerPacket>> {
        for (_, stage) in &self.stages {
            if let Some(packet) = stage.decode(buf, ctx)? {
                return Ok(Some(packet));
            }
        }
        Ok(None)
    }
}
