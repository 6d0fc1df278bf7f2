//! In-process ClickHouse server over `tokio::io::duplex`, for driving the
//! client end to end without a real server.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use qail_ch::driver::{
    BoxError, ChClient, ChError, ChResult, ColumnEncoder, Connector, SessionConfig, TransportKind, TransportSelector,
};
use qail_ch::protocol::{
    Block, ClientHello, ClientPacket, CodecContext, Column, CompressionMethod, DataPacket, PacketCodec, Query,
    ServerException, ServerHello, ServerPacket, WireWrite, known_setting_kind, tag,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub const SERVER_REVISION: u64 = 54465;

/// Server end of one connection.
pub struct MockServer {
    stream: DuplexStream,
    buf: BytesMut,
    ctx: CodecContext,
}

impl MockServer {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            buf: BytesMut::new(),
            ctx: CodecContext::handshake(),
        }
    }

    /// Next client packet, or `None` once the client hung up.
    pub async fn recv(&mut self) -> Option<ClientPacket> {
        loop {
            if let Some(packet) = PacketCodec::decode_client(&mut self.buf, &self.ctx, &known_setting_kind).unwrap() {
                return Some(packet);
            }
            match self.stream.read_buf(&mut self.buf).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    pub async fn expect(&mut self) -> ClientPacket {
        self.recv().await.expect("client hung up")
    }

    pub async fn send(&mut self, packet: ServerPacket) {
        let mut out = BytesMut::new();
        PacketCodec::encode_server(&packet, &self.ctx, &mut out).unwrap();
        self.stream.write_all(&out).await.unwrap();
    }

    pub async fn accept_hello(&mut self) -> ClientHello {
        let ClientPacket::Hello(hello) = self.expect().await else {
            panic!("expected hello");
        };
        self.send(ServerPacket::Hello(ServerHello {
            name: "ClickHouse".to_string(),
            version_major: 23,
            version_minor: 8,
            revision: SERVER_REVISION,
            timezone: Some("UTC".to_string()),
            display_name: Some("mock".to_string()),
            version_patch: Some(1),
        }))
        .await;
        self.ctx = CodecContext::negotiated(SERVER_REVISION.min(hello.revision), CompressionMethod::None);
        hello
    }

    /// Read the query and the empty external-tables block after it.
    pub async fn accept_query(&mut self) -> Query {
        let ClientPacket::Query(query) = self.expect().await else {
            panic!("expected query");
        };
        if query.compression {
            self.ctx.compression = CompressionMethod::Lz4;
        }
        let ClientPacket::Data { block, .. } = self.expect().await else {
            panic!("expected external tables terminator");
        };
        assert!(block.is_empty());
        *query
    }

    /// Hello, query, then the table header.
    pub async fn accept_insert(&mut self) -> Query {
        self.accept_hello().await;
        let query = self.accept_query().await;
        self.send(ServerPacket::Data(DataPacket {
            table: String::new(),
            block: header(),
        }))
        .await;
        query
    }

    /// Next data block; `None` on hang-up.
    pub async fn next_block(&mut self) -> Option<Block> {
        match self.recv().await? {
            ClientPacket::Data { block, .. } => Some(block),
            other => panic!("expected data, got {:?}", other),
        }
    }

    /// Blocks up to and excluding the empty terminator.
    pub async fn blocks_until_terminator(&mut self) -> Vec<Block> {
        let mut blocks = Vec::new();
        loop {
            let block = self.next_block().await.expect("client hung up before the terminator");
            if block.is_empty() {
                return blocks;
            }
            blocks.push(block);
        }
    }

    /// Everything the client sends until it hangs up.
    pub async fn drain(&mut self) -> Vec<ClientPacket> {
        let mut packets = Vec::new();
        while let Some(packet) = self.recv().await {
            packets.push(packet);
        }
        packets
    }

    pub async fn end_of_stream(&mut self) {
        self.send(ServerPacket::EndOfStream).await;
    }

    /// Wait until the client has written something, without decoding it.
    pub async fn await_bytes(&mut self) {
        let n = self.stream.read_buf(&mut self.buf).await.unwrap();
        assert!(n > 0, "client hung up");
    }

    /// Close the server's write side; the client reads EOF.
    pub async fn hang_up(&mut self) {
        self.stream.shutdown().await.unwrap();
    }
}

#[derive(Default)]
struct ConnectorState {
    streams: Mutex<VecDeque<DuplexStream>>,
    transports: Mutex<Vec<TransportKind>>,
    connects: AtomicUsize,
}

/// Hands out the client ends of queued duplex pipes.
#[derive(Clone, Default)]
pub struct DuplexConnector {
    state: Arc<ConnectorState>,
}

impl DuplexConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a connection and return its server end.
    pub fn server(&self, capacity: usize) -> MockServer {
        let (client, server) = tokio::io::duplex(capacity);
        self.state.streams.lock().unwrap().push_back(client);
        MockServer::new(server)
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn transports(&self) -> Vec<TransportKind> {
        self.state.transports.lock().unwrap().clone()
    }
}

impl Connector for DuplexConnector {
    type Stream = DuplexStream;

    async fn connect(&self, _config: &SessionConfig, transport: TransportKind) -> ChResult<DuplexStream> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        self.state.transports.lock().unwrap().push(transport);
        let stream = self.state.streams.lock().unwrap().pop_front();
        stream.ok_or_else(|| ChError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "no mock server queued")))
    }
}

fn native_available() -> Result<(), String> {
    Ok(())
}

pub fn client(config: SessionConfig, connector: &DuplexConnector) -> ChClient<DuplexConnector> {
    ChClient::with_connector(config, connector.clone()).with_selector(TransportSelector::with_probe(false, native_available))
}

pub fn config(block_rows: u64) -> SessionConfig {
    SessionConfig::builder().block_rows(block_rows).build().unwrap()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: u32,
    pub name: String,
}

pub fn events(ids: Range<u32>) -> Vec<Event> {
    ids.map(|id| Event {
        id,
        name: format!("event-{}", id),
    })
    .collect()
}

/// `id UInt32, name String`.
pub struct EventEncoder;

impl ColumnEncoder<Event> for EventEncoder {
    fn column_count(&self) -> usize {
        2
    }

    fn encode_column(&self, rows: &[Event], position: usize) -> Result<Column, BoxError> {
        match position {
            0 => {
                let data: Vec<u8> = rows.iter().flat_map(|e| e.id.to_le_bytes()).collect();
                Ok(Column::new(tag::UINT32, "id", data))
            }
            1 => {
                let mut data = BytesMut::new();
                for e in rows {
                    data.put_str(&e.name);
                }
                Ok(Column::new(tag::STRING, "name", data.freeze()))
            }
            _ => Err(format!("no column at position {}", position).into()),
        }
    }
}

/// Header block the server sends for the `events` table.
pub fn header() -> Block {
    Block::new(0)
        .with_column(Column::new(tag::UINT32, "id", Bytes::new()))
        .with_column(Column::new(tag::STRING, "name", Bytes::new()))
}

/// Ids carried by a block's `id` column.
pub fn ids(block: &Block) -> Vec<u32> {
    block.columns()[0]
        .data
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn exception(code: i32, message: &str) -> ServerException {
    ServerException {
        code,
        name: "DB::Exception".to_string(),
        message: message.to_string(),
        stack_trace: String::new(),
        nested: None,
    }
}

#[derive(Debug)]
pub struct SourceError(pub &'static str);

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "upstream failed: {}", self.0)
    }
}

impl std::error::Error for SourceError {}
