//! ClickHouse Connection
//!
//! One native-protocol session over any async byte stream.
//! This is Layer 3 (async I/O).

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::BytesMut;
use futures_util::{FutureExt, Stream};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use super::config::{CLIENT_VERSION_MAJOR, CLIENT_VERSION_MINOR, SessionConfig};
use super::insert::{ColumnEncoder, InsertControl, InsertSummary, InsertionBridge};
use super::pipeline::{Outbound, Pipeline};
use super::runtime::CompressionPool;
use super::transport::{Connector, TcpConnector, TransportSelector};
use super::{BoxError, ChError, ChResult};
use crate::protocol::client::STAGE_COMPLETE;
use crate::protocol::{
    AuthData, Block, ClientHello, ClientInfo, ClientPacket, CodecContext, Query, ServerHello, ServerPacket, revision,
};

const READ_CHUNK: usize = 8192;

/// Lifecycle of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnState {
    Ready,
    /// An operation is running, or was abandoned mid-stream.
    Busy,
    Broken(String),
    Closed,
}

/// A handshaken ClickHouse connection.
pub struct ChConnection<S> {
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    buffer: BytesMut,
    /// Packets read while a write was in progress.
    pending: VecDeque<ServerPacket>,
    pipeline: Arc<Pipeline>,
    ctx: CodecContext,
    server: ServerHello,
    config: Arc<SessionConfig>,
    compression: Arc<CompressionPool>,
    state: ConnState,
    /// A write was abandoned mid-packet; the byte stream is out of sync.
    torn: bool,
}

impl ChConnection<TcpStream> {
    /// Connect over TCP with a private compression pool.
    pub async fn connect(config: SessionConfig) -> ChResult<Self> {
        let transport = TransportSelector::from_config(&config).select()?;
        let config = Arc::new(config);
        let compression = Arc::new(CompressionPool::new(config.compression_threads));
        let stream = TcpConnector.connect(&config, transport).await?;
        Self::handshake(stream, config, compression).await
    }
}

impl<S> ChConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Exchange hello packets over a freshly opened stream.
    pub async fn handshake(stream: S, config: Arc<SessionConfig>, compression: Arc<CompressionPool>) -> ChResult<Self> {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let pipeline = Arc::new(Pipeline::default());
        let hello_ctx = CodecContext::handshake();

        let hello = ClientPacket::Hello(ClientHello {
            client_name: config.client_name.clone(),
            version_major: CLIENT_VERSION_MAJOR,
            version_minor: CLIENT_VERSION_MINOR,
            revision: revision::CLIENT_REVISION,
            auth: AuthData::from(&*config),
        });
        let bytes = pipeline.encode(Outbound::Packet(hello), &hello_ctx)?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;

        let mut buffer = BytesMut::with_capacity(READ_CHUNK);
        let server = match read_packet(&mut reader, &mut buffer, &pipeline, &hello_ctx).await? {
            ServerPacket::Hello(hello) => hello,
            ServerPacket::Exception(e) => return Err(e.into()),
            other => {
                return Err(ChError::Protocol(format!(
                    "expected server hello, got {}",
                    other.name()
                )));
            }
        };

        let ctx = CodecContext::negotiated(server.revision, config.compression);
        debug!(
            server = %server.name,
            version = %format_args!("{}.{}", server.version_major, server.version_minor),
            revision = ctx.revision,
            compression = ?ctx.compression,
            "handshake complete"
        );

        Ok(Self {
            reader,
            writer,
            buffer,
            pending: VecDeque::new(),
            pipeline,
            ctx,
            server,
            config,
            compression,
            state: ConnState::Ready,
            torn: false,
        })
    }

    pub fn server_info(&self) -> &ServerHello {
        &self.server
    }

    pub fn context(&self) -> CodecContext {
        self.ctx
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> &ConnState {
        &self.state
    }

    pub fn is_reusable(&self) -> bool {
        self.state == ConnState::Ready
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Mutable access to the handler chain, while no block encode holds it.
    pub fn pipeline_mut(&mut self) -> Option<&mut Pipeline> {
        Arc::get_mut(&mut self.pipeline)
    }

    /// Round-trip a ping.
    pub async fn ping(&mut self) -> ChResult<()> {
        self.begin()?;
        let result = self.ping_inner().await;
        self.finish(&result);
        result
    }

    async fn ping_inner(&mut self) -> ChResult<()> {
        self.send_packet(ClientPacket::Ping).await?;
        loop {
            match self.recv().await? {
                ServerPacket::Pong => return Ok(()),
                ServerPacket::Progress(_) | ServerPacket::ProfileInfo(_) => {}
                ServerPacket::Exception(e) => return Err(e.into()),
                other => {
                    return Err(ChError::Protocol(format!("expected pong, got {}", other.name())));
                }
            }
        }
    }

    /// Stream rows from `source` into the table named by `query`.
    ///
    /// `query` is the INSERT statement without a FORMAT clause.
    pub async fn insert<T, St, Er, E>(&mut self, query: &str, source: St, encoder: &E) -> ChResult<InsertSummary>
    where
        St: Stream<Item = Result<Vec<T>, Er>>,
        Er: Into<BoxError>,
        E: ColumnEncoder<T> + ?Sized,
    {
        self.insert_with(query, source, encoder, &InsertControl::new()).await
    }

    /// [`insert`](Self::insert) with a query id, cancellation and progress.
    pub async fn insert_with<T, St, Er, E>(
        &mut self,
        query: &str,
        source: St,
        encoder: &E,
        control: &InsertControl,
    ) -> ChResult<InsertSummary>
    where
        St: Stream<Item = Result<Vec<T>, Er>>,
        Er: Into<BoxError>,
        E: ColumnEncoder<T> + ?Sized,
    {
        self.begin()?;
        debug!(query_id = control.query_id(), "insert started");
        let result = InsertionBridge::new(self, encoder, control).run(query, source).await;
        self.finish(&result);
        result
    }

    /// Close the write side. The connection cannot be used afterwards.
    pub async fn close(mut self) -> ChResult<()> {
        self.state = ConnState::Closed;
        self.writer.shutdown().await?;
        debug!("connection closed");
        Ok(())
    }

    fn begin(&mut self) -> ChResult<()> {
        match &self.state {
            ConnState::Ready => {
                self.state = ConnState::Busy;
                Ok(())
            }
            ConnState::Busy => {
                let reason = "previous operation was abandoned mid-stream".to_string();
                self.state = ConnState::Broken(reason.clone());
                Err(ChError::ConnectionBroken(reason))
            }
            ConnState::Broken(reason) => Err(ChError::ConnectionBroken(reason.clone())),
            ConnState::Closed => Err(ChError::ConnectionClosed),
        }
    }

    fn finish<T>(&mut self, result: &ChResult<T>) {
        self.state = match result {
            Ok(_) => ConnState::Ready,
            Err(e) if e.connection_reusable() && !self.torn => ConnState::Ready,
            Err(e) => {
                warn!(error = %e, "connection marked broken");
                ConnState::Broken(e.to_string())
            }
        };
    }

    pub(super) fn query(&self, query_id: &str, text: &str) -> Query {
        Query {
            query_id: query_id.to_string(),
            client_info: ClientInfo::initial(&self.config.client_name, CLIENT_VERSION_MAJOR, CLIENT_VERSION_MINOR),
            settings: self.config.wire_settings(),
            stage: STAGE_COMPLETE,
            compression: self.ctx.compression.is_enabled(),
            text: format!("{} FORMAT Native", text.trim_end()),
        }
    }

    pub(super) async fn send_packet(&mut self, packet: ClientPacket) -> ChResult<()> {
        trace!(kind = packet.kind(), "send packet");
        let bytes = self.pipeline.encode(Outbound::Packet(packet), &self.ctx)?;
        self.write_frame(&bytes).await
    }

    /// Serialize and compress `block` on the compression pool, then write it.
    ///
    /// Returns the number of bytes written.
    pub(super) async fn send_block(&mut self, block: Block) -> ChResult<usize> {
        let pipeline = Arc::clone(&self.pipeline);
        let ctx = self.ctx;
        let bytes = self
            .compression
            .run(move || pipeline.encode(Outbound::Block(block), &ctx))
            .await??;
        self.write_frame(&bytes).await?;
        Ok(bytes.len())
    }

    /// Next server packet. Cancel-safe: partial reads stay buffered.
    pub(super) async fn recv(&mut self) -> ChResult<ServerPacket> {
        if let Some(packet) = self.pending.pop_front() {
            return Ok(packet);
        }
        read_packet(&mut self.reader, &mut self.buffer, &self.pipeline, &self.ctx).await
    }

    /// Write while reading server packets, so a server that stops reading
    /// to report an exception cannot stall the write.
    ///
    /// An exception that cuts a write short leaves part of a packet on the
    /// wire; the connection is then torn and cannot be reused.
    async fn write_frame(&mut self, bytes: &[u8]) -> ChResult<()> {
        let Self {
            reader,
            writer,
            buffer,
            pending,
            pipeline,
            ctx,
            torn,
            ..
        } = self;
        let pipeline: &Pipeline = pipeline;
        let ctx: &CodecContext = ctx;

        let write = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        };
        tokio::pin!(write);

        loop {
            tokio::select! {
                biased;
                written = &mut write => {
                    return match written {
                        Ok(()) => Ok(()),
                        Err(e) => {
                            *torn = true;
                            Err(salvage_exception(&mut *reader, &mut *buffer, pipeline, ctx).unwrap_or(ChError::Io(e)))
                        }
                    };
                }
                packet = read_packet(&mut *reader, &mut *buffer, pipeline, ctx) => match packet {
                    Ok(ServerPacket::Exception(e)) => {
                        *torn = true;
                        return Err(e.into());
                    }
                    Ok(other) => pending.push_back(other),
                    Err(e) => {
                        *torn = true;
                        return Err(e);
                    }
                },
            }
        }
    }
}

async fn read_packet<R>(
    reader: &mut R,
    buffer: &mut BytesMut,
    pipeline: &Pipeline,
    ctx: &CodecContext,
) -> ChResult<ServerPacket>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(packet) = pipeline.decode(buffer, ctx)? {
            trace!(packet = packet.name(), "recv packet");
            if let ServerPacket::Exception(e) = &packet {
                metrics::counter!("qail_ch_server_exceptions_total").increment(1);
                debug!(code = e.code, name = %e.name, "server exception");
            }
            return Ok(packet);
        }
        buffer.reserve(READ_CHUNK);
        if reader.read_buf(buffer).await? == 0 {
            return Err(ChError::ConnectionClosed);
        }
    }
}

/// After a failed write, look for an exception the server already sent.
///
/// Only bytes that are readable without waiting are considered.
fn salvage_exception<R>(reader: &mut R, buffer: &mut BytesMut, pipeline: &Pipeline, ctx: &CodecContext) -> Option<ChError>
where
    R: AsyncRead + Unpin,
{
    loop {
        match pipeline.decode(buffer, ctx) {
            Ok(Some(ServerPacket::Exception(e))) => {
                metrics::counter!("qail_ch_server_exceptions_total").increment(1);
                return Some(e.into());
            }
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(_) => return None,
        }
        buffer.reserve(READ_CHUNK);
        match reader.read_buf(buffer).now_or_never() {
            Some(Ok(n)) if n > 0 => {}
            _ => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{DuplexStream, duplex};

    use super::*;
    use crate::protocol::{CompressionMethod, PacketCodec, ServerException, known_setting_kind};

    async fn read_client(stream: &mut DuplexStream, buf: &mut BytesMut, ctx: &CodecContext) -> ClientPacket {
        loop {
            if let Some(p) = PacketCodec::decode_client(buf, ctx, &known_setting_kind).unwrap() {
                return p;
            }
            assert!(stream.read_buf(buf).await.unwrap() > 0, "client hung up");
        }
    }

    async fn write_server(stream: &mut DuplexStream, packet: ServerPacket, ctx: &CodecContext) {
        let mut out = BytesMut::new();
        PacketCodec::encode_server(&packet, ctx, &mut out).unwrap();
        stream.write_all(&out).await.unwrap();
    }

    fn server_hello() -> ServerPacket {
        ServerPacket::Hello(ServerHello {
            name: "ClickHouse".to_string(),
            version_major: 23,
            version_minor: 8,
            revision: 54465,
            timezone: Some("UTC".to_string()),
            display_name: Some("test".to_string()),
            version_patch: Some(1),
        })
    }

    async fn connect(stream: DuplexStream) -> ChResult<ChConnection<DuplexStream>> {
        let config = Arc::new(SessionConfig::builder().password("pw").build().unwrap());
        ChConnection::handshake(stream, config, Arc::new(CompressionPool::new(1))).await
    }

    #[tokio::test]
    async fn test_handshake_and_ping() {
        let (client, mut server) = duplex(4096);
        let server_task = tokio::spawn(async move {
            let ctx = CodecContext::handshake();
            let mut buf = BytesMut::new();
            let ClientPacket::Hello(hello) = read_client(&mut server, &mut buf, &ctx).await else {
                panic!("expected hello");
            };
            assert_eq!(hello.revision, revision::CLIENT_REVISION);
            assert_eq!(hello.auth.password, "pw");
            write_server(&mut server, server_hello(), &ctx).await;

            let ctx = CodecContext::negotiated(54465, CompressionMethod::None);
            assert_eq!(read_client(&mut server, &mut buf, &ctx).await, ClientPacket::Ping);
            write_server(&mut server, ServerPacket::Pong, &ctx).await;
            server
        });

        let mut conn = connect(client).await.unwrap();
        assert_eq!(conn.server_info().name, "ClickHouse");
        assert_eq!(conn.context().revision, revision::CLIENT_REVISION);
        conn.ping().await.unwrap();
        assert!(conn.is_reusable());
        let _server = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_exception() {
        let (client, mut server) = duplex(4096);
        tokio::spawn(async move {
            let ctx = CodecContext::handshake();
            let mut buf = BytesMut::new();
            read_client(&mut server, &mut buf, &ctx).await;
            let exception = ServerException {
                code: 516,
                name: "DB::Exception".to_string(),
                message: "default: Authentication failed".to_string(),
                stack_trace: String::new(),
                nested: None,
            };
            write_server(&mut server, ServerPacket::Exception(exception), &ctx).await;
            server
        });

        let err = connect(client).await.err().unwrap();
        assert_eq!(err.server_exception().map(|e| e.code), Some(516));
    }

    #[tokio::test]
    async fn test_unexpected_packet_breaks_connection() {
        let (client, mut server) = duplex(4096);
        tokio::spawn(async move {
            let ctx = CodecContext::handshake();
            let mut buf = BytesMut::new();
            read_client(&mut server, &mut buf, &ctx).await;
            write_server(&mut server, server_hello(), &ctx).await;
            read_client(&mut server, &mut buf, &ctx).await;
            write_server(&mut server, ServerPacket::EndOfStream, &ctx).await;
            server
        });

        let mut conn = connect(client).await.unwrap();
        assert!(conn.ping().await.unwrap_err().is_protocol_violation());
        assert!(matches!(conn.state(), ConnState::Broken(_)));
        assert!(matches!(conn.ping().await, Err(ChError::ConnectionBroken(_))));
    }

    #[tokio::test]
    async fn test_server_hangup() {
        let (client, server) = duplex(4096);
        drop(server);
        assert!(connect(client).await.is_err());
    }
}
