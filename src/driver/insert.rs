//! Streaming insert.
//!
//! The bridge pulls row batches from a caller stream, turns them into
//! columns through a [`ColumnEncoder`], and writes one data packet per
//! `block_rows` rows. The next batch is not pulled until the previous
//! block has been written, so the socket paces the source.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::BytesMut;
use futures_util::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use super::connection::ChConnection;
use super::{BoxError, ChError, ChResult};
use crate::protocol::{Block, ClientPacket, Column, EncodeError, ProfileInfo, Progress, ServerPacket, tag};

/// Turns a slice of rows into one column of a block.
pub trait ColumnEncoder<T>: Send + Sync {
    /// Columns per block, in table order.
    fn column_count(&self) -> usize;

    /// Encode column `position` for `rows`. The payload must hold exactly
    /// `rows.len()` values.
    fn encode_column(&self, rows: &[T], position: usize) -> Result<Column, BoxError>;
}

/// Cancels an in-flight insert. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    flag: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self { flag: Arc::new(flag) }
    }

    pub fn cancel(&self) {
        self.flag.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.flag.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.flag.subscribe();
        // The sender lives in `self`, so this only returns once set.
        let _ = rx.wait_for(|set| *set).await;
    }
}

/// Per-insert knobs: query id, cancellation, progress reporting.
#[derive(Debug)]
pub struct InsertControl {
    query_id: String,
    cancel: CancelHandle,
    progress: watch::Sender<Progress>,
}

impl Default for InsertControl {
    fn default() -> Self {
        Self::new()
    }
}

impl InsertControl {
    pub fn new() -> Self {
        Self::with_query_id("")
    }

    /// An empty id lets the server assign one.
    pub fn with_query_id(query_id: impl Into<String>) -> Self {
        let (progress, _) = watch::channel(Progress::default());
        Self {
            query_id: query_id.into(),
            cancel: CancelHandle::new(),
            progress,
        }
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Accumulated server progress, updated as packets arrive.
    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }
}

/// Totals of a finished insert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertSummary {
    pub rows: u64,
    pub blocks: u64,
    /// Data packet bytes written, after compression.
    pub bytes: u64,
    pub progress: Progress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    AwaitingUpstream,
    Buffering,
    Flushing,
    AwaitingServerAck,
    Done(Outcome),
}

impl BridgeState {
    pub fn can_move_to(self, next: BridgeState) -> bool {
        use BridgeState::*;
        match (self, next) {
            (Done(_), _) => false,
            (_, Done(_)) => true,
            (Idle, AwaitingUpstream) => true,
            (AwaitingUpstream, Buffering | Flushing | AwaitingServerAck) => true,
            (Buffering, AwaitingUpstream | Flushing) => true,
            (Flushing, Buffering | AwaitingUpstream | AwaitingServerAck) => true,
            _ => false,
        }
    }
}

/// Rows accepted from upstream but not yet written.
#[derive(Debug, Default)]
struct BlockBuffer {
    columns: Option<Vec<PendingColumn>>,
    rows: u64,
    bytes: usize,
}

#[derive(Debug)]
struct PendingColumn {
    type_tag: u8,
    type_name: String,
    name: String,
    data: BytesMut,
}

impl PendingColumn {
    fn into_column(self, rows: u64) -> Column {
        if self.type_tag == tag::OTHER {
            Column::with_type(self.name, self.type_name, rows, self.data.freeze())
        } else {
            Column::new(self.type_tag, self.name, self.data.freeze())
        }
    }
}

impl BlockBuffer {
    fn rows(&self) -> u64 {
        self.rows
    }

    fn bytes(&self) -> usize {
        self.bytes
    }

    /// Append one encoded slice of `rows` rows.
    fn append(&mut self, columns: Vec<Column>, rows: u64) -> ChResult<()> {
        if let Some(column) = columns.iter().find(|c| c.declared_rows().is_some_and(|n| n != rows)) {
            return Err(EncodeError::InvalidPayload {
                column: column.name.clone(),
                reason: format!("encoder declared {:?} rows for a slice of {}", column.declared_rows(), rows),
            }
            .into());
        }
        let added: usize = columns.iter().map(|c| c.data.len()).sum();
        match &mut self.columns {
            None => {
                self.columns = Some(
                    columns
                        .into_iter()
                        .map(|c| PendingColumn {
                            type_tag: c.type_tag,
                            type_name: c.type_name().to_string(),
                            name: c.name,
                            data: BytesMut::from(&c.data[..]),
                        })
                        .collect(),
                );
            }
            Some(pending) => {
                if pending.len() != columns.len() {
                    return Err(EncodeError::InvalidPayload {
                        column: String::new(),
                        reason: format!("encoder produced {} columns, expected {}", columns.len(), pending.len()),
                    }
                    .into());
                }
                for (slot, column) in pending.iter_mut().zip(columns) {
                    if slot.name != column.name || slot.type_name != column.type_name() {
                        return Err(EncodeError::InvalidPayload {
                            column: column.name,
                            reason: format!("column changed between batches (expected '{}')", slot.name),
                        }
                        .into());
                    }
                    slot.data.extend_from_slice(&column.data);
                }
            }
        }
        self.rows += rows;
        self.bytes += added;
        Ok(())
    }

    fn take(&mut self) -> Block {
        let mut block = Block::new(self.rows);
        for column in self.columns.take().unwrap_or_default() {
            block.push(column.into_column(self.rows));
        }
        self.rows = 0;
        self.bytes = 0;
        block
    }

    fn clear(&mut self) {
        self.columns = None;
        self.rows = 0;
        self.bytes = 0;
    }
}

fn log_profile(info: &ProfileInfo) {
    debug!(rows = info.rows, blocks = info.blocks, bytes = info.bytes, "server profile info");
}

/// Await `fut` unless the insert is cancelled first.
async fn guarded<F, R>(cancel: &CancelHandle, fut: F) -> ChResult<R>
where
    F: Future<Output = ChResult<R>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ChError::Cancelled),
        result = fut => result,
    }
}

pub(super) struct InsertionBridge<'a, S, T, E: ?Sized> {
    conn: &'a mut ChConnection<S>,
    encoder: &'a E,
    control: &'a InsertControl,
    buffer: BlockBuffer,
    state: BridgeState,
    block_rows: u64,
    block_bytes: usize,
    summary: InsertSummary,
    _rows: PhantomData<fn(&[T])>,
}

impl<'a, S, T, E> InsertionBridge<'a, S, T, E>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    E: ColumnEncoder<T> + ?Sized,
{
    pub(super) fn new(conn: &'a mut ChConnection<S>, encoder: &'a E, control: &'a InsertControl) -> Self {
        let block_rows = conn.config().block_rows.max(1);
        let block_bytes = conn.config().block_bytes.max(1);
        Self {
            conn,
            encoder,
            control,
            buffer: BlockBuffer::default(),
            state: BridgeState::Idle,
            block_rows,
            block_bytes,
            summary: InsertSummary::default(),
            _rows: PhantomData,
        }
    }

    pub(super) async fn run<St, Er>(mut self, query: &str, source: St) -> ChResult<InsertSummary>
    where
        St: Stream<Item = Result<Vec<T>, Er>>,
        Er: Into<BoxError>,
    {
        let result = self.drive(query, source).await;
        match &result {
            Ok(summary) => {
                self.set_state(BridgeState::Done(Outcome::Success));
                debug!(rows = summary.rows, blocks = summary.blocks, bytes = summary.bytes, "insert finished");
            }
            Err(e) => {
                self.set_state(BridgeState::Done(Outcome::Error));
                self.buffer.clear();
                debug!(error = %e, "insert failed");
            }
        }
        result
    }

    fn set_state(&mut self, next: BridgeState) {
        if self.state == next {
            return;
        }
        debug_assert!(self.state.can_move_to(next), "{:?} -> {:?}", self.state, next);
        trace!(from = ?self.state, to = ?next, "bridge state");
        self.state = next;
    }

    async fn drive<St, Er>(&mut self, query: &str, source: St) -> ChResult<InsertSummary>
    where
        St: Stream<Item = Result<Vec<T>, Er>>,
        Er: Into<BoxError>,
    {
        let cancel = self.control.cancel_handle();
        if cancel.is_cancelled() {
            return Err(ChError::Cancelled);
        }

        let query = self.conn.query(self.control.query_id(), query);
        guarded(&cancel, self.conn.send_packet(ClientPacket::Query(Box::new(query)))).await?;
        // Empty block ends the external tables section.
        guarded(&cancel, self.conn.send_block(Block::empty())).await?;

        let Some(header) = guarded(&cancel, self.await_header()).await? else {
            debug!("server finished without asking for data");
            return Ok(self.summary);
        };
        if header.column_count() != self.encoder.column_count() {
            warn!(
                table_columns = header.column_count(),
                encoder_columns = self.encoder.column_count(),
                "encoder column count differs from the table"
            );
        }
        self.set_state(BridgeState::AwaitingUpstream);

        let mut source = std::pin::pin!(source);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ChError::Cancelled),
                packet = self.conn.recv() => self.on_streaming_packet(packet?)?,
                item = source.next() => match item {
                    Some(Ok(batch)) => self.accept(batch, &cancel).await?,
                    Some(Err(e)) => return Err(ChError::Upstream(e.into())),
                    None => break,
                },
            }
        }

        if self.buffer.rows() > 0 {
            self.flush(&cancel).await?;
        }
        guarded(&cancel, self.conn.send_block(Block::empty())).await?;
        self.set_state(BridgeState::AwaitingServerAck);

        loop {
            match guarded(&cancel, self.conn.recv()).await? {
                ServerPacket::EndOfStream => return Ok(self.summary),
                ServerPacket::Exception(e) => return Err(e.into()),
                ServerPacket::Progress(p) => self.publish(&p),
                ServerPacket::ProfileInfo(info) => log_profile(&info),
                ServerPacket::Pong => {}
                ServerPacket::Data(_) | ServerPacket::Totals(_) | ServerPacket::Extremes(_) => {
                    trace!("ignoring result block after insert");
                }
                ServerPacket::Hello(_) => {
                    return Err(ChError::Protocol("unexpected hello after insert".to_string()));
                }
            }
        }
    }

    /// The server answers an INSERT with a header block describing the table.
    async fn await_header(&mut self) -> ChResult<Option<Block>> {
        loop {
            match self.conn.recv().await? {
                ServerPacket::Data(data) => return Ok(Some(data.block)),
                ServerPacket::Progress(p) => self.publish(&p),
                ServerPacket::ProfileInfo(info) => log_profile(&info),
                ServerPacket::Pong => {}
                ServerPacket::EndOfStream => return Ok(None),
                ServerPacket::Exception(e) => return Err(e.into()),
                other => {
                    return Err(ChError::Protocol(format!(
                        "expected insert header, got {}",
                        other.name()
                    )));
                }
            }
        }
    }

    fn on_streaming_packet(&mut self, packet: ServerPacket) -> ChResult<()> {
        match packet {
            ServerPacket::Exception(e) => Err(e.into()),
            ServerPacket::Progress(p) => {
                self.publish(&p);
                Ok(())
            }
            ServerPacket::ProfileInfo(info) => {
                log_profile(&info);
                Ok(())
            }
            ServerPacket::Pong => Ok(()),
            other => Err(ChError::Protocol(format!(
                "unexpected {} packet during insert",
                other.name()
            ))),
        }
    }

    /// Buffer a batch, flushing each time the threshold is reached.
    async fn accept(&mut self, batch: Vec<T>, cancel: &CancelHandle) -> ChResult<()> {
        self.set_state(BridgeState::Buffering);
        let mut offset = 0;
        while offset < batch.len() {
            let room = usize::try_from(self.block_rows - self.buffer.rows()).unwrap_or(usize::MAX);
            let take = room.min(batch.len() - offset);
            let columns = {
                let slice = &batch[offset..offset + take];
                (0..self.encoder.column_count())
                    .map(|position| self.encoder.encode_column(slice, position).map_err(ChError::Upstream))
                    .collect::<ChResult<Vec<_>>>()?
            };
            self.buffer.append(columns, take as u64)?;
            offset += take;

            if self.buffer.rows() >= self.block_rows || self.buffer.bytes() >= self.block_bytes {
                self.flush(cancel).await?;
                self.set_state(BridgeState::Buffering);
            }
        }
        self.set_state(BridgeState::AwaitingUpstream);
        Ok(())
    }

    async fn flush(&mut self, cancel: &CancelHandle) -> ChResult<()> {
        self.set_state(BridgeState::Flushing);
        let block = self.buffer.take();
        let rows = block.rows();
        let written = guarded(cancel, self.conn.send_block(block)).await?;

        self.summary.rows += rows;
        self.summary.blocks += 1;
        self.summary.bytes += written as u64;
        metrics::counter!("qail_ch_blocks_sent_total").increment(1);
        metrics::counter!("qail_ch_rows_sent_total").increment(rows);
        metrics::counter!("qail_ch_bytes_sent_total").increment(written as u64);
        trace!(rows, bytes = written, "block flushed");
        Ok(())
    }

    fn publish(&mut self, delta: &Progress) {
        self.summary.progress.add(delta);
        self.control.progress.send_replace(self.summary.progress);
    }
}
