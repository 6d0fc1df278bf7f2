//! Client entry point.
//!
//! A [`ChClient`] owns the configuration, the worker group that runs
//! operations and the compression pool. Each operation opens its own
//! connection, runs to one terminal result and closes it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::{Mutex, oneshot, watch};
use tracing::debug;

use super::config::SessionConfig;
use super::connection::ChConnection;
use super::insert::{CancelHandle, ColumnEncoder, InsertControl, InsertSummary};
use super::runtime::{CompressionPool, WorkerGroup};
use super::transport::{Connector, TcpConnector, TransportSelector};
use super::{BoxError, ChError, ChResult};
use crate::protocol::Progress;

const READY: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// ClickHouse native-protocol client.
///
/// Operations must be started from within a tokio runtime.
///
/// The client owns the tasks of its operations. Dropping it without
/// [`close`](Self::close) aborts every running operation, and each
/// [`InsertOperation`] then resolves to [`ChError::ClientClosed`].
pub struct ChClient<C: Connector = TcpConnector> {
    config: Arc<SessionConfig>,
    connector: Arc<C>,
    selector: TransportSelector,
    workers: Arc<WorkerGroup>,
    compression: Arc<CompressionPool>,
    state: AtomicU8,
    close_lock: Mutex<()>,
}

impl ChClient<TcpConnector> {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_connector(config, TcpConnector)
    }
}

impl Default for ChClient<TcpConnector> {
    /// `localhost:9000`, database and user `default`, empty password.
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl<C: Connector> ChClient<C> {
    pub fn with_connector(config: SessionConfig, connector: C) -> Self {
        let selector = TransportSelector::from_config(&config);
        let compression = Arc::new(CompressionPool::new(config.compression_threads));
        Self {
            config: Arc::new(config),
            connector: Arc::new(connector),
            selector,
            workers: Arc::new(WorkerGroup::new()),
            compression,
            state: AtomicU8::new(READY),
            close_lock: Mutex::new(()),
        }
    }

    /// Replace the transport selector (for example, to inject a probe).
    pub fn with_selector(mut self, selector: TransportSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) != READY
    }

    fn ensure_open(&self) -> ChResult<()> {
        if self.is_closed() {
            return Err(ChError::ClientClosed);
        }
        Ok(())
    }

    /// Open and handshake a connection the caller drives directly.
    pub async fn connect(&self) -> ChResult<ChConnection<C::Stream>> {
        self.ensure_open()?;
        let transport = self.selector.select()?;
        let stream = self.connector.connect(&self.config, transport).await?;
        ChConnection::handshake(stream, Arc::clone(&self.config), Arc::clone(&self.compression)).await
    }

    /// Start streaming `source` into `query` (an INSERT without FORMAT).
    ///
    /// Configuration problems are reported here, before any I/O. Everything
    /// else arrives through the returned [`InsertOperation`].
    pub fn send_data<T, St, Er, E>(&self, query: &str, source: St, encoder: E) -> ChResult<InsertOperation>
    where
        T: Send + 'static,
        St: Stream<Item = Result<Vec<T>, Er>> + Send + 'static,
        Er: Into<BoxError> + Send + 'static,
        E: ColumnEncoder<T> + 'static,
    {
        self.send_data_with_id("", query, source, encoder)
    }

    /// [`send_data`](Self::send_data) with an explicit query id.
    pub fn send_data_with_id<T, St, Er, E>(
        &self,
        query_id: &str,
        query: &str,
        source: St,
        encoder: E,
    ) -> ChResult<InsertOperation>
    where
        T: Send + 'static,
        St: Stream<Item = Result<Vec<T>, Er>> + Send + 'static,
        Er: Into<BoxError> + Send + 'static,
        E: ColumnEncoder<T> + 'static,
    {
        self.ensure_open()?;
        let transport = self.selector.select()?;

        let control = InsertControl::with_query_id(query_id);
        let cancel = control.cancel_handle();
        let progress = control.subscribe();
        let (tx, rx) = oneshot::channel();

        let config = Arc::clone(&self.config);
        let connector = Arc::clone(&self.connector);
        let compression = Arc::clone(&self.compression);
        let query = query.to_string();

        self.workers.spawn(async move {
            let cancel = control.cancel_handle();
            let operation = async {
                let stream = connector.connect(&config, transport).await?;
                let mut conn = ChConnection::handshake(stream, config, compression).await?;
                let result = conn.insert_with(&query, source, &encoder, &control).await;
                if let Err(e) = conn.close().await {
                    debug!(error = %e, "error closing insert connection");
                }
                result
            };
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ChError::Cancelled),
                result = operation => result,
            };
            let _ = tx.send(result);
        })?;

        Ok(InsertOperation {
            result: rx,
            cancel,
            progress,
        })
    }

    /// Stop all operations and wait for the worker and compression contexts.
    ///
    /// Safe to call more than once; later calls return immediately.
    pub async fn close(&self) {
        let _guard = self.close_lock.lock().await;
        if self.state.load(Ordering::Acquire) == CLOSED {
            return;
        }
        self.state.store(CLOSING, Ordering::Release);
        debug!(active = self.workers.active(), "closing client");
        self.workers.shutdown().await;
        self.compression.shutdown().await;
        self.state.store(CLOSED, Ordering::Release);
        debug!("client closed");
    }
}

/// Handle to a running insert. Resolves exactly once.
///
/// Dropping the handle cancels the insert.
#[derive(Debug)]
pub struct InsertOperation {
    result: oneshot::Receiver<ChResult<InsertSummary>>,
    cancel: CancelHandle,
    progress: watch::Receiver<Progress>,
}

impl InsertOperation {
    /// Request cancellation; the operation resolves to [`ChError::Cancelled`]
    /// unless it already finished.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn progress(&self) -> watch::Receiver<Progress> {
        self.progress.clone()
    }
}

impl Future for InsertOperation {
    type Output = ChResult<InsertSummary>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.result).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The task was stopped by `close` before it could report.
            Poll::Ready(Err(_)) => Poll::Ready(Err(ChError::ClientClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for InsertOperation {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
