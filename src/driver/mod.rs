//! ClickHouse Driver Module (Layer 3: Async I/O)
//!
//! This module contains the async runtime-specific code.
//! Uses tokio for networking and for the worker/compression contexts.

mod client;
mod config;
mod connection;
mod insert;
mod pipeline;
mod runtime;
mod transport;

pub use client::{ChClient, InsertOperation};
pub use config::{
    CLIENT_VERSION_MAJOR, CLIENT_VERSION_MINOR, DEFAULT_BLOCK_BYTES, DEFAULT_BLOCK_ROWS, DEFAULT_CLIENT_NAME,
    DEFAULT_COMPRESSION_THREADS, DEFAULT_DATABASE, DEFAULT_HOST, DEFAULT_PORT, DEFAULT_USERNAME, SessionConfig,
    SessionConfigBuilder, default_path,
};
pub use connection::{ChConnection, ConnState};
pub use insert::{BridgeState, CancelHandle, ColumnEncoder, InsertControl, InsertSummary, Outcome};
pub use pipeline::{
    BLOCK_ENCODER, BlockEncoder, Outbound, PACKET_DECODER, PACKET_ENCODER, PacketDecoder, PacketEncoder, Pipeline,
    Stage,
};
pub use runtime::{CompressionPool, WorkerGroup};
pub use transport::{Connector, NativeProbe, TcpConnector, TransportKind, TransportSelector, probe_native};

use thiserror::Error;

use crate::protocol::{EncodeError, ServerException, WireError};

/// Boxed error from caller-supplied code (upstream streams, column encoders).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised while building or loading a [`SessionConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Strict native mode is on and the native transport cannot be used.
    #[error("Strict native network mode is enabled, but the native transport is unavailable: {0}")]
    NativeTransportUnavailable(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Error type for ClickHouse driver operations.
#[derive(Debug, Error)]
pub enum ChError {
    /// Raised before any I/O; fix the configuration and retry.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Malformed or unexpected bytes; the connection is unusable.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server answered with an exception packet.
    #[error("Server exception: {0}")]
    Server(#[from] ServerException),

    /// A block broke its own invariants before it was sent.
    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed by server")]
    ConnectionClosed,

    #[error("Connection is broken: {0}")]
    ConnectionBroken(String),

    /// Error from the caller's row source or column encoder, unchanged.
    #[error(transparent)]
    Upstream(BoxError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Client is closed")]
    ClientClosed,

    #[error("Background task failed: {0}")]
    Task(String),
}

impl From<WireError> for ChError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Incomplete => ChError::Protocol("truncated packet".to_string()),
            WireError::Malformed(msg) => ChError::Protocol(msg),
        }
    }
}

impl ChError {
    pub fn upstream(e: impl Into<BoxError>) -> Self {
        ChError::Upstream(e.into())
    }

    /// The decoded server exception, if that is what ended the operation.
    pub fn server_exception(&self) -> Option<&ServerException> {
        match self {
            ChError::Server(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, ChError::Protocol(_))
    }

    /// Whether the connection can carry another operation after this error.
    ///
    /// Only a server exception leaves both peers at a packet boundary, and
    /// only if it did not interrupt a write. `ChConnection` tracks the latter.
    pub fn connection_reusable(&self) -> bool {
        matches!(self, ChError::Server(_))
    }
}

/// Result type for ClickHouse operations.
pub type ChResult<T> = Result<T, ChError>;
