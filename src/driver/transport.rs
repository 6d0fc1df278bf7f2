//! Transport selection and connection establishment.
//!
//! `Native` builds the socket through socket2 so keepalive and TCP_NODELAY
//! are in place before the connect; `Portable` is a plain tokio connect.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, warn};

use super::config::SessionConfig;
use super::{ChError, ChResult, ConfigError};

const KEEPALIVE_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Native,
    Portable,
}

/// Reports why the native transport cannot be used, if it cannot.
pub type NativeProbe = fn() -> Result<(), String>;

/// Chooses a transport for one connection attempt.
#[derive(Debug, Clone, Copy)]
pub struct TransportSelector {
    strict: bool,
    probe: NativeProbe,
}

impl TransportSelector {
    pub fn new(strict: bool) -> Self {
        Self::with_probe(strict, probe_native)
    }

    pub fn with_probe(strict: bool, probe: NativeProbe) -> Self {
        Self { strict, probe }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.strict_native)
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Pick a transport. Performs no network I/O.
    pub fn select(&self) -> Result<TransportKind, ConfigError> {
        match (self.probe)() {
            Ok(()) => Ok(TransportKind::Native),
            Err(reason) if self.strict => Err(ConfigError::NativeTransportUnavailable(reason)),
            Err(reason) => {
                debug!(%reason, "native transport unavailable, using portable transport");
                Ok(TransportKind::Portable)
            }
        }
    }
}

/// Default probe: can a tuned socket be created on this platform?
pub fn probe_native() -> Result<(), String> {
    #[cfg(unix)]
    {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(|e| e.to_string())?;
        socket.set_keepalive(true).map_err(|e| e.to_string())?;
        socket.set_nodelay(true).map_err(|e| e.to_string())?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        Err("native transport requires a unix target".to_string())
    }
}

/// Opens the byte stream a connection runs over.
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(
        &self,
        config: &SessionConfig,
        transport: TransportKind,
    ) -> impl Future<Output = ChResult<Self::Stream>> + Send;
}

/// TCP connector used by default.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, config: &SessionConfig, transport: TransportKind) -> ChResult<TcpStream> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((config.host.as_str(), config.port))
            .await?
            .collect();
        if addrs.is_empty() {
            return Err(ConfigError::InvalidAddress(config.address()).into());
        }

        let mut last_err = None;
        for addr in addrs {
            let attempt = match transport {
                TransportKind::Native => connect_native(addr, config.tcp_nodelay).await,
                TransportKind::Portable => connect_portable(addr, config.tcp_nodelay).await,
            };
            match attempt {
                Ok(stream) => {
                    debug!(%addr, ?transport, "connected");
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(%addr, error = %e, "connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.map_or(ChError::ConnectionClosed, ChError::Io))
    }
}

async fn connect_native(addr: SocketAddr, nodelay: bool) -> std::io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nodelay(nodelay)?;
    socket.set_keepalive(true)?;
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(KEEPALIVE_SECS))
        .with_interval(Duration::from_secs(KEEPALIVE_SECS / 2 + 1));
    socket.set_tcp_keepalive(&keepalive)?;
    socket.set_nonblocking(true)?;

    let std_stream: std::net::TcpStream = socket.into();
    TcpSocket::from_std_stream(std_stream).connect(addr).await
}

async fn connect_portable(addr: SocketAddr, nodelay: bool) -> std::io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(nodelay)?;
    Ok(stream)
}
