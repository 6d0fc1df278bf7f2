//! Session configuration.
//!
//! A [`SessionConfig`] is built once (builder or TOML file) and never
//! mutated afterwards; each operation takes a shared `Arc` of it.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use super::ConfigError;
use crate::protocol::{AuthData, CompressionMethod, Limits, SettingValue, Settings};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 9000;
pub const DEFAULT_DATABASE: &str = "default";
pub const DEFAULT_USERNAME: &str = "default";
/// The server's default `max_insert_block_size`.
pub const DEFAULT_BLOCK_ROWS: u64 = 1_048_576;
pub const DEFAULT_BLOCK_BYTES: usize = 64 * 1024 * 1024;
pub const DEFAULT_COMPRESSION_THREADS: usize = 2;
pub const DEFAULT_CLIENT_NAME: &str = "qail-ch";

pub const CLIENT_VERSION_MAJOR: u64 = 1;
pub const CLIENT_VERSION_MINOR: u64 = 1;

const COMPRESSION_SETTING: &str = "network_compression_method";

/// Connection and session settings for a [`ChClient`](super::ChClient).
#[derive(Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub settings: Settings,
    pub limits: Limits,
    pub compression: CompressionMethod,
    /// Fail instead of falling back when the native transport is unavailable.
    pub strict_native: bool,
    /// Rows per wire block.
    pub block_rows: u64,
    /// Soft cap on buffered payload bytes before a block is flushed early.
    pub block_bytes: usize,
    pub tcp_nodelay: bool,
    pub compression_threads: usize,
    pub client_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            database: DEFAULT_DATABASE.to_string(),
            username: DEFAULT_USERNAME.to_string(),
            password: String::new(),
            settings: Settings::new(),
            limits: Limits::new(),
            compression: CompressionMethod::None,
            strict_native: false,
            block_rows: DEFAULT_BLOCK_ROWS,
            block_bytes: DEFAULT_BLOCK_BYTES,
            tcp_nodelay: true,
            compression_threads: DEFAULT_COMPRESSION_THREADS,
            client_name: DEFAULT_CLIENT_NAME.to_string(),
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("settings", &self.settings)
            .field("limits", &self.limits)
            .field("compression", &self.compression)
            .field("strict_native", &self.strict_native)
            .field("block_rows", &self.block_rows)
            .field("block_bytes", &self.block_bytes)
            .field("tcp_nodelay", &self.tcp_nodelay)
            .field("compression_threads", &self.compression_threads)
            .field("client_name", &self.client_name)
            .finish()
    }
}

impl SessionConfig {
    /// Create a new config builder with every field at its default.
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Settings as sent in the query packet.
    ///
    /// Session settings first, then the compression method derived from
    /// [`compression`](Self::compression), then limits. A name present in
    /// more than one place is sent once, at its last position's value.
    pub fn wire_settings(&self) -> Settings {
        let mut merged = Settings::new();
        for (name, value) in self.settings.iter() {
            if !self.limits.contains(name) {
                merged.set(name, value.clone());
            }
        }
        if let Some(method) = self.compression.setting_name() {
            merged.set(COMPRESSION_SETTING, method);
        }
        for (name, value) in self.limits.iter() {
            merged.set(name, value.clone());
        }
        merged
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    ///
    /// ```toml
    /// host = "ch.internal"
    /// port = 9000
    /// compression = "lz4"
    ///
    /// [settings]
    /// max_threads = 8
    ///
    /// [limits]
    /// max_memory_usage = 10000000000
    /// ```
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(s)?;
        file.into_builder()?.build()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        debug!(path = %path.display(), "loading session config");
        Self::from_toml_str(&text)
    }

    /// Load `<config_dir>/qail/clickhouse.toml`, or defaults if it does not exist.
    pub fn load_default() -> Result<Self, ConfigError> {
        match default_path() {
            Some(path) if path.exists() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }
}

/// Default location of the config file, if the platform has a config dir.
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("qail").join("clickhouse.toml"))
}

impl From<&SessionConfig> for AuthData {
    fn from(config: &SessionConfig) -> Self {
        AuthData {
            database: config.database.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        }
    }
}

/// Builder for [`SessionConfig`].
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.host = host.into();
        self.config.port = port;
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.config.database = database.into();
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.config.username = username.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = password.into();
        self
    }

    /// Add or replace a session setting.
    pub fn setting(mut self, name: impl Into<String>, value: impl Into<SettingValue>) -> Self {
        self.config.settings.set(name, value);
        self
    }

    /// Add or replace a resource limit.
    pub fn limit(mut self, name: impl Into<String>, value: impl Into<SettingValue>) -> Self {
        self.config.limits.set(name, value);
        self
    }

    pub fn compression(mut self, method: CompressionMethod) -> Self {
        self.config.compression = method;
        self
    }

    pub fn strict_native(mut self, strict: bool) -> Self {
        self.config.strict_native = strict;
        self
    }

    pub fn block_rows(mut self, rows: u64) -> Self {
        self.config.block_rows = rows;
        self
    }

    pub fn block_bytes(mut self, bytes: usize) -> Self {
        self.config.block_bytes = bytes;
        self
    }

    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.config.tcp_nodelay = enabled;
        self
    }

    pub fn compression_threads(mut self, threads: usize) -> Self {
        self.config.compression_threads = threads;
        self
    }

    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.config.client_name = name.into();
        self
    }

    /// Validate and freeze the configuration.
    pub fn build(self) -> Result<SessionConfig, ConfigError> {
        let config = self.config;
        if config.host.is_empty() {
            return Err(ConfigError::InvalidAddress("host must not be empty".to_string()));
        }
        if config.block_rows == 0 {
            return Err(ConfigError::Invalid("block_rows must be at least 1".to_string()));
        }
        if config.block_bytes == 0 {
            return Err(ConfigError::Invalid("block_bytes must be at least 1".to_string()));
        }
        if config.compression_threads == 0 {
            return Err(ConfigError::Invalid("compression_threads must be at least 1".to_string()));
        }
        if config.settings.contains(COMPRESSION_SETTING) || config.limits.contains(COMPRESSION_SETTING) {
            return Err(ConfigError::Invalid(format!(
                "'{}' is derived from the compression field; set that instead",
                COMPRESSION_SETTING
            )));
        }
        Ok(config)
    }
}

/// On-disk shape of the config file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    host: Option<String>,
    port: Option<u16>,
    database: Option<String>,
    username: Option<String>,
    password: Option<String>,
    compression: Option<CompressionMethod>,
    strict_native: Option<bool>,
    block_rows: Option<u64>,
    block_bytes: Option<usize>,
    tcp_nodelay: Option<bool>,
    compression_threads: Option<usize>,
    client_name: Option<String>,
    settings: toml::Table,
    limits: toml::Table,
}

impl FileConfig {
    fn into_builder(self) -> Result<SessionConfigBuilder, ConfigError> {
        let mut b = SessionConfig::builder();
        if let Some(v) = self.host {
            b = b.host(v);
        }
        if let Some(v) = self.port {
            b = b.port(v);
        }
        if let Some(v) = self.database {
            b = b.database(v);
        }
        if let Some(v) = self.username {
            b = b.username(v);
        }
        if let Some(v) = self.password {
            b = b.password(v);
        }
        if let Some(v) = self.compression {
            b = b.compression(v);
        }
        if let Some(v) = self.strict_native {
            b = b.strict_native(v);
        }
        if let Some(v) = self.block_rows {
            b = b.block_rows(v);
        }
        if let Some(v) = self.block_bytes {
            b = b.block_bytes(v);
        }
        if let Some(v) = self.tcp_nodelay {
            b = b.tcp_nodelay(v);
        }
        if let Some(v) = self.compression_threads {
            b = b.compression_threads(v);
        }
        if let Some(v) = self.client_name {
            b = b.client_name(v);
        }
        // Tables keep file order, which is the order sent on the wire.
        for (name, value) in self.settings {
            b = b.setting(name, value.try_into::<SettingValue>()?);
        }
        for (name, value) in self.limits {
            b = b.limit(name, value.try_into::<SettingValue>()?);
        }
        Ok(b)
    }
}
