//! ClickHouse Native Protocol (Layer 2: Pure, Sync)
//!
//! This module contains the pure, synchronous packet and block codecs.
//! No async, no I/O, no tokio - just packets ↔ bytes computation.

pub mod block;
pub mod client;
pub mod codec;
pub mod compression;
pub mod error;
pub mod server;
pub mod settings;
pub mod types;
pub mod wire;

pub use block::{Block, BlockCodec, BlockInfo, Column};
pub use client::{AuthData, ClientHello, ClientInfo, ClientPacket, Query};
pub use codec::{CodecContext, PacketCodec};
pub use compression::CompressionMethod;
pub use error::EncodeError;
pub use server::{DataPacket, ProfileInfo, Progress, ServerException, ServerHello, ServerPacket};
pub use settings::{Limits, SettingKind, SettingValue, Settings, known_setting_kind};
pub use types::{name_to_tag, tag, tag_to_name};
pub use wire::{WireError, WireReader, WireWrite};

/// Protocol revisions that gate optional fields.
pub mod revision {
    /// Revision this client speaks.
    pub const CLIENT_REVISION: u64 = 54327;

    pub const TOTAL_ROWS_IN_PROGRESS: u64 = 51554;
    pub const BLOCK_INFO: u64 = 51903;
    pub const CLIENT_INFO: u64 = 54032;
    pub const SERVER_TIMEZONE: u64 = 54058;
    pub const QUOTA_KEY_IN_CLIENT_INFO: u64 = 54060;
    pub const SERVER_DISPLAY_NAME: u64 = 54372;
    pub const VERSION_PATCH: u64 = 54401;
    pub const CLIENT_WRITE_INFO: u64 = 54420;
}
