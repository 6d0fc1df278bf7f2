//! QAIL ClickHouse - native-protocol driver for streaming inserts.
//!
//! Two layers:
//! - [`protocol`]: pure, sync packet and block codecs (no I/O)
//! - [`driver`]: tokio connections, handshake, backpressured inserts
//!
//! # Example
//! ```no_run
//! use futures_util::stream;
//! use qail_ch::driver::{BoxError, ChClient, ColumnEncoder, SessionConfig};
//! use qail_ch::protocol::{Column, tag};
//!
//! struct Ids;
//!
//! impl ColumnEncoder<u32> for Ids {
//!     fn column_count(&self) -> usize {
//!         1
//!     }
//!
//!     fn encode_column(&self, rows: &[u32], _position: usize) -> Result<Column, BoxError> {
//!         let data: Vec<u8> = rows.iter().flat_map(|v| v.to_le_bytes()).collect();
//!         Ok(Column::new(tag::UINT32, "id", data))
//!     }
//! }
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ChClient::new(SessionConfig::builder().host("localhost").build()?);
//!     let batches = stream::iter(vec![Ok::<_, BoxError>(vec![1u32, 2, 3])]);
//!     let summary = client.send_data("INSERT INTO ids (id) VALUES", batches, Ids)?.await?;
//!     println!("{} rows in {} blocks", summary.rows, summary.blocks);
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod driver;
pub mod protocol;

pub use driver::{ChClient, ChConnection, ChError, ChResult, InsertOperation, InsertSummary, SessionConfig};
pub use protocol::{Block, Column, CompressionMethod};
