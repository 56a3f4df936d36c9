//! protonkit: an async client for the Proton native protocol.
//!
//! ```no_run
//! use protonkit::{Context, Options, Pool, Value};
//!
//! # async fn run() -> protonkit::Result<()> {
//! let pool = Pool::open(Options::from_dsn("proton://default@127.0.0.1:8463/default")?)?;
//! let ctx = Context::new();
//!
//! let mut batch = pool.prepare_batch(&ctx, "INSERT INTO events (id, name)").await?;
//! batch.append(&[Value::UInt64(1), "started".into()])?;
//! batch.send().await?;
//!
//! for row in pool.query(&ctx, "SELECT id, name FROM events", &[]).await? {
//!     let id: u64 = row.get(0)?;
//!     let name: String = row.get_by_name("name")?;
//!     println!("{id} {name}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod bind;
pub mod column;
pub mod connection;
pub mod context;
pub mod error;
pub mod options;
pub mod pool;
pub mod proto;
pub mod rows;
pub mod streaming;
pub mod types;

#[cfg(test)]
mod tests;

pub use batch::{Batch, ColumnWriter};
pub use bind::Param;
pub use column::json_path::nest_json;
pub use column::{new_column, Column, ConverterError};
pub use connection::Connection;
pub use context::{CancelHandle, Context};
pub use error::{Error, Exception, Result};
pub use options::{ConnOpenStrategy, Options};
pub use pool::{Pool, PooledConnection, Stats};
pub use proto::{Block, CompressionMethod, Compressor, ProfileInfo, Progress, ServerVersion};
pub use rows::{Row, Rows};
pub use streaming::StreamingBuffer;
pub use types::{Decimal, FromValue, Value};

/// Open a pool. Shorthand for [`Pool::open`].
pub fn open(opts: Options) -> Result<Pool> {
    Pool::open(opts)
}
