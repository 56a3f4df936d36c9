//! Connection pool.
//!
//! The pool bounds open connections with a semaphore (`max_open_conns` permits) and keeps
//! up to `max_idle_conns` released connections for reuse. Acquiring takes a permit first,
//! then an idle connection, dialing a new one when none is usable.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::batch::Batch;
use crate::bind::Param;
use crate::connection::Connection;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::options::{ConnOpenStrategy, Options};
use crate::proto::ServerVersion;
use crate::rows::{Row, Rows};
use crate::streaming::StreamingBuffer;

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection checked out from the pool.
///
/// The connection goes back to the pool on [`PooledConnection::release`] or when dropped.
pub struct PooledConnection {
    conn: Option<Connection>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    /// The underlying connection, until released.
    pub fn conn(&mut self) -> Result<&mut Connection> {
        self.conn.as_mut().ok_or(Error::ConnectionClosed)
    }

    pub fn is_released(&self) -> bool {
        self.conn.is_none()
    }

    /// Hand the connection back. Any error closes it instead of keeping it idle.
    ///
    /// Releasing twice is a no-op.
    pub fn release(&mut self, err: Option<&Error>) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        self.pool.put(conn, err);
        self.permit.take();
    }

    pub async fn query(&mut self, ctx: &Context, query: &str, params: &[Param]) -> Result<Rows> {
        self.conn()?.query(ctx, query, params).await
    }

    pub async fn exec(&mut self, ctx: &Context, query: &str, params: &[Param]) -> Result<()> {
        self.conn()?.exec(ctx, query, params).await
    }

    pub async fn ping(&mut self, ctx: &Context) -> Result<()> {
        self.conn()?.ping(ctx).await
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.release(None);
    }
}

// ============================================================================
// Pool Inner
// ============================================================================

struct PoolInner {
    opts: Arc<Options>,
    /// One permit per connection that may be open.
    open: Arc<Semaphore>,
    idle: Mutex<Vec<Connection>>,
    conn_id: AtomicU64,
    closed: AtomicBool,
}

impl PoolInner {
    fn put(&self, conn: Connection, err: Option<&Error>) {
        let reason = if let Some(err) = err {
            Some(format!("released with error: {}", err))
        } else if conn.is_bad() {
            Some("bad connection".to_string())
        } else if conn.is_pending() {
            Some("response not fully read".to_string())
        } else if conn.is_expired(self.opts.conn_max_lifetime) {
            Some("max lifetime reached".to_string())
        } else {
            None
        };
        if let Some(reason) = reason {
            debug!(conn_id = conn.id(), reason = %reason, "closing connection");
            conn.close();
            return;
        }

        let mut idle = self.idle.lock();
        if self.closed.load(Ordering::Acquire) {
            drop(idle);
            debug!(conn_id = conn.id(), "pool closed, closing connection");
            conn.close();
        } else if idle.len() < self.opts.max_idle_conns {
            idle.push(conn);
        } else {
            drop(idle);
            debug!(conn_id = conn.id(), "idle pool full, closing connection");
            conn.close();
        }
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Snapshot of pool usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Connections checked out plus idle ones.
    pub open: usize,
    pub idle: usize,
    pub max_open: usize,
    pub max_idle: usize,
}

/// A pool of connections over the configured addresses.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("opts", &self.inner.opts)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Pool {
    /// Validate `opts` and create an empty pool. Nothing is dialed until first use.
    pub fn open(opts: Options) -> Result<Self> {
        let opts = opts.validate()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                open: Arc::new(Semaphore::new(opts.max_open_conns)),
                idle: Mutex::new(Vec::with_capacity(opts.max_idle_conns)),
                conn_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                opts: Arc::new(opts),
            }),
        })
    }

    pub fn options(&self) -> &Options {
        &self.inner.opts
    }

    /// Check out a connection.
    ///
    /// The wait for a free slot is bounded by the dial timeout and fails with
    /// [`Error::AcquireConnTimeout`]. The context only bounds that wait when
    /// `acquire_honors_cancellation` is set.
    pub async fn acquire(&self, ctx: &Context) -> Result<PooledConnection> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        let deadline = Instant::now() + self.inner.opts.dial_timeout;
        let wait = async {
            match tokio::time::timeout_at(deadline, Arc::clone(&self.inner.open).acquire_owned())
                .await
            {
                Ok(Ok(permit)) => Ok(permit),
                Ok(Err(_)) => Err(Error::PoolClosed),
                Err(_) => Err(Error::AcquireConnTimeout),
            }
        };
        let permit = if self.inner.opts.acquire_honors_cancellation {
            ctx.run(wait).await?
        } else {
            wait.await?
        };

        let idle = self.inner.idle.lock().pop();
        let conn = match idle {
            Some(conn) if !conn.is_bad() && !conn.is_expired(self.inner.opts.conn_max_lifetime) => {
                conn
            }
            Some(conn) => {
                debug!(conn_id = conn.id(), "discarding unusable idle connection");
                conn.close();
                self.dial().await?
            }
            None => self.dial().await?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            permit: Some(permit),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Dial the configured addresses until one accepts.
    async fn dial(&self) -> Result<Connection> {
        let opts = &self.inner.opts;
        let id = self.inner.conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let count = opts.addrs.len();
        let mut last_err = None;
        for i in 0..count {
            let index = match opts.conn_open_strategy {
                ConnOpenStrategy::InOrder => i,
                ConnOpenStrategy::RoundRobin => (id as usize).wrapping_add(i) % count,
            };
            let addr = &opts.addrs[index];
            debug!(conn_id = id, addr = %addr, "dialing");
            match Connection::dial(addr, id, Arc::clone(opts)).await {
                Ok(conn) => return Ok(conn),
                Err(err) => {
                    warn!(conn_id = id, addr = %addr, error = %err, "dial failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Config("no addresses configured".to_string())))
    }

    /// Run a query on a pooled connection.
    pub async fn query(&self, ctx: &Context, query: &str, params: &[Param]) -> Result<Rows> {
        let mut conn = self.acquire(ctx).await?;
        let result = conn.query(ctx, query, params).await;
        conn.release(result.as_ref().err());
        result
    }

    /// First row of a query, or [`Error::NoRows`].
    pub async fn query_row(&self, ctx: &Context, query: &str, params: &[Param]) -> Result<Row> {
        self.query(ctx, query, params)
            .await?
            .next()
            .ok_or(Error::NoRows)
    }

    pub async fn exec(&self, ctx: &Context, query: &str, params: &[Param]) -> Result<()> {
        let mut conn = self.acquire(ctx).await?;
        let result = conn.exec(ctx, query, params).await;
        conn.release(result.as_ref().err());
        result
    }

    /// Run an insert through the server's async insert queue.
    pub async fn async_insert(&self, ctx: &Context, query: &str, wait: bool) -> Result<()> {
        let ctx = ctx
            .clone()
            .with_setting("async_insert", 1)
            .with_setting("wait_for_async_insert", u8::from(wait));
        self.exec(&ctx, query, &[]).await
    }

    /// Start a single-use insert into the table named by `query`.
    pub async fn prepare_batch(&self, ctx: &Context, query: &str) -> Result<Batch> {
        let (conn, block) = self.prepare_insert(ctx, query).await?;
        Ok(Batch::new(ctx.clone(), conn, block))
    }

    /// Start an insert that can be flushed many times over one session.
    pub async fn prepare_streaming_buffer(
        &self,
        ctx: &Context,
        query: &str,
    ) -> Result<StreamingBuffer> {
        let (conn, block) = self.prepare_insert(ctx, query).await?;
        Ok(StreamingBuffer::new(ctx.clone(), conn, block))
    }

    async fn prepare_insert(
        &self,
        ctx: &Context,
        query: &str,
    ) -> Result<(PooledConnection, crate::proto::Block)> {
        let mut conn = self.acquire(ctx).await?;
        let result = conn.conn()?.prepare_insert(ctx, query).await;
        match result {
            Ok(block) => Ok((conn, block)),
            Err(err) => {
                conn.release(Some(&err));
                Err(err)
            }
        }
    }

    pub async fn ping(&self, ctx: &Context) -> Result<()> {
        let mut conn = self.acquire(ctx).await?;
        let result = conn.ping(ctx).await;
        conn.release(result.as_ref().err());
        result
    }

    /// Handshake details of the server a pooled connection is bound to.
    pub async fn server_version(&self, ctx: &Context) -> Result<ServerVersion> {
        let mut conn = self.acquire(ctx).await?;
        let version = conn.conn()?.server_version().clone();
        conn.release(None);
        Ok(version)
    }

    pub fn stats(&self) -> Stats {
        let max_open = self.inner.opts.max_open_conns;
        let in_use = max_open.saturating_sub(self.inner.open.available_permits());
        let idle = self.inner.idle.lock().len();
        Stats {
            open: in_use + idle,
            idle,
            max_open,
            max_idle: self.inner.opts.max_idle_conns,
        }
    }

    /// Close idle connections and refuse new checkouts.
    ///
    /// Checked-out connections are not interrupted; they are closed when released.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.open.close();
        let connections = std::mem::take(&mut *self.inner.idle.lock());
        debug!(idle = connections.len(), "closing pool");
        for conn in connections {
            conn.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::CompressionMethod;

    #[test]
    fn test_open_applies_defaults() {
        let pool = Pool::open(Options::new().max_idle_conns(2)).unwrap();
        assert_eq!(
            pool.stats(),
            Stats {
                open: 0,
                idle: 0,
                max_open: 7,
                max_idle: 2
            }
        );
        assert_eq!(pool.options().addrs, vec!["127.0.0.1:8463"]);
    }

    #[test]
    fn test_open_rejects_invalid_options() {
        let mut opts = Options::new();
        opts.compression = CompressionMethod::Zstd;
        assert!(matches!(Pool::open(opts), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_closed_pool_refuses_acquire() {
        let pool = Pool::open(Options::new()).unwrap();
        pool.close();
        assert!(matches!(
            pool.acquire(&Context::new()).await,
            Err(Error::PoolClosed)
        ));
    }
}
