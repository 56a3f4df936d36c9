//! A single native-protocol session.
//!
//! A [`Connection`] owns the write half of the socket and, most of the time, a
//! [`PacketReader`] over the read half. Streaming inserts lend the reader to a background
//! task so server acknowledgements are drained while the caller keeps writing.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use once_cell::sync::Lazy;
use tokio::io::{AsyncReadExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::bind::{bind, Param};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::options::Options;
use crate::proto::{
    encode_data, revision, Block, ClientHello, ClientPacket, Compressor, Decoder, Encoder,
    Packet, ProfileInfo, Progress, Query, ServerVersion,
};
use crate::rows::Rows;

/// Bytes reserved per socket read.
const READ_CHUNK: usize = 64 * 1024;

static CLIENT_HOST: Lazy<(String, String)> = Lazy::new(|| {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default();
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    (user, host)
});

// ============================================================================
// Packet reader
// ============================================================================

/// Everything a query produced besides the exception path.
#[derive(Debug, Default)]
pub(crate) struct Received {
    pub blocks: Vec<Block>,
    pub totals: Option<Block>,
    pub extremes: Option<Block>,
    pub progress: Option<Progress>,
    pub profile_info: Option<ProfileInfo>,
}

/// Read half of a connection plus the bytes received but not yet decoded.
#[derive(Debug)]
pub(crate) struct PacketReader {
    stream: OwnedReadHalf,
    buffer: BytesMut,
    revision: u64,
    compressor: Option<Arc<dyn Compressor>>,
    conn_id: u64,
    debug: bool,
}

impl PacketReader {
    /// Read one whole packet. A packet that is not fully buffered yet is decoded again from
    /// its start, but only once the buffer reaches the length the failed attempt ran short
    /// of and everything already sitting in the socket has been pulled in.
    pub(crate) async fn read_packet(&mut self) -> Result<Packet> {
        let mut needed = 1;
        loop {
            if self.buffer.len() >= needed {
                let mut decoder = Decoder::new(&self.buffer);
                match Packet::decode(&mut decoder, self.revision, self.compressor.as_deref()) {
                    Ok(packet) => {
                        let consumed = decoder.position();
                        self.buffer.advance(consumed);
                        if self.debug {
                            trace!(conn_id = self.conn_id, packet = packet.name(), "received packet");
                        }
                        return Ok(packet);
                    }
                    Err(Error::UnexpectedEof) => needed = decoder.needed(),
                    Err(err) => return Err(err),
                }
            }

            self.buffer.reserve(READ_CHUNK);
            let n = self.stream.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Err(if self.buffer.is_empty() {
                    Error::ConnectionClosed
                } else {
                    Error::UnexpectedEof
                });
            }
            self.read_ready(needed)?;
        }
    }

    /// Append bytes that have already arrived without waiting for more. Stops once the
    /// buffer has doubled past `needed` so a fast sender still gets decoded incrementally.
    fn read_ready(&mut self, needed: usize) -> Result<()> {
        let limit = needed.max(self.buffer.len()).saturating_mul(2);
        while self.buffer.len() < limit {
            self.buffer.reserve(READ_CHUNK);
            match self.stream.try_read_buf(&mut self.buffer) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Drain a query response up to EndOfStream.
    pub(crate) async fn process(&mut self, ctx: &Context, keep_data: bool) -> Result<Received> {
        let mut received = Received::default();
        loop {
            match self.read_packet().await? {
                Packet::Data(block) => {
                    if keep_data {
                        received.blocks.push(block);
                    }
                }
                Packet::Totals(block) => received.totals = Some(block),
                Packet::Extremes(block) => received.extremes = Some(block),
                Packet::Progress(progress) => {
                    ctx.progress(&progress);
                    received.progress = Some(progress);
                }
                Packet::ProfileInfo(info) => {
                    ctx.profile_info(&info);
                    received.profile_info = Some(info);
                }
                Packet::Exception(exception) => return Err(exception.into()),
                Packet::EndOfStream => return Ok(received),
                Packet::Log(block) => self.log_server_lines(&block),
                Packet::ProfileEvents(_) | Packet::TableColumns { .. } | Packet::PartUuids(_) => {}
                other => {
                    return Err(Error::protocol(format!(
                        "unexpected packet {} in query response",
                        other.name()
                    )))
                }
            }
        }
    }

    /// Read up to the first Data block of an insert, which carries the table schema.
    pub(crate) async fn first_block(&mut self, ctx: &Context) -> Result<Block> {
        loop {
            match self.read_packet().await? {
                Packet::Data(block) => return Ok(block),
                Packet::Progress(progress) => ctx.progress(&progress),
                Packet::ProfileInfo(info) => ctx.profile_info(&info),
                Packet::Exception(exception) => return Err(exception.into()),
                Packet::Log(block) => self.log_server_lines(&block),
                Packet::ProfileEvents(_) | Packet::TableColumns { .. } | Packet::PartUuids(_) => {}
                other => {
                    return Err(Error::protocol(format!(
                        "unexpected packet {} before insert schema",
                        other.name()
                    )))
                }
            }
        }
    }

    fn log_server_lines(&self, block: &Block) {
        let (Some(text), source, priority) = (
            block.column_by_name("text"),
            block.column_by_name("source"),
            block.column_by_name("priority"),
        ) else {
            return;
        };
        for i in 0..block.rows() {
            let line = text.row(i);
            let source = source.map(|c| c.row(i)).unwrap_or_default();
            let priority = priority.map(|c| c.row(i)).unwrap_or_default();
            debug!(
                conn_id = self.conn_id,
                source = source.as_str().unwrap_or(""),
                priority = ?priority,
                "server: {}",
                line.as_str().unwrap_or("")
            );
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

/// One session with a server.
///
/// A connection serves a single caller at a time. Any transport or decoding failure marks
/// it bad; the pool closes bad connections instead of reusing them.
pub struct Connection {
    id: u64,
    addr: String,
    opts: Arc<Options>,
    reader: Option<PacketReader>,
    writer: BufWriter<OwnedWriteHalf>,
    encoder: Encoder,
    compressor: Option<Arc<dyn Compressor>>,
    server: ServerVersion,
    revision: u64,
    connected_at: Instant,
    bad: bool,
    /// A query was sent and its response has not been read to the end.
    pending: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("server", &self.server)
            .field("revision", &self.revision)
            .field("bad", &self.bad)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Open a session to `addr` and run the handshake, bounded by the dial timeout.
    pub async fn dial(addr: &str, id: u64, opts: Arc<Options>) -> Result<Self> {
        let timeout = opts.dial_timeout;
        match tokio::time::timeout(timeout, Self::connect(addr, id, opts)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("dial {} timed out after {:?}", addr, timeout),
            ))),
        }
    }

    async fn connect(addr: &str, id: u64, opts: Arc<Options>) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let compressor = opts.block_compressor();
        let mut conn = Connection {
            id,
            addr: addr.to_string(),
            reader: Some(PacketReader {
                stream: read_half,
                buffer: BytesMut::with_capacity(READ_CHUNK),
                revision: revision::CLIENT,
                compressor: compressor.clone(),
                conn_id: id,
                debug: opts.debug,
            }),
            writer: BufWriter::new(write_half),
            encoder: Encoder::new(),
            compressor,
            server: ServerVersion::default(),
            revision: revision::CLIENT,
            connected_at: Instant::now(),
            bad: false,
            pending: false,
            opts,
        };
        conn.handshake().await?;
        Ok(conn)
    }

    async fn handshake(&mut self) -> Result<()> {
        ClientHello {
            database: &self.opts.database,
            username: &self.opts.username,
            password: &self.opts.password,
        }
        .encode(&mut self.encoder);
        self.flush().await?;

        let server = match self.reader_mut()?.read_packet().await? {
            Packet::Hello(server) => server,
            Packet::Exception(exception) => return Err(exception.into()),
            other => {
                return Err(Error::protocol(format!(
                    "unexpected packet {} during handshake",
                    other.name()
                )))
            }
        };
        if server.revision < revision::MIN_SERVER {
            warn!(
                conn_id = self.id,
                addr = %self.addr,
                revision = server.revision,
                "server revision is too old"
            );
            return Err(Error::UnsupportedServerRevision);
        }

        self.revision = server.revision.min(revision::CLIENT);
        if let Some(reader) = self.reader.as_mut() {
            reader.revision = self.revision;
        }
        debug!(conn_id = self.id, addr = %self.addr, server = %server, "connected");
        self.server = server;
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn server_version(&self) -> &ServerVersion {
        &self.server
    }

    pub fn is_bad(&self) -> bool {
        self.bad
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending
    }

    pub(crate) fn is_expired(&self, lifetime: Duration) -> bool {
        self.connected_at.elapsed() >= lifetime
    }

    /// Run a query and collect every result block.
    pub async fn query(&mut self, ctx: &Context, query: &str, params: &[Param]) -> Result<Rows> {
        let body = bind(query, params)?;
        let result = ctx.run(self.query_inner(ctx, &body)).await;
        self.track(result)
    }

    async fn query_inner(&mut self, ctx: &Context, body: &str) -> Result<Rows> {
        self.send_query(ctx, body).await?;
        let received = self.receive(ctx, true).await?;
        Ok(Rows::from(received))
    }

    /// Run a statement, discarding any result blocks.
    pub async fn exec(&mut self, ctx: &Context, query: &str, params: &[Param]) -> Result<()> {
        let body = bind(query, params)?;
        let result = ctx
            .run(async {
                self.send_query(ctx, &body).await?;
                self.receive(ctx, false).await.map(drop)
            })
            .await;
        self.track(result)
    }

    /// Round-trip a Ping. A context deadline surfaces as [`Error::DeadlineExceeded`].
    pub async fn ping(&mut self, ctx: &Context) -> Result<()> {
        let result = ctx.run(self.ping_inner()).await;
        self.track(result)
    }

    async fn ping_inner(&mut self) -> Result<()> {
        ClientPacket::Ping.encode(&mut self.encoder);
        self.flush().await?;
        loop {
            match self.reader_mut()?.read_packet().await? {
                Packet::Pong => return Ok(()),
                Packet::Progress(_) => {}
                Packet::Exception(exception) => return Err(exception.into()),
                other => {
                    return Err(Error::protocol(format!(
                        "unexpected packet {} in response to ping",
                        other.name()
                    )))
                }
            }
        }
    }

    /// Close the socket.
    pub fn close(self) {
        debug!(conn_id = self.id, addr = %self.addr, "closing connection");
    }

    // ------------------------------------------------------------------------
    // Insert plumbing
    // ------------------------------------------------------------------------

    /// Send the `INSERT ... VALUES` prefix and return the empty block describing the target.
    pub(crate) async fn prepare_insert(&mut self, ctx: &Context, query: &str) -> Result<Block> {
        let body = insert_prefix(query);
        let result = ctx
            .run(async {
                self.send_query(ctx, &body).await?;
                let first = self.reader_mut()?.first_block(ctx).await;
                if matches!(first, Err(Error::Exception(_))) {
                    self.pending = false;
                }
                first
            })
            .await;
        self.track(result)
    }

    /// Send `block` (when it has rows) and the end-of-insert marker, then wait for the server
    /// to finish.
    pub(crate) async fn send_insert(&mut self, ctx: &Context, block: &Block) -> Result<()> {
        let result = ctx
            .run(async {
                if block.rows() > 0 {
                    self.write_data(block)?;
                }
                self.write_data(&Block::new())?;
                self.flush().await?;
                self.receive(ctx, false).await.map(drop)
            })
            .await;
        self.track(result)
    }

    /// Buffer a Data packet without flushing.
    pub(crate) fn write_data(&mut self, block: &Block) -> Result<()> {
        let result = encode_data(
            &mut self.encoder,
            block,
            self.revision,
            self.compressor.as_deref(),
        );
        self.track(result)
    }

    pub(crate) async fn flush(&mut self) -> Result<()> {
        let result = self.encoder.flush(&mut self.writer).await;
        self.track(result)
    }

    /// Lend the read half to a background task.
    pub(crate) fn take_reader(&mut self) -> Result<PacketReader> {
        self.reader.take().ok_or(Error::ConnectionClosed)
    }

    pub(crate) fn restore_reader(&mut self, reader: PacketReader) {
        self.reader = Some(reader);
    }

    /// Record the outcome of a response drained outside the connection.
    pub(crate) fn finish_response<T>(&mut self, result: Result<T>) -> Result<T> {
        if matches!(result, Ok(_) | Err(Error::Exception(_))) {
            self.pending = false;
        }
        self.track(result)
    }

    pub(crate) fn mark_bad(&mut self) {
        self.bad = true;
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    async fn send_query(&mut self, ctx: &Context, body: &str) -> Result<()> {
        if self.pending {
            return Err(Error::protocol("previous query response was not read"));
        }
        let query_id = ctx
            .query_id()
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut settings = self.opts.settings.clone();
        for (name, value) in ctx.settings() {
            match settings.iter_mut().find(|(n, _)| n == name) {
                Some(slot) => slot.1 = value.clone(),
                None => settings.push((name.clone(), value.clone())),
            }
        }

        debug!(conn_id = self.id, query_id = %query_id, "sending query");
        let (os_user, hostname) = &*CLIENT_HOST;
        self.encoder.reset();
        Query {
            id: &query_id,
            body,
            quota_key: ctx.quota_key().unwrap_or(""),
            settings: &settings,
            compression: self.compressor.is_some(),
            os_user,
            hostname,
        }
        .encode(&mut self.encoder, self.revision);
        self.write_data(&Block::new())?;
        self.pending = true;
        self.flush().await
    }

    async fn receive(&mut self, ctx: &Context, keep_data: bool) -> Result<Received> {
        let result = self.reader_mut()?.process(ctx, keep_data).await;
        if matches!(result, Ok(_) | Err(Error::Exception(_))) {
            self.pending = false;
        }
        result
    }

    fn reader_mut(&mut self) -> Result<&mut PacketReader> {
        self.reader.as_mut().ok_or(Error::ConnectionClosed)
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_connection_fatal() && !self.bad {
                debug!(conn_id = self.id, error = %err, "marking connection bad");
                self.bad = true;
            }
        }
        result
    }
}

/// Cut an insert statement before any inline rows and make it end in `VALUES`; the rows
/// travel as blocks.
fn insert_prefix(query: &str) -> String {
    let head = match values_clause(query) {
        Some(i) => &query[..i],
        None => query,
    };
    let head = head.trim_end();
    if ends_with_values(head) {
        head.to_string()
    } else {
        format!("{} VALUES", head)
    }
}

/// Byte offset of the whitespace that opens a `VALUES (` clause.
fn values_clause(query: &str) -> Option<usize> {
    let bytes = query.as_bytes();
    (0..bytes.len()).find(|&i| {
        if !bytes[i].is_ascii_whitespace() {
            return false;
        }
        let Some(keyword) = bytes.get(i + 1..i + 7) else {
            return false;
        };
        keyword.eq_ignore_ascii_case(b"VALUES")
            && bytes[i + 7..]
                .iter()
                .find(|b| !b.is_ascii_whitespace())
                .is_some_and(|b| *b == b'(')
    })
}

fn ends_with_values(head: &str) -> bool {
    let bytes = head.as_bytes();
    let Some(start) = bytes.len().checked_sub(6) else {
        return false;
    };
    bytes[start..].eq_ignore_ascii_case(b"VALUES")
        && (start == 0 || bytes[start - 1].is_ascii_whitespace() || bytes[start - 1] == b')')
}
