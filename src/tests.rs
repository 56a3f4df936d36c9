//! Protocol tests against an in-process mock server.
//!
//! The mock speaks the server half of the protocol over a real TCP socket, so these tests
//! exercise dialing, the handshake, pooling, queries and inserts end to end.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::proto::{
    encode_exception, encode_server_data, revision, Decoder, Encoder, ServerPacket,
};
use crate::*;

// ============================================================================
// Mock server
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientQuery {
    id: String,
    body: String,
    settings: Vec<(String, String)>,
}

#[derive(Debug)]
enum ClientMsg {
    Query(ClientQuery),
    Data(Block),
    Ping,
    Cancel,
}

struct ServerConn {
    stream: TcpStream,
    buffer: BytesMut,
}

impl ServerConn {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buffer: BytesMut::new(),
        }
    }

    async fn read<T>(&mut self, parse: fn(&mut Decoder<'_>) -> Result<T>) -> Result<T> {
        loop {
            if !self.buffer.is_empty() {
                let mut dec = Decoder::new(&self.buffer);
                match parse(&mut dec) {
                    Ok(value) => {
                        let consumed = dec.position();
                        self.buffer.advance(consumed);
                        return Ok(value);
                    }
                    Err(Error::UnexpectedEof) => {}
                    Err(err) => return Err(err),
                }
            }
            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
    }

    async fn send(&mut self, write: impl FnOnce(&mut Encoder)) -> Result<()> {
        let mut enc = Encoder::new();
        write(&mut enc);
        enc.flush(&mut self.stream).await
    }

    async fn handshake(&mut self) -> Result<()> {
        self.handshake_as(revision::CLIENT).await
    }

    async fn handshake_as(&mut self, server_revision: u64) -> Result<()> {
        self.read(decode_hello).await?;
        let hello = ServerVersion {
            name: "Proton".to_string(),
            display_name: "mock".to_string(),
            revision: server_revision,
            major: 1,
            minor: 2,
            patch: 3,
            timezone: Some("UTC".to_string()),
        };
        self.send(|enc| hello.encode(enc)).await
    }

    async fn next(&mut self) -> Result<ClientMsg> {
        self.read(decode_client_packet).await
    }

    async fn expect_query(&mut self) -> Result<ClientQuery> {
        let ClientMsg::Query(query) = self.next().await? else {
            return Err(Error::protocol("expected a query"));
        };
        // Every query is followed by an empty data block.
        let block = self.expect_data().await?;
        assert_eq!(block.column_count(), 0);
        Ok(query)
    }

    async fn expect_data(&mut self) -> Result<Block> {
        match self.next().await? {
            ClientMsg::Data(block) => Ok(block),
            other => Err(Error::protocol(format!("expected data, got {:?}", other))),
        }
    }

    async fn data(&mut self, block: &Block) -> Result<()> {
        self.send(|enc| encode_server_data(enc, ServerPacket::Data, block, revision::CLIENT))
            .await
    }

    async fn end_of_stream(&mut self) -> Result<()> {
        self.send(|enc| enc.uvarint(ServerPacket::EndOfStream as u64))
            .await
    }

    async fn exception(&mut self, exception: &Exception) -> Result<()> {
        self.send(|enc| encode_exception(enc, exception)).await
    }
}

fn decode_hello(dec: &mut Decoder<'_>) -> Result<()> {
    assert_eq!(dec.uvarint()?, 0);
    let _client_name = dec.string()?;
    dec.uvarint()?;
    dec.uvarint()?;
    assert_eq!(dec.uvarint()?, revision::CLIENT);
    let _database = dec.string()?;
    let _username = dec.string()?;
    let _password = dec.string()?;
    Ok(())
}

fn decode_client_packet(dec: &mut Decoder<'_>) -> Result<ClientMsg> {
    match dec.uvarint()? {
        1 => {
            let id = dec.string()?;
            skip_client_info(dec)?;
            let mut settings = Vec::new();
            loop {
                let name = dec.string()?;
                if name.is_empty() {
                    break;
                }
                dec.uvarint()?;
                settings.push((name, dec.string()?));
            }
            let _interserver_secret = dec.string()?;
            let _stage = dec.uvarint()?;
            let _compression = dec.bool()?;
            let body = dec.string()?;
            Ok(ClientMsg::Query(ClientQuery { id, body, settings }))
        }
        2 => {
            let _table = dec.string()?;
            Ok(ClientMsg::Data(Block::decode(dec, revision::CLIENT)?))
        }
        3 => Ok(ClientMsg::Cancel),
        4 => Ok(ClientMsg::Ping),
        code => Err(Error::protocol(format!("unknown client packet {}", code))),
    }
}

fn skip_client_info(dec: &mut Decoder<'_>) -> Result<()> {
    dec.u8()?;
    dec.string()?;
    dec.string()?;
    dec.string()?;
    dec.i64()?;
    dec.u8()?;
    dec.string()?;
    dec.string()?;
    dec.string()?;
    dec.uvarint()?;
    dec.uvarint()?;
    dec.uvarint()?;
    dec.string()?;
    dec.uvarint()?;
    dec.uvarint()?;
    assert_eq!(dec.u8()?, 0);
    Ok(())
}

/// Accept connections forever, running `handler` on each.
async fn serve<F, Fut>(handler: F) -> String
where
    F: Fn(ServerConn) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handler = Arc::new(handler);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let _ = handler(ServerConn::new(stream)).await;
            });
        }
    });
    addr
}

/// Handshake, then answer pings and queries with empty results.
async fn answer(mut conn: ServerConn) -> Result<()> {
    conn.handshake().await?;
    loop {
        match conn.next().await? {
            ClientMsg::Ping => conn.send(|enc| enc.uvarint(ServerPacket::Pong as u64)).await?,
            ClientMsg::Query(_) => {
                conn.expect_data().await?;
                conn.end_of_stream().await?;
            }
            other => return Err(Error::protocol(format!("unexpected {:?}", other))),
        }
    }
}

/// An address nothing listens on.
async fn refused_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

fn opts(addr: &str) -> Options {
    Options::new().addr(addr).dial_timeout(Duration::from_secs(2))
}

fn events_schema() -> Block {
    let mut block = Block::new();
    block.add_column("id", "uint32").unwrap();
    block.add_column("name", "string").unwrap();
    block
}

/// Insert handler: sends the schema, forwards every data block to `tx` and acknowledges
/// the end-of-insert marker.
async fn accept_insert(mut conn: ServerConn, tx: mpsc::UnboundedSender<Block>) -> Result<()> {
    conn.handshake().await?;
    loop {
        let query = conn.expect_query().await?;
        assert!(query.body.starts_with("INSERT INTO events"));
        conn.data(&events_schema()).await?;
        loop {
            let block = conn.expect_data().await?;
            if block.column_count() == 0 {
                conn.end_of_stream().await?;
                break;
            }
            let _ = tx.send(block);
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

mod connection {
    use super::*;

    #[tokio::test]
    async fn test_handshake_reports_server_version() {
        let addr = serve(answer).await;
        let pool = Pool::open(opts(&addr)).unwrap();
        let version = pool.server_version(&Context::new()).await.unwrap();
        assert_eq!(version.name, "Proton");
        assert_eq!(version.display_name, "mock");
        assert_eq!(version.to_string(), format!("Proton 1.2.3 ({})", revision::CLIENT));
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_old_server_is_rejected() {
        let addr = serve(|mut conn: ServerConn| async move {
            conn.handshake_as(revision::MIN_SERVER - 1).await
        })
        .await;
        let pool = Pool::open(opts(&addr)).unwrap();
        let err = pool.acquire(&Context::new()).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedServerRevision));
        assert_eq!(pool.stats().open, 0);
    }

    #[tokio::test]
    async fn test_query_collects_blocks_and_progress() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let addr = serve(move |mut conn: ServerConn| {
            let tx = tx.clone();
            async move {
                conn.handshake().await?;
                let query = conn.expect_query().await?;
                let _ = tx.send(query);

                conn.data(&events_schema()).await?;
                conn.send(|enc| {
                    Progress {
                        rows: 2,
                        bytes: 16,
                        total_rows: 2,
                        ..Default::default()
                    }
                    .encode(enc, revision::CLIENT)
                })
                .await?;
                let mut block = events_schema();
                block.append_row(&[Value::UInt32(2), "b".into()])?;
                block.append_row(&[Value::UInt32(3), "c".into()])?;
                conn.data(&block).await?;
                conn.send(|enc| {
                    ProfileInfo {
                        rows: 2,
                        blocks: 1,
                        ..Default::default()
                    }
                    .encode(enc)
                })
                .await?;
                conn.end_of_stream().await?;
                answer_rest(conn).await
            }
        })
        .await;

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let ctx = Context::new()
            .with_query_id("q-1")
            .with_setting("max_threads", 8)
            .with_progress(move |p| {
                counter.fetch_add(p.rows as usize, Ordering::SeqCst);
            });
        let pool = Pool::open(opts(&addr).setting("max_threads", 4)).unwrap();
        let rows = pool
            .query(&ctx, "SELECT id, name FROM events WHERE id > ?", &[1u32.into()])
            .await
            .unwrap();

        let query = rx.recv().await.unwrap();
        assert_eq!(query.id, "q-1");
        assert_eq!(query.body, "SELECT id, name FROM events WHERE id > 1");
        assert_eq!(
            query.settings,
            vec![("max_threads".to_string(), "8".to_string())]
        );

        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(rows.column_names(), &["id", "name"]);
        assert_eq!(rows.column_types(), &["uint32", "string"]);
        assert_eq!(rows.profile_info().map(|p| p.blocks), Some(1));
        let names: Vec<String> = rows.map(|r| r.get(1).unwrap()).collect();
        assert_eq!(names, vec!["b", "c"]);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_large_block_arriving_in_pieces() {
        const ROWS: u32 = 30_000;
        let addr = serve(|mut conn: ServerConn| async move {
            conn.handshake().await?;
            conn.expect_query().await?;

            let mut block = events_schema();
            for i in 0..ROWS {
                block.append_row(&[Value::UInt32(i), format!("row-{}", i).as_str().into()])?;
            }
            let mut enc = Encoder::new();
            encode_server_data(&mut enc, ServerPacket::Data, &block, revision::CLIENT);
            enc.uvarint(ServerPacket::EndOfStream as u64);
            let bytes = enc.take();
            assert!(bytes.len() > 4 * 64 * 1024);
            for chunk in bytes.chunks(4096) {
                conn.stream.write_all(chunk).await?;
                tokio::task::yield_now().await;
            }
            answer_rest(conn).await
        })
        .await;

        let pool = Pool::open(opts(&addr)).unwrap();
        let rows = pool
            .query(&Context::new(), "SELECT id, name FROM events", &[])
            .await
            .unwrap();
        let ids: Vec<u32> = rows.map(|r| r.get(0).unwrap()).collect();
        assert_eq!(ids.len(), ROWS as usize);
        assert!(ids.iter().enumerate().all(|(i, id)| *id == i as u32));
        assert_eq!(pool.stats().idle, 1);
    }

    /// Keep answering after a scripted exchange so the connection can be pooled.
    async fn answer_rest(mut conn: ServerConn) -> Result<()> {
        loop {
            match conn.next().await? {
                ClientMsg::Ping => conn.send(|enc| enc.uvarint(ServerPacket::Pong as u64)).await?,
                ClientMsg::Query(_) => {
                    conn.expect_data().await?;
                    conn.end_of_stream().await?;
                }
                other => return Err(Error::protocol(format!("unexpected {:?}", other))),
            }
        }
    }

    #[tokio::test]
    async fn test_server_exception_is_structured() {
        let addr = serve(|mut conn: ServerConn| async move {
            conn.handshake().await?;
            conn.expect_query().await?;
            conn.exception(&Exception {
                code: 60,
                name: "DB::Exception".to_string(),
                message: "Table default.missing doesn't exist".to_string(),
                stack_trace: String::new(),
                nested: Some(Box::new(Exception {
                    code: 1000,
                    name: "Poco::Exception".to_string(),
                    message: "inner".to_string(),
                    stack_trace: String::new(),
                    nested: None,
                })),
            })
            .await?;
            answer_rest(conn).await
        })
        .await;

        let pool = Pool::open(opts(&addr)).unwrap();
        let err = pool
            .query(&Context::new(), "SELECT * FROM missing", &[])
            .await
            .unwrap_err();
        let exception = err.as_exception().unwrap();
        assert_eq!(exception.code, 60);
        assert_eq!(exception.nested.as_ref().map(|e| e.code), Some(1000));
        assert!(!err.is_connection_fatal());
        // Released with an error, so not kept.
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn test_malformed_block_poisons_connection() {
        let addr = serve(|mut conn: ServerConn| async move {
            conn.handshake().await?;
            conn.expect_query().await?;
            conn.send(|enc| {
                enc.uvarint(ServerPacket::Data as u64);
                enc.string("");
                enc.uvarint(1);
                enc.bool(false);
                enc.uvarint(2);
                enc.i32(-1);
                enc.uvarint(0);
                enc.uvarint(1);
                enc.uvarint(1);
                enc.string("ids");
                enc.string("array(uint64)");
                enc.u64(1 << 61);
            })
            .await?;
            answer_rest(conn).await
        })
        .await;

        let pool = Pool::open(opts(&addr)).unwrap();
        let ctx = Context::new();
        let mut conn = pool.acquire(&ctx).await.unwrap();
        let err = conn.query(&ctx, "SELECT ids FROM events", &[]).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "{:?}", err);
        assert!(err.is_connection_fatal());
        assert!(conn.conn().unwrap().is_bad());

        // Evicted even when handed back without the error.
        conn.release(None);
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().open, 0);
    }

    #[tokio::test]
    async fn test_query_row_without_rows() {
        let addr = serve(|mut conn: ServerConn| async move {
            conn.handshake().await?;
            conn.expect_query().await?;
            conn.data(&events_schema()).await?;
            conn.end_of_stream().await?;
            answer_rest(conn).await
        })
        .await;
        let pool = Pool::open(opts(&addr)).unwrap();
        let err = pool
            .query_row(&Context::new(), "SELECT id, name FROM events", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoRows));
    }

    #[tokio::test]
    async fn test_ping() {
        let addr = serve(answer).await;
        let pool = Pool::open(opts(&addr)).unwrap();
        pool.ping(&Context::new()).await.unwrap();
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_ping_deadline_is_not_wrapped() {
        let addr = serve(|mut conn: ServerConn| async move {
            conn.handshake().await?;
            let _ = conn.next().await?;
            std::future::pending::<()>().await;
            Ok(())
        })
        .await;
        let pool = Pool::open(opts(&addr)).unwrap();
        let ctx = Context::new().with_timeout(Duration::from_millis(50));
        let err = pool.ping(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn test_exec_and_async_insert_settings() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let addr = serve(move |mut conn: ServerConn| {
            let tx = tx.clone();
            async move {
                conn.handshake().await?;
                loop {
                    let query = conn.expect_query().await?;
                    let _ = tx.send(query);
                    conn.end_of_stream().await?;
                }
            }
        })
        .await;
        let pool = Pool::open(opts(&addr)).unwrap();
        let ctx = Context::new();
        pool.exec(&ctx, "CREATE STREAM IF NOT EXISTS events (id uint32)", &[])
            .await
            .unwrap();
        assert!(rx.recv().await.unwrap().settings.is_empty());

        pool.async_insert(&ctx, "INSERT INTO events VALUES (1)", false)
            .await
            .unwrap();
        let query = rx.recv().await.unwrap();
        assert_eq!(query.body, "INSERT INTO events VALUES (1)");
        assert_eq!(
            query.settings,
            vec![
                ("async_insert".to_string(), "1".to_string()),
                ("wait_for_async_insert".to_string(), "0".to_string()),
            ]
        );
    }
}

// ============================================================================
// Pool
// ============================================================================

mod pool {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_acquire_times_out() {
        let addr = serve(answer).await;
        let pool = Pool::open(
            Options::new()
                .addr(&addr)
                .max_open_conns(1)
                .dial_timeout(Duration::from_millis(50)),
        )
        .unwrap();
        let ctx = Context::new();
        let _held = pool.acquire(&ctx).await.unwrap();

        let start = Instant::now();
        let err = pool.acquire(&ctx).await.unwrap_err();
        let elapsed = start.elapsed();
        assert!(matches!(err, Error::AcquireConnTimeout));
        assert!(elapsed >= Duration::from_millis(45), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1000), "{:?}", elapsed);
    }

    #[tokio::test]
    async fn test_acquire_can_honor_cancellation() {
        let addr = serve(answer).await;
        let pool = Pool::open(
            opts(&addr)
                .max_open_conns(1)
                .dial_timeout(Duration::from_secs(5))
                .acquire_honors_cancellation(true),
        )
        .unwrap();
        let _held = pool.acquire(&Context::new()).await.unwrap();

        let ctx = Context::new().with_timeout(Duration::from_millis(30));
        let err = pool.acquire(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));

        let (ctx, cancel) = Context::new().with_cancel();
        cancel.cancel();
        assert!(matches!(pool.acquire(&ctx).await, Err(Error::Canceled)));
    }

    #[tokio::test]
    async fn test_failover_in_order() {
        let good = serve(answer).await;
        let bad1 = refused_addr().await;
        let bad2 = refused_addr().await;
        let pool = Pool::open(
            opts(&bad1)
                .addrs([bad1.clone(), bad2, good.clone()])
                .conn_open_strategy(ConnOpenStrategy::InOrder),
        )
        .unwrap();
        let mut conn = pool.acquire(&Context::new()).await.unwrap();
        assert_eq!(conn.conn().unwrap().addr(), good);
    }

    #[tokio::test]
    async fn test_all_addresses_down_frees_the_slot() {
        let pool = Pool::open(opts(&refused_addr().await).max_open_conns(1)).unwrap();
        let ctx = Context::new();
        assert!(matches!(pool.acquire(&ctx).await, Err(Error::Io(_))));
        assert!(matches!(pool.acquire(&ctx).await, Err(Error::Io(_))));
        assert_eq!(pool.stats().open, 0);
    }

    #[tokio::test]
    async fn test_round_robin_spreads_connections() {
        let a = serve(answer).await;
        let b = serve(answer).await;
        let pool = Pool::open(
            opts(&a)
                .addrs([a.clone(), b.clone()])
                .conn_open_strategy(ConnOpenStrategy::RoundRobin),
        )
        .unwrap();
        let ctx = Context::new();
        let mut first = pool.acquire(&ctx).await.unwrap();
        let mut second = pool.acquire(&ctx).await.unwrap();
        assert_ne!(
            first.conn().unwrap().addr(),
            second.conn().unwrap().addr()
        );
    }

    #[tokio::test]
    async fn test_open_connections_are_bounded() {
        let addr = serve(answer).await;
        let pool = Pool::open(opts(&addr).max_open_conns(2)).unwrap();
        let in_use = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let in_use = Arc::clone(&in_use);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let mut conn = pool.acquire(&Context::new()).await.unwrap();
                let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_use.fetch_sub(1, Ordering::SeqCst);
                conn.release(None);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(pool.stats().idle <= 2);
    }

    #[tokio::test]
    async fn test_double_release_is_idempotent() {
        let addr = serve(answer).await;
        let pool = Pool::open(opts(&addr)).unwrap();
        let ctx = Context::new();

        let mut conn = pool.acquire(&ctx).await.unwrap();
        let id = conn.conn().unwrap().id();
        conn.release(None);
        conn.release(None);
        conn.release(Some(&Error::UnexpectedEof));
        assert!(conn.is_released());
        drop(conn);
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(pool.stats().open, 1);

        let mut again = pool.acquire(&ctx).await.unwrap();
        assert_eq!(again.conn().unwrap().id(), id);
    }

    #[tokio::test]
    async fn test_release_with_error_closes() {
        let addr = serve(answer).await;
        let pool = Pool::open(opts(&addr)).unwrap();
        let mut conn = pool.acquire(&Context::new()).await.unwrap();
        conn.release(Some(&Error::UnexpectedEof));
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().open, 0);
    }

    #[tokio::test]
    async fn test_expired_connections_are_not_kept() {
        let addr = serve(answer).await;
        let pool = Pool::open(opts(&addr).conn_max_lifetime(Duration::from_millis(1))).unwrap();
        let mut conn = pool.acquire(&Context::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        conn.release(None);
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn test_idle_overflow_is_closed() {
        let addr = serve(answer).await;
        let pool = Pool::open(opts(&addr).max_open_conns(3).max_idle_conns(1)).unwrap();
        let ctx = Context::new();
        let a = pool.acquire(&ctx).await.unwrap();
        let b = pool.acquire(&ctx).await.unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_close_drains_idle() {
        let addr = serve(answer).await;
        let pool = Pool::open(opts(&addr)).unwrap();
        let ctx = Context::new();
        let held = pool.acquire(&ctx).await.unwrap();
        pool.ping(&ctx).await.unwrap();
        assert_eq!(pool.stats().idle, 1);

        pool.close();
        assert_eq!(pool.stats().idle, 0);
        assert!(matches!(pool.acquire(&ctx).await, Err(Error::PoolClosed)));
        // A late release closes instead of pooling.
        drop(held);
        assert_eq!(pool.stats().idle, 0);
    }
}

// ============================================================================
// Batch
// ============================================================================

mod batch {
    use super::*;

    #[tokio::test]
    async fn test_send_is_single_use() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let addr = serve(move |conn| accept_insert(conn, tx.clone())).await;
        let pool = Pool::open(opts(&addr)).unwrap();
        let ctx = Context::new();

        let mut batch = pool
            .prepare_batch(&ctx, "INSERT INTO events (id, name) VALUES")
            .await
            .unwrap();
        assert_eq!(batch.block().types(), vec!["uint32", "string"]);
        batch.append(&[Value::UInt32(1), "a".into()]).unwrap();
        batch.append(&[Value::UInt32(2), "b".into()]).unwrap();
        batch.send().await.unwrap();

        let block = rx.recv().await.unwrap();
        assert_eq!(block.rows(), 2);
        assert_eq!(block.row(1), vec![Value::UInt32(2), "b".into()]);

        assert!(matches!(batch.send().await, Err(Error::BatchAlreadySent)));
        assert!(matches!(batch.abort(), Err(Error::BatchAlreadySent)));
        assert!(matches!(
            batch.append(&[Value::UInt32(3), "c".into()]),
            Err(Error::BatchAlreadySent)
        ));
        assert!(rx.try_recv().is_err());
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_conversion_error_keeps_batch_usable() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let addr = serve(move |conn| accept_insert(conn, tx.clone())).await;
        let pool = Pool::open(opts(&addr)).unwrap();
        let ctx = Context::new();

        let mut batch = pool.prepare_batch(&ctx, "INSERT INTO events").await.unwrap();
        let err = batch
            .append(&[Value::String("x".into()), "a".into()])
            .unwrap_err();
        assert!(matches!(err, Error::Column(ref e) if e.column == "id"));
        assert_eq!(batch.rows(), 0);

        #[derive(serde::Serialize)]
        struct Event {
            id: u32,
            name: String,
        }
        batch
            .append_struct(&Event {
                id: 7,
                name: "seven".to_string(),
            })
            .unwrap();
        batch.column(0).append(&[Value::UInt32(8)]).unwrap();
        batch.column(1).append(&["eight".into()]).unwrap();
        assert!(matches!(
            batch.column(5).append(&[]),
            Err(Error::Op { op: "Column", .. })
        ));
        batch.send().await.unwrap();

        let block = rx.recv().await.unwrap();
        assert_eq!(block.rows(), 2);
        assert_eq!(block.row(0), vec![Value::UInt32(7), "seven".into()]);
    }

    #[tokio::test]
    async fn test_abort_closes_connection() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let addr = serve(move |conn| accept_insert(conn, tx.clone())).await;
        let pool = Pool::open(opts(&addr)).unwrap();
        let ctx = Context::new();

        let mut batch = pool.prepare_batch(&ctx, "INSERT INTO events").await.unwrap();
        batch.append(&[Value::UInt32(1), "a".into()]).unwrap();
        batch.abort().unwrap();
        assert!(matches!(batch.abort(), Err(Error::BatchAlreadySent)));
        assert!(matches!(batch.send().await, Err(Error::BatchAlreadySent)));
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().open, 0);
    }

    #[tokio::test]
    async fn test_prepare_failure_releases() {
        let addr = serve(|mut conn: ServerConn| async move {
            conn.handshake().await?;
            conn.expect_query().await?;
            conn.exception(&Exception {
                code: 60,
                name: "DB::Exception".to_string(),
                message: "no such stream".to_string(),
                stack_trace: String::new(),
                nested: None,
            })
            .await?;
            std::future::pending::<()>().await;
            Ok(())
        })
        .await;
        let pool = Pool::open(opts(&addr)).unwrap();
        let err = pool
            .prepare_batch(&Context::new(), "INSERT INTO missing")
            .await
            .unwrap_err();
        assert_eq!(err.as_exception().map(|e| e.code), Some(60));
        assert_eq!(pool.stats().open, 0);
    }
}

// ============================================================================
// Streaming buffer
// ============================================================================

mod streaming {
    use super::*;

    #[tokio::test]
    async fn test_send_many_then_close() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let addr = serve(move |conn| accept_insert(conn, tx.clone())).await;
        let pool = Pool::open(opts(&addr)).unwrap();
        let ctx = Context::new();

        let mut buffer = pool
            .prepare_streaming_buffer(&ctx, "INSERT INTO events VALUES")
            .await
            .unwrap();
        buffer.append(&[Value::UInt32(1), "a".into()]).unwrap();
        buffer.append(&[Value::UInt32(2), "b".into()]).unwrap();
        buffer.send().await.unwrap();
        assert_eq!(buffer.rows(), 0);
        assert_eq!(buffer.block().types(), vec!["uint32", "string"]);

        buffer.append(&[Value::UInt32(3), "c".into()]).unwrap();
        buffer.send().await.unwrap();
        buffer.append(&[Value::UInt32(4), "d".into()]).unwrap();
        buffer.close().await.unwrap();

        let sizes: Vec<usize> = [
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
        ]
        .iter()
        .map(Block::rows)
        .collect();
        assert_eq!(sizes, vec![2, 1, 1]);

        assert!(matches!(buffer.send().await, Err(Error::StreamingBufferClosed)));
        assert!(matches!(buffer.close().await, Err(Error::StreamingBufferClosed)));
        assert!(matches!(
            buffer.append(&[Value::UInt32(5), "e".into()]),
            Err(Error::StreamingBufferClosed)
        ));
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_replace_by_and_clear() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let addr = serve(move |conn| accept_insert(conn, tx.clone())).await;
        let pool = Pool::open(opts(&addr)).unwrap();
        let ctx = Context::new();

        let mut buffer = pool
            .prepare_streaming_buffer(&ctx, "INSERT INTO events")
            .await
            .unwrap();
        buffer.append(&[Value::UInt32(9), "dropped".into()]).unwrap();
        buffer.clear();
        assert_eq!(buffer.rows(), 0);

        let mut ids = new_column("uint32").unwrap();
        ids.append(&[Value::UInt32(1), Value::UInt32(2)]).unwrap();
        let mut names = new_column("string").unwrap();
        names.append(&["x".into(), "y".into()]).unwrap();
        buffer.replace_by(vec![ids, names]).unwrap();

        let wrong = vec![new_column("string").unwrap(), new_column("string").unwrap()];
        assert!(matches!(
            buffer.replace_by(wrong),
            Err(Error::Op { op: "ReplaceBy", .. })
        ));
        buffer.close().await.unwrap();

        let block = rx.recv().await.unwrap();
        assert_eq!(block.rows(), 2);
        assert_eq!(block.row(1), vec![Value::UInt32(2), "y".into()]);
    }

    #[tokio::test]
    async fn test_close_surfaces_background_error() {
        let addr = serve(|mut conn: ServerConn| async move {
            conn.handshake().await?;
            conn.expect_query().await?;
            conn.data(&events_schema()).await?;
            conn.expect_data().await?;
            conn.exception(&Exception {
                code: 53,
                name: "DB::Exception".to_string(),
                message: "type mismatch".to_string(),
                stack_trace: String::new(),
                nested: None,
            })
            .await?;
            // Drain whatever else the client writes.
            while conn.next().await.is_ok() {}
            Ok(())
        })
        .await;
        let pool = Pool::open(opts(&addr)).unwrap();
        let ctx = Context::new();

        let mut buffer = pool
            .prepare_streaming_buffer(&ctx, "INSERT INTO events")
            .await
            .unwrap();
        buffer.append(&[Value::UInt32(1), "a".into()]).unwrap();
        buffer.send().await.unwrap();
        let err = buffer.close().await.unwrap_err();
        assert_eq!(err.as_exception().map(|e| e.code), Some(53));
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().open, 0);
    }
}
