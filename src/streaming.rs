//! Long-lived inserts flushed many times over one session.
//!
//! The first [`StreamingBuffer::send`] lends the connection's read half to a background task
//! that drains server acknowledgements, so later sends only write. [`StreamingBuffer::close`]
//! writes the end-of-insert marker and waits for that task; any failure it saw is returned
//! from `close`.

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::batch::{struct_row, ColumnWriter, Poison};
use crate::column::Column;
use crate::connection::{PacketReader, Received};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::pool::PooledConnection;
use crate::proto::Block;
use crate::types::Value;

type AckTask = JoinHandle<(PacketReader, Result<Received>)>;

/// A reusable insert buffer. Created by [`crate::Pool::prepare_streaming_buffer`].
#[derive(Debug)]
pub struct StreamingBuffer {
    ctx: Context,
    conn: PooledConnection,
    block: Block,
    acks: Option<AckTask>,
    closed: bool,
}

impl StreamingBuffer {
    pub(crate) fn new(ctx: Context, conn: PooledConnection, block: Block) -> Self {
        Self {
            ctx,
            conn,
            block,
            acks: None,
            closed: false,
        }
    }

    pub fn append(&mut self, values: &[Value]) -> Result<()> {
        self.check_open()?;
        self.block.append_row(values)
    }

    pub fn append_struct<T: Serialize>(&mut self, value: &T) -> Result<()> {
        self.check_open()?;
        let row = struct_row(&self.block, value)?;
        self.block.append_row(&row)
    }

    pub fn column(&mut self, i: usize) -> ColumnWriter<'_> {
        if self.closed {
            return ColumnWriter::poisoned(Poison::Closed);
        }
        ColumnWriter::new(&mut self.block, i)
    }

    pub fn rows(&self) -> usize {
        self.block.rows()
    }

    pub fn block(&self) -> &Block {
        &self.block
    }

    /// Drop buffered rows, keeping the column types.
    pub fn clear(&mut self) {
        self.block.clear();
    }

    /// Swap in pre-built columns. They must match the existing columns in count and type,
    /// and agree on row count.
    pub fn replace_by(&mut self, columns: Vec<Box<dyn Column>>) -> Result<()> {
        self.check_open()?;
        check_replacement(&self.block, &columns)?;
        self.block.replace_columns(columns);
        Ok(())
    }

    /// Write the buffered rows and start over with an empty buffer.
    ///
    /// Server acknowledgements are read in the background; their outcome surfaces on
    /// [`StreamingBuffer::close`].
    pub async fn send(&mut self) -> Result<()> {
        self.check_open()?;
        self.send_inner().await
    }

    async fn send_inner(&mut self) -> Result<()> {
        self.block.check_rows()?;
        let conn = self.conn.conn()?;
        if self.block.rows() > 0 {
            conn.write_data(&self.block)?;
        }
        self.ctx.run(conn.flush()).await?;

        if self.acks.is_none() {
            let mut reader = conn.take_reader()?;
            let ctx = self.ctx.clone();
            let conn_id = conn.id();
            self.acks = Some(tokio::spawn(async move {
                let result = ctx.run(reader.process(&ctx, false)).await;
                if let Err(err) = &result {
                    debug!(conn_id, error = %err, "streaming insert acknowledgement failed");
                }
                (reader, result)
            }));
        }
        self.block.clear();
        Ok(())
    }

    /// Flush the remaining rows, end the insert and wait for the server to confirm it.
    /// The connection goes back to the pool afterwards, or is closed on error.
    pub async fn close(&mut self) -> Result<()> {
        self.check_open()?;
        self.closed = true;
        let result = self.close_inner().await;
        if let Some(acks) = self.acks.take() {
            acks.abort();
        }
        self.conn.release(result.as_ref().err());
        result
    }

    async fn close_inner(&mut self) -> Result<()> {
        self.send_inner().await?;
        let conn = self.conn.conn()?;
        self.ctx
            .run(async {
                conn.write_data(&Block::new())?;
                conn.flush().await
            })
            .await?;

        let acks = self
            .acks
            .take()
            .ok_or_else(|| Error::protocol("streaming insert has no acknowledgement reader"))?;
        match acks.await {
            Ok((reader, result)) => {
                conn.restore_reader(reader);
                conn.finish_response(result).map(drop)
            }
            Err(err) => {
                conn.mark_bad();
                Err(Error::protocol(format!(
                    "streaming insert acknowledgement task failed: {}",
                    err
                )))
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::StreamingBufferClosed)
        } else {
            Ok(())
        }
    }
}

impl Drop for StreamingBuffer {
    fn drop(&mut self) {
        if let Some(acks) = self.acks.take() {
            acks.abort();
        }
    }
}

fn check_replacement(block: &Block, columns: &[Box<dyn Column>]) -> Result<()> {
    let op_error = |column: &str, message: String| Error::Op {
        op: "ReplaceBy",
        column: column.to_string(),
        message,
    };
    if columns.len() != block.column_count() {
        return Err(op_error(
            "",
            format!(
                "expected {} columns, got {}",
                block.column_count(),
                columns.len()
            ),
        ));
    }
    let rows = columns.first().map_or(0, |c| c.rows());
    for (i, column) in columns.iter().enumerate() {
        let name = &block.names()[i];
        let expected = block.column(i).map(|c| c.column_type()).unwrap_or_default();
        if column.column_type() != expected {
            return Err(op_error(
                name,
                format!("expected type {}, got {}", expected, column.column_type()),
            ));
        }
        if column.rows() != rows {
            return Err(op_error(
                name,
                format!("has {} rows, expected {}", column.rows(), rows),
            ));
        }
    }
    Ok(())
}
