//! Single-use batched inserts.

use serde::Serialize;

use crate::column::Column;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::pool::PooledConnection;
use crate::proto::Block;
use crate::types::{from_json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Sent,
    Aborted,
}

/// Rows buffered for one `INSERT`, sent in a single block.
///
/// Created by [`crate::Pool::prepare_batch`]. The batch owns its connection until
/// [`Batch::send`] or [`Batch::abort`], either of which may be called once.
#[derive(Debug)]
pub struct Batch {
    ctx: Context,
    conn: PooledConnection,
    block: Block,
    state: State,
}

impl Batch {
    pub(crate) fn new(ctx: Context, conn: PooledConnection, block: Block) -> Self {
        Self {
            ctx,
            conn,
            block,
            state: State::Open,
        }
    }

    /// Append one row, one value per column. A value that does not convert leaves the batch
    /// unchanged.
    pub fn append(&mut self, values: &[Value]) -> Result<()> {
        self.check_open()?;
        self.block.append_row(values)
    }

    /// Append a serializable value, matching its fields to columns by name.
    pub fn append_struct<T: Serialize>(&mut self, value: &T) -> Result<()> {
        self.check_open()?;
        let row = struct_row(&self.block, value)?;
        self.block.append_row(&row)
    }

    /// Columnar access to column `i`.
    pub fn column(&mut self, i: usize) -> ColumnWriter<'_> {
        if self.state != State::Open {
            return ColumnWriter::poisoned(Poison::Sent);
        }
        ColumnWriter::new(&mut self.block, i)
    }

    pub fn rows(&self) -> usize {
        self.block.rows()
    }

    pub fn block(&self) -> &Block {
        &self.block
    }

    pub fn is_sent(&self) -> bool {
        self.state != State::Open
    }

    /// Write the buffered rows and release the connection.
    pub async fn send(&mut self) -> Result<()> {
        self.check_open()?;
        self.state = State::Sent;
        let result = self.send_inner().await;
        self.conn.release(result.as_ref().err());
        result
    }

    async fn send_inner(&mut self) -> Result<()> {
        self.block.check_rows()?;
        self.conn.conn()?.send_insert(&self.ctx, &self.block).await
    }

    /// Drop the buffered rows. The server is still waiting for data, so the connection is
    /// closed rather than reused.
    pub fn abort(&mut self) -> Result<()> {
        self.check_open()?;
        self.state = State::Aborted;
        self.conn.release(Some(&Error::Op {
            op: "Abort",
            column: String::new(),
            message: "batch aborted".to_string(),
        }));
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        match self.state {
            State::Open => Ok(()),
            State::Sent | State::Aborted => Err(Error::BatchAlreadySent),
        }
    }
}

// ============================================================================
// Column writer
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub(crate) enum Poison {
    Sent,
    Closed,
    OutOfRange(usize),
}

impl Poison {
    fn error(self) -> Error {
        match self {
            Poison::Sent => Error::BatchAlreadySent,
            Poison::Closed => Error::StreamingBufferClosed,
            Poison::OutOfRange(i) => Error::Op {
                op: "Column",
                column: i.to_string(),
                message: "column index out of range".to_string(),
            },
        }
    }
}

/// Append handle for a single column. A handle for an unusable column fails on first use.
#[derive(Debug)]
pub struct ColumnWriter<'a> {
    target: std::result::Result<(&'a str, &'a mut Box<dyn Column>), Poison>,
}

impl<'a> ColumnWriter<'a> {
    pub(crate) fn new(block: &'a mut Block, i: usize) -> Self {
        Self {
            target: block.entry_mut(i).ok_or(Poison::OutOfRange(i)),
        }
    }

    pub(crate) fn poisoned(poison: Poison) -> Self {
        Self {
            target: Err(poison),
        }
    }

    /// Append many values, returning how many were null. Either all are appended or none.
    pub fn append(&mut self, values: &[Value]) -> Result<usize> {
        let (name, column) = self.target.as_mut().map_err(|p| p.error())?;
        column
            .append(values)
            .map_err(|e| e.with_column(name.to_string()).into())
    }

    pub fn append_row(&mut self, value: &Value) -> Result<()> {
        let (name, column) = self.target.as_mut().map_err(|p| p.error())?;
        column
            .append_row(value)
            .map_err(|e| e.with_column(name.to_string()).into())
    }

    pub fn column_type(&self) -> Option<&str> {
        self.target.as_ref().ok().map(|(_, c)| c.column_type())
    }
}

/// Serialize `value` and pick its fields in column order.
pub(crate) fn struct_row<T: Serialize>(block: &Block, value: &T) -> Result<Vec<Value>> {
    let json = serde_json::to_value(value).map_err(|e| Error::Op {
        op: "AppendStruct",
        column: String::new(),
        message: e.to_string(),
    })?;
    let serde_json::Value::Object(mut fields) = json else {
        return Err(Error::Op {
            op: "AppendStruct",
            column: String::new(),
            message: format!("expected a struct, got {}", json_kind(&json)),
        });
    };
    block
        .names()
        .iter()
        .map(|name| {
            fields
                .remove(name)
                .map(from_json)
                .ok_or_else(|| Error::Op {
                    op: "AppendStruct",
                    column: name.clone(),
                    message: "missing struct field".to_string(),
                })
        })
        .collect()
}

fn json_kind(json: &serde_json::Value) -> &'static str {
    match json {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> Block {
        let mut block = Block::new();
        block.add_column("id", "uint64").unwrap();
        block.add_column("tags", "array(string)").unwrap();
        block
    }

    #[test]
    fn test_struct_row_orders_by_column() {
        #[derive(Serialize)]
        struct Event {
            tags: Vec<&'static str>,
            id: u64,
            extra: bool,
        }
        let row = struct_row(
            &block(),
            &Event {
                tags: vec!["a"],
                id: 3,
                extra: true,
            },
        )
        .unwrap();
        assert_eq!(
            row,
            vec![Value::Int64(3), Value::Array(vec!["a".into()])]
        );
    }

    #[test]
    fn test_struct_row_errors() {
        #[derive(Serialize)]
        struct Partial {
            id: u64,
        }
        let err = struct_row(&block(), &Partial { id: 1 }).unwrap_err();
        assert!(matches!(err, Error::Op { op: "AppendStruct", ref column, .. } if column == "tags"));
        assert!(matches!(
            struct_row(&block(), &5u8),
            Err(Error::Op { op: "AppendStruct", .. })
        ));
    }

    #[test]
    fn test_column_writer() {
        let mut block = block();
        let mut writer = ColumnWriter::new(&mut block, 0);
        assert_eq!(writer.column_type(), Some("uint64"));
        assert_eq!(writer.append(&[Value::UInt64(1), Value::UInt64(2)]).unwrap(), 0);
        let err = writer.append(&[Value::UInt64(3), "x".into()]).unwrap_err();
        assert!(matches!(err, Error::Column(ref e) if e.column == "id"));
        assert_eq!(block.column(0).unwrap().rows(), 2);

        let mut writer = ColumnWriter::new(&mut block, 9);
        assert!(matches!(
            writer.append_row(&Value::UInt64(1)),
            Err(Error::Op { op: "Column", .. })
        ));
        assert!(matches!(
            ColumnWriter::poisoned(Poison::Sent).append(&[]),
            Err(Error::BatchAlreadySent)
        ));
    }
}
