//! Blocks: the unit of column data on the wire.
//!
//! ```text
//! [block info]        field 1: is_overflows (u8), field 2: bucket_num (i32), 0 terminates
//! [columns: uvarint] [rows: uvarint]
//! per column: [name] [type] [prefix + data, only when rows > 0]
//! ```

use crate::column::{new_column, Column};
use crate::error::{Error, Result};
use crate::types::Value;

use super::binary::{Decoder, Encoder};
use super::packet::revision;

/// An ordered set of named columns with equal row counts.
#[derive(Debug, Default)]
pub struct Block {
    names: Vec<String>,
    columns: Vec<Box<dyn Column>>,
}

impl Block {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an empty column of the given wire type.
    pub fn add_column(&mut self, name: &str, type_name: &str) -> Result<()> {
        let column = new_column(type_name)?;
        self.push(name, column);
        Ok(())
    }

    pub fn push(&mut self, name: &str, column: Box<dyn Column>) {
        self.names.push(name.to_string());
        self.columns.push(column);
    }

    pub fn rows(&self) -> usize {
        self.columns.first().map_or(0, |c| c.rows())
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn types(&self) -> Vec<String> {
        self.columns
            .iter()
            .map(|c| c.column_type().to_string())
            .collect()
    }

    pub fn column(&self, i: usize) -> Option<&dyn Column> {
        self.columns.get(i).map(|c| c.as_ref())
    }

    pub fn column_mut(&mut self, i: usize) -> Option<&mut Box<dyn Column>> {
        self.columns.get_mut(i)
    }

    /// Name and column at `i`, borrowed together.
    pub fn entry_mut(&mut self, i: usize) -> Option<(&str, &mut Box<dyn Column>)> {
        let name = self.names.get(i)?;
        let column = self.columns.get_mut(i)?;
        Some((name.as_str(), column))
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn column_by_name(&self, name: &str) -> Option<&dyn Column> {
        self.position(name).and_then(|i| self.column(i))
    }

    /// Values of row `i`, in column order.
    pub fn row(&self, i: usize) -> Vec<Value> {
        self.columns.iter().map(|c| c.row(i)).collect()
    }

    /// Append one row. Either every column takes its value or none does.
    pub fn append_row(&mut self, values: &[Value]) -> Result<()> {
        if values.len() != self.columns.len() {
            return Err(Error::Op {
                op: "Append",
                column: String::new(),
                message: format!(
                    "expected {} arguments, got {}",
                    self.columns.len(),
                    values.len()
                ),
            });
        }
        let before = self.rows();
        for (i, value) in values.iter().enumerate() {
            if let Err(err) = self.columns[i].append_row(value) {
                for column in &mut self.columns[..i] {
                    column.truncate(before);
                }
                return Err(err.with_column(self.names[i].clone()).into());
            }
        }
        Ok(())
    }

    /// Reset every column to a fresh empty one of the same type.
    pub fn clear(&mut self) {
        for column in &mut self.columns {
            *column = column.new_empty();
        }
    }

    /// Swap in new columns, keeping the names.
    pub fn replace_columns(&mut self, columns: Vec<Box<dyn Column>>) {
        self.columns = columns;
    }

    /// Row count shared by all columns, or an error naming the first column that differs.
    pub fn check_rows(&self) -> Result<usize> {
        let rows = self.rows();
        for (name, column) in self.names.iter().zip(&self.columns) {
            if column.rows() != rows {
                return Err(Error::Op {
                    op: "Send",
                    column: name.clone(),
                    message: format!("has {} rows, expected {}", column.rows(), rows),
                });
            }
        }
        Ok(rows)
    }

    pub fn encode(&self, encoder: &mut Encoder, revision: u64) {
        if revision >= revision::BLOCK_INFO {
            encoder.uvarint(1);
            encoder.bool(false);
            encoder.uvarint(2);
            encoder.i32(-1);
            encoder.uvarint(0);
        }
        let rows = self.rows();
        encoder.uvarint(self.columns.len() as u64);
        encoder.uvarint(rows as u64);
        for (name, column) in self.names.iter().zip(&self.columns) {
            encoder.string(name);
            encoder.string(column.column_type());
            if rows > 0 {
                column.encode_prefix(encoder);
                column.encode(encoder);
            }
        }
    }

    pub fn decode(decoder: &mut Decoder<'_>, revision: u64) -> Result<Self> {
        if revision >= revision::BLOCK_INFO {
            loop {
                match decoder.uvarint()? {
                    0 => break,
                    1 => {
                        decoder.bool()?;
                    }
                    2 => {
                        decoder.i32()?;
                    }
                    field => {
                        return Err(Error::protocol(format!("unknown block info field {}", field)))
                    }
                }
            }
        }
        let count = decoder.count()?;
        let rows = decoder.count()?;
        let mut block = Block::new();
        for _ in 0..count {
            let name = decoder.string()?;
            let type_name = decoder.string()?;
            let mut column = new_column(&type_name)?;
            if rows > 0 {
                column.decode_prefix(decoder)?;
                column.decode(decoder, rows)?;
            }
            if column.rows() != rows {
                return Err(Error::protocol(format!(
                    "column {} decoded {} rows, block declares {}",
                    name,
                    column.rows(),
                    rows
                )));
            }
            block.push(&name, column);
        }
        Ok(block)
    }
}
