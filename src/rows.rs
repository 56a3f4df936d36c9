//! Query results.

use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::connection::Received;
use crate::error::{Error, Result};
use crate::proto::{Block, ProfileInfo, Progress};
use crate::types::{to_json, FromValue, Value};

/// All blocks returned by a query, with a row cursor over them.
#[derive(Debug)]
pub struct Rows {
    names: Arc<Vec<String>>,
    types: Vec<String>,
    blocks: Vec<Block>,
    block: usize,
    row: usize,
    totals: Option<Block>,
    extremes: Option<Block>,
    progress: Option<Progress>,
    profile_info: Option<ProfileInfo>,
}

impl From<Received> for Rows {
    fn from(received: Received) -> Self {
        let (names, types) = received
            .blocks
            .first()
            .map(|b| (b.names().to_vec(), b.types()))
            .unwrap_or_default();
        Rows {
            names: Arc::new(names),
            types,
            blocks: received.blocks,
            block: 0,
            row: 0,
            totals: received.totals,
            extremes: received.extremes,
            progress: received.progress,
            profile_info: received.profile_info,
        }
    }
}

impl Rows {
    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    pub fn column_types(&self) -> &[String] {
        &self.types
    }

    /// Total row count across blocks.
    pub fn len(&self) -> usize {
        self.blocks.iter().map(Block::rows).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn totals(&self) -> Option<&Block> {
        self.totals.as_ref()
    }

    pub fn extremes(&self) -> Option<&Block> {
        self.extremes.as_ref()
    }

    /// Last progress packet seen while reading the result.
    pub fn progress(&self) -> Option<&Progress> {
        self.progress.as_ref()
    }

    pub fn profile_info(&self) -> Option<&ProfileInfo> {
        self.profile_info.as_ref()
    }
}

impl Iterator for Rows {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        loop {
            let block = self.blocks.get(self.block)?;
            if self.row < block.rows() {
                let values = block.row(self.row);
                self.row += 1;
                return Some(Row {
                    names: Arc::clone(&self.names),
                    values,
                });
            }
            self.block += 1;
            self.row = 0;
        }
    }
}

/// One result row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    names: Arc<Vec<String>>,
    values: Vec<Value>,
}

impl Row {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Convert column `i`.
    pub fn get<T: FromValue>(&self, i: usize) -> Result<T> {
        let value = self.values.get(i).ok_or_else(|| Error::Op {
            op: "ScanRow",
            column: i.to_string(),
            message: format!("row has {} columns", self.values.len()),
        })?;
        let name = self.names.get(i).cloned().unwrap_or_default();
        T::from_value(value.clone()).map_err(|e| e.with_column(name).into())
    }

    pub fn get_by_name<T: FromValue>(&self, name: &str) -> Result<T> {
        let i = self
            .names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| Error::Op {
                op: "ScanRow",
                column: name.to_string(),
                message: "no such column".to_string(),
            })?;
        self.get(i)
    }

    /// Deserialize the row into a struct, matching fields to columns by name.
    pub fn scan_struct<T: DeserializeOwned>(&self) -> Result<T> {
        let object: serde_json::Map<String, serde_json::Value> = self
            .names
            .iter()
            .zip(&self.values)
            .map(|(name, value)| (name.clone(), to_json(value)))
            .collect();
        serde_json::from_value(serde_json::Value::Object(object)).map_err(|e| Error::Op {
            op: "ScanStruct",
            column: String::new(),
            message: e.to_string(),
        })
    }
}
