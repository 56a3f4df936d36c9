use std::collections::BTreeMap;

use super::json_path::{build_json_path, split_json_path};
use super::{new_column, Column, ConverterError};
use crate::error::Result;
use crate::proto::{checked_count, Decoder, Encoder};
use crate::types::Value;

/// Dynamic JSON: one leaf column per escaped path, schema discovered as rows arrive.
///
/// Every leaf holds exactly [`Column::rows`] rows. A path first seen at row `n` is backfilled
/// with `n` nulls, and paths missing from a row get a null for it.
#[derive(Debug)]
pub struct Json {
    type_name: String,
    columns: BTreeMap<String, Box<dyn Column>>,
    rows: usize,
}

impl Json {
    pub fn new(type_name: &str) -> Self {
        Json {
            type_name: type_name.to_string(),
            columns: BTreeMap::new(),
            rows: 0,
        }
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn column(&self, path: &str) -> Option<&dyn Column> {
        self.columns.get(path).map(|c| c.as_ref())
    }

    /// Append whole sub-columns keyed by path. All of them must have the same row count.
    pub fn append_columns(
        &mut self,
        columns: &BTreeMap<String, Box<dyn Column>>,
    ) -> std::result::Result<(), ConverterError> {
        let mut counts = columns.values().map(|c| c.rows());
        let add = counts.next().unwrap_or(0);
        if counts.any(|n| n != add) {
            return Err(ConverterError::new("Append", "json", self.type_name.as_str())
                .with_hint("got inconsistent row count in json"));
        }

        let before = self.rows;
        let mut added = Vec::new();
        let result = self.merge_columns(columns, add, &mut added);
        self.finish(result, before, add, added)
    }

    fn merge_columns(
        &mut self,
        incoming: &BTreeMap<String, Box<dyn Column>>,
        add: usize,
        added: &mut Vec<String>,
    ) -> std::result::Result<(), ConverterError> {
        for (path, column) in incoming {
            if !self.columns.contains_key(path) {
                let mut fresh = column.new_empty();
                for _ in 0..self.rows {
                    append_null(fresh.as_mut());
                }
                self.columns.insert(path.clone(), fresh);
                added.push(path.clone());
            }
        }
        for (path, column) in self.columns.iter_mut() {
            match incoming.get(path) {
                Some(source) => {
                    for i in 0..add {
                        column
                            .append_row(&source.row(i))
                            .map_err(|e| e.with_column(path.clone()))?;
                    }
                }
                None => (0..add).for_each(|_| append_null(column.as_mut())),
            }
        }
        Ok(())
    }

    fn append_leaves(
        &mut self,
        leaves: &BTreeMap<String, &Value>,
        added: &mut Vec<String>,
    ) -> std::result::Result<(), ConverterError> {
        for (path, value) in leaves {
            if self.columns.contains_key(path) {
                continue;
            }
            let unsupported = || ConverterError::append(value, &self.type_name).with_column(path.clone());
            let type_name = infer_type(value).ok_or_else(|| unsupported())?;
            let mut column = new_column(&type_name).map_err(|_| unsupported())?;
            for _ in 0..self.rows {
                append_null(column.as_mut());
            }
            self.columns.insert(path.clone(), column);
            added.push(path.clone());
        }
        for (path, column) in self.columns.iter_mut() {
            match leaves.get(path) {
                Some(value) => column
                    .append_row(value)
                    .map_err(|e| e.with_column(path.clone()))?,
                None => append_null(column.as_mut()),
            }
        }
        Ok(())
    }

    /// Commit `add` rows on success, or drop everything appended since `before`.
    fn finish(
        &mut self,
        result: std::result::Result<(), ConverterError>,
        before: usize,
        add: usize,
        added: Vec<String>,
    ) -> std::result::Result<(), ConverterError> {
        match result {
            Ok(()) => {
                self.rows += add;
                Ok(())
            }
            Err(err) => {
                for path in added {
                    self.columns.remove(&path);
                }
                for column in self.columns.values_mut() {
                    column.truncate(before);
                }
                Err(err)
            }
        }
    }
}

fn append_null(column: &mut dyn Column) {
    if column.is_nullable() {
        // A nullable column always takes a null.
        let _ = column.append_row(&Value::Null);
    } else {
        column.append_default();
    }
}

/// Collect leaf values under their escaped paths. Nested objects extend the path.
fn flatten<'a>(prefix: &str, object: &'a BTreeMap<String, Value>, out: &mut BTreeMap<String, &'a Value>) {
    for (key, value) in object {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            Value::Object(inner) => flatten(&path, inner, out),
            _ => {
                out.insert(path, value);
            }
        }
    }
}

/// Base type for a scalar leaf.
fn scalar_type(value: &Value) -> Option<String> {
    let name = match value {
        Value::Null | Value::String(_) | Value::Bytes(_) => "string".to_string(),
        Value::Bool(_) => "bool".to_string(),
        Value::Int8(_) | Value::Int16(_) | Value::Int32(_) | Value::Int64(_) => "int64".to_string(),
        Value::Int128(_) => "int128".to_string(),
        Value::UInt8(_) | Value::UInt16(_) | Value::UInt32(_) | Value::UInt64(_) => {
            "uint64".to_string()
        }
        Value::UInt128(_) => "uint128".to_string(),
        Value::Float32(_) | Value::Float64(_) => "float64".to_string(),
        Value::Uuid(_) => "uuid".to_string(),
        Value::Date(_) => "date32".to_string(),
        Value::DateTime(_) => "datetime64(3)".to_string(),
        Value::Decimal(d) => format!("decimal(76, {})", d.scale()),
        Value::Ipv4(_) => "ipv4".to_string(),
        Value::Ipv6(_) => "ipv6".to_string(),
        Value::Array(_) | Value::Tuple(_) | Value::Map(_) | Value::Object(_) => return None,
    };
    Some(name)
}

/// Leaf type for a value seen at a new path. Scalars are nullable so later rows can omit them.
fn infer_type(value: &Value) -> Option<String> {
    match value {
        Value::Array(items) => {
            let elem = match items.iter().find(|v| !v.is_null()) {
                Some(item) => infer_type(item)?,
                None => "nullable(string)".to_string(),
            };
            Some(format!("array({})", elem))
        }
        Value::Tuple(items) if !items.is_empty() => {
            let elems = items.iter().map(infer_type).collect::<Option<Vec<_>>>()?;
            Some(format!("tuple({})", elems.join(", ")))
        }
        Value::Map(pairs) => {
            let key = match pairs.first() {
                Some((k, _)) => scalar_type(k)?,
                None => "string".to_string(),
            };
            let value = match pairs.iter().map(|(_, v)| v).find(|v| !v.is_null()) {
                Some(v) => infer_type(v)?,
                None => "nullable(string)".to_string(),
            };
            Some(format!("map({}, {})", key, value))
        }
        Value::Tuple(_) | Value::Object(_) => None,
        other => scalar_type(other).map(|t| format!("nullable({})", t)),
    }
}

impl Column for Json {
    fn column_type(&self) -> &str {
        &self.type_name
    }

    fn rows(&self) -> usize {
        self.rows
    }

    fn row(&self, i: usize) -> Value {
        Value::Object(
            self.columns
                .iter()
                .map(|(path, column)| (path.clone(), column.row(i)))
                .collect(),
        )
    }

    fn append_row(&mut self, value: &Value) -> std::result::Result<(), ConverterError> {
        let empty = BTreeMap::new();
        let object = match value {
            Value::Object(object) => object,
            Value::Null => &empty,
            _ => return Err(ConverterError::append(value, &self.type_name)),
        };
        let mut leaves = BTreeMap::new();
        flatten("", object, &mut leaves);

        let before = self.rows;
        let mut added = Vec::new();
        let result = self.append_leaves(&leaves, &mut added);
        self.finish(result, before, 1, added)
    }

    fn append_default(&mut self) {
        for column in self.columns.values_mut() {
            append_null(column.as_mut());
        }
        self.rows += 1;
    }

    fn truncate(&mut self, rows: usize) {
        for column in self.columns.values_mut() {
            column.truncate(rows);
        }
        self.rows = self.rows.min(rows);
    }

    fn clear(&mut self) {
        self.columns.clear();
        self.rows = 0;
    }

    fn decode(&mut self, decoder: &mut Decoder<'_>, rows: usize) -> Result<()> {
        let count = checked_count(decoder.uvarint()?)?;
        let mut seen = Vec::with_capacity(decoder.capacity_hint(count, 2));
        for _ in 0..count {
            let parts_len = checked_count(decoder.uvarint()?)?;
            let mut parts = Vec::with_capacity(decoder.capacity_hint(parts_len, 1));
            for _ in 0..parts_len {
                parts.push(decoder.string()?);
                decoder.uvarint()?;
                decoder.uvarint()?;
            }
            let type_name = decoder.string()?;
            let path = build_json_path(&parts);

            let existing = self
                .columns
                .get(&path)
                .is_some_and(|c| c.column_type() == type_name);
            if !existing {
                let mut column = new_column(&type_name)?;
                for _ in 0..self.rows {
                    append_null(column.as_mut());
                }
                self.columns.insert(path.clone(), column);
            }
            if let Some(column) = self.columns.get_mut(&path) {
                column.decode_prefix(decoder)?;
                column.decode(decoder, rows)?;
            }
            seen.push(path);
        }
        for (path, column) in self.columns.iter_mut() {
            if !seen.contains(path) {
                (0..rows).for_each(|_| append_null(column.as_mut()));
            }
        }
        self.rows += rows;
        Ok(())
    }

    fn encode(&self, encoder: &mut Encoder) {
        encoder.uvarint(self.columns.len() as u64);
        for (path, column) in &self.columns {
            let parts = split_json_path(path);
            encoder.uvarint(parts.len() as u64);
            for part in &parts {
                encoder.string(part);
                encoder.uvarint(0);
                encoder.uvarint(0);
            }
            encoder.string(column.column_type());
            column.encode_prefix(encoder);
            column.encode(encoder);
        }
    }

    fn new_empty(&self) -> Box<dyn Column> {
        Box::new(Json::new(&self.type_name))
    }

    fn is_nullable(&self) -> bool {
        self.type_name.to_ascii_lowercase().starts_with("nullable")
    }
}
