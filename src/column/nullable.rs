use super::{new_column, Column, ConverterError, TypeSpec};
use crate::error::Result;
use crate::proto::{Decoder, Encoder};
use crate::types::Value;

/// `nullable(T)`: a null mask followed by the inner column.
///
/// Null rows still occupy a slot in the inner column, filled with the zero value.
#[derive(Debug)]
pub struct Nullable {
    type_name: String,
    nulls: Vec<u8>,
    inner: Box<dyn Column>,
}

impl Nullable {
    pub fn parse(spec: &TypeSpec<'_>) -> Result<Self> {
        Ok(Self::new(spec.full, new_column(spec.arg(0)?)?))
    }

    pub fn new(type_name: &str, inner: Box<dyn Column>) -> Self {
        Nullable {
            type_name: type_name.to_string(),
            nulls: Vec::new(),
            inner,
        }
    }

    pub fn inner(&self) -> &dyn Column {
        self.inner.as_ref()
    }

    pub fn is_null(&self, i: usize) -> bool {
        self.nulls[i] == 1
    }
}

impl Column for Nullable {
    fn column_type(&self) -> &str {
        &self.type_name
    }

    fn rows(&self) -> usize {
        self.nulls.len()
    }

    fn row(&self, i: usize) -> Value {
        if self.is_null(i) {
            Value::Null
        } else {
            self.inner.row(i)
        }
    }

    fn append_row(&mut self, value: &Value) -> std::result::Result<(), ConverterError> {
        if value.is_null() {
            self.inner.append_default();
            self.nulls.push(1);
        } else {
            self.inner.append_row(value).map_err(|err| ConverterError {
                to: self.type_name.clone(),
                ..err
            })?;
            self.nulls.push(0);
        }
        Ok(())
    }

    fn append_default(&mut self) {
        self.inner.append_default();
        self.nulls.push(1);
    }

    fn truncate(&mut self, rows: usize) {
        self.nulls.truncate(rows);
        self.inner.truncate(rows);
    }

    fn decode(&mut self, decoder: &mut Decoder<'_>, rows: usize) -> Result<()> {
        self.nulls.extend_from_slice(decoder.take(rows)?);
        self.inner.decode(decoder, rows)
    }

    fn encode(&self, encoder: &mut Encoder) {
        encoder.raw(&self.nulls);
        self.inner.encode(encoder);
    }

    fn decode_prefix(&mut self, decoder: &mut Decoder<'_>) -> Result<()> {
        self.inner.decode_prefix(decoder)
    }

    fn encode_prefix(&self, encoder: &mut Encoder) {
        self.inner.encode_prefix(encoder);
    }

    fn new_empty(&self) -> Box<dyn Column> {
        Box::new(Nullable::new(&self.type_name, self.inner.new_empty()))
    }

    fn is_nullable(&self) -> bool {
        true
    }
}
