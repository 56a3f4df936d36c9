use super::{new_column, Column, ConverterError, TypeSpec};
use crate::error::Result;
use crate::proto::{Decoder, Encoder};
use crate::types::Value;

/// `simple_aggregate_function(f, T)`: stored exactly like `T`.
#[derive(Debug)]
pub struct SimpleAggregateFunction {
    type_name: String,
    inner: Box<dyn Column>,
}

impl SimpleAggregateFunction {
    pub fn parse(spec: &TypeSpec<'_>) -> Result<Self> {
        if spec.args.len() != 2 {
            return Err(spec.unsupported());
        }
        Ok(SimpleAggregateFunction {
            type_name: spec.full.to_string(),
            inner: new_column(spec.args[1])?,
        })
    }
}

impl Column for SimpleAggregateFunction {
    fn column_type(&self) -> &str {
        &self.type_name
    }

    fn rows(&self) -> usize {
        self.inner.rows()
    }

    fn row(&self, i: usize) -> Value {
        self.inner.row(i)
    }

    fn append_row(&mut self, value: &Value) -> std::result::Result<(), ConverterError> {
        self.inner.append_row(value)
    }

    fn append(&mut self, values: &[Value]) -> std::result::Result<usize, ConverterError> {
        self.inner.append(values)
    }

    fn append_default(&mut self) {
        self.inner.append_default();
    }

    fn truncate(&mut self, rows: usize) {
        self.inner.truncate(rows);
    }

    fn decode(&mut self, decoder: &mut Decoder<'_>, rows: usize) -> Result<()> {
        self.inner.decode(decoder, rows)
    }

    fn encode(&self, encoder: &mut Encoder) {
        self.inner.encode(encoder);
    }

    fn decode_prefix(&mut self, decoder: &mut Decoder<'_>) -> Result<()> {
        self.inner.decode_prefix(decoder)
    }

    fn encode_prefix(&self, encoder: &mut Encoder) {
        self.inner.encode_prefix(encoder);
    }

    fn new_empty(&self) -> Box<dyn Column> {
        Box::new(SimpleAggregateFunction {
            type_name: self.type_name.clone(),
            inner: self.inner.new_empty(),
        })
    }

    fn is_nullable(&self) -> bool {
        self.inner.is_nullable()
    }
}
