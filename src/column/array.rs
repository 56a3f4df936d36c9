use super::{corrupt, new_column, Column, ConverterError, TypeSpec};
use crate::error::Result;
use crate::proto::{byte_len, checked_count, Decoder, Encoder};
use crate::types::Value;

/// `array(T)`: cumulative offsets followed by the flattened elements.
#[derive(Debug)]
pub struct Array {
    type_name: String,
    offsets: Vec<u64>,
    inner: Box<dyn Column>,
}

impl Array {
    pub fn parse(spec: &TypeSpec<'_>) -> Result<Self> {
        Ok(Self::new(spec.full, new_column(spec.arg(0)?)?))
    }

    pub fn new(type_name: &str, inner: Box<dyn Column>) -> Self {
        Array {
            type_name: type_name.to_string(),
            offsets: Vec::new(),
            inner,
        }
    }

    pub fn inner(&self) -> &dyn Column {
        self.inner.as_ref()
    }

    fn bounds(&self, i: usize) -> (usize, usize) {
        let start = if i == 0 { 0 } else { self.offsets[i - 1] as usize };
        (start, self.offsets[i] as usize)
    }

    fn end(&self) -> u64 {
        self.offsets.last().copied().unwrap_or(0)
    }
}

impl Column for Array {
    fn column_type(&self) -> &str {
        &self.type_name
    }

    fn rows(&self) -> usize {
        self.offsets.len()
    }

    fn row(&self, i: usize) -> Value {
        let (start, end) = self.bounds(i);
        Value::Array((start..end).map(|j| self.inner.row(j)).collect())
    }

    fn append_row(&mut self, value: &Value) -> std::result::Result<(), ConverterError> {
        let items = match value {
            Value::Array(items) => items,
            _ => return Err(ConverterError::append(value, &self.type_name)),
        };
        let before = self.inner.rows();
        for item in items {
            if let Err(err) = self.inner.append_row(item) {
                self.inner.truncate(before);
                return Err(err);
            }
        }
        self.offsets.push(self.inner.rows() as u64);
        Ok(())
    }

    fn append_default(&mut self) {
        self.offsets.push(self.end());
    }

    fn truncate(&mut self, rows: usize) {
        if rows >= self.offsets.len() {
            return;
        }
        self.offsets.truncate(rows);
        self.inner.truncate(self.end() as usize);
    }

    fn decode(&mut self, decoder: &mut Decoder<'_>, rows: usize) -> Result<()> {
        let base = self.end();
        let mut last = 0u64;
        let raw = decoder.take(byte_len(rows, 8)?)?;
        let mut offsets = Vec::with_capacity(rows);
        for chunk in raw.chunks_exact(8) {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            let offset = u64::from_le_bytes(bytes);
            if offset < last {
                return Err(corrupt(&self.type_name, "offsets are not monotonic"));
            }
            last = offset;
            let end = base
                .checked_add(offset)
                .ok_or_else(|| corrupt(&self.type_name, "offset overflows"))?;
            offsets.push(end);
        }
        let elements = checked_count(last).map_err(|err| corrupt(&self.type_name, err))?;
        self.inner.decode(decoder, elements)?;
        if self.inner.rows() as u64 != base + last {
            return Err(corrupt(
                &self.type_name,
                format!("offsets end at {}, elements hold {}", base + last, self.inner.rows()),
            ));
        }
        self.offsets.extend(offsets);
        Ok(())
    }

    fn encode(&self, encoder: &mut Encoder) {
        for offset in &self.offsets {
            encoder.u64(*offset);
        }
        self.inner.encode(encoder);
    }

    fn decode_prefix(&mut self, decoder: &mut Decoder<'_>) -> Result<()> {
        self.inner.decode_prefix(decoder)
    }

    fn encode_prefix(&self, encoder: &mut Encoder) {
        self.inner.encode_prefix(encoder);
    }

    fn new_empty(&self) -> Box<dyn Column> {
        Box::new(Array::new(&self.type_name, self.inner.new_empty()))
    }
}
