use super::{corrupt, new_column, Column, ConverterError, TypeSpec};
use crate::error::Result;
use crate::proto::{byte_len, checked_count, Decoder, Encoder};
use crate::types::Value;

/// `map(K, V)`: offsets like an array, then every key, then every value.
#[derive(Debug)]
pub struct Map {
    type_name: String,
    offsets: Vec<u64>,
    keys: Box<dyn Column>,
    values: Box<dyn Column>,
}

impl Map {
    pub fn parse(spec: &TypeSpec<'_>) -> Result<Self> {
        if spec.args.len() != 2 {
            return Err(spec.unsupported());
        }
        Ok(Map {
            type_name: spec.full.to_string(),
            offsets: Vec::new(),
            keys: new_column(spec.args[0])?,
            values: new_column(spec.args[1])?,
        })
    }

    fn end(&self) -> u64 {
        self.offsets.last().copied().unwrap_or(0)
    }

    fn rollback(&mut self, entries: usize) {
        self.keys.truncate(entries);
        self.values.truncate(entries);
    }
}

impl Column for Map {
    fn column_type(&self) -> &str {
        &self.type_name
    }

    fn rows(&self) -> usize {
        self.offsets.len()
    }

    fn row(&self, i: usize) -> Value {
        let start = if i == 0 { 0 } else { self.offsets[i - 1] as usize };
        let end = self.offsets[i] as usize;
        Value::Map(
            (start..end)
                .map(|j| (self.keys.row(j), self.values.row(j)))
                .collect(),
        )
    }

    fn append_row(&mut self, value: &Value) -> std::result::Result<(), ConverterError> {
        let before = self.keys.rows();
        let result = match value {
            Value::Map(entries) => entries.iter().try_for_each(|(k, v)| {
                self.keys.append_row(k)?;
                self.values.append_row(v)
            }),
            Value::Object(fields) => fields.iter().try_for_each(|(k, v)| {
                self.keys.append_row(&Value::String(k.clone()))?;
                self.values.append_row(v)
            }),
            _ => Err(ConverterError::append(value, &self.type_name)),
        };
        if let Err(err) = result {
            self.rollback(before);
            return Err(err);
        }
        self.offsets.push(self.keys.rows() as u64);
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
        let end = self.end() as usize;
        self.rollback(end);
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
        let entries = checked_count(last).map_err(|err| corrupt(&self.type_name, err))?;
        self.keys.decode(decoder, entries)?;
        self.values.decode(decoder, entries)?;
        let expected = base + last;
        if self.keys.rows() as u64 != expected || self.values.rows() as u64 != expected {
            return Err(corrupt(&self.type_name, "keys and values disagree with offsets"));
        }
        self.offsets.extend(offsets);
        Ok(())
    }

    fn encode(&self, encoder: &mut Encoder) {
        for offset in &self.offsets {
            encoder.u64(*offset);
        }
        self.keys.encode(encoder);
        self.values.encode(encoder);
    }

    fn decode_prefix(&mut self, decoder: &mut Decoder<'_>) -> Result<()> {
        self.keys.decode_prefix(decoder)?;
        self.values.decode_prefix(decoder)
    }

    fn encode_prefix(&self, encoder: &mut Encoder) {
        self.keys.encode_prefix(encoder);
        self.values.encode_prefix(encoder);
    }

    fn new_empty(&self) -> Box<dyn Column> {
        Box::new(Map {
            type_name: self.type_name.clone(),
            offsets: Vec::new(),
            keys: self.keys.new_empty(),
            values: self.values.new_empty(),
        })
    }
}
