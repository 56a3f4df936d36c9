use super::{corrupt, Column, ConverterError, TypeSpec};
use crate::error::Result;
use crate::proto::{Decoder, Encoder};
use crate::types::Value;

fn bytes_value(bytes: &[u8]) -> Value {
    match std::str::from_utf8(bytes) {
        Ok(s) => Value::String(s.to_string()),
        Err(_) => Value::Bytes(bytes.to_vec()),
    }
}

fn value_bytes(value: &Value) -> Option<&[u8]> {
    match value {
        Value::String(s) => Some(s.as_bytes()),
        Value::Bytes(b) => Some(b),
        _ => None,
    }
}

/// Variable-length strings, kept as one byte arena plus end offsets.
#[derive(Debug, Clone)]
pub struct StringColumn {
    type_name: String,
    data: Vec<u8>,
    ends: Vec<usize>,
}

impl StringColumn {
    pub fn new(type_name: &str) -> Self {
        StringColumn {
            type_name: type_name.to_string(),
            data: Vec::new(),
            ends: Vec::new(),
        }
    }

    pub fn get(&self, i: usize) -> &[u8] {
        let start = if i == 0 { 0 } else { self.ends[i - 1] };
        &self.data[start..self.ends[i]]
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        self.ends.push(self.data.len());
    }
}

impl Column for StringColumn {
    fn column_type(&self) -> &str {
        &self.type_name
    }

    fn rows(&self) -> usize {
        self.ends.len()
    }

    fn row(&self, i: usize) -> Value {
        bytes_value(self.get(i))
    }

    fn append_row(&mut self, value: &Value) -> std::result::Result<(), ConverterError> {
        let bytes = value_bytes(value).ok_or_else(|| ConverterError::append(value, &self.type_name))?;
        self.push(bytes);
        Ok(())
    }

    fn append_default(&mut self) {
        self.ends.push(self.data.len());
    }

    fn truncate(&mut self, rows: usize) {
        if rows >= self.ends.len() {
            return;
        }
        self.ends.truncate(rows);
        self.data.truncate(self.ends.last().copied().unwrap_or(0));
    }

    fn decode(&mut self, decoder: &mut Decoder<'_>, rows: usize) -> Result<()> {
        self.ends.reserve(decoder.capacity_hint(rows, 1));
        for _ in 0..rows {
            let len = decoder.length()?;
            let bytes = decoder.take(len)?;
            self.data.extend_from_slice(bytes);
            self.ends.push(self.data.len());
        }
        Ok(())
    }

    fn encode(&self, encoder: &mut Encoder) {
        for i in 0..self.ends.len() {
            encoder.bytes(self.get(i));
        }
    }

    fn new_empty(&self) -> Box<dyn Column> {
        Box::new(StringColumn::new(&self.type_name))
    }
}

/// Strings of exactly `n` bytes, zero padded.
#[derive(Debug, Clone)]
pub struct FixedString {
    type_name: String,
    size: usize,
    data: Vec<u8>,
}

impl FixedString {
    pub fn parse(spec: &TypeSpec<'_>) -> Result<Self> {
        let size = spec
            .arg(0)?
            .parse::<usize>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| spec.unsupported())?;
        Ok(FixedString {
            type_name: spec.full.to_string(),
            size,
            data: Vec::new(),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Column for FixedString {
    fn column_type(&self) -> &str {
        &self.type_name
    }

    fn rows(&self) -> usize {
        self.data.len() / self.size
    }

    fn row(&self, i: usize) -> Value {
        bytes_value(&self.data[i * self.size..(i + 1) * self.size])
    }

    fn append_row(&mut self, value: &Value) -> std::result::Result<(), ConverterError> {
        let bytes = value_bytes(value).ok_or_else(|| ConverterError::append(value, &self.type_name))?;
        if bytes.len() > self.size {
            return Err(ConverterError::append(value, &self.type_name)
                .with_hint(format!("value of {} bytes exceeds the column size", bytes.len())));
        }
        self.data.extend_from_slice(bytes);
        self.data
            .extend(std::iter::repeat(0).take(self.size - bytes.len()));
        Ok(())
    }

    fn append_default(&mut self) {
        self.data.extend(std::iter::repeat(0).take(self.size));
    }

    fn truncate(&mut self, rows: usize) {
        self.data.truncate(rows * self.size);
    }

    fn decode(&mut self, decoder: &mut Decoder<'_>, rows: usize) -> Result<()> {
        let len = rows
            .checked_mul(self.size)
            .ok_or_else(|| corrupt(&self.type_name, "row count overflows"))?;
        self.data.extend_from_slice(decoder.take(len)?);
        Ok(())
    }

    fn encode(&self, encoder: &mut Encoder) {
        encoder.raw(&self.data);
    }

    fn new_empty(&self) -> Box<dyn Column> {
        Box::new(FixedString {
            type_name: self.type_name.clone(),
            size: self.size,
            data: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{roundtrip, rows_of};
    use super::super::new_column;
    use super::*;

    #[test]
    fn test_string_arena() {
        let mut col = StringColumn::new("string");
        col.append(&["hello".into(), "".into(), Value::Bytes(vec![0xFF, 0x00])])
            .unwrap();
        assert_eq!(col.rows(), 3);
        assert_eq!(col.get(0), b"hello");
        assert_eq!(col.row(1), Value::String(String::new()));
        assert_eq!(col.row(2), Value::Bytes(vec![0xFF, 0x00]));

        col.truncate(1);
        col.append_row(&"x".into()).unwrap();
        assert_eq!(rows_of(&col), vec![Value::from("hello"), Value::from("x")]);
        assert_eq!(rows_of(roundtrip(&col).as_ref()), rows_of(&col));
    }

    #[test]
    fn test_string_rejects_numbers() {
        let mut col = StringColumn::new("string");
        let err = col.append_row(&Value::Int32(1)).unwrap_err();
        assert_eq!(err.from, "int32");
        assert_eq!(err.to, "string");
    }

    #[test]
    fn test_fixed_string_padding() {
        let mut col = new_column("fixed_string(4)").unwrap();
        col.append(&["ab".into(), "abcd".into()]).unwrap();
        assert!(col.append_row(&"abcde".into()).is_err());
        assert_eq!(col.rows(), 2);
        assert_eq!(col.row(0), Value::String("ab\0\0".to_string()));

        let mut enc = Encoder::new();
        col.encode(&mut enc);
        assert_eq!(&enc.take()[..], b"ab\0\0abcd");
    }
}
