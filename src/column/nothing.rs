use super::{Column, ConverterError};
use crate::error::Result;
use crate::proto::{Decoder, Encoder};
use crate::types::Value;

/// `nothing`: the type of a bare `NULL`. Every row is null and takes one placeholder byte.
#[derive(Debug, Clone)]
pub struct Nothing {
    type_name: String,
    rows: usize,
}

impl Nothing {
    pub fn new(type_name: &str) -> Self {
        Nothing {
            type_name: type_name.to_string(),
            rows: 0,
        }
    }
}

impl Column for Nothing {
    fn column_type(&self) -> &str {
        &self.type_name
    }

    fn rows(&self) -> usize {
        self.rows
    }

    fn row(&self, _i: usize) -> Value {
        Value::Null
    }

    fn append_row(&mut self, value: &Value) -> std::result::Result<(), ConverterError> {
        if !value.is_null() {
            return Err(ConverterError::append(value, &self.type_name));
        }
        self.rows += 1;
        Ok(())
    }

    fn append_default(&mut self) {
        self.rows += 1;
    }

    fn truncate(&mut self, rows: usize) {
        self.rows = self.rows.min(rows);
    }

    fn decode(&mut self, decoder: &mut Decoder<'_>, rows: usize) -> Result<()> {
        decoder.take(rows)?;
        self.rows += rows;
        Ok(())
    }

    fn encode(&self, encoder: &mut Encoder) {
        encoder.raw(&vec![b'0'; self.rows]);
    }

    fn new_empty(&self) -> Box<dyn Column> {
        Box::new(Nothing::new(&self.type_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nulls_only() {
        let mut col = Nothing::new("nothing");
        col.append(&[Value::Null, Value::Null]).unwrap();
        assert!(col.append_row(&Value::Int8(1)).is_err());
        let mut enc = Encoder::new();
        col.encode(&mut enc);
        assert_eq!(enc.len(), 2);
        assert_eq!(col.row(1), Value::Null);
    }
}
