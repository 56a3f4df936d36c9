use uuid::Uuid;

use super::{Column, ConverterError};
use crate::error::Result;
use crate::proto::{Decoder, Encoder};
use crate::types::Value;

/// `uuid`: two little-endian u64 halves, most significant half first.
#[derive(Debug, Clone)]
pub struct UuidColumn {
    type_name: String,
    data: Vec<Uuid>,
}

impl UuidColumn {
    pub fn new(type_name: &str) -> Self {
        UuidColumn {
            type_name: type_name.to_string(),
            data: Vec::new(),
        }
    }
}

impl Column for UuidColumn {
    fn column_type(&self) -> &str {
        &self.type_name
    }

    fn rows(&self) -> usize {
        self.data.len()
    }

    fn row(&self, i: usize) -> Value {
        Value::Uuid(self.data[i])
    }

    fn append_row(&mut self, value: &Value) -> std::result::Result<(), ConverterError> {
        let uuid = match value {
            Value::Uuid(u) => Some(*u),
            Value::String(s) => Uuid::parse_str(s).ok(),
            Value::Bytes(b) => Uuid::from_slice(b).ok(),
            _ => None,
        };
        let uuid = uuid.ok_or_else(|| ConverterError::append(value, &self.type_name))?;
        self.data.push(uuid);
        Ok(())
    }

    fn append_default(&mut self) {
        self.data.push(Uuid::nil());
    }

    fn truncate(&mut self, rows: usize) {
        self.data.truncate(rows);
    }

    fn decode(&mut self, decoder: &mut Decoder<'_>, rows: usize) -> Result<()> {
        self.data.reserve(decoder.capacity_hint(rows, 16));
        for _ in 0..rows {
            let high = decoder.u64()?;
            let low = decoder.u64()?;
            self.data.push(Uuid::from_u64_pair(high, low));
        }
        Ok(())
    }

    fn encode(&self, encoder: &mut Encoder) {
        for uuid in &self.data {
            let (high, low) = uuid.as_u64_pair();
            encoder.u64(high);
            encoder.u64(low);
        }
    }

    fn new_empty(&self) -> Box<dyn Column> {
        Box::new(UuidColumn::new(&self.type_name))
    }
}
