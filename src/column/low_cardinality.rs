use std::collections::HashMap;

use super::{corrupt, new_column, Column, ConverterError, TypeSpec};
use crate::error::Result;
use crate::proto::{checked_count, Decoder, Encoder};
use crate::types::Value;

const SHARED_DICTIONARIES_WITH_ADDITIONAL_KEYS: u64 = 1;

const KEY_U8: u64 = 0;
const KEY_U16: u64 = 1;
const KEY_U32: u64 = 2;
const KEY_U64: u64 = 3;
const KEY_TYPE_MASK: u64 = 0xFF;
const HAS_ADDITIONAL_KEYS: u64 = 1 << 9;
const NEED_UPDATE_DICTIONARY: u64 = 1 << 10;

/// `low_cardinality(T)`: a dictionary of distinct values plus one index per row.
///
/// For a nullable `T` the dictionary holds the non-null type and index 0 stands for null.
#[derive(Debug)]
pub struct LowCardinality {
    type_name: String,
    nullable: bool,
    dict: Box<dyn Column>,
    lookup: HashMap<Vec<u8>, u64>,
    keys: Vec<u64>,
}

impl LowCardinality {
    pub fn parse(spec: &TypeSpec<'_>) -> Result<Self> {
        let inner = TypeSpec::parse(spec.arg(0)?)?;
        let (nullable, dict_type) = if inner.key == "nullable" {
            (true, inner.arg(0)?)
        } else {
            (false, inner.full)
        };
        Ok(Self::new(spec.full, nullable, new_column(dict_type)?))
    }

    pub fn new(type_name: &str, nullable: bool, dict: Box<dyn Column>) -> Self {
        let mut column = LowCardinality {
            type_name: type_name.to_string(),
            nullable,
            dict,
            lookup: HashMap::new(),
            keys: Vec::new(),
        };
        column.reset_dictionary();
        column
    }

    fn reset_dictionary(&mut self) {
        self.dict = self.dict.new_empty();
        self.lookup.clear();
        if self.nullable {
            self.dict.append_default();
        }
    }

    /// Number of dictionary entries, including the null placeholder.
    pub fn dictionary_len(&self) -> usize {
        self.dict.rows()
    }

    pub fn keys(&self) -> &[u64] {
        &self.keys
    }

    /// Deduplicate the entry just appended to the dictionary and return its index.
    fn intern_last(&mut self) -> u64 {
        let pos = self.dict.rows() - 1;
        let key = self.dict.row(pos).key_bytes();
        match self.lookup.get(&key) {
            Some(&existing) => {
                self.dict.truncate(pos);
                existing
            }
            None => {
                self.lookup.insert(key, pos as u64);
                pos as u64
            }
        }
    }

    fn key_type(&self) -> u64 {
        match self.dict.rows() {
            n if n <= u8::MAX as usize + 1 => KEY_U8,
            n if n <= u16::MAX as usize + 1 => KEY_U16,
            n if n <= u32::MAX as usize + 1 => KEY_U32,
            _ => KEY_U64,
        }
    }
}

impl Column for LowCardinality {
    fn column_type(&self) -> &str {
        &self.type_name
    }

    fn rows(&self) -> usize {
        self.keys.len()
    }

    fn row(&self, i: usize) -> Value {
        let key = self.keys[i];
        if self.nullable && key == 0 {
            return Value::Null;
        }
        self.dict.row(key as usize)
    }

    fn append_row(&mut self, value: &Value) -> std::result::Result<(), ConverterError> {
        if value.is_null() {
            if !self.nullable {
                return Err(ConverterError::append(value, &self.type_name));
            }
            self.keys.push(0);
            return Ok(());
        }
        self.dict
            .append_row(value)
            .map_err(|err| ConverterError {
                to: self.type_name.clone(),
                ..err
            })?;
        let key = self.intern_last();
        self.keys.push(key);
        Ok(())
    }

    fn append_default(&mut self) {
        if self.nullable {
            self.keys.push(0);
            return;
        }
        self.dict.append_default();
        let key = self.intern_last();
        self.keys.push(key);
    }

    fn truncate(&mut self, rows: usize) {
        self.keys.truncate(rows);
        if rows == 0 {
            self.reset_dictionary();
        }
    }

    fn decode(&mut self, decoder: &mut Decoder<'_>, rows: usize) -> Result<()> {
        if rows == 0 {
            return Ok(());
        }
        let flags = decoder.u64()?;
        let key_type = flags & KEY_TYPE_MASK;
        let dict_rows = checked_count(decoder.u64()?)?;
        let mut dict = self.dict.new_empty();
        dict.decode(decoder, dict_rows)?;
        if dict.rows() != dict_rows {
            return Err(corrupt(
                &self.type_name,
                format!("dictionary decoded {} of {} rows", dict.rows(), dict_rows),
            ));
        }

        let key_rows = checked_count(decoder.u64()?)?;
        if key_rows != rows {
            return Err(corrupt(
                &self.type_name,
                format!("expected {} keys, got {}", rows, key_rows),
            ));
        }
        let mut raw_keys = Vec::with_capacity(decoder.capacity_hint(rows, 1));
        for _ in 0..rows {
            let key = match key_type {
                KEY_U8 => decoder.u8()? as u64,
                KEY_U16 => decoder.u16()? as u64,
                KEY_U32 => decoder.u32()? as u64,
                KEY_U64 => decoder.u64()?,
                other => return Err(corrupt(&self.type_name, format!("invalid key type {}", other))),
            };
            if key >= dict_rows as u64 {
                return Err(corrupt(&self.type_name, format!("key {} out of dictionary", key)));
            }
            raw_keys.push(key);
        }

        // Merge the received dictionary into ours, remapping keys.
        let mut remap = vec![0u64; dict_rows];
        for (i, slot) in remap.iter_mut().enumerate() {
            if self.nullable && i == 0 {
                continue;
            }
            let value = dict.row(i);
            self.dict
                .append_row(&value)
                .map_err(|err| corrupt(&self.type_name, err))?;
            *slot = self.intern_last();
        }
        self.keys.extend(raw_keys.into_iter().map(|k| remap[k as usize]));
        Ok(())
    }

    fn encode(&self, encoder: &mut Encoder) {
        if self.keys.is_empty() {
            return;
        }
        let key_type = self.key_type();
        encoder.u64(key_type | HAS_ADDITIONAL_KEYS | NEED_UPDATE_DICTIONARY);
        encoder.u64(self.dict.rows() as u64);
        self.dict.encode(encoder);
        encoder.u64(self.keys.len() as u64);
        for key in &self.keys {
            match key_type {
                KEY_U8 => encoder.u8(*key as u8),
                KEY_U16 => encoder.u16(*key as u16),
                KEY_U32 => encoder.u32(*key as u32),
                _ => encoder.u64(*key),
            }
        }
    }

    fn decode_prefix(&mut self, decoder: &mut Decoder<'_>) -> Result<()> {
        let version = decoder.u64()?;
        if version != SHARED_DICTIONARIES_WITH_ADDITIONAL_KEYS {
            return Err(corrupt(
                &self.type_name,
                format!("unsupported serialization version {}", version),
            ));
        }
        Ok(())
    }

    fn encode_prefix(&self, encoder: &mut Encoder) {
        encoder.u64(SHARED_DICTIONARIES_WITH_ADDITIONAL_KEYS);
    }

    fn new_empty(&self) -> Box<dyn Column> {
        Box::new(LowCardinality::new(
            &self.type_name,
            self.nullable,
            self.dict.new_empty(),
        ))
    }

    fn is_nullable(&self) -> bool {
        self.nullable
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{roundtrip, rows_of};
    use super::*;

    fn lc(type_name: &str) -> LowCardinality {
        LowCardinality::parse(&TypeSpec::parse(type_name).unwrap()).unwrap()
    }

    #[test]
    fn test_dictionary_reuse() {
        let mut col = lc("low_cardinality(string)");
        for _ in 0..5 {
            col.append_row(&Value::from("same")).unwrap();
        }
        assert_eq!(col.dictionary_len(), 1);
        assert_eq!(col.keys(), &[0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_insertion_order_is_preserved() {
        let mut col = lc("low_cardinality(string)");
        col.append(&["b".into(), "a".into(), "b".into(), "c".into()])
            .unwrap();
        assert_eq!(col.keys(), &[0, 1, 0, 2]);
        assert_eq!(
            rows_of(roundtrip(&col).as_ref()),
            vec!["b".into(), "a".into(), "b".into(), "c".into()]
        );
    }

    #[test]
    fn test_nullable_reserves_index_zero() {
        let mut col = lc("low_cardinality(nullable(string))");
        col.append(&[Value::Null, "x".into(), Value::Null, "x".into()])
            .unwrap();
        assert_eq!(col.dictionary_len(), 2);
        assert_eq!(col.keys(), &[0, 1, 0, 1]);
        assert_eq!(
            rows_of(roundtrip(&col).as_ref()),
            vec![Value::Null, "x".into(), Value::Null, "x".into()]
        );

        let mut strict = lc("low_cardinality(string)");
        assert!(strict.append_row(&Value::Null).is_err());
    }

    #[test]
    fn test_wire_layout() {
        let mut col = lc("low_cardinality(string)");
        col.append(&["a".into(), "a".into()]).unwrap();
        let mut enc = Encoder::new();
        col.encode_prefix(&mut enc);
        col.encode(&mut enc);
        let bytes = enc.take();

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.u64().unwrap(), 1);
        assert_eq!(dec.u64().unwrap(), KEY_U8 | HAS_ADDITIONAL_KEYS | NEED_UPDATE_DICTIONARY);
        assert_eq!(dec.u64().unwrap(), 1);
        assert_eq!(dec.string().unwrap(), "a");
        assert_eq!(dec.u64().unwrap(), 2);
        assert_eq!(dec.u8().unwrap(), 0);
        assert_eq!(dec.u8().unwrap(), 0);
        assert!(dec.is_empty());
    }

    #[test]
    fn test_array_of_low_cardinality() {
        let mut col = new_column("array(low_cardinality(string))").unwrap();
        let rows = vec![
            Value::Array(vec!["x".into(), "y".into()]),
            Value::Array(vec!["x".into()]),
        ];
        col.append(&rows).unwrap();
        assert_eq!(rows_of(roundtrip(col.as_ref()).as_ref()), rows);
    }
}
