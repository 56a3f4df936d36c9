use std::collections::HashMap;

use super::{corrupt, unquote, Column, ConverterError, TypeSpec};
use crate::error::Result;
use crate::proto::{Decoder, Encoder};
use crate::types::Value;

/// `enum8(...)` / `enum16(...)`: symbols stored as their declared integer.
#[derive(Debug, Clone)]
pub struct Enum {
    type_name: String,
    wide: bool,
    by_name: HashMap<String, i16>,
    by_value: HashMap<i16, String>,
    data: Vec<i16>,
}

/// Parse `'name' = value` pairs. Symbols without an explicit value are numbered from 1.
fn parse_symbols(spec: &TypeSpec<'_>, wide: bool) -> Result<Vec<(String, i16)>> {
    let mut symbols = Vec::with_capacity(spec.args.len());
    for (i, arg) in spec.args.iter().enumerate() {
        let (name, value) = match arg.rfind('=') {
            Some(eq) if arg[eq + 1..].trim().parse::<i16>().is_ok() => {
                (&arg[..eq], arg[eq + 1..].trim().parse::<i16>().ok())
            }
            _ => (*arg, None),
        };
        let name = unquote(name).ok_or_else(|| spec.unsupported())?;
        let value = value.unwrap_or(i as i16 + 1);
        if !wide && i8::try_from(value).is_err() {
            return Err(spec.unsupported());
        }
        symbols.push((name, value));
    }
    if symbols.is_empty() {
        return Err(spec.unsupported());
    }
    Ok(symbols)
}

impl Enum {
    pub fn parse(spec: &TypeSpec<'_>, bits: u8) -> Result<Self> {
        let wide = bits == 16;
        let symbols = parse_symbols(spec, wide)?;
        Ok(Enum {
            type_name: spec.full.to_string(),
            wide,
            by_name: symbols.iter().cloned().collect(),
            by_value: symbols.into_iter().map(|(n, v)| (v, n)).collect(),
            data: Vec::new(),
        })
    }

    fn min_value(&self) -> i16 {
        self.by_value.keys().copied().min().unwrap_or_default()
    }
}

impl Column for Enum {
    fn column_type(&self) -> &str {
        &self.type_name
    }

    fn rows(&self) -> usize {
        self.data.len()
    }

    fn row(&self, i: usize) -> Value {
        match self.by_value.get(&self.data[i]) {
            Some(name) => Value::String(name.clone()),
            None => Value::Int16(self.data[i]),
        }
    }

    fn append_row(&mut self, value: &Value) -> std::result::Result<(), ConverterError> {
        let v = match value {
            Value::String(name) => self.by_name.get(name).copied().ok_or_else(|| {
                ConverterError::append(value, &self.type_name)
                    .with_hint(format!("unknown enum symbol '{}'", name))
            })?,
            other => other
                .as_i128()
                .and_then(|v| i16::try_from(v).ok())
                .filter(|v| self.by_value.contains_key(v))
                .ok_or_else(|| {
                    ConverterError::append(value, &self.type_name)
                        .with_hint("value is not a declared enum member")
                })?,
        };
        self.data.push(v);
        Ok(())
    }

    fn append_default(&mut self) {
        let v = self.min_value();
        self.data.push(v);
    }

    fn truncate(&mut self, rows: usize) {
        self.data.truncate(rows);
    }

    fn decode(&mut self, decoder: &mut Decoder<'_>, rows: usize) -> Result<()> {
        self.data.reserve(decoder.capacity_hint(rows, 1));
        for _ in 0..rows {
            let v = if self.wide {
                decoder.i16()?
            } else {
                decoder.i8()? as i16
            };
            if !self.by_value.contains_key(&v) {
                return Err(corrupt(&self.type_name, format!("undeclared value {}", v)));
            }
            self.data.push(v);
        }
        Ok(())
    }

    fn encode(&self, encoder: &mut Encoder) {
        for v in &self.data {
            if self.wide {
                encoder.i16(*v);
            } else {
                encoder.i8(*v as i8);
            }
        }
    }

    fn new_empty(&self) -> Box<dyn Column> {
        Box::new(Enum {
            data: Vec::new(),
            ..self.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{roundtrip, rows_of};
    use super::super::new_column;
    use super::*;

    #[test]
    fn test_symbols_by_name_and_value() {
        let mut col = new_column("enum8('a' = 1, 'b' = -2)").unwrap();
        col.append(&["b".into(), Value::Int8(1)]).unwrap();
        let err = col.append_row(&"c".into()).unwrap_err();
        assert!(err.to_string().contains("unknown enum symbol 'c'"));
        assert!(col.append_row(&Value::Int8(3)).is_err());

        let mut enc = Encoder::new();
        col.encode(&mut enc);
        assert_eq!(&enc.take()[..], &[0xFE, 0x01]);
        assert_eq!(
            rows_of(roundtrip(col.as_ref()).as_ref()),
            vec!["b".into(), "a".into()]
        );
    }

    #[test]
    fn test_quoted_symbols() {
        let mut col = new_column("enum16('x = y' = 1000, 'it''s' = 2)").unwrap();
        col.append(&["x = y".into(), "it's".into()]).unwrap();
        assert_eq!(
            rows_of(roundtrip(col.as_ref()).as_ref()),
            vec!["x = y".into(), "it's".into()]
        );
    }

    #[test]
    fn test_enum8_range() {
        assert!(new_column("enum8('a' = 200)").is_err());
    }
}
