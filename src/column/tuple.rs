use super::{new_column, Column, ConverterError, Numeric, TypeSpec};
use crate::error::Result;
use crate::proto::{Decoder, Encoder};
use crate::types::Value;

/// `tuple(T1, ..., Tn)`, optionally with element names: each element column is written in turn.
#[derive(Debug)]
pub struct Tuple {
    type_name: String,
    names: Vec<Option<String>>,
    elements: Vec<Box<dyn Column>>,
    rows: usize,
}

/// Split `name type` from a named tuple element. A bare type never has a space before its
/// first parenthesis or quote.
fn split_named(arg: &str) -> (Option<&str>, &str) {
    let head_end = arg.find(['(', '\'']).unwrap_or(arg.len());
    match arg[..head_end].find(' ') {
        Some(space) => (Some(arg[..space].trim()), arg[space..].trim()),
        None => (None, arg),
    }
}

impl Tuple {
    pub fn parse(spec: &TypeSpec<'_>) -> Result<Self> {
        if spec.args.is_empty() {
            return Err(spec.unsupported());
        }
        let mut names = Vec::with_capacity(spec.args.len());
        let mut elements = Vec::with_capacity(spec.args.len());
        for arg in &spec.args {
            let (name, type_name) = split_named(arg);
            names.push(name.map(str::to_string));
            elements.push(new_column(type_name)?);
        }
        Ok(Self::new(spec.full, names, elements))
    }

    pub fn new(type_name: &str, names: Vec<Option<String>>, elements: Vec<Box<dyn Column>>) -> Self {
        Tuple {
            type_name: type_name.to_string(),
            names,
            elements,
            rows: 0,
        }
    }

    /// `point`: a pair of float64 coordinates.
    pub fn point(type_name: &str) -> Self {
        let elements: Vec<Box<dyn Column>> = vec![
            Box::new(Numeric::<f64>::new("float64")),
            Box::new(Numeric::<f64>::new("float64")),
        ];
        Self::new(type_name, vec![None, None], elements)
    }

    pub fn elements(&self) -> &[Box<dyn Column>] {
        &self.elements
    }

    fn is_named(&self) -> bool {
        self.names.iter().all(Option::is_some)
    }

    fn append_items(&mut self, items: &[&Value], original: &Value) -> std::result::Result<(), ConverterError> {
        if items.len() != self.elements.len() {
            return Err(ConverterError::append(original, &self.type_name).with_hint(format!(
                "expected {} elements, got {}",
                self.elements.len(),
                items.len()
            )));
        }
        for (i, item) in items.iter().enumerate() {
            if let Err(err) = self.elements[i].append_row(item) {
                for element in &mut self.elements[..i] {
                    element.truncate(self.rows);
                }
                return Err(err);
            }
        }
        self.rows += 1;
        Ok(())
    }
}

impl Column for Tuple {
    fn column_type(&self) -> &str {
        &self.type_name
    }

    fn rows(&self) -> usize {
        self.rows
    }

    fn row(&self, i: usize) -> Value {
        Value::Tuple(self.elements.iter().map(|e| e.row(i)).collect())
    }

    fn append_row(&mut self, value: &Value) -> std::result::Result<(), ConverterError> {
        match value {
            Value::Tuple(items) | Value::Array(items) => {
                let items: Vec<&Value> = items.iter().collect();
                self.append_items(&items, value)
            }
            Value::Object(fields) if self.is_named() => {
                let null = Value::Null;
                let items: Vec<&Value> = self
                    .names
                    .iter()
                    .map(|name| {
                        name.as_deref()
                            .and_then(|n| fields.get(n))
                            .unwrap_or(&null)
                    })
                    .collect();
                self.append_items(&items, value)
            }
            _ => Err(ConverterError::append(value, &self.type_name)),
        }
    }

    fn append_default(&mut self) {
        for element in &mut self.elements {
            element.append_default();
        }
        self.rows += 1;
    }

    fn truncate(&mut self, rows: usize) {
        if rows >= self.rows {
            return;
        }
        for element in &mut self.elements {
            element.truncate(rows);
        }
        self.rows = rows;
    }

    fn decode(&mut self, decoder: &mut Decoder<'_>, rows: usize) -> Result<()> {
        for element in &mut self.elements {
            element.decode(decoder, rows)?;
        }
        self.rows += rows;
        Ok(())
    }

    fn encode(&self, encoder: &mut Encoder) {
        for element in &self.elements {
            element.encode(encoder);
        }
    }

    fn decode_prefix(&mut self, decoder: &mut Decoder<'_>) -> Result<()> {
        for element in &mut self.elements {
            element.decode_prefix(decoder)?;
        }
        Ok(())
    }

    fn encode_prefix(&self, encoder: &mut Encoder) {
        for element in &self.elements {
            element.encode_prefix(encoder);
        }
    }

    fn new_empty(&self) -> Box<dyn Column> {
        Box::new(Tuple::new(
            &self.type_name,
            self.names.clone(),
            self.elements.iter().map(|e| e.new_empty()).collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::super::testing::{roundtrip, rows_of};
    use super::*;

    #[test]
    fn test_split_named() {
        assert_eq!(split_named("a int8"), (Some("a"), "int8"));
        assert_eq!(split_named("b nullable(string)"), (Some("b"), "nullable(string)"));
        assert_eq!(split_named("decimal(10, 2)"), (None, "decimal(10, 2)"));
        assert_eq!(split_named("datetime('Asia/Shanghai')"), (None, "datetime('Asia/Shanghai')"));
    }

    #[test]
    fn test_named_tuple_accepts_objects() {
        let mut col = new_column("tuple(a int8, b string)").unwrap();
        let mut fields = BTreeMap::new();
        fields.insert("b".to_string(), Value::from("x"));
        fields.insert("a".to_string(), Value::Int8(1));
        col.append_row(&Value::Object(fields)).unwrap();
        col.append_row(&Value::Tuple(vec![Value::Int8(2), "y".into()]))
            .unwrap();

        assert_eq!(
            rows_of(roundtrip(col.as_ref()).as_ref()),
            vec![
                Value::Tuple(vec![Value::Int8(1), "x".into()]),
                Value::Tuple(vec![Value::Int8(2), "y".into()]),
            ]
        );
    }

    #[test]
    fn test_partial_failure_rolls_back() {
        let mut col = new_column("tuple(int8, int8)").unwrap();
        assert!(col
            .append_row(&Value::Tuple(vec![Value::Int8(1), Value::from("no")]))
            .is_err());
        assert!(col.append_row(&Value::Tuple(vec![Value::Int8(1)])).is_err());
        assert_eq!(col.rows(), 0);

        let mut enc = Encoder::new();
        col.encode(&mut enc);
        assert!(enc.is_empty());
    }

    #[test]
    fn test_point_roundtrip() {
        let mut col = new_column("point").unwrap();
        col.append_row(&Value::Tuple(vec![Value::Float64(1.5), Value::Int32(2)]))
            .unwrap();
        assert_eq!(
            rows_of(roundtrip(col.as_ref()).as_ref()),
            vec![Value::Tuple(vec![Value::Float64(1.5), Value::Float64(2.0)])]
        );
    }
}
