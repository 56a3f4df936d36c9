use std::fmt;

use super::{Column, ConverterError};
use crate::error::Result;
use crate::proto::{byte_len, Decoder, Encoder};
use crate::types::Value;

/// A fixed-width little-endian scalar.
pub trait Primitive: Copy + Default + PartialEq + Send + Sync + fmt::Debug + 'static {
    const SIZE: usize;

    fn from_le(bytes: &[u8]) -> Self;
    fn write(self, encoder: &mut Encoder);
    fn to_value(self) -> Value;
    fn from_value(value: &Value) -> Option<Self>;
}

macro_rules! primitive_int {
    ($($t:ty => $variant:ident, $write:ident, $view:ident);* $(;)?) => {$(
        impl Primitive for $t {
            const SIZE: usize = std::mem::size_of::<$t>();

            #[inline]
            fn from_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(bytes);
                <$t>::from_le_bytes(raw)
            }

            #[inline]
            fn write(self, encoder: &mut Encoder) {
                encoder.$write(self);
            }

            #[inline]
            fn to_value(self) -> Value {
                Value::$variant(self)
            }

            fn from_value(value: &Value) -> Option<Self> {
                value.$view().and_then(|v| <$t>::try_from(v).ok())
            }
        }
    )*};
}

primitive_int!(
    i8 => Int8, i8, as_i128;
    i16 => Int16, i16, as_i128;
    i32 => Int32, i32, as_i128;
    i64 => Int64, i64, as_i128;
    i128 => Int128, i128, as_i128;
    u8 => UInt8, u8, as_u128;
    u16 => UInt16, u16, as_u128;
    u32 => UInt32, u32, as_u128;
    u64 => UInt64, u64, as_u128;
    u128 => UInt128, u128, as_u128;
);

impl Primitive for f32 {
    const SIZE: usize = 4;

    fn from_le(bytes: &[u8]) -> Self {
        f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    fn write(self, encoder: &mut Encoder) {
        encoder.f32(self);
    }

    fn to_value(self) -> Value {
        Value::Float32(self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match *value {
            Value::Float32(v) => Some(v),
            _ => value.as_f64().map(|v| v as f32),
        }
    }
}

impl Primitive for f64 {
    const SIZE: usize = 8;

    fn from_le(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        f64::from_le_bytes(raw)
    }

    fn write(self, encoder: &mut Encoder) {
        encoder.f64(self);
    }

    fn to_value(self) -> Value {
        Value::Float64(self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        value.as_f64()
    }
}

/// Integer and float columns.
#[derive(Debug, Clone)]
pub struct Numeric<T> {
    type_name: String,
    data: Vec<T>,
}

impl<T: Primitive> Numeric<T> {
    pub fn new(type_name: &str) -> Self {
        Numeric {
            type_name: type_name.to_string(),
            data: Vec::new(),
        }
    }

    pub fn values(&self) -> &[T] {
        &self.data
    }

    pub fn push(&mut self, v: T) {
        self.data.push(v);
    }

    pub(crate) fn decode_values(decoder: &mut Decoder<'_>, rows: usize, out: &mut Vec<T>) -> Result<()> {
        let raw = decoder.take(byte_len(rows, T::SIZE)?)?;
        out.extend(raw.chunks_exact(T::SIZE).map(T::from_le));
        Ok(())
    }
}

impl<T: Primitive> Column for Numeric<T> {
    fn column_type(&self) -> &str {
        &self.type_name
    }

    fn rows(&self) -> usize {
        self.data.len()
    }

    fn row(&self, i: usize) -> Value {
        self.data[i].to_value()
    }

    fn append_row(&mut self, value: &Value) -> std::result::Result<(), ConverterError> {
        let v = T::from_value(value).ok_or_else(|| ConverterError::append(value, &self.type_name))?;
        self.data.push(v);
        Ok(())
    }

    fn append_default(&mut self) {
        self.data.push(T::default());
    }

    fn truncate(&mut self, rows: usize) {
        self.data.truncate(rows);
    }

    fn decode(&mut self, decoder: &mut Decoder<'_>, rows: usize) -> Result<()> {
        Self::decode_values(decoder, rows, &mut self.data)
    }

    fn encode(&self, encoder: &mut Encoder) {
        for v in &self.data {
            v.write(encoder);
        }
    }

    fn new_empty(&self) -> Box<dyn Column> {
        Box::new(Numeric::<T>::new(&self.type_name))
    }
}

/// `bool`, stored as one byte per row.
#[derive(Debug, Clone)]
pub struct Bool {
    type_name: String,
    data: Vec<bool>,
}

impl Bool {
    pub fn new(type_name: &str) -> Self {
        Bool {
            type_name: type_name.to_string(),
            data: Vec::new(),
        }
    }
}

impl Column for Bool {
    fn column_type(&self) -> &str {
        &self.type_name
    }

    fn rows(&self) -> usize {
        self.data.len()
    }

    fn row(&self, i: usize) -> Value {
        Value::Bool(self.data[i])
    }

    fn append_row(&mut self, value: &Value) -> std::result::Result<(), ConverterError> {
        let v = match value {
            Value::Bool(v) => *v,
            other => match other.as_i128() {
                Some(0) => false,
                Some(1) => true,
                _ => return Err(ConverterError::append(value, &self.type_name)),
            },
        };
        self.data.push(v);
        Ok(())
    }

    fn append_default(&mut self) {
        self.data.push(false);
    }

    fn truncate(&mut self, rows: usize) {
        self.data.truncate(rows);
    }

    fn decode(&mut self, decoder: &mut Decoder<'_>, rows: usize) -> Result<()> {
        let raw = decoder.take(rows)?;
        self.data.extend(raw.iter().map(|b| *b != 0));
        Ok(())
    }

    fn encode(&self, encoder: &mut Encoder) {
        for v in &self.data {
            encoder.bool(*v);
        }
    }

    fn new_empty(&self) -> Box<dyn Column> {
        Box::new(Bool::new(&self.type_name))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{roundtrip, rows_of};
    use super::*;

    #[test]
    fn test_integer_coercion_within_range() {
        let mut col = Numeric::<u8>::new("uint8");
        col.append_row(&Value::Int64(200)).unwrap();
        col.append_row(&Value::UInt8(7)).unwrap();
        assert!(col.append_row(&Value::Int64(256)).is_err());
        assert!(col.append_row(&Value::Int8(-1)).is_err());
        assert!(col.append_row(&Value::String("1".into())).is_err());
        assert_eq!(col.values(), &[200, 7]);
    }

    #[test]
    fn test_wire_layout() {
        let mut col = Numeric::<i32>::new("int32");
        col.append(&[Value::Int32(1), Value::Int32(-1)]).unwrap();
        let mut enc = Encoder::new();
        col.encode(&mut enc);
        assert_eq!(&enc.take()[..], &[1, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_roundtrip_all_widths() {
        let mut col = Numeric::<i128>::new("int128");
        col.append(&[Value::Int128(i128::MIN), Value::Int64(5)]).unwrap();
        assert_eq!(
            rows_of(roundtrip(&col).as_ref()),
            vec![Value::Int128(i128::MIN), Value::Int128(5)]
        );

        let mut col = Numeric::<f64>::new("float64");
        col.append(&[Value::Float64(1.25), Value::Int32(2)]).unwrap();
        assert_eq!(
            rows_of(roundtrip(&col).as_ref()),
            vec![Value::Float64(1.25), Value::Float64(2.0)]
        );

        let mut col = Bool::new("bool");
        col.append(&[Value::Bool(true), Value::UInt8(0)]).unwrap();
        assert_eq!(
            rows_of(roundtrip(&col).as_ref()),
            vec![Value::Bool(true), Value::Bool(false)]
        );
    }

    #[test]
    fn test_short_input_is_eof() {
        let mut col = Numeric::<u64>::new("uint64");
        let mut dec = Decoder::new(&[0u8; 12]);
        assert!(matches!(
            col.decode(&mut dec, 2),
            Err(crate::error::Error::UnexpectedEof)
        ));
    }
}
