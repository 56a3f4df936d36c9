//! Host-side values exchanged with columns.
//!
//! Every column accepts and produces [`Value`]s. Typed access goes through [`FromValue`],
//! and serde types are bridged through `serde_json::Value`.

mod convert;
mod decimal;

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

pub use convert::{from_json, to_json, FromValue};
pub use decimal::{Decimal, ParseDecimalError, I256};

// ============================================================================
// Values
// ============================================================================

/// A single cell value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Int128(i128),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    UInt128(u128),
    Float32(f32),
    Float64(f64),
    String(String),
    /// Raw bytes, for string columns holding non-UTF-8 data.
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
    Decimal(Decimal),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Array(Vec<Value>),
    Tuple(Vec<Value>),
    Map(Vec<(Value, Value)>),
    /// A JSON object, keyed by escaped path.
    Object(BTreeMap<String, Value>),
}

impl Value {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short name of the variant, used in conversion errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int8(_) => "int8",
            Value::Int16(_) => "int16",
            Value::Int32(_) => "int32",
            Value::Int64(_) => "int64",
            Value::Int128(_) => "int128",
            Value::UInt8(_) => "uint8",
            Value::UInt16(_) => "uint16",
            Value::UInt32(_) => "uint32",
            Value::UInt64(_) => "uint64",
            Value::UInt128(_) => "uint128",
            Value::Float32(_) => "float32",
            Value::Float64(_) => "float64",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Uuid(_) => "uuid",
            Value::Date(_) => "date",
            Value::DateTime(_) => "datetime",
            Value::Decimal(_) => "decimal",
            Value::Ipv4(_) => "ipv4",
            Value::Ipv6(_) => "ipv6",
            Value::Array(_) => "array",
            Value::Tuple(_) => "tuple",
            Value::Map(_) => "map",
            Value::Object(_) => "object",
        }
    }

    /// The value as a signed integer, when it is an integer that fits.
    pub fn as_i128(&self) -> Option<i128> {
        match *self {
            Value::Bool(v) => Some(v as i128),
            Value::Int8(v) => Some(v as i128),
            Value::Int16(v) => Some(v as i128),
            Value::Int32(v) => Some(v as i128),
            Value::Int64(v) => Some(v as i128),
            Value::Int128(v) => Some(v),
            Value::UInt8(v) => Some(v as i128),
            Value::UInt16(v) => Some(v as i128),
            Value::UInt32(v) => Some(v as i128),
            Value::UInt64(v) => Some(v as i128),
            Value::UInt128(v) => i128::try_from(v).ok(),
            _ => None,
        }
    }

    /// The value as an unsigned integer, when it is a non-negative integer.
    pub fn as_u128(&self) -> Option<u128> {
        match *self {
            Value::UInt128(v) => Some(v),
            _ => self.as_i128().and_then(|v| u128::try_from(v).ok()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Float32(v) => Some(v as f64),
            Value::Float64(v) => Some(v),
            Value::Bool(_) => None,
            _ => self.as_i128().map(|v| v as f64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Canonical bytes identifying this value, used to deduplicate dictionary entries.
    ///
    /// Two values with the same kind and contents produce the same key.
    pub fn key_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        self.write_key(&mut out);
        out
    }

    fn write_key(&self, out: &mut Vec<u8>) {
        out.push(self.kind().len() as u8);
        out.extend_from_slice(self.kind().as_bytes());
        match self {
            Value::Null => {}
            Value::Bool(v) => out.push(*v as u8),
            Value::Int8(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Int16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Int32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Int64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Int128(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::UInt8(v) => out.push(*v),
            Value::UInt16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::UInt32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::UInt64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::UInt128(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Float32(v) => out.extend_from_slice(&v.to_bits().to_le_bytes()),
            Value::Float64(v) => out.extend_from_slice(&v.to_bits().to_le_bytes()),
            Value::String(s) => write_len_prefixed(out, s.as_bytes()),
            Value::Bytes(b) => write_len_prefixed(out, b),
            Value::Uuid(u) => out.extend_from_slice(u.as_bytes()),
            Value::Date(d) => write_len_prefixed(out, d.to_string().as_bytes()),
            Value::DateTime(d) => out.extend_from_slice(
                &d.timestamp_nanos_opt()
                    .unwrap_or_else(|| d.timestamp())
                    .to_le_bytes(),
            ),
            Value::Decimal(d) => write_len_prefixed(out, d.to_string().as_bytes()),
            Value::Ipv4(ip) => out.extend_from_slice(&ip.octets()),
            Value::Ipv6(ip) => out.extend_from_slice(&ip.octets()),
            Value::Array(items) | Value::Tuple(items) => {
                out.extend_from_slice(&(items.len() as u64).to_le_bytes());
                for item in items {
                    item.write_key(out);
                }
            }
            Value::Map(entries) => {
                out.extend_from_slice(&(entries.len() as u64).to_le_bytes());
                for (k, v) in entries {
                    k.write_key(out);
                    v.write_key(out);
                }
            }
            Value::Object(fields) => {
                out.extend_from_slice(&(fields.len() as u64).to_le_bytes());
                for (k, v) in fields {
                    write_len_prefixed(out, k.as_bytes());
                    v.write_key(out);
                }
            }
        }
    }
}

fn write_len_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    out.extend_from_slice(bytes);
}

// ============================================================================
// Conversions into Value
// ============================================================================

macro_rules! value_from {
    ($($t:ty => $variant:ident),* $(,)?) => {$(
        impl From<$t> for Value {
            #[inline]
            fn from(v: $t) -> Self {
                Value::$variant(v)
            }
        }
    )*};
}

value_from!(
    bool => Bool,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    i128 => Int128,
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    u128 => UInt128,
    f32 => Float32,
    f64 => Float64,
    String => String,
    Uuid => Uuid,
    NaiveDate => Date,
    DateTime<Utc> => DateTime,
    Decimal => Decimal,
    Ipv4Addr => Ipv4,
    Ipv6Addr => Ipv6,
);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Object(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        from_json(v)
    }
}
