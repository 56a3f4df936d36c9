//! Typed extraction from [`Value`] and the serde bridge.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::net::{Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use uuid::Uuid;

use super::{Decimal, Value};
use crate::column::json_path::{escape_json_path, split_json_path};
use crate::column::ConverterError;

/// Conversion from a cell value into a Rust type.
pub trait FromValue: Sized {
    /// Name used as the destination in conversion errors.
    const TYPE_NAME: &'static str;

    fn from_value(value: Value) -> Result<Self, ConverterError>;
}

fn mismatch<T: FromValue>(value: &Value) -> ConverterError {
    ConverterError::new("ScanRow", value.kind(), T::TYPE_NAME)
}

impl FromValue for Value {
    const TYPE_NAME: &'static str = "Value";

    fn from_value(value: Value) -> Result<Self, ConverterError> {
        Ok(value)
    }
}

macro_rules! from_value_signed {
    ($($t:ty),*) => {$(
        impl FromValue for $t {
            const TYPE_NAME: &'static str = stringify!($t);

            fn from_value(value: Value) -> Result<Self, ConverterError> {
                value
                    .as_i128()
                    .and_then(|v| <$t>::try_from(v).ok())
                    .ok_or_else(|| mismatch::<$t>(&value))
            }
        }
    )*};
}

macro_rules! from_value_unsigned {
    ($($t:ty),*) => {$(
        impl FromValue for $t {
            const TYPE_NAME: &'static str = stringify!($t);

            fn from_value(value: Value) -> Result<Self, ConverterError> {
                value
                    .as_u128()
                    .and_then(|v| <$t>::try_from(v).ok())
                    .ok_or_else(|| mismatch::<$t>(&value))
            }
        }
    )*};
}

from_value_signed!(i8, i16, i32, i64, i128);
from_value_unsigned!(u8, u16, u32, u64, u128);

impl FromValue for f64 {
    const TYPE_NAME: &'static str = "f64";

    fn from_value(value: Value) -> Result<Self, ConverterError> {
        value.as_f64().ok_or_else(|| mismatch::<f64>(&value))
    }
}

impl FromValue for f32 {
    const TYPE_NAME: &'static str = "f32";

    fn from_value(value: Value) -> Result<Self, ConverterError> {
        match value {
            Value::Float32(v) => Ok(v),
            other => other
                .as_f64()
                .map(|v| v as f32)
                .ok_or_else(|| mismatch::<f32>(&other)),
        }
    }
}

impl FromValue for bool {
    const TYPE_NAME: &'static str = "bool";

    fn from_value(value: Value) -> Result<Self, ConverterError> {
        match value {
            Value::Bool(v) => Ok(v),
            Value::UInt8(v @ (0 | 1)) => Ok(v == 1),
            other => Err(mismatch::<bool>(&other)),
        }
    }
}

impl FromValue for String {
    const TYPE_NAME: &'static str = "String";

    fn from_value(value: Value) -> Result<Self, ConverterError> {
        match value {
            Value::String(s) => Ok(s),
            Value::Bytes(b) => Ok(String::from_utf8_lossy(&b).into_owned()),
            Value::Uuid(u) => Ok(u.to_string()),
            Value::Decimal(d) => Ok(d.to_string()),
            Value::Ipv4(ip) => Ok(ip.to_string()),
            Value::Ipv6(ip) => Ok(ip.to_string()),
            Value::Date(d) => Ok(d.to_string()),
            obj @ Value::Object(_) => Ok(to_json(&obj).to_string()),
            other => Err(mismatch::<String>(&other)),
        }
    }
}

impl FromValue for Uuid {
    const TYPE_NAME: &'static str = "Uuid";

    fn from_value(value: Value) -> Result<Self, ConverterError> {
        match value {
            Value::Uuid(u) => Ok(u),
            Value::String(ref s) => Uuid::parse_str(s).map_err(|_| mismatch::<Uuid>(&value)),
            other => Err(mismatch::<Uuid>(&other)),
        }
    }
}

impl FromValue for NaiveDate {
    const TYPE_NAME: &'static str = "NaiveDate";

    fn from_value(value: Value) -> Result<Self, ConverterError> {
        match value {
            Value::Date(d) => Ok(d),
            Value::DateTime(dt) => Ok(dt.date_naive()),
            other => Err(mismatch::<NaiveDate>(&other)),
        }
    }
}

impl FromValue for DateTime<Utc> {
    const TYPE_NAME: &'static str = "DateTime<Utc>";

    fn from_value(value: Value) -> Result<Self, ConverterError> {
        match value {
            Value::DateTime(dt) => Ok(dt),
            Value::Date(d) => Ok(d.and_time(chrono::NaiveTime::MIN).and_utc()),
            other => Err(mismatch::<DateTime<Utc>>(&other)),
        }
    }
}

impl FromValue for Decimal {
    const TYPE_NAME: &'static str = "Decimal";

    fn from_value(value: Value) -> Result<Self, ConverterError> {
        match value {
            Value::Decimal(d) => Ok(d),
            Value::String(ref s) => s.parse().map_err(|_| mismatch::<Decimal>(&value)),
            other => other
                .as_i128()
                .map(|v| Decimal::from_i128_scaled(v, 0))
                .ok_or_else(|| mismatch::<Decimal>(&other)),
        }
    }
}

impl FromValue for Ipv4Addr {
    const TYPE_NAME: &'static str = "Ipv4Addr";

    fn from_value(value: Value) -> Result<Self, ConverterError> {
        match value {
            Value::Ipv4(ip) => Ok(ip),
            other => Err(mismatch::<Ipv4Addr>(&other)),
        }
    }
}

impl FromValue for Ipv6Addr {
    const TYPE_NAME: &'static str = "Ipv6Addr";

    fn from_value(value: Value) -> Result<Self, ConverterError> {
        match value {
            Value::Ipv6(ip) => Ok(ip),
            Value::Ipv4(ip) => Ok(ip.to_ipv6_mapped()),
            other => Err(mismatch::<Ipv6Addr>(&other)),
        }
    }
}

impl FromValue for serde_json::Value {
    const TYPE_NAME: &'static str = "serde_json::Value";

    fn from_value(value: Value) -> Result<Self, ConverterError> {
        Ok(to_json(&value))
    }
}

impl<T: FromValue> FromValue for Option<T> {
    const TYPE_NAME: &'static str = T::TYPE_NAME;

    fn from_value(value: Value) -> Result<Self, ConverterError> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    const TYPE_NAME: &'static str = "Vec";

    fn from_value(value: Value) -> Result<Self, ConverterError> {
        match value {
            Value::Array(items) | Value::Tuple(items) => {
                items.into_iter().map(T::from_value).collect()
            }
            other => Err(mismatch::<Vec<T>>(&other)),
        }
    }
}

impl<K: FromValue + Ord, V: FromValue> FromValue for BTreeMap<K, V> {
    const TYPE_NAME: &'static str = "BTreeMap";

    fn from_value(value: Value) -> Result<Self, ConverterError> {
        match value {
            Value::Map(entries) => entries
                .into_iter()
                .map(|(k, v)| Ok((K::from_value(k)?, V::from_value(v)?)))
                .collect(),
            other => Err(mismatch::<BTreeMap<K, V>>(&other)),
        }
    }
}

impl<K: FromValue + Eq + Hash, V: FromValue> FromValue for HashMap<K, V> {
    const TYPE_NAME: &'static str = "HashMap";

    fn from_value(value: Value) -> Result<Self, ConverterError> {
        match value {
            Value::Map(entries) => entries
                .into_iter()
                .map(|(k, v)| Ok((K::from_value(k)?, V::from_value(v)?)))
                .collect(),
            Value::Object(fields) => fields
                .into_iter()
                .map(|(k, v)| Ok((K::from_value(Value::String(k))?, V::from_value(v)?)))
                .collect(),
            other => Err(mismatch::<HashMap<K, V>>(&other)),
        }
    }
}

macro_rules! from_value_tuple {
    ($len:expr; $($name:ident),+) => {
        impl<$($name: FromValue),+> FromValue for ($($name,)+) {
            const TYPE_NAME: &'static str = "tuple";

            fn from_value(value: Value) -> Result<Self, ConverterError> {
                match value {
                    Value::Tuple(items) if items.len() == $len => {
                        let mut items = items.into_iter();
                        Ok(($(
                            $name::from_value(items.next().unwrap_or_default())?,
                        )+))
                    }
                    other => Err(mismatch::<Self>(&other)),
                }
            }
        }
    };
}

from_value_tuple!(1; A);
from_value_tuple!(2; A, B);
from_value_tuple!(3; A, B, C);
from_value_tuple!(4; A, B, C, D);

// ============================================================================
// serde_json bridge
// ============================================================================

/// Render a value as JSON. Object paths are expanded into nested objects.
pub fn to_json(value: &Value) -> serde_json::Value {
    use serde_json::Value as Json;

    match value {
        Value::Null => Json::Null,
        Value::Bool(v) => Json::Bool(*v),
        Value::Int8(v) => Json::from(*v),
        Value::Int16(v) => Json::from(*v),
        Value::Int32(v) => Json::from(*v),
        Value::Int64(v) => Json::from(*v),
        Value::UInt8(v) => Json::from(*v),
        Value::UInt16(v) => Json::from(*v),
        Value::UInt32(v) => Json::from(*v),
        Value::UInt64(v) => Json::from(*v),
        Value::Int128(v) => i64::try_from(*v)
            .map(Json::from)
            .unwrap_or_else(|_| Json::String(v.to_string())),
        Value::UInt128(v) => u64::try_from(*v)
            .map(Json::from)
            .unwrap_or_else(|_| Json::String(v.to_string())),
        Value::Float32(v) => serde_json::Number::from_f64(*v as f64).map_or(Json::Null, Json::Number),
        Value::Float64(v) => serde_json::Number::from_f64(*v).map_or(Json::Null, Json::Number),
        Value::String(s) => Json::String(s.clone()),
        Value::Bytes(b) => Json::String(String::from_utf8_lossy(b).into_owned()),
        Value::Uuid(u) => Json::String(u.to_string()),
        Value::Date(d) => Json::String(d.to_string()),
        Value::DateTime(dt) => Json::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        Value::Decimal(d) => Json::String(d.to_string()),
        Value::Ipv4(ip) => Json::String(ip.to_string()),
        Value::Ipv6(ip) => Json::String(ip.to_string()),
        Value::Array(items) | Value::Tuple(items) => Json::Array(items.iter().map(to_json).collect()),
        Value::Map(entries) => {
            if entries.iter().all(|(k, _)| k.as_str().is_some()) {
                let map = entries
                    .iter()
                    .map(|(k, v)| (k.as_str().unwrap_or_default().to_string(), to_json(v)))
                    .collect();
                Json::Object(map)
            } else {
                Json::Array(
                    entries
                        .iter()
                        .map(|(k, v)| Json::Array(vec![to_json(k), to_json(v)]))
                        .collect(),
                )
            }
        }
        Value::Object(fields) => {
            let mut root = serde_json::Map::new();
            for (path, v) in fields {
                insert_path(&mut root, &split_json_path(path), to_json(v));
            }
            Json::Object(root)
        }
    }
}

fn insert_path(root: &mut serde_json::Map<String, serde_json::Value>, parts: &[String], value: serde_json::Value) {
    let Some((last, parents)) = parts.split_last() else {
        return;
    };
    let mut node = root;
    for part in parents {
        let entry = node
            .entry(part.clone())
            .or_insert_with(|| serde_json::Value::Object(Default::default()));
        if !entry.is_object() {
            *entry = serde_json::Value::Object(Default::default());
        }
        node = match entry {
            serde_json::Value::Object(next) => next,
            _ => return,
        };
    }
    // A nested object under an existing object merges rather than replaces.
    if let serde_json::Value::Object(incoming) = value {
        if let Some(serde_json::Value::Object(existing)) = node.get_mut(last) {
            existing.extend(incoming);
            return;
        }
        node.insert(last.clone(), serde_json::Value::Object(incoming));
    } else {
        node.insert(last.clone(), value);
    }
}

/// Convert JSON into a value. Object keys become escaped path segments.
pub fn from_json(json: serde_json::Value) -> Value {
    use serde_json::Value as Json;

    match json {
        Json::Null => Value::Null,
        Json::Bool(v) => Value::Bool(v),
        Json::Number(n) => {
            if let Some(v) = n.as_i64() {
                Value::Int64(v)
            } else if let Some(v) = n.as_u64() {
                Value::UInt64(v)
            } else {
                Value::Float64(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Json::String(s) => Value::String(s),
        Json::Array(items) => Value::Array(items.into_iter().map(from_json).collect()),
        Json::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (escape_json_path(&k), from_json(v)))
                .collect(),
        ),
    }
}
