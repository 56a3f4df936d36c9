//! Column implementations and the type registry.
//!
//! A column is a typed, append-only sequence of rows with its own wire encoding. Columns are
//! created from their wire type name through [`new_column`], which looks the base name up in a
//! static constructor table. Nested types build their children the same way.

mod array;
mod date;
mod decimal;
mod enums;
mod ip;
mod json;
pub mod json_path;
mod low_cardinality;
mod map;
mod nothing;
mod nullable;
mod numeric;
mod simple_aggregate;
mod string;
mod tuple;
mod uuid;

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;

use crate::error::{Error, Result};
use crate::proto::{Decoder, Encoder};
use crate::types::Value;

pub use array::Array;
pub use date::{Date, DateKind};
pub use decimal::Decimal;
pub use enums::Enum;
pub use ip::{Ipv4, Ipv6};
pub use json::Json;
pub use low_cardinality::LowCardinality;
pub use map::Map;
pub use nothing::Nothing;
pub use nullable::Nullable;
pub use numeric::{Bool, Numeric, Primitive};
pub use simple_aggregate::SimpleAggregateFunction;
pub use string::{FixedString, StringColumn};
pub use tuple::Tuple;
pub use uuid::UuidColumn;

// ============================================================================
// Conversion errors
// ============================================================================

/// A value could not be converted between its host form and a column type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConverterError {
    pub op: &'static str,
    pub column: String,
    pub from: String,
    pub to: String,
    pub hint: String,
}

impl ConverterError {
    pub fn new(op: &'static str, from: impl Into<String>, to: impl Into<String>) -> Self {
        ConverterError {
            op,
            column: String::new(),
            from: from.into(),
            to: to.into(),
            hint: String::new(),
        }
    }

    /// Error for appending `value` to a column of type `to`.
    pub fn append(value: &Value, to: &str) -> Self {
        Self::new("Append", value.kind(), to)
    }

    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = hint.into();
        self
    }
}

impl fmt::Display for ConverterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proton [{}]: ", self.op)?;
        if !self.column.is_empty() {
            write!(f, "({}) ", self.column)?;
        }
        write!(f, "converting {} to {} is unsupported", self.from, self.to)?;
        if !self.hint.is_empty() {
            write!(f, ". {}", self.hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for ConverterError {}

// ============================================================================
// Column trait
// ============================================================================

/// A typed column of rows.
///
/// Appends are atomic per call: a failed `append_row` or `append` leaves the rows that were
/// there before untouched.
pub trait Column: Send + Sync + fmt::Debug {
    /// Wire type name, e.g. `nullable(string)`.
    fn column_type(&self) -> &str;

    fn rows(&self) -> usize;

    /// Value at row `i`. Panics when `i` is out of range.
    fn row(&self, i: usize) -> Value;

    fn append_row(&mut self, value: &Value) -> std::result::Result<(), ConverterError>;

    /// Append many values at once, returning how many of them were null.
    fn append(&mut self, values: &[Value]) -> std::result::Result<usize, ConverterError> {
        let before = self.rows();
        let mut nulls = 0;
        for value in values {
            if let Err(err) = self.append_row(value) {
                self.truncate(before);
                return Err(err);
            }
            if value.is_null() {
                nulls += 1;
            }
        }
        Ok(nulls)
    }

    /// Append the zero value of the type.
    fn append_default(&mut self);

    fn truncate(&mut self, rows: usize);

    fn clear(&mut self) {
        self.truncate(0);
    }

    /// Read `rows` rows from the wire and append them.
    fn decode(&mut self, decoder: &mut Decoder<'_>, rows: usize) -> Result<()>;

    fn encode(&self, encoder: &mut Encoder);

    /// State written once per column before the data of every row.
    fn decode_prefix(&mut self, _decoder: &mut Decoder<'_>) -> Result<()> {
        Ok(())
    }

    fn encode_prefix(&self, _encoder: &mut Encoder) {}

    /// A column of the same type with no rows.
    fn new_empty(&self) -> Box<dyn Column>;

    fn is_nullable(&self) -> bool {
        false
    }
}

/// Wrap a decode error for a column that read past its declared bounds.
pub(crate) fn corrupt(column_type: &str, msg: impl fmt::Display) -> Error {
    Error::protocol(format!("{}: {}", column_type, msg))
}

// ============================================================================
// Type names
// ============================================================================

/// A parsed type name: the base identifier and its top-level arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeSpec<'a> {
    pub full: &'a str,
    /// Lower-cased base name with underscores removed, so `LowCardinality` and
    /// `low_cardinality` resolve to the same constructor.
    pub key: String,
    pub args: Vec<&'a str>,
}

impl<'a> TypeSpec<'a> {
    pub fn parse(name: &'a str) -> Result<Self> {
        let full = name.trim();
        let (base, args) = match full.find('(') {
            Some(open) => {
                if !full.ends_with(')') {
                    return Err(Error::UnsupportedColumnType(full.to_string()));
                }
                (&full[..open], split_args(&full[open + 1..full.len() - 1]))
            }
            None => (full, Vec::new()),
        };
        let key = base
            .trim()
            .chars()
            .filter(|c| *c != '_')
            .flat_map(char::to_lowercase)
            .collect();
        Ok(TypeSpec { full, key, args })
    }

    pub fn arg(&self, i: usize) -> Result<&'a str> {
        self.args
            .get(i)
            .copied()
            .ok_or_else(|| Error::UnsupportedColumnType(self.full.to_string()))
    }

    pub fn unsupported(&self) -> Error {
        Error::UnsupportedColumnType(self.full.to_string())
    }
}

/// Split type arguments on top-level commas, skipping over nested parentheses and quoted
/// strings.
pub(crate) fn split_args(s: &str) -> Vec<&str> {
    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        if in_quote {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '\'' => in_quote = false,
                _ => {}
            }
            continue;
        }
        match c {
            '\'' => in_quote = true,
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                args.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = s[start..].trim();
    if !last.is_empty() || !args.is_empty() {
        args.push(last);
    }
    args
}

/// Strip one level of single quotes, resolving `\'` and `''` escapes.
pub(crate) fn unquote(s: &str) -> Option<String> {
    let inner = s.trim().strip_prefix('\'')?.strip_suffix('\'')?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push(chars.next()?),
            '\'' if chars.peek() == Some(&'\'') => {
                chars.next();
                out.push('\'');
            }
            _ => out.push(c),
        }
    }
    Some(out)
}

// ============================================================================
// Registry
// ============================================================================

type Constructor = fn(&TypeSpec<'_>) -> Result<Box<dyn Column>>;

fn boxed<C: Column + 'static>(column: C) -> Result<Box<dyn Column>> {
    Ok(Box::new(column))
}

static REGISTRY: Lazy<HashMap<&'static str, Constructor>> = Lazy::new(|| {
    let mut m: HashMap<&'static str, Constructor> = HashMap::new();
    m.insert("int8", |t| boxed(Numeric::<i8>::new(t.full)));
    m.insert("int16", |t| boxed(Numeric::<i16>::new(t.full)));
    m.insert("int32", |t| boxed(Numeric::<i32>::new(t.full)));
    m.insert("int64", |t| boxed(Numeric::<i64>::new(t.full)));
    m.insert("int128", |t| boxed(Numeric::<i128>::new(t.full)));
    m.insert("uint8", |t| boxed(Numeric::<u8>::new(t.full)));
    m.insert("uint16", |t| boxed(Numeric::<u16>::new(t.full)));
    m.insert("uint32", |t| boxed(Numeric::<u32>::new(t.full)));
    m.insert("uint64", |t| boxed(Numeric::<u64>::new(t.full)));
    m.insert("uint128", |t| boxed(Numeric::<u128>::new(t.full)));
    m.insert("float32", |t| boxed(Numeric::<f32>::new(t.full)));
    m.insert("float64", |t| boxed(Numeric::<f64>::new(t.full)));
    m.insert("double", |t| boxed(Numeric::<f64>::new(t.full)));
    m.insert("bool", |t| boxed(Bool::new(t.full)));
    m.insert("boolean", |t| boxed(Bool::new(t.full)));
    m.insert("string", |t| boxed(StringColumn::new(t.full)));
    m.insert("fixedstring", |t| boxed(FixedString::parse(t)?));
    m.insert("uuid", |t| boxed(UuidColumn::new(t.full)));
    m.insert("ipv4", |t| boxed(Ipv4::new(t.full)));
    m.insert("ipv6", |t| boxed(Ipv6::new(t.full)));
    m.insert("date", |t| boxed(Date::parse(t, DateKind::Date)?));
    m.insert("date32", |t| boxed(Date::parse(t, DateKind::Date32)?));
    m.insert("datetime", |t| boxed(Date::parse(t, DateKind::DateTime)?));
    m.insert("datetime64", |t| boxed(Date::parse(t, DateKind::DateTime64)?));
    m.insert("enum8", |t| boxed(Enum::parse(t, 8)?));
    m.insert("enum16", |t| boxed(Enum::parse(t, 16)?));
    m.insert("decimal", |t| boxed(Decimal::parse(t)?));
    m.insert("decimal32", |t| boxed(Decimal::parse(t)?));
    m.insert("decimal64", |t| boxed(Decimal::parse(t)?));
    m.insert("decimal128", |t| boxed(Decimal::parse(t)?));
    m.insert("decimal256", |t| boxed(Decimal::parse(t)?));
    m.insert("nullable", |t| boxed(Nullable::parse(t)?));
    m.insert("array", |t| boxed(Array::parse(t)?));
    m.insert("tuple", |t| boxed(Tuple::parse(t)?));
    m.insert("map", |t| boxed(Map::parse(t)?));
    m.insert("lowcardinality", |t| boxed(LowCardinality::parse(t)?));
    m.insert("simpleaggregatefunction", |t| {
        boxed(SimpleAggregateFunction::parse(t)?)
    });
    m.insert("json", |t| boxed(Json::new(t.full)));
    m.insert("nullablejson", |t| boxed(Json::new(t.full)));
    m.insert("object", |t| boxed(Json::new(t.full)));
    m.insert("nothing", |t| boxed(Nothing::new(t.full)));
    // Geo types are aliases over tuples and arrays that keep their own names.
    m.insert("point", |t| boxed(Tuple::point(t.full)));
    m.insert("ring", |t| boxed(Array::new(t.full, Box::new(Tuple::point("point")))));
    m.insert("polygon", |t| boxed(Array::new(t.full, new_column("ring")?)));
    m.insert("multipolygon", |t| {
        boxed(Array::new(t.full, new_column("polygon")?))
    });
    m
});

/// Create an empty column for a wire type name.
pub fn new_column(type_name: &str) -> Result<Box<dyn Column>> {
    let spec = TypeSpec::parse(type_name)?;
    let ctor = REGISTRY.get(spec.key.as_str()).ok_or_else(|| spec.unsupported())?;
    ctor(&spec)
}
