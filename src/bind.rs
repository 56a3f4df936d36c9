//! Client-side parameter binding.
//!
//! Placeholders are replaced with SQL literals before the query is sent:
//!
//! - `?` takes the next positional argument (`\?` is a literal question mark)
//! - `$1`, `$2`, ... take positional arguments by number
//! - `@name` takes a named argument
//!
//! Placeholders inside quoted strings and identifiers are left alone.

use std::collections::HashMap;
use std::fmt::Write;

use chrono::{DateTime, NaiveDate, SecondsFormat, Timelike, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{Decimal, Value};

/// A query argument, positional unless it carries a name.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    name: Option<String>,
    value: Value,
}

impl Param {
    pub fn positional(value: impl Into<Value>) -> Self {
        Self {
            name: None,
            value: value.into(),
        }
    }

    pub fn named(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: Some(name.into()),
            value: value.into(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
}

impl From<Value> for Param {
    fn from(value: Value) -> Self {
        Param::positional(value)
    }
}

macro_rules! param_from {
    ($($t:ty),* $(,)?) => {$(
        impl From<$t> for Param {
            fn from(v: $t) -> Self {
                Param::positional(v)
            }
        }
    )*};
}

param_from!(
    bool, i8, i16, i32, i64, i128, u8, u16, u32, u64, u128, f32, f64, String, &str, Uuid,
    NaiveDate, DateTime<Utc>, Decimal,
);

/// Substitute `params` into `query`.
pub fn bind(query: &str, params: &[Param]) -> Result<String> {
    if params.is_empty() {
        return Ok(query.to_string());
    }
    let named = params.iter().filter(|p| p.name.is_some()).count();
    if named > 0 && named != params.len() {
        return Err(Error::BindMixedNamedAndNumericParams);
    }
    if named > 0 {
        return bind_named(query, params);
    }

    let tokens = scan(query);
    let has_question = tokens.iter().any(|t| matches!(t, Token::Question));
    let has_numeric = tokens.iter().any(|t| matches!(t, Token::Numeric(_)));
    if has_question && has_numeric {
        return Err(Error::BindMixedParamsFormats);
    }

    let mut out = String::with_capacity(query.len() + params.len() * 8);
    let mut next = 0usize;
    for token in tokens {
        match token {
            Token::Text(s) => out.push_str(s),
            Token::EscapedQuestion => out.push('?'),
            Token::Question => {
                let param = params.get(next).ok_or_else(|| {
                    Error::Bind(format!("have no arg for param ? at position {}", next))
                })?;
                next += 1;
                format_value(&mut out, &param.value);
            }
            Token::Numeric(n) => {
                let param = n
                    .checked_sub(1)
                    .and_then(|i| params.get(i))
                    .ok_or_else(|| Error::Bind(format!("have no arg for ${} param", n)))?;
                format_value(&mut out, &param.value);
            }
            Token::Named(name) => out.push_str(name),
        }
    }
    if has_question && next != params.len() {
        return Err(Error::Bind(format!(
            "expected {} arguments, got {}",
            next,
            params.len()
        )));
    }
    Ok(out)
}

fn bind_named(query: &str, params: &[Param]) -> Result<String> {
    let args: HashMap<&str, &Value> = params
        .iter()
        .filter_map(|p| p.name.as_deref().map(|n| (n, &p.value)))
        .collect();

    let mut out = String::with_capacity(query.len() + params.len() * 8);
    for token in scan(query) {
        match token {
            Token::Text(s) => out.push_str(s),
            Token::EscapedQuestion => out.push_str("\\?"),
            Token::Question => out.push('?'),
            Token::Numeric(n) => {
                let _ = write!(out, "${}", n);
            }
            Token::Named(name) => {
                let key = &name[1..];
                let value = args
                    .get(key)
                    .ok_or_else(|| Error::Bind(format!("have no arg for {} param", key)))?;
                format_value(&mut out, value);
            }
        }
    }
    Ok(out)
}

#[derive(Debug, PartialEq)]
enum Token<'a> {
    Text(&'a str),
    Question,
    EscapedQuestion,
    Numeric(usize),
    /// Includes the leading `@`.
    Named(&'a str),
}

/// Split a query into literal text and placeholders, skipping quoted sections.
fn scan(query: &str) -> Vec<Token<'_>> {
    let bytes = query.as_bytes();
    let mut tokens = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"' | b'`') => {
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'\\' if bytes.get(i + 1) == Some(&b'?') => {
                tokens.push(Token::Text(&query[start..i]));
                tokens.push(Token::EscapedQuestion);
                i += 2;
                start = i;
            }
            b'?' => {
                tokens.push(Token::Text(&query[start..i]));
                tokens.push(Token::Question);
                i += 1;
                start = i;
            }
            b'$' if bytes.get(i + 1).is_some_and(u8::is_ascii_digit) => {
                let end = digits_end(bytes, i + 1);
                tokens.push(Token::Text(&query[start..i]));
                // Digits only, bounded by the query length.
                let n = query[i + 1..end].parse().unwrap_or(usize::MAX);
                tokens.push(Token::Numeric(n));
                i = end;
                start = i;
            }
            b'@' if bytes.get(i + 1).is_some_and(|b| b.is_ascii_alphabetic() || *b == b'_') => {
                let mut end = i + 1;
                while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_')
                {
                    end += 1;
                }
                tokens.push(Token::Text(&query[start..i]));
                tokens.push(Token::Named(&query[i..end]));
                i = end;
                start = i;
            }
            _ => i += 1,
        }
    }
    let end = i.min(bytes.len());
    if start < end {
        tokens.push(Token::Text(&query[start..end]));
    }
    tokens
}

fn digits_end(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    i
}

// ============================================================================
// Literals
// ============================================================================

/// Render `value` as an SQL literal.
pub fn format_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("NULL"),
        Value::Bool(v) => out.push_str(if *v { "1" } else { "0" }),
        Value::Int8(v) => push_display(out, v),
        Value::Int16(v) => push_display(out, v),
        Value::Int32(v) => push_display(out, v),
        Value::Int64(v) => push_display(out, v),
        Value::Int128(v) => push_display(out, v),
        Value::UInt8(v) => push_display(out, v),
        Value::UInt16(v) => push_display(out, v),
        Value::UInt32(v) => push_display(out, v),
        Value::UInt64(v) => push_display(out, v),
        Value::UInt128(v) => push_display(out, v),
        Value::Float32(v) => push_display(out, v),
        Value::Float64(v) => push_display(out, v),
        Value::Decimal(v) => push_display(out, v),
        Value::String(s) => quote(out, s),
        Value::Bytes(b) => quote(out, &String::from_utf8_lossy(b)),
        Value::Uuid(u) => quote(out, &u.to_string()),
        Value::Ipv4(ip) => quote(out, &ip.to_string()),
        Value::Ipv6(ip) => quote(out, &ip.to_string()),
        Value::Date(d) => {
            let _ = write!(out, "to_date('{}')", d.format("%Y-%m-%d"));
        }
        Value::DateTime(dt) => format_datetime(out, dt),
        Value::Array(items) => {
            out.push('[');
            join(out, items);
            out.push(']');
        }
        Value::Tuple(items) => {
            out.push('(');
            join(out, items);
            out.push(')');
        }
        Value::Map(entries) => {
            out.push_str("map(");
            for (i, (k, v)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                format_value(out, k);
                out.push_str(", ");
                format_value(out, v);
            }
            out.push(')');
        }
        Value::Object(_) => quote(out, &crate::types::to_json(value).to_string()),
    }
}

fn push_display(out: &mut String, v: &impl std::fmt::Display) {
    let _ = write!(out, "{}", v);
}

fn join(out: &mut String, items: &[Value]) {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        format_value(out, item);
    }
}

fn quote(out: &mut String, s: &str) {
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            c => out.push(c),
        }
    }
    out.push('\'');
}

fn format_datetime(out: &mut String, dt: &DateTime<Utc>) {
    if dt.nanosecond() == 0 {
        let _ = write!(out, "to_datetime('{}', 'UTC')", dt.format("%Y-%m-%d %H:%M:%S"));
    } else {
        let _ = write!(
            out,
            "to_datetime64('{}', 9, 'UTC')",
            dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
                .trim_end_matches('Z')
                .replace('T', " ")
        );
    }
}
