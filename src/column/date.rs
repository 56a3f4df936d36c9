use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use super::{unquote, Column, ConverterError, TypeSpec};
use crate::error::Result;
use crate::proto::{Decoder, Encoder};
use crate::types::Value;

/// Storage layout of a date-like column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateKind {
    /// Days since epoch, u16.
    Date,
    /// Days since epoch, i32.
    Date32,
    /// Seconds since epoch, u32.
    DateTime,
    /// Ticks of 10^-precision seconds since epoch, i64.
    DateTime64,
}

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

/// `date`, `date32`, `datetime[('tz')]` and `datetime64(p[, 'tz'])`.
///
/// Values are exchanged as UTC; a declared time zone is kept in the type name only.
#[derive(Debug, Clone)]
pub struct Date {
    type_name: String,
    kind: DateKind,
    precision: u32,
    timezone: Option<String>,
    data: Vec<i64>,
}

impl Date {
    pub fn parse(spec: &TypeSpec<'_>, kind: DateKind) -> Result<Self> {
        let mut precision = 0;
        let mut timezone = None;
        match kind {
            DateKind::DateTime => {
                if let Some(tz) = spec.args.first() {
                    timezone = Some(unquote(tz).ok_or_else(|| spec.unsupported())?);
                }
            }
            DateKind::DateTime64 => {
                precision = spec
                    .arg(0)?
                    .parse::<u32>()
                    .ok()
                    .filter(|p| *p <= 9)
                    .ok_or_else(|| spec.unsupported())?;
                if let Some(tz) = spec.args.get(1) {
                    timezone = Some(unquote(tz).ok_or_else(|| spec.unsupported())?);
                }
            }
            DateKind::Date | DateKind::Date32 => {}
        }
        Ok(Date {
            type_name: spec.full.to_string(),
            kind,
            precision,
            timezone,
            data: Vec::new(),
        })
    }

    pub fn kind(&self) -> DateKind {
        self.kind
    }

    pub fn timezone(&self) -> Option<&str> {
        self.timezone.as_deref()
    }

    fn ticks_per_second(&self) -> i64 {
        10i64.pow(self.precision)
    }

    fn to_value(&self, raw: i64) -> Value {
        match self.kind {
            DateKind::Date | DateKind::Date32 => epoch()
                .checked_add_signed(chrono::Duration::days(raw))
                .map_or(Value::Null, Value::Date),
            DateKind::DateTime => DateTime::from_timestamp(raw, 0).map_or(Value::Null, Value::DateTime),
            DateKind::DateTime64 => {
                let per_second = self.ticks_per_second();
                let secs = raw.div_euclid(per_second);
                let nanos = raw.rem_euclid(per_second) * 10i64.pow(9 - self.precision);
                DateTime::from_timestamp(secs, nanos as u32).map_or(Value::Null, Value::DateTime)
            }
        }
    }

    fn from_datetime(&self, dt: DateTime<Utc>) -> Option<i64> {
        match self.kind {
            DateKind::Date | DateKind::Date32 => Some((dt.date_naive() - epoch()).num_days()),
            DateKind::DateTime => Some(dt.timestamp()),
            DateKind::DateTime64 => {
                let per_second = self.ticks_per_second();
                let sub = dt.timestamp_subsec_nanos() as i64 / 10i64.pow(9 - self.precision);
                dt.timestamp().checked_mul(per_second)?.checked_add(sub)
            }
        }
    }

    fn raw_for(&self, value: &Value) -> Option<i64> {
        let raw = match value {
            Value::Date(d) => self.from_datetime(d.and_time(chrono::NaiveTime::MIN).and_utc())?,
            Value::DateTime(dt) => self.from_datetime(*dt)?,
            Value::String(s) => self.from_datetime(parse_datetime(s)?)?,
            other => i64::try_from(other.as_i128()?).ok()?,
        };
        let in_range = match self.kind {
            DateKind::Date => (0..=u16::MAX as i64).contains(&raw),
            DateKind::Date32 => i32::try_from(raw).is_ok(),
            DateKind::DateTime => (0..=u32::MAX as i64).contains(&raw),
            DateKind::DateTime64 => true,
        };
        in_range.then_some(raw)
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.fff]` and `YYYY-MM-DD`, all read as UTC.
fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(dt.and_utc());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(chrono::NaiveTime::MIN).and_utc())
}

impl Column for Date {
    fn column_type(&self) -> &str {
        &self.type_name
    }

    fn rows(&self) -> usize {
        self.data.len()
    }

    fn row(&self, i: usize) -> Value {
        self.to_value(self.data[i])
    }

    fn append_row(&mut self, value: &Value) -> std::result::Result<(), ConverterError> {
        let raw = self
            .raw_for(value)
            .ok_or_else(|| ConverterError::append(value, &self.type_name))?;
        self.data.push(raw);
        Ok(())
    }

    fn append_default(&mut self) {
        self.data.push(0);
    }

    fn truncate(&mut self, rows: usize) {
        self.data.truncate(rows);
    }

    fn decode(&mut self, decoder: &mut Decoder<'_>, rows: usize) -> Result<()> {
        self.data.reserve(decoder.capacity_hint(rows, 2));
        for _ in 0..rows {
            let raw = match self.kind {
                DateKind::Date => decoder.u16()? as i64,
                DateKind::Date32 => decoder.i32()? as i64,
                DateKind::DateTime => decoder.u32()? as i64,
                DateKind::DateTime64 => decoder.i64()?,
            };
            self.data.push(raw);
        }
        Ok(())
    }

    fn encode(&self, encoder: &mut Encoder) {
        for raw in &self.data {
            match self.kind {
                DateKind::Date => encoder.u16(*raw as u16),
                DateKind::Date32 => encoder.i32(*raw as i32),
                DateKind::DateTime => encoder.u32(*raw as u32),
                DateKind::DateTime64 => encoder.i64(*raw),
            }
        }
    }

    fn new_empty(&self) -> Box<dyn Column> {
        Box::new(Date {
            data: Vec::new(),
            ..self.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::super::testing::{roundtrip, rows_of};
    use super::super::new_column;
    use super::*;

    #[test]
    fn test_date_days_since_epoch() {
        let mut col = new_column("date").unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        col.append(&[Value::Date(day), "1970-01-02".into()]).unwrap();
        let mut enc = Encoder::new();
        col.encode(&mut enc);
        let bytes = enc.take();
        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.u16().unwrap(), 19783);
        assert_eq!(dec.u16().unwrap(), 1);

        assert!(col
            .append_row(&Value::Date(NaiveDate::from_ymd_opt(1960, 1, 1).unwrap()))
            .is_err());
    }

    #[test]
    fn test_date32_before_epoch() {
        let mut col = new_column("date32").unwrap();
        let day = NaiveDate::from_ymd_opt(1900, 1, 1).unwrap();
        col.append_row(&Value::Date(day)).unwrap();
        assert_eq!(rows_of(roundtrip(col.as_ref()).as_ref()), vec![Value::Date(day)]);
    }

    #[test]
    fn test_datetime_keeps_timezone_name() {
        let spec = TypeSpec::parse("datetime('Asia/Shanghai')").unwrap();
        let col = Date::parse(&spec, DateKind::DateTime).unwrap();
        assert_eq!(col.timezone(), Some("Asia/Shanghai"));
        assert_eq!(col.column_type(), "datetime('Asia/Shanghai')");
    }

    #[test]
    fn test_datetime_seconds() {
        let mut col = new_column("datetime").unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        col.append(&[Value::DateTime(ts), "2024-01-02 03:04:05".into()])
            .unwrap();
        assert_eq!(
            rows_of(roundtrip(col.as_ref()).as_ref()),
            vec![Value::DateTime(ts), Value::DateTime(ts)]
        );
    }

    #[test]
    fn test_datetime64_precision() {
        let mut col = new_column("datetime64(3, 'UTC')").unwrap();
        let ts = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        col.append_row(&Value::DateTime(ts)).unwrap();
        let mut enc = Encoder::new();
        col.encode(&mut enc);
        assert_eq!(Decoder::new(&enc.take()).i64().unwrap(), 1_700_000_000_123);
        assert_eq!(rows_of(roundtrip(col.as_ref()).as_ref()), vec![Value::DateTime(ts)]);

        let before_epoch = Utc.timestamp_millis_opt(-1_500).unwrap();
        col.append_row(&Value::DateTime(before_epoch)).unwrap();
        assert_eq!(col.row(1), Value::DateTime(before_epoch));
    }
}
