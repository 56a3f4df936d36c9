use super::{Column, ConverterError, TypeSpec};
use crate::error::Result;
use crate::proto::{byte_len, Decoder, Encoder};
use crate::types::{self, Value};

/// `decimal(P, S)` and the `decimal32/64/128/256(S)` shorthands.
///
/// Values are kept as their little-endian scaled integers, 4 to 32 bytes wide depending on
/// the precision.
#[derive(Debug, Clone)]
pub struct Decimal {
    type_name: String,
    precision: u32,
    scale: u32,
    width: usize,
    data: Vec<u8>,
}

fn width_for(precision: u32) -> Option<usize> {
    match precision {
        1..=9 => Some(4),
        10..=18 => Some(8),
        19..=38 => Some(16),
        39..=76 => Some(32),
        _ => None,
    }
}

impl Decimal {
    pub fn parse(spec: &TypeSpec<'_>) -> Result<Self> {
        let number = |s: &str| s.trim().parse::<u32>().map_err(|_| spec.unsupported());
        let (precision, scale) = match spec.key.as_str() {
            "decimal" => (number(spec.arg(0)?)?, number(spec.arg(1)?)?),
            "decimal32" => (9, number(spec.arg(0)?)?),
            "decimal64" => (18, number(spec.arg(0)?)?),
            "decimal128" => (38, number(spec.arg(0)?)?),
            "decimal256" => (76, number(spec.arg(0)?)?),
            _ => return Err(spec.unsupported()),
        };
        let width = width_for(precision).ok_or_else(|| spec.unsupported())?;
        if scale > precision {
            return Err(spec.unsupported());
        }
        Ok(Decimal {
            type_name: spec.full.to_string(),
            precision,
            scale,
            width,
            data: Vec::new(),
        })
    }

    pub fn precision(&self) -> u32 {
        self.precision
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    fn to_decimal(&self, raw: &[u8]) -> types::Decimal {
        match self.width {
            4 => types::Decimal::from_i128_scaled(
                i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as i128,
                self.scale,
            ),
            8 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(raw);
                types::Decimal::from_i128_scaled(i64::from_le_bytes(b) as i128, self.scale)
            }
            16 => {
                let mut b = [0u8; 16];
                b.copy_from_slice(raw);
                types::Decimal::from_i128_scaled(i128::from_le_bytes(b), self.scale)
            }
            _ => {
                let mut limbs = [0u64; 4];
                for (limb, chunk) in limbs.iter_mut().zip(raw.chunks_exact(8)) {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(chunk);
                    *limb = u64::from_le_bytes(b);
                }
                types::Decimal::from_i256_scaled(limbs, self.scale)
            }
        }
    }

    /// Scaled little-endian bytes for `value`, or `None` when it does not fit exactly.
    fn to_raw(&self, value: &types::Decimal) -> Option<Vec<u8>> {
        let scaled = value.rescale(self.scale)?;
        if scaled.precision() > self.precision {
            return None;
        }
        match self.width {
            4 => {
                let v = i32::try_from(scaled.to_i128_scaled(self.scale)?).ok()?;
                Some(v.to_le_bytes().to_vec())
            }
            8 => {
                let v = i64::try_from(scaled.to_i128_scaled(self.scale)?).ok()?;
                Some(v.to_le_bytes().to_vec())
            }
            16 => Some(scaled.to_i128_scaled(self.scale)?.to_le_bytes().to_vec()),
            _ => {
                let limbs = scaled.to_i256_scaled(self.scale)?;
                Some(limbs.iter().flat_map(|l| l.to_le_bytes()).collect())
            }
        }
    }
}

impl Column for Decimal {
    fn column_type(&self) -> &str {
        &self.type_name
    }

    fn rows(&self) -> usize {
        self.data.len() / self.width
    }

    fn row(&self, i: usize) -> Value {
        Value::Decimal(self.to_decimal(&self.data[i * self.width..(i + 1) * self.width]))
    }

    fn append_row(&mut self, value: &Value) -> std::result::Result<(), ConverterError> {
        let decimal = match value {
            Value::Decimal(d) => Some(d.clone()),
            Value::String(s) => s.parse::<types::Decimal>().ok(),
            other => other
                .as_i128()
                .map(|v| types::Decimal::from_i128_scaled(v, 0)),
        };
        let raw = decimal
            .as_ref()
            .and_then(|d| self.to_raw(d))
            .ok_or_else(|| {
                ConverterError::append(value, &self.type_name).with_hint(format!(
                    "value must fit precision {} and scale {} exactly",
                    self.precision, self.scale
                ))
            })?;
        self.data.extend_from_slice(&raw);
        Ok(())
    }

    fn append_default(&mut self) {
        self.data.extend(std::iter::repeat(0).take(self.width));
    }

    fn truncate(&mut self, rows: usize) {
        self.data.truncate(rows * self.width);
    }

    fn decode(&mut self, decoder: &mut Decoder<'_>, rows: usize) -> Result<()> {
        self.data
            .extend_from_slice(decoder.take(byte_len(rows, self.width)?)?);
        Ok(())
    }

    fn encode(&self, encoder: &mut Encoder) {
        encoder.raw(&self.data);
    }

    fn new_empty(&self) -> Box<dyn Column> {
        Box::new(Decimal {
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

    fn dec(s: &str) -> Value {
        Value::Decimal(s.parse().unwrap())
    }

    #[test]
    fn test_width_by_precision() {
        for (name, width) in [
            ("decimal(9, 2)", 4),
            ("decimal(18, 2)", 8),
            ("decimal(38, 2)", 16),
            ("decimal(76, 2)", 32),
            ("decimal64(4)", 8),
        ] {
            let mut col = new_column(name).unwrap();
            col.append_row(&dec("1.5")).unwrap();
            let mut enc = Encoder::new();
            col.encode(&mut enc);
            assert_eq!(enc.len(), width, "{}", name);
        }
    }

    #[test]
    fn test_scale_is_applied_exactly() {
        let mut col = new_column("decimal(9, 2)").unwrap();
        col.append(&[dec("12.3"), "-0.05".into(), Value::Int32(7)])
            .unwrap();
        let mut enc = Encoder::new();
        col.encode(&mut enc);
        let bytes = enc.take();
        let mut dec_ = Decoder::new(&bytes);
        assert_eq!(dec_.i32().unwrap(), 1230);
        assert_eq!(dec_.i32().unwrap(), -5);
        assert_eq!(dec_.i32().unwrap(), 700);

        let rows: Vec<String> = rows_of(roundtrip(col.as_ref()).as_ref())
            .iter()
            .map(|v| match v {
                Value::Decimal(d) => d.to_string(),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(rows, vec!["12.30", "-0.05", "7.00"]);
    }

    #[test]
    fn test_lossy_values_are_rejected() {
        let mut col = new_column("decimal(5, 2)").unwrap();
        assert!(col.append_row(&dec("1.234")).is_err());
        assert!(col.append_row(&dec("1234.5")).is_err());
        assert!(col.append_row(&Value::Float64(1.5)).is_err());
        assert_eq!(col.rows(), 0);
    }

    #[test]
    fn test_decimal256_roundtrip() {
        let mut col = new_column("decimal256(10)").unwrap();
        let big = dec("-123456789012345678901234567890.0123456789");
        col.append_row(&big).unwrap();
        assert_eq!(rows_of(roundtrip(col.as_ref()).as_ref()), vec![big]);
    }
}
