//! Column types, typed values and multi-column key comparison.

use std::cmp::Ordering;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::errors::{DbError, Result};

/// The fixed set of column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColType {
    Int,
    Bigint,
    Float,
    Str,
    Datetime,
}

impl ColType {
    pub fn name(&self) -> &'static str {
        match self {
            ColType::Int => "INT",
            ColType::Bigint => "BIGINT",
            ColType::Float => "FLOAT",
            ColType::Str => "STRING",
            ColType::Datetime => "DATETIME",
        }
    }
}

/// One column of a key or record: its type and on-disk width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColSpec {
    pub ty: ColType,
    pub len: usize,
}

impl ColSpec {
    pub fn new(ty: ColType, len: usize) -> Self {
        match ty {
            ColType::Int => Self { ty, len: 4 },
            ColType::Bigint | ColType::Float | ColType::Datetime => Self { ty, len: 8 },
            ColType::Str => Self { ty, len },
        }
    }
}

/// A calendar timestamp with second precision, compared field by field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Datetime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl Datetime {
    pub fn new(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Self {
        Self {
            year,
            month,
            day,
            hour,
            minute,
            second,
        }
    }

    pub fn is_valid(&self) -> bool {
        NaiveDate::from_ymd_opt(self.year as i32, self.month as u32, self.day as u32).is_some()
            && NaiveTime::from_hms_opt(self.hour as u32, self.minute as u32, self.second as u32)
                .is_some()
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0..2].copy_from_slice(&self.year.to_le_bytes());
        buf[2] = self.month;
        buf[3] = self.day;
        buf[4] = self.hour;
        buf[5] = self.minute;
        buf[6] = self.second;
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            year: u16::from_le_bytes([buf[0], buf[1]]),
            month: buf[2],
            day: buf[3],
            hour: buf[4],
            minute: buf[5],
            second: buf[6],
        }
    }
}

impl std::fmt::Display for Datetime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

/// A typed value as produced by the executor layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Bigint(i64),
    Float(f64),
    Str(String),
    Datetime(Datetime),
}

impl Value {
    pub fn col_type(&self) -> ColType {
        match self {
            Value::Int(_) => ColType::Int,
            Value::Bigint(_) => ColType::Bigint,
            Value::Float(_) => ColType::Float,
            Value::Str(_) => ColType::Str,
            Value::Datetime(_) => ColType::Datetime,
        }
    }

    /// Encodes the value into exactly `spec.len` bytes.
    pub fn encode(&self, spec: &ColSpec) -> Result<Vec<u8>> {
        let mismatch = || DbError::IncompatibleType {
            expected: spec.ty.name().to_string(),
            actual: self.col_type().name().to_string(),
        };
        match (self, spec.ty) {
            (Value::Int(v), ColType::Int) => Ok(v.to_le_bytes().to_vec()),
            // Widening an INT literal into a BIGINT column is allowed.
            (Value::Int(v), ColType::Bigint) => Ok((*v as i64).to_le_bytes().to_vec()),
            (Value::Bigint(v), ColType::Bigint) => Ok(v.to_le_bytes().to_vec()),
            (Value::Float(v), ColType::Float) => Ok(v.to_le_bytes().to_vec()),
            (Value::Str(s), ColType::Str) => {
                if s.len() > spec.len {
                    return Err(mismatch());
                }
                let mut buf = vec![0u8; spec.len];
                buf[..s.len()].copy_from_slice(s.as_bytes());
                Ok(buf)
            }
            (Value::Datetime(dt), ColType::Datetime) => {
                if !dt.is_valid() {
                    return Err(mismatch());
                }
                Ok(dt.to_bytes().to_vec())
            }
            _ => Err(mismatch()),
        }
    }
}

/// Encodes one row of values against the column specs, concatenated in order.
pub fn encode_row(values: &[Value], specs: &[ColSpec]) -> Result<Vec<u8>> {
    if values.len() != specs.len() {
        return Err(DbError::InvalidValueCount {
            expected: specs.len(),
            actual: values.len(),
        });
    }
    let mut row = Vec::with_capacity(specs.iter().map(|s| s.len).sum());
    for (value, spec) in values.iter().zip(specs) {
        row.extend_from_slice(&value.encode(spec)?);
    }
    Ok(row)
}

fn compare_col(a: &[u8], b: &[u8], ty: ColType) -> Ordering {
    match ty {
        ColType::Int => {
            let x = i32::from_le_bytes(a[..4].try_into().unwrap());
            let y = i32::from_le_bytes(b[..4].try_into().unwrap());
            x.cmp(&y)
        }
        ColType::Bigint => {
            let x = i64::from_le_bytes(a[..8].try_into().unwrap());
            let y = i64::from_le_bytes(b[..8].try_into().unwrap());
            x.cmp(&y)
        }
        ColType::Float => {
            let x = f64::from_le_bytes(a[..8].try_into().unwrap());
            let y = f64::from_le_bytes(b[..8].try_into().unwrap());
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        ColType::Str => a.cmp(b),
        ColType::Datetime => Datetime::from_bytes(a).cmp(&Datetime::from_bytes(b)),
    }
}

/// Compares two packed multi-column keys lexicographically over `specs`.
///
/// Both keys must be at least as long as the total width of the specs.
pub fn compare_keys(a: &[u8], b: &[u8], specs: &[ColSpec]) -> Ordering {
    let mut offset = 0;
    for spec in specs {
        let ord = compare_col(&a[offset..offset + spec.len], &b[offset..offset + spec.len], spec.ty);
        if ord != Ordering::Equal {
            return ord;
        }
        offset += spec.len;
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_keys_compare_numerically() {
        let specs = [ColSpec::new(ColType::Int, 4)];
        let a = (-5i32).to_le_bytes();
        let b = 3i32.to_le_bytes();
        assert_eq!(compare_keys(&a, &b, &specs), Ordering::Less);
    }

    #[test]
    fn multi_column_keys_compare_lexicographically() {
        let specs = [ColSpec::new(ColType::Int, 4), ColSpec::new(ColType::Str, 4)];
        let lo = encode_row(
            &[Value::Int(1), Value::Str("ab".into())],
            &specs,
        )
        .unwrap();
        let hi = encode_row(
            &[Value::Int(1), Value::Str("ac".into())],
            &specs,
        )
        .unwrap();
        assert_eq!(compare_keys(&lo, &hi, &specs), Ordering::Less);
        assert_eq!(compare_keys(&lo, &lo, &specs), Ordering::Equal);
    }

    #[test]
    fn datetime_validity() {
        assert!(Datetime::new(2024, 2, 29, 12, 0, 0).is_valid());
        assert!(!Datetime::new(2023, 2, 29, 12, 0, 0).is_valid());
        assert!(!Datetime::new(2023, 13, 1, 0, 0, 0).is_valid());
        assert!(!Datetime::new(2023, 6, 1, 24, 0, 0).is_valid());
    }

    #[test]
    fn datetime_round_trips_and_orders() {
        let early = Datetime::new(2021, 5, 1, 8, 30, 0);
        let late = Datetime::new(2021, 5, 1, 8, 30, 1);
        assert_eq!(Datetime::from_bytes(&early.to_bytes()), early);
        assert!(early < late);
        assert_eq!(early.to_string(), "2021-05-01 08:30:00");
    }

    #[test]
    fn encode_row_checks_arity_and_types() {
        let specs = [ColSpec::new(ColType::Int, 4), ColSpec::new(ColType::Str, 8)];
        let err = encode_row(&[Value::Int(1)], &specs).unwrap_err();
        assert!(matches!(err, DbError::InvalidValueCount { expected: 2, actual: 1 }));

        let err = encode_row(&[Value::Int(1), Value::Float(2.0)], &specs).unwrap_err();
        assert!(matches!(err, DbError::IncompatibleType { .. }));
    }
}
