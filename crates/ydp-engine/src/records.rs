//! Row values and captured changes

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use ydp_common::hash::CanonicalHasher;
use ydp_common::model::{DataType, Schema};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// A single column value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "lowercase")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    /// Exact numeric carried as its decimal text
    Decimal(String),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Canonical text form used for hashing, keys and parameter binding.
    /// `None` for NULL.
    pub fn canonical(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(b.to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Text(s) => Some(s.clone()),
            Value::Decimal(d) => Some(normalize_decimal(d).unwrap_or_else(|| d.clone())),
            Value::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            Value::Timestamp(ts) => Some(ts.format(TIMESTAMP_FORMAT).to_string()),
        }
    }

    /// Convert into the representation of `data_type`.
    ///
    /// Text coerces into any type by parsing, since text-mode sources and
    /// replica read-back deliver every column as a string. Typed values must
    /// already belong to the column's type family.
    pub fn coerce(self, data_type: &DataType) -> Result<Value, String> {
        if self.is_null() {
            return Ok(Value::Null);
        }

        let coerced = match (data_type, self) {
            (DataType::VarChar { .. } | DataType::Char { .. } | DataType::Text, Value::Text(s)) => {
                Value::Text(s)
            },
            (DataType::Integer, Value::Int(i)) => Value::Int(fit_i32(i)?),
            (DataType::Integer, Value::Text(s)) => Value::Int(fit_i32(parse_int(&s)?)?),
            (DataType::BigInt, Value::Int(i)) => Value::Int(i),
            (DataType::BigInt, Value::Text(s)) => Value::Int(parse_int(&s)?),
            (DataType::Double, Value::Float(f)) => Value::Float(f),
            (DataType::Double, Value::Int(i)) => Value::Float(i as f64),
            (DataType::Double, Value::Text(s)) => Value::Float(
                s.trim()
                    .parse()
                    .map_err(|_| format!("'{}' is not a floating point number", s))?,
            ),
            (DataType::Decimal { .. }, Value::Int(i)) => Value::Decimal(i.to_string()),
            (DataType::Decimal { .. }, Value::Decimal(s) | Value::Text(s)) => {
                Value::Decimal(normalize_decimal(&s).ok_or_else(|| format!("'{}' is not a decimal", s))?)
            },
            (DataType::Boolean, Value::Bool(b)) => Value::Bool(b),
            (DataType::Boolean, Value::Text(s)) => match s.trim().to_lowercase().as_str() {
                "true" | "t" | "1" => Value::Bool(true),
                "false" | "f" | "0" => Value::Bool(false),
                _ => return Err(format!("'{}' is not a boolean", s)),
            },
            (DataType::Date, Value::Date(d)) => Value::Date(d),
            (DataType::Date, Value::Text(s)) => Value::Date(
                NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                    .map_err(|_| format!("'{}' is not a date", s))?,
            ),
            (DataType::Timestamp, Value::Timestamp(ts)) => Value::Timestamp(ts),
            (DataType::Timestamp, Value::Text(s)) => Value::Timestamp(parse_timestamp(&s)?),
            (expected, other) => {
                return Err(format!("{:?} does not fit column type {}", other, expected));
            },
        };

        if let (Some(max), Value::Text(s)) = (data_type.max_length(), &coerced) {
            if s.chars().count() > max as usize {
                return Err(format!("value exceeds {} characters", max));
            }
        }

        Ok(coerced)
    }
}

fn parse_int(s: &str) -> Result<i64, String> {
    s.trim().parse().map_err(|_| format!("'{}' is not an integer", s))
}

fn fit_i32(i: i64) -> Result<i64, String> {
    i32::try_from(i)
        .map(i64::from)
        .map_err(|_| format!("{} is out of range for INTEGER", i))
}

/// Plain decimal text in one canonical spelling: no leading `+`, no
/// redundant zeros and no negative zero. `None` unless `s` is
/// `[+-]digits[.digits]`.
fn normalize_decimal(s: &str) -> Option<String> {
    let trimmed = s.trim();
    let (negative, unsigned) = match trimmed.as_bytes().first()? {
        b'-' => (true, &trimmed[1..]),
        b'+' => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let (whole, fraction) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if !whole.bytes().chain(fraction.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }

    let whole = whole.trim_start_matches('0');
    let fraction = fraction.trim_end_matches('0');
    let mut out = String::with_capacity(unsigned.len() + 1);
    if negative && !(whole.is_empty() && fraction.is_empty()) {
        out.push('-');
    }
    out.push_str(if whole.is_empty() { "0" } else { whole });
    if !fraction.is_empty() {
        out.push('.');
        out.push_str(fraction);
    }
    Some(out)
}

fn parse_timestamp(s: &str) -> Result<NaiveDateTime, String> {
    let trimmed = s.trim();
    NaiveDateTime::parse_from_str(trimmed, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f"))
        .map_err(|_| format!("'{}' is not a timestamp", s))
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Value::Date(d)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Column name to value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(BTreeMap<String, Value>);

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(column.into(), value.into());
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: Value) {
        self.0.insert(column.into(), value);
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Value of `column`, treating an absent column as NULL
    pub fn value_or_null(&self, column: &str) -> &Value {
        self.0.get(column).unwrap_or(&Value::Null)
    }

    /// Primary-key identity of this row under `schema`
    pub fn key(&self, schema: &Schema) -> RowKey {
        let parts: Vec<Option<String>> = schema
            .primary_key()
            .map(|c| self.value_or_null(&c.name).canonical())
            .collect();
        RowKey(serde_json::to_string(&parts).unwrap_or_default())
    }

    /// Content hash over the schema's columns in declared order
    pub fn content_hash(&self, schema: &Schema) -> String {
        let mut hasher = CanonicalHasher::new();
        for column in &schema.columns {
            hasher.part(self.value_or_null(&column.name).canonical().as_deref());
        }
        hasher.finish()
    }

    /// Only the primary-key columns of this row
    pub fn key_projection(&self, schema: &Schema) -> Row {
        let mut row = Row::new();
        for column in schema.primary_key() {
            row.insert(column.name.clone(), self.value_or_null(&column.name).clone());
        }
        row
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Row(iter.into_iter().collect())
    }
}

/// Canonical primary-key text, ordered for deterministic plans
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowKey(pub String);

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Upsert,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub kind: ChangeKind,
    pub row: Row,
}

impl RowChange {
    pub fn upsert(row: Row) -> Self {
        Self {
            kind: ChangeKind::Upsert,
            row,
        }
    }

    pub fn delete(row: Row) -> Self {
        Self {
            kind: ChangeKind::Delete,
            row,
        }
    }
}

/// Everything captured for one dataset at one firing
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetChanges {
    pub dataset: String,
    /// Column names the source actually returned
    pub observed_columns: Vec<String>,
    pub changes: Vec<RowChange>,
    /// Full-table snapshot: keys absent from `changes` are deletions
    pub snapshot: bool,
}

impl DatasetChanges {
    pub fn snapshot(dataset: impl Into<String>, rows: Vec<Row>) -> Self {
        let observed_columns = observed(&rows);
        Self {
            dataset: dataset.into(),
            observed_columns,
            changes: rows.into_iter().map(RowChange::upsert).collect(),
            snapshot: true,
        }
    }

    pub fn change_set(dataset: impl Into<String>, changes: Vec<RowChange>) -> Self {
        let rows: Vec<Row> = changes.iter().map(|c| c.row.clone()).collect();
        Self {
            dataset: dataset.into(),
            observed_columns: observed(&rows),
            changes,
            snapshot: false,
        }
    }
}

fn observed(rows: &[Row]) -> Vec<String> {
    let mut names: Vec<String> = rows
        .iter()
        .flat_map(|r| r.columns().map(str::to_string))
        .collect();
    names.sort();
    names.dedup();
    names
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use ydp_common::model::Column;

    fn schema() -> Schema {
        Schema::new(vec![
            Column::key("id", DataType::VarChar { length: 20 }),
            Column::new("email", DataType::VarChar { length: 100 }),
            Column::new("dob", DataType::Date).not_null(),
        ])
    }

    #[test]
    fn test_text_coerces_to_typed_values() {
        assert_eq!(Value::text("42").coerce(&DataType::Integer).unwrap(), Value::Int(42));
        assert_eq!(
            Value::text("1980-02-29").coerce(&DataType::Date).unwrap(),
            Value::Date(NaiveDate::from_ymd_opt(1980, 2, 29).unwrap())
        );
        assert_eq!(Value::text("1").coerce(&DataType::Boolean).unwrap(), Value::Bool(true));
        assert!(Value::text("2026-10-16T09:00:00.0000000")
            .coerce(&DataType::Timestamp)
            .is_ok());
    }

    #[test]
    fn test_wrong_type_is_rejected() {
        assert!(Value::Bool(true).coerce(&DataType::Integer).is_err());
        assert!(Value::text("abc").coerce(&DataType::Date).is_err());
        assert!(Value::text("x".repeat(21)).coerce(&DataType::VarChar { length: 20 }).is_err());
    }

    #[test]
    fn test_decimal_spellings_hash_alike() {
        let decimal = DataType::Decimal { precision: 10, scale: 2 };
        let spellings = ["1.5", "1.50", "+01.500", " 1.5 "];
        let coerced: Vec<Value> = spellings
            .iter()
            .map(|s| Value::text(*s).coerce(&decimal).unwrap())
            .collect();
        assert!(coerced.iter().all(|v| *v == Value::Decimal("1.5".to_string())));

        assert_eq!(Value::text("-0.00").coerce(&decimal).unwrap().canonical().as_deref(), Some("0"));
        assert_eq!(Value::text("100").coerce(&decimal).unwrap().canonical().as_deref(), Some("100"));
        assert_eq!(Value::text(".25").coerce(&decimal).unwrap().canonical().as_deref(), Some("0.25"));
        assert_eq!(Value::Decimal("2.10".to_string()).canonical().as_deref(), Some("2.1"));

        let a = Row::new().with("id", "1").with("email", Value::Decimal("1.5".to_string()));
        let b = Row::new().with("id", "1").with("email", Value::Decimal("1.50".to_string()));
        assert_eq!(a.content_hash(&schema()), b.content_hash(&schema()));
    }

    #[test]
    fn test_non_finite_and_malformed_decimals_rejected() {
        let decimal = DataType::Decimal { precision: 10, scale: 2 };
        for bad in ["NaN", "inf", "-infinity", "1e3", "1.2.3", "-", ".", ""] {
            assert!(Value::text(bad).coerce(&decimal).is_err(), "{}", bad);
        }
    }

    #[test]
    fn test_integer_range() {
        assert_eq!(
            Value::Int(i64::from(i32::MAX)).coerce(&DataType::Integer).unwrap(),
            Value::Int(2_147_483_647)
        );
        assert!(Value::Int(i64::from(i32::MAX) + 1).coerce(&DataType::Integer).is_err());
        assert!(Value::text("-2147483649").coerce(&DataType::Integer).is_err());
        assert_eq!(
            Value::text("-2147483649").coerce(&DataType::BigInt).unwrap(),
            Value::Int(-2_147_483_649)
        );
    }

    #[test]
    fn test_key_and_hash() {
        let a = Row::new().with("id", "1").with("email", "a@x.com");
        let b = Row::new().with("id", "1").with("email", "b@x.com");
        assert_eq!(a.key(&schema()), b.key(&schema()));
        assert_ne!(a.content_hash(&schema()), b.content_hash(&schema()));

        let explicit_null = a.clone().with("dob", Value::Null);
        assert_eq!(a.content_hash(&schema()), explicit_null.content_hash(&schema()));
    }

    #[test]
    fn test_row_json_shape_is_stable() {
        let row = Row::new()
            .with("id", "1")
            .with("dob", NaiveDate::from_ymd_opt(1990, 1, 2).unwrap());
        let json = serde_json::to_string(&row).unwrap();
        let back: Row = serde_json::from_str(&json).unwrap();
        assert_eq!(row, back);
    }
}
