//! Dataset schemas
//!
//! A dataset is an ordered list of typed columns. Schema changes are declared
//! by bumping `version`; the engine treats an unversioned change as a mismatch.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::hash::CanonicalHasher;

/// Column data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DataType {
    #[serde(rename = "varchar")]
    VarChar { length: u32 },
    Char { length: u32 },
    Text,
    Integer,
    #[serde(rename = "bigint")]
    BigInt,
    Decimal { precision: u8, scale: u8 },
    Double,
    Boolean,
    Date,
    Timestamp,
}

impl DataType {
    /// Whether values of this type are carried as strings
    pub fn is_textual(&self) -> bool {
        matches!(self, DataType::VarChar { .. } | DataType::Char { .. } | DataType::Text)
    }

    /// Maximum character length, when the type declares one
    pub fn max_length(&self) -> Option<u32> {
        match self {
            DataType::VarChar { length } | DataType::Char { length } => Some(*length),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::VarChar { length } => write!(f, "VARCHAR({})", length),
            DataType::Char { length } => write!(f, "CHAR({})", length),
            DataType::Text => write!(f, "TEXT"),
            DataType::Integer => write!(f, "INTEGER"),
            DataType::BigInt => write!(f, "BIGINT"),
            DataType::Decimal { precision, scale } => write!(f, "DECIMAL({},{})", precision, scale),
            DataType::Double => write!(f, "DOUBLE"),
            DataType::Boolean => write!(f, "BOOLEAN"),
            DataType::Date => write!(f, "DATE"),
            DataType::Timestamp => write!(f, "TIMESTAMP"),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_schema_version() -> u32 {
    1
}

/// A typed, nullable/primary-key-flagged column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(flatten)]
    pub data_type: DataType,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            primary_key: false,
        }
    }

    /// Primary-key column; implies NOT NULL
    pub fn key(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: false,
            primary_key: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Effective nullability (primary-key columns never accept NULL)
    pub fn accepts_null(&self) -> bool {
        self.nullable && !self.primary_key
    }
}

/// Ordered column list plus a declared version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default = "default_schema_version")]
    pub version: u32,
    pub columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            version: default_schema_version(),
            columns,
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.primary_key)
    }

    pub fn primary_key_names(&self) -> Vec<&str> {
        self.primary_key().map(|c| c.name.as_str()).collect()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Shape fingerprint: names, types, nullability and key flags in order.
    /// The version is deliberately excluded.
    pub fn fingerprint(&self) -> String {
        let mut hasher = CanonicalHasher::new();
        for column in &self.columns {
            hasher
                .part(Some(&column.name))
                .part(Some(&column.data_type.to_string()))
                .part(Some(if column.accepts_null() { "NULL" } else { "NOT NULL" }))
                .part(Some(if column.primary_key { "PK" } else { "" }));
        }
        hasher.finish()
    }
}

/// Data classification tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClassificationTag {
    /// Public
    Pub,
    /// Intellectual property
    Ip,
    Pc1,
    Pc2,
    Pc3,
    /// Client personal information
    Cpi,
    /// Material non-public information
    Mnpi,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub tag: ClassificationTag,
    #[serde(default)]
    pub label: Option<String>,
}

impl Classification {
    pub fn is_regulated(&self) -> bool {
        self.tag != ClassificationTag::Pub
    }
}

/// A named relational schema plus classification tags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    pub schema: Schema,
    #[serde(default)]
    pub classifications: Vec<Classification>,
}

impl Dataset {
    pub fn new(name: impl Into<String>, schema: Schema) -> Self {
        Self {
            name: name.into(),
            schema,
            classifications: Vec::new(),
        }
    }

    pub fn is_regulated(&self) -> bool {
        self.classifications.iter().any(Classification::is_regulated)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn customers() -> Schema {
        Schema::new(vec![
            Column::key("id", DataType::VarChar { length: 20 }),
            Column::new("email", DataType::VarChar { length: 100 }),
        ])
    }

    #[test]
    fn test_column_yaml_shape() {
        let yaml = "name: dob\ntype: date\nnullable: false\n";
        let column: Column = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(column.data_type, DataType::Date);
        assert!(!column.nullable);
        assert!(!column.primary_key);

        let yaml = "name: id\ntype: varchar\nlength: 20\nprimary_key: true\n";
        let column: Column = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(column.data_type, DataType::VarChar { length: 20 });
        assert!(!column.accepts_null());
    }

    #[test]
    fn test_fingerprint_ignores_version() {
        let a = customers();
        let b = customers().with_version(7);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_detects_type_change() {
        let a = customers();
        let mut b = customers();
        b.columns[1].data_type = DataType::VarChar { length: 200 };
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_primary_key_names() {
        assert_eq!(customers().primary_key_names(), vec!["id"]);
    }
}
