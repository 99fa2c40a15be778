//! SQL dialects for replica targets
//!
//! Every value is bound as text (or NULL) and converted in SQL with a typed
//! cast, so one binding path serves all column types on both products.
//!
//! Parameter order per statement:
//! - `upsert`: every column in table order
//! - `delete`: key columns
//! - `insert_version`: every column, then the opening batch
//! - `close_version`: the closing batch, then key columns
//! - `select_watermark`: view name
//! - `upsert_watermark`: view name, batch

use ydp_common::model::{Column, DataType};

use super::target::{TableSpec, WriteMode, BATCH_IN_COLUMN, BATCH_OUT_COLUMN};

/// Watermark table present in every target database
pub const WATERMARK_TABLE: &str = "ydp_replication_watermarks";

/// `ydp_batch_out` of a current version
pub const OPEN_VERSION: i64 = i64::MAX;

pub trait SqlDialect: Send + Sync {
    fn name(&self) -> &'static str;

    fn quote(&self, ident: &str) -> String;

    fn native_type(&self, data_type: &DataType) -> String;

    /// 1-based parameter marker
    fn placeholder(&self, index: usize) -> String;

    /// Parameter converted from its text binding to `data_type`
    fn typed_placeholder(&self, index: usize, data_type: &DataType) -> String {
        format!("CAST({} AS {})", self.placeholder(index), self.native_type(data_type))
    }

    fn batch_placeholder(&self, index: usize) -> String {
        self.typed_placeholder(index, &DataType::BigInt)
    }

    /// Expression reading `column` back as text
    fn text_cast(&self, column: &str) -> String;

    fn create_table(&self, table: &TableSpec) -> String;

    fn upsert(&self, table: &TableSpec) -> String;

    fn watermark_ddl(&self) -> String;

    /// Watermark read that locks the row for the rest of the transaction
    fn select_watermark_for_update(&self) -> String;

    fn upsert_watermark(&self) -> String;

    fn select_watermark(&self) -> String {
        format!(
            "SELECT batch_seq FROM {} WHERE view_name = {}",
            WATERMARK_TABLE,
            self.placeholder(1)
        )
    }

    fn delete(&self, table: &TableSpec) -> String {
        format!(
            "DELETE FROM {} WHERE {}",
            self.quote(&table.name),
            key_predicate(self, table, 1)
        )
    }

    fn insert_version(&self, table: &TableSpec) -> String {
        let names: Vec<String> = table
            .columns
            .iter()
            .map(|c| self.quote(&c.name))
            .chain([self.quote(BATCH_IN_COLUMN), self.quote(BATCH_OUT_COLUMN)])
            .collect();
        let values: Vec<String> = typed_values(self, &table.columns, 1)
            .into_iter()
            .chain([
                self.batch_placeholder(table.columns.len() + 1),
                OPEN_VERSION.to_string(),
            ])
            .collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.quote(&table.name),
            names.join(", "),
            values.join(", ")
        )
    }

    fn close_version(&self, table: &TableSpec) -> String {
        format!(
            "UPDATE {} SET {} = {} WHERE {} AND {} = {}",
            self.quote(&table.name),
            self.quote(BATCH_OUT_COLUMN),
            self.batch_placeholder(1),
            key_predicate(self, table, 2),
            self.quote(BATCH_OUT_COLUMN),
            OPEN_VERSION
        )
    }

    fn select_text(&self, table: &str, columns: &[String]) -> String {
        let projection: Vec<String> = columns
            .iter()
            .map(|c| format!("{} AS {}", self.text_cast(&self.quote(c)), self.quote(c)))
            .collect();
        format!("SELECT {} FROM {}", projection.join(", "), self.quote(table))
    }

    fn delete_all(&self, table: &str) -> String {
        format!("DELETE FROM {}", self.quote(table))
    }
}

fn typed_values<D: SqlDialect + ?Sized>(dialect: &D, columns: &[Column], first: usize) -> Vec<String> {
    columns
        .iter()
        .enumerate()
        .map(|(i, c)| dialect.typed_placeholder(first + i, &c.data_type))
        .collect()
}

fn key_predicate<D: SqlDialect + ?Sized>(dialect: &D, table: &TableSpec, first: usize) -> String {
    table
        .keys()
        .enumerate()
        .map(|(i, c)| {
            format!(
                "{} = {}",
                dialect.quote(&c.name),
                dialect.typed_placeholder(first + i, &c.data_type)
            )
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn column_defs<D: SqlDialect + ?Sized>(dialect: &D, table: &TableSpec) -> Vec<String> {
    let mut defs: Vec<String> = table
        .columns
        .iter()
        .map(|c| {
            let null = if c.accepts_null() { "NULL" } else { "NOT NULL" };
            format!("{} {} {}", dialect.quote(&c.name), dialect.native_type(&c.data_type), null)
        })
        .collect();

    let mut key: Vec<String> = table.keys().map(|c| dialect.quote(&c.name)).collect();
    if table.mode == WriteMode::AppendVersioned {
        defs.push(format!("{} BIGINT NOT NULL", dialect.quote(BATCH_IN_COLUMN)));
        defs.push(format!("{} BIGINT NOT NULL", dialect.quote(BATCH_OUT_COLUMN)));
        key.push(dialect.quote(BATCH_IN_COLUMN));
    }
    defs.push(format!("PRIMARY KEY ({})", key.join(", ")));
    defs
}

// ============================================================================
// PostgreSQL
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn quote(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn native_type(&self, data_type: &DataType) -> String {
        match data_type {
            DataType::VarChar { length } => format!("VARCHAR({})", length),
            DataType::Char { length } => format!("CHAR({})", length),
            DataType::Text => "TEXT".to_string(),
            DataType::Integer => "INTEGER".to_string(),
            DataType::BigInt => "BIGINT".to_string(),
            DataType::Decimal { precision, scale } => format!("NUMERIC({},{})", precision, scale),
            DataType::Double => "DOUBLE PRECISION".to_string(),
            DataType::Boolean => "BOOLEAN".to_string(),
            DataType::Date => "DATE".to_string(),
            DataType::Timestamp => "TIMESTAMP".to_string(),
        }
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn text_cast(&self, column: &str) -> String {
        format!("CAST({} AS TEXT)", column)
    }

    fn create_table(&self, table: &TableSpec) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.quote(&table.name),
            column_defs(self, table).join(", ")
        )
    }

    fn upsert(&self, table: &TableSpec) -> String {
        let names: Vec<String> = table.columns.iter().map(|c| self.quote(&c.name)).collect();
        let keys: Vec<String> = table.keys().map(|c| self.quote(&c.name)).collect();
        let updates: Vec<String> = table
            .non_keys()
            .map(|c| format!("{0} = EXCLUDED.{0}", self.quote(&c.name)))
            .collect();
        let action = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", updates.join(", "))
        };
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
            self.quote(&table.name),
            names.join(", "),
            typed_values(self, &table.columns, 1).join(", "),
            keys.join(", "),
            action
        )
    }

    fn watermark_ddl(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (view_name TEXT PRIMARY KEY, batch_seq BIGINT NOT NULL, updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW())",
            WATERMARK_TABLE
        )
    }

    fn select_watermark_for_update(&self) -> String {
        format!("{} FOR UPDATE", self.select_watermark())
    }

    fn upsert_watermark(&self) -> String {
        format!(
            "INSERT INTO {0} (view_name, batch_seq, updated_at) VALUES ($1, {1}, NOW()) \
             ON CONFLICT (view_name) DO UPDATE \
             SET batch_seq = GREATEST({0}.batch_seq, EXCLUDED.batch_seq), updated_at = NOW()",
            WATERMARK_TABLE,
            self.batch_placeholder(2)
        )
    }
}

// ============================================================================
// SQL Server
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct SqlServerDialect;

impl SqlDialect for SqlServerDialect {
    fn name(&self) -> &'static str {
        "SQL Server"
    }

    fn quote(&self, ident: &str) -> String {
        format!("[{}]", ident.replace(']', "]]"))
    }

    fn native_type(&self, data_type: &DataType) -> String {
        match data_type {
            DataType::VarChar { length } if *length <= 4000 => format!("NVARCHAR({})", length),
            DataType::VarChar { .. } | DataType::Text => "NVARCHAR(MAX)".to_string(),
            DataType::Char { length } => format!("NCHAR({})", length),
            DataType::Integer => "INT".to_string(),
            DataType::BigInt => "BIGINT".to_string(),
            DataType::Decimal { precision, scale } => format!("DECIMAL({},{})", precision, scale),
            DataType::Double => "FLOAT".to_string(),
            DataType::Boolean => "BIT".to_string(),
            DataType::Date => "DATE".to_string(),
            DataType::Timestamp => "DATETIME2".to_string(),
        }
    }

    fn placeholder(&self, index: usize) -> String {
        format!("@P{}", index)
    }

    fn text_cast(&self, column: &str) -> String {
        format!("CAST({} AS NVARCHAR(MAX))", column)
    }

    fn create_table(&self, table: &TableSpec) -> String {
        format!(
            "IF OBJECT_ID(N'{0}', N'U') IS NULL CREATE TABLE {1} ({2})",
            table.name.replace('\'', "''"),
            self.quote(&table.name),
            column_defs(self, table).join(", ")
        )
    }

    fn upsert(&self, table: &TableSpec) -> String {
        let source: Vec<String> = table
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| {
                format!(
                    "{} AS {}",
                    self.typed_placeholder(i + 1, &c.data_type),
                    self.quote(&c.name)
                )
            })
            .collect();
        let on: Vec<String> = table
            .keys()
            .map(|c| format!("target.{0} = source.{0}", self.quote(&c.name)))
            .collect();
        let updates: Vec<String> = table
            .non_keys()
            .map(|c| format!("target.{0} = source.{0}", self.quote(&c.name)))
            .collect();
        let names: Vec<String> = table.columns.iter().map(|c| self.quote(&c.name)).collect();
        let inserts: Vec<String> = table
            .columns
            .iter()
            .map(|c| format!("source.{}", self.quote(&c.name)))
            .collect();

        let matched = if updates.is_empty() {
            String::new()
        } else {
            format!(" WHEN MATCHED THEN UPDATE SET {}", updates.join(", "))
        };
        format!(
            "MERGE {} WITH (HOLDLOCK) AS target USING (SELECT {}) AS source ON ({}){} \
             WHEN NOT MATCHED THEN INSERT ({}) VALUES ({});",
            self.quote(&table.name),
            source.join(", "),
            on.join(" AND "),
            matched,
            names.join(", "),
            inserts.join(", ")
        )
    }

    fn watermark_ddl(&self) -> String {
        format!(
            "IF OBJECT_ID(N'{0}', N'U') IS NULL CREATE TABLE {0} (view_name NVARCHAR(400) NOT NULL PRIMARY KEY, batch_seq BIGINT NOT NULL, updated_at DATETIME2 NOT NULL DEFAULT SYSUTCDATETIME())",
            WATERMARK_TABLE
        )
    }

    fn select_watermark_for_update(&self) -> String {
        format!(
            "SELECT batch_seq FROM {} WITH (UPDLOCK, HOLDLOCK) WHERE view_name = @P1",
            WATERMARK_TABLE
        )
    }

    fn upsert_watermark(&self) -> String {
        format!(
            "MERGE {0} WITH (HOLDLOCK) AS target \
             USING (SELECT @P1 AS view_name, {1} AS batch_seq) AS source \
             ON (target.view_name = source.view_name) \
             WHEN MATCHED AND target.batch_seq < source.batch_seq THEN \
             UPDATE SET batch_seq = source.batch_seq, updated_at = SYSUTCDATETIME() \
             WHEN NOT MATCHED THEN INSERT (view_name, batch_seq) VALUES (source.view_name, source.batch_seq);",
            WATERMARK_TABLE,
            self.batch_placeholder(2)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ydp_common::model::{Column, Schema};

    fn customers(mode: WriteMode) -> TableSpec {
        TableSpec::new(
            "yellowlive_store1_customers",
            &Schema::new(vec![
                Column::key("id", DataType::VarChar { length: 20 }),
                Column::new("email", DataType::VarChar { length: 100 }),
                Column::new("dob", DataType::Date).not_null(),
            ]),
            mode,
        )
    }

    #[test]
    fn test_postgres_upsert() {
        let sql = PostgresDialect.upsert(&customers(WriteMode::Upsert));
        assert!(sql.starts_with("INSERT INTO \"yellowlive_store1_customers\" (\"id\", \"email\", \"dob\")"));
        assert!(sql.contains("CAST($3 AS DATE)"));
        assert!(sql.contains("ON CONFLICT (\"id\") DO UPDATE SET \"email\" = EXCLUDED.\"email\""));
    }

    #[test]
    fn test_sqlserver_merge_upsert() {
        let sql = SqlServerDialect.upsert(&customers(WriteMode::Upsert));
        assert!(sql.starts_with("MERGE [yellowlive_store1_customers] WITH (HOLDLOCK)"));
        assert!(sql.contains("CAST(@P1 AS NVARCHAR(20)) AS [id]"));
        assert!(sql.contains("WHEN MATCHED THEN UPDATE SET target.[email] = source.[email]"));
        assert!(sql.ends_with(';'));
    }

    #[test]
    fn test_key_only_table_never_updates() {
        let table = TableSpec::new(
            "tags",
            &Schema::new(vec![Column::key("tag", DataType::Text)]),
            WriteMode::Upsert,
        );
        assert!(PostgresDialect.upsert(&table).ends_with("DO NOTHING"));
        assert!(!SqlServerDialect.upsert(&table).contains("WHEN MATCHED"));
    }

    #[test]
    fn test_versioned_table_layout() {
        let table = customers(WriteMode::AppendVersioned);
        let ddl = PostgresDialect.create_table(&table);
        assert!(ddl.contains("\"ydp_batch_in\" BIGINT NOT NULL"));
        assert!(ddl.contains("PRIMARY KEY (\"id\", \"ydp_batch_in\")"));
        assert!(ddl.contains("\"dob\" DATE NOT NULL"));

        let insert = PostgresDialect.insert_version(&table);
        assert!(insert.contains("CAST($4 AS BIGINT), 9223372036854775807"));

        let close = SqlServerDialect.close_version(&table);
        assert_eq!(
            close,
            "UPDATE [yellowlive_store1_customers] SET [ydp_batch_out] = CAST(@P1 AS BIGINT) \
             WHERE [id] = CAST(@P2 AS NVARCHAR(20)) AND [ydp_batch_out] = 9223372036854775807"
        );
    }

    #[test]
    fn test_quoting() {
        assert_eq!(PostgresDialect.quote("a\"b"), "\"a\"\"b\"");
        assert_eq!(SqlServerDialect.quote("a]b"), "[a]]b]");
    }
}
