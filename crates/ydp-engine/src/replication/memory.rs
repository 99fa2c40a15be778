//! In-memory replica targets
//!
//! Behave like a transactional database for the dispatcher: a rowset either
//! lands with its watermark or not at all. Reachability and mid-apply crashes
//! can be injected.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ydp_common::model::{ContainerKind, Credential, DataContainer};

use super::dialect::{PostgresDialect, SqlDialect, SqlServerDialect, OPEN_VERSION};
use super::target::{
    ReplicaTarget, RowOp, RowSet, TableSpec, TargetError, TargetProvider, WriteMode, BATCH_IN_COLUMN,
    BATCH_OUT_COLUMN,
};
use crate::records::{Row, Value};

#[derive(Debug, Clone)]
struct MemTable {
    spec: TableSpec,
    rows: Vec<Row>,
}

impl MemTable {
    fn same_key(&self, a: &Row, b: &Row) -> bool {
        self.spec.keys().all(|c| a.value_or_null(&c.name).canonical() == b.value_or_null(&c.name).canonical())
    }

    fn is_open(row: &Row) -> bool {
        row.get(BATCH_OUT_COLUMN) == Some(&Value::Int(OPEN_VERSION))
    }

    fn apply(&mut self, batch: i64, op: &RowOp) -> Result<(), TargetError> {
        let versioned = self.spec.mode == WriteMode::AppendVersioned;
        match (op, versioned) {
            (RowOp::Upsert(row), false) => {
                let projected = self.project(row);
                match self.rows.iter().position(|r| self.same_key(r, row)) {
                    Some(idx) => self.rows[idx] = projected,
                    None => self.rows.push(projected),
                }
            },
            (RowOp::Delete(row), false) => {
                let keep: Vec<Row> = self.rows.iter().filter(|r| !self.same_key(r, row)).cloned().collect();
                self.rows = keep;
            },
            (RowOp::Open(row), true) => {
                let mut projected = self.project(row);
                projected.insert(BATCH_IN_COLUMN, Value::Int(batch));
                projected.insert(BATCH_OUT_COLUMN, Value::Int(OPEN_VERSION));
                let duplicate = self.rows.iter().any(|r| {
                    self.same_key(r, row) && r.get(BATCH_IN_COLUMN) == Some(&Value::Int(batch))
                });
                if duplicate {
                    return Err(TargetError::Statement(format!(
                        "duplicate version in {} at batch {}",
                        self.spec.name, batch
                    )));
                }
                self.rows.push(projected);
            },
            (RowOp::Close(row), true) => {
                let open: Vec<usize> = self
                    .rows
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| Self::is_open(r) && self.same_key(r, row))
                    .map(|(i, _)| i)
                    .collect();
                for idx in open {
                    self.rows[idx].insert(BATCH_OUT_COLUMN, Value::Int(batch));
                }
            },
            (op, _) => {
                return Err(TargetError::Statement(format!(
                    "{} does not apply to {:?} table {}",
                    op.name(),
                    self.spec.mode,
                    self.spec.name
                )))
            },
        }
        Ok(())
    }

    fn project(&self, row: &Row) -> Row {
        self.spec
            .columns
            .iter()
            .map(|c| (c.name.clone(), row.value_or_null(&c.name).clone()))
            .collect()
    }
}

#[derive(Debug, Default)]
struct TargetState {
    tables: HashMap<String, MemTable>,
    watermarks: HashMap<String, i64>,
    executed: Vec<String>,
    /// Ops left before an injected crash
    crash_after: Option<usize>,
}

pub struct MemoryReplicaTarget {
    name: String,
    kind: ContainerKind,
    reachable: AtomicBool,
    state: Mutex<TargetState>,
}

impl MemoryReplicaTarget {
    pub fn new(name: impl Into<String>, kind: ContainerKind) -> Self {
        Self {
            name: name.into(),
            kind,
            reachable: AtomicBool::new(true),
            state: Mutex::new(TargetState::default()),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Fail the next rowset after `ops` of its row ops, discarding all of them
    pub fn crash_after(&self, ops: usize) {
        self.lock().crash_after = Some(ops);
    }

    /// Current rows of `table`, values as stored
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock().tables.get(table).map(|t| t.rows.clone()).unwrap_or_default()
    }

    pub fn stored_watermark(&self, table: &str) -> i64 {
        self.lock().watermarks.get(table).copied().unwrap_or(0)
    }

    /// Statements passed to `execute`, in order
    pub fn executed(&self) -> Vec<String> {
        self.lock().executed.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TargetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_reachable(&self) -> Result<(), TargetError> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(TargetError::Unreachable(format!("{} is not accepting connections", self.name)))
        }
    }

    fn table_mut<'a>(state: &'a mut TargetState, table: &TableSpec) -> &'a mut MemTable {
        state.tables.entry(table.name.clone()).or_insert_with(|| MemTable {
            spec: table.clone(),
            rows: Vec::new(),
        })
    }
}

#[async_trait]
impl ReplicaTarget for MemoryReplicaTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn dialect(&self) -> &dyn SqlDialect {
        match self.kind {
            ContainerKind::SqlServer => &SqlServerDialect,
            _ => &PostgresDialect,
        }
    }

    async fn watermark(&self, table: &str) -> Result<i64, TargetError> {
        self.check_reachable()?;
        Ok(self.stored_watermark(table))
    }

    async fn ensure_table(&self, table: &TableSpec) -> Result<(), TargetError> {
        self.check_reachable()?;
        let mut state = self.lock();
        Self::table_mut(&mut state, table);
        Ok(())
    }

    async fn apply_rowset(&self, table: &TableSpec, rows: &RowSet) -> Result<bool, TargetError> {
        self.check_reachable()?;
        let mut state = self.lock();

        let current = state.watermarks.get(&table.name).copied().unwrap_or(0);
        if current >= rows.batch {
            return Ok(false);
        }

        let crash_after = state.crash_after.take();
        let mut staged = Self::table_mut(&mut state, table).clone();
        for (applied, op) in rows.ops.iter().enumerate() {
            if crash_after == Some(applied) {
                return Err(TargetError::Unreachable(format!(
                    "{} lost its connection mid-apply of batch {}",
                    self.name, rows.batch
                )));
            }
            staged.apply(rows.batch, op)?;
        }

        state.tables.insert(table.name.clone(), staged);
        state.watermarks.insert(table.name.clone(), rows.batch);
        Ok(true)
    }

    async fn write_rows(&self, table: &TableSpec, rows: &[Row]) -> Result<(), TargetError> {
        self.check_reachable()?;
        let mut state = self.lock();
        let mut staged = Self::table_mut(&mut state, table).clone();
        for row in rows {
            staged.apply(0, &RowOp::Upsert(row.clone()))?;
        }
        state.tables.insert(table.name.clone(), staged);
        Ok(())
    }

    async fn clear_table(&self, table: &str) -> Result<(), TargetError> {
        self.check_reachable()?;
        if let Some(t) = self.lock().tables.get_mut(table) {
            t.rows.clear();
        }
        Ok(())
    }

    async fn fetch_rows(&self, table: &str, columns: &[String]) -> Result<Vec<Row>, TargetError> {
        self.check_reachable()?;
        let state = self.lock();
        let stored = state
            .tables
            .get(table)
            .ok_or_else(|| TargetError::Statement(format!("table {} does not exist", table)))?;
        Ok(stored
            .rows
            .iter()
            .map(|r| {
                columns
                    .iter()
                    .map(|c| {
                        let text = r.value_or_null(c).canonical().map(Value::Text).unwrap_or(Value::Null);
                        (c.clone(), text)
                    })
                    .collect()
            })
            .collect())
    }

    async fn execute(&self, sql: &str) -> Result<(), TargetError> {
        self.check_reachable()?;
        self.lock().executed.push(sql.to_string());
        Ok(())
    }
}

/// Hands out registered in-memory targets by container name
#[derive(Default)]
pub struct MemoryTargetProvider {
    targets: Mutex<HashMap<String, Arc<MemoryReplicaTarget>>>,
}

impl MemoryTargetProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Target for `container`, created on first use
    pub fn target(&self, container: &DataContainer) -> Arc<MemoryReplicaTarget> {
        self.targets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(container.name.clone())
            .or_insert_with(|| Arc::new(MemoryReplicaTarget::new(&container.name, container.kind)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<MemoryReplicaTarget>> {
        self.targets.lock().unwrap_or_else(|e| e.into_inner()).get(name).cloned()
    }
}

#[async_trait]
impl TargetProvider for MemoryTargetProvider {
    async fn connect(
        &self,
        container: &DataContainer,
        _credential: &Credential,
    ) -> Result<Arc<dyn ReplicaTarget>, TargetError> {
        let target = self.target(container);
        target.check_reachable()?;
        Ok(target)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use ydp_common::model::{Column, DataType, Schema};

    fn table(mode: WriteMode) -> TableSpec {
        TableSpec::new(
            "t",
            &Schema::new(vec![
                Column::key("id", DataType::Text),
                Column::new("email", DataType::Text),
            ]),
            mode,
        )
    }

    fn row(id: &str, email: &str) -> Row {
        Row::new().with("id", id).with("email", email)
    }

    #[tokio::test]
    async fn test_crash_leaves_no_partial_rows() {
        let target = MemoryReplicaTarget::new("pg", ContainerKind::Postgres);
        let spec = table(WriteMode::Upsert);
        target.crash_after(1);

        let rows = RowSet::new(1, vec![RowOp::Upsert(row("1", "a")), RowOp::Upsert(row("2", "b"))]);
        assert!(target.apply_rowset(&spec, &rows).await.is_err());
        assert!(target.rows("t").is_empty());
        assert_eq!(target.stored_watermark("t"), 0);

        assert!(target.apply_rowset(&spec, &rows).await.unwrap());
        assert_eq!(target.rows("t").len(), 2);
        assert!(!target.apply_rowset(&spec, &rows).await.unwrap());
    }

    #[tokio::test]
    async fn test_versioned_close_then_open() {
        let target = MemoryReplicaTarget::new("mssql", ContainerKind::SqlServer);
        let spec = table(WriteMode::AppendVersioned);

        target
            .apply_rowset(&spec, &RowSet::new(1, vec![RowOp::Open(row("1", "a"))]))
            .await
            .unwrap();
        target
            .apply_rowset(
                &spec,
                &RowSet::new(2, vec![RowOp::Close(row("1", "a")), RowOp::Open(row("1", "b"))]),
            )
            .await
            .unwrap();

        let rows = target.rows("t");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get(BATCH_OUT_COLUMN), Some(&Value::Int(2)));
        assert!(MemTable::is_open(&rows[1]));
        assert_eq!(target.dialect().name(), "SQL Server");
    }

    #[tokio::test]
    async fn test_unreachable_target_refuses_everything() {
        let target = MemoryReplicaTarget::new("pg", ContainerKind::Postgres);
        target.set_reachable(false);
        assert!(matches!(target.watermark("t").await, Err(TargetError::Unreachable(_))));
    }
}
