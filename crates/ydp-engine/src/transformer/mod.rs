//! Transformer jobs
//!
//! A transformer body sees only resolved table names (through
//! [`TransformerContext`]) and a connection to the database its placement
//! names. Whatever it leaves in its output tables becomes the next batch of
//! the output datastore.

mod runner;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use ydp_common::model::{CodeArtifact, Datastore};

use crate::error::{PipelineError, Result};
use crate::replication::{ReplicaTarget, TableSpec, WriteMode};
use crate::router::DatasetRouter;

pub use runner::{TransformOutcome, TransformerRunner};

/// Name resolution handed to a transformer body
pub struct TransformerContext {
    workspace: String,
    job: String,
    router: Arc<DatasetRouter>,
    output: Datastore,
}

impl TransformerContext {
    pub fn new(workspace: impl Into<String>, job: impl Into<String>, router: Arc<DatasetRouter>, output: Datastore) -> Self {
        Self {
            workspace: workspace.into(),
            job: job.into(),
            router,
            output,
        }
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    /// Replica table holding `datastore.dataset` as routed for `group`
    pub fn get_input_table_name(&self, group: &str, datastore: &str, dataset: &str) -> Result<String> {
        let resolution = self.router.resolve(&self.workspace, group)?;
        resolution
            .sink(datastore, dataset)
            .map(|s| s.table.clone())
            .ok_or_else(|| {
                PipelineError::Config(format!(
                    "dataset group {}/{} has no sink {}#{}",
                    self.workspace, group, datastore, dataset
                ))
            })
    }

    /// Scratch table the body fills for output dataset `dataset`
    pub fn get_output_table_name(&self, dataset: &str) -> Result<String> {
        if self.output.dataset(dataset).is_none() {
            return Err(PipelineError::Config(format!(
                "output datastore {} has no dataset {}",
                self.output.name, dataset
            )));
        }
        Ok(output_table_name(&self.workspace, &self.output.name, dataset))
    }

    /// Output datastore's datasets with their scratch tables
    pub fn output_tables(&self) -> Vec<(String, TableSpec)> {
        self.output
            .datasets
            .iter()
            .map(|d| {
                let table = output_table_name(&self.workspace, &self.output.name, &d.name);
                (d.name.clone(), TableSpec::new(table, &d.schema, WriteMode::Upsert))
            })
            .collect()
    }
}

fn output_table_name(workspace: &str, datastore: &str, dataset: &str) -> String {
    format!("{}_{}_{}_dt", workspace, datastore, dataset).to_lowercase()
}

/// User transformation code
#[async_trait]
pub trait Transformer: Send + Sync {
    async fn execute(&self, context: &TransformerContext, connection: &dyn ReplicaTarget) -> anyhow::Result<()>;
}

/// SQL script with `{{input:group/store/dataset}}` and `{{output:dataset}}`
/// placeholders, run as one statement batch
pub struct SqlTransformer {
    script: String,
}

impl SqlTransformer {
    pub fn new(script: impl Into<String>) -> Self {
        Self { script: script.into() }
    }

    /// Replace every placeholder with its quoted table name
    pub fn expand(&self, context: &TransformerContext, quote: impl Fn(&str) -> String) -> Result<String> {
        let mut out = String::with_capacity(self.script.len());
        let mut rest = self.script.as_str();

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or_else(|| PipelineError::Config("unterminated {{ placeholder".to_string()))?;
            let placeholder = after[..end].trim();

            let table = match placeholder.split_once(':') {
                Some(("input", path)) => match path.split('/').collect::<Vec<_>>().as_slice() {
                    [group, store, dataset] => context.get_input_table_name(group, store, dataset)?,
                    _ => {
                        return Err(PipelineError::Config(format!(
                            "input placeholder {} must be group/store/dataset",
                            path
                        )))
                    },
                },
                Some(("output", dataset)) => context.get_output_table_name(dataset)?,
                _ => {
                    return Err(PipelineError::Config(format!("unknown placeholder {{{{{}}}}}", placeholder)));
                },
            };
            out.push_str(&quote(&table));
            rest = &after[end + 2..];
        }

        out.push_str(rest);
        Ok(out)
    }
}

#[async_trait]
impl Transformer for SqlTransformer {
    async fn execute(&self, context: &TransformerContext, connection: &dyn ReplicaTarget) -> anyhow::Result<()> {
        let dialect = connection.dialect();
        let sql = self.expand(context, |t| dialect.quote(t))?;
        connection.execute(&sql).await?;
        Ok(())
    }
}

/// Code artifacts the engine can run
#[derive(Default)]
pub struct TransformerRegistry {
    registered: HashMap<String, Arc<dyn Transformer>>,
}

impl TransformerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: impl Into<String>, transformer: Arc<dyn Transformer>) -> Self {
        self.registered.insert(name.into(), transformer);
        self
    }

    pub fn resolve(&self, code: &CodeArtifact) -> Result<Arc<dyn Transformer>> {
        match code {
            CodeArtifact::Sql { script } => Ok(Arc::new(SqlTransformer::new(script.clone()))),
            CodeArtifact::Registered { name } => self
                .registered
                .get(name)
                .cloned()
                .ok_or_else(|| PipelineError::Config(format!("no transformer registered as {}", name))),
        }
    }
}
