//! Ecosystem lint
//!
//! Structural checks that must pass before any data motion: unique names,
//! resolvable references, parseable triggers, valid placements, and an acyclic
//! transformer job graph.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use super::ecosystem::{DataContainer, Ecosystem};
use crate::error::{Result, YdpError};

impl Ecosystem {
    /// Run every check and return all issues at once
    pub fn lint(&self) -> Result<()> {
        let mut issues = Vec::new();

        self.check_unique_names(&mut issues);
        self.check_datasets(&mut issues);
        self.check_sinks(&mut issues);
        self.check_triggers(&mut issues);
        self.check_provider(&mut issues);

        if let Err(cycle) = self.check_job_graph() {
            issues.push(cycle);
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(YdpError::Validation(issues))
        }
    }

    fn check_unique_names(&self, issues: &mut Vec<String>) {
        duplicates("datastore", self.datastores().map(|d| d.name.as_str()), issues);
        duplicates("workspace", self.workspaces().map(|w| w.name.as_str()), issues);
        duplicates("team", self.teams.iter().map(|t| t.name.as_str()), issues);

        for store in self.datastores() {
            duplicates(
                &format!("dataset in {}", store.name),
                store.datasets.iter().map(|d| d.name.as_str()),
                issues,
            );
        }
        for workspace in self.workspaces() {
            duplicates(
                &format!("dataset group in {}", workspace.name),
                workspace.dataset_groups.iter().map(|g| g.name.as_str()),
                issues,
            );
        }

        let psp = self.psp();
        duplicates("data platform", psp.data_platforms.iter().map(|p| p.name.as_str()), issues);
        duplicates(
            "replica group",
            psp.consumer_replica_groups.iter().map(|g| g.name.as_str()),
            issues,
        );
        for group in &psp.consumer_replica_groups {
            duplicates(
                &format!("container in {}", group.name),
                group.data_containers.iter().map(|c| c.name.as_str()),
                issues,
            );
        }
    }

    fn check_datasets(&self, issues: &mut Vec<String>) {
        for store in self.datastores() {
            if store.datasets.is_empty() {
                issues.push(format!("datastore {} declares no datasets", store.name));
            }
            for dataset in &store.datasets {
                if dataset.schema.primary_key().next().is_none() {
                    issues.push(format!(
                        "dataset {}.{} has no primary key column",
                        store.name, dataset.name
                    ));
                }
                duplicates(
                    &format!("column in {}.{}", store.name, dataset.name),
                    dataset.schema.columns.iter().map(|c| c.name.as_str()),
                    issues,
                );
            }
        }
    }

    fn check_sinks(&self, issues: &mut Vec<String>) {
        for workspace in self.workspaces() {
            for group in &workspace.dataset_groups {
                if group.sinks.is_empty() {
                    issues.push(format!(
                        "dataset group {}/{} has no sinks",
                        workspace.name, group.name
                    ));
                }
                for sink in &group.sinks {
                    if self.dataset(&sink.datastore, &sink.dataset).is_err() {
                        issues.push(format!(
                            "dataset group {}/{} references unknown dataset {}",
                            workspace.name, group.name, sink
                        ));
                    }
                }
            }
        }
    }

    fn check_triggers(&self, issues: &mut Vec<String>) {
        for store in self.datastores() {
            if let Some(capture) = &store.capture {
                if let Err(e) = capture.trigger.schedule() {
                    issues.push(format!("datastore {}: {}", store.name, e));
                }
            }
        }
        for workspace in self.workspaces() {
            if let Some(job) = &workspace.transformer {
                if let Err(e) = job.trigger.schedule() {
                    issues.push(format!("transformer {}: {}", job.name, e));
                }
                if job.store.capture.is_some() {
                    issues.push(format!(
                        "transformer {} output datastore {} must not declare a capture",
                        job.name, job.store.name
                    ));
                }
            }
        }
        for group in &self.psp().consumer_replica_groups {
            if let Err(e) = group.trigger.schedule() {
                issues.push(format!("replica group {}: {}", group.name, e));
            }
        }
    }

    fn check_provider(&self, issues: &mut Vec<String>) {
        let psp = self.psp();
        if psp.data_platforms.is_empty() {
            issues.push(format!("provider {} declares no data platforms", psp.name));
        }

        let workspaces: HashSet<&str> = self.workspaces().map(|w| w.name.as_str()).collect();
        for group in &psp.consumer_replica_groups {
            if group.data_containers.is_empty() {
                issues.push(format!("replica group {} has no containers", group.name));
            }
            for name in &group.workspace_names {
                if !workspaces.contains(name.as_str()) {
                    issues.push(format!(
                        "replica group {} serves unknown workspace {}",
                        group.name, name
                    ));
                }
            }
        }

        for hint in &psp.hints {
            let Ok(workspace) = self.workspace(&hint.workspace_name) else {
                issues.push(format!("hint references unknown workspace {}", hint.workspace_name));
                continue;
            };
            if workspace.transformer.is_none() {
                issues.push(format!(
                    "hint targets workspace {} which has no transformer",
                    workspace.name
                ));
            }
            let placement = &hint.execution_placement;
            match psp.replica_group(&placement.crg_name) {
                None => issues.push(format!(
                    "placement for {} names unknown replica group {}",
                    hint.workspace_name, placement.crg_name
                )),
                Some(group) => {
                    if group.container(&placement.dc_name).is_none() {
                        issues.push(format!(
                            "placement for {} names unknown container {} in {}",
                            hint.workspace_name, placement.dc_name, placement.crg_name
                        ));
                    }
                    if !group.workspace_names.contains(&hint.workspace_name) {
                        issues.push(format!(
                            "replica group {} does not serve workspace {}",
                            group.name, hint.workspace_name
                        ));
                    }
                },
            }
        }

        for workspace in self.workspaces() {
            if workspace.transformer.is_some() && psp.hint_for(&workspace.name).is_none() {
                issues.push(format!(
                    "transformer workspace {} has no execution placement hint",
                    workspace.name
                ));
            }
        }
    }

    /// Transformer job graph: `A -> B` when B's workspace consumes A's output.
    ///
    /// Returns the first cycle found, rendered as `A -> B -> A`.
    pub fn check_job_graph(&self) -> std::result::Result<(), String> {
        let mut edges: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for consumer in self.workspaces() {
            let Some(job) = &consumer.transformer else {
                continue;
            };
            edges.entry(job.name.as_str()).or_default();
            for store in consumer.consumed_datastores() {
                if let Some(producer) = self.producer_of(store).and_then(|w| w.transformer.as_ref())
                {
                    edges
                        .entry(producer.name.as_str())
                        .or_default()
                        .insert(job.name.as_str());
                }
            }
        }

        let mut done = HashSet::new();
        for start in edges.keys() {
            let mut path = Vec::new();
            if let Some(cycle) = visit(*start, &edges, &mut path, &mut done) {
                return Err(format!("transformer dependency cycle: {}", cycle.join(" -> ")));
            }
        }
        Ok(())
    }
}

fn visit<'a>(
    node: &'a str,
    edges: &BTreeMap<&'a str, BTreeSet<&'a str>>,
    path: &mut Vec<&'a str>,
    done: &mut HashSet<&'a str>,
) -> Option<Vec<&'a str>> {
    if let Some(pos) = path.iter().position(|n| *n == node) {
        let mut cycle = path[pos..].to_vec();
        cycle.push(node);
        return Some(cycle);
    }
    if done.contains(node) {
        return None;
    }

    path.push(node);
    for next in edges.get(node).into_iter().flatten() {
        if let Some(cycle) = visit(*next, edges, path, done) {
            return Some(cycle);
        }
    }
    path.pop();
    done.insert(node);
    None
}

fn duplicates<'a>(kind: &str, names: impl Iterator<Item = &'a str>, issues: &mut Vec<String>) {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            issues.push(format!("duplicate {} name: {}", kind, name));
        }
    }
}

/// Containers the engine has no replica adapter for
pub fn unsupported_replica_containers(eco: &Ecosystem) -> Vec<(&str, &DataContainer)> {
    use super::ecosystem::ContainerKind;

    eco.psp()
        .consumer_replica_groups
        .iter()
        .flat_map(|g| g.data_containers.iter().map(move |c| (g.name.as_str(), c)))
        .filter(|(_, c)| matches!(c.kind, ContainerKind::Oracle | ContainerKind::Db2))
        .collect()
}
