//! Pure classification of registry and queue snapshots

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::broker::BrokerError;
use crate::domain::{DeliveryTag, ProcessId, TaskRecord};
use crate::registry::RegistryError;

/// Errors from a reconciliation run
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Either snapshot could not be taken; nothing was changed
    #[error("Failed to collect {source_name} snapshot: {message}")]
    Collection { source_name: &'static str, message: String },

    /// A corrective action failed part-way through repair
    #[error("Repair failed: {0}")]
    Repair(#[from] BrokerError),
}

impl ReconcileError {
    pub(crate) fn registry(e: RegistryError) -> Self {
        Self::Collection {
            source_name: "registry",
            message: e.to_string(),
        }
    }

    pub(crate) fn queue(e: BrokerError) -> Self {
        Self::Collection {
            source_name: "launch queue",
            message: e.to_string(),
        }
    }
}

/// Both snapshots, folded for classification
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Active per the registry
    pub active: BTreeSet<ProcessId>,
    /// Every delivery tag per target, in queue order
    pub handles: BTreeMap<ProcessId, Vec<DeliveryTag>>,
}

impl Snapshot {
    pub fn new(active: BTreeSet<ProcessId>, tasks: &[TaskRecord]) -> Self {
        let mut handles: BTreeMap<ProcessId, Vec<DeliveryTag>> = BTreeMap::new();
        for task in tasks {
            handles.entry(task.target_id).or_default().push(task.delivery_tag);
        }
        Self { active, handles }
    }

    /// Distinct ids that have at least one task
    pub fn queued(&self) -> BTreeSet<ProcessId> {
        self.handles.keys().copied().collect()
    }
}

/// Anomalies between the registry and the launch queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    /// Ids with more than one task
    pub duplicates: BTreeSet<ProcessId>,
    /// Ids with a task but no active process
    pub orphans: BTreeSet<ProcessId>,
    /// Active ids with no task
    pub zombies: BTreeSet<ProcessId>,
}

impl ReconciliationReport {
    pub fn is_consistent(&self) -> bool {
        self.duplicates.is_empty() && self.orphans.is_empty() && self.zombies.is_empty()
    }
}

/// Classify a snapshot
pub fn classify(snapshot: &Snapshot) -> ReconciliationReport {
    let queued = snapshot.queued();
    ReconciliationReport {
        duplicates: snapshot
            .handles
            .iter()
            .filter(|(_, tags)| tags.len() > 1)
            .map(|(id, _)| *id)
            .collect(),
        orphans: queued.difference(&snapshot.active).copied().collect(),
        zombies: snapshot.active.difference(&queued).copied().collect(),
    }
}

fn write_set(f: &mut fmt::Formatter<'_>, label: &str, ids: &BTreeSet<ProcessId>) -> fmt::Result {
    if ids.is_empty() {
        return Ok(());
    }
    let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
    writeln!(f, "{label}: {}", ids.join(", "))
}

impl fmt::Display for ReconciliationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_consistent() {
            return writeln!(f, "No inconsistencies detected between the process registry and the launch queue");
        }
        write_set(f, "Processes with more than one task", &self.duplicates)?;
        write_set(f, "Tasks without an active process", &self.orphans)?;
        write_set(f, "Active processes without a task", &self.zombies)
    }
}
