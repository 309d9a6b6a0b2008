//! Change detection between the committed state and a fresh snapshot
//!
//! A deployment is (re)applied when its identity is new or its version moved;
//! an identity that disappeared from the snapshot is removed. Matching
//! identity and version is a strict no-op, which is what makes a quiet
//! registry produce quiet ticks. A version change always means a full
//! replacement of the running deployment, never an in-place edit.

use std::collections::BTreeSet;

use crate::reconcile::ReconciliationState;
use crate::registry::{DeploymentId, DesiredDeployment};

/// Work one tick has to perform against the deployment backend
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Plan {
    /// Deployments to create or replace
    pub to_apply: Vec<DesiredDeployment>,
    /// Identities to delete
    pub to_remove: Vec<DeploymentId>,
}

impl Plan {
    /// True when the tick has nothing to do
    pub fn is_empty(&self) -> bool {
        self.to_apply.is_empty() && self.to_remove.is_empty()
    }
}

/// Diff the previously committed state against the current snapshot
pub fn diff(previous: &ReconciliationState, current: &[DesiredDeployment]) -> Plan {
    let to_apply = current
        .iter()
        .filter(|d| match previous.get(&d.id) {
            Some(committed) => committed.version != d.version,
            None => true,
        })
        .cloned()
        .collect();

    let current_ids: BTreeSet<&DeploymentId> = current.iter().map(|d| &d.id).collect();
    let to_remove = previous
        .keys()
        .filter(|id| !current_ids.contains(id))
        .cloned()
        .collect();

    Plan { to_apply, to_remove }
}
