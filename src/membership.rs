//! Desired-state builder and membership diff
//!
//! Pure functions over one pass's snapshots. Sets are `BTreeSet` so calls to
//! the provider carry instance ids in a stable order.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::classify::{Role, RoleClassifier};
use crate::crd::{MachinePhase, MachineRecord};

/// Set of provider instance identifiers
pub type InstanceSet = BTreeSet<String>;

/// An instance identifier claimed by more than one machine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DuplicateInstance {
    /// The shared instance identifier
    pub instance_id: String,
    /// `namespace/name` of every machine claiming it
    pub machines: Vec<String>,
}

/// A control-plane machine that has no instance identifier yet
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnresolvedMachine {
    /// `namespace/name` of the machine
    pub machine: String,
    /// When the machine was created, if known
    pub created_at: Option<DateTime<Utc>>,
}

/// Result of the desired-state builder for one pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DesiredMembership {
    /// Instance ids that should be registered
    pub instances: InstanceSet,
    /// Instance ids shared between machines (kept, but worth a warning)
    pub duplicates: Vec<DuplicateInstance>,
    /// Control-plane machines still waiting for an instance id
    pub unresolved: Vec<UnresolvedMachine>,
}

impl DesiredMembership {
    /// Unresolved machines created before `now - grace`
    pub fn overdue(&self, now: DateTime<Utc>, grace: chrono::Duration) -> Vec<&UnresolvedMachine> {
        self.unresolved
            .iter()
            .filter(|m| m.created_at.is_some_and(|t| now - t > grace))
            .collect()
    }
}

/// Build the desired membership from a machine snapshot
///
/// Keeps every running control-plane machine with a resolved instance id.
/// Order of the snapshot does not matter.
pub fn desired(classifier: &RoleClassifier, snapshot: &[MachineRecord]) -> DesiredMembership {
    let mut claims: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    let mut instances = InstanceSet::new();
    let mut unresolved = Vec::new();

    for record in snapshot {
        let key = format!("{}/{}", record.namespace, record.name);
        let instance_id = record.resolved_instance_id();
        if let Some(id) = instance_id {
            claims.entry(id).or_default().push(key.clone());
        }

        if classifier.classify(record) != Role::ControlPlane {
            continue;
        }

        match instance_id {
            Some(id) if classifier.eligible(record) => {
                instances.insert(id.to_string());
            }
            Some(_) => {}
            None if record.phase != MachinePhase::Terminated => {
                unresolved.push(UnresolvedMachine {
                    machine: key,
                    created_at: record.created_at,
                })
            }
            None => {}
        }
    }

    // Only ids headed for the pool matter, whoever else claims them
    let duplicates = claims
        .into_iter()
        .filter(|(id, machines)| machines.len() > 1 && instances.contains(*id))
        .map(|(id, mut machines)| {
            machines.sort();
            DuplicateInstance {
                instance_id: id.to_string(),
                machines,
            }
        })
        .collect();

    DesiredMembership {
        instances,
        duplicates,
        unresolved,
    }
}

/// Membership changes needed to move observed state to desired state
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MembershipDiff {
    /// Desired but not registered
    pub to_register: InstanceSet,
    /// Registered but not desired
    pub to_deregister: InstanceSet,
}

impl MembershipDiff {
    /// True when the pool already matches
    pub fn is_empty(&self) -> bool {
        self.to_register.is_empty() && self.to_deregister.is_empty()
    }
}

/// Compute the membership diff
///
/// Both inputs must come from the same pass.
pub fn diff(desired: &InstanceSet, observed: &InstanceSet) -> MembershipDiff {
    MembershipDiff {
        to_register: desired.difference(observed).cloned().collect(),
        to_deregister: observed.difference(desired).cloned().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running(name: &str, role: &str) -> MachineRecord {
        MachineRecord::new("default", name)
            .with_role(role)
            .with_phase(MachinePhase::Running)
            .with_instance_id(name)
    }

    fn set(ids: &[&str]) -> InstanceSet {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn cluster_snapshot() -> Vec<MachineRecord> {
        vec![
            running("worker001", "worker"),
            running("infra001", "infra"),
            running("master001", "master"),
            running("master002", "master"),
            running("master003", "master"),
        ]
    }

    #[test]
    fn test_desired_keeps_only_running_masters() {
        let desired = desired(&RoleClassifier::default(), &cluster_snapshot());

        assert_eq!(desired.instances, set(&["master001", "master002", "master003"]));
        assert!(desired.duplicates.is_empty());
        assert!(desired.unresolved.is_empty());
    }

    #[test]
    fn test_desired_is_order_independent() {
        let classifier = RoleClassifier::default();
        let forward = cluster_snapshot();
        let mut reversed = forward.clone();
        reversed.reverse();

        assert_eq!(
            desired(&classifier, &forward).instances,
            desired(&classifier, &reversed).instances
        );
    }

    #[test]
    fn test_terminated_master_leaves_desired_set() {
        let mut snapshot = cluster_snapshot();
        snapshot[3].phase = MachinePhase::Terminated;

        let desired = desired(&RoleClassifier::default(), &snapshot);
        assert_eq!(desired.instances, set(&["master001", "master003"]));
    }

    /// Story: two machines claiming one instance is a data problem, not a
    /// reason to stop serving the control plane
    #[test]
    fn story_duplicate_instance_ids_are_kept_and_reported() {
        let mut snapshot = cluster_snapshot();
        snapshot.push(
            MachineRecord::new("default", "master001-replacement")
                .with_role("master")
                .with_phase(MachinePhase::Running)
                .with_instance_id("master001"),
        );

        let desired = desired(&RoleClassifier::default(), &snapshot);

        assert_eq!(desired.instances, set(&["master001", "master002", "master003"]));
        assert_eq!(
            desired.duplicates,
            vec![DuplicateInstance {
                instance_id: "master001".to_string(),
                machines: vec![
                    "default/master001".to_string(),
                    "default/master001-replacement".to_string(),
                ],
            }]
        );
    }

    /// Story: a worker claiming a control-plane instance is flagged even
    /// though only the master puts it in the pool
    #[test]
    fn story_instance_shared_with_worker_is_reported() {
        let snapshot = vec![
            running("master001", "master").with_instance_id("i-1"),
            running("worker001", "worker").with_instance_id("i-1"),
            // Shared ids that never reach the pool are not our concern
            running("worker002", "worker").with_instance_id("i-2"),
            running("infra001", "infra").with_instance_id("i-2"),
        ];

        let desired = desired(&RoleClassifier::default(), &snapshot);

        assert_eq!(desired.instances, set(&["i-1"]));
        assert_eq!(
            desired.duplicates,
            vec![DuplicateInstance {
                instance_id: "i-1".to_string(),
                machines: vec![
                    "default/master001".to_string(),
                    "default/worker001".to_string(),
                ],
            }]
        );
    }

    #[test]
    fn test_master_without_instance_is_unresolved() {
        let created = Utc::now() - chrono::Duration::minutes(30);
        let snapshot = vec![
            MachineRecord::new("default", "master004")
                .with_role("master")
                .with_phase(MachinePhase::Pending)
                .with_created_at(created),
            // Workers without instances are not tracked
            MachineRecord::new("default", "worker002").with_role("worker"),
            // Neither are masters already on their way out
            MachineRecord::new("default", "master009")
                .with_role("master")
                .with_phase(MachinePhase::Terminated)
                .with_created_at(created),
        ];

        let desired = desired(&RoleClassifier::default(), &snapshot);

        assert!(desired.instances.is_empty());
        assert_eq!(desired.unresolved.len(), 1);
        assert_eq!(desired.unresolved[0].machine, "default/master004");

        let now = Utc::now();
        assert_eq!(desired.overdue(now, chrono::Duration::minutes(10)).len(), 1);
        assert!(desired.overdue(now, chrono::Duration::hours(1)).is_empty());
    }

    #[test]
    fn test_unresolved_without_timestamp_is_never_overdue() {
        let snapshot = vec![MachineRecord::new("default", "master005").with_role("master")];
        let desired = desired(&RoleClassifier::default(), &snapshot);

        assert_eq!(desired.unresolved.len(), 1);
        assert!(desired
            .overdue(Utc::now(), chrono::Duration::zero())
            .is_empty());
    }

    #[test]
    fn test_diff_against_empty_pool() {
        let diff = diff(&set(&["master001", "master002", "master003"]), &set(&[]));

        assert_eq!(diff.to_register, set(&["master001", "master002", "master003"]));
        assert!(diff.to_deregister.is_empty());
        assert!(!diff.is_empty());
    }

    #[test]
    fn test_diff_after_termination() {
        let diff = diff(
            &set(&["master001", "master003"]),
            &set(&["master001", "master002", "master003"]),
        );

        assert!(diff.to_register.is_empty());
        assert_eq!(diff.to_deregister, set(&["master002"]));
    }

    #[test]
    fn test_diff_swap() {
        let diff = diff(&set(&["a", "b"]), &set(&["a", "c"]));
        assert_eq!(diff.to_register, set(&["b"]));
        assert_eq!(diff.to_deregister, set(&["c"]));
    }

    #[test]
    fn test_diff_converged_is_empty() {
        let ids = set(&["master001", "master002"]);
        assert!(diff(&ids, &ids).is_empty());
    }
}
