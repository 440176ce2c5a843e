//! Role classification and pool eligibility
//!
//! Both checks are pure and total. Anything that cannot be classified falls
//! to [`Role::Other`]: leaving a control-plane machine out for a pass is
//! recoverable, registering a worker with the control-plane pool is not.

use crate::crd::{MachinePhase, MachineRecord};
use crate::DEFAULT_CONTROL_PLANE_ROLE;

/// Role of a machine, derived from its role label
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Control-plane machine, served by the load balancer pool
    ControlPlane,
    /// Any other machine (worker, infra, unlabeled)
    Other,
}

/// Classifies machine records against the configured control-plane role value
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoleClassifier {
    control_plane_role: String,
}

impl Default for RoleClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_CONTROL_PLANE_ROLE)
    }
}

impl RoleClassifier {
    /// Create a classifier matching the given role label value
    pub fn new(control_plane_role: impl Into<String>) -> Self {
        Self {
            control_plane_role: control_plane_role.into(),
        }
    }

    /// The role label value that marks a control-plane machine
    pub fn control_plane_role(&self) -> &str {
        &self.control_plane_role
    }

    /// Classify a record by exact, case-sensitive match on its role label
    pub fn classify(&self, record: &MachineRecord) -> Role {
        match record.role.as_deref() {
            Some(role) if role == self.control_plane_role => Role::ControlPlane,
            _ => Role::Other,
        }
    }

    /// Whether the record's instance may be in the pool at all
    ///
    /// Independent of role: the instance must be running and have a
    /// non-empty identifier.
    pub fn eligible(&self, record: &MachineRecord) -> bool {
        record.phase == MachinePhase::Running && record.resolved_instance_id().is_some()
    }

    /// Whether the record belongs in the pool
    pub fn wants_membership(&self, record: &MachineRecord) -> bool {
        self.classify(record) == Role::ControlPlane && self.eligible(record)
    }
}
