//! Supporting types for machine records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle phase of a machine's underlying compute instance
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum MachinePhase {
    /// Instance requested but not yet running
    Pending,
    /// Instance is running
    Running,
    /// Instance is stopping, stopped, terminated or the machine is being deleted
    Terminated,
    /// No usable state reported
    #[default]
    Unknown,
}

impl MachinePhase {
    /// Map a provider instance state (e.g. EC2 `instanceState`) to a phase
    ///
    /// Stopped instances count as terminated: they cannot serve traffic and
    /// must leave the pool.
    pub fn from_instance_state(state: &str) -> Self {
        match state {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "shutting-down" | "terminated" | "stopping" | "stopped" => Self::Terminated,
            _ => Self::Unknown,
        }
    }

    /// Map a machine-api `status.phase` when no instance state is reported
    ///
    /// Never yields [`MachinePhase::Running`]: only the provider can confirm
    /// that an instance is running.
    pub fn from_machine_phase(phase: &str) -> Self {
        match phase {
            "Provisioning" | "Provisioned" => Self::Pending,
            "Deleting" | "Failed" => Self::Terminated,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for MachinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Terminated => write!(f, "Terminated"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Decoded view of a machine, the only shape the reconciler works with
///
/// Provider payloads are decoded into this record once, at the source
/// boundary. The reconciler only ever reads snapshots of these.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineRecord {
    /// Machine name
    pub name: String,
    /// Grouping key (namespace) the machine lives in
    pub namespace: String,
    /// Value of the role label, if present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Lifecycle phase of the instance
    pub phase: MachinePhase,
    /// Provider instance identifier, absent until the instance exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// When the machine object was created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl MachineRecord {
    /// Create a record with no role, no instance and an unknown phase
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Set the role label value
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Set the lifecycle phase
    pub fn with_phase(mut self, phase: MachinePhase) -> Self {
        self.phase = phase;
        self
    }

    /// Set the provider instance identifier
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Set the creation timestamp
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Instance identifier if present and non-empty
    pub fn resolved_instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref().filter(|id| !id.is_empty())
    }
}
