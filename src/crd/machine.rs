//! machine-api `Machine` resource and its decode into [`MachineRecord`]
//!
//! The controller never owns these objects; it only lists and watches them.
//! Only the fields needed for membership decisions are modelled, everything
//! else in the object is ignored on deserialization.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::types::{MachinePhase, MachineRecord};

/// Machine as published by the machine-api operator
///
/// Example:
/// ```yaml
/// apiVersion: machine.openshift.io/v1beta1
/// kind: Machine
/// metadata:
///   name: master001
///   namespace: openshift-machine-api
///   labels:
///     machine.openshift.io/cluster-api-machine-type: master
/// spec:
///   providerSpec:
///     value: {}
/// status:
///   phase: Running
///   providerStatus:
///     instanceId: i-0a1b2c3d
///     instanceState: running
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "machine.openshift.io",
    version = "v1beta1",
    kind = "Machine",
    namespaced,
    status = "MachineStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Provider ID assigned once the instance exists (e.g. `aws:///us-east-1a/i-0a1b`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// Provider-specific machine configuration, opaque to this controller
    #[serde(default)]
    pub provider_spec: ProviderSpec,
}

/// Opaque provider configuration wrapper
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ProviderSpec {
    /// Raw provider configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

/// Observed state of a Machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// machine-api lifecycle phase (Provisioning, Provisioned, Running, Deleting, Failed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Provider-encoded status payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_status: Option<serde_json::Value>,
}

/// Typed view of the AWS provider status payload
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AwsMachineProviderStatus {
    /// EC2 instance ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    /// EC2 instance state (pending, running, stopping, stopped, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_state: Option<String>,
}

impl MachineStatus {
    /// Decode the provider status payload
    ///
    /// Returns `Ok(None)` when no payload has been reported yet.
    pub fn aws_provider_status(&self) -> Result<Option<AwsMachineProviderStatus>, serde_json::Error> {
        self.provider_status
            .as_ref()
            .map(|raw| serde_json::from_value(raw.clone()))
            .transpose()
    }
}

impl Machine {
    /// Decode this machine into a [`MachineRecord`]
    ///
    /// Decoding never fails: a payload that cannot be read produces a record
    /// with no instance and an unknown phase, which keeps it out of the pool.
    pub fn to_record(&self, role_label: &str) -> MachineRecord {
        let name = self.name_any();
        let namespace = self.namespace().unwrap_or_default();

        let provider_status = match self.status.as_ref().map(|s| s.aws_provider_status()) {
            Some(Ok(status)) => status,
            Some(Err(e)) => {
                warn!(
                    machine = %name,
                    namespace = %namespace,
                    error = %e,
                    "failed to decode provider status, excluding machine"
                );
                None
            }
            None => None,
        };

        let machine_phase = self.status.as_ref().and_then(|s| s.phase.as_deref());
        let phase = if self.metadata.deletion_timestamp.is_some() {
            MachinePhase::Terminated
        } else if let Some(state) = provider_status
            .as_ref()
            .and_then(|s| s.instance_state.as_deref())
        {
            MachinePhase::from_instance_state(state)
        } else {
            machine_phase
                .map(MachinePhase::from_machine_phase)
                .unwrap_or_default()
        };

        MachineRecord {
            role: self.labels().get(role_label).cloned(),
            phase,
            instance_id: provider_status.and_then(|s| s.instance_id),
            created_at: self.metadata.creation_timestamp.as_ref().map(|t| t.0),
            name,
            namespace,
        }
    }
}
