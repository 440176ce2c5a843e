//! Resource types read by the controller
//!
//! `Machine` is owned by the machine-api operator; this module only models the
//! parts of it the controller reads, plus the decoded [`MachineRecord`].

mod machine;
mod types;

pub use machine::{AwsMachineProviderStatus, Machine, MachineSpec, MachineStatus, ProviderSpec};
pub use types::{MachinePhase, MachineRecord};
