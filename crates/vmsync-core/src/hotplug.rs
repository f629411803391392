//! Hot-plug policy: which attribute changes need the VM powered off.

use crate::model::{PowerState, VmField};
use std::collections::BTreeSet;

impl VmField {
    /// Whether a change to this field can be applied while the VM runs.
    pub fn is_hot_pluggable(self) -> bool {
        match self {
            VmField::NumSockets
            | VmField::NumCoresPerSocket
            | VmField::NumThreadsPerCore
            | VmField::NumNumaNodes
            | VmField::MemorySizeBytes
            | VmField::Cluster
            | VmField::IsCpuPassthroughEnabled
            | VmField::IsVcpuHardPinningEnabled
            | VmField::EnabledCpuFeatures
            | VmField::GuestCustomization
            | VmField::GuestTools
            | VmField::SerialPorts
            | VmField::Gpus
            | VmField::BootConfig => false,

            VmField::Name
            | VmField::Description
            | VmField::IsMemoryOvercommitEnabled
            | VmField::IsGpuConsoleEnabled
            | VmField::IsCpuHotplugEnabled
            | VmField::IsScsiControllerEnabled
            | VmField::IsVgaConsoleEnabled
            | VmField::IsBrandingEnabled
            | VmField::IsAgentVm
            | VmField::HardwareClockTimezone
            | VmField::MachineType
            | VmField::Host
            | VmField::PowerState
            | VmField::Disks
            | VmField::Nics
            | VmField::CdRoms
            | VmField::Categories => true,
        }
    }
}

/// Changed fields that can only be applied while the VM is off.
pub fn cold_fields(changed: &BTreeSet<VmField>) -> Vec<VmField> {
    changed
        .iter()
        .copied()
        .filter(|f| !f.is_hot_pluggable())
        .collect()
}

/// True if any changed field requires the VM to be off.
pub fn requires_power_cycle(changed: &BTreeSet<VmField>) -> bool {
    changed.iter().any(|f| !f.is_hot_pluggable())
}

/// Whether the orchestrator has to power the VM off before applying
/// `changed`, given its freshly read power state.
pub fn needs_power_off(changed: &BTreeSet<VmField>, current: PowerState) -> bool {
    requires_power_cycle(changed) && current != PowerState::Off
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(fields: &[VmField]) -> BTreeSet<VmField> {
        fields.iter().copied().collect()
    }

    #[test]
    fn test_description_is_hot() {
        assert!(!requires_power_cycle(&set(&[VmField::Description])));
        assert!(!requires_power_cycle(&set(&[VmField::Name, VmField::Categories])));
    }

    #[test]
    fn test_memory_is_cold() {
        assert!(requires_power_cycle(&set(&[VmField::MemorySizeBytes])));
        assert!(requires_power_cycle(&set(&[
            VmField::Description,
            VmField::NumSockets
        ])));
    }

    #[test]
    fn test_cold_fields_lists_offenders() {
        let changed = set(&[VmField::Name, VmField::Gpus, VmField::BootConfig]);
        assert_eq!(
            cold_fields(&changed),
            vec![VmField::BootConfig, VmField::Gpus]
        );
    }

    #[test]
    fn test_needs_power_off_skips_when_already_off() {
        let changed = set(&[VmField::NumSockets]);
        assert!(needs_power_off(&changed, PowerState::On));
        assert!(needs_power_off(&changed, PowerState::Paused));
        assert!(!needs_power_off(&changed, PowerState::Off));
        assert!(!needs_power_off(&set(&[VmField::Description]), PowerState::On));
    }

    #[test]
    fn test_empty_change_set() {
        assert!(!requires_power_cycle(&BTreeSet::new()));
    }
}
