//! Entity model for VMs and their sub-resources.
//!
//! Declared and live configuration share one shape, [`VmConfig`]. The live
//! side is wrapped in [`VmLiveState`], which adds the server identifier and
//! the concurrency token needed for the next mutation.

use crate::diff::{diff, Keyed};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;

// ============================================================================
// Identifiers
// ============================================================================

/// Server-assigned identifier of a VM.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmId(String);

impl VmId {
    /// Get the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for VmId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VmId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<VmId> for String {
    fn from(id: VmId) -> String {
        id.0
    }
}

/// Opaque version tag returned by a read and required by the next mutation.
///
/// Every successful mutation invalidates it. Never reuse one across steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConcurrencyToken(String);

impl ConcurrencyToken {
    /// Wrap a raw ETag value.
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Get the raw tag, e.g. for an `If-Match` header.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConcurrencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Scalar enums
// ============================================================================

/// Power state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PowerState {
    /// Running
    #[default]
    On,
    /// Powered off
    Off,
    /// Paused by the hypervisor
    Paused,
    /// Hypervisor could not determine the state
    Undetermined,
    /// State not reported
    Unknown,
}

impl PowerState {
    /// Whether this state can be requested with a power-on/power-off call.
    pub fn is_actionable(self) -> bool {
        matches!(self, PowerState::On | PowerState::Off)
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerState::On => write!(f, "ON"),
            PowerState::Off => write!(f, "OFF"),
            PowerState::Paused => write!(f, "PAUSED"),
            PowerState::Undetermined => write!(f, "UNDETERMINED"),
            PowerState::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Emulated chipset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineType {
    Pc,
    Pseries,
    Q35,
}

/// CPU feature that can be exposed to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CpuFeature {
    HardwareVirtualization,
}

// ============================================================================
// Boot, guest customization, guest tools
// ============================================================================

/// Device class in a legacy BIOS boot order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BootDeviceType {
    Cdrom,
    Disk,
    Network,
}

/// Specific device to boot from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BootDevice {
    /// Boot from the disk at this address
    Disk { disk_address: DiskAddress },
    /// PXE boot from the NIC with this MAC
    Nic { mac_address: String },
}

/// Firmware boot configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BootConfig {
    Legacy {
        #[serde(default)]
        boot_order: Vec<BootDeviceType>,
        #[serde(default)]
        boot_device: Option<BootDevice>,
    },
    Uefi {
        #[serde(default)]
        is_secure_boot_enabled: bool,
        #[serde(default)]
        nvram_storage_container: Option<String>,
    },
}

/// First-boot customization handed to the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuestCustomization {
    Sysprep {
        unattend_xml: String,
    },
    CloudInit {
        user_data: String,
        #[serde(default)]
        metadata: Option<String>,
    },
}

/// Guest tools capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuestToolsCapability {
    SelfService,
    VssSnapshot,
}

/// Guest tools configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GuestTools {
    pub is_enabled: bool,
    #[serde(default)]
    pub capabilities: Vec<GuestToolsCapability>,
}

// ============================================================================
// Disks
// ============================================================================

/// Bus a disk is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiskBusType {
    Scsi,
    Ide,
    Pci,
    Sata,
    Spapr,
}

/// Bus address of a disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskAddress {
    pub bus_type: DiskBusType,
    #[serde(default)]
    pub index: Option<i32>,
}

/// Where a disk's initial contents come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataSource {
    /// Clone from an image
    Image { image_ext_id: String },
    /// Clone from another VM disk
    VmDisk { disk_ext_id: String },
}

/// A disk backed by the VM's own storage.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VmDisk {
    #[serde(default)]
    pub disk_size_bytes: Option<i64>,
    #[serde(default)]
    pub storage_container: Option<String>,
    /// Origin of the disk contents. Only accepted on create.
    #[serde(default)]
    pub data_source: Option<DataSource>,
}

/// Backing of a disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiskBacking {
    VmDisk(VmDisk),
    VolumeGroup { volume_group_ext_id: String },
}

/// A VM disk.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Disk {
    #[serde(default)]
    pub ext_id: Option<String>,
    #[serde(default)]
    pub disk_address: Option<DiskAddress>,
    #[serde(default)]
    pub backing_info: Option<DiskBacking>,
}

impl Disk {
    /// A new (unkeyed) disk of the given size.
    pub fn with_size(disk_size_bytes: i64) -> Self {
        Self {
            ext_id: None,
            disk_address: None,
            backing_info: Some(DiskBacking::VmDisk(VmDisk {
                disk_size_bytes: Some(disk_size_bytes),
                ..Default::default()
            })),
        }
    }

    /// Set the server identifier.
    pub fn with_ext_id(mut self, ext_id: impl Into<String>) -> Self {
        self.ext_id = Some(ext_id.into());
        self
    }

    /// Set the bus address.
    pub fn at(mut self, bus_type: DiskBusType, index: i32) -> Self {
        self.disk_address = Some(DiskAddress {
            bus_type,
            index: Some(index),
        });
        self
    }
}

// ============================================================================
// NICs
// ============================================================================

/// Emulated NIC model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NicModel {
    Virtio,
    E1000,
}

/// Role of a NIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NicType {
    NormalNic,
    DirectNic,
    NetworkFunctionNic,
    SpanDestinationNic,
}

/// VLAN mode of a NIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VlanMode {
    Access,
    Trunk,
}

/// Static IPv4 assignment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ipv4Config {
    #[serde(default)]
    pub should_assign_ip: bool,
    #[serde(default)]
    pub ip_address: Option<String>,
}

fn default_connected() -> bool {
    true
}

/// Virtual hardware side of a NIC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicBacking {
    #[serde(default)]
    pub model: Option<NicModel>,
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default = "default_connected")]
    pub is_connected: bool,
    #[serde(default)]
    pub num_queues: Option<i32>,
}

impl Default for NicBacking {
    fn default() -> Self {
        Self {
            model: None,
            mac_address: None,
            is_connected: true,
            num_queues: None,
        }
    }
}

/// Network side of a NIC.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NicNetworkInfo {
    #[serde(default)]
    pub nic_type: Option<NicType>,
    #[serde(default)]
    pub subnet: Option<String>,
    #[serde(default)]
    pub vlan_mode: Option<VlanMode>,
    #[serde(default)]
    pub ipv4_config: Option<Ipv4Config>,
    /// Addresses learned by the platform (DHCP). Read-only.
    #[serde(default)]
    pub learned_ip_addresses: Vec<String>,
}

/// A VM network interface.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Nic {
    #[serde(default)]
    pub ext_id: Option<String>,
    #[serde(default)]
    pub backing_info: NicBacking,
    #[serde(default)]
    pub network_info: NicNetworkInfo,
}

impl Nic {
    /// A new (unkeyed) NIC attached to a subnet.
    pub fn on_subnet(subnet: impl Into<String>) -> Self {
        Self {
            network_info: NicNetworkInfo {
                nic_type: Some(NicType::NormalNic),
                subnet: Some(subnet.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Set the server identifier.
    pub fn with_ext_id(mut self, ext_id: impl Into<String>) -> Self {
        self.ext_id = Some(ext_id.into());
        self
    }

    /// First IPv4 address of this NIC, learned addresses first.
    pub fn first_ip_address(&self) -> Option<&str> {
        self.network_info
            .learned_ip_addresses
            .first()
            .map(String::as_str)
            .or_else(|| {
                self.network_info
                    .ipv4_config
                    .as_ref()
                    .and_then(|c| c.ip_address.as_deref())
            })
    }
}

// ============================================================================
// CD-ROMs, serial ports, GPUs, categories
// ============================================================================

/// Bus a CD-ROM is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CdRomBusType {
    Ide,
    Sata,
}

/// Bus address of a CD-ROM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdRomAddress {
    pub bus_type: CdRomBusType,
    #[serde(default)]
    pub index: Option<i32>,
}

/// Kind of ISO inserted in a CD-ROM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsoType {
    Other,
    GuestTools,
    GuestCustomization,
}

/// A virtual CD-ROM drive.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CdRom {
    #[serde(default)]
    pub ext_id: Option<String>,
    #[serde(default)]
    pub disk_address: Option<CdRomAddress>,
    #[serde(default)]
    pub backing_info: Option<VmDisk>,
    #[serde(default)]
    pub iso_type: Option<IsoType>,
}

/// A serial port.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SerialPort {
    #[serde(default)]
    pub ext_id: Option<String>,
    pub index: i32,
    #[serde(default)]
    pub is_connected: bool,
}

/// How a GPU is presented to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GpuMode {
    Passthrough,
    PassthroughGraphics,
    PassthroughCompute,
    Virtual,
}

/// GPU vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GpuVendor {
    Nvidia,
    Intel,
    Amd,
}

/// A GPU attached to the VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gpu {
    #[serde(default)]
    pub ext_id: Option<String>,
    pub mode: GpuMode,
    #[serde(default)]
    pub vendor: Option<GpuVendor>,
    #[serde(default)]
    pub device_id: Option<i32>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Attachment of a category to the VM.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CategoryRef {
    pub ext_id: String,
}

impl CategoryRef {
    pub fn new(ext_id: impl Into<String>) -> Self {
        Self {
            ext_id: ext_id.into(),
        }
    }
}

// ============================================================================
// Sub-resource dispatch
// ============================================================================

/// Kind of VM-owned child object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubResourceKind {
    Disk,
    Nic,
    CdRom,
    SerialPort,
    Gpu,
}

impl fmt::Display for SubResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubResourceKind::Disk => write!(f, "disk"),
            SubResourceKind::Nic => write!(f, "nic"),
            SubResourceKind::CdRom => write!(f, "cd_rom"),
            SubResourceKind::SerialPort => write!(f, "serial_port"),
            SubResourceKind::Gpu => write!(f, "gpu"),
        }
    }
}

/// Payload of a sub-resource create or update call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "spec", rename_all = "snake_case")]
pub enum SubResource {
    Disk(Disk),
    Nic(Nic),
    CdRom(CdRom),
    SerialPort(SerialPort),
    Gpu(Gpu),
}

impl SubResource {
    /// Which collection this item belongs to.
    pub fn kind(&self) -> SubResourceKind {
        match self {
            SubResource::Disk(_) => SubResourceKind::Disk,
            SubResource::Nic(_) => SubResourceKind::Nic,
            SubResource::CdRom(_) => SubResourceKind::CdRom,
            SubResource::SerialPort(_) => SubResourceKind::SerialPort,
            SubResource::Gpu(_) => SubResourceKind::Gpu,
        }
    }

    /// Server identifier of the item, if assigned.
    pub fn ext_id(&self) -> Option<&str> {
        match self {
            SubResource::Disk(d) => d.key(),
            SubResource::Nic(n) => n.key(),
            SubResource::CdRom(c) => c.key(),
            SubResource::SerialPort(s) => s.key(),
            SubResource::Gpu(g) => g.key(),
        }
    }
}

/// A sub-resource collection entry that the orchestrator can drive.
pub trait SubResourceEntity: Keyed + fmt::Debug + Send + Sync {
    /// Collection this type lives in.
    const KIND: SubResourceKind;

    /// Borrow this type's collection out of a VM configuration.
    fn collection(config: &VmConfig) -> &[Self];

    /// Wrap into the client payload enum.
    fn into_sub_resource(self) -> SubResource;

    /// Check that the item carries what a create call needs.
    fn check_create(&self) -> Result<(), String> {
        Ok(())
    }

    /// Payload for an update call. Drops fields the control plane only
    /// accepts on create.
    fn update_payload(&self) -> Self {
        self.clone()
    }

    /// Payload for a create call. Identity is always server-assigned.
    fn create_payload(&self) -> Self;
}

fn blank_to_none(value: &mut Option<String>) {
    if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
        *value = None;
    }
}

fn blank_as_none(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

/// The declared value if one is set, otherwise the current one.
fn or_current<T: Clone>(declared: &Option<T>, current: &Option<T>) -> Option<T> {
    declared.clone().or_else(|| current.clone())
}

/// Same as [`or_current`], with a blank string counting as unset.
fn or_current_str(declared: &Option<String>, current: &Option<String>) -> Option<String> {
    match blank_as_none(declared) {
        Some(value) => Some(value.to_string()),
        None => current.clone(),
    }
}

impl VmDisk {
    fn merged_onto(&self, current: &VmDisk) -> VmDisk {
        VmDisk {
            disk_size_bytes: self.disk_size_bytes.or(current.disk_size_bytes),
            storage_container: or_current_str(&self.storage_container, &current.storage_container),
            data_source: or_current(&self.data_source, &current.data_source),
        }
    }
}

impl Keyed for Disk {
    fn key(&self) -> Option<&str> {
        self.ext_id.as_deref()
    }

    fn normalized(&self) -> Self {
        let mut disk = self.clone();
        blank_to_none(&mut disk.ext_id);
        if let Some(DiskBacking::VmDisk(vm_disk)) = &mut disk.backing_info {
            blank_to_none(&mut vm_disk.storage_container);
        }
        disk
    }

    fn merged_onto(&self, current: &Self) -> Self {
        let backing_info = match (&self.backing_info, &current.backing_info) {
            (Some(DiskBacking::VmDisk(declared)), Some(DiskBacking::VmDisk(live))) => {
                Some(DiskBacking::VmDisk(declared.merged_onto(live)))
            }
            (declared, live) => or_current(declared, live),
        };
        Disk {
            ext_id: self.ext_id.clone(),
            disk_address: or_current(&self.disk_address, &current.disk_address),
            backing_info,
        }
    }
}

impl SubResourceEntity for Disk {
    const KIND: SubResourceKind = SubResourceKind::Disk;

    fn collection(config: &VmConfig) -> &[Self] {
        &config.disks
    }

    fn into_sub_resource(self) -> SubResource {
        SubResource::Disk(self)
    }

    fn check_create(&self) -> Result<(), String> {
        match &self.backing_info {
            None => Err("backing_info is required".into()),
            Some(DiskBacking::VmDisk(vm_disk)) => {
                match (vm_disk.disk_size_bytes, &vm_disk.data_source) {
                    (Some(size), _) if size <= 0 => {
                        Err(format!("disk_size_bytes must be > 0, got {size}"))
                    }
                    (None, None) => Err("either disk_size_bytes or data_source is required".into()),
                    _ => Ok(()),
                }
            }
            Some(DiskBacking::VolumeGroup {
                volume_group_ext_id,
            }) if volume_group_ext_id.trim().is_empty() => {
                Err("volume_group_ext_id must not be empty".into())
            }
            Some(DiskBacking::VolumeGroup { .. }) => Ok(()),
        }
    }

    fn update_payload(&self) -> Self {
        let mut disk = self.clone();
        if let Some(DiskBacking::VmDisk(vm_disk)) = &mut disk.backing_info {
            vm_disk.data_source = None;
        }
        disk
    }

    fn create_payload(&self) -> Self {
        Self {
            ext_id: None,
            ..self.clone()
        }
    }
}

impl Keyed for Nic {
    fn key(&self) -> Option<&str> {
        self.ext_id.as_deref()
    }

    fn normalized(&self) -> Self {
        let mut nic = self.clone();
        blank_to_none(&mut nic.ext_id);
        blank_to_none(&mut nic.backing_info.mac_address);
        blank_to_none(&mut nic.network_info.subnet);
        nic.network_info.learned_ip_addresses.clear();
        if let Some(ipv4) = &mut nic.network_info.ipv4_config {
            blank_to_none(&mut ipv4.ip_address);
        }
        nic
    }

    fn merged_onto(&self, current: &Self) -> Self {
        let (declared, live) = (&self.backing_info, &current.backing_info);
        let backing_info = NicBacking {
            model: declared.model.or(live.model),
            mac_address: or_current_str(&declared.mac_address, &live.mac_address),
            is_connected: declared.is_connected,
            num_queues: declared.num_queues.or(live.num_queues),
        };

        let (declared, live) = (&self.network_info, &current.network_info);
        let network_info = NicNetworkInfo {
            nic_type: declared.nic_type.or(live.nic_type),
            subnet: or_current_str(&declared.subnet, &live.subnet),
            vlan_mode: declared.vlan_mode.or(live.vlan_mode),
            ipv4_config: or_current(&declared.ipv4_config, &live.ipv4_config),
            learned_ip_addresses: live.learned_ip_addresses.clone(),
        };

        Nic {
            ext_id: self.ext_id.clone(),
            backing_info,
            network_info,
        }
    }
}

impl SubResourceEntity for Nic {
    const KIND: SubResourceKind = SubResourceKind::Nic;

    fn collection(config: &VmConfig) -> &[Self] {
        &config.nics
    }

    fn into_sub_resource(self) -> SubResource {
        SubResource::Nic(self)
    }

    fn check_create(&self) -> Result<(), String> {
        if let Some(queues) = self.backing_info.num_queues {
            if queues <= 0 {
                return Err(format!("num_queues must be > 0, got {queues}"));
            }
        }
        if let Some(ip) = self
            .network_info
            .ipv4_config
            .as_ref()
            .and_then(|c| c.ip_address.as_deref())
        {
            ip.parse::<Ipv4Addr>()
                .map_err(|_| format!("invalid IPv4 address {ip:?}"))?;
        }
        Ok(())
    }

    fn update_payload(&self) -> Self {
        let mut nic = self.clone();
        nic.network_info.learned_ip_addresses.clear();
        nic
    }

    fn create_payload(&self) -> Self {
        let mut nic = self.update_payload();
        nic.ext_id = None;
        nic
    }
}

impl Keyed for CdRom {
    fn key(&self) -> Option<&str> {
        self.ext_id.as_deref()
    }

    fn normalized(&self) -> Self {
        let mut cd_rom = self.clone();
        blank_to_none(&mut cd_rom.ext_id);
        if let Some(backing) = &mut cd_rom.backing_info {
            blank_to_none(&mut backing.storage_container);
        }
        cd_rom
    }

    fn merged_onto(&self, current: &Self) -> Self {
        let backing_info = match (&self.backing_info, &current.backing_info) {
            (Some(declared), Some(live)) => Some(declared.merged_onto(live)),
            (declared, live) => or_current(declared, live),
        };
        CdRom {
            ext_id: self.ext_id.clone(),
            disk_address: or_current(&self.disk_address, &current.disk_address),
            backing_info,
            iso_type: self.iso_type.or(current.iso_type),
        }
    }
}

impl SubResourceEntity for CdRom {
    const KIND: SubResourceKind = SubResourceKind::CdRom;

    fn collection(config: &VmConfig) -> &[Self] {
        &config.cd_roms
    }

    fn into_sub_resource(self) -> SubResource {
        SubResource::CdRom(self)
    }

    fn update_payload(&self) -> Self {
        let mut cd_rom = self.clone();
        if let Some(backing) = &mut cd_rom.backing_info {
            backing.data_source = None;
        }
        cd_rom
    }

    fn create_payload(&self) -> Self {
        Self {
            ext_id: None,
            ..self.clone()
        }
    }
}

impl Keyed for SerialPort {
    fn key(&self) -> Option<&str> {
        self.ext_id.as_deref()
    }

    fn normalized(&self) -> Self {
        let mut port = self.clone();
        blank_to_none(&mut port.ext_id);
        port
    }
}

impl SubResourceEntity for SerialPort {
    const KIND: SubResourceKind = SubResourceKind::SerialPort;

    fn collection(config: &VmConfig) -> &[Self] {
        &config.serial_ports
    }

    fn into_sub_resource(self) -> SubResource {
        SubResource::SerialPort(self)
    }

    fn check_create(&self) -> Result<(), String> {
        if !(0..=3).contains(&self.index) {
            return Err(format!("index must be within 0..=3, got {}", self.index));
        }
        Ok(())
    }

    fn create_payload(&self) -> Self {
        Self {
            ext_id: None,
            ..self.clone()
        }
    }
}

impl Keyed for Gpu {
    fn key(&self) -> Option<&str> {
        self.ext_id.as_deref()
    }

    fn normalized(&self) -> Self {
        let mut gpu = self.clone();
        blank_to_none(&mut gpu.ext_id);
        blank_to_none(&mut gpu.name);
        gpu
    }

    fn merged_onto(&self, current: &Self) -> Self {
        Gpu {
            ext_id: self.ext_id.clone(),
            mode: self.mode,
            vendor: self.vendor.or(current.vendor),
            device_id: self.device_id.or(current.device_id),
            name: or_current_str(&self.name, &current.name),
        }
    }
}

impl SubResourceEntity for Gpu {
    const KIND: SubResourceKind = SubResourceKind::Gpu;

    fn collection(config: &VmConfig) -> &[Self] {
        &config.gpus
    }

    fn into_sub_resource(self) -> SubResource {
        SubResource::Gpu(self)
    }

    fn check_create(&self) -> Result<(), String> {
        if self.device_id.is_none() {
            return Err("device_id is required".into());
        }
        Ok(())
    }

    fn create_payload(&self) -> Self {
        Self {
            ext_id: None,
            ..self.clone()
        }
    }
}

impl Keyed for CategoryRef {
    fn key(&self) -> Option<&str> {
        Some(&self.ext_id)
    }
}

// ============================================================================
// VM configuration
// ============================================================================

/// Comparable attribute of a VM configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmField {
    Name,
    Description,
    NumSockets,
    NumCoresPerSocket,
    NumThreadsPerCore,
    NumNumaNodes,
    MemorySizeBytes,
    IsVcpuHardPinningEnabled,
    IsCpuPassthroughEnabled,
    EnabledCpuFeatures,
    IsMemoryOvercommitEnabled,
    IsGpuConsoleEnabled,
    IsCpuHotplugEnabled,
    IsScsiControllerEnabled,
    IsVgaConsoleEnabled,
    IsBrandingEnabled,
    IsAgentVm,
    HardwareClockTimezone,
    MachineType,
    Cluster,
    Host,
    BootConfig,
    GuestCustomization,
    GuestTools,
    PowerState,
    Disks,
    Nics,
    CdRoms,
    SerialPorts,
    Gpus,
    Categories,
}

impl VmField {
    /// Whether the field is applied through the whole-object update call.
    pub fn is_scalar(self) -> bool {
        !matches!(
            self,
            VmField::PowerState
                | VmField::Disks
                | VmField::Nics
                | VmField::CdRoms
                | VmField::SerialPorts
                | VmField::Gpus
                | VmField::Categories
        )
    }
}

impl VmField {
    /// Attribute name as it appears in the declared configuration.
    pub fn as_str(self) -> &'static str {
        match self {
            VmField::Name => "name",
            VmField::Description => "description",
            VmField::NumSockets => "num_sockets",
            VmField::NumCoresPerSocket => "num_cores_per_socket",
            VmField::NumThreadsPerCore => "num_threads_per_core",
            VmField::NumNumaNodes => "num_numa_nodes",
            VmField::MemorySizeBytes => "memory_size_bytes",
            VmField::IsVcpuHardPinningEnabled => "is_vcpu_hard_pinning_enabled",
            VmField::IsCpuPassthroughEnabled => "is_cpu_passthrough_enabled",
            VmField::EnabledCpuFeatures => "enabled_cpu_features",
            VmField::IsMemoryOvercommitEnabled => "is_memory_overcommit_enabled",
            VmField::IsGpuConsoleEnabled => "is_gpu_console_enabled",
            VmField::IsCpuHotplugEnabled => "is_cpu_hotplug_enabled",
            VmField::IsScsiControllerEnabled => "is_scsi_controller_enabled",
            VmField::IsVgaConsoleEnabled => "is_vga_console_enabled",
            VmField::IsBrandingEnabled => "is_branding_enabled",
            VmField::IsAgentVm => "is_agent_vm",
            VmField::HardwareClockTimezone => "hardware_clock_timezone",
            VmField::MachineType => "machine_type",
            VmField::Cluster => "cluster",
            VmField::Host => "host",
            VmField::BootConfig => "boot_config",
            VmField::GuestCustomization => "guest_customization",
            VmField::GuestTools => "guest_tools",
            VmField::PowerState => "power_state",
            VmField::Disks => "disks",
            VmField::Nics => "nics",
            VmField::CdRoms => "cd_roms",
            VmField::SerialPorts => "serial_ports",
            VmField::Gpus => "gpus",
            VmField::Categories => "categories",
        }
    }
}

impl fmt::Display for VmField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Full configuration of a VM: scalar fields, sub-resource collections,
/// category attachments and power state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    pub name: String,
    pub description: Option<String>,
    pub num_sockets: Option<i32>,
    pub num_cores_per_socket: Option<i32>,
    pub num_threads_per_core: Option<i32>,
    pub num_numa_nodes: Option<i32>,
    pub memory_size_bytes: Option<i64>,
    pub is_vcpu_hard_pinning_enabled: Option<bool>,
    pub is_cpu_passthrough_enabled: Option<bool>,
    pub enabled_cpu_features: Vec<CpuFeature>,
    pub is_memory_overcommit_enabled: Option<bool>,
    pub is_gpu_console_enabled: Option<bool>,
    pub is_cpu_hotplug_enabled: Option<bool>,
    pub is_scsi_controller_enabled: Option<bool>,
    pub is_vga_console_enabled: Option<bool>,
    pub is_branding_enabled: Option<bool>,
    pub is_agent_vm: Option<bool>,
    pub hardware_clock_timezone: Option<String>,
    pub machine_type: Option<MachineType>,
    pub cluster: Option<String>,
    pub host: Option<String>,
    pub boot_config: Option<BootConfig>,
    pub guest_customization: Option<GuestCustomization>,
    pub guest_tools: Option<GuestTools>,
    pub power_state: PowerState,
    pub disks: Vec<Disk>,
    pub nics: Vec<Nic>,
    pub cd_roms: Vec<CdRom>,
    pub serial_ports: Vec<SerialPort>,
    pub gpus: Vec<Gpu>,
    pub categories: Vec<CategoryRef>,
}

/// Declared configuration, as produced by the configuration source.
pub type VmDesiredState = VmConfig;

/// True if `declared` is set and differs from `current`.
fn differs<T: PartialEq>(declared: &Option<T>, current: &Option<T>) -> bool {
    declared.as_ref().is_some_and(|d| current.as_ref() != Some(d))
}

fn differs_str(declared: &Option<String>, current: &Option<String>) -> bool {
    blank_as_none(declared).is_some_and(|d| blank_as_none(current) != Some(d))
}

macro_rules! collect_changed {
    ($changed:ident, $cmp:ident, $new:expr, $old:expr,
     { $($field:ident => $variant:ident),* $(,)? }) => {
        $(
            if $cmp(&$new.$field, &$old.$field) {
                $changed.insert(VmField::$variant);
            }
        )*
    };
}

impl VmConfig {
    /// Create a configuration with the given name and defaults elsewhere.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set socket count.
    pub fn with_sockets(mut self, num_sockets: i32) -> Self {
        self.num_sockets = Some(num_sockets);
        self
    }

    /// Set memory size in bytes.
    pub fn with_memory_bytes(mut self, memory_size_bytes: i64) -> Self {
        self.memory_size_bytes = Some(memory_size_bytes);
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the power state.
    pub fn with_power_state(mut self, power_state: PowerState) -> Self {
        self.power_state = power_state;
        self
    }

    /// Append a disk.
    pub fn with_disk(mut self, disk: Disk) -> Self {
        self.disks.push(disk);
        self
    }

    /// Append a NIC.
    pub fn with_nic(mut self, nic: Nic) -> Self {
        self.nics.push(nic);
        self
    }

    /// Attach a category.
    pub fn with_category(mut self, ext_id: impl Into<String>) -> Self {
        self.categories.push(CategoryRef::new(ext_id));
        self
    }

    /// Attributes of `self` that differ from `current`.
    ///
    /// An optional attribute left unset (or blank) in `self` is up to the
    /// control plane and never counts as changed; neither does an empty
    /// CPU feature list. Collections count as changed when their diff is
    /// non-empty, so a reordered but otherwise identical collection is
    /// unchanged.
    pub fn changed_fields(&self, current: &VmConfig) -> BTreeSet<VmField> {
        let mut changed = BTreeSet::new();

        if self.name != current.name {
            changed.insert(VmField::Name);
        }
        if !self.enabled_cpu_features.is_empty()
            && self.enabled_cpu_features != current.enabled_cpu_features
        {
            changed.insert(VmField::EnabledCpuFeatures);
        }
        if self.power_state != current.power_state {
            changed.insert(VmField::PowerState);
        }

        collect_changed!(changed, differs_str, self, current, {
            description => Description,
            hardware_clock_timezone => HardwareClockTimezone,
            cluster => Cluster,
            host => Host,
        });

        collect_changed!(changed, differs, self, current, {
            num_sockets => NumSockets,
            num_cores_per_socket => NumCoresPerSocket,
            num_threads_per_core => NumThreadsPerCore,
            num_numa_nodes => NumNumaNodes,
            memory_size_bytes => MemorySizeBytes,
            is_vcpu_hard_pinning_enabled => IsVcpuHardPinningEnabled,
            is_cpu_passthrough_enabled => IsCpuPassthroughEnabled,
            is_memory_overcommit_enabled => IsMemoryOvercommitEnabled,
            is_gpu_console_enabled => IsGpuConsoleEnabled,
            is_cpu_hotplug_enabled => IsCpuHotplugEnabled,
            is_scsi_controller_enabled => IsScsiControllerEnabled,
            is_vga_console_enabled => IsVgaConsoleEnabled,
            is_branding_enabled => IsBrandingEnabled,
            is_agent_vm => IsAgentVm,
            machine_type => MachineType,
            boot_config => BootConfig,
            guest_customization => GuestCustomization,
            guest_tools => GuestTools,
        });

        if !diff(&current.disks, &self.disks).is_empty() {
            changed.insert(VmField::Disks);
        }
        if !diff(&current.nics, &self.nics).is_empty() {
            changed.insert(VmField::Nics);
        }
        if !diff(&current.cd_roms, &self.cd_roms).is_empty() {
            changed.insert(VmField::CdRoms);
        }
        if !diff(&current.serial_ports, &self.serial_ports).is_empty() {
            changed.insert(VmField::SerialPorts);
        }
        if !diff(&current.gpus, &self.gpus).is_empty() {
            changed.insert(VmField::Gpus);
        }
        if !diff(&current.categories, &self.categories).is_empty() {
            changed.insert(VmField::Categories);
        }

        changed
    }

    /// Copy of `self` with every scalar field that `desired` sets taken
    /// from `desired`. Scalars `desired` leaves unset keep their value.
    ///
    /// Collections, categories and power state are left as they are; those
    /// have their own calls.
    pub fn with_scalars_from(&self, desired: &VmConfig) -> VmConfig {
        let enabled_cpu_features = if desired.enabled_cpu_features.is_empty() {
            self.enabled_cpu_features.clone()
        } else {
            desired.enabled_cpu_features.clone()
        };

        VmConfig {
            name: desired.name.clone(),
            description: or_current_str(&desired.description, &self.description),
            num_sockets: desired.num_sockets.or(self.num_sockets),
            num_cores_per_socket: desired.num_cores_per_socket.or(self.num_cores_per_socket),
            num_threads_per_core: desired.num_threads_per_core.or(self.num_threads_per_core),
            num_numa_nodes: desired.num_numa_nodes.or(self.num_numa_nodes),
            memory_size_bytes: desired.memory_size_bytes.or(self.memory_size_bytes),
            is_vcpu_hard_pinning_enabled: desired
                .is_vcpu_hard_pinning_enabled
                .or(self.is_vcpu_hard_pinning_enabled),
            is_cpu_passthrough_enabled: desired
                .is_cpu_passthrough_enabled
                .or(self.is_cpu_passthrough_enabled),
            enabled_cpu_features,
            is_memory_overcommit_enabled: desired
                .is_memory_overcommit_enabled
                .or(self.is_memory_overcommit_enabled),
            is_gpu_console_enabled: desired.is_gpu_console_enabled.or(self.is_gpu_console_enabled),
            is_cpu_hotplug_enabled: desired.is_cpu_hotplug_enabled.or(self.is_cpu_hotplug_enabled),
            is_scsi_controller_enabled: desired
                .is_scsi_controller_enabled
                .or(self.is_scsi_controller_enabled),
            is_vga_console_enabled: desired.is_vga_console_enabled.or(self.is_vga_console_enabled),
            is_branding_enabled: desired.is_branding_enabled.or(self.is_branding_enabled),
            is_agent_vm: desired.is_agent_vm.or(self.is_agent_vm),
            hardware_clock_timezone: or_current_str(
                &desired.hardware_clock_timezone,
                &self.hardware_clock_timezone,
            ),
            machine_type: desired.machine_type.or(self.machine_type),
            cluster: or_current_str(&desired.cluster, &self.cluster),
            host: or_current_str(&desired.host, &self.host),
            boot_config: or_current(&desired.boot_config, &self.boot_config),
            guest_customization: or_current(
                &desired.guest_customization,
                &self.guest_customization,
            ),
            guest_tools: or_current(&desired.guest_tools, &self.guest_tools),
            ..self.clone()
        }
    }

    /// Payload for a VM create call: every sub-resource is new.
    pub fn create_payload(&self) -> VmConfig {
        VmConfig {
            disks: self.disks.iter().map(Disk::create_payload).collect(),
            nics: self.nics.iter().map(Nic::create_payload).collect(),
            cd_roms: self.cd_roms.iter().map(CdRom::create_payload).collect(),
            serial_ports: self
                .serial_ports
                .iter()
                .map(SerialPort::create_payload)
                .collect(),
            gpus: self.gpus.iter().map(Gpu::create_payload).collect(),
            ..self.clone()
        }
    }
}

/// Configuration of a VM as read from the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmLiveState {
    pub ext_id: VmId,
    pub config: VmConfig,
    /// Token to present on the next mutation.
    pub token: ConcurrencyToken,
}

impl VmLiveState {
    pub fn ext_id(&self) -> &VmId {
        &self.ext_id
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn token(&self) -> &ConcurrencyToken {
        &self.token
    }

    pub fn power_state(&self) -> PowerState {
        self.config.power_state
    }

    pub fn is_powered_off(&self) -> bool {
        self.config.power_state == PowerState::Off
    }

    /// First IPv4 address reported by any NIC, in NIC order.
    pub fn first_ip_address(&self) -> Option<&str> {
        self.config.nics.iter().find_map(Nic::first_ip_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_config_builder() {
        let config = VmConfig::new("web-1")
            .with_sockets(2)
            .with_memory_bytes(4 << 30)
            .with_disk(Disk::with_size(10 << 30))
            .with_category("cat-1");

        assert_eq!(config.name, "web-1");
        assert_eq!(config.num_sockets, Some(2));
        assert_eq!(config.power_state, PowerState::On);
        assert_eq!(config.disks.len(), 1);
        assert_eq!(config.categories, vec![CategoryRef::new("cat-1")]);
    }

    #[test]
    fn test_changed_fields_scalars() {
        let current = VmConfig::new("vm").with_sockets(2);
        let desired = VmConfig::new("vm")
            .with_sockets(4)
            .with_description("db host");

        let changed = desired.changed_fields(&current);
        assert_eq!(
            changed.into_iter().collect::<Vec<_>>(),
            vec![VmField::Description, VmField::NumSockets]
        );
    }

    #[test]
    fn test_changed_fields_blank_description_is_absent() {
        let current = VmConfig::new("vm");
        let desired = VmConfig::new("vm").with_description("");
        assert!(desired.changed_fields(&current).is_empty());
    }

    #[test]
    fn test_changed_fields_collections() {
        let current = VmConfig::new("vm").with_disk(Disk::with_size(10).with_ext_id("d-1"));
        let desired = VmConfig::new("vm")
            .with_disk(Disk::with_size(20).with_ext_id("d-1"))
            .with_category("cat-1")
            .with_power_state(PowerState::Off);

        let changed = desired.changed_fields(&current);
        assert!(changed.contains(&VmField::Disks));
        assert!(changed.contains(&VmField::Categories));
        assert!(changed.contains(&VmField::PowerState));
        assert!(!changed.contains(&VmField::Nics));
        assert!(changed.iter().all(|f| !f.is_scalar()));
    }

    #[test]
    fn test_learned_ips_do_not_count_as_change() {
        let mut live_nic = Nic::on_subnet("subnet-a").with_ext_id("n-1");
        live_nic.network_info.learned_ip_addresses = vec!["10.0.0.5".into()];
        let current = VmConfig::new("vm").with_nic(live_nic);
        let desired = VmConfig::new("vm").with_nic(Nic::on_subnet("subnet-a").with_ext_id("n-1"));

        assert!(desired.changed_fields(&current).is_empty());
        let live = VmLiveState {
            ext_id: VmId::from("vm-1"),
            config: current,
            token: ConcurrencyToken::new("e1"),
        };
        assert_eq!(live.first_ip_address(), Some("10.0.0.5"));
    }

    #[test]
    fn test_unset_scalars_are_not_changes() {
        let mut current = VmConfig::new("web")
            .with_sockets(2)
            .with_memory_bytes(4 << 30);
        current.cluster = Some("cluster-1".into());
        current.boot_config = Some(BootConfig::Uefi {
            is_secure_boot_enabled: true,
            nvram_storage_container: None,
        });
        current.enabled_cpu_features = vec![CpuFeature::HardwareVirtualization];

        let desired: VmConfig =
            serde_json::from_str(r#"{"name": "web", "description": "x", "cluster": " "}"#)
                .expect("valid config");

        assert_eq!(
            desired.changed_fields(&current).into_iter().collect::<Vec<_>>(),
            vec![VmField::Description]
        );

        let payload = current.with_scalars_from(&desired);
        assert_eq!(payload.description.as_deref(), Some("x"));
        assert_eq!(payload.num_sockets, Some(2));
        assert_eq!(payload.memory_size_bytes, Some(4 << 30));
        assert_eq!(payload.cluster.as_deref(), Some("cluster-1"));
        assert_eq!(payload.boot_config, current.boot_config);
        assert_eq!(payload.enabled_cpu_features, current.enabled_cpu_features);
    }

    #[test]
    fn test_keyed_items_with_unset_fields_are_unchanged() {
        let mut live_disk = Disk::with_size(10).with_ext_id("d-1").at(DiskBusType::Scsi, 0);
        if let Some(DiskBacking::VmDisk(vm_disk)) = &mut live_disk.backing_info {
            vm_disk.storage_container = Some("ctr-1".into());
        }
        let mut live_nic = Nic::on_subnet("subnet-a").with_ext_id("n-1");
        live_nic.backing_info.model = Some(NicModel::Virtio);
        live_nic.backing_info.mac_address = Some("50:6b:8d:00:00:01".into());
        let current = VmConfig::new("vm").with_disk(live_disk).with_nic(live_nic);

        let desired = VmConfig::new("vm")
            .with_disk(Disk::with_size(10).with_ext_id("d-1"))
            .with_nic(Nic::on_subnet("subnet-a").with_ext_id("n-1"));
        assert!(desired.changed_fields(&current).is_empty());

        // a real change carries the unset fields over from the live item
        let resized = vec![Disk::with_size(20).with_ext_id("d-1")];
        let plan = diff(&current.disks, &resized);
        assert_eq!(plan.updated.len(), 1);
        let updated = &plan.updated[0];
        assert_eq!(updated.disk_address, current.disks[0].disk_address);
        match &updated.backing_info {
            Some(DiskBacking::VmDisk(vm_disk)) => {
                assert_eq!(vm_disk.disk_size_bytes, Some(20));
                assert_eq!(vm_disk.storage_container.as_deref(), Some("ctr-1"));
            }
            other => panic!("unexpected backing {other:?}"),
        }
    }

    #[test]
    fn test_cd_rom_update_payload_drops_data_source() {
        let cd_rom = CdRom {
            ext_id: Some("cd-1".into()),
            disk_address: None,
            backing_info: Some(VmDisk {
                disk_size_bytes: None,
                storage_container: None,
                data_source: Some(DataSource::Image {
                    image_ext_id: "iso-1".into(),
                }),
            }),
            iso_type: Some(IsoType::Other),
        };

        let payload = cd_rom.update_payload();
        assert!(payload.backing_info.is_some_and(|b| b.data_source.is_none()));
        assert_eq!(payload.iso_type, Some(IsoType::Other));
    }

    #[test]
    fn test_with_scalars_from_keeps_collections() {
        let live = VmConfig::new("old")
            .with_sockets(2)
            .with_disk(Disk::with_size(10).with_ext_id("d-1"))
            .with_power_state(PowerState::Off);
        let desired = VmConfig::new("new").with_sockets(4);

        let payload = live.with_scalars_from(&desired);
        assert_eq!(payload.name, "new");
        assert_eq!(payload.num_sockets, Some(4));
        assert_eq!(payload.disks, live.disks);
        assert_eq!(payload.power_state, PowerState::Off);
    }

    #[test]
    fn test_disk_update_payload_drops_data_source() {
        let disk = Disk {
            ext_id: Some("d-1".into()),
            disk_address: None,
            backing_info: Some(DiskBacking::VmDisk(VmDisk {
                disk_size_bytes: Some(20),
                storage_container: None,
                data_source: Some(DataSource::Image {
                    image_ext_id: "img-1".into(),
                }),
            })),
        };

        let payload = disk.update_payload();
        match payload.backing_info {
            Some(DiskBacking::VmDisk(vm_disk)) => {
                assert!(vm_disk.data_source.is_none());
                assert_eq!(vm_disk.disk_size_bytes, Some(20));
            }
            other => panic!("unexpected backing {other:?}"),
        }
    }

    #[test]
    fn test_check_create() {
        assert!(Disk::with_size(1024).check_create().is_ok());
        assert!(Disk::default().check_create().is_err());
        assert!(Disk::with_size(0).check_create().is_err());
        assert!(SerialPort {
            ext_id: None,
            index: 7,
            is_connected: true
        }
        .check_create()
        .is_err());

        let mut nic = Nic::on_subnet("s");
        nic.network_info.ipv4_config = Some(Ipv4Config {
            should_assign_ip: true,
            ip_address: Some("10.0.0.300".into()),
        });
        assert!(nic.check_create().is_err());

        let gpu = Gpu {
            ext_id: None,
            mode: GpuMode::Passthrough,
            vendor: Some(GpuVendor::Nvidia),
            device_id: None,
            name: None,
        };
        assert!(gpu.check_create().is_err());
        assert!(Gpu {
            device_id: Some(7864),
            ..gpu
        }
        .check_create()
        .is_ok());
    }

    #[test]
    fn test_create_payload_strips_ext_ids() {
        let config = VmConfig::new("vm")
            .with_disk(Disk::with_size(1).with_ext_id("d-1"))
            .with_nic(Nic::on_subnet("s").with_ext_id("n-1"));
        let payload = config.create_payload();
        assert!(payload.disks.iter().all(|d| d.ext_id.is_none()));
        assert!(payload.nics.iter().all(|n| n.ext_id.is_none()));
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: VmConfig = serde_json::from_str(
            r#"{"name": "vm", "num_sockets": 2, "disks": [{"backing_info": {"type": "vm_disk", "disk_size_bytes": 1024}}]}"#,
        )
        .expect("valid config");
        assert_eq!(config.power_state, PowerState::On);
        assert_eq!(config.disks.len(), 1);
        assert!(config.disks[0].check_create().is_ok());
    }

    #[test]
    fn test_power_state_display() {
        assert_eq!(PowerState::On.to_string(), "ON");
        assert_eq!(PowerState::Undetermined.to_string(), "UNDETERMINED");
        assert!(!PowerState::Paused.is_actionable());
    }
}
