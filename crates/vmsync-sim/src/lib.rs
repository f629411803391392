//! # vmsync-sim
//!
//! In-memory virtualization control plane implementing
//! [`VmApi`] and [`TaskApi`].
//!
//! It behaves like the real thing where the reconciliation engine cares:
//!
//! - every read hands out an ETag-style token and every accepted mutation
//!   invalidates it; a stale token is refused with a conflict
//! - mutations return task handles that move through a scripted sequence of
//!   non-terminal states before they finish
//! - identifiers of VMs and sub-resources are assigned by the server
//! - attributes that cannot be hot-plugged, serial ports and GPUs are
//!   refused while the VM is powered on
//! - a disk or CD-ROM update carrying a `data_source` is refused
//!
//! Each call is recorded, and one-shot faults (conflict, failed task,
//! stalled task, sub-resource removed by another writer) can be armed for
//! operations matching a predicate.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;
use uuid::Uuid;
use vmsync_core::model::{CdRom, Disk, DiskBacking, Gpu, Nic, SerialPort};
use vmsync_core::{
    ApiError, CategoryRef, ConcurrencyToken, Keyed, Operation, PowerState, SubResource,
    SubResourceKind, TaskApi, TaskHandle, TaskInfo, TaskStatus, VmApi, VmConfig, VmId,
    VmLiveState,
};

/// A call received by the simulator.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    /// VM read
    Read(VmId),
    /// Mutating call, accepted or not
    Mutate(Operation),
    /// Task status read
    PollTask(TaskHandle),
}

type Matcher = Box<dyn Fn(&Operation) -> bool + Send + Sync>;

enum FaultKind {
    Conflict,
    Fail(String),
    Stall,
    Vanish,
}

struct Fault {
    matches: Matcher,
    kind: FaultKind,
}

struct SimVm {
    config: VmConfig,
    etag: u64,
}

impl SimVm {
    fn token(&self) -> ConcurrencyToken {
        ConcurrencyToken::new(format!("etag-{}", self.etag))
    }
}

enum TaskEnd {
    Succeed(Vec<String>),
    Fail(String),
    Never,
}

struct SimTask {
    pending: VecDeque<TaskStatus>,
    end: TaskEnd,
}

struct SimState {
    vms: HashMap<VmId, SimVm>,
    tasks: HashMap<TaskHandle, SimTask>,
    calls: Vec<Call>,
    faults: Vec<Fault>,
    script: Vec<TaskStatus>,
    next_ip: u32,
}

/// Simulated control plane. Share it behind an `Arc` and pass the same
/// value as both clients of a [`Reconciler`](vmsync_core::Reconciler).
pub struct SimulatedControlPlane {
    state: Mutex<SimState>,
}

impl Default for SimulatedControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedControlPlane {
    /// Create an empty control plane. Tasks report QUEUED, then RUNNING,
    /// then their terminal state.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                vms: HashMap::new(),
                tasks: HashMap::new(),
                calls: Vec::new(),
                faults: Vec::new(),
                script: vec![TaskStatus::Queued, TaskStatus::Running],
                next_ip: 10,
            }),
        }
    }

    /// Register an existing VM. Sub-resources without an `ext_id` get one.
    pub async fn seed_vm(&self, mut config: VmConfig) -> VmId {
        assign_missing_ids(&mut config);
        let id = VmId::from(Uuid::new_v4().to_string());
        let mut state = self.state.lock().await;
        state.vms.insert(id.clone(), SimVm { config, etag: 0 });
        tracing::debug!(vm_id = %id, "Seeded VM");
        id
    }

    /// Current configuration of a VM, bypassing the call log.
    pub async fn vm(&self, id: &VmId) -> Option<VmConfig> {
        let state = self.state.lock().await;
        state.vms.get(id).map(|vm| vm.config.clone())
    }

    /// Every call received so far, in order.
    pub async fn calls(&self) -> Vec<Call> {
        self.state.lock().await.calls.clone()
    }

    /// Mutating calls received so far, in order.
    pub async fn mutations(&self) -> Vec<Operation> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Mutate(op) => Some(op.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    /// Non-terminal states each new task reports before it finishes.
    pub async fn set_task_script(&self, pending: Vec<TaskStatus>) {
        self.state.lock().await.script = pending;
    }

    /// Refuse the next matching mutation as if another writer got there
    /// first. The VM's token changes.
    pub async fn conflict_when(
        &self,
        matches: impl Fn(&Operation) -> bool + Send + Sync + 'static,
    ) {
        self.arm(matches, FaultKind::Conflict).await;
    }

    /// Accept the next matching mutation but end its task FAILED with
    /// `detail`. Nothing is changed.
    pub async fn fail_when(
        &self,
        matches: impl Fn(&Operation) -> bool + Send + Sync + 'static,
        detail: impl Into<String>,
    ) {
        self.arm(matches, FaultKind::Fail(detail.into())).await;
    }

    /// Accept the next matching mutation but never finish its task.
    pub async fn stall_when(&self, matches: impl Fn(&Operation) -> bool + Send + Sync + 'static) {
        self.arm(matches, FaultKind::Stall).await;
    }

    /// Remove the sub-resource targeted by the next matching call just
    /// before the call lands, as another writer would. The call then fails
    /// with not found.
    pub async fn vanish_when(&self, matches: impl Fn(&Operation) -> bool + Send + Sync + 'static) {
        self.arm(matches, FaultKind::Vanish).await;
    }

    async fn arm(
        &self,
        matches: impl Fn(&Operation) -> bool + Send + Sync + 'static,
        kind: FaultKind,
    ) {
        self.state.lock().await.faults.push(Fault {
            matches: Box::new(matches),
            kind,
        });
    }
}

impl SimState {
    fn vm_mut(&mut self, id: &VmId) -> Result<&mut SimVm, ApiError> {
        self.vms
            .get_mut(id)
            .ok_or_else(|| ApiError::NotFound(format!("VM {id} not found")))
    }

    fn spawn_task(&mut self, end: TaskEnd) -> TaskHandle {
        let handle = TaskHandle::new(format!("task-{}", Uuid::new_v4()));
        self.tasks.insert(
            handle.clone(),
            SimTask {
                pending: self.script.iter().copied().collect(),
                end,
            },
        );
        handle
    }

    /// Record `op`, check the token, honour armed faults, then apply.
    fn run(
        &mut self,
        op: Operation,
        target: Option<(&VmId, &ConcurrencyToken)>,
        apply: impl FnOnce(&mut SimState) -> Result<Vec<String>, ApiError>,
    ) -> Result<TaskHandle, ApiError> {
        self.calls.push(Call::Mutate(op.clone()));

        if let Some((id, token)) = target {
            let vm = self.vm_mut(id)?;
            let current = vm.token();
            if &current != token {
                return Err(ApiError::Conflict(format!(
                    "If-Match {token} does not match {current}"
                )));
            }
        }

        if let Some(pos) = self.faults.iter().position(|f| (f.matches)(&op)) {
            let fault = self.faults.remove(pos);
            match fault.kind {
                FaultKind::Conflict => {
                    if let Some((id, _)) = target {
                        self.vm_mut(id)?.etag += 1;
                    }
                    return Err(ApiError::Conflict(format!("{op}: VM was modified concurrently")));
                }
                FaultKind::Fail(detail) => return Ok(self.spawn_task(TaskEnd::Fail(detail))),
                FaultKind::Stall => return Ok(self.spawn_task(TaskEnd::Never)),
                FaultKind::Vanish => {
                    if let (
                        Some((id, _)),
                        Operation::DeleteSubResource { kind, ext_id }
                        | Operation::UpdateSubResource { kind, ext_id },
                    ) = (target, &op)
                    {
                        let vm = self.vm_mut(id)?;
                        if remove_sub_resource(&mut vm.config, *kind, ext_id).is_ok() {
                            vm.etag += 1;
                        }
                    }
                    return Err(ApiError::NotFound(format!("{op}: target no longer exists")));
                }
            }
        }

        let entities = apply(self)?;
        if let Some((id, _)) = target {
            if let Some(vm) = self.vms.get_mut(id) {
                vm.etag += 1;
            }
        }
        tracing::debug!(op = %op, "Applied mutation");
        Ok(self.spawn_task(TaskEnd::Succeed(entities)))
    }
}

trait Identify: Keyed {
    fn ext_id_mut(&mut self) -> &mut Option<String>;
}

macro_rules! impl_identify {
    ($($ty:ty),*) => {
        $(
            impl Identify for $ty {
                fn ext_id_mut(&mut self) -> &mut Option<String> {
                    &mut self.ext_id
                }
            }
        )*
    };
}

impl_identify!(Disk, Nic, CdRom, SerialPort, Gpu);

fn fill_ids<T: Identify>(items: &mut [T]) {
    for item in items {
        let slot = item.ext_id_mut();
        if slot.as_deref().map_or(true, |s| s.trim().is_empty()) {
            *slot = Some(Uuid::new_v4().to_string());
        }
    }
}

fn assign_missing_ids(config: &mut VmConfig) {
    fill_ids(&mut config.disks);
    fill_ids(&mut config.nics);
    fill_ids(&mut config.cd_roms);
    fill_ids(&mut config.serial_ports);
    fill_ids(&mut config.gpus);
}

fn push_new<T: Identify>(items: &mut Vec<T>, mut item: T) -> String {
    let ext_id = Uuid::new_v4().to_string();
    *item.ext_id_mut() = Some(ext_id.clone());
    items.push(item);
    ext_id
}

fn replace_item<T: Identify>(
    items: &mut [T],
    kind: SubResourceKind,
    ext_id: &str,
    mut item: T,
) -> Result<(), ApiError> {
    let slot = items
        .iter_mut()
        .find(|i| i.key() == Some(ext_id))
        .ok_or_else(|| ApiError::NotFound(format!("{kind} {ext_id} not found")))?;
    *item.ext_id_mut() = Some(ext_id.to_string());
    *slot = item;
    Ok(())
}

fn remove_item<T: Keyed>(
    items: &mut Vec<T>,
    kind: SubResourceKind,
    ext_id: &str,
) -> Result<(), ApiError> {
    let before = items.len();
    items.retain(|i| i.key() != Some(ext_id));
    if items.len() == before {
        return Err(ApiError::NotFound(format!("{kind} {ext_id} not found")));
    }
    Ok(())
}

fn remove_sub_resource(
    config: &mut VmConfig,
    kind: SubResourceKind,
    ext_id: &str,
) -> Result<(), ApiError> {
    match kind {
        SubResourceKind::Disk => remove_item(&mut config.disks, kind, ext_id),
        SubResourceKind::Nic => remove_item(&mut config.nics, kind, ext_id),
        SubResourceKind::CdRom => remove_item(&mut config.cd_roms, kind, ext_id),
        SubResourceKind::SerialPort => remove_item(&mut config.serial_ports, kind, ext_id),
        SubResourceKind::Gpu => remove_item(&mut config.gpus, kind, ext_id),
    }
}

fn require_off_for(vm: &SimVm, kind: SubResourceKind) -> Result<(), ApiError> {
    let cold = matches!(kind, SubResourceKind::SerialPort | SubResourceKind::Gpu);
    if cold && vm.config.power_state == PowerState::On {
        return Err(ApiError::Rejected(format!(
            "{kind} changes require the VM to be powered off"
        )));
    }
    Ok(())
}

fn disk_data_source_set(disk: &Disk) -> bool {
    matches!(&disk.backing_info, Some(DiskBacking::VmDisk(v)) if v.data_source.is_some())
}

#[async_trait]
impl VmApi for SimulatedControlPlane {
    async fn get_vm(&self, id: &VmId) -> Result<VmLiveState, ApiError> {
        let mut state = self.state.lock().await;
        state.calls.push(Call::Read(id.clone()));
        let vm = state.vm_mut(id)?;
        Ok(VmLiveState {
            ext_id: id.clone(),
            config: vm.config.clone(),
            token: vm.token(),
        })
    }

    async fn create_vm(&self, config: &VmConfig) -> Result<TaskHandle, ApiError> {
        let mut state = self.state.lock().await;
        state.run(Operation::CreateVm, None, |s| {
            let mut stored = config.clone();
            assign_missing_ids(&mut stored);
            stored.power_state = PowerState::Off;
            for nic in &mut stored.nics {
                nic.network_info.learned_ip_addresses.clear();
            }
            let id = VmId::from(Uuid::new_v4().to_string());
            s.vms.insert(
                id.clone(),
                SimVm {
                    config: stored,
                    etag: 0,
                },
            );
            Ok(vec![id.to_string()])
        })
    }

    async fn update_vm(
        &self,
        id: &VmId,
        config: &VmConfig,
        token: &ConcurrencyToken,
    ) -> Result<TaskHandle, ApiError> {
        let mut state = self.state.lock().await;
        state.run(Operation::UpdateVm, Some((id, token)), |s| {
            let vm = s.vm_mut(id)?;
            if vm.config.power_state == PowerState::On {
                let cold: Vec<&str> = config
                    .changed_fields(&vm.config)
                    .into_iter()
                    .filter(|f| f.is_scalar() && !f.is_hot_pluggable())
                    .map(|f| f.as_str())
                    .collect();
                if !cold.is_empty() {
                    return Err(ApiError::Rejected(format!(
                        "cannot change {} while the VM is powered on",
                        cold.join(", ")
                    )));
                }
            }
            vm.config = vm.config.with_scalars_from(config);
            Ok(vec![id.to_string()])
        })
    }

    async fn delete_vm(&self, id: &VmId, token: &ConcurrencyToken) -> Result<TaskHandle, ApiError> {
        let mut state = self.state.lock().await;
        state.run(Operation::DeleteVm, Some((id, token)), |s| {
            s.vms.remove(id);
            Ok(vec![id.to_string()])
        })
    }

    async fn power_on(&self, id: &VmId, token: &ConcurrencyToken) -> Result<TaskHandle, ApiError> {
        let mut state = self.state.lock().await;
        state.run(Operation::PowerOn, Some((id, token)), |s| {
            let SimState { vms, next_ip, .. } = s;
            let vm = vms
                .get_mut(id)
                .ok_or_else(|| ApiError::NotFound(format!("VM {id} not found")))?;
            vm.config.power_state = PowerState::On;
            for nic in &mut vm.config.nics {
                if nic.network_info.learned_ip_addresses.is_empty() {
                    *next_ip += 1;
                    nic.network_info
                        .learned_ip_addresses
                        .push(format!("10.0.0.{next_ip}"));
                }
            }
            Ok(vec![id.to_string()])
        })
    }

    async fn power_off(&self, id: &VmId, token: &ConcurrencyToken) -> Result<TaskHandle, ApiError> {
        let mut state = self.state.lock().await;
        state.run(Operation::PowerOff, Some((id, token)), |s| {
            s.vm_mut(id)?.config.power_state = PowerState::Off;
            Ok(vec![id.to_string()])
        })
    }

    async fn create_sub_resource(
        &self,
        id: &VmId,
        item: &SubResource,
        token: &ConcurrencyToken,
    ) -> Result<TaskHandle, ApiError> {
        let mut state = self.state.lock().await;
        let kind = item.kind();
        state.run(Operation::CreateSubResource(kind), Some((id, token)), |s| {
            let vm = s.vm_mut(id)?;
            require_off_for(vm, kind)?;
            let config = &mut vm.config;
            let ext_id = match item.clone() {
                SubResource::Disk(disk) => push_new(&mut config.disks, disk),
                SubResource::Nic(nic) => push_new(&mut config.nics, nic),
                SubResource::CdRom(cd_rom) => push_new(&mut config.cd_roms, cd_rom),
                SubResource::SerialPort(port) => push_new(&mut config.serial_ports, port),
                SubResource::Gpu(gpu) => push_new(&mut config.gpus, gpu),
            };
            Ok(vec![ext_id])
        })
    }

    async fn update_sub_resource(
        &self,
        id: &VmId,
        ext_id: &str,
        item: &SubResource,
        token: &ConcurrencyToken,
    ) -> Result<TaskHandle, ApiError> {
        let mut state = self.state.lock().await;
        let kind = item.kind();
        let op = Operation::UpdateSubResource {
            kind,
            ext_id: ext_id.to_string(),
        };
        state.run(op, Some((id, token)), |s| {
            let vm = s.vm_mut(id)?;
            require_off_for(vm, kind)?;
            let config = &mut vm.config;
            match item.clone() {
                SubResource::Disk(mut disk) => {
                    if disk_data_source_set(&disk) {
                        return Err(ApiError::Rejected(
                            "data_source is only accepted when a disk is created".into(),
                        ));
                    }
                    let previous = config
                        .disks
                        .iter()
                        .find(|d| d.key() == Some(ext_id))
                        .and_then(|d| match &d.backing_info {
                            Some(DiskBacking::VmDisk(v)) => v.data_source.clone(),
                            _ => None,
                        });
                    if let Some(DiskBacking::VmDisk(v)) = &mut disk.backing_info {
                        v.data_source = previous;
                    }
                    replace_item(&mut config.disks, kind, ext_id, disk)?
                }
                SubResource::Nic(nic) => replace_item(&mut config.nics, kind, ext_id, nic)?,
                SubResource::CdRom(mut cd_rom) => {
                    if cd_rom.backing_info.as_ref().is_some_and(|b| b.data_source.is_some()) {
                        return Err(ApiError::Rejected(
                            "data_source is only accepted when a CD-ROM is created".into(),
                        ));
                    }
                    let previous = config
                        .cd_roms
                        .iter()
                        .find(|c| c.key() == Some(ext_id))
                        .and_then(|c| c.backing_info.as_ref())
                        .and_then(|b| b.data_source.clone());
                    if let Some(backing) = &mut cd_rom.backing_info {
                        backing.data_source = previous;
                    }
                    replace_item(&mut config.cd_roms, kind, ext_id, cd_rom)?
                }
                SubResource::SerialPort(port) => {
                    replace_item(&mut config.serial_ports, kind, ext_id, port)?
                }
                SubResource::Gpu(gpu) => replace_item(&mut config.gpus, kind, ext_id, gpu)?,
            }
            Ok(vec![ext_id.to_string()])
        })
    }

    async fn delete_sub_resource(
        &self,
        id: &VmId,
        kind: SubResourceKind,
        ext_id: &str,
        token: &ConcurrencyToken,
    ) -> Result<TaskHandle, ApiError> {
        let mut state = self.state.lock().await;
        let op = Operation::DeleteSubResource {
            kind,
            ext_id: ext_id.to_string(),
        };
        state.run(op, Some((id, token)), |s| {
            let vm = s.vm_mut(id)?;
            require_off_for(vm, kind)?;
            remove_sub_resource(&mut vm.config, kind, ext_id)?;
            Ok(vec![ext_id.to_string()])
        })
    }

    async fn associate_categories(
        &self,
        id: &VmId,
        categories: &[CategoryRef],
        token: &ConcurrencyToken,
    ) -> Result<TaskHandle, ApiError> {
        let mut state = self.state.lock().await;
        state.run(Operation::AssociateCategories, Some((id, token)), |s| {
            let attached = &mut s.vm_mut(id)?.config.categories;
            for category in categories {
                if !attached.contains(category) {
                    attached.push(category.clone());
                }
            }
            Ok(categories.iter().map(|c| c.ext_id.clone()).collect())
        })
    }

    async fn disassociate_categories(
        &self,
        id: &VmId,
        categories: &[CategoryRef],
        token: &ConcurrencyToken,
    ) -> Result<TaskHandle, ApiError> {
        let mut state = self.state.lock().await;
        state.run(Operation::DisassociateCategories, Some((id, token)), |s| {
            s.vm_mut(id)?
                .config
                .categories
                .retain(|c| !categories.contains(c));
            Ok(categories.iter().map(|c| c.ext_id.clone()).collect())
        })
    }
}

#[async_trait]
impl TaskApi for SimulatedControlPlane {
    async fn get_task(&self, handle: &TaskHandle) -> Result<TaskInfo, ApiError> {
        let mut state = self.state.lock().await;
        state.calls.push(Call::PollTask(handle.clone()));
        let task = state
            .tasks
            .get_mut(handle)
            .ok_or_else(|| ApiError::NotFound(format!("task {handle} not found")))?;

        if let Some(status) = task.pending.pop_front() {
            let mut info = TaskInfo::with_status(status);
            info.progress_percentage = Some(if status == TaskStatus::Running { 50 } else { 0 });
            return Ok(info);
        }

        let info = match &task.end {
            TaskEnd::Succeed(entities) => TaskInfo {
                status: TaskStatus::Succeeded,
                entities_affected: entities.clone(),
                error_detail: None,
                progress_percentage: Some(100),
                completed_time: Some(Utc::now()),
            },
            TaskEnd::Fail(detail) => TaskInfo {
                status: TaskStatus::Failed,
                entities_affected: Vec::new(),
                error_detail: Some(detail.clone()),
                progress_percentage: None,
                completed_time: Some(Utc::now()),
            },
            TaskEnd::Never => {
                let mut info = TaskInfo::with_status(TaskStatus::Running);
                info.progress_percentage = Some(50);
                info
            }
        };
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stale_token_is_refused() {
        let plane = SimulatedControlPlane::new();
        let id = plane.seed_vm(VmConfig::new("vm")).await;

        let live = plane.get_vm(&id).await.unwrap();
        plane.power_off(&id, live.token()).await.unwrap();

        let err = plane.power_on(&id, live.token()).await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_task_follows_script() {
        let plane = SimulatedControlPlane::new();
        let id = plane.seed_vm(VmConfig::new("vm")).await;
        let live = plane.get_vm(&id).await.unwrap();
        let handle = plane.power_off(&id, live.token()).await.unwrap();

        let statuses = [
            plane.get_task(&handle).await.unwrap().status,
            plane.get_task(&handle).await.unwrap().status,
            plane.get_task(&handle).await.unwrap().status,
        ];
        assert_eq!(
            statuses,
            [TaskStatus::Queued, TaskStatus::Running, TaskStatus::Succeeded]
        );
    }

    #[tokio::test]
    async fn test_seed_assigns_ids() {
        let plane = SimulatedControlPlane::new();
        let id = plane
            .seed_vm(VmConfig::new("vm").with_disk(Disk::with_size(1)))
            .await;
        let config = plane.vm(&id).await.unwrap();
        assert!(config.disks[0].ext_id.is_some());
    }

    #[tokio::test]
    async fn test_cold_update_refused_while_on() {
        let plane = SimulatedControlPlane::new();
        let id = plane.seed_vm(VmConfig::new("vm").with_sockets(2)).await;
        let live = plane.get_vm(&id).await.unwrap();

        let err = plane
            .update_vm(&id, &VmConfig::new("vm").with_sockets(4), live.token())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Rejected(msg) if msg.contains("num_sockets")));
    }
}
