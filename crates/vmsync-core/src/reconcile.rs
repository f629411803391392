//! Reconciliation orchestrator.
//!
//! Drives a VM from its live configuration to a declared one through the
//! control plane's task-based API. Every mutation re-reads the VM for a
//! fresh concurrency token and waits for its task before the next call.

use crate::client::{ApiError, Operation, TaskApi, VmApi};
use crate::config::ReconcileConfig;
use crate::diff::{diff, validate_unique_keys, Keyed};
use crate::error::{CoreError, Result};
use crate::hotplug::{cold_fields, needs_power_off};
use crate::model::{
    CdRom, Disk, Gpu, Nic, PowerState, SerialPort, SubResourceEntity, VmConfig, VmDesiredState,
    VmField, VmId, VmLiveState,
};
use crate::task::{TaskHandle, TaskOutcome, TaskPoller};
use std::future::Future;
use std::sync::Arc;
use tokio::time::{sleep, Instant};

/// Converges VMs to their declared configuration.
///
/// A `Reconciler` holds no per-VM state, so one instance can serve
/// concurrent reconciliations of different VMs.
pub struct Reconciler {
    vms: Arc<dyn VmApi>,
    tasks: Arc<dyn TaskApi>,
    poller: TaskPoller,
    config: ReconcileConfig,
}

impl Reconciler {
    /// Create a reconciler over the given clients.
    pub fn new(vms: Arc<dyn VmApi>, tasks: Arc<dyn TaskApi>, config: ReconcileConfig) -> Self {
        Self {
            vms,
            tasks,
            poller: TaskPoller::new(config.poll_interval),
            config,
        }
    }

    /// Get the reconciler configuration.
    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Bring VM `id` to `desired`.
    ///
    /// Steps run in a fixed order: optional power-off, scalar update,
    /// disks, NICs, CD-ROMs, serial ports, GPUs, categories, then the
    /// declared power state. Steps with nothing to do are skipped.
    ///
    /// # Errors
    /// A validation error is returned before any remote call. Any later
    /// error aborts the run where it happened; earlier steps stay applied
    /// and the next call picks up from the live state.
    pub async fn reconcile(&self, desired: &VmDesiredState, id: &VmId) -> Result<VmLiveState> {
        validate_desired(desired, false)?;

        let live = self.read(id).await?;
        let changed = desired.changed_fields(live.config());
        if changed.is_empty() {
            tracing::debug!(vm_id = %id, "VM already matches declared state");
            return Ok(live);
        }
        tracing::info!(
            vm_id = %id,
            changed = ?changed.iter().map(|f| f.as_str()).collect::<Vec<_>>(),
            "Reconciling VM"
        );

        validate_planned(desired, live.config())?;

        let initial_power = live.power_state();
        let mut cycled = false;
        if needs_power_off(&changed, initial_power) {
            tracing::info!(
                vm_id = %id,
                cold_fields = ?cold_fields(&changed).iter().map(|f| f.as_str()).collect::<Vec<_>>(),
                "Changes require the VM to be powered off"
            );
            cycled = self.set_power(id, PowerState::Off).await?;
        }

        if changed.iter().any(|f| f.is_scalar()) {
            let live = self.read(id).await?;
            let payload = live.config().with_scalars_from(desired);
            self.submit(
                id.as_str(),
                Operation::UpdateVm,
                self.vms.update_vm(id, &payload, live.token()),
            )
            .await?;
        }

        if changed.contains(&VmField::Disks) {
            self.sync_collection::<Disk>(id, &desired.disks).await?;
        }
        if changed.contains(&VmField::Nics) {
            self.sync_collection::<Nic>(id, &desired.nics).await?;
        }
        if changed.contains(&VmField::CdRoms) {
            self.sync_collection::<CdRom>(id, &desired.cd_roms).await?;
        }
        if changed.contains(&VmField::SerialPorts) {
            self.sync_collection::<SerialPort>(id, &desired.serial_ports).await?;
        }
        if changed.contains(&VmField::Gpus) {
            self.sync_collection::<Gpu>(id, &desired.gpus).await?;
        }
        if changed.contains(&VmField::Categories) {
            self.sync_categories(id, desired).await?;
        }

        if cycled || desired.power_state != initial_power {
            self.set_power(id, desired.power_state).await?;
        }

        let live = self.read(id).await?;
        tracing::info!(vm_id = %id, power_state = %live.power_state(), "VM reconciled");
        Ok(live)
    }

    /// Create a VM from `desired` and bring it to the declared power state.
    ///
    /// The new identifier is taken from the create task. When the VM is
    /// declared on and has NICs, this also waits (bounded by
    /// [`ReconcileConfig::ip_timeout`]) for an IP address; not getting one
    /// is logged and otherwise ignored.
    pub async fn create(&self, desired: &VmDesiredState) -> Result<VmLiveState> {
        validate_desired(desired, true)?;

        let payload = desired.create_payload();
        let outcome = self
            .submit(
                &desired.name,
                Operation::CreateVm,
                self.vms.create_vm(&payload),
            )
            .await?;
        let id = outcome
            .first_affected()
            .map(VmId::from)
            .ok_or_else(|| CoreError::MissingEntity {
                op: Operation::CreateVm,
                task: outcome.handle.clone(),
            })?;
        tracing::info!(vm_id = %id, name = %desired.name, "Created VM");

        self.set_power(&id, desired.power_state).await?;

        if desired.power_state == PowerState::On
            && !desired.nics.is_empty()
            && self.config.wait_for_ip
        {
            match self.wait_for_ip(&id).await {
                Ok(Some(_)) => {}
                Ok(None) => tracing::warn!(
                    vm_id = %id,
                    timeout_secs = self.config.ip_timeout.as_secs(),
                    "VM did not report an IP address in time"
                ),
                Err(e) => tracing::warn!(vm_id = %id, error = %e, "Could not get the IP for VM"),
            }
        }

        self.read(&id).await
    }

    /// Delete VM `id`.
    pub async fn delete(&self, id: &VmId) -> Result<()> {
        let live = self.read(id).await?;
        self.submit(
            id.as_str(),
            Operation::DeleteVm,
            self.vms.delete_vm(id, live.token()),
        )
        .await?;
        tracing::info!(vm_id = %id, "Deleted VM");
        Ok(())
    }

    /// Power the VM on. Returns false if it was already on.
    pub async fn power_on(&self, id: &VmId) -> Result<bool> {
        self.set_power(id, PowerState::On).await
    }

    /// Power the VM off. Returns false if it was already off.
    pub async fn power_off(&self, id: &VmId) -> Result<bool> {
        self.set_power(id, PowerState::Off).await
    }

    /// Poll the VM until any NIC reports an IPv4 address.
    ///
    /// Returns `Ok(None)` if none shows up within the configured timeout.
    pub async fn wait_for_ip(&self, id: &VmId) -> Result<Option<String>> {
        let start = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let live = self.read(id).await?;
            if let Some(ip) = live.first_ip_address() {
                tracing::info!(
                    vm_id = %id,
                    ip = %ip,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    attempts,
                    "VM reported an IP address"
                );
                return Ok(Some(ip.to_string()));
            }

            let elapsed = start.elapsed();
            if elapsed >= self.config.ip_timeout {
                return Ok(None);
            }
            sleep(self.config.ip_poll_interval.min(self.config.ip_timeout - elapsed)).await;
        }
    }

    async fn read(&self, id: &VmId) -> Result<VmLiveState> {
        let live = self
            .vms
            .get_vm(id)
            .await
            .map_err(|e| CoreError::from_api(Operation::ReadVm, e))?;
        tracing::debug!(vm_id = %id, token = %live.token(), "Read VM");
        Ok(live)
    }

    /// Issue one mutating call and wait for its task.
    async fn submit<F>(&self, vm: &str, op: Operation, call: F) -> Result<TaskOutcome>
    where
        F: Future<Output = std::result::Result<TaskHandle, ApiError>>,
    {
        let handle = call
            .await
            .map_err(|e| CoreError::from_api(op.clone(), e))?;
        tracing::info!(vm = %vm, op = %op, task = %handle, "Submitted task");

        let start = Instant::now();
        let outcome = self
            .poller
            .wait(self.tasks.as_ref(), &handle, &op, self.config.task_timeout)
            .await?;
        tracing::info!(
            vm = %vm,
            op = %op,
            task = %handle,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Task completed"
        );
        Ok(outcome)
    }

    /// Move the VM to `target` unless it is already there.
    async fn set_power(&self, id: &VmId, target: PowerState) -> Result<bool> {
        let live = self.read(id).await?;
        if live.power_state() == target {
            tracing::debug!(vm_id = %id, power_state = %target, "Power state already reached");
            return Ok(false);
        }

        let (op, call) = match target {
            PowerState::On => (Operation::PowerOn, self.vms.power_on(id, live.token())),
            PowerState::Off => (Operation::PowerOff, self.vms.power_off(id, live.token())),
            other => {
                return Err(CoreError::Validation(format!(
                    "power state {other} cannot be requested"
                )))
            }
        };
        self.submit(id.as_str(), op, call).await?;
        Ok(true)
    }

    /// Apply one sub-resource collection: deletes, then updates, then
    /// creates, one task at a time.
    async fn sync_collection<T: SubResourceEntity>(&self, id: &VmId, desired: &[T]) -> Result<()> {
        let live = self.read(id).await?;
        let plan = diff(T::collection(live.config()), desired);
        if plan.is_empty() {
            return Ok(());
        }
        tracing::debug!(
            vm_id = %id,
            kind = %T::KIND,
            added = plan.added.len(),
            removed = plan.removed.len(),
            updated = plan.updated.len(),
            "Planned sub-resource changes"
        );

        for item in &plan.removed {
            let Some(ext_id) = item.key() else {
                tracing::warn!(vm_id = %id, kind = %T::KIND, "Skipping live item without ext_id");
                continue;
            };
            let op = Operation::DeleteSubResource {
                kind: T::KIND,
                ext_id: ext_id.to_string(),
            };
            let live = self.read(id).await?;
            self.submit(
                id.as_str(),
                op,
                self.vms
                    .delete_sub_resource(id, T::KIND, ext_id, live.token()),
            )
            .await?;
        }

        for item in &plan.updated {
            let Some(ext_id) = item.key() else {
                tracing::warn!(
                    vm_id = %id,
                    kind = %T::KIND,
                    "Skipping updated item without ext_id"
                );
                continue;
            };
            let op = Operation::UpdateSubResource {
                kind: T::KIND,
                ext_id: ext_id.to_string(),
            };
            let payload = item.update_payload().into_sub_resource();
            let live = self.read(id).await?;
            self.submit(
                id.as_str(),
                op,
                self.vms
                    .update_sub_resource(id, ext_id, &payload, live.token()),
            )
            .await?;
        }

        for item in &plan.added {
            let payload = item.create_payload().into_sub_resource();
            let live = self.read(id).await?;
            self.submit(
                id.as_str(),
                Operation::CreateSubResource(T::KIND),
                self.vms.create_sub_resource(id, &payload, live.token()),
            )
            .await?;
        }

        Ok(())
    }

    /// Detach removed categories in one call, then attach added ones in one call.
    async fn sync_categories(&self, id: &VmId, desired: &VmConfig) -> Result<()> {
        let live = self.read(id).await?;
        let plan = diff(&live.config().categories, &desired.categories);

        if !plan.removed.is_empty() {
            let live = self.read(id).await?;
            self.submit(
                id.as_str(),
                Operation::DisassociateCategories,
                self.vms
                    .disassociate_categories(id, &plan.removed, live.token()),
            )
            .await?;
        }

        if !plan.added.is_empty() {
            let live = self.read(id).await?;
            self.submit(
                id.as_str(),
                Operation::AssociateCategories,
                self.vms.associate_categories(id, &plan.added, live.token()),
            )
            .await?;
        }

        Ok(())
    }
}

fn positive<T: PartialOrd + Default + std::fmt::Display>(
    field: &str,
    value: Option<T>,
) -> Result<()> {
    match value {
        Some(v) if v <= T::default() => Err(CoreError::Validation(format!(
            "{field} must be > 0, got {v}"
        ))),
        _ => Ok(()),
    }
}

fn has_key<T: Keyed>(item: &T) -> bool {
    item.key().is_some_and(|k| !k.trim().is_empty())
}

fn check_collection<T: SubResourceEntity>(
    name: &str,
    items: &[T],
    all_new: bool,
) -> Result<()> {
    validate_unique_keys(name, items)?;
    for (i, item) in items.iter().enumerate() {
        if all_new || !has_key(item) {
            item.check_create()
                .map_err(|msg| CoreError::Validation(format!("{name}[{i}]: {msg}")))?;
        }
    }
    Ok(())
}

/// Check a declared state without talking to the control plane.
///
/// With `all_new`, every sub-resource must be creatable; otherwise only
/// the items without an identifier are checked.
pub fn validate_desired(desired: &VmDesiredState, all_new: bool) -> Result<()> {
    if desired.name.trim().is_empty() {
        return Err(CoreError::Validation("name must not be empty".into()));
    }
    positive("num_sockets", desired.num_sockets)?;
    positive("num_cores_per_socket", desired.num_cores_per_socket)?;
    positive("num_threads_per_core", desired.num_threads_per_core)?;
    positive("memory_size_bytes", desired.memory_size_bytes)?;
    if let Some(nodes) = desired.num_numa_nodes {
        if nodes < 0 {
            return Err(CoreError::Validation(format!(
                "num_numa_nodes must be >= 0, got {nodes}"
            )));
        }
    }
    if !desired.power_state.is_actionable() {
        return Err(CoreError::Validation(format!(
            "power_state must be ON or OFF, got {}",
            desired.power_state
        )));
    }

    check_collection("disks", &desired.disks, all_new)?;
    check_collection("nics", &desired.nics, all_new)?;
    check_collection("cd_roms", &desired.cd_roms, all_new)?;
    check_collection("serial_ports", &desired.serial_ports, all_new)?;
    check_collection("gpus", &desired.gpus, all_new)?;

    validate_unique_keys("categories", &desired.categories)?;
    if let Some(i) = desired
        .categories
        .iter()
        .position(|c| c.ext_id.trim().is_empty())
    {
        return Err(CoreError::Validation(format!(
            "categories[{i}]: ext_id must not be empty"
        )));
    }

    Ok(())
}

fn check_planned_adds<T: SubResourceEntity>(name: &str, live: &[T], desired: &[T]) -> Result<()> {
    for item in diff(live, desired).added {
        item.check_create().map_err(|msg| {
            CoreError::Validation(format!(
                "{name}: {} cannot be created: {msg}",
                item.key().unwrap_or("new item")
            ))
        })?;
    }
    Ok(())
}

/// Check every create the reconciliation is about to issue, so that no
/// validation error can surface after the first mutation.
fn validate_planned(desired: &VmConfig, live: &VmConfig) -> Result<()> {
    check_planned_adds("disks", &live.disks, &desired.disks)?;
    check_planned_adds("nics", &live.nics, &desired.nics)?;
    check_planned_adds("cd_roms", &live.cd_roms, &desired.cd_roms)?;
    check_planned_adds("serial_ports", &live.serial_ports, &desired.serial_ports)?;
    check_planned_adds("gpus", &live.gpus, &desired.gpus)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        CategoryRef, ConcurrencyToken, Disk, DiskBacking, SubResource, SubResourceKind,
    };
    use crate::task::{TaskInfo, TaskStatus};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    // Single-VM mock: every task succeeds on the first poll.
    struct MockPlane {
        vm: Mutex<VmLiveState>,
        etag: Mutex<u32>,
        calls: Mutex<Vec<String>>,
    }

    impl MockPlane {
        fn new(config: VmConfig) -> Arc<Self> {
            Arc::new(Self {
                vm: Mutex::new(VmLiveState {
                    ext_id: VmId::from("vm-1"),
                    config,
                    token: ConcurrencyToken::new("etag-0"),
                }),
                etag: Mutex::new(0),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn mutate(
            &self,
            name: &str,
            token: &ConcurrencyToken,
            apply: impl FnOnce(&mut VmConfig),
        ) -> std::result::Result<TaskHandle, ApiError> {
            self.calls.lock().unwrap().push(name.to_string());
            let mut vm = self.vm.lock().unwrap();
            if &vm.token != token {
                return Err(ApiError::Conflict("stale etag".into()));
            }
            apply(&mut vm.config);
            let mut etag = self.etag.lock().unwrap();
            *etag += 1;
            let n = *etag;
            vm.token = ConcurrencyToken::new(format!("etag-{n}"));
            Ok(TaskHandle::from(format!("task-{n}")))
        }
    }

    #[async_trait]
    impl VmApi for MockPlane {
        async fn get_vm(&self, _id: &VmId) -> std::result::Result<VmLiveState, ApiError> {
            self.calls.lock().unwrap().push("get_vm".into());
            Ok(self.vm.lock().unwrap().clone())
        }

        async fn create_vm(&self, _config: &VmConfig) -> std::result::Result<TaskHandle, ApiError> {
            self.calls.lock().unwrap().push("create_vm".into());
            Ok(TaskHandle::from("task-create"))
        }

        async fn update_vm(
            &self,
            _id: &VmId,
            config: &VmConfig,
            token: &ConcurrencyToken,
        ) -> std::result::Result<TaskHandle, ApiError> {
            let config = config.clone();
            self.mutate("update_vm", token, |c| *c = config)
        }

        async fn delete_vm(
            &self,
            _id: &VmId,
            token: &ConcurrencyToken,
        ) -> std::result::Result<TaskHandle, ApiError> {
            self.mutate("delete_vm", token, |_| {})
        }

        async fn power_on(
            &self,
            _id: &VmId,
            token: &ConcurrencyToken,
        ) -> std::result::Result<TaskHandle, ApiError> {
            self.mutate("power_on", token, |c| c.power_state = PowerState::On)
        }

        async fn power_off(
            &self,
            _id: &VmId,
            token: &ConcurrencyToken,
        ) -> std::result::Result<TaskHandle, ApiError> {
            self.mutate("power_off", token, |c| c.power_state = PowerState::Off)
        }

        async fn create_sub_resource(
            &self,
            _id: &VmId,
            item: &SubResource,
            token: &ConcurrencyToken,
        ) -> std::result::Result<TaskHandle, ApiError> {
            let item = item.clone();
            self.mutate("create_sub_resource", token, move |c| {
                if let SubResource::Disk(mut disk) = item {
                    disk.ext_id = Some(format!("disk-{}", c.disks.len()));
                    c.disks.push(disk);
                }
            })
        }

        async fn update_sub_resource(
            &self,
            _id: &VmId,
            _ext_id: &str,
            _item: &SubResource,
            token: &ConcurrencyToken,
        ) -> std::result::Result<TaskHandle, ApiError> {
            self.mutate("update_sub_resource", token, |_| {})
        }

        async fn delete_sub_resource(
            &self,
            _id: &VmId,
            _kind: SubResourceKind,
            ext_id: &str,
            token: &ConcurrencyToken,
        ) -> std::result::Result<TaskHandle, ApiError> {
            let ext_id = ext_id.to_string();
            self.mutate("delete_sub_resource", token, move |c| {
                c.disks.retain(|d| d.ext_id.as_deref() != Some(ext_id.as_str()))
            })
        }

        async fn associate_categories(
            &self,
            _id: &VmId,
            categories: &[CategoryRef],
            token: &ConcurrencyToken,
        ) -> std::result::Result<TaskHandle, ApiError> {
            let categories = categories.to_vec();
            self.mutate("associate_categories", token, move |c| {
                c.categories.extend(categories)
            })
        }

        async fn disassociate_categories(
            &self,
            _id: &VmId,
            categories: &[CategoryRef],
            token: &ConcurrencyToken,
        ) -> std::result::Result<TaskHandle, ApiError> {
            let categories = categories.to_vec();
            self.mutate("disassociate_categories", token, move |c| {
                c.categories.retain(|cat| !categories.contains(cat))
            })
        }
    }

    #[async_trait]
    impl TaskApi for MockPlane {
        async fn get_task(&self, handle: &TaskHandle) -> std::result::Result<TaskInfo, ApiError> {
            let mut info = TaskInfo::with_status(TaskStatus::Succeeded);
            if handle.as_str() == "task-create" {
                info.entities_affected = vec!["vm-1".into()];
            }
            Ok(info)
        }
    }

    fn reconciler(plane: &Arc<MockPlane>) -> Reconciler {
        let config = ReconcileConfig::builder()
            .poll_interval(Duration::from_millis(10))
            .wait_for_ip(false)
            .build()
            .unwrap();
        Reconciler::new(plane.clone(), plane.clone(), config)
    }

    fn base() -> VmConfig {
        VmConfig::new("vm")
            .with_sockets(2)
            .with_memory_bytes(1 << 30)
            .with_disk(Disk::with_size(10).with_ext_id("disk-a"))
    }

    #[tokio::test]
    async fn test_validation_failure_makes_no_calls() {
        let plane = MockPlane::new(base());
        let r = reconciler(&plane);

        let cases = vec![
            VmConfig::new(""),
            base().with_sockets(0),
            base().with_power_state(PowerState::Paused),
            base().with_disk(Disk::default()),
            base().with_disk(Disk::with_size(5).with_ext_id("disk-a")),
            base().with_category(""),
        ];

        for desired in cases {
            let err = r.reconcile(&desired, &VmId::from("vm-1")).await.unwrap_err();
            assert!(matches!(err, CoreError::Validation(_)), "got {err:?}");
        }
        assert!(plane.calls().is_empty());
    }

    #[tokio::test]
    async fn test_no_changes_reads_once() {
        let plane = MockPlane::new(base());
        let r = reconciler(&plane);

        let live = r.reconcile(&base(), &VmId::from("vm-1")).await.unwrap();
        assert_eq!(live.config().num_sockets, Some(2));
        assert_eq!(plane.calls(), vec!["get_vm"]);
    }

    #[tokio::test]
    async fn test_hot_change_skips_power_cycle() {
        let plane = MockPlane::new(base());
        let r = reconciler(&plane);

        let desired = base().with_description("web tier");
        let live = r.reconcile(&desired, &VmId::from("vm-1")).await.unwrap();

        assert_eq!(live.config().description.as_deref(), Some("web tier"));
        assert_eq!(
            plane.calls(),
            vec!["get_vm", "get_vm", "update_vm", "get_vm"]
        );
    }

    #[tokio::test]
    async fn test_cold_change_cycles_power() {
        let plane = MockPlane::new(base());
        let r = reconciler(&plane);

        let desired = base().with_sockets(4);
        let live = r.reconcile(&desired, &VmId::from("vm-1")).await.unwrap();

        assert_eq!(live.config().num_sockets, Some(4));
        assert_eq!(live.power_state(), PowerState::On);
        let mutations: Vec<_> = plane
            .calls()
            .into_iter()
            .filter(|c| c != "get_vm")
            .collect();
        assert_eq!(mutations, vec!["power_off", "update_vm", "power_on"]);
    }

    #[tokio::test]
    async fn test_cold_change_on_stopped_vm_keeps_it_stopped() {
        let plane = MockPlane::new(base().with_power_state(PowerState::Off));
        let r = reconciler(&plane);

        let desired = base()
            .with_memory_bytes(2 << 30)
            .with_power_state(PowerState::Off);
        let live = r.reconcile(&desired, &VmId::from("vm-1")).await.unwrap();

        assert!(live.is_powered_off());
        assert!(!plane.calls().iter().any(|c| c.starts_with("power_")));
    }

    #[tokio::test]
    async fn test_power_off_is_noop_when_already_off() {
        let plane = MockPlane::new(base().with_power_state(PowerState::Off));
        let r = reconciler(&plane);

        let issued = r.power_off(&VmId::from("vm-1")).await.unwrap();
        assert!(!issued);
        assert_eq!(plane.calls(), vec!["get_vm"]);
    }

    #[tokio::test]
    async fn test_invalid_planned_add_fails_before_mutation() {
        let plane = MockPlane::new(base());
        let r = reconciler(&plane);

        // keyed, so skipped by the pre-flight check, but unknown to the VM
        let mut bad = Disk::with_size(1).with_ext_id("disk-z");
        bad.backing_info = Some(DiskBacking::VolumeGroup {
            volume_group_ext_id: String::new(),
        });
        let desired = base().with_sockets(4).with_disk(bad);

        let err = r.reconcile(&desired, &VmId::from("vm-1")).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(msg) if msg.contains("disk-z")));
        assert_eq!(plane.calls(), vec!["get_vm"]);
    }

    #[tokio::test]
    async fn test_categories_are_batched() {
        let plane = MockPlane::new(base().with_category("c-old-1").with_category("c-old-2"));
        let r = reconciler(&plane);

        let desired = base().with_category("c-new-1").with_category("c-new-2");
        let live = r.reconcile(&desired, &VmId::from("vm-1")).await.unwrap();

        assert_eq!(
            live.config().categories,
            vec![CategoryRef::new("c-new-1"), CategoryRef::new("c-new-2")]
        );
        let mutations: Vec<_> = plane
            .calls()
            .into_iter()
            .filter(|c| c != "get_vm")
            .collect();
        assert_eq!(
            mutations,
            vec!["disassociate_categories", "associate_categories"]
        );
    }

    #[tokio::test]
    async fn test_create_learns_id_from_task() {
        let plane = MockPlane::new(VmConfig::new("vm").with_power_state(PowerState::Off));
        let r = reconciler(&plane);

        let desired = VmConfig::new("vm").with_disk(Disk::with_size(1));
        let live = r.create(&desired).await.unwrap();

        assert_eq!(live.ext_id().as_str(), "vm-1");
        assert_eq!(live.power_state(), PowerState::On);
        assert_eq!(
            plane.calls(),
            vec!["create_vm", "get_vm", "power_on", "get_vm"]
        );
    }
}
