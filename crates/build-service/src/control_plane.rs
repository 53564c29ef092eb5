//! VM control plane
//!
//! The component that boots and supervises builder VMs. `Live` drives VM
//! objects through the cluster API; `Stub` keeps submissions in process and
//! simulates a boot so the service can run without a virtualization stack.

use chrono::{DateTime, Utc};
use goldenpipe_common::{ClusterError, Error, ResourceKind, Result, VmStatus, VmSummary};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::cluster::{
    ClusterApi, LabelSelector, VmCondition, VmDefinition, VmObject, APP_LABEL, APP_NAME,
};

/// Status shown on the `/vms` surface
pub fn vm_status(vm: &VmObject) -> VmStatus {
    if vm.fatal_condition().is_some() {
        VmStatus::Failed
    } else if vm.deleting {
        VmStatus::Deleting
    } else if vm.ready {
        VmStatus::Running
    } else if vm.created {
        VmStatus::Pending
    } else {
        VmStatus::Stopped
    }
}

pub fn vm_summary(vm: &VmObject) -> VmSummary {
    VmSummary {
        name: vm.name.clone(),
        image_name: vm.image_name().unwrap_or_default().to_string(),
        status: vm_status(vm),
        ip: vm.ip.clone(),
        created_at: vm.created_at,
        updated_at: Utc::now(),
        labels: vm.labels.clone(),
        cpu: vm.cpu,
        memory: vm.memory.clone(),
    }
}

fn owned_by_app(vm: &VmObject) -> bool {
    vm.labels.get(APP_LABEL).map(String::as_str) == Some(APP_NAME)
}

fn vm_not_found(name: &str) -> Error {
    Error::NotFound {
        kind: ResourceKind::VirtualMachine,
        name: name.to_string(),
    }
}

/// Control plane backed by VM objects in the cluster
pub struct LiveControlPlane {
    cluster: Arc<dyn ClusterApi>,
}

impl LiveControlPlane {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    async fn submit(&self, definition: &VmDefinition) -> Result<VmObject> {
        self.cluster
            .create_vm(definition)
            .await
            .map_err(|e| Error::provisioning(format!("submit builder VM {}", definition.name), e))
    }

    async fn get(&self, name: &str) -> Result<VmObject> {
        let vm = self
            .cluster
            .get_vm(name)
            .await
            .map_err(|e| Error::lookup(format!("get virtual machine {}", name), e))?;

        if !owned_by_app(&vm) {
            return Err(vm_not_found(name));
        }
        Ok(vm)
    }

    async fn list(&self) -> Result<Vec<VmObject>> {
        self.cluster
            .list_vms(&LabelSelector::app())
            .await
            .map_err(|e| Error::lookup("list virtual machines", e))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.cluster
            .delete_vm(name)
            .await
            .map_err(|e| Error::provisioning(format!("delete virtual machine {}", name), e))
    }

    async fn health(&self) -> Result<()> {
        self.cluster.vm_api_available().await.map_err(|e| {
            Error::ExternalUnavailable(format!("VM control plane not available: {}", e))
        })
    }
}

struct StubVm {
    definition: VmDefinition,
    submitted_at: Instant,
    created_at: DateTime<Utc>,
    conditions: Vec<VmCondition>,
}

#[derive(Default)]
struct StubState {
    vms: BTreeMap<String, StubVm>,
    rejection: Option<String>,
}

/// In-process control plane. VMs report created on submission and ready
/// once `ready_after` has elapsed.
pub struct StubControlPlane {
    ready_after: Duration,
    state: Mutex<StubState>,
}

impl StubControlPlane {
    pub fn new(ready_after: Duration) -> Self {
        Self {
            ready_after,
            state: Mutex::new(StubState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reject every later submission with `message`
    pub fn reject_submissions(&self, message: impl Into<String>) {
        self.lock().rejection = Some(message.into());
    }

    pub fn accept_submissions(&self) {
        self.lock().rejection = None;
    }

    /// Attach a fatal failure condition to a submitted VM
    pub fn inject_failure(&self, name: &str, message: impl Into<String>) -> bool {
        match self.lock().vms.get_mut(name) {
            Some(vm) => {
                vm.conditions.push(VmCondition::failure(message));
                true
            }
            None => false,
        }
    }

    fn observe(&self, vm: &StubVm) -> VmObject {
        let mut object = VmObject::submitted(&vm.definition);
        object.created_at = vm.created_at;
        object.created = true;
        object.ready = vm.submitted_at.elapsed() >= self.ready_after;
        object.conditions = vm.conditions.clone();
        object
    }

    fn submit(&self, definition: &VmDefinition) -> Result<VmObject> {
        let mut state = self.lock();
        if let Some(message) = &state.rejection {
            return Err(Error::Provisioning {
                operation: format!("submit builder VM {}", definition.name),
                source: ClusterError::Api(message.clone()),
            });
        }
        if state.vms.contains_key(&definition.name) {
            return Err(Error::Conflict(format!(
                "virtual machine {} already exists",
                definition.name
            )));
        }

        let vm = StubVm {
            definition: definition.clone(),
            submitted_at: Instant::now(),
            created_at: Utc::now(),
            conditions: Vec::new(),
        };
        let object = self.observe(&vm);
        state.vms.insert(definition.name.clone(), vm);

        debug!("Stub control plane accepted {}", definition.name);
        Ok(object)
    }

    fn get(&self, name: &str) -> Result<VmObject> {
        let state = self.lock();
        state
            .vms
            .get(name)
            .map(|vm| self.observe(vm))
            .ok_or_else(|| vm_not_found(name))
    }

    fn list(&self) -> Vec<VmObject> {
        self.lock().vms.values().map(|vm| self.observe(vm)).collect()
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.lock()
            .vms
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| vm_not_found(name))
    }
}

/// Control plane variant, chosen at construction
pub enum VmControlPlane {
    Stub(StubControlPlane),
    Live(LiveControlPlane),
}

impl VmControlPlane {
    pub fn stub(ready_after: Duration) -> Self {
        VmControlPlane::Stub(StubControlPlane::new(ready_after))
    }

    pub fn live(cluster: Arc<dyn ClusterApi>) -> Self {
        VmControlPlane::Live(LiveControlPlane::new(cluster))
    }

    pub fn variant(&self) -> &'static str {
        match self {
            VmControlPlane::Stub(_) => "stub",
            VmControlPlane::Live(_) => "live",
        }
    }

    pub fn as_stub(&self) -> Option<&StubControlPlane> {
        match self {
            VmControlPlane::Stub(stub) => Some(stub),
            VmControlPlane::Live(_) => None,
        }
    }

    pub async fn submit(&self, definition: &VmDefinition) -> Result<VmObject> {
        let vm = match self {
            VmControlPlane::Stub(stub) => stub.submit(definition)?,
            VmControlPlane::Live(live) => live.submit(definition).await?,
        };
        info!("Submitted builder VM {}", definition.name);
        Ok(vm)
    }

    pub async fn get(&self, name: &str) -> Result<VmObject> {
        match self {
            VmControlPlane::Stub(stub) => stub.get(name),
            VmControlPlane::Live(live) => live.get(name).await,
        }
    }

    /// VMs labelled with the app
    pub async fn list(&self) -> Result<Vec<VmObject>> {
        match self {
            VmControlPlane::Stub(stub) => Ok(stub.list()),
            VmControlPlane::Live(live) => live.list().await,
        }
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        match self {
            VmControlPlane::Stub(stub) => stub.delete(name)?,
            VmControlPlane::Live(live) => live.delete(name).await?,
        }
        info!("Deleted virtual machine {}", name);
        Ok(())
    }

    pub async fn health(&self) -> Result<()> {
        match self {
            VmControlPlane::Stub(_) => Ok(()),
            VmControlPlane::Live(live) => live.health().await,
        }
    }
}
