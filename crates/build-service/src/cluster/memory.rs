//! In-process cluster for standalone development and tests
//!
//! Objects live in maps behind a mutex. Every call is appended to a call log
//! so tests can assert on exactly what was touched, and individual operations
//! can be made to fail.

use async_trait::async_trait;
use goldenpipe_common::{ClusterError, ResourceKind};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::{
    ClusterApi, ClusterResult, LabelSelector, RecordObject, VmDefinition, VmObject, VolumeClaim,
    VolumeClaimSpec, VolumePhase,
};

/// Cluster operation, as recorded in the call log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateVolume,
    GetVolume,
    ListVolumes,
    DeleteVolume,
    PutRecord,
    GetRecord,
    ListRecords,
    DeleteRecord,
    CreateVm,
    GetVm,
    ListVms,
    DeleteVm,
    Ping,
    VmApi,
}

impl Operation {
    pub fn is_volume(&self) -> bool {
        matches!(
            self,
            Operation::CreateVolume
                | Operation::GetVolume
                | Operation::ListVolumes
                | Operation::DeleteVolume
        )
    }

    pub fn is_vm(&self) -> bool {
        matches!(
            self,
            Operation::CreateVm | Operation::GetVm | Operation::ListVms | Operation::DeleteVm
        )
    }
}

/// Most recent calls kept in the call log; older entries are dropped.
pub const CALL_LOG_CAPACITY: usize = 1024;

/// One entry of the call log. `target` is the object name, or the rendered
/// selector for list calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterCall {
    pub operation: Operation,
    pub target: String,
}

#[derive(Debug, Clone)]
enum Fault {
    Api(String),
    Unavailable(String),
}

struct VmEntry {
    definition: VmDefinition,
    object: VmObject,
}

struct State {
    volumes: BTreeMap<String, VolumeClaim>,
    records: BTreeMap<String, RecordObject>,
    vms: BTreeMap<String, VmEntry>,
    faults: HashMap<Operation, Fault>,
    unreachable: bool,
    auto_bind: bool,
    calls: VecDeque<ClusterCall>,
}

/// Cluster held entirely in memory
pub struct InMemoryCluster {
    state: Mutex<State>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    /// Empty cluster whose volumes bind as soon as they are created
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                volumes: BTreeMap::new(),
                records: BTreeMap::new(),
                vms: BTreeMap::new(),
                faults: HashMap::new(),
                unreachable: false,
                auto_bind: true,
                calls: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every future call of `operation` fail with an API error
    pub fn fail(&self, operation: Operation, message: impl Into<String>) {
        self.lock()
            .faults
            .insert(operation, Fault::Api(message.into()));
    }

    /// Make every future call of `operation` fail as if the cluster were down
    pub fn fail_unavailable(&self, operation: Operation, message: impl Into<String>) {
        self.lock()
            .faults
            .insert(operation, Fault::Unavailable(message.into()));
    }

    pub fn clear_failure(&self, operation: Operation) {
        self.lock().faults.remove(&operation);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Whether newly created volumes start out bound
    pub fn set_auto_bind(&self, auto_bind: bool) {
        self.lock().auto_bind = auto_bind;
    }

    /// Move a volume to `phase`, reporting its capacity once bound
    pub fn bind_volume(&self, name: &str, phase: VolumePhase) -> bool {
        let mut state = self.lock();
        match state.volumes.get_mut(name) {
            Some(claim) => {
                claim.phase = phase;
                if phase == VolumePhase::Bound {
                    claim.capacity = Some(claim.requested.clone());
                }
                true
            }
            None => false,
        }
    }

    /// Mutate a stored VM in place, as the control plane would
    pub fn update_vm(&self, name: &str, update: impl FnOnce(&mut VmObject)) -> bool {
        let mut state = self.lock();
        match state.vms.get_mut(name) {
            Some(entry) => {
                update(&mut entry.object);
                true
            }
            None => false,
        }
    }

    /// Definition a VM was submitted with
    pub fn vm_definition(&self, name: &str) -> Option<VmDefinition> {
        self.lock().vms.get(name).map(|e| e.definition.clone())
    }

    pub fn volume(&self, name: &str) -> Option<VolumeClaim> {
        self.lock().volumes.get(name).cloned()
    }

    pub fn vm_names(&self) -> Vec<String> {
        self.lock().vms.keys().cloned().collect()
    }

    /// Logged calls made for `operation`, oldest first
    pub fn calls(&self, operation: Operation) -> Vec<ClusterCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .cloned()
            .collect()
    }

    pub fn all_calls(&self) -> Vec<ClusterCall> {
        self.lock().calls.iter().cloned().collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Log the call and apply any injected failure
    fn enter(&self, operation: Operation, target: &str) -> ClusterResult<MutexGuard<'_, State>> {
        let mut state = self.lock();
        if state.calls.len() == CALL_LOG_CAPACITY {
            state.calls.pop_front();
        }
        state.calls.push_back(ClusterCall {
            operation,
            target: target.to_string(),
        });
        debug!("In-memory cluster: {:?} {}", operation, target);

        if state.unreachable {
            return Err(ClusterError::Unavailable(
                "in-memory cluster marked unreachable".to_string(),
            ));
        }

        match state.faults.get(&operation) {
            Some(Fault::Api(message)) => Err(ClusterError::Api(message.clone())),
            Some(Fault::Unavailable(message)) => Err(ClusterError::Unavailable(message.clone())),
            None => Ok(state),
        }
    }
}

fn not_found(kind: ResourceKind, name: &str) -> ClusterError {
    ClusterError::NotFound {
        kind,
        name: name.to_string(),
    }
}

fn already_exists(kind: ResourceKind, name: &str) -> ClusterError {
    ClusterError::AlreadyExists {
        kind,
        name: name.to_string(),
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn create_volume(&self, spec: &VolumeClaimSpec) -> ClusterResult<VolumeClaim> {
        let mut state = self.enter(Operation::CreateVolume, &spec.name)?;
        if state.volumes.contains_key(&spec.name) {
            return Err(already_exists(ResourceKind::Volume, &spec.name));
        }

        let bound = state.auto_bind;
        let claim = VolumeClaim {
            name: spec.name.clone(),
            labels: spec.labels.clone(),
            requested: spec.size.clone(),
            capacity: bound.then(|| spec.size.clone()),
            phase: if bound {
                VolumePhase::Bound
            } else {
                VolumePhase::Pending
            },
        };
        state.volumes.insert(spec.name.clone(), claim.clone());
        Ok(claim)
    }

    async fn get_volume(&self, name: &str) -> ClusterResult<VolumeClaim> {
        let state = self.enter(Operation::GetVolume, name)?;
        state
            .volumes
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(ResourceKind::Volume, name))
    }

    async fn list_volumes(&self, selector: &LabelSelector) -> ClusterResult<Vec<VolumeClaim>> {
        let state = self.enter(Operation::ListVolumes, &selector.to_string())?;
        Ok(state
            .volumes
            .values()
            .filter(|v| selector.matches(&v.labels))
            .cloned()
            .collect())
    }

    async fn delete_volume(&self, name: &str) -> ClusterResult<()> {
        let mut state = self.enter(Operation::DeleteVolume, name)?;
        state
            .volumes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found(ResourceKind::Volume, name))
    }

    async fn put_record(&self, record: &RecordObject) -> ClusterResult<()> {
        let mut state = self.enter(Operation::PutRecord, &record.name)?;
        state.records.insert(record.name.clone(), record.clone());
        Ok(())
    }

    async fn get_record(&self, name: &str) -> ClusterResult<RecordObject> {
        let state = self.enter(Operation::GetRecord, name)?;
        state
            .records
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(ResourceKind::Record, name))
    }

    async fn list_records(&self, selector: &LabelSelector) -> ClusterResult<Vec<RecordObject>> {
        let state = self.enter(Operation::ListRecords, &selector.to_string())?;
        Ok(state
            .records
            .values()
            .filter(|r| selector.matches(&r.labels))
            .cloned()
            .collect())
    }

    async fn delete_record(&self, name: &str) -> ClusterResult<()> {
        let mut state = self.enter(Operation::DeleteRecord, name)?;
        state
            .records
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found(ResourceKind::Record, name))
    }

    async fn create_vm(&self, definition: &VmDefinition) -> ClusterResult<VmObject> {
        let mut state = self.enter(Operation::CreateVm, &definition.name)?;
        if state.vms.contains_key(&definition.name) {
            return Err(already_exists(ResourceKind::VirtualMachine, &definition.name));
        }

        let object = VmObject::submitted(definition);
        state.vms.insert(
            definition.name.clone(),
            VmEntry {
                definition: definition.clone(),
                object: object.clone(),
            },
        );
        Ok(object)
    }

    async fn get_vm(&self, name: &str) -> ClusterResult<VmObject> {
        let state = self.enter(Operation::GetVm, name)?;
        state
            .vms
            .get(name)
            .map(|e| e.object.clone())
            .ok_or_else(|| not_found(ResourceKind::VirtualMachine, name))
    }

    async fn list_vms(&self, selector: &LabelSelector) -> ClusterResult<Vec<VmObject>> {
        let state = self.enter(Operation::ListVms, &selector.to_string())?;
        Ok(state
            .vms
            .values()
            .filter(|e| selector.matches(&e.object.labels))
            .map(|e| e.object.clone())
            .collect())
    }

    async fn delete_vm(&self, name: &str) -> ClusterResult<()> {
        let mut state = self.enter(Operation::DeleteVm, name)?;
        state
            .vms
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found(ResourceKind::VirtualMachine, name))
    }

    async fn ping(&self) -> ClusterResult<()> {
        self.enter(Operation::Ping, "nodes").map(|_| ())
    }

    async fn vm_api_available(&self) -> ClusterResult<()> {
        self.enter(Operation::VmApi, "virtualmachines").map(|_| ())
    }
}
