//! Live Kubernetes/KubeVirt backend
//!
//! Volume claims are PersistentVolumeClaims, records are ConfigMaps and VM
//! objects are KubeVirt `VirtualMachine`s handled as dynamic objects.

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use goldenpipe_common::{ClusterError, OsType, ResourceKind};
use k8s_openapi::api::core::v1::{
    ConfigMap, Node, PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::{ApiResource, GroupVersionKind};
use kube::Client;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use super::{
    ClusterApi, ClusterResult, LabelSelector, Labels, RecordObject, VmCondition, VmDefinition,
    VmObject, VolumeClaim, VolumeClaimSpec, VolumePhase,
};

const STORAGE_RESOURCE: &str = "storage";
const KUBEVIRT_GROUP: &str = "kubevirt.io";
const KUBEVIRT_VERSION: &str = "v1";

/// Cluster reached through a kube client
pub struct KubeCluster {
    namespace: String,
    storage_class: String,
    client: Client,
    volumes: Api<PersistentVolumeClaim>,
    records: Api<ConfigMap>,
    vms: Api<DynamicObject>,
    instances: Api<DynamicObject>,
    vm_resource: ApiResource,
}

impl KubeCluster {
    /// Build a client from `kubeconfig`, or from the in-cluster
    /// environment / default kubeconfig when no path is given
    pub async fn connect(
        kubeconfig: Option<&str>,
        namespace: &str,
        storage_class: &str,
    ) -> anyhow::Result<Self> {
        let config = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .with_context(|| format!("Failed to read kubeconfig {}", path))?;
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .context("Failed to load kubeconfig")?
            }
            None => kube::Config::infer()
                .await
                .context("Failed to infer Kubernetes config")?,
        };

        let client = Client::try_from(config).context("Failed to create Kubernetes client")?;
        info!("Connected to Kubernetes API, namespace {}", namespace);

        Ok(Self::new(client, namespace, storage_class))
    }

    pub fn new(client: Client, namespace: &str, storage_class: &str) -> Self {
        let vm_resource = ApiResource::from_gvk(&GroupVersionKind::gvk(
            KUBEVIRT_GROUP,
            KUBEVIRT_VERSION,
            "VirtualMachine",
        ));
        let instance_resource = ApiResource::from_gvk(&GroupVersionKind::gvk(
            KUBEVIRT_GROUP,
            KUBEVIRT_VERSION,
            "VirtualMachineInstance",
        ));

        Self {
            namespace: namespace.to_string(),
            storage_class: storage_class.to_string(),
            volumes: Api::namespaced(client.clone(), namespace),
            records: Api::namespaced(client.clone(), namespace),
            vms: Api::namespaced_with(client.clone(), namespace, &vm_resource),
            instances: Api::namespaced_with(client.clone(), namespace, &instance_resource),
            client,
            vm_resource,
        }
    }

    /// First reported interface address of the VM's running instance
    async fn instance_ips(&self, selector: &LabelSelector) -> HashMap<String, String> {
        let params = ListParams::default().labels(&selector.to_string());
        match self.instances.list(&params).await {
            Ok(list) => list
                .items
                .into_iter()
                .filter_map(|vmi| {
                    let ip = first_interface_ip(&vmi.data)?;
                    Some((vmi.metadata.name?, ip))
                })
                .collect(),
            Err(e) => {
                debug!("Failed to list VM instances: {}", e);
                HashMap::new()
            }
        }
    }
}

/// Map a kube client error onto the cluster error taxonomy
pub fn map_kube_error(kind: ResourceKind, name: &str, err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(response) if response.code == 404 => ClusterError::NotFound {
            kind,
            name: name.to_string(),
        },
        kube::Error::Api(response) if response.code == 409 => ClusterError::AlreadyExists {
            kind,
            name: name.to_string(),
        },
        kube::Error::Api(response) => ClusterError::Api(format!(
            "{} ({}, {})",
            response.message, response.reason, response.code
        )),
        kube::Error::SerdeError(e) => ClusterError::Serialization(e),
        other => ClusterError::Unavailable(other.to_string()),
    }
}

fn object_meta(name: &str, namespace: &str, labels: &Labels) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels.clone()),
        ..Default::default()
    }
}

fn volume_from_claim(pvc: PersistentVolumeClaim) -> VolumeClaim {
    let requested = pvc
        .spec
        .as_ref()
        .and_then(|spec| spec.resources.as_ref())
        .and_then(|resources| resources.requests.as_ref())
        .and_then(|requests| requests.get(STORAGE_RESOURCE))
        .map(|q| q.0.clone())
        .unwrap_or_default();

    let status = pvc.status.unwrap_or_default();

    VolumeClaim {
        name: pvc.metadata.name.unwrap_or_default(),
        labels: pvc.metadata.labels.unwrap_or_default(),
        requested,
        capacity: status
            .capacity
            .and_then(|capacity| capacity.get(STORAGE_RESOURCE).map(|q| q.0.clone())),
        phase: VolumePhase::parse(status.phase.as_deref().unwrap_or("Pending")),
    }
}

fn record_from_config_map(cm: ConfigMap) -> RecordObject {
    RecordObject {
        name: cm.metadata.name.unwrap_or_default(),
        labels: cm.metadata.labels.unwrap_or_default(),
        data: cm.data.unwrap_or_default(),
    }
}

/// Body of a KubeVirt `VirtualMachine` for a builder VM. Name and labels
/// go on the object metadata.
pub fn vm_manifest(definition: &VmDefinition, storage_class: &str) -> Value {
    let root_volume = format!("{}-rootdisk", definition.name);
    let bus = match definition.os_type {
        OsType::Linux => "virtio",
        OsType::Windows => "sata",
    };

    let mut cloud_init = json!({ "userDataBase64": definition.payload.user_data });
    if let Some(network_data) = &definition.payload.network_data {
        cloud_init["networkDataBase64"] = json!(network_data);
    }

    json!({
        "spec": {
            "runStrategy": "Once",
            "dataVolumeTemplates": [{
                "metadata": { "name": root_volume },
                "spec": {
                    "source": { "http": { "url": definition.base_image_url } },
                    "storage": {
                        "accessModes": ["ReadWriteOnce"],
                        "storageClassName": storage_class,
                        "resources": { "requests": { "storage": definition.os_disk_size } },
                    },
                },
            }],
            "template": {
                "metadata": { "labels": definition.labels },
                "spec": {
                    "domain": {
                        "cpu": { "cores": definition.cpu },
                        "memory": { "guest": definition.memory },
                        "devices": {
                            "disks": [
                                { "name": "rootdisk", "disk": { "bus": bus } },
                                { "name": "imagedisk", "disk": { "bus": bus } },
                                { "name": "cloudinitdisk", "disk": { "bus": "virtio" } },
                            ],
                            "interfaces": [{ "name": "default", "masquerade": {} }],
                        },
                    },
                    "networks": [{ "name": "default", "pod": {} }],
                    "volumes": [
                        { "name": "rootdisk", "dataVolume": { "name": root_volume } },
                        {
                            "name": "imagedisk",
                            "persistentVolumeClaim": { "claimName": definition.image_volume },
                        },
                        { "name": "cloudinitdisk", "cloudInitNoCloud": cloud_init },
                    ],
                },
            },
        },
    })
}

fn first_interface_ip(data: &Value) -> Option<String> {
    data.pointer("/status/interfaces/0/ipAddress")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Read the fields the service cares about off a `VirtualMachine` object
pub fn vm_from_object(obj: &DynamicObject) -> VmObject {
    let status = obj.data.get("status");
    let flag = |key: &str| {
        status
            .and_then(|s| s.get(key))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    };

    let conditions = status
        .and_then(|s| s.get("conditions"))
        .and_then(|c| serde_json::from_value::<Vec<VmCondition>>(c.clone()).ok())
        .unwrap_or_default();

    let domain = obj.data.pointer("/spec/template/spec/domain");

    VmObject {
        name: obj.metadata.name.clone().unwrap_or_default(),
        labels: obj.metadata.labels.clone().unwrap_or_default(),
        cpu: domain
            .and_then(|d| d.pointer("/cpu/cores"))
            .and_then(Value::as_u64)
            .and_then(|cores| u32::try_from(cores).ok()),
        memory: domain
            .and_then(|d| d.pointer("/memory/guest"))
            .and_then(Value::as_str)
            .map(str::to_string),
        created_at: obj
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .unwrap_or_else(Utc::now),
        created: flag("created"),
        ready: flag("ready"),
        deleting: obj.metadata.deletion_timestamp.is_some(),
        conditions,
        ip: None,
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn create_volume(&self, spec: &VolumeClaimSpec) -> ClusterResult<VolumeClaim> {
        let pvc = PersistentVolumeClaim {
            metadata: object_meta(&spec.name, &self.namespace, &spec.labels),
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: Some(spec.storage_class.clone()),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        STORAGE_RESOURCE.to_string(),
                        Quantity(spec.size.clone()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.volumes
            .create(&PostParams::default(), &pvc)
            .await
            .map(volume_from_claim)
            .map_err(|e| map_kube_error(ResourceKind::Volume, &spec.name, e))
    }

    async fn get_volume(&self, name: &str) -> ClusterResult<VolumeClaim> {
        self.volumes
            .get(name)
            .await
            .map(volume_from_claim)
            .map_err(|e| map_kube_error(ResourceKind::Volume, name, e))
    }

    async fn list_volumes(&self, selector: &LabelSelector) -> ClusterResult<Vec<VolumeClaim>> {
        let params = ListParams::default().labels(&selector.to_string());
        let list = self
            .volumes
            .list(&params)
            .await
            .map_err(|e| map_kube_error(ResourceKind::Volume, "", e))?;
        Ok(list.items.into_iter().map(volume_from_claim).collect())
    }

    async fn delete_volume(&self, name: &str) -> ClusterResult<()> {
        self.volumes
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_kube_error(ResourceKind::Volume, name, e))
    }

    async fn put_record(&self, record: &RecordObject) -> ClusterResult<()> {
        let cm = ConfigMap {
            metadata: object_meta(&record.name, &self.namespace, &record.labels),
            data: Some(record.data.clone()),
            ..Default::default()
        };

        match self.records.create(&PostParams::default(), &cm).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 409 => self
                .records
                .replace(&record.name, &PostParams::default(), &cm)
                .await
                .map(|_| ())
                .map_err(|e| map_kube_error(ResourceKind::Record, &record.name, e)),
            Err(e) => Err(map_kube_error(ResourceKind::Record, &record.name, e)),
        }
    }

    async fn get_record(&self, name: &str) -> ClusterResult<RecordObject> {
        self.records
            .get(name)
            .await
            .map(record_from_config_map)
            .map_err(|e| map_kube_error(ResourceKind::Record, name, e))
    }

    async fn list_records(&self, selector: &LabelSelector) -> ClusterResult<Vec<RecordObject>> {
        let params = ListParams::default().labels(&selector.to_string());
        let list = self
            .records
            .list(&params)
            .await
            .map_err(|e| map_kube_error(ResourceKind::Record, "", e))?;
        Ok(list.items.into_iter().map(record_from_config_map).collect())
    }

    async fn delete_record(&self, name: &str) -> ClusterResult<()> {
        self.records
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_kube_error(ResourceKind::Record, name, e))
    }

    async fn create_vm(&self, definition: &VmDefinition) -> ClusterResult<VmObject> {
        let mut obj = DynamicObject::new(&definition.name, &self.vm_resource)
            .within(&self.namespace)
            .data(vm_manifest(definition, &self.storage_class));
        obj.metadata.labels = Some(definition.labels.clone());

        self.vms
            .create(&PostParams::default(), &obj)
            .await
            .map(|created| vm_from_object(&created))
            .map_err(|e| map_kube_error(ResourceKind::VirtualMachine, &definition.name, e))
    }

    async fn get_vm(&self, name: &str) -> ClusterResult<VmObject> {
        let obj = self
            .vms
            .get(name)
            .await
            .map_err(|e| map_kube_error(ResourceKind::VirtualMachine, name, e))?;

        let mut vm = vm_from_object(&obj);
        vm.ip = match self.instances.get_opt(name).await {
            Ok(Some(vmi)) => first_interface_ip(&vmi.data),
            _ => None,
        };
        Ok(vm)
    }

    async fn list_vms(&self, selector: &LabelSelector) -> ClusterResult<Vec<VmObject>> {
        let params = ListParams::default().labels(&selector.to_string());
        let list = self
            .vms
            .list(&params)
            .await
            .map_err(|e| map_kube_error(ResourceKind::VirtualMachine, "", e))?;

        let ips = self.instance_ips(selector).await;
        Ok(list
            .items
            .iter()
            .map(|obj| {
                let mut vm = vm_from_object(obj);
                vm.ip = ips.get(&vm.name).cloned();
                vm
            })
            .collect())
    }

    async fn delete_vm(&self, name: &str) -> ClusterResult<()> {
        self.vms
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_kube_error(ResourceKind::VirtualMachine, name, e))
    }

    async fn ping(&self) -> ClusterResult<()> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        nodes
            .list(&ListParams::default().limit(1))
            .await
            .map(|_| ())
            .map_err(|e| map_kube_error(ResourceKind::Node, "", e))
    }

    async fn vm_api_available(&self) -> ClusterResult<()> {
        self.vms
            .list(&ListParams::default().limit(1))
            .await
            .map(|_| ())
            .map_err(|e| map_kube_error(ResourceKind::VirtualMachine, "", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use goldenpipe_common::BuildRequest;
    use provisioning_config::ProvisioningPayload;

    fn definition(os_type: OsType, network: Option<&str>) -> VmDefinition {
        let req = BuildRequest::new("web01", os_type, "https://iso.example/ubuntu.iso");
        VmDefinition::builder_vm(
            &req,
            "golden-image-web01-1a2b3c4d",
            "golden-image-web01",
            ProvisioningPayload {
                user_data: "dXNlcg==".to_string(),
                network_data: network.map(str::to_string),
            },
        )
    }

    #[test]
    fn test_manifest_wires_disks_and_payload() {
        let manifest = vm_manifest(&definition(OsType::Linux, Some("bmV0")), "rook-ceph-block");

        assert_eq!(manifest["spec"]["runStrategy"], "Once");
        let spec = &manifest["spec"]["template"]["spec"];
        assert_eq!(spec["domain"]["cpu"]["cores"], 2);
        assert_eq!(spec["domain"]["memory"]["guest"], "4Gi");
        assert_eq!(
            spec["volumes"][1]["persistentVolumeClaim"]["claimName"],
            "golden-image-web01"
        );
        assert_eq!(
            spec["volumes"][2]["cloudInitNoCloud"]["userDataBase64"],
            "dXNlcg=="
        );
        assert_eq!(
            spec["volumes"][2]["cloudInitNoCloud"]["networkDataBase64"],
            "bmV0"
        );

        let template = &manifest["spec"]["dataVolumeTemplates"][0];
        assert_eq!(
            template["spec"]["source"]["http"]["url"],
            "https://iso.example/ubuntu.iso"
        );
        assert_eq!(
            template["spec"]["storage"]["resources"]["requests"]["storage"],
            "20Gi"
        );
        assert_eq!(
            manifest["spec"]["template"]["metadata"]["labels"]["goldenpipe.io/purpose"],
            "builder-vm"
        );
    }

    #[test]
    fn test_windows_manifest_has_no_network_data() {
        let manifest = vm_manifest(&definition(OsType::Windows, None), "rook-ceph-block");
        let cloud_init = &manifest["spec"]["template"]["spec"]["volumes"][2]["cloudInitNoCloud"];

        assert!(cloud_init.get("networkDataBase64").is_none());
        assert_eq!(
            manifest["spec"]["template"]["metadata"]["labels"]["goldenpipe.io/os"],
            "windows"
        );
        assert_eq!(
            manifest["spec"]["template"]["spec"]["domain"]["cpu"]["cores"],
            4
        );
    }

    #[test]
    fn test_vm_state_read_from_object() {
        let resource = ApiResource::from_gvk(&GroupVersionKind::gvk(
            KUBEVIRT_GROUP,
            KUBEVIRT_VERSION,
            "VirtualMachine",
        ));
        let obj = DynamicObject::new("golden-image-web01-1a2b3c4d", &resource).data(json!({
            "spec": { "template": { "spec": { "domain": {
                "cpu": { "cores": 2 },
                "memory": { "guest": "4Gi" },
            }}}},
            "status": {
                "created": true,
                "ready": false,
                "conditions": [
                    { "type": "Ready", "status": "False", "reason": "Starting" },
                    { "type": "Failure", "status": "True", "message": "image import failed" },
                ],
            },
        }));

        let vm = vm_from_object(&obj);
        assert!(vm.created);
        assert!(!vm.ready);
        assert!(!vm.deleting);
        assert_eq!(vm.cpu, Some(2));
        assert_eq!(vm.memory.as_deref(), Some("4Gi"));
        assert_eq!(
            vm.fatal_condition().map(VmCondition::text).as_deref(),
            Some("image import failed")
        );
    }
}
