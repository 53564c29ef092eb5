//! Cluster resource API seam
//!
//! Volume claims, metadata records and VM objects are created, read, listed
//! and deleted through [`ClusterApi`]. [`KubeCluster`] talks to a live
//! Kubernetes/KubeVirt cluster; [`InMemoryCluster`] keeps everything in
//! process for standalone development and tests.

pub mod live;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use goldenpipe_common::{BuildRequest, ClusterError, OsType};
use provisioning_config::ProvisioningPayload;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub use live::KubeCluster;
pub use memory::{ClusterCall, InMemoryCluster, Operation};

pub const APP_LABEL: &str = "app";
pub const APP_NAME: &str = "goldenpipe";
pub const PURPOSE_LABEL: &str = "goldenpipe.io/purpose";
pub const IMAGE_LABEL: &str = "goldenpipe.io/image";
pub const OS_LABEL: &str = "goldenpipe.io/os";

pub const PURPOSE_GOLDEN_IMAGE: &str = "golden-image";
pub const PURPOSE_METADATA: &str = "image-metadata";
pub const PURPOSE_BUILDER_VM: &str = "builder-vm";

pub type Labels = BTreeMap<String, String>;

pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Labels shared by every object this service creates
pub fn object_labels(purpose: &str, image: &str) -> Labels {
    Labels::from([
        (APP_LABEL.to_string(), APP_NAME.to_string()),
        (PURPOSE_LABEL.to_string(), purpose.to_string()),
        (IMAGE_LABEL.to_string(), image.to_string()),
    ])
}

/// Equality-based label selector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector(Labels);

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything this service owns
    pub fn app() -> Self {
        Self::new().with(APP_LABEL, APP_NAME)
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.0
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        f.write_str(&parts.join(","))
    }
}

/// Volume claim to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeClaimSpec {
    pub name: String,
    pub size: String,
    pub storage_class: String,
    pub labels: Labels,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumePhase {
    Pending,
    Bound,
    Lost,
}

impl VolumePhase {
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Bound" => VolumePhase::Bound,
            "Lost" => VolumePhase::Lost,
            _ => VolumePhase::Pending,
        }
    }
}

/// Volume claim as observed in the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeClaim {
    pub name: String,
    pub labels: Labels,
    pub requested: String,
    pub capacity: Option<String>,
    pub phase: VolumePhase,
}

/// Labelled string map holding persisted data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordObject {
    pub name: String,
    pub labels: Labels,
    pub data: BTreeMap<String, String>,
}

/// Builder VM submitted to the control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmDefinition {
    pub name: String,
    pub image_name: String,
    pub os_type: OsType,
    pub labels: Labels,
    pub cpu: u32,
    pub memory: String,
    /// OS disk source
    pub base_image_url: String,
    pub os_disk_size: String,
    /// Claim the image is written to
    pub image_volume: String,
    pub payload: ProvisioningPayload,
}

impl VmDefinition {
    pub fn builder_vm(
        req: &BuildRequest,
        vm_name: &str,
        image_volume: &str,
        payload: ProvisioningPayload,
    ) -> Self {
        let mut labels = object_labels(PURPOSE_BUILDER_VM, &req.name);
        labels.insert(OS_LABEL.to_string(), req.os_type.to_string());

        Self {
            name: vm_name.to_string(),
            image_name: req.name.clone(),
            os_type: req.os_type,
            labels,
            cpu: req.resolved_cpu(),
            memory: req.resolved_memory(),
            base_image_url: req.base_iso_url.clone(),
            os_disk_size: req.resolved_storage_size(),
            image_volume: image_volume.to_string(),
            payload,
        }
    }
}

/// Condition reported on a VM object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmCondition {
    #[serde(rename = "type")]
    pub condition_type: String,

    #[serde(default)]
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl VmCondition {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            condition_type: "Failure".to_string(),
            status: "True".to_string(),
            reason: None,
            message: Some(message.into()),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.condition_type == "Failure" && self.status == "True"
    }

    /// Message, falling back to the reason
    pub fn text(&self) -> String {
        self.message
            .clone()
            .or_else(|| self.reason.clone())
            .unwrap_or_else(|| self.condition_type.clone())
    }
}

/// VM object as observed in the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmObject {
    pub name: String,
    pub labels: Labels,
    pub cpu: Option<u32>,
    pub memory: Option<String>,
    pub created_at: DateTime<Utc>,
    pub created: bool,
    pub ready: bool,
    pub deleting: bool,
    pub conditions: Vec<VmCondition>,
    pub ip: Option<String>,
}

impl VmObject {
    /// Freshly submitted object, nothing scheduled yet
    pub fn submitted(definition: &VmDefinition) -> Self {
        Self {
            name: definition.name.clone(),
            labels: definition.labels.clone(),
            cpu: Some(definition.cpu),
            memory: Some(definition.memory.clone()),
            created_at: Utc::now(),
            created: false,
            ready: false,
            deleting: false,
            conditions: Vec::new(),
            ip: None,
        }
    }

    pub fn fatal_condition(&self) -> Option<&VmCondition> {
        self.conditions.iter().find(|c| c.is_fatal())
    }

    pub fn image_name(&self) -> Option<&str> {
        self.labels.get(IMAGE_LABEL).map(String::as_str)
    }
}

/// Create/get/list/delete access to the objects a build needs
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn create_volume(&self, spec: &VolumeClaimSpec) -> ClusterResult<VolumeClaim>;
    async fn get_volume(&self, name: &str) -> ClusterResult<VolumeClaim>;
    async fn list_volumes(&self, selector: &LabelSelector) -> ClusterResult<Vec<VolumeClaim>>;
    async fn delete_volume(&self, name: &str) -> ClusterResult<()>;

    /// Create the record, replacing it if one with the same name exists
    async fn put_record(&self, record: &RecordObject) -> ClusterResult<()>;
    async fn get_record(&self, name: &str) -> ClusterResult<RecordObject>;
    async fn list_records(&self, selector: &LabelSelector) -> ClusterResult<Vec<RecordObject>>;
    async fn delete_record(&self, name: &str) -> ClusterResult<()>;

    async fn create_vm(&self, definition: &VmDefinition) -> ClusterResult<VmObject>;
    async fn get_vm(&self, name: &str) -> ClusterResult<VmObject>;
    async fn list_vms(&self, selector: &LabelSelector) -> ClusterResult<Vec<VmObject>>;
    async fn delete_vm(&self, name: &str) -> ClusterResult<()>;

    /// Cluster reachability
    async fn ping(&self) -> ClusterResult<()>;

    /// Whether the VM object API is served
    async fn vm_api_available(&self) -> ClusterResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_renders_sorted_pairs() {
        let selector = LabelSelector::app().with(PURPOSE_LABEL, PURPOSE_METADATA);
        assert_eq!(
            selector.to_string(),
            "app=goldenpipe,goldenpipe.io/purpose=image-metadata"
        );
    }

    #[test]
    fn test_selector_matches_subset() {
        let labels = object_labels(PURPOSE_METADATA, "web01");

        assert!(LabelSelector::app().matches(&labels));
        assert!(LabelSelector::new().matches(&labels));
        assert!(!LabelSelector::app()
            .with(PURPOSE_LABEL, PURPOSE_GOLDEN_IMAGE)
            .matches(&labels));
    }

    #[test]
    fn test_fatal_condition_requires_failure_true() {
        let mut condition = VmCondition::failure("image import failed");
        assert!(condition.is_fatal());
        assert_eq!(condition.text(), "image import failed");

        condition.status = "False".to_string();
        assert!(!condition.is_fatal());

        let ready = VmCondition {
            condition_type: "Ready".to_string(),
            status: "True".to_string(),
            reason: None,
            message: None,
        };
        assert!(!ready.is_fatal());
    }
}
