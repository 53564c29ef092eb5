//! Build orchestrator
//!
//! Runs the create saga (volume, provisioning payload, builder VM, record)
//! with compensating cleanup, projects build status from the builder VM, and
//! tears builds down on delete.

use chrono::Utc;
use goldenpipe_common::{
    BuildRequest, BuildStatusResponse, Error, GoldenImageRecord, ImageStatus, Metrics,
    ResourceKind, Result, VmStatus, VmSummary,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::admission::AdmissionControl;
use crate::cluster::{ClusterApi, VmDefinition};
use crate::context::CallContext;
use crate::control_plane::{vm_status, vm_summary, VmControlPlane};
use crate::metadata::{MetadataStore, OBJECT_PREFIX};
use crate::status::StatusProjector;
use crate::storage::{StorageProvisioner, DEFAULT_POLL_INTERVAL};

/// Deadline for best-effort cleanup, independent of the caller's
pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

const VM_SUFFIX_LEN: usize = 8;

/// Settings the orchestrator is constructed with
#[derive(Debug, Clone)]
pub struct BuildSettings {
    pub namespace: String,
    pub storage_class: String,
    pub max_concurrent_builds: usize,
    pub poll_interval: Duration,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            namespace: "goldenpipe-system".to_string(),
            storage_class: "rook-ceph-block".to_string(),
            max_concurrent_builds: 5,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Name of the volume an image is written to
pub fn volume_name(image_name: &str) -> String {
    format!("{}{}", OBJECT_PREFIX, image_name)
}

/// Fresh builder VM name: `golden-image-<name>-<8 hex>`
pub fn builder_vm_name(image_name: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}{}-{}", OBJECT_PREFIX, image_name, &suffix[..VM_SUFFIX_LEN])
}

fn cleanup_context() -> CallContext {
    CallContext::background().with_timeout(CLEANUP_TIMEOUT)
}

pub struct BuildOrchestrator {
    settings: BuildSettings,
    cluster: Arc<dyn ClusterApi>,
    storage: StorageProvisioner,
    metadata: MetadataStore,
    control_plane: VmControlPlane,
    admission: AdmissionControl,
}

impl BuildOrchestrator {
    pub fn new(
        settings: BuildSettings,
        cluster: Arc<dyn ClusterApi>,
        control_plane: VmControlPlane,
    ) -> Self {
        let storage = StorageProvisioner::new(cluster.clone(), settings.storage_class.clone())
            .with_poll_interval(settings.poll_interval);

        Self {
            storage,
            metadata: MetadataStore::new(cluster.clone()),
            admission: AdmissionControl::new(settings.max_concurrent_builds),
            control_plane,
            cluster,
            settings,
        }
    }

    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    pub fn storage(&self) -> &StorageProvisioner {
        &self.storage
    }

    pub fn control_plane(&self) -> &VmControlPlane {
        &self.control_plane
    }

    /// Builds currently holding an admission slot
    pub fn active_builds(&self) -> usize {
        self.admission.active()
    }

    /// Seed the admission counter from stored records still in progress
    pub async fn resync_admission(&self, ctx: &CallContext) -> Result<usize> {
        let records = ctx.run("list image metadata", self.metadata.list()).await?;
        let held: Vec<String> = records
            .into_iter()
            .filter(|r| r.status.is_active())
            .map(|r| r.name)
            .collect();
        let active = held.len();

        self.admission.reset(held);
        info!(
            "Admission resynced: {} of {} build slots in use",
            active,
            self.admission.limit()
        );
        Ok(active)
    }

    /// Start a build. Returns once the volume, builder VM and record exist;
    /// the image itself is produced asynchronously by the builder VM.
    pub async fn create(&self, req: BuildRequest, ctx: &CallContext) -> Result<GoldenImageRecord> {
        req.validate()?;

        let slot = self.admission.try_acquire(&req.name)?;

        let volume = volume_name(&req.name);
        let vm_name = builder_vm_name(&req.name);
        let size = req.resolved_storage_size();

        info!(
            "Creating golden image {} ({}): volume {}, builder VM {}",
            req.name, req.os_type, volume, vm_name
        );

        ctx.run("create volume", self.storage.create_volume(&volume, &size))
            .await?;

        let payload = provisioning_config::generate(&req);
        let definition = VmDefinition::builder_vm(&req, &vm_name, &volume, payload);

        if let Err(e) = ctx
            .run("submit builder VM", self.control_plane.submit(&definition))
            .await
        {
            error!("Failed to submit builder VM {}: {}", vm_name, e);
            self.rollback_volume(&volume).await;
            return Err(e);
        }

        let record = GoldenImageRecord::creating(&req, volume, vm_name);

        match ctx
            .run("store image metadata", self.metadata.store(&record))
            .await
        {
            Ok(()) => slot.commit(),
            // without a record no status call can ever free the slot
            Err(e) => error!("Failed to store image metadata for {}: {}", record.name, e),
        }

        info!("Golden image {} accepted", record.name);
        Ok(record)
    }

    async fn rollback_volume(&self, volume: &str) {
        let ctx = cleanup_context();
        match ctx
            .run("delete volume", self.storage.delete_volume(volume))
            .await
        {
            Ok(()) => info!("Rolled back volume {}", volume),
            Err(e) => error!("Failed to clean up volume {}: {}", volume, e),
        }
    }

    pub async fn get_image(&self, name: &str, ctx: &CallContext) -> Result<GoldenImageRecord> {
        ctx.run("get image metadata", self.metadata.get(name)).await
    }

    pub async fn list_images(&self, ctx: &CallContext) -> Result<Vec<GoldenImageRecord>> {
        ctx.run("list image metadata", self.metadata.list()).await
    }

    /// Project the build status from the builder VM and persist the change
    pub async fn get_status(&self, name: &str, ctx: &CallContext) -> Result<BuildStatusResponse> {
        let record = ctx.run("get image metadata", self.metadata.get(name)).await?;

        let vm_name = record.vm_name.clone().ok_or_else(|| Error::NotFound {
            kind: ResourceKind::VirtualMachine,
            name: format!("builder VM of {}", name),
        })?;

        let vm = ctx
            .run("get builder VM", self.control_plane.get(&vm_name))
            .await?;

        let projection = StatusProjector::project(&record, &vm, Utc::now());
        self.persist_transition(record, &projection, ctx).await;

        Ok(projection)
    }

    /// Write a changed status back to the record. Terminal and deleting
    /// records are left alone, and `pending` never overwrites `creating`.
    /// A terminal record never holds a slot, even when the store that made
    /// it terminal timed out after the cluster applied it.
    async fn persist_transition(
        &self,
        mut record: GoldenImageRecord,
        projection: &BuildStatusResponse,
        ctx: &CallContext,
    ) {
        let current = record.status;
        if current.is_terminal() {
            self.admission.release(&record.name);
            return;
        }

        if current == ImageStatus::Deleting
            || current == projection.status
            || projection.status == ImageStatus::Pending
        {
            return;
        }

        record.status = projection.status;
        record.updated_at = projection.updated_at;

        match ctx
            .run("store image metadata", self.metadata.store(&record))
            .await
        {
            Ok(()) => {
                info!(
                    "Golden image {} moved from {} to {}",
                    record.name, current, record.status
                );
                if record.status.is_terminal() {
                    self.admission.release(&record.name);
                }
            }
            Err(e) => warn!("Failed to persist status of {}: {}", record.name, e),
        }
    }

    /// Tear down a build. Succeeds once the record is found; the builder VM,
    /// volume and record are then removed best-effort.
    pub async fn delete(&self, name: &str, ctx: &CallContext) -> Result<()> {
        let mut record = ctx.run("get image metadata", self.metadata.get(name)).await?;

        let cleanup = cleanup_context();

        record.status = ImageStatus::Deleting;
        record.updated_at = Utc::now();
        if let Err(e) = cleanup
            .run("store image metadata", self.metadata.store(&record))
            .await
        {
            warn!("Failed to mark {} as deleting: {}", name, e);
        }

        if let Some(vm_name) = &record.vm_name {
            if let Err(e) = cleanup
                .run("delete builder VM", self.control_plane.delete(vm_name))
                .await
            {
                error!("Failed to delete builder VM {}: {}", vm_name, e);
            }
        }

        if let Some(volume) = &record.pvc_name {
            if let Err(e) = cleanup
                .run("delete volume", self.storage.delete_volume(volume))
                .await
            {
                error!("Failed to delete volume {}: {}", volume, e);
            }
        }

        if let Err(e) = cleanup
            .run("delete image metadata", self.metadata.delete(name))
            .await
        {
            error!("Failed to delete image metadata for {}: {}", name, e);
        }

        self.admission.release(name);

        info!("Deletion of golden image {} initiated", name);
        Ok(())
    }

    pub async fn list_vms(&self, ctx: &CallContext) -> Result<Vec<VmSummary>> {
        let vms = ctx
            .run("list virtual machines", self.control_plane.list())
            .await?;
        Ok(vms.iter().map(vm_summary).collect())
    }

    pub async fn get_vm(&self, name: &str, ctx: &CallContext) -> Result<VmSummary> {
        let vm = ctx
            .run("get virtual machine", self.control_plane.get(name))
            .await?;
        Ok(vm_summary(&vm))
    }

    /// Delete a VM this service owns
    pub async fn delete_vm(&self, name: &str, ctx: &CallContext) -> Result<()> {
        ctx.run("get virtual machine", self.control_plane.get(name))
            .await?;
        ctx.run("delete virtual machine", self.control_plane.delete(name))
            .await
    }

    /// Cluster reachability, then control plane presence
    pub async fn health(&self, ctx: &CallContext) -> Result<()> {
        ctx.run("ping cluster", async {
            self.cluster.ping().await.map_err(|e| {
                Error::ExternalUnavailable(format!("cluster not reachable: {}", e))
            })
        })
        .await?;

        ctx.run("check VM control plane", self.control_plane.health())
            .await
    }

    pub async fn metrics(&self, ctx: &CallContext) -> Result<Metrics> {
        let images = self.list_images(ctx).await?;
        let vms = ctx
            .run("list virtual machines", self.control_plane.list())
            .await?;

        let storage_used = match ctx
            .run("compute storage usage", self.storage.storage_usage())
            .await
        {
            Ok(usage) => usage.total_used,
            Err(e) => {
                warn!("Failed to compute storage usage: {}", e);
                "N/A".to_string()
            }
        };

        Ok(Metrics {
            total_images: images.len(),
            active_vms: vms
                .iter()
                .filter(|vm| vm_status(vm) == VmStatus::Running)
                .count(),
            failed_images: images
                .iter()
                .filter(|r| r.status == ImageStatus::Failed)
                .count(),
            storage_used,
            last_updated: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_names() {
        assert_eq!(volume_name("web01"), "golden-image-web01");

        let vm = builder_vm_name("web01");
        let suffix = vm.strip_prefix("golden-image-web01-").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(builder_vm_name("web01"), vm);
    }
}
