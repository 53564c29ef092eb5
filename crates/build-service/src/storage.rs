//! Storage provisioner for golden image volumes

use goldenpipe_common::{Error, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, sleep_until, Instant};
use tracing::{debug, error, info};

use crate::cluster::{
    object_labels, ClusterApi, LabelSelector, VolumeClaim, VolumeClaimSpec, VolumePhase,
    PURPOSE_GOLDEN_IMAGE,
};
use crate::context::CallContext;

/// Interval of the volume-bound wait loop
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

const BINARY_SUFFIXES: [(&str, u64); 6] = [
    ("Ei", 1 << 60),
    ("Pi", 1 << 50),
    ("Ti", 1 << 40),
    ("Gi", 1 << 30),
    ("Mi", 1 << 20),
    ("Ki", 1 << 10),
];

const DECIMAL_SUFFIXES: [(&str, u64); 6] = [
    ("E", 1_000_000_000_000_000_000),
    ("P", 1_000_000_000_000_000),
    ("T", 1_000_000_000_000),
    ("G", 1_000_000_000),
    ("M", 1_000_000),
    ("k", 1_000),
];

/// Parse a storage quantity such as `20Gi`, `500M` or `1073741824` into bytes
pub fn parse_quantity(quantity: &str) -> Option<u64> {
    let quantity = quantity.trim();

    let (number, multiplier) = BINARY_SUFFIXES
        .iter()
        .chain(DECIMAL_SUFFIXES.iter())
        .find_map(|(suffix, multiplier)| {
            quantity
                .strip_suffix(suffix)
                .map(|number| (number, *multiplier))
        })
        .unwrap_or((quantity, 1));

    if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }

    if let Ok(whole) = number.parse::<u64>() {
        return whole.checked_mul(multiplier);
    }

    let fractional: f64 = number.parse().ok()?;
    Some((fractional * multiplier as f64).round() as u64)
}

/// Render bytes with the largest binary suffix that divides them exactly
pub fn format_quantity(bytes: u64) -> String {
    if bytes == 0 {
        return "0".to_string();
    }

    BINARY_SUFFIXES
        .iter()
        .find(|(_, multiplier)| bytes % multiplier == 0)
        .map(|(suffix, multiplier)| format!("{}{}", bytes / multiplier, suffix))
        .unwrap_or_else(|| bytes.to_string())
}

/// Totals over the volumes this service owns
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageUsage {
    /// Capacity reported by bound volumes
    pub total_allocated: String,

    /// Requested size of bound volumes
    pub total_used: String,

    pub volume_count: usize,
}

/// Creates, deletes and watches golden image volumes
pub struct StorageProvisioner {
    cluster: Arc<dyn ClusterApi>,
    storage_class: String,
    poll_interval: Duration,
}

impl StorageProvisioner {
    pub fn new(cluster: Arc<dyn ClusterApi>, storage_class: impl Into<String>) -> Self {
        Self {
            cluster,
            storage_class: storage_class.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn storage_class(&self) -> &str {
        &self.storage_class
    }

    /// Create a ReadWriteOnce volume of `size` for image volume `name`
    pub async fn create_volume(&self, name: &str, size: &str) -> Result<VolumeClaim> {
        if parse_quantity(size).is_none() {
            return Err(Error::Validation(format!("invalid storage size {}", size)));
        }

        let spec = VolumeClaimSpec {
            name: name.to_string(),
            size: size.to_string(),
            storage_class: self.storage_class.clone(),
            labels: object_labels(PURPOSE_GOLDEN_IMAGE, name),
        };

        let claim = self
            .cluster
            .create_volume(&spec)
            .await
            .map_err(|e| Error::provisioning(format!("create volume {}", name), e))?;

        info!("Created volume {} with size {}", name, size);
        Ok(claim)
    }

    pub async fn delete_volume(&self, name: &str) -> Result<()> {
        self.cluster
            .delete_volume(name)
            .await
            .map_err(|e| Error::provisioning(format!("delete volume {}", name), e))?;

        info!("Deleted volume {}", name);
        Ok(())
    }

    pub async fn get_volume(&self, name: &str) -> Result<VolumeClaim> {
        self.cluster
            .get_volume(name)
            .await
            .map_err(|e| Error::lookup(format!("get volume {}", name), e))
    }

    /// Poll until the volume is bound. Lookup failures are logged and polled
    /// through. Gives `Timeout` once `timeout` or the call deadline passes,
    /// `Cancelled` when the call is cancelled.
    pub async fn wait_for_volume_bound(
        &self,
        name: &str,
        timeout: Duration,
        ctx: &CallContext,
    ) -> Result<VolumeClaim> {
        let start = Instant::now();
        let own_deadline = start + timeout;
        let deadline = ctx
            .deadline()
            .map_or(own_deadline, |d| d.min(own_deadline));

        let mut ticker = interval_at(start + self.poll_interval, self.poll_interval);

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    return Err(Error::Cancelled(format!("waiting for volume {}", name)));
                }
                _ = sleep_until(deadline) => {
                    return Err(Error::Timeout(format!(
                        "waiting for volume {} to be bound",
                        name
                    )));
                }
                _ = ticker.tick() => {}
            }

            match self.cluster.get_volume(name).await {
                Ok(claim) if claim.phase == VolumePhase::Bound => {
                    info!("Volume {} is bound", name);
                    return Ok(claim);
                }
                Ok(claim) => debug!("Volume {} phase: {:?}", name, claim.phase),
                Err(e) => error!("Failed to get volume {}: {}", name, e),
            }
        }
    }

    /// Allocated and used totals over every volume labelled with the app
    pub async fn storage_usage(&self) -> Result<StorageUsage> {
        let volumes = self
            .cluster
            .list_volumes(&LabelSelector::app())
            .await
            .map_err(|e| Error::lookup("list volumes", e))?;

        let mut allocated: u64 = 0;
        let mut used: u64 = 0;

        for volume in &volumes {
            if let Some(capacity) = volume.capacity.as_deref().and_then(parse_quantity) {
                allocated = allocated.saturating_add(capacity);
            }

            if volume.phase == VolumePhase::Bound {
                if let Some(requested) = parse_quantity(&volume.requested) {
                    used = used.saturating_add(requested);
                }
            }
        }

        Ok(StorageUsage {
            total_allocated: format_quantity(allocated),
            total_used: format_quantity(used),
            volume_count: volumes.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{InMemoryCluster, Operation};
    use crate::cluster::{APP_LABEL, IMAGE_LABEL, PURPOSE_LABEL};
    use tokio::sync::watch;

    fn provisioner(cluster: Arc<InMemoryCluster>) -> StorageProvisioner {
        StorageProvisioner::new(cluster, "rook-ceph-block")
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("20Gi"), Some(20 << 30));
        assert_eq!(parse_quantity("512Mi"), Some(512 << 20));
        assert_eq!(parse_quantity("1.5Gi"), Some(3 << 29));
        assert_eq!(parse_quantity("500M"), Some(500_000_000));
        assert_eq!(parse_quantity("4096"), Some(4096));
        assert_eq!(parse_quantity("twenty"), None);
        assert_eq!(parse_quantity("Gi"), None);
        assert_eq!(parse_quantity("-1Gi"), None);
    }

    #[test]
    fn test_format_quantity() {
        assert_eq!(format_quantity(0), "0");
        assert_eq!(format_quantity(70 << 30), "70Gi");
        assert_eq!(format_quantity(1536 << 20), "1536Mi");
        assert_eq!(format_quantity(1000), "1000");
    }

    #[tokio::test]
    async fn test_create_volume_labels_and_class() {
        let cluster = Arc::new(InMemoryCluster::new());
        let claim = provisioner(cluster.clone())
            .create_volume("golden-image-web01", "20Gi")
            .await
            .unwrap();

        assert_eq!(claim.requested, "20Gi");
        assert_eq!(claim.labels[APP_LABEL], "goldenpipe");
        assert_eq!(claim.labels[PURPOSE_LABEL], "golden-image");
        assert_eq!(claim.labels[IMAGE_LABEL], "golden-image-web01");
    }

    #[tokio::test]
    async fn test_invalid_size_never_reaches_cluster() {
        let cluster = Arc::new(InMemoryCluster::new());
        let err = provisioner(cluster.clone())
            .create_volume("golden-image-web01", "lots")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
        assert!(cluster.calls(Operation::CreateVolume).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_once_bound() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.set_auto_bind(false);
        let storage = provisioner(cluster.clone());
        storage.create_volume("vol", "20Gi").await.unwrap();

        let binder = {
            let cluster = cluster.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(12)).await;
                cluster.bind_volume("vol", VolumePhase::Bound);
            })
        };

        let claim = storage
            .wait_for_volume_bound("vol", Duration::from_secs(60), &CallContext::background())
            .await
            .unwrap();
        binder.await.unwrap();

        assert_eq!(claim.phase, VolumePhase::Bound);
        // polled at 5s, 10s and 15s
        assert_eq!(cluster.calls(Operation::GetVolume).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_polls_through_lookup_errors_then_times_out() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.fail(Operation::GetVolume, "etcd leader changed");

        let err = provisioner(cluster.clone())
            .wait_for_volume_bound("vol", Duration::from_secs(12), &CallContext::background())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(cluster.calls(Operation::GetVolume).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_honours_caller_deadline() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.set_auto_bind(false);
        let storage = provisioner(cluster.clone());
        storage.create_volume("vol", "20Gi").await.unwrap();

        let ctx = CallContext::background().with_timeout(Duration::from_secs(7));
        let err = storage
            .wait_for_volume_bound("vol", Duration::from_secs(300), &ctx)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_distinguishes_cancellation() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.set_auto_bind(false);
        let storage = provisioner(cluster.clone());
        storage.create_volume("vol", "20Gi").await.unwrap();

        let (tx, rx) = watch::channel(false);
        let ctx = CallContext::background().with_cancellation(rx);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(8)).await;
            let _ = tx.send(true);
        });

        let err = storage
            .wait_for_volume_bound("vol", Duration::from_secs(300), &ctx)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_storage_usage_counts_bound_volumes() {
        let cluster = Arc::new(InMemoryCluster::new());
        let storage = provisioner(cluster.clone());

        storage.create_volume("a", "20Gi").await.unwrap();
        storage.create_volume("b", "50Gi").await.unwrap();
        cluster.set_auto_bind(false);
        storage.create_volume("c", "10Gi").await.unwrap();

        let usage = storage.storage_usage().await.unwrap();
        assert_eq!(usage.total_used, "70Gi");
        assert_eq!(usage.total_allocated, "70Gi");
        assert_eq!(usage.volume_count, 3);
    }
}
