//! Golden image records persisted as labelled cluster objects
//!
//! One object per image, named `golden-image-<name>`, holding the JSON
//! record under the `metadata` field.

use goldenpipe_common::{Error, GoldenImageRecord, ResourceKind, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

use crate::cluster::{
    object_labels, ClusterApi, LabelSelector, RecordObject, PURPOSE_LABEL, PURPOSE_METADATA,
};

/// Field of the record object holding the serialized record
pub const RECORD_FIELD: &str = "metadata";

/// Prefix shared by record objects and image volumes
pub const OBJECT_PREFIX: &str = "golden-image-";

pub fn record_object_name(image_name: &str) -> String {
    format!("{}{}", OBJECT_PREFIX, image_name)
}

/// Reads and writes golden image records
pub struct MetadataStore {
    cluster: Arc<dyn ClusterApi>,
}

impl MetadataStore {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    /// Create or replace the record for `record.name`
    pub async fn store(&self, record: &GoldenImageRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;

        let object = RecordObject {
            name: record_object_name(&record.name),
            labels: object_labels(PURPOSE_METADATA, &record.name),
            data: BTreeMap::from([(RECORD_FIELD.to_string(), json)]),
        };

        self.cluster
            .put_record(&object)
            .await
            .map_err(|e| Error::provisioning(format!("store metadata for {}", record.name), e))?;

        info!("Stored metadata for image {}", record.name);
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<GoldenImageRecord> {
        let object = self
            .cluster
            .get_record(&record_object_name(name))
            .await
            .map_err(|e| match Error::lookup(format!("get metadata for {}", name), e) {
                Error::NotFound { .. } => Error::NotFound {
                    kind: ResourceKind::Image,
                    name: name.to_string(),
                },
                other => other,
            })?;

        decode(&object)
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        self.cluster
            .delete_record(&record_object_name(name))
            .await
            .map_err(|e| Error::provisioning(format!("delete metadata for {}", name), e))?;

        info!("Deleted metadata for image {}", name);
        Ok(())
    }

    /// Every decodable record; undecodable ones are logged and skipped
    pub async fn list(&self) -> Result<Vec<GoldenImageRecord>> {
        let selector = LabelSelector::app().with(PURPOSE_LABEL, PURPOSE_METADATA);
        let objects = self
            .cluster
            .list_records(&selector)
            .await
            .map_err(|e| Error::lookup("list image metadata", e))?;

        Ok(objects
            .iter()
            .filter_map(|object| match decode(object) {
                Ok(record) => Some(record),
                Err(e) => {
                    error!("Failed to decode image metadata {}: {}", object.name, e);
                    None
                }
            })
            .collect())
    }
}

fn decode(object: &RecordObject) -> Result<GoldenImageRecord> {
    let json = object.data.get(RECORD_FIELD).ok_or_else(|| {
        Error::Other(anyhow::anyhow!(
            "record {} has no {} field",
            object.name,
            RECORD_FIELD
        ))
    })?;

    Ok(serde_json::from_str(json)?)
}
