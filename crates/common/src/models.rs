//! Data model shared by the provisioning generators and the build service

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::error::{Error, Result};

/// Longest name accepted for a cluster resource
pub const MAX_NAME_LEN: usize = 253;

/// Operating system of the image being built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    Linux,
    Windows,
}

impl OsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsType::Linux => "linux",
            OsType::Windows => "windows",
        }
    }

    pub fn default_storage_size(&self) -> &'static str {
        match self {
            OsType::Linux => "20Gi",
            OsType::Windows => "50Gi",
        }
    }

    pub fn default_cpu(&self) -> u32 {
        match self {
            OsType::Linux => 2,
            OsType::Windows => 4,
        }
    }

    pub fn default_memory(&self) -> &'static str {
        match self {
            OsType::Linux => "4Gi",
            OsType::Windows => "8Gi",
        }
    }
}

impl fmt::Display for OsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build status of a golden image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    Pending,
    Creating,
    Ready,
    Failed,
    Deleting,
}

impl ImageStatus {
    /// Ready and failed builds hold no admission slot
    pub fn is_terminal(&self) -> bool {
        matches!(self, ImageStatus::Ready | ImageStatus::Failed)
    }

    /// Pending and creating builds count against the admission limit
    pub fn is_active(&self) -> bool {
        matches!(self, ImageStatus::Pending | ImageStatus::Creating)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Pending => "pending",
            ImageStatus::Creating => "creating",
            ImageStatus::Ready => "ready",
            ImageStatus::Failed => "failed",
            ImageStatus::Deleting => "deleting",
        }
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse status of a virtual machine as reported on the `/vms` surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Pending,
    Running,
    Stopped,
    Failed,
    Deleting,
}

/// A user account to create inside a Linux image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sudo: bool,
}

/// Optional changes applied while the builder VM provisions the image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customizations {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,

    /// Executed in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scripts: Vec<String>,

    /// Destination path to file content, emitted in path order
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<UserConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_keys: Vec<String>,
}

/// Request to build a golden image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub name: String,

    pub os_type: OsType,

    /// Installation media or cloud image the OS disk is imported from
    pub base_iso_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customizations: Option<Customizations>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_size: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

impl BuildRequest {
    /// Minimal request with every optional field left to its default
    pub fn new(name: impl Into<String>, os_type: OsType, base_iso_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            os_type,
            base_iso_url: base_iso_url.into(),
            customizations: None,
            storage_size: None,
            cpu: None,
            memory: None,
            labels: HashMap::new(),
        }
    }

    /// Check the request before anything touches the cluster
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Validation("name is required".to_string()));
        }

        if self.base_iso_url.is_empty() {
            return Err(Error::Validation("base_iso_url is required".to_string()));
        }

        if !self.base_iso_url.starts_with("http://") && !self.base_iso_url.starts_with("https://")
        {
            return Err(Error::Validation(
                "base_iso_url must be a valid HTTP/HTTPS URL".to_string(),
            ));
        }

        if !is_valid_resource_name(&self.name) {
            return Err(Error::Validation(
                "name must be a valid Kubernetes resource name (lowercase alphanumeric and hyphens only)"
                    .to_string(),
            ));
        }

        Ok(())
    }

    pub fn customizations(&self) -> Option<&Customizations> {
        self.customizations.as_ref()
    }

    pub fn resolved_storage_size(&self) -> String {
        match self.storage_size.as_deref() {
            Some(size) if !size.is_empty() => size.to_string(),
            _ => self.os_type.default_storage_size().to_string(),
        }
    }

    pub fn resolved_cpu(&self) -> u32 {
        match self.cpu {
            Some(cpu) if cpu > 0 => cpu,
            _ => self.os_type.default_cpu(),
        }
    }

    pub fn resolved_memory(&self) -> String {
        match self.memory.as_deref() {
            Some(memory) if !memory.is_empty() => memory.to_string(),
            _ => self.os_type.default_memory().to_string(),
        }
    }
}

/// Lowercase alphanumerics and hyphens, 1 to 253 characters
pub fn is_valid_resource_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }

    name.chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Persisted record of a golden image build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldenImageRecord {
    pub name: String,

    pub os_type: OsType,

    pub status: ImageStatus,

    /// Resolved storage size of the image volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customizations: Option<Customizations>,

    /// Storage volume holding the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc_name: Option<String>,

    /// Transient VM that builds the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_name: Option<String>,
}

impl GoldenImageRecord {
    /// Record for a build whose volume and builder VM were just provisioned
    pub fn creating(request: &BuildRequest, pvc_name: String, vm_name: String) -> Self {
        let now = Utc::now();
        Self {
            name: request.name.clone(),
            os_type: request.os_type,
            status: ImageStatus::Creating,
            size: Some(request.resolved_storage_size()),
            created_at: now,
            updated_at: now,
            labels: request.labels.clone(),
            customizations: request.customizations.clone(),
            pvc_name: Some(pvc_name),
            vm_name: Some(vm_name),
        }
    }
}

/// Read-only projection of a build's progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildStatusResponse {
    pub name: String,

    pub status: ImageStatus,

    /// 0 to 100
    pub progress: u8,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// Virtual machine as exposed on the `/vms` surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSummary {
    pub name: String,

    pub image_name: String,

    pub status: VmStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Aggregate counters over stored records and builder VMs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub total_images: usize,
    pub active_vms: usize,
    pub failed_images: usize,
    pub storage_used: String,
    pub last_updated: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str, url: &str) -> BuildRequest {
        BuildRequest::new(name, OsType::Linux, url)
    }

    #[test]
    fn test_validate_accepts_resource_names() {
        assert!(request("web01", "https://iso.example/ubuntu.iso").validate().is_ok());
        assert!(request("a", "http://iso.example/x.iso").validate().is_ok());
        assert!(request("web-01-base", "https://iso.example/x.iso").validate().is_ok());
        assert!(request(&"a".repeat(253), "https://iso.example/x.iso").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_names() {
        for name in ["", "Web01", "web_01", "web.01", "web 01", "wéb"] {
            let err = request(name, "https://iso.example/x.iso")
                .validate()
                .expect_err(name);
            assert!(matches!(err, Error::Validation(_)), "{name}");
        }

        assert!(request(&"a".repeat(254), "https://iso.example/x.iso")
            .validate()
            .is_err());
    }

    #[test]
    fn test_validate_requires_http_scheme() {
        for url in ["", "ftp://iso.example/x.iso", "iso.example/x.iso", "file:///x.iso"] {
            let err = request("web01", url).validate().expect_err(url);
            assert!(matches!(err, Error::Validation(_)), "{url}");
        }
    }

    #[test]
    fn test_unknown_os_type_is_rejected_at_decode() {
        let body = r#"{"name":"web01","os_type":"macos","base_iso_url":"https://x"}"#;
        assert!(serde_json::from_str::<BuildRequest>(body).is_err());
    }

    #[test]
    fn test_defaults_by_os_type() {
        let linux = request("web01", "https://x");
        assert_eq!(linux.resolved_storage_size(), "20Gi");
        assert_eq!(linux.resolved_cpu(), 2);
        assert_eq!(linux.resolved_memory(), "4Gi");

        let windows = BuildRequest::new("win01", OsType::Windows, "https://x");
        assert_eq!(windows.resolved_storage_size(), "50Gi");
        assert_eq!(windows.resolved_cpu(), 4);
        assert_eq!(windows.resolved_memory(), "8Gi");
    }

    #[test]
    fn test_overrides_win_over_defaults() {
        let mut req = request("web01", "https://x");
        req.storage_size = Some("40Gi".to_string());
        req.cpu = Some(8);
        req.memory = Some("16Gi".to_string());

        assert_eq!(req.resolved_storage_size(), "40Gi");
        assert_eq!(req.resolved_cpu(), 8);
        assert_eq!(req.resolved_memory(), "16Gi");

        // zero and empty values mean "not set"
        req.cpu = Some(0);
        req.memory = Some(String::new());
        assert_eq!(req.resolved_cpu(), 2);
        assert_eq!(req.resolved_memory(), "4Gi");
    }

    #[test]
    fn test_record_round_trip() {
        let mut req = request("web01", "https://iso.example/ubuntu.iso");
        req.labels.insert("team".to_string(), "platform".to_string());
        req.customizations = Some(Customizations {
            packages: vec!["nginx".to_string()],
            ..Default::default()
        });

        let record = GoldenImageRecord::creating(
            &req,
            "golden-image-web01".to_string(),
            "golden-image-web01-1a2b3c4d".to_string(),
        );

        let json = serde_json::to_string(&record).unwrap();
        let decoded: GoldenImageRecord = serde_json::from_str(&json).unwrap();

        assert_eq!(decoded, record);
        assert_eq!(decoded.status, ImageStatus::Creating);
        assert_eq!(decoded.size.as_deref(), Some("20Gi"));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ImageStatus::Ready.is_terminal());
        assert!(ImageStatus::Failed.is_terminal());
        assert!(!ImageStatus::Pending.is_terminal());
        assert!(!ImageStatus::Creating.is_terminal());
        assert!(!ImageStatus::Deleting.is_terminal());
    }
}
