//! Shared types for the golden image build service
//!
//! Holds the request and record model, request validation and the error
//! taxonomy used by the provisioning generators and the orchestrator.

pub mod error;
pub mod models;

pub use error::{ClusterError, Error, ResourceKind, Result};
pub use models::{
    is_valid_resource_name, BuildRequest, BuildStatusResponse, Customizations,
    GoldenImageRecord, ImageStatus, Metrics, OsType, UserConfig, VmStatus, VmSummary,
};
