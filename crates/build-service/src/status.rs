//! Build status projection from builder VM state

use chrono::{DateTime, Utc};
use goldenpipe_common::{BuildStatusResponse, GoldenImageRecord, ImageStatus};

use crate::cluster::VmObject;

pub const PROGRESS_PENDING: u8 = 0;
pub const PROGRESS_CREATING: u8 = 50;
pub const PROGRESS_READY: u8 = 100;

/// Maps builder VM state onto the build state machine
pub struct StatusProjector;

impl StatusProjector {
    /// Ready dominates created, created dominates nothing. A fatal failure
    /// condition overrides all of them.
    pub fn project(
        record: &GoldenImageRecord,
        vm: &VmObject,
        now: DateTime<Utc>,
    ) -> BuildStatusResponse {
        let (mut status, progress, mut message) = if vm.ready {
            (
                ImageStatus::Ready,
                PROGRESS_READY,
                "Golden image is ready".to_string(),
            )
        } else if vm.created {
            (
                ImageStatus::Creating,
                PROGRESS_CREATING,
                "Builder VM is provisioning the image".to_string(),
            )
        } else {
            (
                ImageStatus::Pending,
                PROGRESS_PENDING,
                "Waiting for the builder VM to be scheduled".to_string(),
            )
        };

        if let Some(condition) = vm.fatal_condition() {
            status = ImageStatus::Failed;
            message = condition.text();
        }

        BuildStatusResponse {
            name: record.name.clone(),
            status,
            progress,
            message,
            created_at: record.created_at,
            updated_at: now,
        }
    }
}
