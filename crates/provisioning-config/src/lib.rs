//! Provisioning Config
//!
//! Turns a build request into the first-boot document its builder VM
//! consumes: cloud-init user and network data for Linux, an unattended-install
//! XML document for Windows. Output is deterministic and base64-encoded for
//! transport; nothing here performs I/O or embeds timestamps.

pub mod cloud_init;
mod templates;
pub mod unattend;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use goldenpipe_common::{BuildRequest, OsType};
use tracing::debug;

pub use cloud_init::{CloudConfig, BASELINE_PACKAGES};
pub use unattend::{SynchronousCommand, FIRST_SCRIPT_ORDER};

/// Base64-encoded first-boot data for a builder VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningPayload {
    pub user_data: String,

    /// Only Linux builds carry network data
    pub network_data: Option<String>,
}

/// Cloud-init user data and network data, both base64-encoded
pub fn generate_linux_config(req: &BuildRequest) -> (String, String) {
    let user_data = cloud_init::render_user_data(req);
    debug!(
        "Generated cloud-init document for {} ({} bytes)",
        req.name,
        user_data.len()
    );

    (
        STANDARD.encode(user_data),
        STANDARD.encode(cloud_init::render_network_data()),
    )
}

/// Unattend XML, base64-encoded
pub fn generate_windows_config(req: &BuildRequest) -> String {
    let user_data = unattend::render_user_data(req);
    debug!(
        "Generated unattend document for {} ({} bytes)",
        req.name,
        user_data.len()
    );

    STANDARD.encode(user_data)
}

/// Payload for whichever OS the request targets
pub fn generate(req: &BuildRequest) -> ProvisioningPayload {
    match req.os_type {
        OsType::Linux => {
            let (user_data, network_data) = generate_linux_config(req);
            ProvisioningPayload {
                user_data,
                network_data: Some(network_data),
            }
        }
        OsType::Windows => ProvisioningPayload {
            user_data: generate_windows_config(req),
            network_data: None,
        },
    }
}
