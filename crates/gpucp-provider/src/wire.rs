//! Wire-format DTOs as the provider actually sends them, and the
//! flattening into the control plane's internal shapes.

use gpucp_domain::health_check::{PortDeclaration, Transport};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderProduct {
    pub id: String,
    pub name: String,
    pub region: String,
    pub billing_method: String,
    pub price_per_hour: f64,
    pub available: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderPortGroup {
    #[serde(rename = "type")]
    pub kind: String,
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderTemplate {
    #[serde(rename = "Id")]
    pub id: serde_json::Value,
    pub image: String,
    pub ports: Vec<ProviderPortGroup>,
}

impl ProviderTemplate {
    /// Flatten `{type, ports:[...]}` groups into one `PortDeclaration`
    /// per port.
    pub fn flattened_ports(&self) -> Vec<PortDeclaration> {
        self.ports
            .iter()
            .flat_map(|group| {
                let transport = match group.kind.to_lowercase().as_str() {
                    "tcp" => Transport::Tcp,
                    "udp" => Transport::Udp,
                    "https" => Transport::Https,
                    _ => Transport::Http,
                };
                group
                    .ports
                    .iter()
                    .map(move |&port| PortDeclaration { port, transport })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderRegistryAuth {
    pub id: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderEnvVar {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInstance {
    pub id: String,
    pub name: String,
    pub status: String,
    pub region: String,
    #[serde(default)]
    pub spot_reclaim_time: Option<String>,
    #[serde(default)]
    pub spot_status: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceWireRequest {
    pub name: String,
    pub product_id: String,
    pub template_id: String,
    pub region: String,
    pub gpu_count: u32,
    pub rootfs_gb: u32,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_auth: Option<String>,
    pub env: Vec<ProviderEnvVar>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderJob {
    pub id: String,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PagedResponse<T> {
    pub items: Vec<T>,
    pub next_page: Option<String>,
}
