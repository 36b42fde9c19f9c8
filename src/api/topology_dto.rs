use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyDto {
    pub local_site: String,
    #[serde(default)]
    pub launcher_queue: Option<String>,
    #[serde(default)]
    pub sdn_agent_queue: Option<String>,
    #[serde(default)]
    pub sites: Vec<SiteDto>,
    #[serde(default)]
    pub dtns: Vec<DtnDto>,
    #[serde(default)]
    pub storages: Vec<StorageDto>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteDto {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DtnDto {
    pub id: String,
    pub site: String,
    pub ctrl_ip: String,
    pub data_ip: String,
    pub data_mac: String,
    pub port: u16,
    pub link_capacity: u64,
    #[serde(default)]
    pub sdn_setup: bool,
    #[serde(default)]
    pub stp: Option<String>,
    /// Command queue of the DTN agent.
    pub queue: String,
    #[serde(default = "default_online")]
    pub online: bool,
}

fn default_online() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageDto {
    pub id: String,
    pub site: String,
    pub mount: String,
    #[serde(default)]
    pub dtns: Vec<String>,
}
