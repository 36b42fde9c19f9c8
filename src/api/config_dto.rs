use serde::{Deserialize, Serialize};

use crate::api::launcher_dto::PortRange;

/// Scheduler configuration file. Every field is optional; missing ones take the documented defaults.
#[derive(Debug, Deserialize, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfigDto {
    #[serde(default)]
    pub transfer_auth: Option<TransferAuthDto>,
    #[serde(default)]
    pub checksum: Option<ChecksumDto>,
    #[serde(default)]
    pub group_size: Option<String>,
    /// Directory receiving a copy of every launch command.
    #[serde(default)]
    pub write_command_file: Option<String>,
    #[serde(default)]
    pub inactivity_timeout_secs: Option<i64>,
    #[serde(default)]
    pub schedule_interval_secs: Option<u64>,
    #[serde(default)]
    pub rate_interval_secs: Option<u64>,
    #[serde(default)]
    pub worker_threads: Option<usize>,
    #[serde(default)]
    pub port_range: Option<PortRange>,
    #[serde(default)]
    pub network: NetworkDto,
    #[serde(default)]
    pub portal: Option<PortalDto>,
    #[serde(default)]
    pub rpc_gateway: Option<String>,
    /// Queue on which agents and peer sites send commands to this scheduler.
    #[serde(default)]
    pub inbound_queue: Option<String>,
    #[serde(default)]
    pub metrics_file: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferAuthDto {
    pub mode: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChecksumDto {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub algorithm: Option<String>,
    #[serde(default)]
    pub threads: Option<usize>,
}

#[derive(Debug, Deserialize, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NetworkDto {
    #[serde(default)]
    pub static_wan_paths: Vec<StaticWanPathDto>,
    #[serde(default)]
    pub wan_controller_url: Option<String>,
    #[serde(default)]
    pub pre_ping: Option<bool>,
    #[serde(default)]
    pub suppress_arp: Option<bool>,
    #[serde(default)]
    pub suppress_route: Option<bool>,
    #[serde(default)]
    pub sdn_attempts: Option<u32>,
    #[serde(default)]
    pub sdn_retry_delay_secs: Option<u64>,
    #[serde(default)]
    pub wan_step_delay_secs: Option<u64>,
    #[serde(default)]
    pub wan_release_delay_secs: Option<u64>,
    #[serde(default)]
    pub wan_terminate_delay_secs: Option<u64>,
    #[serde(default)]
    pub ping_interval_secs: Option<u64>,
    #[serde(default)]
    pub ping_tries_static: Option<u32>,
    #[serde(default)]
    pub ping_tries_dynamic: Option<u32>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticWanPathDto {
    pub src_site: String,
    pub dst_site: String,
    pub vlan_src: u16,
    pub vlan_dst: u16,
    /// Mbit/s.
    pub bandwidth: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalDto {
    pub user: String,
    pub token: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}
