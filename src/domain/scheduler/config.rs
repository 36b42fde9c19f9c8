use std::path::PathBuf;
use std::time::Duration;

use crate::api::config_dto::{NetworkDto, SchedulerConfigDto, StaticWanPathDto, TransferAuthDto};
use crate::api::launcher_dto::PortRange;
use crate::domain::utils::id::SiteId;
use crate::error::ConversionError;
use crate::loader::size::parse_size;

const DEFAULT_GROUP_SIZE: u64 = 20 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferAuth {
    Password { username: String, password: String },
    Certificate,
}

impl TransferAuth {
    pub fn mode(&self) -> &'static str {
        match self {
            TransferAuth::Password { .. } => "password",
            TransferAuth::Certificate => "certificate",
        }
    }
}

impl TryFrom<TransferAuthDto> for TransferAuth {
    type Error = ConversionError;

    fn try_from(dto: TransferAuthDto) -> Result<Self, Self::Error> {
        match dto.mode.as_str() {
            "certificate" => Ok(TransferAuth::Certificate),
            "password" => match (dto.username, dto.password) {
                (Some(username), Some(password)) if !username.is_empty() => Ok(TransferAuth::Password { username, password }),
                _ => Err(ConversionError::MissingPasswordCredentials),
            },
            other => Err(ConversionError::UnknownTransferAuth(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumConfig {
    pub enabled: bool,
    pub algorithm: String,
    /// Concurrency budget handed to the remote expand-and-group service.
    pub threads: usize,
}

impl Default for ChecksumConfig {
    fn default() -> Self {
        ChecksumConfig { enabled: false, algorithm: "md5".to_string(), threads: 4 }
    }
}

/// Pre-provisioned WAN circuit between two sites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticWanPath {
    pub src_site: SiteId,
    pub dst_site: SiteId,
    pub vlan_src: u16,
    pub vlan_dst: u16,
    pub bandwidth: u64,
}

impl From<StaticWanPathDto> for StaticWanPath {
    fn from(dto: StaticWanPathDto) -> Self {
        StaticWanPath {
            src_site: SiteId::new(dto.src_site),
            dst_site: SiteId::new(dto.dst_site),
            vlan_src: dto.vlan_src,
            vlan_dst: dto.vlan_dst,
            bandwidth: dto.bandwidth,
        }
    }
}

/// Immutable settings of the network path orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkConfig {
    pub static_wan_paths: Vec<StaticWanPath>,
    pub wan_controller_url: Option<String>,
    /// Ping in both directions before reserving, to warm switch MAC tables.
    pub pre_ping: bool,
    pub suppress_arp: bool,
    pub suppress_route: bool,
    pub sdn_attempts: u32,
    pub sdn_retry_delay: Duration,
    /// Pause between WAN create, reserve and commit.
    pub wan_step_delay: Duration,
    pub wan_release_delay: Duration,
    pub wan_terminate_delay: Duration,
    pub ping_interval: Duration,
    pub ping_tries_static: u32,
    pub ping_tries_dynamic: u32,
}

impl NetworkConfig {
    pub fn static_path(&self, src: &SiteId, dst: &SiteId) -> Option<&StaticWanPath> {
        self.static_wan_paths.iter().find(|p| &p.src_site == src && &p.dst_site == dst)
    }

    /// Same settings with every settle delay set to zero.
    pub fn without_delays(self) -> Self {
        NetworkConfig {
            sdn_retry_delay: Duration::ZERO,
            wan_step_delay: Duration::ZERO,
            wan_release_delay: Duration::ZERO,
            wan_terminate_delay: Duration::ZERO,
            ping_interval: Duration::ZERO,
            ..self
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            static_wan_paths: Vec::new(),
            wan_controller_url: None,
            pre_ping: false,
            suppress_arp: false,
            suppress_route: false,
            sdn_attempts: 3,
            sdn_retry_delay: Duration::from_secs(2),
            wan_step_delay: Duration::from_secs(2),
            wan_release_delay: Duration::from_secs(10),
            wan_terminate_delay: Duration::from_secs(30),
            ping_interval: Duration::from_secs(10),
            ping_tries_static: 5,
            ping_tries_dynamic: 30,
        }
    }
}

impl From<NetworkDto> for NetworkConfig {
    fn from(dto: NetworkDto) -> Self {
        let defaults = NetworkConfig::default();
        let secs = |value: Option<u64>, default: Duration| value.map(Duration::from_secs).unwrap_or(default);

        NetworkConfig {
            static_wan_paths: dto.static_wan_paths.into_iter().map(StaticWanPath::from).collect(),
            wan_controller_url: dto.wan_controller_url,
            pre_ping: dto.pre_ping.unwrap_or(defaults.pre_ping),
            suppress_arp: dto.suppress_arp.unwrap_or(defaults.suppress_arp),
            suppress_route: dto.suppress_route.unwrap_or(defaults.suppress_route),
            sdn_attempts: dto.sdn_attempts.unwrap_or(defaults.sdn_attempts).max(1),
            sdn_retry_delay: secs(dto.sdn_retry_delay_secs, defaults.sdn_retry_delay),
            wan_step_delay: secs(dto.wan_step_delay_secs, defaults.wan_step_delay),
            wan_release_delay: secs(dto.wan_release_delay_secs, defaults.wan_release_delay),
            wan_terminate_delay: secs(dto.wan_terminate_delay_secs, defaults.wan_terminate_delay),
            ping_interval: secs(dto.ping_interval_secs, defaults.ping_interval),
            ping_tries_static: dto.ping_tries_static.unwrap_or(defaults.ping_tries_static).max(1),
            ping_tries_dynamic: dto.ping_tries_dynamic.unwrap_or(defaults.ping_tries_dynamic).max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalSettings {
    pub user: String,
    pub token: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub transfer_auth: TransferAuth,
    pub checksum: ChecksumConfig,
    /// Target block size for the expand-and-group service, bytes.
    pub group_size: u64,
    pub command_file_dir: Option<PathBuf>,
    /// Seconds without progress after which a flow is declared stalled.
    pub inactivity_timeout: i64,
    pub schedule_interval: Duration,
    pub rate_interval: Duration,
    pub worker_threads: usize,
    pub port_range: PortRange,
    pub network: NetworkConfig,
    pub portal: Option<PortalSettings>,
    pub rpc_gateway: Option<String>,
    /// Defaults to `<local site>.scheduler`.
    pub inbound_queue: Option<String>,
    pub metrics_file: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            transfer_auth: TransferAuth::Certificate,
            checksum: ChecksumConfig::default(),
            group_size: DEFAULT_GROUP_SIZE,
            command_file_dir: None,
            inactivity_timeout: 300,
            schedule_interval: Duration::from_secs(5),
            rate_interval: Duration::from_secs(5),
            worker_threads: 8,
            port_range: PortRange::default(),
            network: NetworkConfig::default(),
            portal: None,
            rpc_gateway: None,
            inbound_queue: None,
            metrics_file: None,
        }
    }
}

impl TryFrom<SchedulerConfigDto> for SchedulerConfig {
    type Error = ConversionError;

    fn try_from(dto: SchedulerConfigDto) -> Result<Self, Self::Error> {
        let defaults = SchedulerConfig::default();

        let transfer_auth = match dto.transfer_auth {
            Some(auth) => TransferAuth::try_from(auth)?,
            None => defaults.transfer_auth,
        };

        let checksum = match dto.checksum {
            Some(c) => ChecksumConfig {
                enabled: c.enabled,
                algorithm: c.algorithm.unwrap_or(defaults.checksum.algorithm),
                threads: c.threads.unwrap_or(defaults.checksum.threads).max(1),
            },
            None => defaults.checksum,
        };

        let group_size = match dto.group_size {
            Some(size) => parse_size(&size)?,
            None => defaults.group_size,
        };

        let port_range = dto.port_range.unwrap_or(defaults.port_range);
        if port_range.min == 0 || port_range.min > port_range.max {
            return Err(ConversionError::InvalidPortRange { min: port_range.min, max: port_range.max });
        }

        Ok(SchedulerConfig {
            transfer_auth,
            checksum,
            group_size,
            command_file_dir: dto.write_command_file.map(PathBuf::from),
            inactivity_timeout: dto.inactivity_timeout_secs.unwrap_or(defaults.inactivity_timeout),
            schedule_interval: dto.schedule_interval_secs.map(Duration::from_secs).unwrap_or(defaults.schedule_interval),
            rate_interval: dto.rate_interval_secs.map(Duration::from_secs).unwrap_or(defaults.rate_interval),
            worker_threads: dto.worker_threads.unwrap_or(defaults.worker_threads).max(1),
            port_range,
            network: NetworkConfig::from(dto.network),
            portal: dto.portal.map(|p| PortalSettings {
                user: p.user,
                token: p.token,
                timeout: Duration::from_secs(p.timeout_secs.unwrap_or(20)),
            }),
            rpc_gateway: dto.rpc_gateway,
            inbound_queue: dto.inbound_queue,
            metrics_file: dto.metrics_file.map(PathBuf::from),
        })
    }
}
