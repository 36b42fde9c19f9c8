use serde::{Deserialize, Serialize};

use crate::domain::model::block::FileEntry;
use crate::domain::model::raw_job::ProxyCredential;
use crate::domain::utils::id::{BlockId, DtnId, SJobId, TaskId};

/// Launcher reply code: rate sample is valid.
pub const RATE_OK: i64 = 0;
/// Launcher reply code: task is not known (the launcher restarted and lost it).
pub const RATE_UNKNOWN_TASK: i64 = 1;
/// Launcher reply code: task exists but no rate could be measured yet.
pub const RATE_UNKNOWN: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        PortRange { min: 50000, max: 51000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchEndpoint {
    pub dtn: DtnId,
    pub ctrl_ip: String,
    pub data_ip: String,
    pub port: u16,
}

/// Credentials handed to the transfer program. Exactly one mode is used per deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LaunchAuth {
    Password { username: String, password: String },
    Certificate { src_proxy: ProxyCredential, dst_proxy: ProxyCredential },
}

/// Body of the `mdtm_launch` RPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchCommand {
    pub task: TaskId,
    pub sjob: SJobId,
    pub block: BlockId,
    pub src: LaunchEndpoint,
    pub dst: LaunchEndpoint,
    pub port_range: PortRange,
    pub auth: LaunchAuth,
    pub src_root: String,
    pub dst_dir: String,
    pub files: Vec<FileEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum_algorithm: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaunchReply {
    #[serde(default)]
    pub error: Option<String>,
}

/// Asynchronous transfer milestone reported by the launcher agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MldStatusReport {
    pub task: TaskId,
    /// 1 = started, 2 = error, 3 = block finished.
    pub state: u8,
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub tx_bytes: u64,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateReply {
    pub code: i64,
    #[serde(default)]
    pub rate: f64,
    #[serde(default)]
    pub tx_bytes: u64,
}
