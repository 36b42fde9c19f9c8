use serde::{Deserialize, Serialize};

use crate::domain::model::block::FileEntry;
use crate::domain::model::node::DtnRecord;

/// Reply of `get_available_best_effort_dtn`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AvailableDtnsReply {
    #[serde(default)]
    pub private: Vec<DtnRecord>,
    #[serde(default)]
    pub public: Vec<DtnRecord>,
}

/// Reply of `get_dtn_info`: disk usage of the queried storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DtnInfoReply {
    pub free_bytes: u64,
    #[serde(default)]
    pub total_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileGroupDto {
    pub root: String,
    pub files: Vec<FileEntry>,
}

/// Reply of `file_expand_and_group`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpandAndGroupReply {
    #[serde(default)]
    pub groups: Vec<FileGroupDto>,
}

/// Reply of `sdn_reserve_request`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SdnReserveReply {
    pub path_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingReply {
    pub reachable: bool,
    #[serde(default)]
    pub rtt_ms: Option<f64>,
}

/// Reply of `verify_checksum`; any listed file failed verification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChecksumReply {
    #[serde(default)]
    pub mismatched: Vec<String>,
}

impl ChecksumReply {
    pub fn matched(&self) -> bool {
        self.mismatched.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WanCreateReply {
    pub uuid: String,
}

/// VLANs the WAN broker actually granted; `None` keeps the requested tag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WanReserveReply {
    #[serde(default)]
    pub vlan_src: Option<u16>,
    #[serde(default)]
    pub vlan_dst: Option<u16>,
}
