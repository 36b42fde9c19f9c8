use serde::{Deserialize, Serialize};

use crate::domain::model::node::{DtnRecord, SiteDescriptor};
use crate::domain::utils::id::{SJobId, TaskId};

/// Marker for "no LAN reservation held on this side".
pub const NO_PATH: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Scheduling,
    Setting,
    Transferring,
    Waiting,
    WaitingToBeTeared,
    Done,
    Error,
}

impl FlowState {
    /// Counts against the owning SJob's `max_flows`.
    pub fn is_live(&self) -> bool {
        !matches!(self, FlowState::Done | FlowState::Error | FlowState::WaitingToBeTeared)
    }

    /// A launch command has been accepted for the flow's current block.
    pub fn is_launched(&self) -> bool {
        matches!(self, FlowState::Setting | FlowState::Transferring)
    }
}

/// One side of a flow: the chosen DTN plus the site it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEndpoint {
    pub dtn: DtnRecord,
    pub site: SiteDescriptor,
}

/// What the network orchestrator built for a flow and must later release.
///
/// `wan_uuid == None` and `path_id == NO_PATH` mean "nothing to release".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedPath {
    pub wan_uuid: Option<String>,
    pub vlan_src: Option<u16>,
    pub vlan_dst: Option<u16>,
    pub src_path_id: i64,
    pub dst_path_id: i64,
    /// A dynamic WAN circuit was negotiated for this flow (longer convergence).
    pub dynamic_wan: bool,
}

impl ProvisionedPath {
    pub fn holds_resources(&self) -> bool {
        self.wan_uuid.is_some() || self.src_path_id != NO_PATH || self.dst_path_id != NO_PATH
    }
}

impl Default for ProvisionedPath {
    fn default() -> Self {
        ProvisionedPath { wan_uuid: None, vlan_src: None, vlan_dst: None, src_path_id: NO_PATH, dst_path_id: NO_PATH, dynamic_wan: false }
    }
}

/// A live DTN pairing moving one block at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub task: TaskId,
    pub sjob_id: SJobId,
    /// Index into the owning SJob's blocks of the block currently carried.
    pub block_index: Option<usize>,
    pub src: Option<FlowEndpoint>,
    pub dst: Option<FlowEndpoint>,
    pub path: ProvisionedPath,
    pub state: FlowState,
    /// Last reported rate, bytes/s.
    pub rate: f64,
    /// Bytes credited to this flow by completed blocks.
    pub tx_bytes: u64,
    /// Launcher-reported byte count of the current task at the last poll.
    pub reported_bytes: u64,
    pub start: i64,
    pub last_active: i64,
}

impl Flow {
    pub fn new(sjob_id: SJobId, block_index: usize, now: i64) -> Self {
        Flow {
            task: TaskId::generate(),
            sjob_id,
            block_index: Some(block_index),
            src: None,
            dst: None,
            path: ProvisionedPath::default(),
            state: FlowState::Scheduling,
            rate: 0.0,
            tx_bytes: 0,
            reported_bytes: 0,
            start: now,
            last_active: now,
        }
    }

    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }

    /// Both DTNs were chosen, so teardown has something to look at.
    pub fn has_pair(&self) -> bool {
        self.src.is_some() && self.dst.is_some()
    }
}
