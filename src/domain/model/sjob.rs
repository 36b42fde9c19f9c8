use serde::{Deserialize, Serialize};

use crate::domain::model::block::{Block, BlockState};
use crate::domain::model::flow::Flow;
use crate::domain::model::raw_job::JobType;
use crate::domain::model::stage::{Stage, StageMap};
use crate::domain::utils::id::{RawJobId, SJobId, SiteId, StorageId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SJobState {
    Bootstrap,
    DtnMatching,
    PathVerification,
    SdnSetup,
    WanSetup,
    Launching,
    Transferring,
    ChecksumVerification,
    SdnTeardown,
    WanTeardown,
    Finished,
    Error,
}

impl SJobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SJobState::Finished | SJobState::Error)
    }

    pub fn is_teardown(&self) -> bool {
        matches!(self, SJobState::SdnTeardown | SJobState::WanTeardown)
    }

    /// The state an sjob reports while a provisioning or teardown `stage` is in progress.
    pub fn while_working(stage: Stage) -> Option<SJobState> {
        match stage {
            Stage::DtnMatching => Some(SJobState::DtnMatching),
            Stage::NetworkWan => Some(SJobState::WanSetup),
            Stage::NetworkLanSrc | Stage::NetworkLanDst => Some(SJobState::SdnSetup),
            Stage::PathVerification => Some(SJobState::PathVerification),
            Stage::TeardownLan => Some(SJobState::SdnTeardown),
            Stage::TeardownWan => Some(SJobState::WanTeardown),
            _ => None,
        }
    }
}

/// Per-source-storage decomposition of a RawJob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SJob {
    pub id: SJobId,
    pub raw_job_id: RawJobId,
    pub job_type: JobType,
    pub src_site: SiteId,
    pub src_storage: StorageId,
    pub dst_site: SiteId,
    pub dst_storage: StorageId,
    /// Destination directory on the destination storage.
    pub dst_path: String,
    pub blocks: Vec<Block>,
    pub flows: Vec<Flow>,
    /// Admission cap on concurrently live flows.
    pub max_flows: usize,
    /// Blocks re-sent after a failed checksum verification.
    pub transfer_retry: u32,
    /// LAN reservation attempts repeated after a refusal.
    pub path_retry: u32,
    pub stage: StageMap,
    pub state: SJobState,
    pub message: Option<String>,
    pub size: u64,
    pub tx_bytes: u64,
}

impl SJob {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        raw_job_id: RawJobId,
        job_type: JobType,
        src_site: SiteId,
        src_storage: StorageId,
        dst_site: SiteId,
        dst_storage: StorageId,
        dst_path: impl Into<String>,
        blocks: Vec<Block>,
    ) -> Self {
        let size = blocks.iter().map(|b| b.size).sum();
        SJob {
            id: SJobId::generate(),
            raw_job_id,
            job_type,
            src_site,
            src_storage,
            dst_site,
            dst_storage,
            dst_path: dst_path.into(),
            blocks,
            flows: Vec::new(),
            max_flows: 1,
            transfer_retry: 0,
            path_retry: 0,
            stage: StageMap::seeded(),
            state: SJobState::Bootstrap,
            message: None,
            size,
            tx_bytes: 0,
        }
    }

    pub fn live_flow_count(&self) -> usize {
        self.flows.iter().filter(|f| f.is_live()).count()
    }

    pub fn has_admission_slot(&self) -> bool {
        self.live_flow_count() < self.max_flows
    }

    /// First `waiting` block that no live flow is currently carrying.
    pub fn next_waiting_block(&self) -> Option<usize> {
        self.blocks.iter().enumerate().position(|(index, block)| {
            block.state() == BlockState::Waiting && !self.flows.iter().any(|f| f.is_live() && f.block_index == Some(index))
        })
    }

    /// Same as [`SJob::next_waiting_block`] but ignores the flow that is asking.
    pub fn next_waiting_block_for(&self, task: &TaskId) -> Option<usize> {
        self.blocks.iter().enumerate().position(|(index, block)| {
            block.state() == BlockState::Waiting && !self.flows.iter().any(|f| &f.task != task && f.is_live() && f.block_index == Some(index))
        })
    }

    pub fn all_blocks_finished(&self) -> bool {
        self.blocks.iter().all(|b| b.state() == BlockState::Finished)
    }

    pub fn flow(&self, task: &TaskId) -> Option<&Flow> {
        self.flows.iter().find(|f| &f.task == task)
    }

    pub fn flow_mut(&mut self, task: &TaskId) -> Option<&mut Flow> {
        self.flows.iter_mut().find(|f| &f.task == task)
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.state = SJobState::Error;
        self.message = Some(message.into());
    }

    /// Failed, but its paths are still being released; [`SJob::fail`] follows once they are.
    pub fn fail_after_teardown(&mut self, message: impl Into<String>) {
        self.state = SJobState::SdnTeardown;
        self.message = Some(message.into());
    }

    pub fn is_failing(&self) -> bool {
        self.state.is_teardown() && self.message.is_some()
    }
}
