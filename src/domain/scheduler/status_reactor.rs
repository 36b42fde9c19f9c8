use serde_json::json;

use crate::api::launcher_dto::MldStatusReport;
use crate::api::portal_dto::ChecksumReply;
use crate::domain::collaborators::portal::{PortalCommand, send_command};
use crate::domain::collaborators::site_store::SiteStore;
use crate::domain::model::block::{BlockState, FileEntry};
use crate::domain::model::flow::FlowState;
use crate::domain::model::raw_job::RawJobState;
use crate::domain::model::site::{SiteCounters, apply_delta};
use crate::domain::model::sjob::SJobState;
use crate::domain::model::stage::Stage;
use crate::domain::scheduler::SchedulerContext;
use crate::domain::scheduler::intake::site_descriptor;
use crate::domain::scheduler::job_book::JobKey;
use crate::domain::scheduler::lane::{SchedulerLane, WorkerOutcome};
use crate::domain::scheduler::mdtm;
use crate::domain::utils::id::{SJobId, SiteId, StorageId, TaskId};
use crate::error::TransferError;

/// A block failing verification is re-sent at most this many times.
pub const MAX_CHECKSUM_RETRIES: u32 = 2;

const STARTED: u8 = 1;
const FAILED: u8 = 2;
const BLOCK_FINISHED: u8 = 3;

#[derive(Debug, Clone)]
pub struct ChecksumRequest {
    pub dst_site: SiteId,
    pub dst_storage: StorageId,
    pub dst_dir: String,
    pub algorithm: String,
    pub files: Vec<FileEntry>,
}

/// Asks the destination site to compare the landed files against their source checksums.
pub async fn verify_block(ctx: &SchedulerContext, request: &ChecksumRequest) -> Result<(), TransferError> {
    let site = site_descriptor(ctx, &request.dst_site)?;
    let params = json!({
        "storage": request.dst_storage,
        "dst_dir": request.dst_dir,
        "algorithm": request.algorithm,
        "files": request.files,
    });
    let reply: ChecksumReply = send_command(ctx.portal.as_ref(), &site.url, PortalCommand::VerifyChecksum, params).await?;

    if reply.matched() {
        Ok(())
    } else {
        Err(TransferError::Verification(format!(
            "{} file(s) differ at {}: {}",
            reply.mismatched.len(),
            request.dst_site,
            reply.mismatched.join(", ")
        )))
    }
}

pub(crate) fn seed_counters(store: &dyn SiteStore, site: &SiteId) -> SiteCounters {
    store
        .get_site(site)
        .map(|s| SiteCounters { tx_bytes: s.tx_bytes, rx_bytes: s.rx_bytes, ..SiteCounters::default() })
        .unwrap_or_default()
}

impl SchedulerLane {
    /// Applies one `mld_status` report. Returns `false` when the task is not known.
    pub(crate) fn on_mld_status(&mut self, report: MldStatusReport) -> bool {
        let task = report.task.clone();
        let Some(key) = self.book.locate_task(&task) else {
            log::warn!("mld_status {} for unknown task {}", report.state, task);
            return false;
        };
        let Some(sjob_id) = self
            .book
            .entry(key)
            .and_then(|entry| entry.sjobs.iter().find(|s| s.flow(&task).is_some()))
            .map(|s| s.id.clone())
        else {
            return false;
        };

        match report.state {
            STARTED => self.on_transfer_started(key, &sjob_id, &task),
            FAILED => {
                let launched = self.book.entry(key).and_then(|e| e.sjob(&sjob_id)).and_then(|s| s.flow(&task)).is_some_and(|f| f.state.is_launched());
                if !launched {
                    log::info!("Task {}: error report for a flow that is no longer running, ignored", task);
                    return true;
                }
                let mut message = mdtm::describe(report.code);
                if let Some(detail) = report.message.filter(|m| !m.is_empty()) {
                    message = format!("{} ({})", message, detail);
                }
                self.fail_flow(key, &sjob_id, &task, TransferError::Transfer { code: report.code, message }, Stage::TransferTransfer);
            }
            BLOCK_FINISHED => self.on_block_finished(key, &sjob_id, &task),
            other => {
                log::warn!("Task {}: unsupported mld_status state {}", task, other);
                return false;
            }
        }
        true
    }

    fn on_transfer_started(&mut self, key: JobKey, sjob_id: &SJobId, task: &TaskId) {
        let now = self.ctx.now();
        let Some(entry) = self.book.entry_mut(key) else {
            return;
        };
        let Some(sjob) = entry.sjobs.iter_mut().find(|s| &s.id == sjob_id) else {
            return;
        };
        let Some(flow) = sjob.flow_mut(task) else {
            return;
        };
        if !flow.state.is_launched() {
            log::debug!("Task {}: start report for a flow in state {:?}, ignored", task, flow.state);
            return;
        }

        flow.state = FlowState::Transferring;
        flow.last_active = now;
        let block_index = flow.block_index;
        if let Some(block) = block_index.and_then(|index| sjob.blocks.get_mut(index)) {
            block.start = Some(now);
        }
        sjob.state = SJobState::Transferring;
        sjob.stage.working(Stage::TransferTransfer);
        log::info!("SJob {}: task {} is moving data", sjob_id, task);

        let raw_started = entry.raw.state == RawJobState::Waiting;
        if raw_started {
            entry.raw.state = RawJobState::Transferring;
        }
        self.persist_sjob(key, sjob_id);
        if raw_started {
            self.persist_raw_state(key);
        }
    }

    fn on_block_finished(&mut self, key: JobKey, sjob_id: &SJobId, task: &TaskId) {
        let now = self.ctx.now();
        let config = self.ctx.config.clone();
        let Some(sjob) = self.book.entry_mut(key).and_then(|entry| entry.sjob_mut(sjob_id)) else {
            return;
        };
        let Some(flow) = sjob.flow_mut(task) else {
            return;
        };
        if !flow.state.is_launched() {
            log::debug!("Task {}: block report for a flow in state {:?}, ignored", task, flow.state);
            return;
        }
        flow.last_active = now;
        flow.rate = 0.0;
        let flow_start = flow.start;
        let Some(index) = flow.block_index else {
            return;
        };
        let Some(block) = sjob.blocks.get_mut(index) else {
            return;
        };
        if block.state() != BlockState::Transferring {
            log::warn!("SJob {}: block {} reported finished while {:?}", sjob_id, block.id, block.state());
            return;
        }

        let elapsed = (now - block.start.unwrap_or(flow_start)).max(1);
        block.avg_rate = block.size as f64 / elapsed as f64;
        let credited = block.credit_remaining();
        let verify = config.checksum.enabled && block.has_checksums();
        let block_bytes = block.tx_bytes;
        let files = block.files.clone();
        log::info!("SJob {}: block {} done, {} bytes in {}s ({:.0} B/s)", sjob_id, block.id, block.size, elapsed, block.avg_rate);

        sjob.stage.success(Stage::TransferTransfer);
        if verify {
            if let Some(flow) = sjob.flow_mut(task) {
                flow.state = FlowState::Waiting;
            }
            sjob.state = SJobState::ChecksumVerification;
            sjob.stage.working(Stage::ChecksumVerification);
        }
        let request = ChecksumRequest {
            dst_site: sjob.dst_site.clone(),
            dst_storage: sjob.dst_storage.clone(),
            dst_dir: sjob.dst_path.clone(),
            algorithm: config.checksum.algorithm.clone(),
            files,
        };

        self.propagate_bytes(key, sjob_id, task, credited as i64);
        self.persist_sjob(key, sjob_id);

        if verify {
            let ctx = self.ctx.clone();
            let (sjob, task) = (sjob_id.clone(), task.clone());
            self.spawn_worker(Some(key), async move {
                let result = verify_block(&ctx, &request).await;
                WorkerOutcome::ChecksumVerified { key, sjob, task, credited: block_bytes, result }
            });
        } else {
            self.finish_block(key, sjob_id, task);
        }
    }

    pub(crate) fn on_checksum_verified(&mut self, key: JobKey, sjob_id: SJobId, task: TaskId, credited: u64, result: Result<(), TransferError>) {
        let Some(sjob) = self.book.entry_mut(key).and_then(|entry| entry.sjob_mut(&sjob_id)) else {
            return;
        };
        let Some(flow) = sjob.flow(&task) else {
            return;
        };
        if flow.state != FlowState::Waiting {
            log::debug!("Task {}: checksum result ignored, flow is {:?}", task, flow.state);
            return;
        }
        let block_index = flow.block_index;

        let error = match result {
            Ok(()) => {
                sjob.stage.success(Stage::ChecksumVerification);
                self.finish_block(key, &sjob_id, &task);
                return;
            }
            Err(error @ TransferError::Verification(_)) => error,
            Err(error) => {
                self.fail_flow(key, &sjob_id, &task, error, Stage::ChecksumVerification);
                return;
            }
        };

        let Some(block) = block_index.and_then(|index| sjob.blocks.get_mut(index)) else {
            return;
        };
        block.retrogress(credited);
        block.checksum_retry += 1;
        let attempt = block.checksum_retry;
        let retry = attempt <= MAX_CHECKSUM_RETRIES;
        if retry {
            if let Err(e) = block.reset_to_waiting() {
                log::warn!("SJob {}: {}", sjob_id, e);
            }
            sjob.stage.error(Stage::ChecksumVerification);
            sjob.transfer_retry += 1;
        }
        self.propagate_bytes(key, &sjob_id, &task, -(credited as i64));

        if retry {
            log::warn!("SJob {}: {}, re-sending block (retry {}/{})", sjob_id, error, attempt, MAX_CHECKSUM_RETRIES);
            self.begin_launch(key, sjob_id, task);
        } else {
            self.fail_flow(key, &sjob_id, &task, error, Stage::ChecksumVerification);
        }
    }

    /// Marks the flow's block finished and moves the flow on to the next waiting block, or retires it.
    fn finish_block(&mut self, key: JobKey, sjob_id: &SJobId, task: &TaskId) {
        let now = self.ctx.now();
        let Some(sjob) = self.book.entry_mut(key).and_then(|entry| entry.sjob_mut(sjob_id)) else {
            return;
        };
        let Some(index) = sjob.flow(task).and_then(|f| f.block_index) else {
            return;
        };
        if let Some(block) = sjob.blocks.get_mut(index) {
            if let Err(e) = block.finish(now) {
                log::warn!("SJob {}: {}", sjob_id, e);
            }
        }

        match sjob.next_waiting_block_for(task) {
            Some(next) => {
                if let Some(flow) = sjob.flow_mut(task) {
                    flow.block_index = Some(next);
                }
                log::info!("SJob {}: task {} continues with block {}", sjob_id, task, next);
                self.begin_launch(key, sjob_id.clone(), task.clone());
            }
            None => {
                if let Some(flow) = sjob.flow_mut(task) {
                    flow.state = FlowState::WaitingToBeTeared;
                }
                if sjob.all_blocks_finished() {
                    sjob.state = SJobState::SdnTeardown;
                }
                self.persist_sjob(key, sjob_id);

                if !self.spawn_teardown(key, sjob_id, task, false) {
                    if let Some(flow) = self.book.entry_mut(key).and_then(|e| e.sjob_mut(sjob_id)).and_then(|s| s.flow_mut(task)) {
                        flow.state = FlowState::Done;
                    }
                    self.settle_retired_flow(key, sjob_id);
                }
            }
        }
    }

    /// Moves `delta` transferred bytes through flow, sjob, raw job and both sites' counters.
    pub(crate) fn propagate_bytes(&mut self, key: JobKey, sjob_id: &SJobId, task: &TaskId, delta: i64) {
        if delta == 0 {
            return;
        }
        let store = self.ctx.store.clone();
        let Some(entry) = self.book.entry_mut(key) else {
            return;
        };
        entry.raw.tx_bytes = apply_delta(entry.raw.tx_bytes, delta);
        let raw_id = entry.raw.id.clone();
        let Some(sjob) = entry.sjob_mut(sjob_id) else {
            return;
        };
        sjob.tx_bytes = apply_delta(sjob.tx_bytes, delta);
        if let Some(flow) = sjob.flow_mut(task) {
            flow.tx_bytes = apply_delta(flow.tx_bytes, delta);
        }
        let (src, dst) = (sjob.src_site.clone(), sjob.dst_site.clone());

        if let Err(e) = store.increment_rawjob_tx_bytes(&raw_id, delta) {
            log::error!("RawJob {}: could not persist byte counter: {}", raw_id, e);
        }
        self.book.site_counters_mut(&src, || seed_counters(store.as_ref(), &src)).credit_tx(delta);
        self.book.site_counters_mut(&dst, || seed_counters(store.as_ref(), &dst)).credit_rx(delta);
        for (site, tx, rx) in [(&src, delta, 0), (&dst, 0, delta)] {
            if let Err(e) = store.increment_site_bytes(site, tx, rx) {
                log::error!("Site {}: could not persist byte counters: {}", site, e);
            }
        }
    }
}
