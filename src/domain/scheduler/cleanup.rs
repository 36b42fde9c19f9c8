use std::time::Duration;

use serde_json::json;

use crate::domain::collaborators::rpc::{RpcRequest, call_checked};
use crate::domain::model::block::BlockState;
use crate::domain::model::flow::{FlowState, ProvisionedPath};
use crate::domain::model::raw_job::RawJobState;
use crate::domain::model::sjob::{SJob, SJobState};
use crate::domain::model::stage::{Stage, StageTrail};
use crate::domain::scheduler::job_book::JobKey;
use crate::domain::scheduler::lane::{SchedulerLane, WorkerOutcome};
use crate::domain::utils::id::{RawJobId, SJobId, TaskId};
use crate::error::TransferError;

pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Puts the flow's block back to `waiting` if it was in flight.
fn reset_block(sjob: &mut SJob, block_index: Option<usize>) {
    let Some(block) = block_index.and_then(|index| sjob.blocks.get_mut(index)) else {
        return;
    };
    if block.state() == BlockState::Transferring {
        if let Err(e) = block.reset_to_waiting() {
            log::warn!("SJob {}: {}", sjob.id, e);
        }
    }
}

impl SchedulerLane {
    /// Retires a live flow with `error`, tears down what it holds and fails its sjob and raw job.
    ///
    /// `fallback` is the stage marked `error` when `error` does not name one itself.
    pub(crate) fn fail_flow(&mut self, key: JobKey, sjob_id: &SJobId, task: &TaskId, error: TransferError, fallback: Stage) {
        let stage = error.failed_stage().unwrap_or(fallback);
        let Some(sjob) = self.book.entry_mut(key).and_then(|entry| entry.sjob_mut(sjob_id)) else {
            return;
        };
        let Some(flow) = sjob.flow_mut(task) else {
            return;
        };
        if !flow.is_live() {
            log::debug!("Task {}: already retired, ignoring failure: {}", task, error);
            return;
        }

        let launched = flow.state.is_launched();
        let needs_teardown = flow.has_pair() || launched;
        flow.state = FlowState::Error;
        flow.rate = 0.0;
        let block_index = flow.block_index;
        reset_block(sjob, block_index);
        log::warn!("SJob {}: task {} failed at {}: {}", sjob_id, task, stage, error);

        if needs_teardown {
            self.spawn_teardown(key, sjob_id, task, launched);
        }
        self.fail_sjob(key, sjob_id, stage, error.to_string());
    }

    fn fail_sjob(&mut self, key: JobKey, sjob_id: &SJobId, stage: Stage, message: String) {
        let Some(sjob) = self.book.entry_mut(key).and_then(|entry| entry.sjob_mut(sjob_id)) else {
            return;
        };
        sjob.stage.error(stage);
        if !sjob.state.is_terminal() {
            sjob.fail_after_teardown(message.clone());
        }
        self.persist_sjob(key, sjob_id);
        self.fail_raw(key, message);
    }

    /// Fails the raw job with `message` and aborts every sibling sjob still running.
    ///
    /// The raw job and its sjobs only turn `error` once every worker of the job,
    /// teardowns included, has reported back. The first failure's message wins.
    pub(crate) fn fail_raw(&mut self, key: JobKey, message: String) {
        let Some(entry) = self.book.entry_mut(key) else {
            return;
        };
        if entry.raw.state.is_terminal() {
            return;
        }
        if entry.failure.is_none() {
            entry.failure = Some(message.clone());
        }

        self.abort_job(key, &message);
        self.settle_failure(key);
    }

    fn abort_job(&mut self, key: JobKey, message: &str) {
        let Some(entry) = self.book.entry_mut(key) else {
            return;
        };
        let mut teardowns = Vec::new();
        let mut touched = Vec::new();

        for sjob in entry.sjobs.iter_mut().filter(|s| !s.state.is_terminal() && !s.is_failing() && !s.all_blocks_finished()) {
            let mut releasing = false;
            for index in 0..sjob.flows.len() {
                let flow = &mut sjob.flows[index];
                if !flow.is_live() {
                    continue;
                }
                let launched = flow.state.is_launched();
                if flow.state == FlowState::Scheduling {
                    // The provisioning worker releases its own pair once it reports back.
                    releasing = true;
                } else if flow.has_pair() || launched {
                    teardowns.push((sjob.id.clone(), flow.task.clone(), launched));
                    releasing = true;
                }
                flow.state = FlowState::Error;
                flow.rate = 0.0;
                let block_index = flow.block_index;
                reset_block(sjob, block_index);
            }

            let reason = format!("aborted: {}", message);
            if releasing {
                sjob.fail_after_teardown(reason);
            } else {
                sjob.fail(reason);
            }
            touched.push(sjob.id.clone());
        }

        for sjob_id in &touched {
            self.persist_sjob(key, sjob_id);
        }
        for (sjob_id, task, launched) in teardowns {
            self.spawn_teardown(key, &sjob_id, &task, launched);
        }
    }

    /// Closes a failed job as `error` once nothing of it is in flight any more.
    pub(crate) fn settle_failure(&mut self, key: JobKey) {
        let Some(entry) = self.book.entry_mut(key) else {
            return;
        };
        if entry.raw.state.is_terminal() || entry.pending_workers > 0 {
            return;
        }
        let Some(message) = entry.failure.clone() else {
            return;
        };

        let mut touched = Vec::new();
        for sjob in entry.sjobs.iter_mut().filter(|s| !s.state.is_terminal()) {
            let reason = sjob.message.clone().unwrap_or_else(|| message.clone());
            sjob.fail(reason);
            touched.push(sjob.id.clone());
        }
        for sjob_id in &touched {
            self.persist_sjob(key, sjob_id);
        }
        self.close_raw(key, RawJobState::Error, Some(message));
    }

    /// Stops the job: provisioning unwound, launched flows stopped and torn down, then raw job `error`.
    pub(crate) fn cancel_job(&mut self, id: &RawJobId) -> bool {
        let Some(key) = self.book.key_of(id) else {
            log::info!("Cancel for unknown or settled RawJob {}", id);
            return false;
        };
        let Some(entry) = self.book.entry(key) else {
            return false;
        };
        if entry.is_winding_down() {
            return false;
        }

        log::info!("RawJob {}: cancelled by user", id);
        entry.cancel.cancel();
        self.fail_raw(key, TransferError::Cancelled.to_string());
        true
    }

    /// Spawns the teardown worker for one flow. `stop` first asks the launcher to kill the task.
    ///
    /// Returns `false` when the flow holds nothing to release.
    pub(crate) fn spawn_teardown(&mut self, key: JobKey, sjob_id: &SJobId, task: &TaskId, stop: bool) -> bool {
        let Some(flow) = self.book.entry(key).and_then(|entry| entry.sjob(sjob_id)).and_then(|sjob| sjob.flow(task)) else {
            return false;
        };
        let pair = flow.src.clone().zip(flow.dst.clone());
        if pair.is_none() && !stop {
            return false;
        }
        let mut path = flow.path.clone();
        let launcher = if stop { self.ctx.graph.launcher_queue() } else { None };
        let target = flow.src.as_ref().map(|src| src.dtn.id.to_string()).unwrap_or_default();

        let progress = self.stage_observer(key, sjob_id, task);
        let ctx = self.ctx.clone();
        let sjob_id = sjob_id.clone();
        let task = task.clone();
        self.spawn_worker(Some(key), async move {
            if let Some(queue) = launcher {
                let request = RpcRequest::new("mdtm_stop", target, json!({ "task": task }));
                if let Err(e) = call_checked::<serde_json::Value>(ctx.rpc.as_ref(), &queue, request, STOP_TIMEOUT).await {
                    log::warn!("Task {}: launcher did not confirm stop: {}", task, e);
                }
            }

            let mut trail = StageTrail::observed(progress);
            let result = match &pair {
                Some((src, dst)) => ctx.network.teardown(&sjob_id, src, dst, &mut path, &mut trail).await,
                None => Ok(()),
            };
            WorkerOutcome::TornDown { key, sjob: sjob_id, task, path, trail, result }
        });
        true
    }

    pub(crate) fn on_torn_down(
        &mut self,
        key: JobKey,
        sjob_id: SJobId,
        task: TaskId,
        path: ProvisionedPath,
        trail: StageTrail,
        result: Result<(), TransferError>,
    ) {
        let Some(sjob) = self.book.entry_mut(key).and_then(|entry| entry.sjob_mut(&sjob_id)) else {
            if let Err(e) = result {
                log::error!("SJob {}: teardown of task {} failed after the job was settled: {}", sjob_id, task, e);
            }
            return;
        };
        trail.apply_to(&mut sjob.stage);
        let Some(flow) = sjob.flow_mut(&task) else {
            return;
        };
        flow.path = path;
        let retiring = flow.state == FlowState::WaitingToBeTeared;

        match result {
            Ok(()) if retiring => {
                flow.state = FlowState::Done;
                log::info!("SJob {}: task {} torn down", sjob_id, task);
                self.settle_retired_flow(key, &sjob_id);
            }
            Err(error) if retiring => {
                flow.state = FlowState::Error;
                let stage = error.failed_stage().unwrap_or(Stage::TeardownLan);
                self.fail_sjob(key, &sjob_id, stage, error.to_string());
            }
            Ok(()) => self.persist_sjob(key, &sjob_id),
            Err(error) => {
                log::error!("SJob {}: teardown of failed task {} left resources behind: {}", sjob_id, task, error);
                if let Some(failure) = self.book.entry_mut(key).and_then(|entry| entry.failure.as_mut()) {
                    failure.push_str(&format!("; teardown of task {} failed: {}", task, error));
                }
                self.persist_sjob(key, &sjob_id);
            }
        }
    }

    /// Closes the sjob once all its blocks are finished, then the raw job once every sibling is.
    pub(crate) fn settle_retired_flow(&mut self, key: JobKey, sjob_id: &SJobId) {
        if let Some(sjob) = self.book.entry_mut(key).and_then(|entry| entry.sjob_mut(sjob_id)) {
            if !sjob.state.is_terminal() && sjob.all_blocks_finished() && sjob.live_flow_count() == 0 {
                sjob.state = SJobState::Finished;
                sjob.message = None;
                log::info!("SJob {} finished: {} bytes", sjob.id, sjob.tx_bytes);
            }
        }
        self.persist_sjob(key, sjob_id);
        self.complete_raw_if_done(key);
    }

    fn complete_raw_if_done(&mut self, key: JobKey) {
        let Some(entry) = self.book.entry(key) else {
            return;
        };
        if entry.is_winding_down() || !entry.sjobs.iter().all(|s| s.state == SJobState::Finished) {
            return;
        }
        self.close_raw(key, RawJobState::Finished, None);
    }
}
