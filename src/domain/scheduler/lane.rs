use std::future::Future;
use tokio::sync::{mpsc, oneshot};

use crate::api::job_dto::JobStatus;
use crate::api::launcher_dto::MldStatusReport;
use crate::domain::model::flow::{FlowState, ProvisionedPath};
use crate::domain::model::raw_job::{RawJob, RawJobState};
use crate::domain::model::sjob::{SJob, SJobState};
use crate::domain::model::stage::{Stage, StageObserver, StageStatus, StageTrail};
use crate::domain::scheduler::SchedulerContext;
use crate::domain::scheduler::admission::Provision;
use crate::domain::scheduler::job_book::{JobBook, JobKey};
use crate::domain::scheduler::rate_poller::RateSample;
use crate::domain::telemetry::time_series::{ANALYTICS_TARGET, MetricLevel, MetricPoint};
use crate::domain::utils::id::{RawJobId, SJobId, TaskId};
use crate::error::{Error, TransferError};

/// Everything the dispatch lane reacts to. Requests from the handle carry a reply channel.
#[derive(Debug)]
pub enum SchedulerMessage {
    Submit {
        job: RawJob,
        reply_to: oneshot::Sender<Result<RawJobId, Error>>,
    },

    Cancel {
        id: RawJobId,
        reply_to: oneshot::Sender<bool>,
    },

    Status {
        id: RawJobId,
        reply_to: oneshot::Sender<Option<JobStatus>>,
    },

    /// Answered as soon as the tick's admission has been dispatched.
    ScheduleTick {
        done: oneshot::Sender<()>,
    },

    /// Answered once the polled rates have been applied.
    RateTick {
        done: oneshot::Sender<()>,
    },

    MldStatus {
        report: MldStatusReport,
        reply_to: oneshot::Sender<bool>,
    },

    Worker(WorkerOutcome),

    /// A provisioning or teardown worker moved to another stage. Does not end the worker.
    Progress {
        key: JobKey,
        sjob: SJobId,
        task: TaskId,
        stage: Stage,
        status: StageStatus,
    },

    WhenIdle {
        reply_to: oneshot::Sender<()>,
    },

    Shutdown {
        reply_to: oneshot::Sender<()>,
    },
}

/// Result of remote work done off the lane.
#[derive(Debug)]
pub enum WorkerOutcome {
    Bootstrapped {
        key: JobKey,
        raw: RawJob,
        result: Result<Vec<SJob>, TransferError>,
    },

    Provisioned {
        key: JobKey,
        sjob: SJobId,
        task: TaskId,
        provision: Provision,
    },

    Launched {
        key: JobKey,
        sjob: SJobId,
        task: TaskId,
        result: Result<(), TransferError>,
    },

    ChecksumVerified {
        key: JobKey,
        sjob: SJobId,
        task: TaskId,
        /// Bytes credited when the block was reported finished.
        credited: u64,
        result: Result<(), TransferError>,
    },

    TornDown {
        key: JobKey,
        sjob: SJobId,
        task: TaskId,
        path: ProvisionedPath,
        trail: StageTrail,
        result: Result<(), TransferError>,
    },

    RatesPolled {
        samples: Vec<RateSample>,
        done: oneshot::Sender<()>,
    },
}

impl WorkerOutcome {
    fn job_key(&self) -> Option<JobKey> {
        match self {
            WorkerOutcome::Bootstrapped { key, .. }
            | WorkerOutcome::Provisioned { key, .. }
            | WorkerOutcome::Launched { key, .. }
            | WorkerOutcome::ChecksumVerified { key, .. }
            | WorkerOutcome::TornDown { key, .. } => Some(*key),
            WorkerOutcome::RatesPolled { .. } => None,
        }
    }
}

/// Single consumer owning all mutable job state.
///
/// Nothing here awaits a remote call: remote work is spawned onto worker tasks
/// whose [`WorkerOutcome`] comes back through the same queue, so job mutations
/// are serialized while network I/O runs in parallel.
#[derive(Debug)]
pub struct SchedulerLane {
    pub(crate) ctx: SchedulerContext,
    pub(crate) book: JobBook,
    tx: mpsc::UnboundedSender<SchedulerMessage>,
    in_flight: usize,
    idle_waiters: Vec<oneshot::Sender<()>>,
}

impl SchedulerLane {
    pub fn new(ctx: SchedulerContext, tx: mpsc::UnboundedSender<SchedulerMessage>) -> Self {
        SchedulerLane { ctx, book: JobBook::new(), tx, in_flight: 0, idle_waiters: Vec::new() }
    }

    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SchedulerMessage>) {
        log::info!("Scheduler lane started for site {}", self.ctx.graph.local_site());
        self.resume();

        while let Some(message) = rx.recv().await {
            let stop = self.handle(message);

            for id in self.book.evict_settled() {
                log::debug!("RawJob {} settled, dropped from the job book", id);
            }
            self.notify_idle();

            if stop {
                break;
            }
        }

        log::info!("Scheduler lane stopped ({} job(s) still in memory, {} worker(s) in flight)", self.book.len(), self.in_flight);
    }

    /// Returns `true` when the lane should stop.
    pub(crate) fn handle(&mut self, message: SchedulerMessage) -> bool {
        match message {
            SchedulerMessage::Submit { job, reply_to } => {
                let _ = reply_to.send(self.submit(job));
            }
            SchedulerMessage::Cancel { id, reply_to } => {
                let _ = reply_to.send(self.cancel_job(&id));
            }
            SchedulerMessage::Status { id, reply_to } => {
                let _ = reply_to.send(self.job_status(&id));
            }
            SchedulerMessage::ScheduleTick { done } => {
                self.schedule();
                let _ = done.send(());
            }
            SchedulerMessage::RateTick { done } => self.begin_rate_poll(done),
            SchedulerMessage::MldStatus { report, reply_to } => {
                let _ = reply_to.send(self.on_mld_status(report));
            }
            SchedulerMessage::Worker(outcome) => self.on_worker(outcome),
            SchedulerMessage::Progress { key, sjob, task, stage, status } => self.on_progress(key, sjob, task, stage, status),
            SchedulerMessage::WhenIdle { reply_to } => {
                if self.in_flight == 0 {
                    let _ = reply_to.send(());
                } else {
                    self.idle_waiters.push(reply_to);
                }
            }
            SchedulerMessage::Shutdown { reply_to } => {
                self.ctx.sink.flush();
                let _ = reply_to.send(());
                return true;
            }
        }
        false
    }

    fn on_worker(&mut self, outcome: WorkerOutcome) {
        self.in_flight = self.in_flight.saturating_sub(1);
        let key = outcome.job_key();
        if let Some(entry) = key.and_then(|key| self.book.entry_mut(key)) {
            entry.pending_workers = entry.pending_workers.saturating_sub(1);
        }

        match outcome {
            WorkerOutcome::Bootstrapped { key, raw, result } => self.on_bootstrapped(key, raw, result),
            WorkerOutcome::Provisioned { key, sjob, task, provision } => self.on_provisioned(key, sjob, task, provision),
            WorkerOutcome::Launched { key, sjob, task, result } => self.on_launched(key, sjob, task, result),
            WorkerOutcome::ChecksumVerified { key, sjob, task, credited, result } => self.on_checksum_verified(key, sjob, task, credited, result),
            WorkerOutcome::TornDown { key, sjob, task, path, trail, result } => self.on_torn_down(key, sjob, task, path, trail, result),
            WorkerOutcome::RatesPolled { samples, done } => self.on_rates_polled(samples, done),
        }

        if let Some(key) = key {
            self.settle_failure(key);
        }
    }

    /// Replays one stage transition of a running worker onto its sjob.
    ///
    /// Setup stages only count while the flow is still provisioning; teardown
    /// stages only once the sjob has no live flow left.
    fn on_progress(&mut self, key: JobKey, sjob_id: SJobId, task: TaskId, stage: Stage, status: StageStatus) {
        let Some(sjob) = self.book.entry_mut(key).and_then(|entry| entry.sjob_mut(&sjob_id)) else {
            return;
        };
        if sjob.state.is_terminal() {
            return;
        }
        let relevant = match stage {
            Stage::TeardownLan | Stage::TeardownWan => sjob.live_flow_count() == 0,
            _ => sjob.flow(&task).is_some_and(|f| f.state == FlowState::Scheduling),
        };
        if !relevant {
            return;
        }

        sjob.stage.set(stage, status);
        if status == StageStatus::Working {
            if let Some(state) = SJobState::while_working(stage) {
                log::debug!("SJob {}: {:?} -> {:?} ({})", sjob_id, sjob.state, state, stage);
                sjob.state = state;
            }
        }
        self.persist_sjob(key, &sjob_id);
    }

    /// Observer forwarding a worker's stage transitions for `task` back into the lane.
    pub(crate) fn stage_observer(&self, key: JobKey, sjob: &SJobId, task: &TaskId) -> StageObserver {
        let tx = self.tx.clone();
        let (sjob, task) = (sjob.clone(), task.clone());
        StageObserver::new(move |stage, status| {
            let _ = tx.send(SchedulerMessage::Progress { key, sjob: sjob.clone(), task: task.clone(), stage, status });
        })
    }

    /// Runs `work` on the runtime and feeds its outcome back into the lane.
    pub(crate) fn spawn_worker<F>(&mut self, key: Option<JobKey>, work: F)
    where
        F: Future<Output = WorkerOutcome> + Send + 'static,
    {
        self.in_flight += 1;
        if let Some(entry) = key.and_then(|key| self.book.entry_mut(key)) {
            entry.pending_workers += 1;
        }

        let tx = self.tx.clone();
        tokio::spawn(async move {
            let outcome = work.await;
            if tx.send(SchedulerMessage::Worker(outcome)).is_err() {
                log::debug!("Scheduler lane is gone, worker outcome dropped");
            }
        });
    }

    fn notify_idle(&mut self) {
        if self.in_flight > 0 {
            return;
        }
        for waiter in self.idle_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn job_status(&self, id: &RawJobId) -> Option<JobStatus> {
        if let Some(entry) = self.book.key_of(id).and_then(|key| self.book.entry(key)) {
            return Some(JobStatus { raw: entry.raw.clone(), sjobs: entry.sjobs.clone() });
        }

        let raw = self.ctx.store.get_rawjob(id)?;
        let sjobs = self.ctx.store.get_sjobs_from_rawjob(id);
        Some(JobStatus { raw, sjobs })
    }

    pub(crate) fn persist_sjob(&self, key: JobKey, sjob_id: &SJobId) {
        let Some(sjob) = self.book.entry(key).and_then(|entry| entry.sjob(sjob_id)) else {
            return;
        };
        if let Err(e) = self.ctx.store.update_sjob(sjob) {
            log::error!("SJob {}: could not persist: {}", sjob_id, e);
        }
    }

    pub(crate) fn persist_raw_state(&self, key: JobKey) {
        let Some(entry) = self.book.entry(key) else {
            return;
        };
        if let Err(e) = self.ctx.store.update_rawjob_state(&entry.raw.id, entry.raw.state, entry.raw.message.clone()) {
            log::error!("RawJob {}: could not persist state {:?}: {}", entry.raw.id, entry.raw.state, e);
        }
    }

    /// Moves the raw job to `finished` or `error`, persists it and records the analytics event.
    pub(crate) fn close_raw(&mut self, key: JobKey, state: RawJobState, message: Option<String>) {
        let Some(entry) = self.book.entry_mut(key) else {
            return;
        };
        if entry.raw.state.is_terminal() {
            return;
        }
        entry.raw.state = state;
        entry.raw.message = message;

        self.persist_raw_state(key);
        self.record_terminal(key);
    }

    fn record_terminal(&self, key: JobKey) {
        let Some(entry) = self.book.entry(key) else {
            return;
        };
        let raw = &entry.raw;
        let now = self.ctx.now();
        let elapsed = (now - raw.submitted_at).max(1);
        let average_rate = raw.tx_bytes as f64 / elapsed as f64;

        match raw.state {
            RawJobState::Finished => log::info!("RawJob {} finished: {} bytes in {}s", raw.id, raw.tx_bytes, elapsed),
            _ => log::error!("RawJob {} failed: {}", raw.id, raw.message.as_deref().unwrap_or("unknown error")),
        }
        tracing::info!(
            target: ANALYTICS_TARGET,
            raw_job = %raw.id,
            user = %raw.user,
            state = ?raw.state,
            size = raw.size,
            tx_bytes = raw.tx_bytes,
            elapsed_s = elapsed,
            average_rate,
            "raw job reached a terminal state"
        );

        self.ctx.sink.record(MetricPoint {
            time: now,
            level: MetricLevel::RawJob,
            id: raw.id.to_string(),
            rate: average_rate,
            delta_bytes: 0,
            tx_bytes: raw.tx_bytes,
            description: match &raw.message {
                Some(message) => format!("{:?}: {}", raw.state, message),
                None => format!("{:?}", raw.state),
            },
        });
    }
}
