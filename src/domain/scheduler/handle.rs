use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::job_dto::{JobStatus, JobSubmissionDto};
use crate::api::launcher_dto::MldStatusReport;
use crate::domain::clock::Clock;
use crate::domain::model::raw_job::RawJob;
use crate::domain::scheduler::lane::SchedulerMessage;
use crate::domain::utils::id::RawJobId;
use crate::error::{Error, Result};

/// Cloneable front door of the dispatch lane.
///
/// Every method sends one message and waits for the lane's reply.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerMessage>,
    clock: Arc<dyn Clock>,
}

impl SchedulerHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<SchedulerMessage>, clock: Arc<dyn Clock>) -> Self {
        SchedulerHandle { tx, clock }
    }

    async fn call<R, F>(&self, msg_builder: F) -> Result<R>
    where
        F: FnOnce(oneshot::Sender<R>) -> SchedulerMessage,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(msg_builder(reply_tx)).map_err(|_| Error::LaneClosed)?;
        reply_rx.await.map_err(|_| Error::LaneClosed)
    }

    /// Converts a user submission into a `waiting` raw job and hands it to intake.
    pub async fn submit(&self, submission: JobSubmissionDto) -> Result<RawJobId> {
        let job = submission.into_raw_job(self.clock.get_current_time_in_s()).map_err(Error::InvalidSubmission)?;
        self.submit_job(job).await
    }

    pub async fn submit_job(&self, job: RawJob) -> Result<RawJobId> {
        self.call(|tx| SchedulerMessage::Submit { job, reply_to: tx }).await?
    }

    /// `false` when the job is unknown or already terminal.
    pub async fn cancel_job(&self, id: &RawJobId) -> Result<bool> {
        let id = id.clone();
        self.call(|tx| SchedulerMessage::Cancel { id, reply_to: tx }).await
    }

    pub async fn job_status(&self, id: &RawJobId) -> Result<Option<JobStatus>> {
        let id = id.clone();
        self.call(|tx| SchedulerMessage::Status { id, reply_to: tx }).await
    }

    pub async fn schedule_tick(&self) -> Result<()> {
        self.call(|tx| SchedulerMessage::ScheduleTick { done: tx }).await
    }

    pub async fn poll_rates(&self) -> Result<()> {
        self.call(|tx| SchedulerMessage::RateTick { done: tx }).await
    }

    /// Feeds an `mld_status` report from the launcher. `false` when the task is unknown.
    pub async fn report_mld_status(&self, report: MldStatusReport) -> Result<bool> {
        self.call(|tx| SchedulerMessage::MldStatus { report, reply_to: tx }).await
    }

    /// Resolves once no worker task is in flight.
    pub async fn wait_idle(&self) -> Result<()> {
        self.call(|tx| SchedulerMessage::WhenIdle { reply_to: tx }).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.call(|tx| SchedulerMessage::Shutdown { reply_to: tx }).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Schedule,
    Rate,
}

/// Starts the scheduling and rate timers. Each waits for its tick to be handled before sleeping again.
pub fn spawn_periodic_timers(
    handle: &SchedulerHandle,
    schedule_interval: Duration,
    rate_interval: Duration,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(run_timer(handle.clone(), TimerKind::Schedule, schedule_interval, shutdown.clone())),
        tokio::spawn(run_timer(handle.clone(), TimerKind::Rate, rate_interval, shutdown)),
    ]
}

async fn run_timer(handle: SchedulerHandle, kind: TimerKind, interval: Duration, shutdown: CancellationToken) {
    log::debug!("{:?} timer armed every {:?}", kind, interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let tick = match kind {
            TimerKind::Schedule => handle.schedule_tick().await,
            TimerKind::Rate => handle.poll_rates().await,
        };
        if let Err(e) = tick {
            log::warn!("{:?} timer stopped: {}", kind, e);
            break;
        }
    }
}
