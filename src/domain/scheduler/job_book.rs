use slotmap::{SlotMap, new_key_type};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use crate::domain::model::raw_job::{JobType, RawJob, RawJobState};
use crate::domain::model::site::SiteCounters;
use crate::domain::model::sjob::SJob;
use crate::domain::utils::id::{RawJobId, SJobId, SiteId, TaskId};

new_key_type! {
    pub struct JobKey;
}

/// A raw job and its sjobs as held by the dispatch lane.
#[derive(Debug)]
pub struct JobEntry {
    pub raw: RawJob,
    pub sjobs: Vec<SJob>,
    /// Fired on cancellation; provisioning waits of this job watch it.
    pub cancel: CancellationToken,
    /// Intake is still running; the job is not schedulable yet.
    pub bootstrapping: bool,
    /// Workers spawned for this job whose outcome has not come back.
    pub pending_workers: usize,
    /// Set when the job failed; the raw job is closed with it once every worker, teardowns included, has returned.
    pub failure: Option<String>,
}

impl JobEntry {
    pub fn sjob(&self, id: &SJobId) -> Option<&SJob> {
        self.sjobs.iter().find(|s| &s.id == id)
    }

    pub fn sjob_mut(&mut self, id: &SJobId) -> Option<&mut SJob> {
        self.sjobs.iter_mut().find(|s| &s.id == id)
    }

    /// Terminal and nothing in flight, so the lane can forget it.
    pub fn is_settled(&self) -> bool {
        self.raw.state.is_terminal() && self.pending_workers == 0
    }

    /// Terminal, or failed and only waiting for its paths to be released.
    pub fn is_winding_down(&self) -> bool {
        self.raw.state.is_terminal() || self.failure.is_some()
    }
}

/// In-memory state owned by the dispatch lane.
///
/// Jobs are kept in submission order so the scheduling loop visits them
/// deterministically. Terminal jobs are evicted once their last worker reported
/// back; the store keeps their final state.
#[derive(Debug, Default)]
pub struct JobBook {
    jobs: SlotMap<JobKey, JobEntry>,
    order: Vec<JobKey>,
    raw_index: HashMap<RawJobId, JobKey>,
    /// Launcher task -> owning job, for status reports and rate replies.
    task_index: HashMap<TaskId, JobKey>,
    site_counters: HashMap<SiteId, SiteCounters>,
}

impl JobBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, raw: RawJob, sjobs: Vec<SJob>) -> JobKey {
        let id = raw.id.clone();
        let key = self.jobs.insert(JobEntry { raw, sjobs, cancel: CancellationToken::new(), bootstrapping: false, pending_workers: 0, failure: None });
        self.order.push(key);
        self.raw_index.insert(id, key);
        key
    }

    pub fn key_of(&self, id: &RawJobId) -> Option<JobKey> {
        self.raw_index.get(id).copied()
    }

    pub fn entry(&self, key: JobKey) -> Option<&JobEntry> {
        self.jobs.get(key)
    }

    pub fn entry_mut(&mut self, key: JobKey) -> Option<&mut JobEntry> {
        self.jobs.get_mut(key)
    }

    /// Keys in submission order.
    pub fn keys(&self) -> Vec<JobKey> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn register_task(&mut self, task: TaskId, key: JobKey) {
        self.task_index.insert(task, key);
    }

    pub fn locate_task(&self, task: &TaskId) -> Option<JobKey> {
        self.task_index.get(task).copied().filter(|key| self.jobs.contains_key(*key))
    }

    pub fn has_transferring_jobs(&self) -> bool {
        self.jobs.values().any(|entry| entry.raw.state == RawJobState::Transferring)
    }

    /// First best-effort sjob with a free flow slot and a waiting block, with that block's index.
    pub fn next_admission_candidate(&self) -> Option<(JobKey, SJobId, usize)> {
        self.order.iter().find_map(|key| {
            let entry = self.jobs.get(*key)?;
            if entry.bootstrapping || entry.is_winding_down() {
                return None;
            }
            entry.sjobs.iter().find_map(|sjob| {
                if sjob.job_type != JobType::BestEffort || sjob.state.is_terminal() || !sjob.has_admission_slot() {
                    return None;
                }
                sjob.next_waiting_block().map(|block| (*key, sjob.id.clone(), block))
            })
        })
    }

    pub fn site_counters(&self, site: &SiteId) -> Option<&SiteCounters> {
        self.site_counters.get(site)
    }

    /// Counters for `site`, seeded by `seed` the first time the site is touched.
    pub fn site_counters_mut<F>(&mut self, site: &SiteId, seed: F) -> &mut SiteCounters
    where
        F: FnOnce() -> SiteCounters,
    {
        self.site_counters.entry(site.clone()).or_insert_with(seed)
    }

    /// Zeroes every site's rates before a poll re-accumulates them.
    pub fn reset_site_rates(&mut self) {
        for counters in self.site_counters.values_mut() {
            counters.tx_rate = 0.0;
            counters.rx_rate = 0.0;
        }
    }

    /// Drops every settled job and returns their ids.
    pub fn evict_settled(&mut self) -> Vec<RawJobId> {
        let settled: Vec<JobKey> = self.order.iter().copied().filter(|key| self.jobs.get(*key).is_some_and(|e| e.is_settled())).collect();

        let mut evicted = Vec::with_capacity(settled.len());
        for key in settled {
            if let Some(entry) = self.jobs.remove(key) {
                self.raw_index.remove(&entry.raw.id);
                evicted.push(entry.raw.id);
            }
            self.order.retain(|k| *k != key);
            self.task_index.retain(|_, k| *k != key);
        }
        evicted
    }
}
