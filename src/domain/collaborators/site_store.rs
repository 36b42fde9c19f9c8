use slotmap::{SlotMap, new_key_type};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::domain::collaborators::proxy::UserCredential;
use crate::domain::model::raw_job::{RawJob, RawJobState};
use crate::domain::model::site::{Site, apply_delta};
use crate::domain::model::sjob::SJob;
use crate::domain::utils::id::{RawJobId, SJobId, SiteId};
use crate::error::StoreError;

/// Persistence for raw jobs, sjobs (blocks and flows embedded), sites and user credentials.
///
/// Only named operations are exposed; implementations provide their own thread safety.
pub trait SiteStore: std::fmt::Debug + Send + Sync {
    fn insert_rawjob(&self, job: RawJob) -> Result<(), StoreError>;
    fn get_rawjob(&self, id: &RawJobId) -> Option<RawJob>;
    /// Raw jobs in any of `states`, in submission order.
    fn get_rawjobs_from_state(&self, states: &[RawJobState]) -> Vec<RawJob>;
    fn update_rawjob(&self, job: &RawJob) -> Result<(), StoreError>;
    fn update_rawjob_state(&self, id: &RawJobId, state: RawJobState, message: Option<String>) -> Result<(), StoreError>;
    /// Returns the new counter value.
    fn increment_rawjob_tx_bytes(&self, id: &RawJobId, delta: i64) -> Result<u64, StoreError>;

    /// Drops every sjob of `raw` and stores `sjobs` in its place.
    fn replace_sjobs(&self, raw: &RawJobId, sjobs: Vec<SJob>);
    fn update_sjob(&self, sjob: &SJob) -> Result<(), StoreError>;
    fn get_sjob(&self, id: &SJobId) -> Option<SJob>;
    fn get_sjobs_from_rawjob(&self, raw: &RawJobId) -> Vec<SJob>;

    fn insert_site(&self, site: Site);
    fn get_site(&self, id: &SiteId) -> Option<Site>;
    fn increment_site_bytes(&self, id: &SiteId, tx_delta: i64, rx_delta: i64) -> Result<(), StoreError>;

    fn insert_user_credential(&self, credential: UserCredential);
    fn user_credential(&self, user: &str, site: &SiteId) -> Option<UserCredential>;
}

new_key_type! {
    struct RawJobKey;
}

#[derive(Debug, Default)]
struct StoreInner {
    rawjobs: SlotMap<RawJobKey, RawJob>,
    /// Lookup of the internal key by the user-visible raw job id.
    raw_index: HashMap<RawJobId, RawJobKey>,
    sjobs: HashMap<SJobId, SJob>,
    /// Sjob ids per raw job, in creation order.
    sjobs_by_raw: HashMap<RawJobId, Vec<SJobId>>,
    sites: HashMap<SiteId, Site>,
    credentials: HashMap<(String, SiteId), UserCredential>,
}

#[derive(Debug, Clone, Default)]
pub struct MemorySiteStore {
    /// All collections are protected with a single lock.
    inner: Arc<RwLock<StoreInner>>,
}

impl MemorySiteStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SiteStore for MemorySiteStore {
    fn insert_rawjob(&self, job: RawJob) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        if guard.raw_index.contains_key(&job.id) {
            return Err(StoreError::Duplicate { collection: "rawjob", id: job.id.to_string() });
        }
        let id = job.id.clone();
        let key = guard.rawjobs.insert(job);
        guard.raw_index.insert(id, key);
        Ok(())
    }

    fn get_rawjob(&self, id: &RawJobId) -> Option<RawJob> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.raw_index.get(id).and_then(|key| guard.rawjobs.get(*key)).cloned()
    }

    fn get_rawjobs_from_state(&self, states: &[RawJobState]) -> Vec<RawJob> {
        let guard = self.inner.read().expect("RwLock poisoned");
        let mut jobs: Vec<RawJob> = guard.rawjobs.values().filter(|job| states.contains(&job.state)).cloned().collect();
        jobs.sort_by_key(|job| job.submitted_at);
        jobs
    }

    fn update_rawjob(&self, job: &RawJob) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        let key = *guard.raw_index.get(&job.id).ok_or_else(|| not_found("rawjob", &job.id))?;
        if let Some(stored) = guard.rawjobs.get_mut(key) {
            *stored = job.clone();
        }
        Ok(())
    }

    fn update_rawjob_state(&self, id: &RawJobId, state: RawJobState, message: Option<String>) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        let key = *guard.raw_index.get(id).ok_or_else(|| not_found("rawjob", id))?;
        let job = guard.rawjobs.get_mut(key).ok_or_else(|| not_found("rawjob", id))?;
        job.state = state;
        job.message = message;
        Ok(())
    }

    fn increment_rawjob_tx_bytes(&self, id: &RawJobId, delta: i64) -> Result<u64, StoreError> {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        let key = *guard.raw_index.get(id).ok_or_else(|| not_found("rawjob", id))?;
        let job = guard.rawjobs.get_mut(key).ok_or_else(|| not_found("rawjob", id))?;
        job.tx_bytes = apply_delta(job.tx_bytes, delta);
        Ok(job.tx_bytes)
    }

    fn replace_sjobs(&self, raw: &RawJobId, sjobs: Vec<SJob>) {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        if let Some(previous) = guard.sjobs_by_raw.remove(raw) {
            for id in previous {
                guard.sjobs.remove(&id);
            }
        }
        let ids = sjobs.iter().map(|s| s.id.clone()).collect();
        for sjob in sjobs {
            guard.sjobs.insert(sjob.id.clone(), sjob);
        }
        guard.sjobs_by_raw.insert(raw.clone(), ids);
    }

    fn update_sjob(&self, sjob: &SJob) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        let stored = guard.sjobs.get_mut(&sjob.id).ok_or_else(|| not_found("sjob", &sjob.id))?;
        *stored = sjob.clone();
        Ok(())
    }

    fn get_sjob(&self, id: &SJobId) -> Option<SJob> {
        self.inner.read().expect("RwLock poisoned").sjobs.get(id).cloned()
    }

    fn get_sjobs_from_rawjob(&self, raw: &RawJobId) -> Vec<SJob> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.sjobs_by_raw.get(raw).map(|ids| ids.iter().filter_map(|id| guard.sjobs.get(id).cloned()).collect()).unwrap_or_default()
    }

    fn insert_site(&self, site: Site) {
        self.inner.write().expect("RwLock poisoned").sites.insert(site.id.clone(), site);
    }

    fn get_site(&self, id: &SiteId) -> Option<Site> {
        self.inner.read().expect("RwLock poisoned").sites.get(id).cloned()
    }

    fn increment_site_bytes(&self, id: &SiteId, tx_delta: i64, rx_delta: i64) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        let site = guard.sites.get_mut(id).ok_or_else(|| not_found("site", id))?;
        site.tx_bytes = apply_delta(site.tx_bytes, tx_delta);
        site.rx_bytes = apply_delta(site.rx_bytes, rx_delta);
        Ok(())
    }

    fn insert_user_credential(&self, credential: UserCredential) {
        let key = (credential.user.clone(), credential.site.clone());
        self.inner.write().expect("RwLock poisoned").credentials.insert(key, credential);
    }

    fn user_credential(&self, user: &str, site: &SiteId) -> Option<UserCredential> {
        self.inner.read().expect("RwLock poisoned").credentials.get(&(user.to_string(), site.clone())).cloned()
    }
}

fn not_found(collection: &'static str, id: &impl std::fmt::Display) -> StoreError {
    StoreError::NotFound { collection, id: id.to_string() }
}
