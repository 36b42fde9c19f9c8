use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::model::raw_job::{JobType, RawJob, RawJobState};
use crate::domain::model::sjob::SJob;
use crate::domain::utils::id::{RawJobId, SiteId};
use crate::error::ConversionError;

/// Transfer request as submitted by a user (JSON file or portal body).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSubmissionDto {
    #[serde(default)]
    pub id: Option<String>,
    pub user: String,
    pub src_files: Vec<String>,
    pub src_sites: Vec<String>,
    pub dst_path: String,
    pub dst_site: String,
    #[serde(default)]
    pub deadline: Option<i64>,
    #[serde(rename = "type", default = "default_job_type")]
    pub job_type: String,
}

fn default_job_type() -> String {
    "best_effort".to_string()
}

impl JobSubmissionDto {
    /// Builds a fresh `waiting` RawJob. Paths are validated later by the intake pipeline.
    pub fn into_raw_job(self, now: i64) -> Result<RawJob, ConversionError> {
        let job_type: JobType = self.job_type.parse()?;
        let id = match self.id {
            Some(id) if !id.is_empty() => RawJobId::new(id),
            _ => RawJobId::generate(),
        };

        Ok(RawJob {
            id,
            user: self.user,
            src_files: self.src_files,
            dst_path: self.dst_path,
            src_sites: self.src_sites.into_iter().map(SiteId::new).collect(),
            dst_site: SiteId::new(self.dst_site),
            deadline: self.deadline,
            job_type,
            proxies: BTreeMap::new(),
            size: 0,
            tx_bytes: 0,
            state: RawJobState::Waiting,
            message: None,
            submitted_at: now,
        })
    }
}

/// Snapshot returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub raw: RawJob,
    pub sjobs: Vec<SJob>,
}
