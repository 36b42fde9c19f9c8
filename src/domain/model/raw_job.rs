use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::domain::utils::id::{RawJobId, SiteId};
use crate::error::ConversionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    BestEffort,
    Reserved,
}

impl FromStr for JobType {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "best_effort" => Ok(JobType::BestEffort),
            "reserved" => Ok(JobType::Reserved),
            _ => Err(ConversionError::UnknownJobType(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawJobState {
    Waiting,
    Transferring,
    Finished,
    Error,
}

impl RawJobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RawJobState::Finished | RawJobState::Error)
    }
}

/// Short-lived credential handed to the transfer program for one site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyCredential {
    pub subject: String,
    pub pem: String,
    /// Unix seconds.
    pub expires_at: i64,
}

/// A user-submitted transfer request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawJob {
    pub id: RawJobId,
    pub user: String,
    /// Source specs, each `site|storage|dtn|path`.
    pub src_files: Vec<String>,
    /// Destination spec `site|storage|dtn|path`.
    pub dst_path: String,
    pub src_sites: Vec<SiteId>,
    pub dst_site: SiteId,
    pub deadline: Option<i64>,
    pub job_type: JobType,
    pub proxies: BTreeMap<SiteId, ProxyCredential>,
    pub size: u64,
    pub tx_bytes: u64,
    pub state: RawJobState,
    pub message: Option<String>,
    pub submitted_at: i64,
}

impl RawJob {
    pub fn fail(&mut self, message: impl Into<String>) {
        self.state = RawJobState::Error;
        self.message = Some(message.into());
    }

    /// Every site the job touches, sources first, without duplicates.
    pub fn sites(&self) -> Vec<SiteId> {
        let mut sites: Vec<SiteId> = Vec::new();
        for site in self.src_sites.iter().chain(std::iter::once(&self.dst_site)) {
            if !sites.contains(site) {
                sites.push(site.clone());
            }
        }
        sites
    }
}
