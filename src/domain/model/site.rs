use serde::{Deserialize, Serialize};

use crate::domain::model::node::SiteDescriptor;
use crate::domain::utils::id::SiteId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: SiteId,
    pub url: String,
    /// Cumulative bytes sent from this site.
    pub tx_bytes: u64,
    /// Cumulative bytes received by this site.
    pub rx_bytes: u64,
}

impl Site {
    pub fn new(id: SiteId, url: impl Into<String>) -> Self {
        Site { id, url: url.into(), tx_bytes: 0, rx_bytes: 0 }
    }

    pub fn descriptor(&self) -> SiteDescriptor {
        SiteDescriptor { id: self.id.clone(), url: self.url.clone() }
    }
}

/// In-memory cache of a site's counters, kept by the dispatch lane.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SiteCounters {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_rate: f64,
    pub rx_rate: f64,
}

impl SiteCounters {
    pub fn credit_tx(&mut self, bytes: i64) {
        self.tx_bytes = apply_delta(self.tx_bytes, bytes);
    }

    pub fn credit_rx(&mut self, bytes: i64) {
        self.rx_bytes = apply_delta(self.rx_bytes, bytes);
    }
}

pub(crate) fn apply_delta(value: u64, delta: i64) -> u64 {
    if delta >= 0 { value.saturating_add(delta as u64) } else { value.saturating_sub(delta.unsigned_abs()) }
}
