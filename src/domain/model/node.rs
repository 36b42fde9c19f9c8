use serde::{Deserialize, Serialize};

use crate::domain::utils::id::{DtnId, SiteId, StorageId};

/// Base URL and identity of a remote site's portal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteDescriptor {
    pub id: SiteId,
    pub url: String,
}

/// A transfer-capable host as advertised by its site.
///
/// Records come either from the local resource graph or from a remote site's
/// "available best-effort DTN" service; the matcher attaches the owning
/// [`SiteDescriptor`] before handing the record to the network orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DtnRecord {
    pub id: DtnId,
    pub site: SiteId,
    pub ctrl_ip: String,
    pub data_ip: String,
    pub data_mac: String,
    /// Data port the launcher should connect to on this DTN.
    pub port: u16,
    /// Link capacity in Mbit/s.
    pub link_capacity: u64,
    /// Whether the DTN's switch port can be programmed by the site's SDN agent.
    pub sdn_setup: bool,
    /// Named WAN endpoint; present only when the DTN supports dynamic circuits.
    pub stp: Option<String>,
    /// Live load figure reported by the site (lower is better).
    #[serde(default)]
    pub load: f64,
}

impl DtnRecord {
    pub fn supports_dynamic_wan(&self) -> bool {
        self.stp.as_deref().is_some_and(|stp| !stp.is_empty())
    }
}

/// A storage system and the DTNs that mount it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageNode {
    pub id: StorageId,
    pub site: SiteId,
    pub mount: String,
    pub dtns: Vec<DtnId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stp_enables_dynamic_wan() {
        let mut dtn = DtnRecord {
            id: DtnId::new("dtn1"),
            site: SiteId::new("a"),
            ctrl_ip: "10.0.0.1".into(),
            data_ip: "192.168.0.1".into(),
            data_mac: "aa:bb".into(),
            port: 5000,
            link_capacity: 10_000,
            sdn_setup: true,
            stp: None,
            load: 0.0,
        };
        assert!(!dtn.supports_dynamic_wan());
        dtn.stp = Some(String::new());
        assert!(!dtn.supports_dynamic_wan());
        dtn.stp = Some("urn:ogf:network:a:stp1".into());
        assert!(dtn.supports_dynamic_wan());
    }
}
