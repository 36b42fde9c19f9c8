use std::collections::HashMap;
use std::sync::RwLock;

use crate::api::topology_dto::TopologyDto;
use crate::domain::model::node::{DtnRecord, StorageNode};
use crate::domain::model::site::Site;
use crate::domain::utils::id::{DtnId, SiteId, StorageId};

/// Read-only view of the local topology: registered agents, their queues and node properties.
pub trait ResourceGraph: std::fmt::Debug + Send + Sync {
    fn local_site(&self) -> SiteId;

    /// Queue of the registered launcher agent; `None` while no launcher is registered.
    fn launcher_queue(&self) -> Option<String>;

    /// Queue of the site's SDN agent; `None` while the agent is offline.
    fn sdn_agent_queue(&self) -> Option<String>;

    fn dtn(&self, id: &DtnId) -> Option<DtnRecord>;

    fn dtn_queue(&self, id: &DtnId) -> Option<String>;

    fn is_online(&self, id: &DtnId) -> bool;

    fn storage(&self, id: &StorageId) -> Option<StorageNode>;

    /// Sites known from the topology, used to seed the site store.
    fn sites(&self) -> Vec<Site>;
}

#[derive(Debug, Clone)]
struct DtnEntry {
    record: DtnRecord,
    queue: String,
    online: bool,
}

#[derive(Debug)]
struct GraphInner {
    launcher_queue: Option<String>,
    sdn_agent_queue: Option<String>,
    dtns: HashMap<DtnId, DtnEntry>,
    storages: HashMap<StorageId, StorageNode>,
}

/// Topology loaded from a JSON file. Agent registration can be toggled at runtime.
#[derive(Debug)]
pub struct InMemoryResourceGraph {
    local_site: SiteId,
    sites: Vec<Site>,
    inner: RwLock<GraphInner>,
}

impl InMemoryResourceGraph {
    pub fn from_dto(dto: TopologyDto) -> Self {
        let dtns = dto
            .dtns
            .into_iter()
            .map(|d| {
                let record = DtnRecord {
                    id: DtnId::new(d.id),
                    site: SiteId::new(d.site),
                    ctrl_ip: d.ctrl_ip,
                    data_ip: d.data_ip,
                    data_mac: d.data_mac,
                    port: d.port,
                    link_capacity: d.link_capacity,
                    sdn_setup: d.sdn_setup,
                    stp: d.stp,
                    load: 0.0,
                };
                (record.id.clone(), DtnEntry { record, queue: d.queue, online: d.online })
            })
            .collect();

        let storages = dto
            .storages
            .into_iter()
            .map(|s| {
                let node = StorageNode {
                    id: StorageId::new(s.id),
                    site: SiteId::new(s.site),
                    mount: s.mount,
                    dtns: s.dtns.into_iter().map(DtnId::new).collect(),
                };
                (node.id.clone(), node)
            })
            .collect();

        InMemoryResourceGraph {
            local_site: SiteId::new(dto.local_site),
            sites: dto.sites.into_iter().map(|s| Site::new(SiteId::new(s.id), s.url)).collect(),
            inner: RwLock::new(GraphInner {
                launcher_queue: dto.launcher_queue,
                sdn_agent_queue: dto.sdn_agent_queue,
                dtns,
                storages,
            }),
        }
    }

    pub fn set_launcher_queue(&self, queue: Option<String>) {
        self.inner.write().expect("RwLock poisoned").launcher_queue = queue;
    }

    pub fn set_sdn_agent_queue(&self, queue: Option<String>) {
        self.inner.write().expect("RwLock poisoned").sdn_agent_queue = queue;
    }

    pub fn set_online(&self, id: &DtnId, online: bool) {
        if let Some(entry) = self.inner.write().expect("RwLock poisoned").dtns.get_mut(id) {
            entry.online = online;
        }
    }
}

impl ResourceGraph for InMemoryResourceGraph {
    fn local_site(&self) -> SiteId {
        self.local_site.clone()
    }

    fn launcher_queue(&self) -> Option<String> {
        self.inner.read().expect("RwLock poisoned").launcher_queue.clone()
    }

    fn sdn_agent_queue(&self) -> Option<String> {
        self.inner.read().expect("RwLock poisoned").sdn_agent_queue.clone()
    }

    fn dtn(&self, id: &DtnId) -> Option<DtnRecord> {
        self.inner.read().expect("RwLock poisoned").dtns.get(id).map(|e| e.record.clone())
    }

    fn dtn_queue(&self, id: &DtnId) -> Option<String> {
        self.inner.read().expect("RwLock poisoned").dtns.get(id).map(|e| e.queue.clone())
    }

    fn is_online(&self, id: &DtnId) -> bool {
        self.inner.read().expect("RwLock poisoned").dtns.get(id).is_some_and(|e| e.online)
    }

    fn storage(&self, id: &StorageId) -> Option<StorageNode> {
        self.inner.read().expect("RwLock poisoned").storages.get(id).cloned()
    }

    fn sites(&self) -> Vec<Site> {
        self.sites.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology() -> TopologyDto {
        serde_json::from_str(
            r#"{
                "localSite": "a",
                "launcherQueue": "a.launcher",
                "sites": [{"id": "a", "url": "https://a"}],
                "dtns": [{"id": "dtn1", "site": "a", "ctrlIp": "10.0.0.1", "dataIp": "192.168.1.1", "dataMac": "aa",
                          "port": 5000, "linkCapacity": 10000, "sdnSetup": true, "queue": "a.dtn1"}],
                "storages": [{"id": "s1", "site": "a", "mount": "/data", "dtns": ["dtn1"]}]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn topology_is_loaded() {
        let graph = InMemoryResourceGraph::from_dto(topology());
        let dtn = DtnId::new("dtn1");

        assert_eq!(graph.local_site(), SiteId::new("a"));
        assert_eq!(graph.launcher_queue().as_deref(), Some("a.launcher"));
        assert!(graph.sdn_agent_queue().is_none());
        assert_eq!(graph.dtn_queue(&dtn).as_deref(), Some("a.dtn1"));
        assert!(graph.is_online(&dtn));
        assert_eq!(graph.storage(&StorageId::new("s1")).unwrap().dtns, vec![dtn]);
        assert_eq!(graph.sites()[0].url, "https://a");
    }

    #[test]
    fn agents_can_go_offline() {
        let graph = InMemoryResourceGraph::from_dto(topology());
        let dtn = DtnId::new("dtn1");

        graph.set_online(&dtn, false);
        graph.set_launcher_queue(None);

        assert!(!graph.is_online(&dtn));
        assert!(!graph.is_online(&DtnId::new("unknown")));
        assert!(graph.launcher_queue().is_none());
    }
}
