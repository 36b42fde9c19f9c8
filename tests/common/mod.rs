#![allow(dead_code)]

use serde_json::{Value, json};
use std::sync::Arc;

use bde_scheduler::api::job_dto::{JobStatus, JobSubmissionDto};
use bde_scheduler::api::launcher_dto::MldStatusReport;
use bde_scheduler::api::topology_dto::TopologyDto;
use bde_scheduler::domain::clock::MockClock;
use bde_scheduler::domain::collaborators::portal::PortalResponse;
use bde_scheduler::domain::collaborators::resource_graph::InMemoryResourceGraph;
use bde_scheduler::domain::collaborators::scripted::{ScriptedPortal, ScriptedRpc};
use bde_scheduler::domain::collaborators::site_store::{MemorySiteStore, SiteStore};
use bde_scheduler::domain::model::site::Site;
use bde_scheduler::domain::scheduler::SchedulerContext;
use bde_scheduler::domain::scheduler::config::{NetworkConfig, SchedulerConfig, StaticWanPath, TransferAuth};
use bde_scheduler::domain::scheduler::handle::SchedulerHandle;
use bde_scheduler::domain::telemetry::time_series::MemoryTimeSeries;
use bde_scheduler::domain::utils::id::{RawJobId, SiteId, TaskId};

pub const MB: u64 = 1024 * 1024;

/// Two sites `a` (local) and `b`, each with one DTN, wired to scripted remotes.
pub struct Harness {
    pub portal: Arc<ScriptedPortal>,
    pub rpc: Arc<ScriptedRpc>,
    pub store: Arc<MemorySiteStore>,
    pub graph: Arc<InMemoryResourceGraph>,
    pub sink: Arc<MemoryTimeSeries>,
    pub clock: Arc<MockClock>,
    pub ctx: SchedulerContext,
}

impl Harness {
    pub fn new(config: SchedulerConfig) -> Self {
        let portal = Arc::new(ScriptedPortal::new());
        let rpc = Arc::new(ScriptedRpc::new());
        let store = Arc::new(MemorySiteStore::new());
        let graph = Arc::new(InMemoryResourceGraph::from_dto(topology()));
        let sink = Arc::new(MemoryTimeSeries::new());
        let clock = Arc::new(MockClock::new(1_000));

        store.insert_site(Site::new(SiteId::new("a"), "https://a"));
        store.insert_site(Site::new(SiteId::new("b"), "https://b"));

        let ctx = SchedulerContext::new(config, rpc.clone(), portal.clone(), graph.clone(), store.clone(), sink.clone())
            .with_clock(clock.clone());

        Harness { portal, rpc, store, graph, sink, clock, ctx }
    }

    /// Static a->b circuit, password authentication, no provisioning delays.
    pub fn with_static_path() -> Self {
        Self::new(static_config())
    }

    pub fn site(&self, id: &str) -> Site {
        self.store.get_site(&SiteId::new(id)).expect("site is seeded")
    }
}

pub fn static_config() -> SchedulerConfig {
    let network = NetworkConfig {
        static_wan_paths: vec![StaticWanPath { src_site: SiteId::new("a"), dst_site: SiteId::new("b"), vlan_src: 7, vlan_dst: 8, bandwidth: 1000 }],
        ..NetworkConfig::default()
    }
    .without_delays();
    SchedulerConfig {
        transfer_auth: TransferAuth::Password { username: "bde".into(), password: "secret".into() },
        network,
        ..SchedulerConfig::default()
    }
}

pub fn topology() -> TopologyDto {
    serde_json::from_value(json!({
        "localSite": "a",
        "launcherQueue": "a.launcher",
        "sdnAgentQueue": "a.sdn",
        "sites": [{"id": "a", "url": "https://a"}, {"id": "b", "url": "https://b"}],
        "dtns": [{"id": "a1", "site": "a", "ctrlIp": "10.0.0.1", "dataIp": "192.168.1.1", "dataMac": "aa:aa",
                  "port": 5000, "linkCapacity": 10000, "sdnSetup": true, "queue": "a.a1", "online": true}]
    }))
    .expect("valid topology")
}

/// A DTN as the portal lists it. `stp` enables dynamic WAN circuits.
pub fn dtn(id: &str, site: &str, stp: Option<&str>) -> Value {
    json!({
        "id": id, "site": site, "ctrl_ip": format!("10.0.{}.1", id.len()), "data_ip": format!("192.168.{}.1", id.len()),
        "data_mac": format!("{}:mac", id), "port": 5000, "link_capacity": 10000, "sdn_setup": true, "stp": stp, "load": 0.0
    })
}

/// Scripts every portal command a transfer needs to run to completion.
///
/// Each storage expands to `blocks` blocks of 1MB; `checksums` attaches a digest to every file.
pub fn script_happy_portal(portal: &ScriptedPortal, blocks: usize, checksums: bool) {
    portal.respond_json("get_dtn_info", json!({"free_bytes": 100 * MB}));
    portal.respond("file_expand_and_group", move |call, _| {
        let storage = call.params["storage"].as_str().unwrap_or_default().to_string();
        let groups: Vec<Value> = (0..blocks)
            .map(|i| {
                let mut file = json!({"path": format!("/data/{}-{}", storage, i), "size": MB});
                if checksums {
                    file["checksum"] = json!(format!("md5-{}", i));
                }
                json!({"root": "/data", "files": [file]})
            })
            .collect();
        PortalResponse::ok(json!({ "groups": groups }))
    });
    script_private_pairs(portal, None, None);
    portal.respond("sdn_reserve_request", |call, _| {
        let id = if call.url.starts_with("https://a") { 11 } else { 12 };
        PortalResponse::ok(json!({"path_id": id}))
    });
    portal.respond_json("dtn_icmp_ping", json!({"reachable": true}));
}

pub fn script_private_pairs(portal: &ScriptedPortal, src_stp: Option<&'static str>, dst_stp: Option<&'static str>) {
    portal.respond("get_available_best_effort_dtn", move |call, _| {
        if call.url.starts_with("https://a") {
            PortalResponse::ok(json!({"private": [dtn("a1", "a", src_stp)]}))
        } else {
            PortalResponse::ok(json!({"private": [dtn("b1", "b", dst_stp)]}))
        }
    });
}

pub fn submission(id: &str) -> JobSubmissionDto {
    serde_json::from_value(json!({
        "id": id,
        "user": "alice",
        "srcFiles": ["a|s1||/data"],
        "srcSites": ["a"],
        "dstPath": "b|d1||/in",
        "dstSite": "b"
    }))
    .expect("valid submission")
}

pub async fn submit_and_settle(handle: &SchedulerHandle, id: &str) -> RawJobId {
    let id = handle.submit(submission(id)).await.expect("submission accepted");
    handle.wait_idle().await.unwrap();
    id
}

pub async fn status(handle: &SchedulerHandle, id: &RawJobId) -> JobStatus {
    handle.job_status(id).await.unwrap().expect("job is known")
}

/// Task of the first flow of the first sjob that is not finished yet.
pub async fn active_task(handle: &SchedulerHandle, id: &RawJobId) -> TaskId {
    let status = status(handle, id).await;
    status.sjobs[0].flows.iter().find(|f| f.is_live()).map(|f| f.task.clone()).expect("a live flow")
}

pub async fn report(handle: &SchedulerHandle, task: &TaskId, state: u8) -> bool {
    let accepted = handle
        .report_mld_status(MldStatusReport { task: task.clone(), state, code: 0, tx_bytes: 0, message: None })
        .await
        .unwrap();
    handle.wait_idle().await.unwrap();
    accepted
}

/// Admits one block and lets its provisioning and launch finish.
pub async fn tick(handle: &SchedulerHandle) {
    handle.schedule_tick().await.unwrap();
    handle.wait_idle().await.unwrap();
}
