use tokio_util::sync::CancellationToken;

use crate::domain::model::flow::{Flow, FlowState, ProvisionedPath};
use crate::domain::model::sjob::SJobState;
use crate::domain::model::stage::{Stage, StageObserver, StageTrail};
use crate::domain::scheduler::SchedulerContext;
use crate::domain::scheduler::dtn_matcher::{DtnPair, NetworkKind, match_dtns};
use crate::domain::scheduler::intake::site_descriptor;
use crate::domain::scheduler::job_book::JobKey;
use crate::domain::scheduler::lane::{SchedulerLane, WorkerOutcome};
use crate::domain::utils::id::{SJobId, SiteId, StorageId, TaskId};
use crate::error::TransferError;

/// What an admission worker needs to know about the sjob it provisions for.
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    pub sjob: SJobId,
    pub src_site: SiteId,
    pub src_storage: StorageId,
    pub dst_site: SiteId,
    pub dst_storage: StorageId,
    pub cancel: CancellationToken,
    /// Told about every stage the worker enters.
    pub progress: Option<StageObserver>,
}

/// Outcome of provisioning one flow.
///
/// `pair` and `path` describe whatever was built even when `result` is an
/// error, so the lane can tear it down.
#[derive(Debug)]
pub struct Provision {
    pub pair: Option<DtnPair>,
    pub path: ProvisionedPath,
    pub trail: StageTrail,
    pub result: Result<(), TransferError>,
}

/// DTN matching, then (private pairs) path setup, then reachability verification.
pub async fn provision_flow(ctx: &SchedulerContext, request: &AdmissionRequest) -> Provision {
    let mut pair = None;
    let mut path = ProvisionedPath::default();
    let mut trail = request.progress.clone().map(StageTrail::observed).unwrap_or_default();
    let result = provision_steps(ctx, request, &mut pair, &mut path, &mut trail).await;
    Provision { pair, path, trail, result }
}

async fn provision_steps(
    ctx: &SchedulerContext,
    request: &AdmissionRequest,
    pair_slot: &mut Option<DtnPair>,
    path: &mut ProvisionedPath,
    trail: &mut StageTrail,
) -> Result<(), TransferError> {
    if request.cancel.is_cancelled() {
        return Err(TransferError::Cancelled);
    }

    let src_site = site_descriptor(ctx, &request.src_site).inspect_err(|_| trail.error(Stage::DtnMatching))?;
    let dst_site = site_descriptor(ctx, &request.dst_site).inspect_err(|_| trail.error(Stage::DtnMatching))?;
    let pair = match_dtns(ctx.portal.as_ref(), &src_site, &request.src_storage, &dst_site, &request.dst_storage)
        .await
        .inspect_err(|_| trail.error(Stage::DtnMatching))?;
    check_local_dtns(ctx, &pair).inspect_err(|_| trail.error(Stage::DtnMatching))?;
    trail.success(Stage::DtnMatching);

    let pair = pair_slot.insert(pair);
    if pair.network == NetworkKind::Private {
        ctx.network.network_handling(&request.sjob, &pair.src, &pair.dst, path, trail, &request.cancel).await?;
    }

    let tries = ctx.network.ping_tries(path);
    ctx.network.verify_path(&request.sjob, &pair.src, &pair.dst, tries, trail, &request.cancel).await
}

/// Chosen DTNs owned by this site must be online in the resource graph.
fn check_local_dtns(ctx: &SchedulerContext, pair: &DtnPair) -> Result<(), TransferError> {
    let local = ctx.graph.local_site();
    for endpoint in [&pair.src, &pair.dst] {
        if endpoint.site.id == local && !ctx.graph.is_online(&endpoint.dtn.id) {
            return Err(TransferError::ResourceUnavailable(format!("local DTN {} is offline", endpoint.dtn.id)));
        }
    }
    Ok(())
}

impl SchedulerLane {
    /// One scheduling tick: admit at most one waiting block.
    pub(crate) fn schedule(&mut self) {
        if self.ctx.graph.launcher_queue().is_none() {
            log::debug!("No launcher registered, scheduling tick skipped");
            return;
        }

        if let Some((key, sjob_id, block)) = self.book.next_admission_candidate() {
            self.begin_admission(key, sjob_id, block);
        }
    }

    fn begin_admission(&mut self, key: JobKey, sjob_id: SJobId, block: usize) {
        let now = self.ctx.now();
        let Some(entry) = self.book.entry_mut(key) else {
            return;
        };
        let cancel = entry.cancel.clone();
        let Some(sjob) = entry.sjob_mut(&sjob_id) else {
            return;
        };

        let flow = Flow::new(sjob.id.clone(), block, now);
        let task = flow.task.clone();
        sjob.flows.push(flow);
        sjob.state = SJobState::DtnMatching;
        sjob.stage.working(Stage::DtnMatching);
        log::info!("SJob {}: admitting block {} ({} bytes) as task {}", sjob.id, block, sjob.blocks[block].size, task);

        let mut request = AdmissionRequest {
            sjob: sjob.id.clone(),
            src_site: sjob.src_site.clone(),
            src_storage: sjob.src_storage.clone(),
            dst_site: sjob.dst_site.clone(),
            dst_storage: sjob.dst_storage.clone(),
            cancel,
            progress: None,
        };
        request.progress = Some(self.stage_observer(key, &sjob_id, &task));

        self.book.register_task(task.clone(), key);
        self.persist_sjob(key, &sjob_id);

        let ctx = self.ctx.clone();
        self.spawn_worker(Some(key), async move {
            let provision = provision_flow(&ctx, &request).await;
            WorkerOutcome::Provisioned { key, sjob: request.sjob, task, provision }
        });
    }

    pub(crate) fn on_provisioned(&mut self, key: JobKey, sjob_id: SJobId, task: TaskId, provision: Provision) {
        let Some(sjob) = self.book.entry_mut(key).and_then(|entry| entry.sjob_mut(&sjob_id)) else {
            log::debug!("SJob {}: provisioning finished for a job no longer tracked", sjob_id);
            return;
        };
        provision.trail.apply_to(&mut sjob.stage);
        sjob.path_retry += provision.trail.retries();
        let failed_at = provision.trail.current_stage().unwrap_or(Stage::DtnMatching);
        let Some(flow) = sjob.flow_mut(&task) else {
            return;
        };

        if let Some(pair) = &provision.pair {
            flow.src = Some(pair.src.clone());
            flow.dst = Some(pair.dst.clone());
        }
        flow.path = provision.path;
        let still_wanted = flow.state == FlowState::Scheduling;

        match provision.result {
            Ok(()) if still_wanted => {
                self.persist_sjob(key, &sjob_id);
                self.begin_launch(key, sjob_id, task);
            }
            Err(error) if still_wanted => self.fail_flow(key, &sjob_id, &task, error, failed_at),
            _ => {
                log::info!("SJob {}: task {} was abandoned during provisioning, releasing its path", sjob_id, task);
                self.persist_sjob(key, &sjob_id);
                self.spawn_teardown(key, &sjob_id, &task, false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::topology_dto::TopologyDto;
    use crate::domain::collaborators::portal::PortalResponse;
    use crate::domain::collaborators::resource_graph::InMemoryResourceGraph;
    use crate::domain::collaborators::scripted::{ScriptedPortal, ScriptedRpc};
    use crate::domain::collaborators::site_store::{MemorySiteStore, SiteStore};
    use crate::domain::model::block::{Block, FileEntry};
    use crate::domain::model::raw_job::{JobType, RawJob, RawJobState};
    use crate::domain::model::sjob::SJob;
    use crate::domain::model::site::Site;
    use crate::domain::model::stage::StageStatus;
    use crate::domain::scheduler::config::{NetworkConfig, SchedulerConfig, StaticWanPath};
    use crate::domain::scheduler::lane::SchedulerMessage;
    use crate::domain::telemetry::time_series::MemoryTimeSeries;
    use crate::domain::utils::id::RawJobId;
    use serde_json::{Value, json};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn dtn(id: &str, site: &str) -> Value {
        json!({
            "id": id, "site": site, "ctrl_ip": "10.0.0.1", "data_ip": format!("192.168.{}.1", id.len()), "data_mac": "aa",
            "port": 5000, "link_capacity": 10000, "sdn_setup": true, "stp": null, "load": 0.0
        })
    }

    fn context(portal: Arc<ScriptedPortal>, graph: TopologyDto) -> SchedulerContext {
        let network = NetworkConfig {
            static_wan_paths: vec![StaticWanPath { src_site: SiteId::new("a"), dst_site: SiteId::new("b"), vlan_src: 7, vlan_dst: 8, bandwidth: 100 }],
            ..NetworkConfig::default()
        };
        context_with(portal, graph, network)
    }

    fn context_with(portal: Arc<ScriptedPortal>, graph: TopologyDto, network: NetworkConfig) -> SchedulerContext {
        let store = Arc::new(MemorySiteStore::new());
        store.insert_site(Site::new(SiteId::new("a"), "https://a"));
        store.insert_site(Site::new(SiteId::new("b"), "https://b"));
        let network = network.without_delays();
        let config = SchedulerConfig { network, ..SchedulerConfig::default() };
        SchedulerContext::new(
            config,
            Arc::new(ScriptedRpc::new()),
            portal,
            Arc::new(InMemoryResourceGraph::from_dto(graph)),
            store,
            Arc::new(MemoryTimeSeries::new()),
        )
    }

    fn request() -> AdmissionRequest {
        AdmissionRequest {
            sjob: SJobId::new("s1"),
            src_site: SiteId::new("a"),
            src_storage: StorageId::new("sa"),
            dst_site: SiteId::new("b"),
            dst_storage: StorageId::new("sb"),
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    fn topology(local_online: bool) -> TopologyDto {
        serde_json::from_value(json!({
            "localSite": "a",
            "dtns": [{"id": "a1", "site": "a", "ctrlIp": "10.0.0.1", "dataIp": "192.168.2.1", "dataMac": "aa",
                      "port": 5000, "linkCapacity": 10000, "sdnSetup": true, "queue": "a.a1", "online": local_online}]
        }))
        .unwrap()
    }

    fn private_pairs(portal: &ScriptedPortal) {
        portal.respond("get_available_best_effort_dtn", |call, _| {
            if call.url.starts_with("https://a") {
                PortalResponse::ok(json!({"private": [dtn("a1", "a")]}))
            } else {
                PortalResponse::ok(json!({"private": [dtn("b1", "b")]}))
            }
        });
    }

    #[tokio::test]
    async fn private_pair_is_provisioned_and_verified() {
        let portal = Arc::new(ScriptedPortal::new());
        private_pairs(&portal);
        portal.respond("sdn_reserve_request", |call, _| {
            let id = if call.url.starts_with("https://a") { 1 } else { 2 };
            PortalResponse::ok(json!({"path_id": id}))
        });
        portal.respond_json("dtn_icmp_ping", json!({"reachable": true}));
        let ctx = context(portal.clone(), topology(true));

        let provision = provision_flow(&ctx, &request()).await;

        assert_eq!(provision.result, Ok(()));
        assert_eq!((provision.path.src_path_id, provision.path.dst_path_id), (1, 2));
        assert_eq!((provision.path.vlan_src, provision.path.vlan_dst), (Some(7), Some(8)));
        assert_eq!(provision.trail.last(Stage::DtnMatching), Some(StageStatus::Success));
        assert_eq!(provision.trail.last(Stage::PathVerification), Some(StageStatus::Success));
        assert_eq!(portal.calls_for("dtn_icmp_ping").len(), 1);
    }

    #[tokio::test]
    async fn public_pair_skips_path_setup() {
        let portal = Arc::new(ScriptedPortal::new());
        portal.respond("get_available_best_effort_dtn", |call, _| {
            if call.url.starts_with("https://a") {
                PortalResponse::ok(json!({"public": [dtn("a1", "a")]}))
            } else {
                PortalResponse::ok(json!({"public": [dtn("b1", "b")]}))
            }
        });
        portal.respond_json("dtn_icmp_ping", json!({"reachable": true}));
        let ctx = context(portal.clone(), topology(true));

        let provision = provision_flow(&ctx, &request()).await;

        assert_eq!(provision.result, Ok(()));
        assert_eq!(provision.pair.map(|p| p.network), Some(NetworkKind::Public));
        assert!(portal.calls_for("sdn_reserve_request").is_empty());
        assert!(!provision.path.holds_resources());
    }

    #[tokio::test]
    async fn offline_local_dtn_is_rejected_before_provisioning() {
        let portal = Arc::new(ScriptedPortal::new());
        private_pairs(&portal);
        let ctx = context(portal.clone(), topology(false));

        let provision = provision_flow(&ctx, &request()).await;

        assert!(matches!(provision.result, Err(TransferError::ResourceUnavailable(message)) if message.contains("a1")));
        assert!(provision.pair.is_none());
        assert_eq!(provision.trail.last(Stage::DtnMatching), Some(StageStatus::Error));
        assert!(portal.calls_for("sdn_reserve_request").is_empty());
    }

    #[tokio::test]
    async fn failed_lan_setup_keeps_pair_for_teardown() {
        let portal = Arc::new(ScriptedPortal::new());
        private_pairs(&portal);
        portal.respond("sdn_reserve_request", |call, _| {
            if call.url.starts_with("https://a") { PortalResponse::ok(json!({"path_id": 4})) } else { PortalResponse::failure("port busy") }
        });
        let ctx = context(portal.clone(), topology(true));

        let provision = provision_flow(&ctx, &request()).await;

        assert!(matches!(provision.result, Err(TransferError::Provisioning { stage: Stage::NetworkLanDst, .. })));
        assert!(provision.pair.is_some());
        assert_eq!(provision.path.src_path_id, 4);
        assert!(portal.calls_for("dtn_icmp_ping").is_empty());
    }

    #[tokio::test]
    async fn cancelled_request_does_nothing() {
        let portal = Arc::new(ScriptedPortal::new());
        let ctx = context(portal.clone(), topology(true));
        let request = request();
        request.cancel.cancel();

        let provision = provision_flow(&ctx, &request).await;

        assert_eq!(provision.result, Err(TransferError::Cancelled));
        assert!(portal.calls().is_empty());
    }

    /// Raw job "r1" with one waiting sjob of a single block.
    fn lane_with_job(ctx: SchedulerContext) -> (SchedulerLane, mpsc::UnboundedReceiver<SchedulerMessage>, JobKey, SJobId) {
        let raw = RawJob {
            id: RawJobId::new("r1"),
            user: "alice".into(),
            src_files: vec!["a|sa||/data".into()],
            dst_path: "b|sb||/in".into(),
            src_sites: vec![SiteId::new("a")],
            dst_site: SiteId::new("b"),
            deadline: None,
            job_type: JobType::BestEffort,
            proxies: BTreeMap::new(),
            size: 10,
            tx_bytes: 0,
            state: RawJobState::Waiting,
            message: None,
            submitted_at: 0,
        };
        let blocks = vec![Block::new("/data", vec![FileEntry { path: "/data/f1".into(), size: 10, checksum: None }])];
        let sjob = SJob::new(raw.id.clone(), JobType::BestEffort, SiteId::new("a"), StorageId::new("sa"), SiteId::new("b"), StorageId::new("sb"), "/in", blocks);
        ctx.store.insert_rawjob(raw.clone()).unwrap();
        ctx.store.replace_sjobs(&raw.id, vec![sjob.clone()]);

        let (tx, rx) = mpsc::unbounded_channel();
        let mut lane = SchedulerLane::new(ctx, tx);
        let sjob_id = sjob.id.clone();
        let key = lane.book.insert(raw, vec![sjob]);
        (lane, rx, key, sjob_id)
    }

    #[tokio::test]
    async fn sjob_state_follows_the_provisioning_worker() {
        let portal = Arc::new(ScriptedPortal::new());
        portal.respond("get_available_best_effort_dtn", |call, _| {
            let (id, site) = if call.url.starts_with("https://a") { ("a1", "a") } else { ("b1", "b") };
            let mut node = dtn(id, site);
            node["stp"] = json!(format!("urn:stp:{}", site));
            PortalResponse::ok(json!({"private": [node]}))
        });
        portal.respond_json("wan_create", json!({"uuid": "w-1"}));
        portal.respond_json("wan_reserve", json!({"vlan_src": 1201, "vlan_dst": 3001}));
        portal.respond("sdn_reserve_request", |call, _| {
            let id = if call.url.starts_with("https://a") { 1 } else { 2 };
            PortalResponse::ok(json!({"path_id": id}))
        });
        portal.respond_json("dtn_icmp_ping", json!({"reachable": true}));
        let network = NetworkConfig { wan_controller_url: Some("https://wan".into()), ..NetworkConfig::default() };
        let (mut lane, mut rx, key, sjob_id) = lane_with_job(context_with(portal, topology(true), network));

        lane.begin_admission(key, sjob_id.clone(), 0);

        let mut states = vec![lane.book.entry(key).unwrap().sjob(&sjob_id).unwrap().state];
        loop {
            let message = rx.recv().await.unwrap();
            let provisioned = matches!(message, SchedulerMessage::Worker(WorkerOutcome::Provisioned { .. }));
            lane.handle(message);
            if provisioned {
                break;
            }
            let state = lane.book.entry(key).unwrap().sjob(&sjob_id).unwrap().state;
            if states.last() != Some(&state) {
                states.push(state);
            }
        }

        assert_eq!(states, vec![SJobState::DtnMatching, SJobState::WanSetup, SJobState::SdnSetup, SJobState::PathVerification]);
        let stored = lane.ctx.store.get_sjob(&sjob_id).unwrap();
        assert_eq!(stored.stage.get(Stage::NetworkWan), StageStatus::Success);
        assert_eq!(stored.stage.get(Stage::PathVerification), StageStatus::Success);
    }

    #[tokio::test]
    async fn provisioning_error_without_a_stage_blames_the_stage_in_progress() {
        let portal = Arc::new(ScriptedPortal::new());
        let (mut lane, _rx, key, sjob_id) = lane_with_job(context(portal, topology(true)));
        let task = {
            let sjob = lane.book.entry_mut(key).unwrap().sjob_mut(&sjob_id).unwrap();
            sjob.blocks[0].start_transfer().unwrap();
            let flow = Flow::new(sjob_id.clone(), 0, 0);
            let task = flow.task.clone();
            sjob.flows.push(flow);
            task
        };
        lane.book.register_task(task.clone(), key);

        let mut trail = StageTrail::default();
        trail.success(Stage::DtnMatching);
        trail.success(Stage::NetworkWan);
        trail.working(Stage::NetworkLanSrc);
        trail.retry();
        trail.retry();
        let provision = Provision { pair: None, path: ProvisionedPath::default(), trail, result: Err(TransferError::Remote("site b went away".into())) };

        lane.on_provisioned(key, sjob_id.clone(), task, provision);

        let entry = lane.book.entry(key).unwrap();
        let sjob = entry.sjob(&sjob_id).unwrap();
        assert_eq!(sjob.stage.get(Stage::NetworkLanSrc), StageStatus::Error);
        assert_eq!(sjob.stage.get(Stage::DtnMatching), StageStatus::Success);
        assert_eq!(sjob.path_retry, 2);
        assert_eq!(sjob.state, SJobState::Error);
        assert_eq!(entry.raw.state, RawJobState::Error);
        assert!(entry.raw.message.as_deref().unwrap().contains("site b went away"));
    }
}
