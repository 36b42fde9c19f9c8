use futures::future::try_join_all;
use serde_json::json;
use std::collections::BTreeMap;

use crate::api::portal_dto::{DtnInfoReply, ExpandAndGroupReply};
use crate::domain::collaborators::portal::{PortalCommand, send_command};
use crate::domain::model::block::{Block, BlockState};
use crate::domain::model::endpoint::EndpointSpec;
use crate::domain::model::flow::FlowState;
use crate::domain::model::node::SiteDescriptor;
use crate::domain::model::raw_job::{JobType, ProxyCredential, RawJob, RawJobState};
use crate::domain::model::sjob::SJob;
use crate::domain::scheduler::SchedulerContext;
use crate::domain::scheduler::config::TransferAuth;
use crate::domain::scheduler::job_book::JobKey;
use crate::domain::scheduler::lane::{SchedulerLane, WorkerOutcome};
use crate::domain::utils::id::{RawJobId, SiteId, StorageId};
use crate::error::{Error, TransferError};

/// Destination space that may be consumed by a single job.
const FREE_SPACE_RATIO: f64 = 0.95;

/// Source paths of one RawJob living on the same storage.
#[derive(Debug)]
struct SourceGroup {
    site: SiteDescriptor,
    storage: StorageId,
    paths: Vec<String>,
}

/// Turns a submitted RawJob into per-storage SJobs and persists them.
///
/// Sets the job's proxies and size on success. Any failure leaves the caller
/// to mark the RawJob `error` with the returned message.
pub async fn bootstrap_transfer_job(ctx: &SchedulerContext, raw: &mut RawJob) -> Result<Vec<SJob>, TransferError> {
    if ctx.graph.launcher_queue().is_none() {
        return Err(TransferError::ResourceUnavailable("no launcher agent is registered".to_string()));
    }

    raw.proxies = issue_proxies(ctx, raw)?;

    let dst: EndpointSpec = raw.dst_path.parse().map_err(|e| TransferError::Validation(format!("{}", e)))?;
    if dst.site != raw.dst_site {
        return Err(TransferError::Validation(format!("destination spec names site {} but the job targets {}", dst.site, raw.dst_site)));
    }
    let dst_site = site_descriptor(ctx, &dst.site)?;
    let dst_info: DtnInfoReply = send_command(
        ctx.portal.as_ref(),
        &dst_site.url,
        PortalCommand::GetDtnInfo,
        json!({ "storage": dst.storage, "path": dst.path, "dtn": dst.dtn }),
    )
    .await?;

    let groups = group_sources(ctx, raw)?;
    let expansions = try_join_all(groups.iter().map(|group| expand_and_group(ctx, group))).await?;

    let mut sjobs = Vec::with_capacity(groups.len());
    for (group, blocks) in groups.into_iter().zip(expansions) {
        if blocks.is_empty() {
            return Err(TransferError::Validation(format!("no files found under {:?} on {}/{}", group.paths, group.site.id, group.storage)));
        }
        sjobs.push(SJob::new(
            raw.id.clone(),
            raw.job_type,
            group.site.id,
            group.storage,
            dst.site.clone(),
            dst.storage.clone(),
            dst.path.clone(),
            blocks,
        ));
    }

    let total: u64 = sjobs.iter().map(|s| s.size).sum();
    if total as f64 > dst_info.free_bytes as f64 * FREE_SPACE_RATIO {
        return Err(TransferError::Validation(format!(
            "job needs {} bytes but only {} bytes are free at {}/{}",
            total, dst_info.free_bytes, dst.site, dst.storage
        )));
    }

    raw.size = total;
    ctx.store.replace_sjobs(&raw.id, sjobs.clone());
    ctx.store.update_rawjob(raw).map_err(|e| TransferError::Remote(e.to_string()))?;

    let blocks: usize = sjobs.iter().map(|s| s.blocks.len()).sum();
    log::info!("RawJob {} bootstrapped: {} sjob(s), {} block(s), {} bytes", raw.id, sjobs.len(), blocks, total);
    if raw.job_type == JobType::Reserved {
        log::warn!("RawJob {} is a reserved job; reserved admission is not available, it will stay queued", raw.id);
    }

    Ok(sjobs)
}

fn issue_proxies(ctx: &SchedulerContext, raw: &RawJob) -> Result<BTreeMap<SiteId, ProxyCredential>, TransferError> {
    if ctx.config.transfer_auth != TransferAuth::Certificate {
        return Ok(BTreeMap::new());
    }

    let now = ctx.clock.get_current_time_in_s();
    raw.sites()
        .into_iter()
        .map(|site| {
            let credential = ctx
                .store
                .user_credential(&raw.user, &site)
                .ok_or_else(|| TransferError::Validation(format!("no certificate stored for user {} at site {}", raw.user, site)))?;
            let proxy = ctx.proxy_issuer.issue(&credential, now)?;
            Ok((site, proxy))
        })
        .collect()
}

pub(crate) fn site_descriptor(ctx: &SchedulerContext, site: &SiteId) -> Result<SiteDescriptor, TransferError> {
    ctx.store.get_site(site).map(|s| s.descriptor()).ok_or_else(|| TransferError::Validation(format!("unknown site {}", site)))
}

/// Parses every source spec and groups the paths by storage, in first-seen order.
fn group_sources(ctx: &SchedulerContext, raw: &RawJob) -> Result<Vec<SourceGroup>, TransferError> {
    if raw.src_files.is_empty() {
        return Err(TransferError::Validation("job has no source files".to_string()));
    }

    let mut groups: Vec<SourceGroup> = Vec::new();
    for spec in &raw.src_files {
        let src: EndpointSpec = spec.parse().map_err(|e| TransferError::Validation(format!("{}", e)))?;
        if !raw.src_sites.contains(&src.site) {
            return Err(TransferError::Validation(format!("source {} is not on one of the job's source sites", spec)));
        }

        match groups.iter_mut().find(|g| g.site.id == src.site && g.storage == src.storage) {
            Some(group) => group.paths.push(src.path),
            None => groups.push(SourceGroup { site: site_descriptor(ctx, &src.site)?, storage: src.storage, paths: vec![src.path] }),
        }
    }
    Ok(groups)
}

async fn expand_and_group(ctx: &SchedulerContext, group: &SourceGroup) -> Result<Vec<Block>, TransferError> {
    let checksum = &ctx.config.checksum;
    let reply: ExpandAndGroupReply = send_command(
        ctx.portal.as_ref(),
        &group.site.url,
        PortalCommand::FileExpandAndGroup,
        json!({
            "storage": group.storage,
            "paths": group.paths,
            "group_size": ctx.config.group_size,
            "checksum": checksum.enabled,
            "algorithm": checksum.algorithm,
            "threads": checksum.threads,
        }),
    )
    .await?;

    Ok(reply.groups.into_iter().filter(|g| !g.files.is_empty()).map(|g| Block::new(g.root, g.files)).collect())
}

impl SchedulerLane {
    pub(crate) fn submit(&mut self, job: RawJob) -> Result<RawJobId, Error> {
        self.ctx.store.insert_rawjob(job.clone())?;

        let id = job.id.clone();
        log::info!("RawJob {} submitted by {}: {} source spec(s) -> {}", id, job.user, job.src_files.len(), job.dst_path);
        let key = self.book.insert(job.clone(), Vec::new());
        self.spawn_intake(key, job);
        Ok(id)
    }

    fn spawn_intake(&mut self, key: JobKey, raw: RawJob) {
        if let Some(entry) = self.book.entry_mut(key) {
            entry.bootstrapping = true;
        }

        let ctx = self.ctx.clone();
        self.spawn_worker(Some(key), async move {
            let mut raw = raw;
            let result = bootstrap_transfer_job(&ctx, &mut raw).await;
            WorkerOutcome::Bootstrapped { key, raw, result }
        });
    }

    pub(crate) fn on_bootstrapped(&mut self, key: JobKey, raw: RawJob, result: Result<Vec<SJob>, TransferError>) {
        let Some(entry) = self.book.entry_mut(key) else {
            return;
        };
        entry.bootstrapping = false;

        if entry.is_winding_down() {
            // Cancelled while intake ran; intake's writes must not win.
            if let Ok(mut sjobs) = result {
                let message = entry.failure.clone().or_else(|| entry.raw.message.clone()).unwrap_or_default();
                sjobs.iter_mut().for_each(|sjob| sjob.fail(message.clone()));
                self.ctx.store.replace_sjobs(&entry.raw.id, sjobs.clone());
                entry.sjobs = sjobs;
            }
            return;
        }

        match result {
            Ok(sjobs) => {
                entry.raw.proxies = raw.proxies;
                entry.raw.size = raw.size;
                entry.sjobs = sjobs;
            }
            Err(e) => {
                log::error!("RawJob {}: intake failed: {}", raw.id, e);
                self.fail_raw(key, e.to_string());
            }
        }
    }

    /// Picks up `waiting`/`transferring` raw jobs left in the store by a previous run.
    ///
    /// Jobs without sjobs go through intake again. Flows that were live are
    /// retired: their block goes back to `waiting` and their path is torn down.
    pub(crate) fn resume(&mut self) {
        let unfinished = self.ctx.store.get_rawjobs_from_state(&[RawJobState::Waiting, RawJobState::Transferring]);
        if unfinished.is_empty() {
            return;
        }
        log::info!("Resuming {} unfinished raw job(s)", unfinished.len());

        for raw in unfinished {
            if self.book.key_of(&raw.id).is_some() {
                continue;
            }

            let mut sjobs = self.ctx.store.get_sjobs_from_rawjob(&raw.id);
            if sjobs.is_empty() {
                log::info!("RawJob {} has no sjobs, re-running intake", raw.id);
                let key = self.book.insert(raw.clone(), Vec::new());
                self.spawn_intake(key, raw);
                continue;
            }

            let failure = sjobs.iter().find(|s| s.is_failing()).and_then(|s| s.message.clone());
            let mut retired = Vec::new();
            for sjob in sjobs.iter_mut() {
                if failure.is_some() {
                    // Failed flows whose release was cut short by the restart.
                    for flow in sjob.flows.iter().filter(|f| f.state == FlowState::Error && f.has_pair() && f.path.holds_resources()) {
                        retired.push((sjob.id.clone(), flow.task.clone(), false));
                    }
                }
                for flow in sjob.flows.iter_mut().filter(|f| f.is_live() || f.state == FlowState::WaitingToBeTeared) {
                    if let Some(block) = flow.block_index.and_then(|index| sjob.blocks.get_mut(index)) {
                        if block.state() == BlockState::Transferring {
                            let _ = block.reset_to_waiting();
                        }
                    }

                    let launched = flow.state.is_launched();
                    if flow.has_pair() || launched {
                        flow.state = FlowState::WaitingToBeTeared;
                        retired.push((sjob.id.clone(), flow.task.clone(), launched));
                    } else {
                        flow.state = FlowState::Done;
                    }
                }
            }

            let raw_id = raw.id.clone();
            let sjob_ids: Vec<_> = sjobs.iter().map(|s| s.id.clone()).collect();
            let key = self.book.insert(raw, sjobs);
            for sjob_id in &sjob_ids {
                self.persist_sjob(key, sjob_id);
            }
            log::info!("RawJob {} resumed with {} sjob(s), {} flow(s) retired", raw_id, sjob_ids.len(), retired.len());

            for (sjob_id, task, launched) in retired {
                self.spawn_teardown(key, &sjob_id, &task, launched);
            }
            if let Some(message) = failure {
                log::info!("RawJob {} was failing before the restart, finishing its teardown", raw_id);
                self.fail_raw(key, message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::collaborators::portal::PortalResponse;
    use crate::domain::collaborators::proxy::UserCredential;
    use crate::domain::collaborators::resource_graph::InMemoryResourceGraph;
    use crate::domain::collaborators::scripted::{ScriptedPortal, ScriptedRpc};
    use crate::domain::collaborators::site_store::{MemorySiteStore, SiteStore};
    use crate::domain::model::block::FileEntry;
    use crate::domain::model::flow::Flow;
    use crate::domain::model::raw_job::RawJobState;
    use crate::domain::model::sjob::SJobState;
    use crate::domain::model::site::Site;
    use crate::domain::model::stage::{Stage, StageStatus};
    use crate::domain::scheduler::config::SchedulerConfig;
    use crate::domain::scheduler::network::tests::endpoint;
    use crate::domain::telemetry::time_series::MemoryTimeSeries;
    use crate::domain::utils::id::RawJobId;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    const MB: u64 = 1024 * 1024;

    struct Fixture {
        ctx: SchedulerContext,
        portal: Arc<ScriptedPortal>,
        store: Arc<MemorySiteStore>,
        graph: Arc<InMemoryResourceGraph>,
    }

    fn fixture(config: SchedulerConfig) -> Fixture {
        let portal = Arc::new(ScriptedPortal::new());
        let store = Arc::new(MemorySiteStore::new());
        let graph = Arc::new(InMemoryResourceGraph::from_dto(
            serde_json::from_str(r#"{"localSite": "a", "launcherQueue": "a.launcher"}"#).unwrap(),
        ));
        store.insert_site(Site::new(SiteId::new("a"), "https://a"));
        store.insert_site(Site::new(SiteId::new("b"), "https://b"));
        for site in ["a", "b"] {
            store.insert_user_credential(UserCredential {
                user: "alice".into(),
                site: SiteId::new(site),
                subject: "/CN=alice".into(),
                certificate_pem: "CERT".into(),
                key_pem: "KEY".into(),
            });
        }

        portal.respond_json("get_dtn_info", json!({"free_bytes": 100 * MB}));
        portal.respond("file_expand_and_group", |call, _| {
            let storage = call.params["storage"].as_str().unwrap_or_default().to_string();
            PortalResponse::ok(json!({"groups": [
                {"root": "/data", "files": [{"path": format!("/data/{}-1", storage), "size": MB}]},
                {"root": "/data", "files": [{"path": format!("/data/{}-2", storage), "size": MB}]}
            ]}))
        });

        let ctx = SchedulerContext::new(
            config,
            Arc::new(ScriptedRpc::new()),
            portal.clone(),
            graph.clone(),
            store.clone(),
            Arc::new(MemoryTimeSeries::new()),
        );
        Fixture { ctx, portal, store, graph }
    }

    fn raw_job(src_files: &[&str], dst_path: &str) -> RawJob {
        RawJob {
            id: RawJobId::new("r1"),
            user: "alice".into(),
            src_files: src_files.iter().map(|s| s.to_string()).collect(),
            dst_path: dst_path.into(),
            src_sites: vec![SiteId::new("a")],
            dst_site: SiteId::new("b"),
            deadline: None,
            job_type: JobType::BestEffort,
            proxies: BTreeMap::new(),
            size: 0,
            tx_bytes: 0,
            state: RawJobState::Waiting,
            message: None,
            submitted_at: 0,
        }
    }

    #[tokio::test]
    async fn one_sjob_per_source_storage() {
        let f = fixture(SchedulerConfig::default());
        let mut raw = raw_job(&["a|s1||/data/x", "a|s2||/data/y", "a|s1||/data/z"], "b|d1||/in");
        f.store.insert_rawjob(raw.clone()).unwrap();

        let sjobs = bootstrap_transfer_job(&f.ctx, &mut raw).await.unwrap();

        assert_eq!(sjobs.len(), 2);
        assert_eq!(sjobs[0].src_storage, StorageId::new("s1"));
        assert_eq!(sjobs[1].src_storage, StorageId::new("s2"));
        assert!(sjobs.iter().all(|s| s.blocks.len() == 2 && s.stage.get(Stage::Bootstrap) == StageStatus::Success));
        assert_eq!(sjobs[0].stage.get(Stage::DtnMatching), StageStatus::Pending);
        assert_eq!(raw.size, 4 * MB);
        assert_eq!(raw.proxies.len(), 2);
        assert_eq!(f.store.get_sjobs_from_rawjob(&raw.id).len(), 2);
        assert_eq!(f.store.get_rawjob(&raw.id).unwrap().size, 4 * MB);

        let expands = f.portal.calls_for("file_expand_and_group");
        assert_eq!(expands.len(), 2);
        assert_eq!(expands.iter().find(|c| c.params["storage"] == "s1").unwrap().params["paths"], json!(["/data/x", "/data/z"]));
    }

    #[tokio::test]
    async fn missing_launcher_fails_before_any_remote_call() {
        let f = fixture(SchedulerConfig::default());
        f.graph.set_launcher_queue(None);
        let mut raw = raw_job(&["a|s1||/data/x"], "b|d1||/in");

        let err = bootstrap_transfer_job(&f.ctx, &mut raw).await.unwrap_err();

        assert!(matches!(err, TransferError::ResourceUnavailable(_)));
        assert!(f.portal.calls().is_empty());
    }

    #[tokio::test]
    async fn destination_must_match_job_site() {
        let f = fixture(SchedulerConfig::default());
        let mut raw = raw_job(&["a|s1||/data/x"], "a|d1||/in");

        let err = bootstrap_transfer_job(&f.ctx, &mut raw).await.unwrap_err();
        assert!(matches!(err, TransferError::Validation(message) if message.contains("targets b")));

        let mut raw = raw_job(&["a|s1||/data/x"], "b|d1");
        assert!(matches!(bootstrap_transfer_job(&f.ctx, &mut raw).await, Err(TransferError::Validation(_))));
    }

    #[tokio::test]
    async fn job_larger_than_free_space_is_rejected() {
        let f = fixture(SchedulerConfig::default());
        f.portal.respond_json("get_dtn_info", json!({"free_bytes": 2 * MB}));
        let mut raw = raw_job(&["a|s1||/data/x"], "b|d1||/in");

        let err = bootstrap_transfer_job(&f.ctx, &mut raw).await.unwrap_err();

        assert!(matches!(err, TransferError::Validation(message) if message.contains("free")));
        assert!(f.store.get_sjobs_from_rawjob(&raw.id).is_empty());
    }

    #[tokio::test]
    async fn password_mode_needs_no_certificates() {
        let config = SchedulerConfig {
            transfer_auth: TransferAuth::Password { username: "bde".into(), password: "pw".into() },
            ..SchedulerConfig::default()
        };
        let f = fixture(config);
        let mut raw = raw_job(&["a|s1||/data/x"], "b|d1||/in");
        raw.user = "bob".into();
        f.store.insert_rawjob(raw.clone()).unwrap();

        bootstrap_transfer_job(&f.ctx, &mut raw).await.unwrap();
        assert!(raw.proxies.is_empty());
    }

    #[tokio::test]
    async fn missing_certificate_is_a_validation_error() {
        let f = fixture(SchedulerConfig::default());
        let mut raw = raw_job(&["a|s1||/data/x"], "b|d1||/in");
        raw.user = "mallory".into();

        let err = bootstrap_transfer_job(&f.ctx, &mut raw).await.unwrap_err();
        assert!(matches!(err, TransferError::Validation(message) if message.contains("mallory")));
    }

    #[tokio::test]
    async fn restart_finishes_releasing_a_failing_job_before_closing_it() {
        let f = fixture(SchedulerConfig::default());
        let mut raw = raw_job(&["a|s1||/data/x"], "b|d1||/in");
        raw.state = RawJobState::Transferring;
        let blocks = vec![Block::new("/data", vec![FileEntry { path: "/data/x".into(), size: MB, checksum: None }])];
        let mut sjob = SJob::new(raw.id.clone(), JobType::BestEffort, SiteId::new("a"), StorageId::new("s1"), SiteId::new("b"), StorageId::new("d1"), "/in", blocks);
        let mut flow = Flow::new(sjob.id.clone(), 0, 0);
        flow.src = Some(endpoint("a", "a1", None));
        flow.dst = Some(endpoint("b", "b1", None));
        flow.path.src_path_id = 11;
        flow.path.dst_path_id = 12;
        flow.state = FlowState::Error;
        sjob.flows.push(flow);
        sjob.fail_after_teardown("transfer failed (mdtm code 4): disk full");
        f.store.insert_rawjob(raw.clone()).unwrap();
        f.store.replace_sjobs(&raw.id, vec![sjob]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut lane = SchedulerLane::new(f.ctx.clone(), tx);
        lane.resume();
        assert_eq!(f.store.get_rawjob(&raw.id).unwrap().state, RawJobState::Transferring);

        while lane.book.key_of(&raw.id).and_then(|key| lane.book.entry(key)).is_some_and(|entry| entry.pending_workers > 0) {
            let message = rx.recv().await.unwrap();
            lane.handle(message);
        }

        assert_eq!(f.portal.calls_for("sdn_release_request").len(), 2);
        let stored = f.store.get_rawjob(&raw.id).unwrap();
        assert_eq!(stored.state, RawJobState::Error);
        assert!(stored.message.unwrap().contains("disk full"));
        assert_eq!(f.store.get_sjobs_from_rawjob(&raw.id)[0].state, SJobState::Error);
    }
}
