use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use tokio::sync::oneshot;

use crate::api::launcher_dto::{RATE_OK, RATE_UNKNOWN, RATE_UNKNOWN_TASK, RateReply};
use crate::domain::collaborators::rpc::{RpcClient, RpcReply, RpcRequest};
use crate::domain::model::raw_job::RawJobState;
use crate::domain::model::stage::Stage;
use crate::domain::scheduler::job_book::JobKey;
use crate::domain::scheduler::lane::{SchedulerLane, WorkerOutcome};
use crate::domain::scheduler::status_reactor::seed_counters;
use crate::domain::telemetry::time_series::{ANALYTICS_TARGET, MetricLevel, MetricPoint};
use crate::domain::utils::id::{DtnId, SJobId, SiteId, TaskId};
use crate::error::TransferError;

pub const RATE_TIMEOUT: Duration = Duration::from_secs(5);

/// One launched flow to ask the launcher about.
#[derive(Debug, Clone)]
pub struct RateProbe {
    pub key: JobKey,
    pub sjob: SJobId,
    pub task: TaskId,
    /// Source DTN running the transfer program.
    pub dtn: DtnId,
}

#[derive(Debug)]
pub struct RateSample {
    pub probe: RateProbe,
    pub reply: RpcReply,
}

/// Queries `mdtm_rate` for every probe concurrently.
pub async fn poll_launcher(rpc: &dyn RpcClient, queue: &str, probes: Vec<RateProbe>) -> Vec<RateSample> {
    join_all(probes.into_iter().map(|probe| async move {
        let request = RpcRequest::new("mdtm_rate", probe.dtn.as_str(), json!({ "task": probe.task }));
        let reply = rpc.call(queue, request, RATE_TIMEOUT).await;
        RateSample { probe, reply }
    }))
    .await
}

#[derive(Debug, Default, Clone, Copy)]
struct SiteTraffic {
    tx_delta: u64,
    rx_delta: u64,
    tx_rate: f64,
    rx_rate: f64,
}

impl SchedulerLane {
    /// Starts a rate poll. `done` is answered once the samples have been applied, or right away if there is nothing to poll.
    pub(crate) fn begin_rate_poll(&mut self, done: oneshot::Sender<()>) {
        let Some(queue) = self.ctx.graph.launcher_queue() else {
            let _ = done.send(());
            return;
        };
        if !self.book.has_transferring_jobs() {
            let _ = done.send(());
            return;
        }

        let probes = self.rate_probes();
        if probes.is_empty() {
            let _ = done.send(());
            return;
        }
        log::debug!("Polling {} flow rate(s) on {}", probes.len(), queue);

        let rpc = self.ctx.rpc.clone();
        self.spawn_worker(None, async move {
            let samples = poll_launcher(rpc.as_ref(), &queue, probes).await;
            WorkerOutcome::RatesPolled { samples, done }
        });
    }

    fn rate_probes(&self) -> Vec<RateProbe> {
        let mut probes = Vec::new();
        for key in self.book.keys() {
            let Some(entry) = self.book.entry(key) else {
                continue;
            };
            if entry.raw.state != RawJobState::Transferring {
                continue;
            }
            for sjob in entry.sjobs.iter().filter(|s| !s.state.is_terminal()) {
                for flow in sjob.flows.iter().filter(|f| f.state.is_launched()) {
                    let Some(src) = &flow.src else {
                        continue;
                    };
                    probes.push(RateProbe { key, sjob: sjob.id.clone(), task: flow.task.clone(), dtn: src.dtn.id.clone() });
                }
            }
        }
        probes
    }

    pub(crate) fn on_rates_polled(&mut self, samples: Vec<RateSample>, done: oneshot::Sender<()>) {
        let now = self.ctx.now();
        let mut deltas: HashMap<SJobId, u64> = HashMap::new();
        let mut keys: Vec<JobKey> = Vec::new();

        for sample in samples {
            if !keys.contains(&sample.probe.key) {
                keys.push(sample.probe.key);
            }
            self.apply_rate_sample(sample, now, &mut deltas);
        }

        for key in &keys {
            let sjob_ids: Vec<SJobId> = self.book.entry(*key).map(|e| e.sjobs.iter().map(|s| s.id.clone()).collect()).unwrap_or_default();
            for sjob_id in sjob_ids.iter().filter(|id| deltas.contains_key(*id)) {
                self.persist_sjob(*key, sjob_id);
            }
        }

        self.record_throughput(now, &keys, &deltas);
        self.ctx.sink.flush();
        let _ = done.send(());
    }

    fn apply_rate_sample(&mut self, sample: RateSample, now: i64, deltas: &mut HashMap<SJobId, u64>) {
        let RateSample { probe, reply } = sample;
        if reply.timed_out {
            log::debug!("Task {}: rate query timed out, skipped this tick", probe.task);
            return;
        }
        if let Some(error) = reply.error() {
            log::warn!("Task {}: rate query failed: {}", probe.task, error);
            return;
        }
        let rate: RateReply = match reply.parse() {
            Ok(rate) => rate,
            Err(e) => {
                log::warn!("Task {}: unreadable rate reply: {}", probe.task, e);
                return;
            }
        };

        match rate.code {
            RATE_UNKNOWN_TASK => {
                let error = TransferError::Remote(format!("launcher no longer knows task {}", probe.task));
                self.fail_flow(probe.key, &probe.sjob, &probe.task, error, Stage::TransferTransfer);
            }
            RATE_UNKNOWN => {
                if let Some(flow) = self.book.entry_mut(probe.key).and_then(|e| e.sjob_mut(&probe.sjob)).and_then(|s| s.flow_mut(&probe.task)) {
                    flow.rate = 0.0;
                }
            }
            RATE_OK => self.apply_progress(&probe, rate, now, deltas),
            other => log::warn!("Task {}: unexpected rate reply code {}", probe.task, other),
        }
    }

    fn apply_progress(&mut self, probe: &RateProbe, rate: RateReply, now: i64, deltas: &mut HashMap<SJobId, u64>) {
        let inactivity_timeout = self.ctx.config.inactivity_timeout;
        let Some(sjob) = self.book.entry_mut(probe.key).and_then(|e| e.sjob_mut(&probe.sjob)) else {
            return;
        };
        let Some(flow) = sjob.flow_mut(&probe.task) else {
            return;
        };
        if !flow.state.is_launched() {
            return;
        }

        let delta = rate.tx_bytes.saturating_sub(flow.reported_bytes);
        flow.reported_bytes = flow.reported_bytes.max(rate.tx_bytes);
        flow.rate = rate.rate;

        if delta == 0 {
            let idle_secs = now - flow.last_active;
            if idle_secs > inactivity_timeout {
                let error = TransferError::Stalled { task: probe.task.clone(), idle_secs };
                self.fail_flow(probe.key, &probe.sjob, &probe.task, error, Stage::TransferTransfer);
            }
            return;
        }

        flow.last_active = now;
        let block_index = flow.block_index;
        let credited = block_index.and_then(|index| sjob.blocks.get_mut(index)).map(|block| block.credit(delta)).unwrap_or(0);
        *deltas.entry(probe.sjob.clone()).or_default() += credited;
        self.propagate_bytes(probe.key, &probe.sjob, &probe.task, credited as i64);
    }

    /// Writes sjob, raw job and site points for the jobs polled this tick.
    fn record_throughput(&mut self, now: i64, keys: &[JobKey], deltas: &HashMap<SJobId, u64>) {
        let mut sites: BTreeMap<SiteId, SiteTraffic> = BTreeMap::new();

        for key in keys {
            let Some(entry) = self.book.entry(*key) else {
                continue;
            };
            let mut raw_rate = 0.0;
            let mut raw_delta = 0;

            for sjob in &entry.sjobs {
                let delta = deltas.get(&sjob.id).copied().unwrap_or(0);
                if sjob.state.is_terminal() && delta == 0 {
                    continue;
                }
                let rate: f64 = sjob.flows.iter().filter(|f| f.state.is_launched()).map(|f| f.rate).sum();
                self.ctx.sink.record(MetricPoint {
                    time: now,
                    level: MetricLevel::SJob,
                    id: sjob.id.to_string(),
                    rate,
                    delta_bytes: delta,
                    tx_bytes: sjob.tx_bytes,
                    description: format!("{:?}", sjob.state),
                });
                raw_rate += rate;
                raw_delta += delta;

                let src = sites.entry(sjob.src_site.clone()).or_default();
                src.tx_delta += delta;
                src.tx_rate += rate;
                let dst = sites.entry(sjob.dst_site.clone()).or_default();
                dst.rx_delta += delta;
                dst.rx_rate += rate;
            }

            let raw = &entry.raw;
            self.ctx.sink.record(MetricPoint {
                time: now,
                level: MetricLevel::RawJob,
                id: raw.id.to_string(),
                rate: raw_rate,
                delta_bytes: raw_delta,
                tx_bytes: raw.tx_bytes,
                description: format!("{:?}", raw.state),
            });
            tracing::info!(target: ANALYTICS_TARGET, raw_job = %raw.id, rate = raw_rate, delta_bytes = raw_delta, tx_bytes = raw.tx_bytes, size = raw.size, "raw job throughput");
        }

        let store = self.ctx.store.clone();
        self.book.reset_site_rates();
        for (site, traffic) in sites {
            let counters = self.book.site_counters_mut(&site, || seed_counters(store.as_ref(), &site));
            counters.tx_rate += traffic.tx_rate;
            counters.rx_rate += traffic.rx_rate;
            let counters = counters.clone();

            self.ctx.sink.record(MetricPoint {
                time: now,
                level: MetricLevel::Site,
                id: site.to_string(),
                rate: counters.tx_rate + counters.rx_rate,
                delta_bytes: traffic.tx_delta + traffic.rx_delta,
                tx_bytes: counters.tx_bytes,
                description: format!("tx {:.0} B/s, rx {:.0} B/s, rx_bytes {}", counters.tx_rate, counters.rx_rate, counters.rx_bytes),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::MockClock;
    use crate::domain::collaborators::resource_graph::InMemoryResourceGraph;
    use crate::domain::collaborators::scripted::{ScriptedPortal, ScriptedRpc};
    use crate::domain::collaborators::site_store::{MemorySiteStore, SiteStore};
    use crate::domain::model::block::{Block, BlockState, FileEntry};
    use crate::domain::model::flow::{Flow, FlowState};
    use crate::domain::model::raw_job::{JobType, RawJob};
    use crate::domain::model::site::Site;
    use crate::domain::model::sjob::{SJob, SJobState};
    use crate::domain::scheduler::SchedulerContext;
    use crate::domain::scheduler::config::SchedulerConfig;
    use crate::domain::scheduler::lane::SchedulerMessage;
    use crate::domain::scheduler::network::tests::endpoint;
    use crate::domain::telemetry::time_series::MemoryTimeSeries;
    use crate::domain::utils::id::{RawJobId, StorageId};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    const MB: u64 = 1024 * 1024;

    struct Fixture {
        lane: SchedulerLane,
        rpc: Arc<ScriptedRpc>,
        sink: Arc<MemoryTimeSeries>,
        clock: Arc<MockClock>,
        key: JobKey,
        sjob: SJobId,
        task: TaskId,
        rx: mpsc::UnboundedReceiver<SchedulerMessage>,
    }

    /// A transferring raw job whose single flow became active at t=1000.
    fn fixture(launcher: bool) -> Fixture {
        let rpc = Arc::new(ScriptedRpc::new());
        let store = Arc::new(MemorySiteStore::new());
        store.insert_site(Site::new(SiteId::new("a"), "https://a"));
        store.insert_site(Site::new(SiteId::new("b"), "https://b"));
        let topology = if launcher { r#"{"localSite": "a", "launcherQueue": "a.launcher"}"# } else { r#"{"localSite": "a"}"# };
        let graph = InMemoryResourceGraph::from_dto(serde_json::from_str(topology).unwrap());
        let sink = Arc::new(MemoryTimeSeries::new());
        let clock = Arc::new(MockClock::new(1000));
        let config = SchedulerConfig { inactivity_timeout: 300, ..SchedulerConfig::default() };
        let ctx = SchedulerContext::new(config, rpc.clone(), Arc::new(ScriptedPortal::new()), Arc::new(graph), store.clone(), sink.clone())
            .with_clock(clock.clone());

        let raw = RawJob {
            id: RawJobId::new("r1"),
            user: "alice".into(),
            src_files: vec!["a|sa||/data".into()],
            dst_path: "b|sb||/in".into(),
            src_sites: vec![SiteId::new("a")],
            dst_site: SiteId::new("b"),
            deadline: None,
            job_type: JobType::BestEffort,
            proxies: Default::default(),
            size: MB,
            tx_bytes: 0,
            state: RawJobState::Transferring,
            message: None,
            submitted_at: 900,
        };
        let block = Block::new("/data", vec![FileEntry { path: "/data/f1".into(), size: MB, checksum: None }]);
        let mut sjob = SJob::new(raw.id.clone(), JobType::BestEffort, SiteId::new("a"), StorageId::new("sa"), SiteId::new("b"), StorageId::new("sb"), "/in", vec![block]);
        sjob.state = SJobState::Transferring;
        sjob.blocks[0].start_transfer().unwrap();
        let mut flow = Flow::new(sjob.id.clone(), 0, 1000);
        flow.src = Some(endpoint("a", "a1", None));
        flow.dst = Some(endpoint("b", "b1", None));
        flow.path.src_path_id = 1;
        flow.path.dst_path_id = 2;
        flow.state = FlowState::Transferring;
        let task = flow.task.clone();
        sjob.flows.push(flow);

        store.insert_rawjob(raw.clone()).unwrap();
        store.replace_sjobs(&raw.id, vec![sjob.clone()]);

        let (tx, rx) = mpsc::unbounded_channel();
        let mut lane = SchedulerLane::new(ctx, tx);
        let sjob_id = sjob.id.clone();
        let key = lane.book.insert(raw, vec![sjob]);
        lane.book.register_task(task.clone(), key);
        Fixture { lane, rpc, sink, clock, key, sjob: sjob_id, task, rx }
    }

    fn sample(f: &Fixture, reply: RpcReply) -> RateSample {
        RateSample { probe: RateProbe { key: f.key, sjob: f.sjob.clone(), task: f.task.clone(), dtn: DtnId::new("a1") }, reply }
    }

    fn rate(code: i64, rate: f64, tx_bytes: u64) -> RpcReply {
        RpcReply::ok(json!({ "code": code, "rate": rate, "tx_bytes": tx_bytes }))
    }

    fn apply(f: &mut Fixture, reply: RpcReply) -> oneshot::Receiver<()> {
        let (done, done_rx) = oneshot::channel();
        let samples = vec![sample(f, reply)];
        f.lane.on_rates_polled(samples, done);
        done_rx
    }

    #[tokio::test]
    async fn nothing_to_poll_without_launcher() {
        let mut f = fixture(false);
        let (done, mut done_rx) = oneshot::channel();
        f.lane.begin_rate_poll(done);
        assert!(done_rx.try_recv().is_ok());
        assert!(f.rpc.calls().is_empty());
    }

    #[tokio::test]
    async fn poll_queries_every_launched_flow() {
        let mut f = fixture(true);
        f.rpc.respond_json("mdtm_rate", json!({ "code": RATE_OK, "rate": 10.0, "tx_bytes": 0 }));
        let (done, _done_rx) = oneshot::channel();
        f.lane.begin_rate_poll(done);

        let Some(SchedulerMessage::Worker(WorkerOutcome::RatesPolled { samples, .. })) = f.rx.recv().await else {
            panic!("expected rate samples");
        };
        assert_eq!(samples.len(), 1);
        let calls = f.rpc.calls_for("mdtm_rate");
        assert_eq!(calls[0].request.target, "a1");
        assert_eq!(calls[0].timeout, RATE_TIMEOUT);
    }

    #[tokio::test]
    async fn progress_credits_bytes_and_writes_all_levels() {
        let mut f = fixture(true);
        f.clock.advance_s(10);
        let mut done = apply(&mut f, rate(RATE_OK, 52_428.8, 512 * 1024));
        assert!(done.try_recv().is_ok());

        let entry = f.lane.book.entry(f.key).unwrap();
        let sjob = entry.sjob(&f.sjob).unwrap();
        assert_eq!(sjob.blocks[0].tx_bytes, 512 * 1024);
        assert_eq!(sjob.tx_bytes, 512 * 1024);
        assert_eq!(sjob.flows[0].last_active, 1010);
        assert_eq!(entry.raw.tx_bytes, 512 * 1024);
        assert_eq!(f.lane.book.site_counters(&SiteId::new("b")).unwrap().rx_bytes, 512 * 1024);
        assert_eq!(f.lane.book.site_counters(&SiteId::new("a")).unwrap().tx_rate, 52_428.8);

        let raw_points = f.sink.points_for(MetricLevel::RawJob, "r1");
        assert_eq!(raw_points.len(), 1);
        assert_eq!(raw_points[0].delta_bytes, 512 * 1024);
        assert_eq!(f.sink.points_for(MetricLevel::SJob, f.sjob.as_str()).len(), 1);
        assert_eq!(f.sink.points_for(MetricLevel::Site, "a").len(), 1);

        // The launcher reports cumulative bytes; only the increase is credited.
        apply(&mut f, rate(RATE_OK, 1.0, 600 * 1024));
        let sjob = f.lane.book.entry(f.key).unwrap().sjob(&f.sjob).unwrap();
        assert_eq!(sjob.blocks[0].tx_bytes, 600 * 1024);
    }

    #[tokio::test]
    async fn stalled_flow_is_failed_and_torn_down_once() {
        let mut f = fixture(true);
        f.clock.advance_s(301);
        apply(&mut f, rate(RATE_OK, 0.0, 0));
        apply(&mut f, rate(RATE_OK, 0.0, 0));

        let entry = f.lane.book.entry(f.key).unwrap();
        let sjob = entry.sjob(&f.sjob).unwrap();
        assert_eq!(sjob.flows[0].state, FlowState::Error);
        assert_eq!(sjob.blocks[0].state(), BlockState::Waiting);
        assert_eq!(entry.raw.state, RawJobState::Transferring);
        assert!(entry.failure.as_deref().unwrap().contains("no progress for 301s"));
        assert_eq!(entry.pending_workers, 1);
    }

    #[tokio::test]
    async fn idle_within_timeout_is_tolerated() {
        let mut f = fixture(true);
        f.clock.advance_s(300);
        apply(&mut f, rate(RATE_OK, 0.0, 0));

        let entry = f.lane.book.entry(f.key).unwrap();
        assert_eq!(entry.sjob(&f.sjob).unwrap().flows[0].state, FlowState::Transferring);
    }

    #[tokio::test]
    async fn unknown_rate_is_zero_and_never_stalls() {
        let mut f = fixture(true);
        f.clock.advance_s(1000);
        apply(&mut f, rate(RATE_UNKNOWN, 99.0, 0));

        let sjob = f.lane.book.entry(f.key).unwrap().sjob(&f.sjob).unwrap();
        assert_eq!(sjob.flows[0].state, FlowState::Transferring);
        assert_eq!(sjob.flows[0].rate, 0.0);
    }

    #[tokio::test]
    async fn unknown_task_fails_the_job() {
        let mut f = fixture(true);
        apply(&mut f, rate(RATE_UNKNOWN_TASK, 0.0, 0));

        let entry = f.lane.book.entry(f.key).unwrap();
        assert!(entry.is_winding_down());
        assert!(entry.failure.as_deref().unwrap().contains("no longer knows task"));
    }

    #[tokio::test]
    async fn timed_out_query_is_skipped() {
        let mut f = fixture(true);
        f.clock.advance_s(1000);
        apply(&mut f, RpcReply::timeout());

        let entry = f.lane.book.entry(f.key).unwrap();
        assert_eq!(entry.raw.state, RawJobState::Transferring);
        assert_eq!(entry.sjob(&f.sjob).unwrap().flows[0].state, FlowState::Transferring);
    }
}
