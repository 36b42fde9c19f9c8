pub mod admission;
pub mod cleanup;
pub mod config;
pub mod dtn_matcher;
pub mod handle;
pub mod inbound;
pub mod intake;
pub mod job_book;
pub mod lane;
pub mod launcher;
pub mod mdtm;
pub mod network;
pub mod rate_poller;
pub mod status_reactor;

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::domain::clock::{Clock, SystemClock};
use crate::domain::collaborators::portal::PortalClient;
use crate::domain::collaborators::proxy::{CertificateProxyIssuer, ProxyIssuer};
use crate::domain::collaborators::resource_graph::ResourceGraph;
use crate::domain::collaborators::rpc::{CommandInbox, RpcClient};
use crate::domain::collaborators::site_store::SiteStore;
use crate::domain::scheduler::config::SchedulerConfig;
use crate::domain::scheduler::handle::SchedulerHandle;
use crate::domain::scheduler::lane::SchedulerLane;
use crate::domain::scheduler::network::NetworkPathOrchestrator;
use crate::domain::scheduler::network::local_handlers::LocalSiteHandlers;
use crate::domain::telemetry::time_series::TimeSeriesSink;

/// Everything a worker needs to talk to the outside world.
///
/// Cheap to clone; workers get their own copy. Collaborators never hold a
/// reference back to the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerContext {
    pub config: Arc<SchedulerConfig>,
    pub rpc: Arc<dyn RpcClient>,
    pub portal: Arc<dyn PortalClient>,
    pub graph: Arc<dyn ResourceGraph>,
    pub store: Arc<dyn SiteStore>,
    pub sink: Arc<dyn TimeSeriesSink>,
    pub clock: Arc<dyn Clock>,
    pub proxy_issuer: Arc<dyn ProxyIssuer>,
    pub network: Arc<NetworkPathOrchestrator>,
    /// Serves LAN commands peer sites address to this site.
    pub local_handlers: Arc<LocalSiteHandlers>,
    /// Where inbound commands are read from; `None` when nothing can reach us.
    pub inbox: Option<Arc<dyn CommandInbox>>,
}

impl SchedulerContext {
    pub fn new(
        config: SchedulerConfig,
        rpc: Arc<dyn RpcClient>,
        portal: Arc<dyn PortalClient>,
        graph: Arc<dyn ResourceGraph>,
        store: Arc<dyn SiteStore>,
        sink: Arc<dyn TimeSeriesSink>,
    ) -> Self {
        let network = Arc::new(NetworkPathOrchestrator::new(config.network.clone(), portal.clone()));
        let local_handlers = Arc::new(LocalSiteHandlers::new(rpc.clone(), graph.clone(), config.network.clone()));
        SchedulerContext {
            config: Arc::new(config),
            rpc,
            portal,
            graph,
            store,
            sink,
            clock: Arc::new(SystemClock),
            proxy_issuer: Arc::new(CertificateProxyIssuer::default()),
            network,
            local_handlers,
            inbox: None,
        }
    }

    pub fn with_inbox(mut self, inbox: Arc<dyn CommandInbox>) -> Self {
        self.inbox = Some(inbox);
        self
    }

    /// Queue inbound commands are read from.
    pub fn inbound_queue(&self) -> String {
        match &self.config.inbound_queue {
            Some(queue) => queue.clone(),
            None => format!("{}.scheduler", self.graph.local_site()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_proxy_issuer(mut self, issuer: Arc<dyn ProxyIssuer>) -> Self {
        self.proxy_issuer = issuer;
        self
    }

    pub fn now(&self) -> i64 {
        self.clock.get_current_time_in_s()
    }
}

/// Spawns the dispatch lane on the current tokio runtime and returns a handle to it.
///
/// Unfinished raw jobs found in the store are resumed before the first message is served.
pub fn start(ctx: SchedulerContext) -> SchedulerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = SchedulerHandle::new(tx.clone(), ctx.clock.clone());
    let lane = SchedulerLane::new(ctx, tx);

    tokio::spawn(async move {
        lane.run(rx).await;
    });

    handle
}
