use std::path::Path;
use std::sync::Arc;

use crate::api::config_dto::SchedulerConfigDto;
use crate::api::topology_dto::TopologyDto;
use crate::domain::collaborators::portal::HttpPortalClient;
use crate::domain::collaborators::resource_graph::{InMemoryResourceGraph, ResourceGraph};
use crate::domain::collaborators::rpc::HttpRpcGateway;
use crate::domain::collaborators::site_store::{MemorySiteStore, SiteStore};
use crate::domain::scheduler::SchedulerContext;
use crate::domain::scheduler::config::SchedulerConfig;
use crate::domain::telemetry::time_series::CsvTimeSeries;
use crate::error::{ConversionError, Result};
use crate::loader::parser::parse_json_file;

pub mod api;
pub mod domain;
pub mod error;
pub mod loader;
pub mod logger;

pub fn load_config(file_path: impl AsRef<Path>) -> Result<SchedulerConfig> {
    let dto: SchedulerConfigDto = parse_json_file(file_path)?;
    Ok(SchedulerConfig::try_from(dto)?)
}

/// Builds the production context: HTTP portal, the RPC gateway (also the command inbox), CSV metrics, and a store seeded with the topology's sites.
pub fn build_scheduler_context(config_path: impl AsRef<Path>, topology_path: impl AsRef<Path>) -> Result<SchedulerContext> {
    let config = load_config(config_path)?;
    log::info!("Configuration loaded: {} authentication, checksums {}", config.transfer_auth.mode(), config.checksum.enabled);

    let topology: TopologyDto = parse_json_file(topology_path)?;
    let graph = InMemoryResourceGraph::from_dto(topology);
    let store = MemorySiteStore::new();
    for site in graph.sites() {
        store.insert_site(site);
    }
    log::info!("Topology loaded for local site {} ({} site(s))", graph.local_site(), graph.sites().len());

    let portal_settings = config.portal.clone().ok_or(ConversionError::MissingSetting("portal"))?;
    let portal = HttpPortalClient::new(&portal_settings.user, &portal_settings.token, portal_settings.timeout)?;
    let gateway = config.rpc_gateway.clone().ok_or(ConversionError::MissingSetting("rpcGateway"))?;
    let rpc = HttpRpcGateway::new(gateway)?;
    let sink = CsvTimeSeries::init(config.metrics_file.as_deref())?;

    let rpc = Arc::new(rpc);
    let ctx = SchedulerContext::new(config, rpc.clone(), Arc::new(portal), Arc::new(graph), Arc::new(store), Arc::new(sink));
    Ok(ctx.with_inbox(rpc))
}
