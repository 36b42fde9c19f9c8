use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::api::portal_dto::{PingReply, SdnReserveReply};
use crate::domain::collaborators::resource_graph::ResourceGraph;
use crate::domain::collaborators::rpc::{DEFAULT_RPC_TIMEOUT, RpcClient, RpcRequest, call_checked};
use crate::domain::model::node::DtnRecord;
use crate::domain::scheduler::config::NetworkConfig;
use crate::domain::utils::id::DtnId;
use crate::error::TransferError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdnReserveRequest {
    pub dtn: DtnId,
    pub peer_ip: String,
    #[serde(default)]
    pub peer_mac: Option<String>,
    #[serde(default)]
    pub vlan: Option<u16>,
    pub bandwidth: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdnReleaseRequest {
    pub dtn: DtnId,
    pub path_id: i64,
    pub peer_ip: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IcmpPingRequest {
    pub dtn: DtnId,
    pub dst_ip: String,
    #[serde(default = "default_count")]
    pub count: u32,
}

fn default_count() -> u32 {
    3
}

/// Receiving side of the LAN commands when this scheduler's own site is the target.
///
/// Each request is translated into ARP, route and SDN commands for the local
/// DTN agent and SDN agent.
#[derive(Debug, Clone)]
pub struct LocalSiteHandlers {
    rpc: Arc<dyn RpcClient>,
    graph: Arc<dyn ResourceGraph>,
    network: NetworkConfig,
}

impl LocalSiteHandlers {
    pub fn new(rpc: Arc<dyn RpcClient>, graph: Arc<dyn ResourceGraph>, network: NetworkConfig) -> Self {
        LocalSiteHandlers { rpc, graph, network }
    }

    /// `arp_add` and `route_add` on the DTN (unless suppressed), then `sdn_reserve` on the SDN agent.
    pub async fn sdn_reserve_request(&self, request: SdnReserveRequest) -> Result<SdnReserveReply, TransferError> {
        let (dtn, dtn_queue) = self.local_dtn(&request.dtn)?;
        let sdn_queue = self.sdn_queue()?;

        if !self.network.suppress_arp {
            let params = json!({ "ip": request.peer_ip, "mac": request.peer_mac, "dev_ip": dtn.data_ip });
            self.dtn_command(&dtn_queue, "arp_add", &dtn.id, params).await?;
        }
        if !self.network.suppress_route {
            let params = json!({ "dst": request.peer_ip, "vlan": request.vlan, "src_ip": dtn.data_ip });
            self.dtn_command(&dtn_queue, "route_add", &dtn.id, params).await?;
        }

        let params = json!({
            "dtn": dtn.id,
            "mac": dtn.data_mac,
            "ip": dtn.data_ip,
            "vlan": request.vlan,
            "bandwidth": request.bandwidth,
        });
        let reply: SdnReserveReply = call_checked(
            self.rpc.as_ref(),
            &sdn_queue,
            RpcRequest::new("sdn_reserve", self.graph.local_site().as_str(), params),
            DEFAULT_RPC_TIMEOUT,
        )
        .await?;

        log::info!("Local SDN reservation {} created for DTN {} towards {}", reply.path_id, dtn.id, request.peer_ip);
        Ok(reply)
    }

    /// `sdn_release`, `route_del` and `arp_del`, all attempted. Returns the first failure.
    pub async fn sdn_release_request(&self, request: SdnReleaseRequest) -> Result<(), TransferError> {
        let (dtn, dtn_queue) = self.local_dtn(&request.dtn)?;
        let sdn_queue = self.sdn_queue()?;

        let release = call_checked::<Value>(
            self.rpc.as_ref(),
            &sdn_queue,
            RpcRequest::new("sdn_release", self.graph.local_site().as_str(), json!({ "dtn": dtn.id, "path_id": request.path_id })),
            DEFAULT_RPC_TIMEOUT,
        )
        .await
        .map(|_| ());

        let route = if self.network.suppress_route {
            Ok(())
        } else {
            self.dtn_command(&dtn_queue, "route_del", &dtn.id, json!({ "dst": request.peer_ip })).await
        };

        let arp = if self.network.suppress_arp {
            Ok(())
        } else {
            self.dtn_command(&dtn_queue, "arp_del", &dtn.id, json!({ "ip": request.peer_ip })).await
        };

        for result in [&release, &route, &arp] {
            if let Err(e) = result {
                log::error!("Local release of SDN path {} on DTN {} incomplete: {}", request.path_id, dtn.id, e);
            }
        }
        release.and(route).and(arp)
    }

    pub async fn dtn_icmp_ping(&self, request: IcmpPingRequest) -> Result<PingReply, TransferError> {
        let (dtn, dtn_queue) = self.local_dtn(&request.dtn)?;
        call_checked(
            self.rpc.as_ref(),
            &dtn_queue,
            RpcRequest::new("icmp_ping", dtn.id.as_str(), json!({ "dst_ip": request.dst_ip, "count": request.count })),
            DEFAULT_RPC_TIMEOUT,
        )
        .await
    }

    fn local_dtn(&self, id: &DtnId) -> Result<(DtnRecord, String), TransferError> {
        let dtn = self.graph.dtn(id).ok_or_else(|| TransferError::ResourceUnavailable(format!("DTN {} is not registered at this site", id)))?;
        if !self.graph.is_online(id) {
            return Err(TransferError::ResourceUnavailable(format!("DTN {} is offline", id)));
        }
        let queue = self.graph.dtn_queue(id).ok_or_else(|| TransferError::ResourceUnavailable(format!("DTN {} has no command queue", id)))?;
        Ok((dtn, queue))
    }

    fn sdn_queue(&self) -> Result<String, TransferError> {
        self.graph.sdn_agent_queue().ok_or_else(|| TransferError::ResourceUnavailable("SDN agent is offline".to_string()))
    }

    async fn dtn_command(&self, queue: &str, cmd: &str, dtn: &DtnId, params: Value) -> Result<(), TransferError> {
        call_checked::<Value>(self.rpc.as_ref(), queue, RpcRequest::new(cmd, dtn.as_str(), params), DEFAULT_RPC_TIMEOUT).await.map(|_| ())
    }
}
