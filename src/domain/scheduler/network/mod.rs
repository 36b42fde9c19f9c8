pub mod local_handlers;
mod sdn;
mod wan;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::api::portal_dto::PingReply;
use crate::domain::collaborators::portal::{PortalClient, PortalCommand, send_command};
use crate::domain::model::flow::{FlowEndpoint, ProvisionedPath};
use crate::domain::model::stage::{Stage, StageTrail};
use crate::domain::scheduler::config::NetworkConfig;
use crate::domain::utils::id::SJobId;
use crate::error::TransferError;

pub const SDN_SRC_FAILED: i64 = -1;
pub const SDN_DST_FAILED: i64 = -2;
pub const PATH_UNREACHABLE: i64 = -3;

pub const WAN_CREATE_FAILED: i64 = 300;
pub const WAN_RESERVE_FAILED: i64 = 301;
pub const WAN_COMMIT_FAILED: i64 = 302;
pub const NO_WAN_PATH: i64 = 303;

pub const WAN_RELEASE_FAILED: i64 = 1;
pub const WAN_TERMINATE_FAILED: i64 = 2;
pub const WAN_DELETE_FAILED: i64 = 3;

/// How the two DTNs of a flow get connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPlan {
    /// Both DTNs sit at one site; only the local segment is reserved.
    LanOnly { bandwidth: u64 },
    /// Pre-provisioned circuit from the configuration.
    Static { vlan_src: u16, vlan_dst: u16, bandwidth: u64 },
    /// Circuit negotiated with the WAN controller between the DTNs' STPs.
    Dynamic { src_stp: String, dst_stp: String, bandwidth: u64 },
}

/// Builds and releases the LAN segments and WAN circuit of a flow.
///
/// Every remote step goes through the portal of the site owning the DTN (LAN)
/// or the WAN controller (dynamic circuits).
#[derive(Debug)]
pub struct NetworkPathOrchestrator {
    config: NetworkConfig,
    portal: Arc<dyn PortalClient>,
}

impl NetworkPathOrchestrator {
    pub fn new(config: NetworkConfig, portal: Arc<dyn PortalClient>) -> Self {
        NetworkPathOrchestrator { config, portal }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn plan(&self, src: &FlowEndpoint, dst: &FlowEndpoint) -> Result<PathPlan, TransferError> {
        let bandwidth = src.dtn.link_capacity.min(dst.dtn.link_capacity);

        if src.site.id == dst.site.id {
            return Ok(PathPlan::LanOnly { bandwidth });
        }

        if let Some(path) = self.config.static_path(&src.site.id, &dst.site.id) {
            return Ok(PathPlan::Static { vlan_src: path.vlan_src, vlan_dst: path.vlan_dst, bandwidth: path.bandwidth });
        }

        match (&src.dtn.stp, &dst.dtn.stp) {
            (Some(src_stp), Some(dst_stp)) if src.dtn.supports_dynamic_wan() && dst.dtn.supports_dynamic_wan() => {
                Ok(PathPlan::Dynamic { src_stp: src_stp.clone(), dst_stp: dst_stp.clone(), bandwidth })
            }
            _ => Err(TransferError::provisioning(
                Stage::NetworkWan,
                NO_WAN_PATH,
                format!("no valid static or dynamic WAN path between {} and {}", src.site.id, dst.site.id),
            )),
        }
    }

    /// Plans the path, builds the WAN circuit if needed, then reserves both LAN segments.
    ///
    /// Whatever got built is written into `path` as soon as it exists, so a
    /// failed call leaves `path` ready for [`NetworkPathOrchestrator::teardown`].
    pub async fn network_handling(
        &self,
        sjob: &SJobId,
        src: &FlowEndpoint,
        dst: &FlowEndpoint,
        path: &mut ProvisionedPath,
        trail: &mut StageTrail,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let plan = self.plan(src, dst).inspect_err(|_| trail.error(Stage::NetworkWan))?;
        log::info!("SJob {}: path plan {:?} between {} and {}", sjob, plan, src.dtn.id, dst.dtn.id);

        let bandwidth = match plan {
            PathPlan::LanOnly { bandwidth } => bandwidth,
            PathPlan::Static { vlan_src, vlan_dst, bandwidth } => {
                path.vlan_src = Some(vlan_src);
                path.vlan_dst = Some(vlan_dst);
                bandwidth
            }
            PathPlan::Dynamic { src_stp, dst_stp, bandwidth } => {
                trail.working(Stage::NetworkWan);
                let circuit = self.setup_wan_path(sjob, &src_stp, &dst_stp, bandwidth, cancel).await;
                let circuit = circuit.inspect_err(|_| trail.error(Stage::NetworkWan))?;
                path.wan_uuid = Some(circuit.uuid);
                path.vlan_src = circuit.vlan_src;
                path.vlan_dst = circuit.vlan_dst;
                path.dynamic_wan = true;
                bandwidth
            }
        };
        trail.success(Stage::NetworkWan);

        self.setup_sdn_path(sjob, src, dst, bandwidth, path, trail, cancel).await
    }

    /// Number of ping attempts before a freshly provisioned path is declared unreachable.
    pub fn ping_tries(&self, path: &ProvisionedPath) -> u32 {
        if path.dynamic_wan { self.config.ping_tries_dynamic } else { self.config.ping_tries_static }
    }

    /// Pings the destination DTN from the source DTN until it answers or `tries` run out.
    pub async fn verify_path(
        &self,
        sjob: &SJobId,
        src: &FlowEndpoint,
        dst: &FlowEndpoint,
        tries: u32,
        trail: &mut StageTrail,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        trail.working(Stage::PathVerification);

        for attempt in 1..=tries {
            match self.ping(src, &dst.dtn.data_ip, 3).await {
                Ok(reply) if reply.reachable => {
                    log::debug!("SJob {}: {} reached {} on attempt {}", sjob, src.dtn.id, dst.dtn.id, attempt);
                    trail.success(Stage::PathVerification);
                    return Ok(());
                }
                Ok(_) => log::debug!("SJob {}: {} cannot reach {} yet (attempt {}/{})", sjob, src.dtn.id, dst.dtn.id, attempt, tries),
                Err(e) => log::warn!("SJob {}: ping from {} failed (attempt {}/{}): {}", sjob, src.dtn.id, attempt, tries, e),
            }

            if attempt < tries {
                settle(self.config.ping_interval, Some(cancel)).await.inspect_err(|_| trail.error(Stage::PathVerification))?;
            }
        }

        trail.error(Stage::PathVerification);
        Err(TransferError::provisioning(
            Stage::PathVerification,
            PATH_UNREACHABLE,
            format!("{} ({}) unreachable from {} after {} pings", dst.dtn.id, dst.dtn.data_ip, src.dtn.id, tries),
        ))
    }

    /// Releases the LAN segments, then the WAN circuit. Both halves always run.
    ///
    /// Returns the first failure; sides that hold nothing are skipped silently.
    pub async fn teardown(
        &self,
        sjob: &SJobId,
        src: &FlowEndpoint,
        dst: &FlowEndpoint,
        path: &mut ProvisionedPath,
        trail: &mut StageTrail,
    ) -> Result<(), TransferError> {
        trail.working(Stage::TeardownLan);
        let lan = self.teardown_sdn_path(sjob, src, dst, path).await;
        match &lan {
            Ok(()) => trail.success(Stage::TeardownLan),
            Err(_) => trail.error(Stage::TeardownLan),
        }

        let wan = match path.wan_uuid.clone() {
            Some(uuid) => {
                trail.working(Stage::TeardownWan);
                let result = self.teardown_wan_path(sjob, &uuid).await;
                match &result {
                    Ok(()) => {
                        path.wan_uuid = None;
                        trail.success(Stage::TeardownWan);
                    }
                    Err(_) => trail.error(Stage::TeardownWan),
                }
                result
            }
            None => {
                trail.success(Stage::TeardownWan);
                Ok(())
            }
        };

        lan.and(wan)
    }

    async fn ping(&self, from: &FlowEndpoint, dst_ip: &str, count: u32) -> Result<PingReply, TransferError> {
        send_command(
            self.portal.as_ref(),
            &from.site.url,
            PortalCommand::DtnIcmpPing,
            json!({ "dtn": from.dtn.id, "dst_ip": dst_ip, "count": count }),
        )
        .await
    }
}

/// Waits `delay`, returning early with [`TransferError::Cancelled`] if `cancel` fires.
pub(crate) async fn settle(delay: Duration, cancel: Option<&CancellationToken>) -> Result<(), TransferError> {
    match cancel {
        Some(token) if token.is_cancelled() => Err(TransferError::Cancelled),
        Some(token) => {
            tokio::select! {
                _ = token.cancelled() => Err(TransferError::Cancelled),
                _ = tokio::time::sleep(delay) => Ok(()),
            }
        }
        None => {
            tokio::time::sleep(delay).await;
            Ok(())
        }
    }
}
