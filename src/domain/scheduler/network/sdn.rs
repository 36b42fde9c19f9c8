use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::api::portal_dto::SdnReserveReply;
use crate::domain::collaborators::portal::{PortalCommand, send_command};
use crate::domain::model::flow::{FlowEndpoint, NO_PATH, ProvisionedPath};
use crate::domain::model::stage::{Stage, StageTrail};
use crate::domain::scheduler::network::{NetworkPathOrchestrator, SDN_DST_FAILED, SDN_SRC_FAILED, settle};
use crate::domain::utils::id::SJobId;
use crate::error::TransferError;

/// One side of a LAN reservation.
struct Side<'a> {
    label: &'static str,
    stage: Stage,
    code: i64,
    this: &'a FlowEndpoint,
    peer: &'a FlowEndpoint,
    vlan: Option<u16>,
}

impl NetworkPathOrchestrator {
    /// Reserves the source segment, then the destination segment.
    ///
    /// A source failure returns immediately, leaving the destination untouched.
    #[allow(clippy::too_many_arguments)]
    pub(super) async fn setup_sdn_path(
        &self,
        sjob: &SJobId,
        src: &FlowEndpoint,
        dst: &FlowEndpoint,
        bandwidth: u64,
        path: &mut ProvisionedPath,
        trail: &mut StageTrail,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        if self.config.pre_ping {
            self.warm_mac_tables(sjob, src, dst).await;
        }

        let src_side = Side { label: "source", stage: Stage::NetworkLanSrc, code: SDN_SRC_FAILED, this: src, peer: dst, vlan: path.vlan_src };
        path.src_path_id = self.reserve_side(sjob, &src_side, bandwidth, trail, cancel).await?;

        let dst_side =
            Side { label: "destination", stage: Stage::NetworkLanDst, code: SDN_DST_FAILED, this: dst, peer: src, vlan: path.vlan_dst };
        path.dst_path_id = self.reserve_side(sjob, &dst_side, bandwidth, trail, cancel).await?;

        Ok(())
    }

    /// Releases every side holding a reservation. Both sides are attempted; the first failure is returned.
    pub(super) async fn teardown_sdn_path(
        &self,
        sjob: &SJobId,
        src: &FlowEndpoint,
        dst: &FlowEndpoint,
        path: &mut ProvisionedPath,
    ) -> Result<(), TransferError> {
        let src_result = match path.src_path_id {
            NO_PATH => Ok(()),
            path_id => self.release_side(sjob, "source", SDN_SRC_FAILED, src, dst, path_id).await,
        };
        if src_result.is_ok() {
            path.src_path_id = NO_PATH;
        }

        let dst_result = match path.dst_path_id {
            NO_PATH => Ok(()),
            path_id => self.release_side(sjob, "destination", SDN_DST_FAILED, dst, src, path_id).await,
        };
        if dst_result.is_ok() {
            path.dst_path_id = NO_PATH;
        }

        src_result.and(dst_result)
    }

    async fn reserve_side(
        &self,
        sjob: &SJobId,
        side: &Side<'_>,
        bandwidth: u64,
        trail: &mut StageTrail,
        cancel: &CancellationToken,
    ) -> Result<i64, TransferError> {
        trail.working(side.stage);

        if !side.this.dtn.sdn_setup {
            log::debug!("SJob {}: {} DTN {} has no programmable switch port, skipping LAN reservation", sjob, side.label, side.this.dtn.id);
            trail.success(side.stage);
            return Ok(NO_PATH);
        }

        let attempts = self.config.sdn_attempts;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                trail.retry();
            }
            let params = json!({
                "sjob": sjob,
                "dtn": side.this.dtn.id,
                "ip": side.this.dtn.data_ip,
                "mac": side.this.dtn.data_mac,
                "peer_ip": side.peer.dtn.data_ip,
                "peer_mac": side.peer.dtn.data_mac,
                "vlan": side.vlan,
                "bandwidth": bandwidth,
                "attempt": attempt,
            });

            match send_command::<SdnReserveReply>(self.portal.as_ref(), &side.this.site.url, PortalCommand::SdnReserveRequest, params).await {
                Ok(reply) => {
                    log::info!("SJob {}: {} LAN segment reserved on {} (path id {})", sjob, side.label, side.this.dtn.id, reply.path_id);
                    trail.success(side.stage);
                    return Ok(reply.path_id);
                }
                Err(e) => {
                    log::warn!("SJob {}: {} LAN reservation attempt {}/{} failed: {}", sjob, side.label, attempt, attempts, e);
                    last_error = e.to_string();
                }
            }

            if attempt < attempts {
                settle(self.config.sdn_retry_delay, Some(cancel)).await.inspect_err(|_| trail.error(side.stage))?;
            }
        }

        trail.error(side.stage);
        Err(TransferError::provisioning(
            side.stage,
            side.code,
            format!("{} LAN reservation failed after {} attempts: {}", side.label, attempts, last_error),
        ))
    }

    async fn release_side(
        &self,
        sjob: &SJobId,
        label: &str,
        code: i64,
        this: &FlowEndpoint,
        peer: &FlowEndpoint,
        path_id: i64,
    ) -> Result<(), TransferError> {
        let params = json!({ "sjob": sjob, "dtn": this.dtn.id, "path_id": path_id, "peer_ip": peer.dtn.data_ip });
        send_command::<serde_json::Value>(self.portal.as_ref(), &this.site.url, PortalCommand::SdnReleaseRequest, params)
            .await
            .map(|_| log::info!("SJob {}: {} LAN segment {} released", sjob, label, path_id))
            .map_err(|e| {
                log::error!("SJob {}: releasing {} LAN segment {} failed: {}", sjob, label, path_id, e);
                TransferError::provisioning(Stage::TeardownLan, code, format!("{} LAN release failed: {}", label, e))
            })
    }

    async fn warm_mac_tables(&self, sjob: &SJobId, src: &FlowEndpoint, dst: &FlowEndpoint) {
        for (from, to) in [(src, dst), (dst, src)] {
            if let Err(e) = self.ping(from, &to.dtn.data_ip, 1).await {
                log::debug!("SJob {}: pre-ping {} -> {} failed: {}", sjob, from.dtn.id, to.dtn.id, e);
            }
        }
    }
}
