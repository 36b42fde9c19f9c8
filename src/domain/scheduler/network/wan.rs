use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::api::portal_dto::{WanCreateReply, WanReserveReply};
use crate::domain::collaborators::portal::{PortalCommand, send_command};
use crate::domain::model::stage::Stage;
use crate::domain::scheduler::network::{
    NetworkPathOrchestrator, WAN_COMMIT_FAILED, WAN_CREATE_FAILED, WAN_DELETE_FAILED, WAN_RELEASE_FAILED, WAN_RESERVE_FAILED,
    WAN_TERMINATE_FAILED, settle,
};
use crate::domain::utils::id::SJobId;
use crate::error::TransferError;

/// A committed WAN circuit and the VLANs the broker granted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct WanCircuit {
    pub uuid: String,
    pub vlan_src: Option<u16>,
    pub vlan_dst: Option<u16>,
}

impl NetworkPathOrchestrator {
    fn wan_controller(&self, stage: Stage, code: i64) -> Result<&str, TransferError> {
        self.config.wan_controller_url.as_deref().ok_or_else(|| TransferError::provisioning(stage, code, "no WAN controller configured"))
    }

    /// create -> reserve -> commit. A failed reserve or commit deletes the half-built circuit.
    pub(super) async fn setup_wan_path(
        &self,
        sjob: &SJobId,
        src_stp: &str,
        dst_stp: &str,
        bandwidth: u64,
        cancel: &CancellationToken,
    ) -> Result<WanCircuit, TransferError> {
        let controller = self.wan_controller(Stage::NetworkWan, WAN_CREATE_FAILED)?;
        let portal = self.portal.as_ref();

        let created: WanCreateReply = send_command(
            portal,
            controller,
            PortalCommand::WanCreate,
            json!({ "sjob": sjob, "src_stp": src_stp, "dst_stp": dst_stp, "bandwidth": bandwidth }),
        )
        .await
        .map_err(|e| TransferError::provisioning(Stage::NetworkWan, WAN_CREATE_FAILED, format!("WAN create failed: {}", e)))?;
        let uuid = created.uuid;
        log::info!("SJob {}: WAN circuit {} created ({} -> {}, {} Mbit/s)", sjob, uuid, src_stp, dst_stp, bandwidth);

        if let Err(e) = settle(self.config.wan_step_delay, Some(cancel)).await {
            self.delete_half_built(sjob, controller, &uuid).await;
            return Err(e);
        }

        let reserved: WanReserveReply =
            match send_command(portal, controller, PortalCommand::WanReserve, json!({ "uuid": uuid, "bandwidth": bandwidth })).await {
                Ok(reply) => reply,
                Err(e) => {
                    self.delete_half_built(sjob, controller, &uuid).await;
                    return Err(TransferError::provisioning(Stage::NetworkWan, WAN_RESERVE_FAILED, format!("WAN reserve of {} failed: {}", uuid, e)));
                }
            };

        if let Err(e) = settle(self.config.wan_step_delay, Some(cancel)).await {
            self.delete_half_built(sjob, controller, &uuid).await;
            return Err(e);
        }

        if let Err(e) = send_command::<Value>(portal, controller, PortalCommand::WanCommit, json!({ "uuid": uuid })).await {
            self.delete_half_built(sjob, controller, &uuid).await;
            return Err(TransferError::provisioning(Stage::NetworkWan, WAN_COMMIT_FAILED, format!("WAN commit of {} failed: {}", uuid, e)));
        }

        log::info!("SJob {}: WAN circuit {} committed (vlans {:?}/{:?})", sjob, uuid, reserved.vlan_src, reserved.vlan_dst);
        Ok(WanCircuit { uuid, vlan_src: reserved.vlan_src, vlan_dst: reserved.vlan_dst })
    }

    /// release -> terminate -> delete, every step attempted. Returns the first failure.
    pub(super) async fn teardown_wan_path(&self, sjob: &SJobId, uuid: &str) -> Result<(), TransferError> {
        let controller = self.wan_controller(Stage::TeardownWan, WAN_RELEASE_FAILED)?;
        let steps = [
            (PortalCommand::WanRelease, WAN_RELEASE_FAILED, self.config.wan_release_delay),
            (PortalCommand::WanTerminate, WAN_TERMINATE_FAILED, self.config.wan_terminate_delay),
            (PortalCommand::WanDelete, WAN_DELETE_FAILED, std::time::Duration::ZERO),
        ];

        let mut first_error: Option<TransferError> = None;
        for (cmd, code, delay_after) in steps {
            match send_command::<Value>(self.portal.as_ref(), controller, cmd, json!({ "uuid": uuid })).await {
                Ok(_) => log::info!("SJob {}: {} of WAN circuit {} done", sjob, cmd.as_str(), uuid),
                Err(e) => {
                    log::error!("SJob {}: {} of WAN circuit {} failed: {}", sjob, cmd.as_str(), uuid, e);
                    first_error.get_or_insert(TransferError::provisioning(
                        Stage::TeardownWan,
                        code,
                        format!("{} of WAN circuit {} failed: {}", cmd.as_str(), uuid, e),
                    ));
                }
            }
            if !delay_after.is_zero() {
                let _ = settle(delay_after, None).await;
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    async fn delete_half_built(&self, sjob: &SJobId, controller: &str, uuid: &str) {
        if let Err(e) = send_command::<Value>(self.portal.as_ref(), controller, PortalCommand::WanDelete, json!({ "uuid": uuid })).await {
            log::error!("SJob {}: deleting half-built WAN circuit {} failed: {}", sjob, uuid, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::domain::collaborators::portal::PortalResponse;
    use crate::domain::collaborators::scripted::ScriptedPortal;
    use crate::domain::scheduler::config::NetworkConfig;

    fn orchestrator(portal: Arc<ScriptedPortal>) -> NetworkPathOrchestrator {
        let config = NetworkConfig { wan_controller_url: Some("https://wan".into()), ..NetworkConfig::default() }.without_delays();
        NetworkPathOrchestrator::new(config, portal)
    }

    #[tokio::test]
    async fn circuit_is_committed_with_granted_vlans() {
        let portal = Arc::new(ScriptedPortal::new());
        portal.respond_json("wan_create", json!({"uuid": "w-7"}));
        portal.respond_json("wan_reserve", json!({"vlan_src": 1201, "vlan_dst": 3001}));
        let net = orchestrator(portal.clone());

        let circuit = net.setup_wan_path(&SJobId::new("s1"), "stp-a", "stp-b", 1000, &CancellationToken::new()).await.unwrap();

        assert_eq!(circuit, WanCircuit { uuid: "w-7".into(), vlan_src: Some(1201), vlan_dst: Some(3001) });
        let cmds: Vec<String> = portal.calls().into_iter().map(|c| c.cmd).collect();
        assert_eq!(cmds, vec!["wan_create", "wan_reserve", "wan_commit"]);
        assert!(portal.calls().iter().all(|c| c.url == "https://wan/bde/command"));
    }

    #[tokio::test]
    async fn failed_commit_deletes_circuit() {
        let portal = Arc::new(ScriptedPortal::new());
        portal.respond_json("wan_create", json!({"uuid": "w-8"}));
        portal.respond("wan_commit", |_, _| PortalResponse::failure("vlan taken"));
        let net = orchestrator(portal.clone());

        let err = net.setup_wan_path(&SJobId::new("s1"), "stp-a", "stp-b", 1000, &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, TransferError::Provisioning { code: WAN_COMMIT_FAILED, .. }));
        let deletes = portal.calls_for("wan_delete");
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].params["uuid"], "w-8");
    }

    #[tokio::test]
    async fn failed_create_has_nothing_to_delete() {
        let portal = Arc::new(ScriptedPortal::new());
        portal.respond("wan_create", |_, _| PortalResponse::failure("no capacity"));
        let net = orchestrator(portal.clone());

        let err = net.setup_wan_path(&SJobId::new("s1"), "stp-a", "stp-b", 1000, &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, TransferError::Provisioning { code: WAN_CREATE_FAILED, .. }));
        assert!(portal.calls_for("wan_delete").is_empty());
    }

    #[tokio::test]
    async fn teardown_reports_first_failed_step() {
        let portal = Arc::new(ScriptedPortal::new());
        portal.respond("wan_terminate", |_, _| PortalResponse::failure("busy"));
        portal.respond("wan_delete", |_, _| PortalResponse::failure("gone"));
        let net = orchestrator(portal.clone());

        let err = net.teardown_wan_path(&SJobId::new("s1"), "w-9").await.unwrap_err();

        assert!(matches!(err, TransferError::Provisioning { code: WAN_TERMINATE_FAILED, stage: Stage::TeardownWan, .. }));
        assert_eq!(portal.calls().len(), 3);
    }
}
