use serde_json::json;

use crate::api::portal_dto::AvailableDtnsReply;
use crate::domain::collaborators::portal::{PortalClient, PortalCommand, send_command};
use crate::domain::model::flow::FlowEndpoint;
use crate::domain::model::node::{DtnRecord, SiteDescriptor};
use crate::domain::utils::id::StorageId;
use crate::error::TransferError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
    /// DTNs on the dedicated data network; the path must be provisioned.
    Private,
    /// DTNs reachable over the routed network; nothing to provision.
    Public,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DtnPair {
    pub src: FlowEndpoint,
    pub dst: FlowEndpoint,
    pub network: NetworkKind,
}

/// Asks both sites for DTNs serving the given storages and picks a pair.
///
/// A private pair wins whenever both sides offer one; otherwise a public pair
/// is used. Within a list the least loaded DTN is taken.
pub async fn match_dtns(
    portal: &dyn PortalClient,
    src_site: &SiteDescriptor,
    src_storage: &StorageId,
    dst_site: &SiteDescriptor,
    dst_storage: &StorageId,
) -> Result<DtnPair, TransferError> {
    let (src_reply, dst_reply) = tokio::join!(available_dtns(portal, src_site, src_storage), available_dtns(portal, dst_site, dst_storage));
    let (src_reply, dst_reply) = (src_reply?, dst_reply?);

    let (src, dst, network) = match (least_loaded(&src_reply.private), least_loaded(&dst_reply.private)) {
        (Some(src), Some(dst)) => (src, dst, NetworkKind::Private),
        _ => match (least_loaded(&src_reply.public), least_loaded(&dst_reply.public)) {
            (Some(src), Some(dst)) => (src, dst, NetworkKind::Public),
            _ => {
                return Err(TransferError::ResourceUnavailable(format!(
                    "no private or public DTN pair between {}/{} and {}/{}",
                    src_site.id, src_storage, dst_site.id, dst_storage
                )));
            }
        },
    };

    log::info!("Matched {:?} DTN pair {} ({}) -> {} ({})", network, src.id, src_site.id, dst.id, dst_site.id);

    Ok(DtnPair {
        src: FlowEndpoint { dtn: src.clone(), site: src_site.clone() },
        dst: FlowEndpoint { dtn: dst.clone(), site: dst_site.clone() },
        network,
    })
}

async fn available_dtns(portal: &dyn PortalClient, site: &SiteDescriptor, storage: &StorageId) -> Result<AvailableDtnsReply, TransferError> {
    send_command(portal, &site.url, PortalCommand::GetAvailableBestEffortDtn, json!({ "storage": storage })).await
}

fn least_loaded(candidates: &[DtnRecord]) -> Option<&DtnRecord> {
    candidates.iter().min_by(|a, b| a.load.total_cmp(&b.load))
}
