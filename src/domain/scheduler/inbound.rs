//! Commands other sites and agents send to this scheduler.
//!
//! `mld_status` goes to the dispatch lane; the LAN commands are served by
//! [`LocalSiteHandlers`] without involving the lane.

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::launcher_dto::MldStatusReport;
use crate::domain::collaborators::rpc::{CommandInbox, InboundCommand};
use crate::domain::scheduler::handle::SchedulerHandle;
use crate::domain::scheduler::network::local_handlers::{IcmpPingRequest, LocalSiteHandlers, SdnReleaseRequest, SdnReserveRequest};
use crate::error::TransferError;

/// How long one `receive` may block before the shutdown token is checked again.
pub const RECEIVE_WAIT: Duration = Duration::from_secs(5);

/// Pause after a failed `receive`.
const RECEIVE_BACKOFF: Duration = Duration::from_secs(1);

fn params<T: DeserializeOwned>(command: &InboundCommand) -> Result<T, TransferError> {
    serde_json::from_value(command.params.clone()).map_err(|e| TransferError::Validation(format!("{} with malformed parameters: {}", command.cmd, e)))
}

fn reply_body<T: serde::Serialize>(result: Result<T, TransferError>) -> Value {
    match result.and_then(|reply| serde_json::to_value(reply).map_err(|e| TransferError::Remote(e.to_string()))) {
        Ok(body) => body,
        Err(e) => json!({ "error": e.to_string() }),
    }
}

/// Runs one command and returns the reply body. Failures are answered with an `error` field.
pub async fn dispatch_inbound(handle: &SchedulerHandle, handlers: &LocalSiteHandlers, command: &InboundCommand) -> Value {
    log::debug!("Inbound {} ({})", command.cmd, command.id);
    match command.cmd.as_str() {
        "mld_status" => {
            let accepted = match params::<MldStatusReport>(command) {
                Ok(report) => handle.report_mld_status(report).await.map_err(|e| TransferError::Remote(e.to_string())),
                Err(e) => Err(e),
            };
            reply_body(accepted.map(|accepted| json!({ "accepted": accepted })))
        }
        "sdn_reserve_request" => match params::<SdnReserveRequest>(command) {
            Ok(request) => reply_body(handlers.sdn_reserve_request(request).await),
            Err(e) => reply_body::<()>(Err(e)),
        },
        "sdn_release_request" => match params::<SdnReleaseRequest>(command) {
            Ok(request) => reply_body(handlers.sdn_release_request(request).await.map(|()| json!({}))),
            Err(e) => reply_body::<()>(Err(e)),
        },
        "dtn_icmp_ping" => match params::<IcmpPingRequest>(command) {
            Ok(request) => reply_body(handlers.dtn_icmp_ping(request).await),
            Err(e) => reply_body::<()>(Err(e)),
        },
        other => {
            log::warn!("Inbound command {} ({}) is not served here", other, command.id);
            json!({ "error": format!("unknown command '{}'", other) })
        }
    }
}

/// Reads `queue` until `shutdown` fires. Each command is served on its own task so a slow
/// LAN reservation does not hold back status reports.
pub fn spawn_inbound_listener(
    handle: SchedulerHandle,
    handlers: Arc<LocalSiteHandlers>,
    inbox: Arc<dyn CommandInbox>,
    queue: String,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        log::info!("Listening for commands on {}", queue);
        loop {
            let batch = tokio::select! {
                _ = shutdown.cancelled() => break,
                batch = inbox.receive(&queue, RECEIVE_WAIT) => batch,
            };

            let commands = match batch {
                Ok(commands) => commands,
                Err(e) => {
                    log::warn!("Could not read commands from {}: {}", queue, e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RECEIVE_BACKOFF) => continue,
                    }
                }
            };

            for command in commands {
                let (handle, handlers, inbox) = (handle.clone(), handlers.clone(), inbox.clone());
                tokio::spawn(async move {
                    let body = dispatch_inbound(&handle, &handlers, &command).await;
                    if let Err(e) = inbox.respond(&command, body).await {
                        log::warn!("Reply to {} ({}) was not delivered: {}", command.cmd, command.id, e);
                    }
                });
            }
        }
        log::info!("Stopped listening on {}", queue);
    })
}
