use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::{ConversionError, PortalError, TransferError};

/// Commands understood by a site's `/bde/command` handler and by the WAN controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortalCommand {
    GetAvailableBestEffortDtn,
    GetDtnInfo,
    DtnStatus,
    DtnIcmpPing,
    SdnReserveRequest,
    SdnReleaseRequest,
    FileExpandAndGroup,
    TryLock,
    Unlock,
    ProbeRate,
    QueryPathDtns,
    VerifyChecksum,
    WanCreate,
    WanReserve,
    WanCommit,
    WanRelease,
    WanTerminate,
    WanDelete,
}

impl PortalCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetAvailableBestEffortDtn => "get_available_best_effort_dtn",
            Self::GetDtnInfo => "get_dtn_info",
            Self::DtnStatus => "dtn_status",
            Self::DtnIcmpPing => "dtn_icmp_ping",
            Self::SdnReserveRequest => "sdn_reserve_request",
            Self::SdnReleaseRequest => "sdn_release_request",
            Self::FileExpandAndGroup => "file_expand_and_group",
            Self::TryLock => "trylock",
            Self::Unlock => "unlock",
            Self::ProbeRate => "probe_rate",
            Self::QueryPathDtns => "query_path_dtns",
            Self::VerifyChecksum => "verify_checksum",
            Self::WanCreate => "wan_create",
            Self::WanReserve => "wan_reserve",
            Self::WanCommit => "wan_commit",
            Self::WanRelease => "wan_release",
            Self::WanTerminate => "wan_terminate",
            Self::WanDelete => "wan_delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortalRequest {
    pub cmd: String,
    #[serde(default)]
    pub params: Value,
}

impl PortalRequest {
    pub fn new(cmd: PortalCommand, params: Value) -> Self {
        PortalRequest { cmd: cmd.as_str().to_string(), params }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortalResponse {
    pub status: u16,
    pub body: Value,
}

impl PortalResponse {
    pub fn ok(body: Value) -> Self {
        PortalResponse { status: 200, body }
    }

    /// A 200 reply whose body carries an `error` field, as remote handlers answer failed commands.
    pub fn failure(message: impl Into<String>) -> Self {
        PortalResponse::ok(serde_json::json!({ "error": message.into() }))
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn error(&self) -> Option<String> {
        match self.body.get("error") {
            None | Some(Value::Null) => None,
            Some(Value::String(message)) => Some(message.clone()),
            Some(other) => Some(other.to_string()),
        }
    }
}

/// Signed HTTPS access to remote sites.
#[async_trait]
pub trait PortalClient: std::fmt::Debug + Send + Sync {
    async fn post(&self, url: &str, request: PortalRequest) -> Result<PortalResponse, PortalError>;
}

pub fn command_url(base_url: &str) -> String {
    format!("{}/bde/command", base_url.trim_end_matches('/'))
}

/// Runs `cmd` against the `/bde/command` handler at `base_url` and decodes the reply.
///
/// Transport failures, non-2xx statuses, an `error` field in the body and
/// undecodable replies all become [`TransferError::Remote`].
pub async fn send_command<T: DeserializeOwned>(
    portal: &dyn PortalClient,
    base_url: &str,
    cmd: PortalCommand,
    params: Value,
) -> Result<T, TransferError> {
    let url = command_url(base_url);
    let response = portal.post(&url, PortalRequest::new(cmd, params)).await.map_err(|e| TransferError::Remote(e.to_string()))?;

    if let Some(error) = response.error() {
        return Err(TransferError::Remote(format!("{} at {}: {}", cmd.as_str(), url, error)));
    }
    if !response.is_success() {
        return Err(TransferError::Remote(format!("{} at {} answered with status {}", cmd.as_str(), url, response.status)));
    }
    T::deserialize(&response.body)
        .map_err(|e| TransferError::Remote(format!("{} at {} returned an unexpected reply: {}", cmd.as_str(), url, e)))
}

/// `reqwest`-backed [`PortalClient`] signing every request with the configured user and token.
#[derive(Debug, Clone)]
pub struct HttpPortalClient {
    client: reqwest::Client,
}

impl HttpPortalClient {
    pub fn new(user: &str, token: &str, timeout: Duration) -> crate::error::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert("X-BDE-USER", HeaderValue::from_str(user).map_err(|e| ConversionError::InvalidPortalCredentials(e.to_string()))?);
        headers.insert("X-BDE-TOKEN", HeaderValue::from_str(token).map_err(|e| ConversionError::InvalidPortalCredentials(e.to_string()))?);

        let client = reqwest::Client::builder().default_headers(headers).timeout(timeout).build()?;
        Ok(HttpPortalClient { client })
    }
}

#[async_trait]
impl PortalClient for HttpPortalClient {
    async fn post(&self, url: &str, request: PortalRequest) -> Result<PortalResponse, PortalError> {
        let response =
            self.client.post(url).json(&request).send().await.map_err(|source| PortalError::Http { url: url.to_string(), source })?;
        let status = response.status();
        let text = response.text().await.map_err(|source| PortalError::Http { url: url.to_string(), source })?;

        if text.trim().is_empty() {
            return Ok(PortalResponse { status: status.as_u16(), body: Value::Null });
        }

        match serde_json::from_str(&text) {
            Ok(body) => Ok(PortalResponse { status: status.as_u16(), body }),
            Err(_) => {
                log::error!(
                    "Portal call failed. The returned response was not JSON.\nURL: <<{}>>\nCommand: <<{}>>\nResponse-Status-Code: <<{}>>\nResponse-Body: <<{}>>",
                    url,
                    request.cmd,
                    status,
                    text
                );
                Err(PortalError::InvalidBody { url: url.to_string(), body: text })
            }
        }
    }
}
