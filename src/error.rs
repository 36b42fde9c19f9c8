use thiserror::Error;

use crate::domain::model::stage::Stage;
use crate::domain::utils::id::TaskId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("File not found or could not be read: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse JSON document: {0}")]
    DeserializationError(#[from] serde_json::Error),

    #[error("Invalid scheduler configuration: {0}")]
    ConfigError(#[from] ConversionError),

    #[error("Failed to build HTTP client: {0}")]
    HttpClientError(#[from] reqwest::Error),

    #[error("Store rejected the operation: {0}")]
    StoreError(#[from] StoreError),

    #[error("Invalid job submission: {0}")]
    InvalidSubmission(ConversionError),

    #[error("Scheduler dispatch lane is closed")]
    LaneClosed,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while turning DTOs into domain records.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConversionError {
    #[error("Unknown transfer authentication mode '{0}', expected 'password' or 'certificate'")]
    UnknownTransferAuth(String),

    #[error("Password authentication requires both username and password")]
    MissingPasswordCredentials,

    #[error("Invalid size '{0}' - expected format like '20GB', '500MB' or '1024'")]
    InvalidSize(String),

    #[error("Invalid endpoint spec '{0}', expected 'site|storage|dtn|path'")]
    InvalidEndpointSpec(String),

    #[error("Unknown job type '{0}', expected 'best_effort' or 'reserved'")]
    UnknownJobType(String),

    #[error("Portal user or token is not a valid header value: {0}")]
    InvalidPortalCredentials(String),

    #[error("Invalid port range {min}-{max}")]
    InvalidPortRange { min: u16, max: u16 },

    #[error("Missing required setting '{0}'")]
    MissingSetting(&'static str),
}

/// Job-level failure. The `Display` text is the message recorded on the SJob and its RawJob.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransferError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("provisioning failed at {stage} (code {code}): {message}")]
    Provisioning { stage: Stage, code: i64, message: String },

    #[error("transfer failed (mdtm code {code}): {message}")]
    Transfer { code: i64, message: String },

    #[error("flow {task} made no progress for {idle_secs}s")]
    Stalled { task: TaskId, idle_secs: i64 },

    #[error("checksum verification failed: {0}")]
    Verification(String),

    #[error("remote call failed: {0}")]
    Remote(String),

    #[error("job cancelled by user")]
    Cancelled,
}

impl TransferError {
    pub fn provisioning(stage: Stage, code: i64, message: impl Into<String>) -> Self {
        TransferError::Provisioning { stage, code, message: message.into() }
    }

    /// Stage whose marker is flipped to `error` when this failure is recorded.
    pub fn failed_stage(&self) -> Option<Stage> {
        match self {
            TransferError::Provisioning { stage, .. } => Some(*stage),
            TransferError::Transfer { .. } | TransferError::Stalled { .. } => Some(Stage::TransferTransfer),
            TransferError::Verification(_) => Some(Stage::ChecksumVerification),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("record {collection}/{id} not found")]
    NotFound { collection: &'static str, id: String },

    #[error("record {collection}/{id} already exists")]
    Duplicate { collection: &'static str, id: String },
}

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("portal request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("portal at {url} answered with a non-JSON body: {body}")]
    InvalidBody { url: String, body: String },
}
