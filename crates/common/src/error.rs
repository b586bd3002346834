use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport unavailable: not connected")]
    TransportUnavailable,

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Report rejected by platform (code {code}): {detail}")]
    ReportRejected { code: u16, detail: String },

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    #[error("Upgrade cycle already in progress for module {0}")]
    CycleInProgress(String),

    #[error("Invalid cycle transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Build a `ReportRejected` from a platform code and optional detail
    pub fn rejected(code: u16, detail: Option<&str>) -> Self {
        Error::ReportRejected {
            code,
            detail: detail.unwrap_or("no error detail").to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
