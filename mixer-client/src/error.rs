use axum::response::IntoResponse;
use axum::Json as AxumJson;
use thiserror::Error;

/// Why a relay refused or never saw a submission. Both are terminal for the attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelaySubmissionError {
    #[error("relay unreachable: {0}")]
    Unreachable(String),
    #[error("relay rejected call [{code}]: {message}")]
    Rejected { code: i64, message: String },
}

#[derive(Debug, Error)]
pub enum MixerError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    RelaySubmission(#[from] RelaySubmissionError),
    #[error("chain query failed: {0}")]
    ChainQuery(String),
    #[error("proof generation failed: {0}")]
    ProofGeneration(String),
    #[error("unexpected data: {0}")]
    UnexpectedData(String),
    #[error("no matching event found")]
    NotFound,
    #[error("watch cancelled")]
    Cancelled,
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("unknown commitment: {0}")]
    UnknownCommitment(String),
    #[error("store error: {0}")]
    Store(String),
}

impl MixerError {
    /// Errors a polling loop should swallow and retry on its next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, MixerError::ChainQuery(_) | MixerError::UnexpectedData(_))
    }
}

pub type MixerResult<T> = Result<T, MixerError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Bad Request: {0}")]
    BadRequest(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Not Found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Internal Error: {0}")]
    Internal(String),
    #[error("Bad Gateway: {0}")]
    BadGateway(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, msg) = match self {
            AppError::BadRequest(m) => (axum::http::StatusCode::BAD_REQUEST, m),
            AppError::Forbidden(m) => (axum::http::StatusCode::FORBIDDEN, m),
            AppError::NotFound(m) => (axum::http::StatusCode::NOT_FOUND, m),
            AppError::Conflict(m) => (axum::http::StatusCode::CONFLICT, m),
            AppError::Internal(m) => (axum::http::StatusCode::INTERNAL_SERVER_ERROR, m),
            AppError::BadGateway(m) => (axum::http::StatusCode::BAD_GATEWAY, m),
        };
        let body = serde_json::json!({ "error": msg });
        (status, AxumJson(body)).into_response()
    }
}

impl From<MixerError> for AppError {
    fn from(e: MixerError) -> Self {
        match e {
            MixerError::UnknownCommitment(_) => AppError::NotFound(e.to_string()),
            MixerError::InvalidState(_) => AppError::Conflict(e.to_string()),
            MixerError::Configuration(_) => AppError::BadRequest(e.to_string()),
            MixerError::ChainQuery(_)
            | MixerError::UnexpectedData(_)
            | MixerError::RelaySubmission(_) => AppError::BadGateway(e.to_string()),
            _ => AppError::Internal(e.to_string()),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
