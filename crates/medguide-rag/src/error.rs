use std::fmt;
use thiserror::Error;

/// External collaborators the pipeline calls through guarded boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Completion,
    Embedding,
    VectorIndex,
    LexicalIndex,
    Classifier,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Completion => "completion",
            Service::Embedding => "embedding",
            Service::VectorIndex => "vector_index",
            Service::LexicalIndex => "lexical_index",
            Service::Classifier => "classifier",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified failure a collaborator reports inside its `anyhow::Error`.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl ServiceError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ServiceError::Timeout(_) | ServiceError::RateLimited(_) | ServiceError::Unavailable(_)
        )
    }

    /// Map a non-success HTTP status onto a retry classification.
    pub fn from_http_status(status: reqwest::StatusCode, body: &str) -> Self {
        let preview: String = body.chars().take(200).collect();
        let message = format!("HTTP {}: {}", status, preview);
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            ServiceError::RateLimited(message)
        } else if status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::GATEWAY_TIMEOUT
        {
            ServiceError::Timeout(message)
        } else if status.is_server_error() {
            ServiceError::Unavailable(message)
        } else {
            ServiceError::Rejected(message)
        }
    }
}

/// Whether a collaborator error may succeed on retry. Unclassified errors are retried.
pub fn is_transient(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<ServiceError>() {
        Some(classified) => classified.is_transient(),
        None => true,
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{service} failed after {attempts} attempt(s): {message}")]
    Collaborator {
        service: Service,
        attempts: u32,
        message: String,
    },
    #[error("{service} timed out after {attempts} attempt(s)")]
    Timeout { service: Service, attempts: u32 },
    #[error("request cancelled")]
    Cancelled,
    #[error("invalid document: {0}")]
    InvalidDocument(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    /// The collaborator that caused the failure, if any.
    pub fn service(&self) -> Option<Service> {
        match self {
            PipelineError::Collaborator { service, .. } | PipelineError::Timeout { service, .. } => {
                Some(*service)
            }
            _ => None,
        }
    }
}
