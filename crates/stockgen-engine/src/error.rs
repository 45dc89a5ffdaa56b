//! Error taxonomy for one orchestration run.
//!
//! [`ProviderError`] and [`NormalizationError`] are recoverable: the
//! orchestrator turns them into attempt records and moves on. The rest
//! surface to the caller through [`PipelineError`].

use std::time::Duration;

use stockgen_contracts::generation::ErrorClass;

/// Classified failure of one provider call.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider}: authentication failed: {message}")]
    Auth {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    #[error("{provider}: quota exceeded: {message}")]
    Quota {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    #[error("{provider}: server error ({status}): {message}")]
    Server {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("{provider}: request timed out after {after:?}")]
    Timeout { provider: String, after: Duration },

    #[error("{provider}: {message}")]
    Unknown {
        provider: String,
        status: Option<u16>,
        message: String,
    },
}

impl ProviderError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Auth { .. } => ErrorClass::Auth,
            Self::Quota { .. } => ErrorClass::Quota,
            Self::Server { .. } => ErrorClass::Server,
            Self::Timeout { .. } => ErrorClass::Timeout,
            Self::Unknown { .. } => ErrorClass::Unknown,
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Auth { status, .. } | Self::Quota { status, .. } | Self::Unknown { status, .. } => {
                *status
            }
            Self::Server { status, .. } => Some(*status),
            Self::Timeout { .. } => None,
        }
    }

    pub fn provider(&self) -> &str {
        match self {
            Self::Auth { provider, .. }
            | Self::Quota { provider, .. }
            | Self::Server { provider, .. }
            | Self::Timeout { provider, .. }
            | Self::Unknown { provider, .. } => provider,
        }
    }
}

/// Failure turning a provider reply into image bytes.
#[derive(Debug, thiserror::Error)]
pub enum NormalizationError {
    #[error("invalid image encoding: {0}")]
    InvalidEncoding(String),

    #[error("image download failed ({url}): {message}")]
    Download {
        url: String,
        status: Option<u16>,
        message: String,
    },
}

impl NormalizationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidEncoding(_) => ErrorClass::InvalidEncoding,
            Self::Download { .. } => ErrorClass::Download,
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::InvalidEncoding(_) => None,
            Self::Download { status, .. } => *status,
        }
    }
}

/// Both placeholder render paths failed. Nothing is left to try.
#[derive(Debug, thiserror::Error)]
#[error("placeholder rendering failed: {primary}; flat fallback failed: {fallback}")]
pub struct PlaceholderError {
    pub primary: String,
    pub fallback: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PostProcessError {
    #[error("source image too large: {actual} bytes exceeds limit of {limit} bytes")]
    Oversize { actual: u64, limit: u64 },

    #[error("image encoding failed: {0}")]
    Encoding(String),

    #[error("failed writing asset: {0}")]
    Io(#[from] std::io::Error),
}

/// What a caller of the orchestrator can receive instead of an outcome.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Placeholder(#[from] PlaceholderError),

    #[error(transparent)]
    PostProcess(#[from] PostProcessError),

    #[error("generation cancelled after {attempts} provider attempt(s)")]
    Cancelled { attempts: usize },
}
