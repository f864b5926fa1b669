//! Error taxonomy for providers, the corpus store and the orchestrators

use crate::types::StrategyKind;
use thiserror::Error;

/// Failures of an external AI service (embeddings, generator, judge, classifier)
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    /// Timeouts, transport errors, 5xx. Retried per policy.
    #[error("{service} transient failure: {message}")]
    Transient { service: String, message: String },

    /// Fast rejection while the breaker is open. Never retried.
    #[error("{service} circuit is open")]
    CircuitOpen { service: String },

    /// Malformed payload (wrong vector shape, unparsable verdict). Counts as a breaker failure.
    #[error("{service} returned an invalid response: {message}")]
    InvalidResponse { service: String, message: String },

    /// Non-retryable client error (4xx)
    #[error("{service} rejected the request ({status}): {message}")]
    Rejected {
        service: String,
        status: u16,
        message: String,
    },
}

impl ProviderError {
    pub fn transient(service: &str, message: impl Into<String>) -> Self {
        Self::Transient {
            service: service.to_string(),
            message: message.into(),
        }
    }

    pub fn invalid(service: &str, message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            service: service.to_string(),
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Map a reqwest failure onto the taxonomy
    pub fn from_reqwest(service: &str, err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            if status.is_client_error() {
                return Self::Rejected {
                    service: service.to_string(),
                    status: status.as_u16(),
                    message: err.to_string(),
                };
            }
        }
        if err.is_decode() {
            return Self::invalid(service, err.to_string());
        }
        Self::transient(service, err.to_string())
    }
}

/// Failures of the corpus store boundary
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("corpus store pool saturated after waiting {waited_ms}ms")]
    PoolSaturated { waited_ms: u64 },

    #[error("corpus store call timed out")]
    Timeout,

    #[error("corpus store error: {0}")]
    Backend(String),
}

/// Why a single strategy failed, as reported inside `TotalRetrievalFailure`
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyFailure {
    pub strategy: StrategyKind,
    pub reason: String,
}

/// Errors surfaced by the search orchestrator
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SearchError {
    /// Every selected strategy failed. Never reported as an empty success.
    #[error("search unavailable: all {} strategies failed", failures.len())]
    TotalRetrievalFailure { failures: Vec<StrategyFailure> },

    #[error("search cancelled")]
    Cancelled,

    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

/// Errors surfaced by the answer orchestrator
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AnswerError {
    #[error(transparent)]
    Search(#[from] SearchError),

    #[error("answer cancelled")]
    Cancelled,
}

/// Strategy-level error (caught by the orchestrator and turned into a degradation)
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StrategyError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}
