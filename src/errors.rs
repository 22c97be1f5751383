use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rules;

/// Classified failure of a driver invocation. Recovery strategies are
/// selected from this, never from raw error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SelectorParse,
    Timeout,
    ElementNotFound,
    NotInteractable,
    StaleElement,
    Network,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SelectorParse => "selector_parse_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ElementNotFound => "element_not_found",
            ErrorKind::NotInteractable => "not_interactable",
            ErrorKind::StaleElement => "stale_element",
            ErrorKind::Network => "network_error",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an automation-driver call that did not succeed. Expected
/// conditions like "not found" are ordinary values here.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DriverError {
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("element not found: {0}")]
    NotFound(String),
    #[error("invalid selector: {0}")]
    InvalidSelector(String),
    #[error("element not interactable: {0}")]
    NotInteractable(String),
    #[error("stale element: {0}")]
    Stale(String),
    #[error("network: {0}")]
    Network(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}

impl DriverError {
    /// Typed variants map directly; free-form messages go through the
    /// ordered message rules.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DriverError::Timeout(_) => ErrorKind::Timeout,
            DriverError::NotFound(_) => ErrorKind::ElementNotFound,
            DriverError::InvalidSelector(_) => ErrorKind::SelectorParse,
            DriverError::NotInteractable(_) => ErrorKind::NotInteractable,
            DriverError::Stale(_) => ErrorKind::StaleElement,
            DriverError::Network(_) => ErrorKind::Network,
            DriverError::InvalidInput(_) | DriverError::Unsupported(_) | DriverError::Cancelled => {
                ErrorKind::Unknown
            }
            DriverError::Other(msg) => rules::classify_error_message(msg),
        }
    }

    /// Builds a typed error from a message produced by the browser backend.
    pub fn from_message(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        match rules::classify_error_message(&msg) {
            ErrorKind::SelectorParse => DriverError::InvalidSelector(msg),
            ErrorKind::Timeout => DriverError::Timeout(msg),
            ErrorKind::ElementNotFound => DriverError::NotFound(msg),
            ErrorKind::NotInteractable => DriverError::NotInteractable(msg),
            ErrorKind::StaleElement => DriverError::Stale(msg),
            ErrorKind::Network => DriverError::Network(msg),
            ErrorKind::Unknown => DriverError::Other(msg),
        }
    }

    pub fn timed_out(what: &str, limit: Duration) -> Self {
        DriverError::Timeout(format!("{what} exceeded {}ms", limit.as_millis()))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DriverError::Cancelled)
    }
}

/// Failure talking to the decision service.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ServiceError {
    #[error("service returned {status}: {message}")]
    Http { status: u16, message: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("decode response: {0}")]
    Decode(String),
    #[error("empty response content")]
    Empty,
    #[error("configuration: {0}")]
    Config(String),
}

impl ServiceError {
    /// Rate limiting and server errors are transient; other 4xx responses
    /// mean the request itself is malformed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Http { status, .. } => *status == 429 || *status >= 500,
            ServiceError::Transport(_) => true,
            ServiceError::Decode(_) | ServiceError::Empty | ServiceError::Config(_) => false,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DecisionError {
    #[error("payload of {size} bytes exceeds cap of {cap} bytes")]
    PayloadTooLarge { size: usize, cap: usize },
    #[error("decision service failed after {attempts} attempt(s): {source}")]
    Service {
        attempts: u32,
        #[source]
        source: ServiceError,
    },
    #[error("decision rejected: {0}")]
    Rejected(String),
    #[error("cancelled")]
    Cancelled,
}

impl DecisionError {
    pub fn rejected(msg: impl Into<String>) -> Self {
        DecisionError::Rejected(msg.into())
    }
}

/// Fatal, task-ending errors returned from [`crate::orchestrator::Orchestrator::run`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AgentError {
    #[error("too many repeated actions: {action} (limit: {limit}). Try a different action")]
    RepeatedAction { action: String, limit: usize },
    #[error("step limit reached ({0})")]
    StepLimit(usize),
    #[error("decision: {0}")]
    Decision(#[from] DecisionError),
    #[error("confirmation request failed: {0}")]
    Confirmation(String),
    #[error("task cancelled")]
    Cancelled,
}
