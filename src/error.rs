//! Error types for the mock server.
//!
//! Configuration problems are reported before anything listens. Template
//! render failures never surface here: they are logged and the response is
//! sent best-effort. Sequence and unmatched-rule violations are not errors
//! in the usual sense, see [`Violation`].

use std::path::PathBuf;
use thiserror::Error;

/// Errors found while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("a rules config file is required")]
    MissingConfigPath,

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse rules config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("rule {rule}: path is required")]
    MissingPath { rule: usize },

    #[error("rule {rule}: invalid route pattern {pattern:?}: {reason}")]
    Pattern {
        rule: usize,
        pattern: String,
        reason: String,
    },

    #[error("rule {rule}: invalid regex {pattern:?}: {source}")]
    Regex {
        rule: usize,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid template {location}: {source}")]
    Template {
        location: String,
        #[source]
        source: Box<handlebars::TemplateError>,
    },

    #[error("rule {rule}, response {response}: invalid status code {status}")]
    StatusCode {
        rule: usize,
        response: usize,
        status: u16,
    },

    #[error("rule {rule}, response {response}: invalid header name {name:?}")]
    HeaderName {
        rule: usize,
        response: usize,
        name: String,
    },

    #[error("a listen address is required")]
    MissingAddress,

    #[error("both TLS certificate and key files must be defined")]
    TlsPairing,

    #[error("{name} must be within [0, 1], got {value}")]
    Participation { name: &'static str, value: f32 },

    #[error("invalid fault error code {0}")]
    FaultErrorCode(u16),
}

/// Errors returned by the server lifecycle.
#[derive(Debug, Error)]
pub enum MockServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to listen on address {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load TLS certificate/key: {0}")]
    Tls(#[source] std::io::Error),

    #[error("cannot {action} a server that is {state}")]
    InvalidState {
        action: &'static str,
        state: &'static str,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A broken test assumption.
///
/// The dispatcher hands these back as the error arm of its result and the
/// server escalates them according to its [`FatalPolicy`](crate::config::FatalPolicy):
/// the run must stop loudly, never degrade into an HTTP error status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error(
        "expecting to match request #{expected} in sequence, matched rule #{rule} (request #{actual}) instead"
    )]
    OutOfSequence {
        rule: usize,
        expected: usize,
        actual: usize,
    },

    #[error("request did not match any rule: {method} {uri}")]
    UnmatchedRule { method: String, uri: String },
}

pub type Result<T, E = MockServerError> = std::result::Result<T, E>;
