//! Error types.

use crate::check::AssertionFailure;
use crate::query::transport::Mode;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use trust_dns_proto::error::ProtoError;

/// Error enumerates the possible harness failure states.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Returned when no correlated reply arrived from `server` within the attempt budget
    /// of a [`send`][crate::query::transport::send] call.
    #[error("no {mode} reply from {server} after {attempts} attempt(s)")]
    TransportTimeout {
        server: SocketAddr,
        mode: Mode,
        attempts: u32,
    },

    /// Returned when a reply was received but could not be used: it failed to parse, was
    /// truncated mid-frame, or carried the wrong transaction id on a stream connection.
    /// Never retried.
    #[error("malformed reply from {server}: {reason}")]
    MalformedResponse { server: SocketAddr, reason: String },

    /// Returned when a [response predicate][crate::check] does not hold.
    #[error(transparent)]
    Assertion(#[from] AssertionFailure),

    /// Returned when a server rejected a reconfiguration, either through a failing control
    /// command or through a failure line in its log.
    #[error("reconfiguring {server} failed: {reason}")]
    ReconfigureFailed { server: String, reason: String },

    /// Returned when a verified reconfiguration neither succeeded nor failed in the log
    /// before the reload policy timeout. Kept apart from [`Error::ReconfigureFailed`] so a
    /// slow server is not mistaken for a broken configuration.
    #[error("reconfiguration of {server} could not be confirmed from its log")]
    ReconfigureUnverified {
        server: String,
        #[source]
        source: Box<Error>,
    },

    /// Returned when none of the awaited patterns appeared in a log file in time.
    #[error("timed out after {timeout:?} waiting for {patterns:?} in {path}")]
    LogTimeout {
        path: PathBuf,
        patterns: Vec<String>,
        timeout: Duration,
    },

    /// Returned by [`ServerHandle::prohibit`][crate::server::ServerHandle::prohibit] when
    /// the log already contains a line matching a prohibited pattern.
    #[error("prohibited line found in {path}: {line:?}")]
    ProhibitedLine { path: PathBuf, line: String },

    /// Returned when a control channel command exits unsuccessfully or does not finish in
    /// time.
    #[error("control command {command:?} failed: {output}")]
    ControlFailed { command: String, output: String },

    /// Returned when a scenario refers to a server name missing from the server set.
    #[error("unknown server \"{0}\"")]
    UnknownServer(String),

    /// Returned when a [`Config`][crate::config::Config] fails validation.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Returned when a scenario step refers to state that no previous step produced.
    #[error("scenario \"{scenario}\" failed at step {step}: {reason}")]
    ScenarioFailed {
        scenario: String,
        step: usize,
        reason: String,
    },

    /// Returned when a name or record type can't be parsed, or when a message can't be
    /// encoded.
    #[error("DNS error")]
    DNSError(#[from] ProtoError),

    /// Returned when a configuration template can't be rendered.
    #[error("template error")]
    Template(#[from] minijinja::Error),

    /// Returned when a log pattern is not a valid regular expression, or matching it fails.
    #[error("invalid log pattern")]
    Pattern(#[from] fancy_regex::Error),

    /// Returned when a generic IO error occurs.
    #[error("an IO error occurred")]
    IO(#[from] std::io::Error),

    /// Returned when a config or scenario file contains invalid JSON.
    #[error("invalid JSON")]
    InvalidJSON(#[from] serde_json::Error),
}

