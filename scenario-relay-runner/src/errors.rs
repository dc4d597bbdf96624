// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by scenario-relay.

use camino::Utf8PathBuf;
use config::ConfigError;
use http::StatusCode;
use scenario_relay_metadata::report::Status;
use std::{error::Error, fmt};
use thiserror::Error;

pub use display_error_chain::DisplayErrorChain;

/// An error that occurred while parsing the config.
#[derive(Debug, Error)]
#[error("failed to parse scenario-relay config at `{config_file}`")]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    kind: ConfigParseErrorKind,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, kind: ConfigParseErrorKind) -> Self {
        Self {
            config_file: config_file.into(),
            kind,
        }
    }

    /// Returns the config file for this error.
    pub fn config_file(&self) -> &Utf8PathBuf {
        &self.config_file
    }

    /// Returns the kind of error this is.
    pub fn kind(&self) -> &ConfigParseErrorKind {
        &self.kind
    }
}

/// The kind of error that occurred while parsing the config.
#[derive(Debug, Error)]
pub enum ConfigParseErrorKind {
    /// An error occurred while building the config.
    #[error(transparent)]
    BuildError(Box<ConfigError>),

    /// An error occurred while deserializing the config.
    #[error(transparent)]
    DeserializeError(Box<serde_path_to_error::Error<ConfigError>>),

    /// An environment variable held a value that couldn't be interpreted.
    #[error("environment variable `{var}` has invalid value `{value}`: {reason}")]
    InvalidEnvValue {
        /// The environment variable.
        var: &'static str,
        /// The value it held.
        value: String,
        /// Why the value is invalid.
        reason: &'static str,
    },
}

/// The kind of entity a [`LookupError`] was looking for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LookupKind {
    /// A parsed feature document, by URI.
    Document,
    /// A scenario within a document, by AST node id.
    Scenario,
    /// A compiled pickle, by id.
    Pickle,
    /// A compiled test case, by id.
    TestCase,
    /// A test step, by id.
    TestStep,
    /// A started test case attempt, by id.
    TestCaseStarted,
    /// A step as written in a document, by AST node id.
    DocumentStep,
    /// The step record belonging to a pickle step, by pickle step id.
    PickleStep,
}

impl fmt::Display for LookupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Document => "document",
            Self::Scenario => "scenario",
            Self::Pickle => "pickle",
            Self::TestCase => "test case",
            Self::TestStep => "test step",
            Self::TestCaseStarted => "started test case",
            Self::DocumentStep => "document step",
            Self::PickleStep => "pickle step",
        };
        f.write_str(s)
    }
}

/// An identifier that should already have been indexed wasn't found.
///
/// This means the event stream broke its ordering contract.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind} with id `{id}` not found")]
pub struct LookupError {
    kind: LookupKind,
    id: String,
}

impl LookupError {
    pub(crate) fn new(kind: LookupKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// Returns the kind of entity that was missing.
    pub fn kind(&self) -> LookupKind {
        self.kind
    }

    /// Returns the missing identifier.
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// An error that occurred while aggregating an event. All of these are fatal.
#[derive(Debug, Error)]
pub enum AggregateError {
    /// A lookup failed: the event stream is out of order.
    #[error("event stream violated its ordering contract")]
    Lookup(#[from] LookupError),

    /// The run-level result would have moved backwards.
    #[error("run result cannot move from {from} to {to}")]
    InvalidRunTransition {
        /// The current status.
        from: Status,
        /// The requested status.
        to: Status,
    },

    /// A step finished without having started.
    #[error("test step `{test_step_id}` of `{test_case_started_id}` finished without starting")]
    StepNotStarted {
        /// The started test case.
        test_case_started_id: String,
        /// The test step.
        test_step_id: String,
    },

    /// Writing a test case to the local report directory failed.
    #[error("failed to write test case report to `{path}`")]
    LocalPersist {
        /// The file being written.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: atomicwrites::Error<std::io::Error>,
    },
}

/// An error reading the optional test data file. Never fatal.
#[derive(Debug, Error)]
pub enum TestDataError {
    /// The file couldn't be read.
    #[error("failed to read test data file `{path}`")]
    Read {
        /// The path to the file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// The file isn't valid JSON of a supported shape.
    #[error("failed to parse test data file `{path}`")]
    Parse {
        /// The path to the file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },
}

/// An error returned by a [`CollectorTransport`](crate::delivery::CollectorTransport).
#[derive(Debug, Error)]
pub enum TransportError {
    /// The collector responded with a non-success HTTP status.
    #[error("collector responded with {status}")]
    Status {
        /// The HTTP status.
        status: StatusCode,
        /// The response body, if any was read.
        body: Option<String>,
    },

    /// The request didn't complete.
    #[error("request failed")]
    Request {
        /// The underlying error.
        #[source]
        error: Box<dyn Error + Send + Sync>,
    },

    /// The response body wasn't valid JSON.
    #[error("response body wasn't valid JSON")]
    InvalidJson {
        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },
}

impl TransportError {
    /// Returns true if the collector rejected our credentials or plan.
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            Self::Status { status, .. }
                if *status == StatusCode::UNAUTHORIZED || *status == StatusCode::FORBIDDEN
        )
    }
}

/// An error talking to the collector.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The transport failed.
    #[error("collector call `{endpoint}` failed")]
    Transport {
        /// The endpoint that was called.
        endpoint: &'static str,
        /// The underlying error.
        #[source]
        error: TransportError,
    },

    /// The collector answered, but with `status: false`.
    #[error("collector call `{endpoint}` was rejected")]
    Rejected {
        /// The endpoint that was called.
        endpoint: &'static str,
    },

    /// The collector answered with a body we couldn't interpret.
    #[error("collector call `{endpoint}` returned an unexpected body")]
    UnexpectedBody {
        /// The endpoint that was called.
        endpoint: &'static str,
        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },

    /// An artifact couldn't be read from disk.
    #[error("failed to read artifact `{path}`")]
    ReadArtifact {
        /// The artifact path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// A blocking transport task panicked or was cancelled.
    #[error("transport task for `{endpoint}` did not complete")]
    TaskJoin {
        /// The endpoint that was called.
        endpoint: &'static str,
        /// The underlying error.
        #[source]
        error: tokio::task::JoinError,
    },

    /// The collector rejected our credentials or the plan has run out.
    #[error(transparent)]
    Unauthorized(#[from] UnauthorizedError),
}

impl DeliveryError {
    pub(crate) fn from_transport(endpoint: &'static str, error: TransportError) -> Self {
        if error.is_unauthorized() {
            Self::Unauthorized(UnauthorizedError { endpoint })
        } else {
            Self::Transport { endpoint, error }
        }
    }
}

/// The collector rejected our credentials, or the plan has run out.
///
/// This is fatal: the relay stops immediately when it sees this.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("collector refused `{endpoint}`: the plan has ended or the token is invalid")]
pub struct UnauthorizedError {
    /// The endpoint that was refused.
    pub endpoint: &'static str,
}

/// An error invoking a repair or re-run collaborator.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// The process couldn't be started.
    #[error("failed to spawn `{program}`")]
    Spawn {
        /// The program.
        program: String,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// A temporary file for the payload couldn't be created.
    #[error("failed to create payload file")]
    TempFile {
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// The process exited unsuccessfully.
    #[error("`{program}` exited with {}", exit_code.map_or_else(|| "a signal".to_owned(), |code| format!("code {code}")))]
    Failed {
        /// The program.
        program: String,
        /// The exit code, if the process wasn't killed by a signal.
        exit_code: Option<i32>,
    },

    /// The payload file couldn't be read.
    #[error("failed to read payload file `{path}`")]
    ReadPayload {
        /// The payload file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// The payload file wasn't valid.
    #[error("failed to parse payload file `{path}`")]
    ParsePayload {
        /// The payload file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },
}

/// An error that stopped the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Aggregation failed.
    #[error("failed to aggregate `{event}` event")]
    Aggregate {
        /// The tag of the event being handled.
        event: &'static str,
        /// The underlying error.
        #[source]
        error: AggregateError,
    },

    /// The collector refused us.
    #[error(transparent)]
    Unauthorized(#[from] UnauthorizedError),

    /// Creating the run on the collector failed.
    #[error("failed to create run on the collector")]
    CreateRun {
        /// The underlying error.
        #[source]
        error: DeliveryError,
    },
}

/// An error reading the event stream.
#[derive(Debug, Error)]
pub enum EventStreamError {
    /// Reading from the source failed.
    #[error("failed to read event stream")]
    Read {
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// A line wasn't a valid event envelope.
    #[error("invalid event on line {line_number}")]
    Parse {
        /// The 1-based line number.
        line_number: usize,
        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },
}
