// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::{NO_HEADING_TARGET, StderrStyles};
use camino::Utf8PathBuf;
use owo_colors::OwoColorize;
use scenario_relay_metadata::RelayExitCode;
use scenario_relay_runner::errors::{
    ConfigParseError, EventStreamError, RelayError, UnauthorizedError,
};
use std::error::Error;
use thiserror::Error;
use tracing::error;

// The #[error()] strings are placeholders: errors are meant to be printed
// with display_to_stderr, which colorizes them and prints the source chain.

/// An error that stopped the relay before it could produce a verdict.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("current directory is invalid")]
    CurrentDir {
        #[source]
        error: std::io::Error,
    },
    #[error("current directory is not valid UTF-8")]
    CurrentDirNotUtf8 { path: std::path::PathBuf },
    #[error("config parse error")]
    ConfigParse {
        #[from]
        error: ConfigParseError,
    },
    #[error("failed to open event stream")]
    OpenEvents {
        path: Utf8PathBuf,
        #[source]
        error: std::io::Error,
    },
    #[error("failed to start async runtime")]
    RuntimeBuild {
        #[source]
        error: std::io::Error,
    },
    #[error("event stream error")]
    EventStream {
        #[from]
        error: EventStreamError,
    },
    #[error("event reader did not complete")]
    EventReaderJoin {
        #[source]
        error: tokio::task::JoinError,
    },
    #[error("relay error")]
    Relay {
        #[from]
        error: RelayError,
    },
}

impl ExpectedError {
    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::CurrentDir { .. }
            | Self::CurrentDirNotUtf8 { .. }
            | Self::ConfigParse { .. }
            | Self::OpenEvents { .. }
            | Self::RuntimeBuild { .. }
            | Self::EventStream { .. }
            | Self::EventReaderJoin { .. } => RelayExitCode::SETUP_ERROR,
            Self::Relay { error } => match error {
                RelayError::Aggregate { .. } => RelayExitCode::PROTOCOL_VIOLATION,
                RelayError::Unauthorized(_) => RelayExitCode::UNAUTHORIZED,
                RelayError::CreateRun { .. } => RelayExitCode::RUN_FAILED,
            },
        }
    }

    /// Displays this error to stderr.
    pub fn display_to_stderr(&self, styles: &StderrStyles) {
        let mut next_error: Option<&dyn Error> = match self {
            Self::CurrentDir { error } => {
                error!("could not determine the current directory");
                Some(error)
            }
            Self::CurrentDirNotUtf8 { path } => {
                error!(
                    "current directory `{}` is not valid UTF-8",
                    path.display().style(styles.bold)
                );
                None
            }
            Self::ConfigParse { error } => {
                error!(
                    "failed to parse config at `{}`",
                    error.config_file().style(styles.bold)
                );
                error.source()
            }
            Self::OpenEvents { path, error } => {
                error!("failed to open event stream `{}`", path.style(styles.bold));
                Some(error)
            }
            Self::RuntimeBuild { error } => {
                error!("failed to start the async runtime");
                Some(error)
            }
            Self::EventStream { error } => {
                error!("{error}");
                error.source()
            }
            Self::EventReaderJoin { error } => {
                error!("event reader did not complete");
                Some(error)
            }
            Self::Relay { error } => match error {
                RelayError::Aggregate { event, error } => {
                    error!(
                        "event stream violated its contract at `{}`",
                        event.style(styles.bold)
                    );
                    Some(error)
                }
                RelayError::Unauthorized(UnauthorizedError { endpoint }) => {
                    error!(
                        "{}: the plan has ended or the token is invalid (refused at `{endpoint}`)",
                        "collector refused the relay".style(styles.failed)
                    );
                    None
                }
                RelayError::CreateRun { error } => {
                    error!("failed to create a run on the collector");
                    Some(error)
                }
            },
        };

        while let Some(err) = next_error {
            error!(target: NO_HEADING_TARGET, "  caused by: {err}");
            next_error = err.source();
        }
    }
}
