// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    ExpectedError,
    output::{OutputContext, OutputOpts, StderrStyles, clap_styles},
};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};
use owo_colors::OwoColorize;
use scenario_relay_metadata::RelayExitCode;
use scenario_relay_runner::{
    config::{AuthToken, DefaultConfigWarnings, RelayConfig},
    delivery::UreqTransport,
    plural,
    recovery::{ProcessCollaborator, RunVerdict},
    relay::{Relay, spawn_event_reader},
};
use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    sync::Arc,
};
use tracing::info;

/// Number of parsed events buffered between the reader and the relay.
const EVENT_BUFFER: usize = 256;

/// Relays the execution events of a Gherkin test run to a remote report
/// collector.
#[derive(Debug, Parser)]
#[command(version, styles = clap_styles::style())]
pub struct ScenarioRelayApp {
    #[command(flatten)]
    output: OutputOpts,

    #[command(subcommand)]
    command: Command,
}

impl ScenarioRelayApp {
    /// Initializes logging and returns the output context.
    pub fn init_output(&self) -> OutputContext {
        self.output.init()
    }

    /// Executes the app, returning the process exit code.
    pub fn exec(self, output: OutputContext) -> Result<i32, ExpectedError> {
        match self.command {
            Command::Run(opts) => opts.exec(&output.stderr_styles()),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Read an event stream and relay it to the collector
    ///
    /// Events are newline-delimited JSON envelopes, as written by the test
    /// engine's message formatter. Exits with 0 if the run (after any
    /// recovery) passed, and 1 otherwise.
    Run(RunOpts),
}

#[derive(Debug, Args)]
struct RunOpts {
    /// Event stream to read, or `-` for standard input
    #[arg(long, value_name = "PATH", default_value = "-")]
    events: Utf8PathBuf,

    /// Config file [default: .config/scenario-relay.toml]
    #[arg(long, value_name = "PATH")]
    config: Option<Utf8PathBuf>,

    /// Name of the remote run [default: from the event stream, or TEST]
    #[arg(long, value_name = "NAME")]
    run_name: Option<String>,

    /// Write test cases as JSON files to this directory instead of uploading
    /// them
    #[arg(long, value_name = "DIR")]
    local_report_dir: Option<Utf8PathBuf>,

    /// Don't contact the collector
    #[arg(long)]
    no_upload: bool,

    /// Attempt to repair failures the collector diagnoses
    #[arg(long)]
    recover: bool,

    /// Collector token, overriding the config and `SCENARIO_RELAY_TOKEN`
    #[arg(long, value_name = "TOKEN")]
    token: Option<String>,
}

impl RunOpts {
    fn exec(self, styles: &StderrStyles) -> Result<i32, ExpectedError> {
        let cwd = current_dir()?;
        let mut config = RelayConfig::from_sources(
            &cwd,
            self.config.as_deref(),
            |var| std::env::var(var).ok(),
            &mut DefaultConfigWarnings,
        )?;
        self.apply_overrides(&mut config);

        let reader = open_events(&self.events)?;
        let transport = Arc::new(UreqTransport::new(config.delivery.request_timeout));
        let collaborator = ProcessCollaborator::new(
            config.recovery.program.clone(),
            config.recovery.args.clone(),
            cwd,
            config.recovery.env_tag.clone(),
        );

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|error| ExpectedError::RuntimeBuild { error })?;

        let result = runtime.block_on(async {
            let mut relay = Relay::new(&config, transport, collaborator);
            let (events, reader) = spawn_event_reader(reader, EVENT_BUFFER);
            let verdict = relay.run(events).await?;
            reader
                .await
                .map_err(|error| ExpectedError::EventReaderJoin { error })??;

            let count = relay.report().test_cases.len();
            info!("relayed {count} {}", plural::test_cases_str(count));
            Ok::<_, ExpectedError>(verdict)
        });
        // The reader may still be blocked on its input.
        runtime.shutdown_background();
        let verdict = result?;

        match verdict {
            RunVerdict::Passed => {
                info!("run {}", "PASSED".style(styles.passed));
                Ok(RelayExitCode::OK)
            }
            RunVerdict::Failed => {
                info!("run {}", "FAILED".style(styles.failed));
                Ok(RelayExitCode::RUN_FAILED)
            }
        }
    }

    fn apply_overrides(&self, config: &mut RelayConfig) {
        if let Some(run_name) = &self.run_name {
            config.report.run_name = Some(run_name.clone());
        }
        if let Some(dir) = &self.local_report_dir {
            config.report.local_dir = Some(dir.clone());
        }
        if let Some(token) = &self.token {
            config.collector.token = Some(AuthToken::new(token.clone()));
        }
        if self.no_upload {
            config.collector.upload_reports = false;
        }
        if self.recover {
            config.recovery.enabled = true;
        }
    }
}

fn current_dir() -> Result<Utf8PathBuf, ExpectedError> {
    let cwd = std::env::current_dir().map_err(|error| ExpectedError::CurrentDir { error })?;
    Utf8PathBuf::try_from(cwd)
        .map_err(|error| ExpectedError::CurrentDirNotUtf8 { path: error.into_path_buf() })
}

fn open_events(path: &Utf8Path) -> Result<Box<dyn BufRead + Send>, ExpectedError> {
    if path == "-" {
        return Ok(Box::new(BufReader::new(io::stdin())));
    }
    let file = File::open(path).map_err(|error| ExpectedError::OpenEvents {
        path: path.to_owned(),
        error,
    })?;
    Ok(Box::new(BufReader::new(file)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> ScenarioRelayApp {
        ScenarioRelayApp::try_parse_from(std::iter::once("scenario-relay").chain(args.iter().copied()))
            .expect("arguments parse")
    }

    #[test]
    fn run_defaults_to_stdin() {
        let app = parse(&["run"]);
        let Command::Run(opts) = app.command;
        assert_eq!(opts.events, "-");
        assert!(!opts.no_upload);
        assert!(!opts.recover);
    }

    #[test]
    fn cli_flags_override_config() {
        let app = parse(&[
            "run",
            "--events",
            "events.ndjson",
            "--run-name",
            "nightly",
            "--local-report-dir",
            "out",
            "--no-upload",
            "--recover",
            "--token",
            "t0ken",
        ]);
        let Command::Run(opts) = app.command;
        let mut config = RelayConfig::default_config();
        opts.apply_overrides(&mut config);

        assert_eq!(config.report.run_name.as_deref(), Some("nightly"));
        assert_eq!(config.report.local_dir.as_deref(), Some(Utf8Path::new("out")));
        assert_eq!(
            config.collector.token.as_ref().map(AuthToken::expose),
            Some("t0ken")
        );
        assert!(!config.collector.upload_reports);
        assert!(config.recovery.enabled);
    }

    #[test]
    fn missing_event_file_is_a_setup_error() {
        let dir = camino_tempfile::tempdir().unwrap();
        let error = open_events(&dir.path().join("missing.ndjson"))
            .err()
            .expect("file doesn't exist");
        assert!(matches!(error, ExpectedError::OpenEvents { .. }));
        assert_eq!(error.process_exit_code(), RelayExitCode::SETUP_ERROR);
    }
}
