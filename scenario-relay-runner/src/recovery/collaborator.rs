// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{config::ATTEMPTED_STEPS_ENV, errors::CollaboratorError};
use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::NamedUtf8TempFile;
use itertools::Itertools;
use scenario_relay_metadata::{collector::RunHandle, report::RetrainStats};
use std::future::Future;
use tokio::process::Command;
use tracing::debug;

/// The scenario a collaborator works on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ScenarioTarget<'a> {
    /// The feature file, relative to the working directory.
    pub uri: &'a str,
    /// The scenario name.
    pub scenario: &'a str,
}

/// Attempts to repair a failing step.
pub trait RepairCollaborator: Send + Sync {
    /// Repairs step `step_index` of `target`, returning the repaired outcome.
    fn repair(
        &self,
        target: ScenarioTarget<'_>,
        step_index: usize,
    ) -> impl Future<Output = Result<RetrainStats, CollaboratorError>> + Send;
}

/// Re-runs a single scenario after a repair.
pub trait RerunCollaborator: Send + Sync {
    /// Re-runs `target`. `attempted` lists every step index already sent for
    /// repair, so the re-run doesn't repair them again; `run` is the remote run
    /// the re-run should report into.
    fn rerun(
        &self,
        target: ScenarioTarget<'_>,
        attempted: &[usize],
        run: Option<&RunHandle>,
    ) -> impl Future<Output = Result<(), CollaboratorError>> + Send;
}

/// Runs an external program for both repairs and re-runs.
///
/// The program is invoked as
/// `<program> <args>... <repair|rerun> <cwd> <cwd>/<uri> <scenario> <indices> [--env=<tag>]`.
/// Repairs also get `--temp-file=<path>`; on exit code 0 the file must hold
/// [`RetrainStats`] as JSON.
#[derive(Clone, Debug)]
pub struct ProcessCollaborator {
    program: String,
    args: Vec<String>,
    working_dir: Utf8PathBuf,
    env_tag: Option<String>,
}

impl ProcessCollaborator {
    /// Creates a new collaborator.
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        working_dir: impl Into<Utf8PathBuf>,
        env_tag: Option<String>,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: working_dir.into(),
            env_tag,
        }
    }

    fn command(&self, mode: &str, target: ScenarioTarget<'_>, indices: &[usize]) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(mode)
            .arg(self.working_dir.as_str())
            .arg(self.working_dir.join(target.uri).as_str())
            .arg(target.scenario)
            .arg(join_indices(indices))
            .current_dir(&self.working_dir)
            .kill_on_drop(true);
        if let Some(tag) = &self.env_tag {
            command.arg(format!("--env={tag}"));
        }
        command
    }

    async fn run_to_completion(&self, mut command: Command) -> Result<(), CollaboratorError> {
        debug!("running {command:?}");
        let status = command
            .status()
            .await
            .map_err(|error| CollaboratorError::Spawn {
                program: self.program.clone(),
                error,
            })?;
        if !status.success() {
            return Err(CollaboratorError::Failed {
                program: self.program.clone(),
                exit_code: status.code(),
            });
        }
        Ok(())
    }
}

impl RepairCollaborator for ProcessCollaborator {
    async fn repair(
        &self,
        target: ScenarioTarget<'_>,
        step_index: usize,
    ) -> Result<RetrainStats, CollaboratorError> {
        let payload =
            NamedUtf8TempFile::new().map_err(|error| CollaboratorError::TempFile { error })?;
        let mut command = self.command("repair", target, &[step_index]);
        command.arg(format!("--temp-file={}", payload.path()));

        self.run_to_completion(command).await?;
        read_payload(payload.path()).await
    }
}

impl RerunCollaborator for ProcessCollaborator {
    async fn rerun(
        &self,
        target: ScenarioTarget<'_>,
        attempted: &[usize],
        run: Option<&RunHandle>,
    ) -> Result<(), CollaboratorError> {
        let mut command = self.command("rerun", target, attempted);
        command.env(ATTEMPTED_STEPS_ENV, join_indices(attempted));
        if let Some(run) = run {
            command
                .env("SCENARIO_RELAY_RUN_ID", &run.id)
                .env("SCENARIO_RELAY_PROJECT_ID", &run.project_id);
        }
        self.run_to_completion(command).await
    }
}

fn join_indices(indices: &[usize]) -> String {
    indices.iter().join(",")
}

async fn read_payload(path: &Utf8Path) -> Result<RetrainStats, CollaboratorError> {
    let contents =
        tokio::fs::read_to_string(path)
            .await
            .map_err(|error| CollaboratorError::ReadPayload {
                path: path.to_owned(),
                error,
            })?;
    serde_json::from_str(&contents).map_err(|error| CollaboratorError::ParsePayload {
        path: path.to_owned(),
        error,
    })
}
