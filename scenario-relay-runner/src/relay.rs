// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The top-level loop tying aggregation, delivery and recovery together.

use crate::{
    aggregator::{AggregatorOptions, AggregatorOutput, EventAggregator},
    config::RelayConfig,
    delivery::{CollectorTransport, DeliveryPipeline},
    errors::{DeliveryError, EventStreamError, RelayError, UnauthorizedError},
    recovery::{RecoveryOrchestrator, RepairCollaborator, RerunCollaborator, RunVerdict},
    run_context::RunContext,
};
use scenario_relay_metadata::{
    collector::RunHandle,
    events::RunEvent,
    report::{Report, RootCause, TestCaseRecord},
};
use std::{io::BufRead, sync::Arc};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info};

/// Consumes an event stream and drives a single run to its verdict.
#[derive(Debug)]
pub struct Relay<C> {
    aggregator: EventAggregator,
    pipeline: Arc<DeliveryPipeline>,
    context: Arc<RunContext>,
    orchestrator: RecoveryOrchestrator<C>,
    run_name: Option<String>,
    local_only: bool,
}

enum InternalEvent {
    Stream(RunEvent),
    StreamClosed,
    RootCause(String, RootCause),
    Unauthorized(UnauthorizedError),
}

impl<C> Relay<C>
where
    C: RepairCollaborator + RerunCollaborator,
{
    /// Creates a relay for a new run.
    pub fn new(
        config: &RelayConfig,
        transport: Arc<dyn CollectorTransport>,
        collaborator: C,
    ) -> Self {
        let pipeline = Arc::new(DeliveryPipeline::new(
            transport,
            config.collector.clone(),
            config.delivery.clone(),
        ));
        let preset_run = match (&config.collector.run_id, &config.collector.project_id) {
            (Some(id), Some(project_id)) => Some(RunHandle {
                id: id.clone(),
                project_id: project_id.clone(),
            }),
            _ => None,
        };
        let context = Arc::new(RunContext::new(
            preset_run,
            config.recovery.attempted_steps.iter().copied(),
        ));
        let orchestrator = RecoveryOrchestrator::new(
            collaborator,
            Arc::clone(&pipeline),
            Arc::clone(&context),
            config.recovery.enabled,
        );
        let aggregator = EventAggregator::new(AggregatorOptions {
            local_dir: config.report.local_dir.clone(),
            test_data_file: Some(config.report.test_data_file.clone()),
        });

        Self {
            aggregator,
            pipeline,
            context,
            orchestrator,
            run_name: config.report.run_name.clone(),
            local_only: config.report.local_dir.is_some(),
        }
    }

    /// Returns the report built so far.
    pub fn report(&self) -> &Report {
        self.aggregator.report()
    }

    /// Returns the shared run context.
    pub fn context(&self) -> &Arc<RunContext> {
        &self.context
    }

    /// Runs until the stream reports the end of the run (or closes), then
    /// waits for deliveries, runs recovery and returns the final verdict.
    ///
    /// Protocol violations and authorization failures stop the run immediately.
    pub async fn run(
        &mut self,
        mut events: mpsc::Receiver<RunEvent>,
    ) -> Result<RunVerdict, RelayError> {
        let (unauthorized_tx, mut unauthorized_rx) = mpsc::unbounded_channel();
        let (root_cause_tx, mut root_cause_rx) = mpsc::unbounded_channel();

        let run_succeeded = loop {
            let internal_event = tokio::select! {
                biased;
                Some(error) = unauthorized_rx.recv() => InternalEvent::Unauthorized(error),
                Some((id, root_cause)) = root_cause_rx.recv() => InternalEvent::RootCause(id, root_cause),
                event = events.recv() => match event {
                    Some(event) => InternalEvent::Stream(event),
                    None => InternalEvent::StreamClosed,
                },
            };

            let event = match internal_event {
                InternalEvent::Stream(event) => event,
                InternalEvent::StreamClosed => {
                    info!("event stream closed before the run finished");
                    break false;
                }
                InternalEvent::RootCause(id, root_cause) => {
                    self.orchestrator.record_root_cause(&id, root_cause);
                    continue;
                }
                InternalEvent::Unauthorized(error) => return Err(error.into()),
            };

            let tag = event.tag();
            let output = self
                .aggregator
                .handle(event)
                .map_err(|error| RelayError::Aggregate { event: tag, error })?;
            match output {
                AggregatorOutput::None => {}
                AggregatorOutput::RunStarted => self.send_status().await,
                AggregatorOutput::RunFinished { success } => {
                    self.send_status().await;
                    break success;
                }
                AggregatorOutput::Deliver(record) => {
                    let run = self.ensure_run().await?;
                    self.spawn_delivery(*record, run, &unauthorized_tx, &root_cause_tx);
                }
                AggregatorOutput::PersistedLocally(path) => {
                    info!("wrote test case report to {path}");
                }
            }
        };

        // Drain deliveries, still honoring authorization failures.
        drop((unauthorized_tx, root_cause_tx));
        tokio::select! {
            biased;
            Some(error) = unauthorized_rx.recv() => return Err(error.into()),
            () = self.context.wait_for_deliveries() => {}
        }
        if let Ok(error) = unauthorized_rx.try_recv() {
            return Err(error.into());
        }
        while let Ok((id, root_cause)) = root_cause_rx.try_recv() {
            self.orchestrator.record_root_cause(&id, root_cause);
        }

        let verdict = self
            .orchestrator
            .finish(self.aggregator.report_mut(), run_succeeded)
            .await;
        if let Some(run) = self.context.run() {
            self.pipeline.upload_complete(run).await;
        }

        self.context.mark_finished();
        self.context.wait_for_completion().await;
        info!("run finished: {verdict}");
        Ok(verdict)
    }

    /// Returns the remote run, creating it on first use.
    async fn ensure_run(&self) -> Result<RunHandle, RelayError> {
        let name = self
            .run_name
            .as_deref()
            .or_else(|| self.aggregator.run_name());
        let env = &self.aggregator.report().env;
        let run = self
            .context
            .get_or_create_run(|| self.pipeline.create_run(name, env))
            .await
            .map_err(|error| match error {
                DeliveryError::Unauthorized(error) => RelayError::Unauthorized(error),
                error => RelayError::CreateRun { error },
            })?;
        Ok(run.clone())
    }

    fn spawn_delivery(
        &self,
        record: TestCaseRecord,
        run: RunHandle,
        unauthorized_tx: &mpsc::UnboundedSender<UnauthorizedError>,
        root_cause_tx: &mpsc::UnboundedSender<(String, RootCause)>,
    ) {
        let guard = self.context.begin_delivery(record.id.clone());
        let pipeline = Arc::clone(&self.pipeline);
        let artifact_root = self.aggregator.artifact_root().map(ToOwned::to_owned);
        let unauthorized_tx = unauthorized_tx.clone();
        let root_cause_tx = root_cause_tx.clone();

        tokio::spawn(async move {
            let _guard = guard;
            match pipeline
                .upload_test_case(&record, &run, artifact_root.as_deref(), None)
                .await
            {
                Ok(Some(response)) => {
                    if let Some(root_cause) = response.root_cause {
                        // The receiver only goes away once the run is over.
                        let _ = root_cause_tx.send((record.id, root_cause));
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    let _ = unauthorized_tx.send(error);
                }
            }
        });
    }

    async fn send_status(&self) {
        if self.local_only {
            return;
        }
        let status = self.aggregator.report().result.status;
        self.pipeline.create_status(status.as_str()).await;
    }
}

/// Parses newline-delimited event envelopes.
///
/// Blank lines and envelopes of kinds the relay doesn't use are skipped.
pub fn read_events<R: BufRead>(
    reader: R,
) -> impl Iterator<Item = Result<RunEvent, EventStreamError>> {
    reader
        .lines()
        .enumerate()
        .filter_map(|(index, line)| {
            let line = match line {
                Ok(line) => line,
                Err(error) => return Some(Err(EventStreamError::Read { error })),
            };
            if line.trim().is_empty() {
                return None;
            }
            match RunEvent::from_json_line(&line) {
                Ok(Some(event)) => Some(Ok(event)),
                Ok(None) => {
                    debug!(line_number = index + 1, "skipping unused envelope");
                    None
                }
                Err(error) => Some(Err(EventStreamError::Parse {
                    line_number: index + 1,
                    error,
                })),
            }
        })
}

/// Reads events from `reader` on a blocking task and sends them over a
/// channel of the given capacity.
///
/// The task stops at the first error, or when the receiver is dropped.
pub fn spawn_event_reader<R>(
    reader: R,
    capacity: usize,
) -> (
    mpsc::Receiver<RunEvent>,
    JoinHandle<Result<(), EventStreamError>>,
)
where
    R: BufRead + Send + 'static,
{
    let (sender, receiver) = mpsc::channel(capacity);
    let handle = tokio::task::spawn_blocking(move || {
        for event in read_events(reader) {
            if sender.blocking_send(event?).is_err() {
                debug!("event receiver dropped, stopping reader");
                break;
            }
        }
        Ok(())
    });
    (receiver, handle)
}
