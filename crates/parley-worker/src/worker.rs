//! Worker message loop.
//!
//! Init and inference requests are queued and run one at a time on a
//! spawned task. Dispose and configure are handled as soon as they arrive,
//! so they can release an engine out from under a running inference.
//! Terminate aborts whatever is running, disposes everything, and ends
//! the loop.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info};

use parley_core::error::{ParleyError, Result};
use parley_core::protocol::{HostMessage, InferencePayload, WorkerMessage};
use parley_core::types::ModelKind;
use parley_models::coordinator::PipelineContext;

use crate::orchestrator::{Orchestrator, PipelineOptions};

/// Command side of a running worker.
#[derive(Clone)]
pub struct WorkerSender {
    tx: mpsc::UnboundedSender<HostMessage>,
}

impl WorkerSender {
    pub fn send(&self, message: HostMessage) -> Result<()> {
        self.tx.send(message).map_err(|_| ParleyError::WorkerStopped)
    }
}

/// Host side of a running worker.
pub struct WorkerHandle {
    commands: WorkerSender,
    events: mpsc::UnboundedReceiver<WorkerMessage>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn send(&self, message: HostMessage) -> Result<()> {
        self.commands.send(message)
    }

    /// Next message from the worker; `None` once it has stopped and every
    /// message was read.
    pub async fn recv(&mut self) -> Option<WorkerMessage> {
        self.events.recv().await
    }

    /// Collect messages up to and including the first one matching `done`.
    pub async fn recv_until(
        &mut self,
        mut done: impl FnMut(&WorkerMessage) -> bool,
    ) -> Vec<WorkerMessage> {
        let mut messages = Vec::new();
        while let Some(message) = self.events.recv().await {
            let finished = done(&message);
            messages.push(message);
            if finished {
                break;
            }
        }
        messages
    }

    pub fn split(
        self,
    ) -> (
        WorkerSender,
        mpsc::UnboundedReceiver<WorkerMessage>,
        JoinHandle<()>,
    ) {
        (self.commands, self.events, self.task)
    }

    /// Close the command channel and wait for the loop to finish its teardown.
    pub async fn join(self) {
        let WorkerHandle { commands, task, .. } = self;
        drop(commands);
        if let Err(err) = task.await {
            error!(error = %err, "Worker loop did not exit cleanly");
        }
    }
}

/// Start a worker driving `ctx`. The caller may keep a clone of the
/// context for status snapshots; the worker is its only user otherwise.
pub fn spawn_worker(ctx: Arc<PipelineContext>, options: PipelineOptions) -> WorkerHandle {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let orchestrator = Orchestrator::new(ctx, Arc::new(options), event_tx.clone());

    let task = tokio::spawn(run(orchestrator, command_rx, event_tx));
    WorkerHandle {
        commands: WorkerSender { tx: command_tx },
        events: event_rx,
        task,
    }
}

/// Queued request: the ones that run on the task slot.
enum Job {
    Init {
        kind: ModelKind,
        request_id: Option<String>,
    },
    Inference {
        kind: ModelKind,
        payload: InferencePayload,
        request_id: Option<String>,
    },
}

async fn run(
    orchestrator: Orchestrator,
    mut inbox: mpsc::UnboundedReceiver<HostMessage>,
    outbox: mpsc::UnboundedSender<WorkerMessage>,
) {
    orchestrator.attach_progress(ModelKind::SpeechToSpeech, None);
    info!("Worker started");

    let mut queue: VecDeque<Job> = VecDeque::new();
    let mut in_flight: Option<JoinHandle<()>> = None;

    loop {
        if in_flight.is_none() {
            if let Some(job) = queue.pop_front() {
                in_flight = Some(tokio::spawn(execute(orchestrator.clone(), job)));
            }
        }

        tokio::select! {
            message = inbox.recv() => {
                let Some(message) = message else {
                    debug!("Host channel closed");
                    break;
                };
                debug!(request = message.name(), request_id = ?message.request_id(), "Worker request");
                match message {
                    HostMessage::Init { model_kind, request_id } => {
                        queue.push_back(Job::Init { kind: model_kind, request_id });
                    }
                    HostMessage::Inference { model_kind, payload, request_id } => {
                        queue.push_back(Job::Inference { kind: model_kind, payload, request_id });
                    }
                    HostMessage::Dispose { model_kind, request_id } => {
                        orchestrator.dispose(model_kind, request_id).await;
                    }
                    HostMessage::Configure { model_kind, model_id, settings, request_id } => {
                        orchestrator.configure(model_kind, model_id, settings, request_id).await;
                    }
                    HostMessage::Terminate { request_id } => {
                        inbox.close();
                        stop(&mut in_flight, &orchestrator).await;
                        let _ = outbox.send(WorkerMessage::Terminated { request_id });
                        info!(dropped = queue.len(), "Worker terminated");
                        return;
                    }
                }
            }
            joined = finished(&mut in_flight) => {
                in_flight = None;
                if let Err(err) = joined {
                    if err.is_panic() {
                        error!(error = %err, "Worker task panicked");
                    }
                }
            }
        }
    }

    stop(&mut in_flight, &orchestrator).await;
    info!(dropped = queue.len(), "Worker stopped");
}

async fn execute(orchestrator: Orchestrator, job: Job) {
    let outcome = match job {
        Job::Init { kind, request_id } => orchestrator.init(kind, request_id).await,
        Job::Inference {
            kind,
            payload,
            request_id,
        } => orchestrator.infer(kind, payload, request_id).await,
    };
    if let Err(err) = outcome {
        debug!(error = %err, "Request ended with an error");
    }
}

async fn finished(task: &mut Option<JoinHandle<()>>) -> std::result::Result<(), JoinError> {
    match task {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

/// Abort the running task, then release every engine.
async fn stop(in_flight: &mut Option<JoinHandle<()>>, orchestrator: &Orchestrator) {
    if let Some(task) = in_flight.take() {
        task.abort();
        let _ = task.await;
    }
    orchestrator.context().shutdown().await;
}
