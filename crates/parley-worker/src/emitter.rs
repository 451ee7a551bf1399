//! Lifecycle events of one inference invocation.

use tokio::sync::mpsc;
use tracing::debug;

use parley_core::protocol::WorkerMessage;
use parley_core::types::{InferenceData, InferenceEvent, ModelKind};

/// Outbound message channel of a worker.
pub type Outbox = mpsc::UnboundedSender<WorkerMessage>;

/// Emits `Inferencing`, any number of `Streaming`, then exactly one terminal
/// event for a single invocation.
///
/// `ready` and `error` consume the emitter, so a second terminal cannot be
/// sent. An emitter dropped without either (the invocation was cancelled or
/// aborted by a failing sibling stage) sends a terminal `Error` itself.
pub struct InvocationEmitter {
    kind: ModelKind,
    request_id: Option<String>,
    outbox: Outbox,
    finished: bool,
}

impl InvocationEmitter {
    pub fn new(kind: ModelKind, request_id: Option<String>, outbox: Outbox) -> Self {
        Self {
            kind,
            request_id,
            outbox,
            finished: false,
        }
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn inferencing(&self) {
        self.send(InferenceEvent::Inferencing);
    }

    pub fn streaming(&self, data: InferenceData) {
        self.send(InferenceEvent::Streaming(data));
    }

    pub fn ready(mut self, data: InferenceData) {
        self.finished = true;
        self.send(InferenceEvent::Ready(data));
    }

    pub fn error(mut self, reason: impl Into<String>) {
        self.finished = true;
        self.send(InferenceEvent::Error(reason.into()));
    }

    fn send(&self, event: InferenceEvent) {
        let message = WorkerMessage::inference(self.kind, event, self.request_id.clone());
        if self.outbox.send(message).is_err() {
            debug!(kind = %self.kind, "Host gone, dropping inference event");
        }
    }
}

impl Drop for InvocationEmitter {
    fn drop(&mut self) {
        if !self.finished {
            self.send(InferenceEvent::Error("Invocation cancelled".into()));
        }
    }
}
