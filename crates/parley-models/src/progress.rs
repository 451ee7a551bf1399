//! Load progress reporting.

use std::sync::{Arc, Mutex};

use tracing::debug;

use parley_core::types::{LoadProgress, ModelKind};

/// Receives load progress for a kind. Registered per handle, not part of identity.
pub type ProgressSink = Arc<dyn Fn(ModelKind, &LoadProgress) + Send + Sync>;

/// Last reported status of a handle, tagged with the load cycle it belongs to.
#[derive(Debug, Default)]
pub(crate) struct StatusCell {
    pub(crate) cycle: u64,
    pub(crate) status: Option<LoadProgress>,
}

impl StatusCell {
    /// Invalidate the current cycle and clear the status.
    pub(crate) fn reset(&mut self) -> u64 {
        self.cycle += 1;
        self.status = None;
        self.cycle
    }
}

/// Progress reporter for one load cycle.
///
/// Handed to [`crate::engine::EngineFactory::construct`]. Factories report
/// per-file stages; the handle itself reports `Initiating` and `Ready`.
/// Events after `Ready`, or from a cycle that has been superseded by a
/// dispose, are dropped.
#[derive(Clone)]
pub struct ProgressReporter {
    kind: ModelKind,
    cycle: u64,
    cell: Arc<Mutex<StatusCell>>,
    sink: Option<ProgressSink>,
}

impl ProgressReporter {
    pub(crate) fn new(
        kind: ModelKind,
        cycle: u64,
        cell: Arc<Mutex<StatusCell>>,
        sink: Option<ProgressSink>,
    ) -> Self {
        Self {
            kind,
            cycle,
            cell,
            sink,
        }
    }

    /// A reporter that goes nowhere, for constructing engines outside a handle.
    pub fn detached(kind: ModelKind) -> Self {
        Self::new(kind, 0, Arc::new(Mutex::new(StatusCell::default())), None)
    }

    /// A reporter outside any handle that forwards to `sink`, e.g. for a
    /// standalone weight download.
    pub fn forwarding(kind: ModelKind, sink: ProgressSink) -> Self {
        Self::new(kind, 0, Arc::new(Mutex::new(StatusCell::default())), Some(sink))
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn downloading(&self, file: &str, name: &str) {
        self.report(LoadProgress::Downloading {
            file: file.to_string(),
            name: name.to_string(),
        });
    }

    /// Report a percentage for a file; clamped to [0, 100].
    pub fn progressing(&self, file: &str, name: &str, percent: f32) {
        let percent = if percent.is_finite() {
            percent.clamp(0.0, 100.0)
        } else {
            0.0
        };
        self.report(LoadProgress::Progressing {
            file: file.to_string(),
            name: name.to_string(),
            percent,
        });
    }

    pub fn done(&self, file: &str, name: &str) {
        self.report(LoadProgress::Done {
            file: file.to_string(),
            name: name.to_string(),
        });
    }

    pub(crate) fn initiating(&self) {
        self.report(LoadProgress::Initiating);
    }

    pub(crate) fn ready(&self, model: &str) {
        self.report(LoadProgress::Ready {
            model: model.to_string(),
        });
    }

    fn report(&self, progress: LoadProgress) {
        {
            let Ok(mut cell) = self.cell.lock() else {
                return;
            };
            if cell.cycle != self.cycle {
                return;
            }
            if cell.status.as_ref().is_some_and(LoadProgress::is_ready) {
                return;
            }
            cell.status = Some(progress.clone());
        }

        debug!(kind = %self.kind, stage = progress.stage(), "Load progress");
        if let Some(sink) = &self.sink {
            sink(self.kind, &progress);
        }
    }
}
