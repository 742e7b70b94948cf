//! Progress events emitted by the searcher
//!
//! The search core never opens files or installs a subscriber. It reports
//! through a [`ProgressSink`] owned by the searcher; [`TracingProgress`] routes
//! events to `tracing`, [`RecordingProgress`] keeps them for inspection.

use tracing::{debug, info};

use crate::nas::genotype::Genotype;
use crate::train::searcher::SearchPhase;

/// Consumer of search lifecycle events
pub trait ProgressSink: Send {
    fn search_started(&mut self, epochs: usize, train_batches: usize, valid_batches: usize);

    fn epoch_started(&mut self, epoch: usize, lr: f64);

    /// Mean loss of one training phase over the epoch
    fn phase_finished(&mut self, epoch: usize, phase: SearchPhase, loss: f64);

    fn epoch_evaluated(&mut self, epoch: usize, f1: f64, improved: bool);

    /// Genotype decoded from the current architecture parameters
    fn genotype(&mut self, epoch: usize, genotype: &Genotype);

    fn search_finished(&mut self, best_f1: f64, best_epoch: usize);
}

/// Sink that emits events via `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn search_started(&mut self, epochs: usize, train_batches: usize, valid_batches: usize) {
        info!(epochs, train_batches, valid_batches, "Architecture search started");
    }

    fn epoch_started(&mut self, epoch: usize, lr: f64) {
        info!(epoch, lr, "Epoch started");
    }

    fn phase_finished(&mut self, epoch: usize, phase: SearchPhase, loss: f64) {
        info!(epoch, phase = %phase, loss, "Phase finished");
    }

    fn epoch_evaluated(&mut self, epoch: usize, f1: f64, improved: bool) {
        info!(epoch, f1, improved, "Validation F1");
    }

    fn genotype(&mut self, epoch: usize, genotype: &Genotype) {
        debug!(epoch, genotype = %genotype, "Current genotype");
    }

    fn search_finished(&mut self, best_f1: f64, best_epoch: usize) {
        info!(best_f1, best_epoch, "Architecture search finished");
    }
}

/// Recorded event
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    SearchStarted { epochs: usize },
    EpochStarted { epoch: usize, lr: f64 },
    PhaseFinished { epoch: usize, phase: SearchPhase, loss: f64 },
    EpochEvaluated { epoch: usize, f1: f64, improved: bool },
    Genotype { epoch: usize, genotype: Genotype },
    SearchFinished { best_f1: f64, best_epoch: usize },
}

/// Sink that keeps every event in order
#[derive(Debug, Clone, Default)]
pub struct RecordingProgress {
    events: Vec<ProgressEvent>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[ProgressEvent] {
        &self.events
    }

    /// Learning rate reported at the start of each epoch
    pub fn learning_rates(&self) -> Vec<f64> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::EpochStarted { lr, .. } => Some(*lr),
                _ => None,
            })
            .collect()
    }
}

impl ProgressSink for RecordingProgress {
    fn search_started(&mut self, epochs: usize, _train_batches: usize, _valid_batches: usize) {
        self.events.push(ProgressEvent::SearchStarted { epochs });
    }

    fn epoch_started(&mut self, epoch: usize, lr: f64) {
        self.events.push(ProgressEvent::EpochStarted { epoch, lr });
    }

    fn phase_finished(&mut self, epoch: usize, phase: SearchPhase, loss: f64) {
        self.events.push(ProgressEvent::PhaseFinished { epoch, phase, loss });
    }

    fn epoch_evaluated(&mut self, epoch: usize, f1: f64, improved: bool) {
        self.events.push(ProgressEvent::EpochEvaluated { epoch, f1, improved });
    }

    fn genotype(&mut self, epoch: usize, genotype: &Genotype) {
        self.events.push(ProgressEvent::Genotype {
            epoch,
            genotype: genotype.clone(),
        });
    }

    fn search_finished(&mut self, best_f1: f64, best_epoch: usize) {
        self.events.push(ProgressEvent::SearchFinished { best_f1, best_epoch });
    }
}
