//! Bi-level search training
//!
//! Provides the outer search loop and its collaborators:
//! - Batches and batch sources
//! - Validation F1
//! - Adam optimizers and the warm-restart cosine schedule
//! - Progress sinks
//! - The alternating weight/architecture searcher

pub mod data;
pub mod metrics;
pub mod optim;
pub mod scheduler;
pub mod progress;
pub mod searcher;

pub use data::{Batch, BatchSource, InMemoryDataset, Targets};
pub use metrics::f1_score;
pub use optim::Adam;
pub use scheduler::CosineAnnealingWarmRestarts;
pub use progress::{ProgressEvent, ProgressSink, RecordingProgress, TracingProgress};
pub use searcher::{BilevelSearcher, EpochRecord, SearchOutcome, SearchPhase};
