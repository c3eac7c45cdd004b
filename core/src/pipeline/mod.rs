//! Worker loop, stage chain and the queues around it.

pub mod queue;
pub mod record;
pub mod worker;

pub use queue::{outbound_queue, OutboundQueue, PushOutcome, SourceError, TrainSource};
pub use record::{ModuleStack, RawImages, RawTrain, RecordStatus, TrainRecord};
pub use worker::{spawn_worker, PipelineWorker, StageChain, StopSignal, WorkerHandle, WorkerState};

use crate::config::ConfigError;
use crate::geometry::GeometryError;
use crate::prelude::StageError;

/// Failures that keep a worker from starting.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error("stage {stage} failed to initialize: {source}")]
    StageInit {
        stage: &'static str,
        #[source]
        source: StageError,
    },
    #[error("cannot spawn worker thread: {0}")]
    Spawn(String),
    #[error("worker thread panicked")]
    Panicked,
}
