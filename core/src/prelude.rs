use crate::config::PipelineConfig;
use crate::geometry::{AssemblyError, GeometryError};
use crate::pipeline::record::TrainRecord;

/// Common error type for stage execution.
#[derive(thiserror::Error, Debug)]
pub enum StageError {
    #[error("buffer exhaustion: {0}")]
    BufferExhaustion(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Assembly(#[from] AssemblyError),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error("internal failure: {0}")]
    Internal(String),
}

pub type StageResult<T> = Result<T, StageError>;

/// One step of the per-train chain.
///
/// `process` may read anything earlier stages wrote to the record but only
/// writes the fields it owns. The chain never calls `process` on a record
/// that is already invalid.
pub trait ProcessingStage: Send {
    fn name(&self) -> &'static str;
    fn initialize(&mut self, config: &PipelineConfig) -> StageResult<()>;
    fn process(&mut self, record: &mut TrainRecord) -> StageResult<()>;
    fn cleanup(&mut self);
}
