//! Train-processing core for megapixel FEL detectors.
//!
//! Raw module stacks come in one train at a time, are stitched into detector
//! images, corrected with the current control state (mask, reference image,
//! calibration constants) and reduced to per-pulse and per-train results.

pub mod config;
pub mod control;
pub mod geometry;
pub mod math;
pub mod pipeline;
pub mod prelude;
pub mod processing;
pub mod telemetry;

pub use config::{ConfigError, PipelineConfig};
pub use geometry::{GeometryAssembler, ModuleData, StackedModuleView};
pub use pipeline::{PipelineError, PipelineWorker, TrainRecord};
pub use prelude::{ProcessingStage, StageError, StageResult};
