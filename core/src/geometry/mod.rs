//! Detector geometry: module stacks, quadrant calibration, and stitching
//! modules into a single image.

pub mod assembler;
pub mod calibration;
pub mod pixel;
pub mod stacked;
pub mod topology;

pub use assembler::{AssembledCanvas, AssemblerOptions, GeometryAssembler, ModuleData};
pub use calibration::GeometryCalibration;
pub use pixel::Pixel;
pub use stacked::{ModuleAxis, StackedModuleView, ViewError};
pub use topology::{DetectorFamily, ModuleTopology, Orientation, TileSpec};

pub type GeometryResult<T> = Result<T, GeometryError>;

/// Failures while building an assembler. Raised once, never per train.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("topology {name} is invalid: {reason}")]
    InvalidTopology { name: String, reason: String },
    #[error("invalid geometry calibration: {0}")]
    InvalidCalibration(String),
    #[error("assembled footprint {footprint:?} does not fit any expected canvas shape {expected:?}")]
    OutOfBounds {
        footprint: (usize, usize),
        expected: Vec<(usize, usize)>,
    },
    #[error("canvas shape {requested:?} is not one of {expected:?}")]
    UnsupportedShape {
        requested: (usize, usize),
        expected: Vec<(usize, usize)>,
    },
    #[error("failed to read geometry file {path}: {reason}")]
    Io { path: String, reason: String },
}

/// Per-train input mismatches detected by [`GeometryAssembler::assemble`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AssemblyError {
    #[error("expected {expected} modules, found {found}")]
    ModuleCount { expected: usize, found: usize },
    #[error("expected module shape {expected:?}, found {found:?}")]
    ModuleShape {
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("canvas has shape {found:?}, expected {expected:?}")]
    CanvasShape { expected: [usize; 3], found: Vec<usize> },
    #[error("pulse window {start}..{end} exceeds {available} pulses")]
    PulseWindow {
        start: usize,
        end: usize,
        available: usize,
    },
}
