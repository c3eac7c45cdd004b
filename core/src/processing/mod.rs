pub mod aggregation;
pub mod assembly;
pub mod azimuthal;
pub mod buffer_pool;
pub mod correction;
pub mod postfilter;
pub mod prefilter;
pub mod roi;

pub use aggregation::AggregationStage;
pub use assembly::AssemblyStage;
pub use azimuthal::{AzimuthalCurve, AzimuthalIntegrator, AzimuthalStage, RadialBinIntegrator};
pub use buffer_pool::BufferPool;
pub use correction::CorrectionStage;
pub use postfilter::PostFilterStage;
pub use prefilter::PreFilterStage;
pub use roi::RoiStage;
