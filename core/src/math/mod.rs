pub mod region;
pub mod stats;

pub use region::{ParseRectError, Rect};
pub use stats::StatsHelper;
