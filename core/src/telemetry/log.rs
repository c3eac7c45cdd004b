use log::{debug, info, warn};
use std::time::{Duration, Instant};

/// Stages faster than this are not reported by [`LogManager::timed`].
const TIMING_THRESHOLD: Duration = Duration::from_millis(1);

/// Logging context handed to each component at construction.
#[derive(Debug, Clone)]
pub struct LogManager {
    target: String,
}

impl LogManager {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }

    /// Derive a context for a sub-component, e.g. `fxcore::worker` → `fxcore::worker::mask`.
    pub fn child(&self, name: &str) -> Self {
        Self::new(format!("{}::{}", self.target, name))
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn record(&self, message: &str) {
        info!(target: self.target.as_str(), "{}", message);
    }

    pub fn debug(&self, message: &str) {
        debug!(target: self.target.as_str(), "{}", message);
    }

    pub fn warn(&self, message: &str) {
        warn!(target: self.target.as_str(), "{}", message);
    }

    /// Run `f` and log its duration at debug level when it is noticeable.
    pub fn timed<R>(&self, label: &str, f: impl FnOnce() -> R) -> R {
        let start = Instant::now();
        let result = f();
        let elapsed = start.elapsed();
        if elapsed >= TIMING_THRESHOLD {
            debug!(
                target: self.target.as_str(),
                "{} took {:.1} ms",
                label,
                elapsed.as_secs_f64() * 1000.0
            );
        }
        result
    }
}

impl Default for LogManager {
    fn default() -> Self {
        Self::new("fxcore")
    }
}
