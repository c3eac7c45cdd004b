use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Monitoring counters for one pipeline worker. Errors absorbed by the data
/// path only ever show up here.
pub struct MetricsRecorder {
    inner: Mutex<MetricsSnapshot>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Trains that went through the stage chain, valid or not.
    pub processed: usize,
    pub invalid: usize,
    /// Results discarded because the outbound queue was full.
    pub dropped: usize,
    pub control_errors: usize,
    pub last_train_id: Option<u64>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MetricsSnapshot::default()),
        }
    }

    fn update(&self, f: impl FnOnce(&mut MetricsSnapshot)) {
        if let Ok(mut metrics) = self.inner.lock() {
            f(&mut metrics);
        }
    }

    pub fn record_processed(&self, train_id: u64, valid: bool) {
        self.update(|m| {
            m.processed += 1;
            if !valid {
                m.invalid += 1;
            }
            m.last_train_id = Some(train_id);
        });
    }

    pub fn record_dropped(&self) {
        self.update(|m| m.dropped += 1);
    }

    pub fn record_control_error(&self) {
        self.update(|m| m.control_errors += 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|m| *m).unwrap_or_default()
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_trains_and_errors() {
        let metrics = MetricsRecorder::new();
        metrics.record_processed(10, true);
        metrics.record_processed(11, false);
        metrics.record_dropped();
        metrics.record_control_error();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.processed, 2);
        assert_eq!(snapshot.invalid, 1);
        assert_eq!(snapshot.dropped, 1);
        assert_eq!(snapshot.control_errors, 1);
        assert_eq!(snapshot.last_train_id, Some(11));
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let snapshot = MetricsSnapshot {
            processed: 3,
            ..Default::default()
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: MetricsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }
}
