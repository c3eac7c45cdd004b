//! Pipeline configuration. Every section has defaults so a partial YAML or
//! JSON document is enough.

use crate::geometry::{
    AssemblerOptions, DetectorFamily, GeometryAssembler, GeometryCalibration, GeometryResult,
};
use crate::math::region::Rect;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub detector: DetectorConfig,
    pub pulses: PulseConfig,
    pub image: ImageConfig,
    pub rois: Vec<RoiConfig>,
    pub azimuthal: AzimuthalConfig,
    pub post_filter: PostFilterConfig,
    pub aggregation: AggregationConfig,
    pub worker: WorkerConfig,
    pub broker: BrokerConfig,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.detector.validate()?;

        if let Some(end) = self.pulses.end {
            if end < self.pulses.start {
                return Err(invalid(
                    "pulses",
                    format!("end {} before start {}", end, self.pulses.start),
                ));
            }
        }
        if let Some((low, high)) = self.image.threshold {
            if !(low <= high) {
                return Err(invalid("image.threshold", format!("({low}, {high})")));
            }
        }
        if !self.image.background.is_finite() {
            return Err(invalid("image.background", "must be finite"));
        }

        let mut names = HashSet::new();
        for roi in &self.rois {
            if !names.insert(roi.name.as_str()) {
                return Err(invalid("rois", format!("duplicate name {:?}", roi.name)));
            }
            if roi.rect.w <= 0 || roi.rect.h <= 0 {
                return Err(invalid("rois", format!("{} has empty rect {}", roi.name, roi.rect)));
            }
        }

        let az = &self.azimuthal;
        if az.enabled {
            if !(az.energy_kev > 0.0) {
                return Err(invalid("azimuthal.energy_kev", "must be positive"));
            }
            if !(az.sample_distance_m > 0.0) {
                return Err(invalid("azimuthal.sample_distance_m", "must be positive"));
            }
            if az.n_points < 2 {
                return Err(invalid("azimuthal.n_points", "need at least 2 points"));
            }
            check_range("azimuthal.q_range", az.q_range)?;
            check_range("azimuthal.fom_range", az.fom_range)?;
        }
        check_range("post_filter.fom_range", self.post_filter.fom_range)?;

        let agg = &self.aggregation;
        if agg.moving_average_window == 0 {
            return Err(invalid("aggregation.moving_average_window", "must be at least 1"));
        }
        if agg.laser_mode != LaserMode::Disabled {
            if agg.on_pulses.is_empty() || agg.off_pulses.is_empty() {
                return Err(invalid(
                    "aggregation",
                    "pump-probe needs on_pulses and off_pulses",
                ));
            }
            if !az.enabled {
                return Err(invalid("aggregation", "pump-probe needs azimuthal integration"));
            }
        }
        check_range("aggregation.normalization_range", agg.normalization_range)?;

        if self.worker.outbound_capacity == 0 {
            return Err(invalid("worker.outbound_capacity", "must be at least 1"));
        }
        if self.worker.pull_timeout_ms == 0 {
            return Err(invalid("worker.pull_timeout_ms", "must be at least 1"));
        }
        Ok(())
    }
}

fn check_range(field: &'static str, range: Option<(f64, f64)>) -> Result<(), ConfigError> {
    match range {
        Some((low, high)) if !(low < high) => Err(invalid(field, format!("({low}, {high})"))),
        _ => Ok(()),
    }
}

/// Which detector is read and how its quadrants are positioned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub family: DetectorFamily,
    /// Four (x, y) quadrant positions in mm.
    pub quad_positions: Option<Vec<Vec<f64>>>,
    /// JSON file holding `quad_positions`; used when no inline list is given.
    pub geometry_file: Option<PathBuf>,
    pub expected_shapes: Option<Vec<(usize, usize)>>,
    pub canvas_shape: Option<(usize, usize)>,
    pub ignore_tile_edges: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            family: DetectorFamily::Dssc1M,
            quad_positions: None,
            geometry_file: None,
            expected_shapes: None,
            canvas_shape: None,
            ignore_tile_edges: false,
        }
    }
}

impl DetectorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(positions) = &self.quad_positions {
            GeometryCalibration::from_positions(positions)
                .map_err(|err| invalid("detector.quad_positions", err.to_string()))?;
        }
        if matches!(&self.expected_shapes, Some(shapes) if shapes.is_empty()) {
            return Err(invalid("detector.expected_shapes", "must not be empty"));
        }
        Ok(())
    }

    pub fn calibration(&self) -> GeometryResult<GeometryCalibration> {
        match (&self.quad_positions, &self.geometry_file) {
            (Some(positions), _) => GeometryCalibration::from_positions(positions),
            (None, Some(path)) => GeometryCalibration::load(path),
            (None, None) => Ok(GeometryCalibration::reference(&self.family.topology())),
        }
    }

    pub fn build_assembler(&self) -> GeometryResult<GeometryAssembler> {
        let mut topology = self.family.topology();
        if let Some(shapes) = &self.expected_shapes {
            topology = topology.with_expected_shapes(shapes.clone());
        }
        let options = AssemblerOptions {
            canvas_shape: self.canvas_shape,
            ignore_tile_edges: self.ignore_tile_edges,
        };
        GeometryAssembler::with_options(topology, &self.calibration()?, options)
    }
}

/// Inclusive pulse window `[start, end]`; `end = None` keeps every remaining pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    pub start: usize,
    pub end: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Constant subtracted from every pixel after calibration.
    pub background: f32,
    /// Pixels outside `[low, high]` are masked.
    pub threshold: Option<(f32, f32)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoiFom {
    #[default]
    Sum,
    Mean,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoiConfig {
    pub name: String,
    pub rect: Rect,
    #[serde(default)]
    pub fom: RoiFom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AzimuthalConfig {
    pub enabled: bool,
    pub energy_kev: f64,
    pub sample_distance_m: f64,
    /// Beam centre (x, y) in canvas pixels; defaults to the canvas centre.
    pub center: Option<(f64, f64)>,
    pub n_points: usize,
    /// Momentum-transfer range in 1/Å.
    pub q_range: Option<(f64, f64)>,
    pub fom_range: Option<(f64, f64)>,
}

impl Default for AzimuthalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            energy_kev: 9.3,
            sample_distance_m: 0.6,
            center: None,
            n_points: 512,
            q_range: None,
            fom_range: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PostFilterConfig {
    /// Pulses whose azimuthal FOM falls outside this range are dropped.
    pub fom_range: Option<(f64, f64)>,
}

/// How laser-pumped data is told apart from unpumped data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaserMode {
    #[default]
    Disabled,
    /// On and off pulses come from the same train.
    SameTrain,
    /// Trains with an even id are pumped; the following odd train is the reference.
    EvenOn,
    /// Trains with an odd id are pumped; the following even train is the reference.
    OddOn,
}

impl LaserMode {
    /// Whether `train_id` is a pumped train in an alternating mode.
    pub fn is_on_train(self, train_id: u64) -> Option<bool> {
        match self {
            LaserMode::EvenOn => Some(train_id % 2 == 0),
            LaserMode::OddOn => Some(train_id % 2 == 1),
            LaserMode::Disabled | LaserMode::SameTrain => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub moving_average_window: usize,
    /// Train FOM integration range in q; the whole profile when unset.
    pub fom_range: Option<(f64, f64)>,
    pub laser_mode: LaserMode,
    pub on_pulses: Vec<usize>,
    pub off_pulses: Vec<usize>,
    pub normalization_range: Option<(f64, f64)>,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            moving_average_window: 10,
            fom_range: None,
            laser_mode: LaserMode::Disabled,
            on_pulses: Vec::new(),
            off_pulses: Vec::new(),
            normalization_range: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub name: String,
    pub pull_timeout_ms: u64,
    pub outbound_capacity: usize,
    /// Store the metrics snapshot under `metrics:<name>` after every train.
    pub publish_metrics: bool,
}

impl WorkerConfig {
    pub fn pull_timeout(&self) -> Duration {
        Duration::from_millis(self.pull_timeout_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "pipeline".into(),
            pull_timeout_ms: 100,
            outbound_capacity: 5,
            publish_metrics: false,
        }
    }
}

/// Where the control-plane broker lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerBackend {
    /// Redis server at `host:port`, reachable from every process.
    #[default]
    Redis,
    /// Broker inside the current process; producer and worker share one instance.
    InProcess,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub backend: BrokerBackend,
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

impl BrokerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::Redis,
            host: "127.0.0.1".into(),
            port: 6379,
            password: None,
        }
    }
}
