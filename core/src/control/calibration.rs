use crate::control::broker::{BrokerConnection, BrokerError};
use crate::control::channel::{publish, ChannelSubscriber, ChannelUpdate};
use crate::control::message::ControlMessage;
use crate::telemetry::log::LogManager;
use ndarray::{Array2, Array3, ArrayD, ArrayView2, Axis, Ix2, Ix3};
use ndarray_npy::read_npy;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const CALIBRATION_PATTERN: &str = "cal_constants:*";
pub const GAIN_CHANNEL: &str = "cal_constants:gain";
pub const OFFSET_CHANNEL: &str = "cal_constants:offset";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CalibrationError {
    #[error("cannot read calibration constants {path}: {reason}")]
    Read { path: PathBuf, reason: String },
    #[error("calibration constants {path} have {ndim} dimensions, expected 2 or 3")]
    Dimensions { path: PathBuf, ndim: usize },
}

/// Per-pixel calibration constants, either shared by every pulse or given
/// per memory cell.
#[derive(Debug, Clone, PartialEq)]
pub enum CalConstants {
    PerPixel(Array2<f32>),
    /// `(cells, rows, cols)`
    PerCell(Array3<f32>),
}

impl CalConstants {
    /// Load a float32 `.npy` file with 2 or 3 dimensions.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CalibrationError> {
        let path = path.as_ref();
        let data: ArrayD<f32> = read_npy(path).map_err(|err| CalibrationError::Read {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        let dims = |ndim| CalibrationError::Dimensions {
            path: path.to_path_buf(),
            ndim,
        };
        match data.ndim() {
            2 => data
                .into_dimensionality::<Ix2>()
                .map(CalConstants::PerPixel)
                .map_err(|_| dims(2)),
            3 => data
                .into_dimensionality::<Ix3>()
                .map(CalConstants::PerCell)
                .map_err(|_| dims(3)),
            ndim => Err(dims(ndim)),
        }
    }

    pub fn image_shape(&self) -> (usize, usize) {
        match self {
            CalConstants::PerPixel(values) => values.dim(),
            CalConstants::PerCell(values) => (values.dim().1, values.dim().2),
        }
    }

    /// Constants for the pulse stored in memory cell `cell`.
    pub fn for_cell(&self, cell: usize) -> Option<ArrayView2<'_, f32>> {
        match self {
            CalConstants::PerPixel(values) => Some(values.view()),
            CalConstants::PerCell(values) if cell < values.len_of(Axis(0)) => {
                Some(values.index_axis(Axis(0), cell))
            }
            CalConstants::PerCell(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationState {
    pub gain: Option<Arc<CalConstants>>,
    pub offset: Option<Arc<CalConstants>>,
}

pub struct CalibrationPublisher {
    connection: Arc<BrokerConnection>,
}

impl CalibrationPublisher {
    pub fn new(connection: Arc<BrokerConnection>) -> Self {
        Self { connection }
    }

    fn send_path(&self, channel: &str, path: &Path) -> Result<(), BrokerError> {
        publish(&self.connection, channel, path.to_string_lossy().as_bytes())
    }

    pub fn set_gain<P: AsRef<Path>>(&self, path: P) -> Result<(), BrokerError> {
        self.send_path(GAIN_CHANNEL, path.as_ref())
    }

    pub fn remove_gain(&self) -> Result<(), BrokerError> {
        publish(&self.connection, GAIN_CHANNEL, b"")
    }

    pub fn set_offset<P: AsRef<Path>>(&self, path: P) -> Result<(), BrokerError> {
        self.send_path(OFFSET_CHANNEL, path.as_ref())
    }

    pub fn remove_offset(&self) -> Result<(), BrokerError> {
        publish(&self.connection, OFFSET_CHANNEL, b"")
    }
}

pub struct CalibrationSubscriber {
    channel: ChannelSubscriber,
    logger: LogManager,
}

impl CalibrationSubscriber {
    pub fn new(connection: Arc<BrokerConnection>, logger: LogManager) -> Self {
        Self {
            channel: ChannelSubscriber::new(connection, CALIBRATION_PATTERN),
            logger,
        }
    }

    pub fn connect(&mut self) -> Result<(), BrokerError> {
        self.channel.connect()
    }

    /// The newest message per kind decides; files are only read for that one.
    pub fn update(&mut self, current: CalibrationState) -> ChannelUpdate<CalibrationState> {
        let drained = self.channel.drain();
        let mut gain = None;
        let mut offset = None;
        for message in drained.messages {
            let decoded = ControlMessage::from_payload(&message.payload);
            match message.channel.rsplit(':').next() {
                Some("gain") => gain = Some(decoded),
                Some("offset") => offset = Some(decoded),
                _ => self
                    .logger
                    .warn(&format!("unknown calibration channel {}", message.channel)),
            }
        }

        ChannelUpdate {
            state: CalibrationState {
                gain: self.resolve("gain", current.gain, gain),
                offset: self.resolve("offset", current.offset, offset),
            },
            error: drained.error,
        }
    }

    fn resolve(
        &self,
        kind: &str,
        current: Option<Arc<CalConstants>>,
        latest: Option<ControlMessage>,
    ) -> Option<Arc<CalConstants>> {
        match latest {
            None => current,
            Some(ControlMessage::Replace(bytes)) => {
                let path = PathBuf::from(String::from_utf8_lossy(&bytes).into_owned());
                match CalConstants::load(&path) {
                    Ok(constants) => {
                        self.logger.record(&format!(
                            "loaded {kind} constants {} with image shape {:?}",
                            path.display(),
                            constants.image_shape()
                        ));
                        Some(Arc::new(constants))
                    }
                    Err(err) => {
                        self.logger.warn(&err.to_string());
                        current
                    }
                }
            }
            Some(_) => None,
        }
    }
}
