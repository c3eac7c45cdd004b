//! Control plane: mask, reference image and calibration constants pushed by
//! a control process and picked up by the worker at train boundaries.
//!
//! Deployments reach a Redis server through [`RedisConnector`]; the control
//! process and each worker open their own connections to it.
//! [`InMemoryBroker`] keeps both ends inside one process.

pub mod broker;
pub mod calibration;
pub mod channel;
pub mod codec;
pub mod mask;
pub mod message;
pub mod redis_broker;
pub mod reference;

pub use broker::{
    Broker, BrokerConnection, BrokerError, Connector, InMemoryBroker, Message, Subscription,
};
pub use calibration::{
    CalConstants, CalibrationError, CalibrationPublisher, CalibrationState, CalibrationSubscriber,
};
pub use channel::{ChannelUpdate, Drain};
pub use codec::DecodeError;
pub use mask::{ImageMask, MaskPublisher, MaskSubscriber};
pub use message::ControlMessage;
pub use redis_broker::RedisConnector;
pub use reference::{ReferenceImage, ReferencePublisher, ReferenceSubscriber};

use crate::config::BrokerConfig;
use crate::telemetry::log::LogManager;
use crate::telemetry::metrics::{MetricsRecorder, MetricsSnapshot};
use std::sync::Arc;

/// Control state seen by one train. Cloning only bumps reference counts.
#[derive(Debug, Clone, Default)]
pub struct ControlSnapshot {
    pub mask: Option<ImageMask>,
    pub reference: Option<ReferenceImage>,
    pub gain: Option<Arc<CalConstants>>,
    pub offset: Option<Arc<CalConstants>>,
}

/// Worker side of the control plane.
pub struct ControlPlane {
    connection: Arc<BrokerConnection>,
    reference: ReferenceSubscriber,
    mask: MaskSubscriber,
    calibration: CalibrationSubscriber,
    metrics: Arc<MetricsRecorder>,
    logger: LogManager,
}

impl ControlPlane {
    pub fn new(
        connection: Arc<BrokerConnection>,
        metrics: Arc<MetricsRecorder>,
        logger: LogManager,
    ) -> Self {
        Self {
            reference: ReferenceSubscriber::new(Arc::clone(&connection), logger.child("reference")),
            mask: MaskSubscriber::new(Arc::clone(&connection), logger.child("mask")),
            calibration: CalibrationSubscriber::new(
                Arc::clone(&connection),
                logger.child("calibration"),
            ),
            connection,
            metrics,
            logger,
        }
    }

    /// Subscribe every channel. Updates published before this are not seen.
    pub fn connect(&mut self) -> Result<(), BrokerError> {
        self.reference.connect()?;
        self.mask.connect()?;
        self.calibration.connect()
    }

    fn count_error(&self, channel: &str, err: &BrokerError) {
        self.metrics.record_control_error();
        self.logger.warn(&format!("{channel} update cut short: {err}"));
    }

    fn absorb<T>(&self, channel: &str, update: ChannelUpdate<T>) -> T {
        if let Some(err) = &update.error {
            self.count_error(channel, err);
        }
        update.state
    }

    /// Drain every channel and return the snapshot for the next train.
    ///
    /// Never blocks and never fails. Messages read before a broken
    /// connection are still applied; the channel keeps the resulting state
    /// and is reconnected on a later call.
    pub fn refresh(
        &mut self,
        current: &ControlSnapshot,
        image_shape: (usize, usize),
    ) -> ControlSnapshot {
        let reference = self.reference.update(current.reference.clone());
        let reference = self.absorb("reference", reference);

        let mask = self.mask.update(current.mask.clone(), image_shape);
        let mask = self.absorb("mask", mask);

        let calibration = self.calibration.update(CalibrationState {
            gain: current.gain.clone(),
            offset: current.offset.clone(),
        });
        let calibration = self.absorb("calibration", calibration);

        ControlSnapshot {
            mask,
            reference,
            gain: calibration.gain,
            offset: calibration.offset,
        }
    }

    /// Store `snapshot` as JSON under `metrics:<worker>` in the broker.
    pub fn publish_metrics(&self, worker: &str, snapshot: &MetricsSnapshot) {
        let payload = match serde_json::to_vec(snapshot) {
            Ok(payload) => payload,
            Err(err) => {
                self.logger.warn(&format!("cannot encode metrics: {err}"));
                return;
            }
        };
        let key = format!("metrics:{worker}");
        let result = self
            .connection
            .connect()
            .and_then(|broker| broker.set(&key, &payload));
        if let Err(err) = result {
            self.connection.reset();
            self.count_error("metrics", &err);
        }
    }
}

/// Producer side, held by the control process.
pub struct ControlProducer {
    pub reference: ReferencePublisher,
    pub mask: MaskPublisher,
    pub calibration: CalibrationPublisher,
}

/// Worker-side control plane with its own broker connection.
pub fn control_plane(
    config: &BrokerConfig,
    connector: Arc<dyn Connector>,
    metrics: Arc<MetricsRecorder>,
    logger: LogManager,
) -> ControlPlane {
    let connection = Arc::new(BrokerConnection::new(config.clone(), connector));
    ControlPlane::new(connection, metrics, logger)
}

/// Producer bundle with its own broker connection.
pub fn control_producer(config: &BrokerConfig, connector: Arc<dyn Connector>) -> ControlProducer {
    let connection = Arc::new(BrokerConnection::new(config.clone(), connector));
    ControlProducer {
        reference: ReferencePublisher::new(Arc::clone(&connection)),
        mask: MaskPublisher::new(Arc::clone(&connection)),
        calibration: CalibrationPublisher::new(connection),
    }
}
