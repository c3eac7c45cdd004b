use crate::control::broker::{BrokerConnection, BrokerError};
use crate::control::channel::{publish, ChannelSubscriber, ChannelUpdate};
use crate::control::codec::{decode_image, encode_image};
use crate::control::message::ControlMessage;
use crate::telemetry::log::LogManager;
use ndarray::Array2;
use std::sync::Arc;

pub const REFERENCE_CHANNEL: &str = "reference_image";

pub type ReferenceImage = Arc<Array2<f32>>;

pub struct ReferencePublisher {
    connection: Arc<BrokerConnection>,
}

impl ReferencePublisher {
    pub fn new(connection: Arc<BrokerConnection>) -> Self {
        Self { connection }
    }

    pub fn set(&self, image: &Array2<f32>) -> Result<(), BrokerError> {
        publish(&self.connection, REFERENCE_CHANNEL, &encode_image(image))
    }

    pub fn remove(&self) -> Result<(), BrokerError> {
        publish(&self.connection, REFERENCE_CHANNEL, b"")
    }
}

pub struct ReferenceSubscriber {
    channel: ChannelSubscriber,
    logger: LogManager,
}

impl ReferenceSubscriber {
    pub fn new(connection: Arc<BrokerConnection>, logger: LogManager) -> Self {
        Self {
            channel: ChannelSubscriber::new(connection, REFERENCE_CHANNEL),
            logger,
        }
    }

    pub fn connect(&mut self) -> Result<(), BrokerError> {
        self.channel.connect()
    }

    /// Only the newest buffered message counts. An undecodable image leaves
    /// `current` in place.
    pub fn update(
        &mut self,
        current: Option<ReferenceImage>,
    ) -> ChannelUpdate<Option<ReferenceImage>> {
        let drained = self.channel.drain();
        let state = match drained.messages.last() {
            None => current,
            Some(last) => self.apply(current, ControlMessage::from_payload(&last.payload)),
        };
        ChannelUpdate {
            state,
            error: drained.error,
        }
    }

    fn apply(
        &self,
        current: Option<ReferenceImage>,
        message: ControlMessage,
    ) -> Option<ReferenceImage> {
        match message {
            ControlMessage::Replace(bytes) => match decode_image(&bytes) {
                Ok(image) => {
                    self.logger
                        .debug(&format!("reference image replaced, shape {:?}", image.dim()));
                    Some(Arc::new(image))
                }
                Err(err) => {
                    self.logger.warn(&format!("ignoring reference image: {err}"));
                    current
                }
            },
            _ => None,
        }
    }
}
