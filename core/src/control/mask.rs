use crate::control::broker::{BrokerConnection, BrokerError};
use crate::control::channel::{publish, ChannelSubscriber, ChannelUpdate};
use crate::control::codec::{decode_mask, encode_mask};
use crate::control::message::ControlMessage;
use crate::math::region::Rect;
use crate::telemetry::log::LogManager;
use ndarray::{s, Array2};
use std::sync::Arc;

pub const MASK_CHANNEL: &str = "image_mask";

/// `true` marks a masked pixel.
pub type ImageMask = Arc<Array2<bool>>;

pub struct MaskPublisher {
    connection: Arc<BrokerConnection>,
}

impl MaskPublisher {
    pub fn new(connection: Arc<BrokerConnection>) -> Self {
        Self { connection }
    }

    fn send(&self, message: ControlMessage) -> Result<(), BrokerError> {
        publish(&self.connection, MASK_CHANNEL, &message.to_mask_payload())
    }

    pub fn add(&self, region: Rect) -> Result<(), BrokerError> {
        self.send(ControlMessage::AddRegion(region))
    }

    pub fn erase(&self, region: Rect) -> Result<(), BrokerError> {
        self.send(ControlMessage::EraseRegion(region))
    }

    pub fn set(&self, mask: &Array2<bool>) -> Result<(), BrokerError> {
        self.send(ControlMessage::Replace(encode_mask(mask)))
    }

    pub fn remove(&self) -> Result<(), BrokerError> {
        self.send(ControlMessage::Remove)
    }
}

/// Apply mask actions in order.
///
/// `Replace` and `Remove` start a new baseline; regions are painted on top
/// of whatever baseline is current, starting from an empty mask of `shape`
/// if there is none. The input mask is never modified in place.
pub fn fold_mask<I>(
    current: Option<ImageMask>,
    messages: I,
    shape: (usize, usize),
    logger: &LogManager,
) -> Option<ImageMask>
where
    I: IntoIterator<Item = ControlMessage>,
{
    let mut mask = current;
    for message in messages {
        match message {
            ControlMessage::Replace(bytes) => match decode_mask(&bytes) {
                Ok(decoded) => mask = Some(Arc::new(decoded)),
                Err(err) => logger.warn(&format!("ignoring mask set: {err}")),
            },
            ControlMessage::Remove => mask = None,
            ControlMessage::AddRegion(rect) => paint(&mut mask, rect, true, shape),
            ControlMessage::EraseRegion(rect) => paint(&mut mask, rect, false, shape),
        }
    }
    mask
}

fn paint(mask: &mut Option<ImageMask>, rect: Rect, value: bool, shape: (usize, usize)) {
    let shared = mask.get_or_insert_with(|| Arc::new(Array2::from_elem(shape, false)));
    let target = Arc::make_mut(shared);
    if let Some((rows, cols)) = rect.clip(target.dim()) {
        target.slice_mut(s![rows, cols]).fill(value);
    }
}

pub struct MaskSubscriber {
    channel: ChannelSubscriber,
    logger: LogManager,
}

impl MaskSubscriber {
    pub fn new(connection: Arc<BrokerConnection>, logger: LogManager) -> Self {
        Self {
            channel: ChannelSubscriber::new(connection, MASK_CHANNEL),
            logger,
        }
    }

    pub fn connect(&mut self) -> Result<(), BrokerError> {
        self.channel.connect()
    }

    pub fn update(
        &mut self,
        current: Option<ImageMask>,
        shape: (usize, usize),
    ) -> ChannelUpdate<Option<ImageMask>> {
        let drained = self.channel.drain();
        let logger = &self.logger;
        let decoded = drained.messages.into_iter().filter_map(|message| {
            ControlMessage::from_mask_payload(&message.payload)
                .map_err(|err| logger.warn(&format!("ignoring mask message: {err}")))
                .ok()
        });
        ChannelUpdate {
            state: fold_mask(current, decoded, shape, logger),
            error: drained.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logger() -> LogManager {
        LogManager::new("test")
    }

    #[test]
    fn add_paints_region_on_empty_mask() {
        let mask = fold_mask(
            None,
            [ControlMessage::AddRegion(Rect::new(10, 10, 5, 5))],
            (100, 100),
            &logger(),
        )
        .unwrap();
        assert_eq!(mask.iter().filter(|&&m| m).count(), 25);
        assert!(mask[[10, 10]] && mask[[14, 14]]);
        assert!(!mask[[15, 14]] && !mask[[9, 10]]);
    }

    #[test]
    fn set_resets_baseline() {
        let mut baseline = Array2::from_elem((4, 4), false);
        baseline[[0, 0]] = true;
        let set = ControlMessage::Replace(encode_mask(&baseline));
        let mask = fold_mask(
            None,
            [
                set.clone(),
                ControlMessage::AddRegion(Rect::new(1, 1, 2, 2)),
                ControlMessage::EraseRegion(Rect::new(0, 0, 1, 1)),
                set,
            ],
            (4, 4),
            &logger(),
        )
        .unwrap();
        assert_eq!(*mask, baseline);
    }

    #[test]
    fn does_not_touch_the_shared_mask() {
        let shared = Arc::new(Array2::from_elem((3, 3), false));
        let updated = fold_mask(
            Some(Arc::clone(&shared)),
            [ControlMessage::AddRegion(Rect::new(0, 0, 1, 1))],
            (3, 3),
            &logger(),
        )
        .unwrap();
        assert!(updated[[0, 0]]);
        assert!(!shared[[0, 0]]);
    }

    #[test]
    fn remove_then_erase_starts_from_empty() {
        let mask = fold_mask(
            Some(Arc::new(Array2::from_elem((2, 2), true))),
            [
                ControlMessage::Remove,
                ControlMessage::EraseRegion(Rect::new(0, 0, 1, 1)),
            ],
            (2, 2),
            &logger(),
        )
        .unwrap();
        assert!(mask.iter().all(|&m| !m));
    }
}
