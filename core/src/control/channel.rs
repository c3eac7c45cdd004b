use crate::control::broker::{BrokerConnection, BrokerError, Message, Subscription};
use std::sync::Arc;

/// Messages read by one [`ChannelSubscriber::drain`].
///
/// When the subscription broke partway, `messages` still holds what arrived
/// before the failure and `error` says why the rest is missing.
#[derive(Debug, Default)]
pub struct Drain {
    pub messages: Vec<Message>,
    pub error: Option<BrokerError>,
}

/// Channel state after a drain, plus the broker error that cut it short.
#[derive(Debug)]
pub struct ChannelUpdate<T> {
    pub state: T,
    pub error: Option<BrokerError>,
}

/// Consumer end of one logical channel (or channel pattern).
pub struct ChannelSubscriber {
    connection: Arc<BrokerConnection>,
    pattern: &'static str,
    subscription: Option<Box<dyn Subscription>>,
}

impl ChannelSubscriber {
    pub fn new(connection: Arc<BrokerConnection>, pattern: &'static str) -> Self {
        Self {
            connection,
            pattern,
            subscription: None,
        }
    }

    pub fn pattern(&self) -> &'static str {
        self.pattern
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    /// Subscribe unless already subscribed. Only messages published after
    /// this point are received.
    pub fn connect(&mut self) -> Result<(), BrokerError> {
        if self.subscription.is_none() {
            let broker = self.connection.connect()?;
            match broker.subscribe(self.pattern) {
                Ok(subscription) => self.subscription = Some(subscription),
                Err(err) => {
                    self.connection.reset();
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Drop the subscription and the underlying handle; the next `drain`
    /// reconnects.
    pub fn reset(&mut self) {
        self.subscription = None;
        self.connection.reset();
    }

    /// Everything buffered right now, in publication order. Never waits.
    pub fn drain(&mut self) -> Drain {
        if let Err(err) = self.connect() {
            return Drain {
                messages: Vec::new(),
                error: Some(err),
            };
        }
        let mut drained = Drain::default();
        if let Some(subscription) = self.subscription.as_mut() {
            loop {
                match subscription.try_next() {
                    Ok(Some(message)) => drained.messages.push(message),
                    Ok(None) => break,
                    Err(err) => {
                        drained.error = Some(err);
                        break;
                    }
                }
            }
        }
        if drained.error.is_some() {
            self.reset();
        }
        drained
    }
}

/// Publish on `channel`, dropping the handle if it turned out to be dead.
pub fn publish(
    connection: &BrokerConnection,
    channel: &str,
    payload: &[u8],
) -> Result<(), BrokerError> {
    let result = connection
        .connect()
        .and_then(|broker| broker.publish(channel, payload));
    if result.is_err() {
        connection.reset();
    }
    result.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::control::broker::{Broker, Connector};
    use crate::control::mask::{MaskSubscriber, MASK_CHANNEL};
    use crate::control::message::ControlMessage;
    use crate::math::region::Rect;
    use crate::telemetry::log::LogManager;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type Step = Result<Option<Message>, BrokerError>;

    /// Subscription that replays a fixed sequence of reads.
    struct Replay(VecDeque<Step>);

    impl Subscription for Replay {
        fn try_next(&mut self) -> Step {
            self.0.pop_front().unwrap_or(Ok(None))
        }
    }

    struct ReplayBroker {
        steps: Mutex<Option<Vec<Step>>>,
    }

    impl Broker for ReplayBroker {
        fn publish(&self, _: &str, _: &[u8]) -> Result<usize, BrokerError> {
            Ok(0)
        }

        fn subscribe(&self, _: &str) -> Result<Box<dyn Subscription>, BrokerError> {
            let steps = self.steps.lock().unwrap().take().unwrap_or_default();
            Ok(Box::new(Replay(steps.into())))
        }

        fn set(&self, _: &str, _: &[u8]) -> Result<(), BrokerError> {
            Ok(())
        }

        fn get(&self, _: &str) -> Result<Option<Vec<u8>>, BrokerError> {
            Ok(None)
        }
    }

    struct ReplayConnector(Arc<ReplayBroker>);

    impl Connector for ReplayConnector {
        fn connect(&self, _: &BrokerConfig) -> Result<Arc<dyn Broker>, BrokerError> {
            let broker: Arc<dyn Broker> = self.0.clone();
            Ok(broker)
        }
    }

    fn connection(steps: Vec<Step>) -> Arc<BrokerConnection> {
        let broker = Arc::new(ReplayBroker {
            steps: Mutex::new(Some(steps)),
        });
        Arc::new(BrokerConnection::new(
            BrokerConfig::default(),
            Arc::new(ReplayConnector(broker)),
        ))
    }

    fn mask_message(message: ControlMessage) -> Step {
        Ok(Some(Message {
            channel: MASK_CHANNEL.into(),
            payload: message.to_mask_payload(),
        }))
    }

    #[test]
    fn drain_keeps_messages_read_before_a_failure() {
        let conn = connection(vec![
            mask_message(ControlMessage::Remove),
            Err(BrokerError::ConnectionLost),
            mask_message(ControlMessage::Remove),
        ]);
        let mut channel = ChannelSubscriber::new(Arc::clone(&conn), MASK_CHANNEL);

        let drained = channel.drain();
        assert_eq!(drained.messages.len(), 1);
        assert_eq!(drained.error, Some(BrokerError::ConnectionLost));
        assert!(!channel.is_subscribed());
        assert!(!conn.is_connected());
    }

    #[test]
    fn mask_edit_before_a_failure_is_applied() {
        let conn = connection(vec![
            mask_message(ControlMessage::AddRegion(Rect::new(0, 0, 2, 2))),
            Err(BrokerError::ConnectionLost),
        ]);
        let mut subscriber = MaskSubscriber::new(conn, LogManager::new("mask-test"));

        let update = subscriber.update(None, (4, 4));
        assert_eq!(update.error, Some(BrokerError::ConnectionLost));
        let mask = update.state.unwrap();
        assert_eq!(mask.iter().filter(|m| **m).count(), 4);
    }
}
