//! Publish/subscribe and key-value access to the control-plane broker.
//!
//! Each process owns its own [`BrokerConnection`]; connection handles are
//! never shared between the control process and a worker.

use crate::config::BrokerConfig;
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker unreachable at {0}")]
    Unreachable(String),
    #[error("broker rejected the credentials")]
    Authentication,
    #[error("broker connection lost")]
    ConnectionLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: String,
    pub payload: Vec<u8>,
}

pub trait Subscription: Send {
    /// Next buffered message, without waiting.
    fn try_next(&mut self) -> Result<Option<Message>, BrokerError>;
}

pub trait Broker: Send + Sync {
    /// Returns the number of subscribers that received the message.
    fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize, BrokerError>;
    /// `pattern` is a channel name, optionally ending in `*` to match a prefix.
    fn subscribe(&self, pattern: &str) -> Result<Box<dyn Subscription>, BrokerError>;
    fn set(&self, key: &str, value: &[u8]) -> Result<(), BrokerError>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BrokerError>;
}

/// Opens broker handles; one implementation per broker backend.
pub trait Connector: Send + Sync {
    fn connect(&self, config: &BrokerConfig) -> Result<Arc<dyn Broker>, BrokerError>;
}

/// Explicitly managed broker connection.
///
/// `connect` either fails or opens the handle once; later calls reuse it
/// until `reset` drops it.
pub struct BrokerConnection {
    config: BrokerConfig,
    connector: Arc<dyn Connector>,
    handle: Mutex<Option<Arc<dyn Broker>>>,
}

impl BrokerConnection {
    pub fn new(config: BrokerConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            handle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<dyn Broker>>> {
        self.handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError> {
        let mut slot = self.slot();
        if let Some(handle) = slot.as_ref() {
            return Ok(Arc::clone(handle));
        }
        let handle = self.connector.connect(&self.config)?;
        *slot = Some(Arc::clone(&handle));
        Ok(handle)
    }

    pub fn is_connected(&self) -> bool {
        self.slot().is_some()
    }

    pub fn reset(&self) {
        self.slot().take();
    }
}

fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

struct Hub {
    online: bool,
    /// Bumped on every outage; handles from an older epoch stay broken.
    epoch: u64,
    password: Option<String>,
    subscribers: Vec<(String, Sender<Message>)>,
    store: HashMap<String, Vec<u8>>,
}

/// Broker living inside the current process, for tests and single-process
/// runs. Clones share the same state, so one instance can serve both the
/// control producer and the worker.
#[derive(Clone)]
pub struct InMemoryBroker {
    hub: Arc<Mutex<Hub>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_password(None)
    }

    pub fn with_password(password: Option<String>) -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub {
                online: true,
                epoch: 0,
                password,
                subscribers: Vec::new(),
                store: HashMap::new(),
            })),
        }
    }

    /// Take the broker down or bring it back. Going down breaks every open
    /// handle and subscription for good.
    pub fn set_online(&self, online: bool) {
        let mut hub = lock(&self.hub);
        if hub.online && !online {
            hub.epoch += 1;
            hub.subscribers.clear();
        }
        hub.online = online;
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(InMemoryConnector {
            broker: self.clone(),
        })
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(hub: &Mutex<Hub>) -> MutexGuard<'_, Hub> {
    hub.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct InMemoryConnector {
    broker: InMemoryBroker,
}

impl Connector for InMemoryConnector {
    fn connect(&self, config: &BrokerConfig) -> Result<Arc<dyn Broker>, BrokerError> {
        let hub = lock(&self.broker.hub);
        if !hub.online {
            return Err(BrokerError::Unreachable(config.address()));
        }
        if hub.password.is_some() && hub.password != config.password {
            return Err(BrokerError::Authentication);
        }
        Ok(Arc::new(InMemoryClient {
            hub: Arc::clone(&self.broker.hub),
            epoch: hub.epoch,
        }))
    }
}

struct InMemoryClient {
    hub: Arc<Mutex<Hub>>,
    epoch: u64,
}

impl InMemoryClient {
    fn live(&self) -> Result<MutexGuard<'_, Hub>, BrokerError> {
        let hub = lock(&self.hub);
        if hub.online && hub.epoch == self.epoch {
            Ok(hub)
        } else {
            Err(BrokerError::ConnectionLost)
        }
    }
}

impl Broker for InMemoryClient {
    fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize, BrokerError> {
        let mut hub = self.live()?;
        let mut delivered = 0;
        hub.subscribers.retain(|(pattern, sender)| {
            if !pattern_matches(pattern, channel) {
                return true;
            }
            let message = Message {
                channel: channel.to_string(),
                payload: payload.to_vec(),
            };
            match sender.send(message) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        Ok(delivered)
    }

    fn subscribe(&self, pattern: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        let mut hub = self.live()?;
        let (sender, receiver) = unbounded();
        hub.subscribers.push((pattern.to_string(), sender));
        Ok(Box::new(InMemorySubscription {
            hub: Arc::clone(&self.hub),
            epoch: self.epoch,
            receiver,
        }))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), BrokerError> {
        self.live()?.store.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BrokerError> {
        Ok(self.live()?.store.get(key).cloned())
    }
}

struct InMemorySubscription {
    hub: Arc<Mutex<Hub>>,
    epoch: u64,
    receiver: Receiver<Message>,
}

impl Subscription for InMemorySubscription {
    fn try_next(&mut self) -> Result<Option<Message>, BrokerError> {
        {
            let hub = lock(&self.hub);
            if !hub.online || hub.epoch != self.epoch {
                return Err(BrokerError::ConnectionLost);
            }
        }
        match self.receiver.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(BrokerError::ConnectionLost),
        }
    }
}
