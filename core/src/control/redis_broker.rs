//! Broker backend on a Redis server, shared by the control process and every
//! worker process.
//!
//! Commands (`PUBLISH`, `SET`, `GET`) travel over one connection per handle.
//! Each subscription owns a further connection in subscriber mode, polled
//! with a short read timeout so a drain never waits for traffic.

use crate::config::BrokerConfig;
use crate::control::broker::{Broker, BrokerError, Connector, Message, Subscription};
use redis::{
    Client, Connection, ConnectionAddr, ConnectionInfo, ErrorKind, Msg, RedisConnectionInfo,
    RedisError, Value,
};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Socket wait of one poll on an idle subscription.
const POLL_WAIT: Duration = Duration::from_millis(1);

/// Dials `BrokerConfig::{host, port}` and authenticates with `password`
/// when one is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedisConnector;

impl RedisConnector {
    pub fn shared() -> Arc<dyn Connector> {
        Arc::new(RedisConnector)
    }
}

fn connection_info(config: &BrokerConfig) -> ConnectionInfo {
    ConnectionInfo {
        addr: ConnectionAddr::Tcp(config.host.clone(), config.port),
        redis: RedisConnectionInfo {
            password: config.password.clone(),
            ..Default::default()
        },
    }
}

fn open_error(err: RedisError, config: &BrokerConfig) -> BrokerError {
    if err.kind() == ErrorKind::AuthenticationFailed {
        BrokerError::Authentication
    } else {
        BrokerError::Unreachable(config.address())
    }
}

fn lost(_: RedisError) -> BrokerError {
    BrokerError::ConnectionLost
}

fn open(client: &Client, config: &BrokerConfig) -> Result<Connection, BrokerError> {
    client
        .get_connection_with_timeout(CONNECT_TIMEOUT)
        .map_err(|err| open_error(err, config))
}

impl Connector for RedisConnector {
    fn connect(&self, config: &BrokerConfig) -> Result<Arc<dyn Broker>, BrokerError> {
        let client =
            Client::open(connection_info(config)).map_err(|err| open_error(err, config))?;
        let commands = open(&client, config)?;
        Ok(Arc::new(RedisBroker {
            client,
            config: config.clone(),
            commands: Mutex::new(commands),
        }))
    }
}

struct RedisBroker {
    client: Client,
    config: BrokerConfig,
    commands: Mutex<Connection>,
}

impl RedisBroker {
    fn commands(&self) -> MutexGuard<'_, Connection> {
        self.commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Broker for RedisBroker {
    fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize, BrokerError> {
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query(&mut *self.commands())
            .map_err(lost)
    }

    fn subscribe(&self, pattern: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        let mut connection = open(&self.client, &self.config)?;
        let verb = if pattern.ends_with('*') {
            "PSUBSCRIBE"
        } else {
            "SUBSCRIBE"
        };
        connection
            .send_packed_command(&redis::cmd(verb).arg(pattern).get_packed_command())
            .map_err(lost)?;
        // the confirmation arrives before any message on this connection
        connection.recv_response().map_err(lost)?;
        connection.set_read_timeout(Some(POLL_WAIT)).map_err(lost)?;
        Ok(Box::new(RedisSubscription { connection }))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), BrokerError> {
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query::<()>(&mut *self.commands())
            .map_err(lost)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BrokerError> {
        redis::cmd("GET")
            .arg(key)
            .query::<Option<Vec<u8>>>(&mut *self.commands())
            .map_err(lost)
    }
}

struct RedisSubscription {
    connection: Connection,
}

/// `message` and `pmessage` pushes; anything else on a subscriber
/// connection is bookkeeping.
fn pubsub_message(value: &Value) -> Option<Message> {
    let msg = Msg::from_value(value)?;
    Some(Message {
        channel: msg.get_channel_name().to_string(),
        payload: msg.get_payload_bytes().to_vec(),
    })
}

impl Subscription for RedisSubscription {
    fn try_next(&mut self) -> Result<Option<Message>, BrokerError> {
        loop {
            match self.connection.recv_response() {
                Ok(value) => {
                    if let Some(message) = pubsub_message(&value) {
                        return Ok(Some(message));
                    }
                }
                Err(err) if err.is_timeout() => return Ok(None),
                Err(err) => return Err(lost(err)),
            }
        }
    }
}
