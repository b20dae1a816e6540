//! Redis broker: entries under `{data_type}:{reference}` and envelopes
//! published on the `internal` / `external` channels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use redis::Commands;
use serde_json::Value;
use tracing::{debug, info, warn};
use waypoint_core::config::RedisConfig;
use waypoint_core::{BrokerMessage, Channel, JsonCodec};

use crate::broker::{envelope, Broker, MessageHandler};
use crate::error::StoreResult;

/// How often a blocked subscription wakes up to check for shutdown.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct RedisBroker {
    client: redis::Client,
    connect_timeout: Duration,
}

impl RedisBroker {
    /// Connect and verify the server answers `PING`.
    pub fn new(config: &RedisConfig) -> StoreResult<Self> {
        info!(
            url = %config.url,
            timeout_ms = config.connect_timeout_ms,
            "Connecting to Redis"
        );
        let broker = Self {
            client: redis::Client::open(config.url.as_str())?,
            connect_timeout: config.connect_timeout(),
        };

        let mut conn = broker.connection()?;
        let pong: String = redis::cmd("PING").query(&mut conn)?;
        info!(response = %pong, "Redis connection established");

        Ok(broker)
    }

    pub fn data_key(reference: &str, data_type: &str) -> String {
        format!("{data_type}:{reference}")
    }

    fn connection(&self) -> redis::RedisResult<redis::Connection> {
        self.client.get_connection_with_timeout(self.connect_timeout)
    }

    /// Block on `channel`, decoding each envelope and handing it to `handler`,
    /// until `stop` is set. Undecodable payloads and handler failures are
    /// logged and skipped.
    pub fn listen(
        &self,
        channel: Channel,
        handler: &dyn MessageHandler,
        stop: &AtomicBool,
    ) -> StoreResult<()> {
        let mut conn = self.connection()?;
        let mut pubsub = conn.as_pubsub();
        pubsub.subscribe(channel.as_str())?;
        pubsub.set_read_timeout(Some(STOP_POLL_INTERVAL))?;
        info!(channel = channel.as_str(), "Listening for broker messages");

        while !stop.load(Ordering::SeqCst) {
            let msg = match pubsub.get_message() {
                Ok(msg) => msg,
                Err(e) if e.is_timeout() => continue,
                Err(e) => return Err(e.into()),
            };
            let payload: Vec<u8> = msg.get_payload()?;
            let message = match JsonCodec::decode_message(&payload) {
                Ok(message) => message,
                Err(e) => {
                    warn!(channel = channel.as_str(), error = %e, "Dropping undecodable message");
                    continue;
                }
            };
            debug!(reference = %message.reference, data_type = %message.data_type, "Broker message received");
            if let Err(e) = handler.handle(message) {
                warn!(channel = channel.as_str(), error = %e, "Message handler failed");
            }
        }

        info!(channel = channel.as_str(), "Stopped listening for broker messages");
        Ok(())
    }
}

impl Broker for RedisBroker {
    fn store_data(
        &self,
        reference: &str,
        data_type: &str,
        data: &Value,
        publish: Option<Channel>,
    ) -> StoreResult<()> {
        let mut conn = self.connection()?;
        let mut pipe = redis::pipe();
        pipe.set(Self::data_key(reference, data_type), JsonCodec::encode(data)?)
            .ignore();
        if let Some(channel) = publish {
            let message = JsonCodec::encode_message(&envelope(reference, data_type, data))?;
            pipe.publish(channel.as_str(), message).ignore();
        }
        pipe.query::<()>(&mut conn)?;
        metrics::counter!("store.broker.store").increment(1);
        Ok(())
    }

    fn retrieve_data(&self, reference: &str, data_type: &str) -> StoreResult<Option<Value>> {
        let mut conn = self.connection()?;
        let text: Option<String> = conn.get(Self::data_key(reference, data_type))?;
        match text {
            Some(text) => Ok(Some(JsonCodec::decode(&text)?)),
            None => {
                metrics::counter!("store.broker.miss").increment(1);
                Ok(None)
            }
        }
    }

    fn send_message(&self, channel: Channel, message: &BrokerMessage) -> StoreResult<()> {
        let mut conn = self.connection()?;
        let payload = JsonCodec::encode_message(message)?;
        let _receivers: i64 = conn.publish(channel.as_str(), payload)?;
        Ok(())
    }
}
