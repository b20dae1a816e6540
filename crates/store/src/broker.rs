use serde_json::Value;
use waypoint_core::{BrokerMessage, Channel};

use crate::error::StoreResult;

/// Keyed data store with optional publishing.
pub trait Broker: Send + Sync {
    /// Store `data` under `(reference, data_type)`. When `publish` is set the
    /// envelope `{reference, data_type, data}` also goes out on that channel.
    fn store_data(
        &self,
        reference: &str,
        data_type: &str,
        data: &Value,
        publish: Option<Channel>,
    ) -> StoreResult<()>;

    fn retrieve_data(&self, reference: &str, data_type: &str) -> StoreResult<Option<Value>>;

    fn send_message(&self, channel: Channel, message: &BrokerMessage) -> StoreResult<()>;

    /// Write out anything buffered; returns the number of entries written.
    fn flush(&self) -> StoreResult<usize> {
        Ok(0)
    }
}

/// Receives decoded envelopes from a channel subscription.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: BrokerMessage) -> anyhow::Result<()>;
}

pub(crate) fn envelope(reference: &str, data_type: &str, data: &Value) -> BrokerMessage {
    BrokerMessage {
        reference: reference.to_string(),
        data_type: data_type.to_string(),
        data: data.clone(),
    }
}
