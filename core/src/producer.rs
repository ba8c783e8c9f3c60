//! Publishes transactions onto a broker stream.

use crate::{
    error::PipelineResult,
    stream::{Fields, StreamBroker, StreamId, StreamInfo},
    transaction::Transaction,
};
use chrono::{SecondsFormat, Utc};

/// Field name carrying the JSON payload of each entry.
pub const DATA_FIELD: &str = "data";

pub struct TransactionProducer {
    broker: StreamBroker,
    stream_name: String,
    max_len: usize,
}

impl TransactionProducer {
    pub fn new(broker: StreamBroker, stream_name: impl Into<String>) -> Self {
        let stream_name = stream_name.into();
        log::info!("Producer ready on stream {stream_name}");
        Self {
            broker,
            stream_name,
            max_len: 0,
        }
    }

    /// Cap the stream at `max_len` entries after each publish. 0 disables.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    fn publish_payload(&self, payload: String) -> StreamId {
        let mut fields = Fields::new();
        fields.insert(DATA_FIELD.to_string(), payload);
        let id = self.broker.xadd(&self.stream_name, fields);
        if self.max_len > 0 {
            self.broker.xtrim_maxlen(&self.stream_name, self.max_len);
        }
        id
    }

    pub fn publish_transaction(&self, tx: &Transaction) -> PipelineResult<StreamId> {
        let payload = serde_json::to_string(tx)?;
        let id = self.publish_payload(payload);
        log::debug!(
            "Published transaction {} to {}: {id}",
            tx.transaction_id,
            self.stream_name
        );
        Ok(id)
    }

    /// Publish an arbitrary JSON object, stamping `timestamp` with the
    /// current time when the caller left it out.
    pub fn publish_json(&self, mut value: serde_json::Value) -> PipelineResult<StreamId> {
        if let Some(obj) = value.as_object_mut() {
            obj.entry("timestamp").or_insert_with(|| {
                serde_json::Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true))
            });
        }
        Ok(self.publish_payload(serde_json::to_string(&value)?))
    }

    pub fn publish_batch(&self, transactions: &[Transaction]) -> PipelineResult<Vec<StreamId>> {
        let ids = transactions
            .iter()
            .map(|tx| self.publish_transaction(tx))
            .collect::<PipelineResult<Vec<_>>>()?;
        log::info!("Published batch of {} transactions", ids.len());
        Ok(ids)
    }

    pub fn stream_length(&self) -> usize {
        self.broker.xlen(&self.stream_name)
    }

    pub fn stream_info(&self) -> PipelineResult<StreamInfo> {
        self.broker.xinfo(&self.stream_name)
    }
}
