//! Consumer-group reader for the transaction stream.
//!
//! Each consumer belongs to the shared group, so entries are split across
//! workers. An entry is acknowledged only after its handler succeeds; a
//! failure leaves it pending for `recover_pending` on some worker.

use crate::{
    config::BrokerConfig,
    error::{PipelineError, PipelineResult},
    producer::DATA_FIELD,
    stream::{PendingSummary, StartId, StreamBroker, StreamEntry, StreamId},
    transaction::Transaction,
};
use std::time::Duration;
use tokio::sync::watch;

const PROGRESS_EVERY: u64 = 100;

/// Per-transaction processing hook.
pub trait TransactionHandler: Send + Sync {
    fn process_transaction(&self, tx: &Transaction) -> PipelineResult<()>;
}

impl<F> TransactionHandler for F
where
    F: Fn(&Transaction) -> PipelineResult<()> + Send + Sync,
{
    fn process_transaction(&self, tx: &Transaction) -> PipelineResult<()> {
        self(tx)
    }
}

pub struct TransactionConsumer {
    broker: StreamBroker,
    stream_name: String,
    group_name: String,
    consumer_name: String,
    block: Duration,
}

impl TransactionConsumer {
    /// Join (or create) the configured consumer group.
    pub fn new(
        broker: StreamBroker,
        config: &BrokerConfig,
        consumer_name: impl Into<String>,
    ) -> PipelineResult<Self> {
        let consumer = Self {
            broker,
            stream_name: config.stream_name.clone(),
            group_name: config.consumer_group.clone(),
            consumer_name: consumer_name.into(),
            block: Duration::from_millis(1000),
        };
        consumer.ensure_group()?;
        Ok(consumer)
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    fn ensure_group(&self) -> PipelineResult<()> {
        match self
            .broker
            .xgroup_create(&self.stream_name, &self.group_name, StartId::Beginning, true)
        {
            Ok(()) => {
                log::info!(
                    "Created consumer group {} on {}",
                    self.group_name,
                    self.stream_name
                );
                Ok(())
            }
            Err(PipelineError::BusyGroup { .. }) => {
                log::debug!("Consumer group {} already exists", self.group_name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Decode entries; undecodable ones are acknowledged and dropped so they
    /// are never redelivered.
    fn decode(&self, entries: Vec<StreamEntry>) -> PipelineResult<Vec<(StreamId, Transaction)>> {
        let mut messages = Vec::with_capacity(entries.len());
        for entry in entries {
            let parsed = entry
                .fields
                .get(DATA_FIELD)
                .map(|data| serde_json::from_str::<Transaction>(data));
            match parsed {
                Some(Ok(tx)) => messages.push((entry.id, tx)),
                Some(Err(e)) => {
                    log::warn!("Dropping malformed message {} on {}: {e}", entry.id, self.stream_name);
                    self.acknowledge_message(entry.id)?;
                }
                None => {
                    log::warn!("Dropping message {} without {DATA_FIELD} field", entry.id);
                    self.acknowledge_message(entry.id)?;
                }
            }
        }
        Ok(messages)
    }

    /// Read up to `count` new messages, waiting up to `block` for any.
    pub async fn consume_messages(
        &self,
        count: usize,
        block: Option<Duration>,
    ) -> PipelineResult<Vec<(StreamId, Transaction)>> {
        let entries = self
            .broker
            .xreadgroup(
                &self.stream_name,
                &self.group_name,
                &self.consumer_name,
                count,
                block,
            )
            .await?;
        self.decode(entries)
    }

    /// Returns false when the id was not pending.
    pub fn acknowledge_message(&self, id: StreamId) -> PipelineResult<bool> {
        let acked = self
            .broker
            .xack(&self.stream_name, &self.group_name, &[id])?;
        Ok(acked == 1)
    }

    pub fn get_pending_messages(&self) -> PipelineResult<PendingSummary> {
        self.broker.xpending(&self.stream_name, &self.group_name)
    }

    fn handle_batch<H>(
        &self,
        handler: &H,
        messages: Vec<(StreamId, Transaction)>,
        processed: &mut u64,
    ) -> PipelineResult<()>
    where
        H: TransactionHandler + ?Sized,
    {
        for (id, tx) in messages {
            match handler.process_transaction(&tx) {
                Ok(()) => {
                    self.acknowledge_message(id)?;
                    *processed += 1;
                    if *processed % PROGRESS_EVERY == 0 {
                        log::info!("{}: processed {} messages", self.consumer_name, processed);
                    }
                }
                Err(e) => {
                    log::error!(
                        "{}: error processing message {id} ({}): {e}",
                        self.consumer_name,
                        tx.transaction_id
                    );
                }
            }
        }
        Ok(())
    }

    /// Consume until `shutdown` flips to true. Returns messages processed.
    pub async fn start_consuming<H>(
        &self,
        handler: &H,
        batch_size: usize,
        mut shutdown: watch::Receiver<bool>,
    ) -> PipelineResult<u64>
    where
        H: TransactionHandler + ?Sized,
    {
        log::info!(
            "Starting consumer {} (group {}, stream {})",
            self.consumer_name,
            self.group_name,
            self.stream_name
        );
        let mut processed = 0u64;

        loop {
            if *shutdown.borrow() {
                break;
            }
            let read = tokio::select! {
                res = self.consume_messages(batch_size, Some(self.block)) => Some(res),
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    None
                }
            };
            let messages = match read {
                Some(Ok(messages)) => messages,
                Some(Err(e)) => {
                    log::error!("{}: error in consumer loop: {e}", self.consumer_name);
                    tokio::time::sleep(self.block).await;
                    continue;
                }
                None => continue,
            };
            self.handle_batch(handler, messages, &mut processed)?;
        }

        log::info!(
            "Consumer {} stopped after {processed} messages",
            self.consumer_name
        );
        Ok(processed)
    }

    /// Process everything not yet delivered to the group, without waiting
    /// for new entries. Returns messages processed.
    pub fn process_available<H>(&self, handler: &H, batch_size: usize) -> PipelineResult<u64>
    where
        H: TransactionHandler + ?Sized,
    {
        let mut processed = 0;
        loop {
            let entries = self.broker.read_new(
                &self.stream_name,
                &self.group_name,
                &self.consumer_name,
                batch_size,
            )?;
            if entries.is_empty() {
                break;
            }
            let messages = self.decode(entries)?;
            self.handle_batch(handler, messages, &mut processed)?;
        }
        Ok(processed)
    }

    /// Claim entries other consumers left pending for at least `min_idle`
    /// and run them through `handler`. Returns messages processed.
    pub fn recover_pending<H>(&self, handler: &H, min_idle: Duration) -> PipelineResult<u64>
    where
        H: TransactionHandler + ?Sized,
    {
        let claimed = self.broker.xautoclaim(
            &self.stream_name,
            &self.group_name,
            &self.consumer_name,
            min_idle,
            0,
        )?;
        if claimed.is_empty() {
            return Ok(0);
        }
        log::info!(
            "{}: reclaimed {} pending messages",
            self.consumer_name,
            claimed.len()
        );
        let messages = self.decode(claimed)?;
        let mut processed = 0;
        self.handle_batch(handler, messages, &mut processed)?;
        Ok(processed)
    }
}
