//! Work distribution: getting run ids from the orchestrator to workers.
//!
//! Two backends share the WorkPublisher contract:
//!   - LocalQueue: bounded in-process channel; publishers block when full.
//!   - BrokerPublisher: groups run ids into messages on a MessageBroker,
//!     optionally stamped with a worker index for static partitioning.
//!
//! RULE: Delivery is at-least-once. A run id may reach several workers;
//! the atomic claim in the store is what prevents double execution.

use crate::{
    error::{SimError, SimResult},
    store::SimStore,
    types::{BatchId, RunId},
};
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Payload of one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BatchMessage {
    pub run_ids: Vec<RunId>,
    pub worker_index: Option<u32>,
}

impl BatchMessage {
    pub fn new(run_ids: Vec<RunId>) -> Self {
        Self {
            run_ids,
            worker_index: None,
        }
    }
}

pub trait WorkPublisher: Send + Sync {
    fn publish(&self, batch_id: &str, run_ids: &[RunId]) -> SimResult<()>;
}

/// Split run ids into messages of at most `batch_size`, stamping message
/// `i` with worker `i % worker_count` when more than one worker is declared.
pub fn partition_messages(run_ids: &[RunId], batch_size: usize, worker_count: u32) -> Vec<BatchMessage> {
    run_ids
        .chunks(batch_size.max(1))
        .enumerate()
        .map(|(i, chunk)| BatchMessage {
            run_ids: chunk.to_vec(),
            worker_index: (worker_count > 1).then(|| i as u32 % worker_count),
        })
        .collect()
}

// ── Local queue ────────────────────────────────────────────────

#[derive(Clone)]
pub struct LocalQueue {
    sender: Sender<BatchMessage>,
    receiver: Receiver<BatchMessage>,
}

impl LocalQueue {
    pub fn bounded(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));
        Self { sender, receiver }
    }

    pub fn receiver(&self) -> Receiver<BatchMessage> {
        self.receiver.clone()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl WorkPublisher for LocalQueue {
    /// One message per run so consumers pick runs up individually.
    fn publish(&self, batch_id: &str, run_ids: &[RunId]) -> SimResult<()> {
        for run_id in run_ids {
            self.sender
                .send(BatchMessage::new(vec![run_id.clone()]))
                .map_err(|_| SimError::QueueClosed)?;
        }
        log::debug!("batch {batch_id}: queued {} runs locally", run_ids.len());
        Ok(())
    }
}

// ── Broker ─────────────────────────────────────────────────────

/// A leased message. Must be acked or nacked; otherwise it is redelivered
/// once the lease lapses.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub id: i64,
    pub batch_id: BatchId,
    pub message: BatchMessage,
    pub delivery_count: u32,
}

pub trait MessageBroker: Send + Sync {
    fn publish(&self, batch_id: &str, message: &BatchMessage) -> SimResult<()>;
    /// Lease up to `max` messages. May return fewer, or none.
    fn receive(&self, max: u32) -> SimResult<Vec<Delivery>>;
    fn ack(&self, delivery: &Delivery) -> SimResult<()>;
    /// Give the message back for another delivery.
    fn nack(&self, delivery: &Delivery) -> SimResult<()>;
}

pub struct BrokerPublisher {
    broker: Arc<dyn MessageBroker>,
    message_batch_size: usize,
    worker_count: u32,
}

impl BrokerPublisher {
    pub fn new(broker: Arc<dyn MessageBroker>, message_batch_size: usize, worker_count: u32) -> Self {
        Self {
            broker,
            message_batch_size,
            worker_count,
        }
    }
}

impl WorkPublisher for BrokerPublisher {
    fn publish(&self, batch_id: &str, run_ids: &[RunId]) -> SimResult<()> {
        let messages = partition_messages(run_ids, self.message_batch_size, self.worker_count);
        for message in &messages {
            self.broker.publish(batch_id, message)?;
        }
        log::debug!(
            "batch {batch_id}: published {} runs in {} messages",
            run_ids.len(),
            messages.len()
        );
        Ok(())
    }
}

/// Broker over the `batch_message` table. Processes sharing the database
/// file share the queue.
pub struct SqliteBroker {
    store: SimStore,
    visibility_timeout: Duration,
    redelivery_delay: Duration,
}

impl SqliteBroker {
    pub fn new(store: SimStore, visibility_timeout: Duration) -> Self {
        Self {
            store,
            visibility_timeout,
            redelivery_delay: Duration::ZERO,
        }
    }

    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

impl MessageBroker for SqliteBroker {
    fn publish(&self, batch_id: &str, message: &BatchMessage) -> SimResult<()> {
        let payload = serde_json::to_string(message)?;
        self.store.enqueue_message(batch_id, &payload)?;
        Ok(())
    }

    fn receive(&self, max: u32) -> SimResult<Vec<Delivery>> {
        let leased = self.store.lease_messages(
            max,
            Self::now_ms(),
            self.visibility_timeout.as_millis() as i64,
        )?;
        let mut deliveries = Vec::with_capacity(leased.len());
        for stored in leased {
            match serde_json::from_str::<BatchMessage>(&stored.payload_json) {
                Ok(message) => deliveries.push(Delivery {
                    id: stored.id,
                    batch_id: stored.batch_id,
                    message,
                    delivery_count: stored.delivery_count,
                }),
                Err(e) => {
                    // Unreadable forever; drop it instead of redelivering.
                    log::warn!("dropping malformed message {}: {e}", stored.id);
                    self.store.ack_message(stored.id)?;
                }
            }
        }
        Ok(deliveries)
    }

    fn ack(&self, delivery: &Delivery) -> SimResult<()> {
        self.store.ack_message(delivery.id)
    }

    fn nack(&self, delivery: &Delivery) -> SimResult<()> {
        let visible_at = Self::now_ms() + self.redelivery_delay.as_millis() as i64;
        self.store.nack_message(delivery.id, visible_at)
    }
}

// ── Worker filter ──────────────────────────────────────────────

/// Static partition check. A message addressed to another worker index is
/// treated as consumed: the caller acks and drops it without claiming.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerFilter {
    worker_index: Option<u32>,
}

impl WorkerFilter {
    pub fn new(worker_index: Option<u32>) -> Self {
        Self { worker_index }
    }

    pub fn accepts(&self, message: &BatchMessage) -> bool {
        match (self.worker_index, message.worker_index) {
            (Some(mine), Some(target)) => mine == target,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<RunId> {
        (0..n).map(|i| format!("run-{i}")).collect()
    }

    #[test]
    fn partition_stamps_worker_indices_round_robin() {
        let messages = partition_messages(&ids(7), 3, 2);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].run_ids.len(), 3);
        assert_eq!(messages[2].run_ids, vec!["run-6".to_string()]);
        let indices: Vec<_> = messages.iter().map(|m| m.worker_index).collect();
        assert_eq!(indices, vec![Some(0), Some(1), Some(0)]);
    }

    #[test]
    fn single_worker_leaves_messages_unstamped() {
        let messages = partition_messages(&ids(4), 10, 1);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].worker_index, None);
    }

    #[test]
    fn filter_drops_messages_for_other_workers() {
        let filter = WorkerFilter::new(Some(1));
        let mut message = BatchMessage::new(ids(1));
        assert!(filter.accepts(&message));
        message.worker_index = Some(1);
        assert!(filter.accepts(&message));
        message.worker_index = Some(0);
        assert!(!filter.accepts(&message));
        assert!(WorkerFilter::new(None).accepts(&message));
    }

    #[test]
    fn message_wire_format() {
        let message = BatchMessage {
            run_ids: vec!["a".into()],
            worker_index: Some(2),
        };
        assert_eq!(
            serde_json::to_string(&message).unwrap(),
            r#"{"RunIds":["a"],"WorkerIndex":2}"#
        );
    }

    #[test]
    fn sqlite_broker_redelivers_nacked_messages() {
        let store = SimStore::in_memory().unwrap();
        store.migrate().unwrap();
        let broker = SqliteBroker::new(store, Duration::from_secs(60));
        broker.publish("b", &BatchMessage::new(ids(2))).unwrap();

        let first = broker.receive(5).unwrap();
        assert_eq!(first.len(), 1);
        assert!(broker.receive(5).unwrap().is_empty());
        broker.nack(&first[0]).unwrap();

        let second = broker.receive(5).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].delivery_count, 2);
        broker.ack(&second[0]).unwrap();
        assert!(broker.receive(5).unwrap().is_empty());
    }

    #[test]
    fn local_queue_delivers_one_message_per_run() {
        let queue = LocalQueue::bounded(16);
        queue.publish("b", &ids(3)).unwrap();
        assert_eq!(queue.len(), 3);
        let first = queue.receiver().recv().unwrap();
        assert_eq!(first.run_ids, vec!["run-0".to_string()]);
    }
}
