//! Durable message queue backing the SQLite broker.
//!
//! A receive leases messages by pushing `visible_at` into the future.
//! A lease that is neither acked nor nacked lapses and the message is
//! delivered again.

use super::{now_rfc3339, SimStore};
use crate::{error::SimResult, types::BatchId};
use rusqlite::{params, TransactionBehavior};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: i64,
    pub batch_id: BatchId,
    pub payload_json: String,
    pub delivery_count: u32,
}

impl SimStore {
    pub fn enqueue_message(&self, batch_id: &str, payload_json: &str) -> SimResult<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO batch_message (batch_id, payload_json, status, visible_at, created_at)
             VALUES (?1, ?2, 'ready', 0, ?3)",
            params![batch_id, payload_json, now_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Lease up to `max` visible messages until `now_ms + lease_ms`.
    pub fn lease_messages(&self, max: u32, now_ms: i64, lease_ms: i64) -> SimResult<Vec<StoredMessage>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let leased = {
            let mut select = tx.prepare(
                "SELECT id, batch_id, payload_json, delivery_count FROM batch_message
                 WHERE status IN ('ready', 'in_flight') AND visible_at <= ?1
                 ORDER BY id ASC LIMIT ?2",
            )?;
            let candidates = select
                .query_map(params![now_ms, max], |r| {
                    Ok(StoredMessage {
                        id: r.get(0)?,
                        batch_id: r.get(1)?,
                        payload_json: r.get(2)?,
                        delivery_count: r.get(3)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut lease = tx.prepare(
                "UPDATE batch_message
                 SET status = 'in_flight', delivery_count = delivery_count + 1, visible_at = ?2
                 WHERE id = ?1",
            )?;
            let mut leased = Vec::with_capacity(candidates.len());
            for mut message in candidates {
                lease.execute(params![message.id, now_ms + lease_ms])?;
                message.delivery_count += 1;
                leased.push(message);
            }
            leased
        };
        tx.commit()?;
        Ok(leased)
    }

    pub fn ack_message(&self, id: i64) -> SimResult<()> {
        self.conn()?.execute(
            "UPDATE batch_message SET status = 'acked' WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Release a lease so the message becomes visible again at `visible_at_ms`.
    pub fn nack_message(&self, id: i64, visible_at_ms: i64) -> SimResult<()> {
        self.conn()?.execute(
            "UPDATE batch_message SET status = 'ready', visible_at = ?2
             WHERE id = ?1 AND status = 'in_flight'",
            params![id, visible_at_ms],
        )?;
        Ok(())
    }

    /// Messages not yet acked.
    pub fn outstanding_message_count(&self) -> SimResult<u32> {
        Ok(self.conn()?.query_row(
            "SELECT COUNT(*) FROM batch_message WHERE status != 'acked'",
            [],
            |r| r.get(0),
        )?)
    }
}
