// Ledger DAO. Reads come from the read-only pool; the two writes outside
// the processor transaction (ingest insert, reply mark) go through the
// single-connection write pool.
use sqlx::SqliteConnection;

use crate::model::{Message, NewMessage};
use crate::{Store, StoreResult};

const MESSAGE_COLUMNS: &str = "id, event, request_id, request_payload, response_payload, \
     error_message, success, processed, replied, requested_at, queued_at, processed_at";

impl Store {
    /// At-least-once dedup check: has `(event, request_id)` been persisted
    /// before?
    pub async fn is_message_recorded(&self, event: &str, request_id: &str) -> StoreResult<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE event = ? AND request_id = ?",
        )
        .bind(event)
        .bind(request_id)
        .fetch_one(&self.read)
        .await?;
        Ok(count > 0)
    }

    /// Appends a freshly ingested request with `processed = replied = false`.
    /// The `(event, request_id)` UNIQUE constraint backstops the dedup check.
    pub async fn insert_message(&self, new: &NewMessage) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO messages \
             (event, request_id, request_payload, response_payload, error_message, \
              success, processed, replied, requested_at, queued_at) \
             VALUES (?, ?, ?, '{}', '', 0, 0, 0, ?, ?)",
        )
        .bind(&new.event)
        .bind(&new.request_id)
        .bind(&new.request_payload)
        .bind(new.requested_at)
        .bind(new.queued_at)
        .execute(&self.write)
        .await?;
        Ok(())
    }

    /// The processor's work queue: oldest unprocessed rows first. The `id`
    /// tiebreak keeps same-instant rows in insertion order.
    pub async fn unprocessed_batch(&self, limit: i64) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query_as::<_, Message>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE processed = 0 \
             ORDER BY queued_at ASC, id ASC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.read)
        .await?;
        Ok(rows)
    }

    /// Processed rows still owed a reply.
    pub async fn unreplied_batch(&self, limit: i64) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query_as::<_, Message>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE processed = 1 AND replied = 0 \
             ORDER BY queued_at ASC, id ASC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.read)
        .await?;
        Ok(rows)
    }

    /// Terminalizes the given rows after their replies were published.
    pub async fn mark_replied(&self, ids: &[i64]) -> StoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("UPDATE messages SET replied = 1 WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        query.execute(&self.write).await?;
        Ok(())
    }
}

/// Writes a message's processing outcome back, inside the processor's open
/// batch transaction.
pub async fn update_message(conn: &mut SqliteConnection, msg: &Message) -> StoreResult<()> {
    sqlx::query(
        "UPDATE messages SET response_payload = ?, error_message = ?, success = ?, \
         processed = ?, replied = ?, processed_at = ? WHERE id = ?",
    )
    .bind(&msg.response_payload)
    .bind(&msg.error_message)
    .bind(msg.success)
    .bind(msg.processed)
    .bind(msg.replied)
    .bind(msg.processed_at)
    .bind(msg.id)
    .execute(conn)
    .await?;
    Ok(())
}
