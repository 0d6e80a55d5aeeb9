//! Outbox repository for `SQLite` persistence.
//!
//! Claiming an entry is a conditional single-statement update: the lease
//! predicate is re-checked inside the `UPDATE`, so two racing workers can
//! never both win, and `attempt_count` moves only on a won claim.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::outbox::{NotificationPayload, OutboxEntry, OutboxStatus};
use crate::{RelayError, Result};

use super::db::Database;
use super::{parse_opt_ts, parse_ts};

/// Repository for outbox records.
#[derive(Clone)]
pub struct OutboxRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct OutboxRow {
    id: String,
    channel: String,
    recipient: String,
    message_id: String,
    body: String,
    attachment: Option<String>,
    status: String,
    attempt_count: i64,
    next_attempt_at: String,
    locked_at: Option<String>,
    last_error: Option<String>,
    created_at: String,
    delivered_at: Option<String>,
}

impl OutboxRow {
    fn into_entry(self) -> Result<OutboxEntry> {
        let attempt_count = u32::try_from(self.attempt_count)
            .map_err(|e| RelayError::Db(format!("invalid attempt_count: {e}")))?;

        Ok(OutboxEntry {
            id: self.id,
            channel: self.channel,
            recipient: self.recipient,
            payload: NotificationPayload {
                message_id: self.message_id,
                body: self.body,
                attachment: self.attachment,
            },
            status: parse_outbox_status(&self.status)?,
            attempt_count,
            next_attempt_at: parse_ts("next_attempt_at", &self.next_attempt_at)?,
            locked_at: parse_opt_ts("locked_at", self.locked_at.as_deref())?,
            last_error: self.last_error,
            created_at: parse_ts("created_at", &self.created_at)?,
            delivered_at: parse_opt_ts("delivered_at", self.delivered_at.as_deref())?,
        })
    }
}

fn parse_outbox_status(s: &str) -> Result<OutboxStatus> {
    match s {
        "pending" => Ok(OutboxStatus::Pending),
        "delivered" => Ok(OutboxStatus::Delivered),
        "failed" => Ok(OutboxStatus::Failed),
        other => Err(RelayError::Db(format!("invalid outbox status: {other}"))),
    }
}

fn outbox_status_str(status: OutboxStatus) -> &'static str {
    match status {
        OutboxStatus::Pending => "pending",
        OutboxStatus::Delivered => "delivered",
        OutboxStatus::Failed => "failed",
    }
}

const OUTBOX_COLUMNS: &str = "id, channel, recipient, message_id, body, attachment, status, \
     attempt_count, next_attempt_at, locked_at, last_error, created_at, delivered_at";

impl OutboxRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Persist an entry for delivery. Idempotent on `message_id`: enqueuing
    /// the same dedup key twice returns the already-stored entry.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Db` if the insert fails.
    pub async fn enqueue(&self, entry: &OutboxEntry) -> Result<OutboxEntry> {
        sqlx::query(
            "INSERT OR IGNORE INTO outbox (id, channel, recipient, message_id, body, \
             attachment, status, attempt_count, next_attempt_at, locked_at, last_error, \
             created_at, delivered_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )
        .bind(&entry.id)
        .bind(&entry.channel)
        .bind(&entry.recipient)
        .bind(&entry.payload.message_id)
        .bind(&entry.payload.body)
        .bind(&entry.payload.attachment)
        .bind(outbox_status_str(entry.status))
        .bind(i64::from(entry.attempt_count))
        .bind(entry.next_attempt_at.to_rfc3339())
        .bind(entry.locked_at.map(|t| t.to_rfc3339()))
        .bind(&entry.last_error)
        .bind(entry.created_at.to_rfc3339())
        .bind(entry.delivered_at.map(|t| t.to_rfc3339()))
        .execute(self.db.as_ref())
        .await?;

        let stored = self.find_by_message_id(&entry.payload.message_id).await?;
        stored.ok_or_else(|| RelayError::Db(format!("failed to enqueue entry {}", entry.id)))
    }

    /// Look up an entry by identifier.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Db` if the query fails.
    pub async fn find(&self, id: &str) -> Result<Option<OutboxEntry>> {
        let row: Option<OutboxRow> =
            sqlx::query_as(&format!("SELECT {OUTBOX_COLUMNS} FROM outbox WHERE id = ?1"))
                .bind(id)
                .fetch_optional(self.db.as_ref())
                .await?;
        row.map(OutboxRow::into_entry).transpose()
    }

    /// Look up an entry by dedup key.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Db` if the query fails.
    pub async fn find_by_message_id(&self, message_id: &str) -> Result<Option<OutboxEntry>> {
        let row: Option<OutboxRow> = sqlx::query_as(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE message_id = ?1"
        ))
        .bind(message_id)
        .fetch_optional(self.db.as_ref())
        .await?;
        row.map(OutboxRow::into_entry).transpose()
    }

    /// Pick the oldest pending entry that is due and not under a live lease.
    ///
    /// `lease_cutoff` is `now - lease_timeout`; a `locked_at` older than it
    /// counts as an expired lease from a crashed worker.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Db` if the query fails.
    pub async fn next_eligible(
        &self,
        now: DateTime<Utc>,
        lease_cutoff: DateTime<Utc>,
    ) -> Result<Option<OutboxEntry>> {
        let row: Option<OutboxRow> = sqlx::query_as(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox \
             WHERE status = 'pending' AND next_attempt_at <= ?1 \
               AND (locked_at IS NULL OR locked_at < ?2) \
             ORDER BY created_at ASC, id ASC \
             LIMIT 1"
        ))
        .bind(now.to_rfc3339())
        .bind(lease_cutoff.to_rfc3339())
        .fetch_optional(self.db.as_ref())
        .await?;
        row.map(OutboxRow::into_entry).transpose()
    }

    /// Atomically take the delivery lease on an entry and count the attempt.
    ///
    /// The eligibility predicate is re-checked inside the update, so a
    /// worker that lost the race leaves the row untouched.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::LeaseConflict` if another worker holds an
    /// unexpired lease or already moved the entry on, and `RelayError::Db`
    /// if the update fails.
    pub async fn claim(
        &self,
        id: &str,
        now: DateTime<Utc>,
        lease_cutoff: DateTime<Utc>,
    ) -> Result<OutboxEntry> {
        let result = sqlx::query(
            "UPDATE outbox SET locked_at = ?2, attempt_count = attempt_count + 1 \
             WHERE id = ?1 AND status = 'pending' AND next_attempt_at <= ?2 \
               AND (locked_at IS NULL OR locked_at < ?3)",
        )
        .bind(id)
        .bind(now.to_rfc3339())
        .bind(lease_cutoff.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(RelayError::LeaseConflict);
        }

        let claimed = self.find(id).await?;
        claimed.ok_or_else(|| RelayError::Db(format!("claimed entry {id} disappeared")))
    }

    /// Mark an entry delivered and release its lease. Terminal.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Db` if the entry is not pending (terminal
    /// states are never mutated) or the update fails.
    pub async fn mark_delivered(&self, id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE outbox SET status = 'delivered', delivered_at = ?2, locked_at = NULL \
             WHERE id = ?1 AND status = 'pending'",
        )
        .bind(id)
        .bind(&now)
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(RelayError::Db(format!("entry {id} is not pending")));
        }
        Ok(())
    }

    /// Push an entry's next attempt into the future and release its lease.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Db` if the entry is not pending or the update
    /// fails.
    pub async fn reschedule(
        &self,
        id: &str,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE outbox SET next_attempt_at = ?2, last_error = ?3, locked_at = NULL \
             WHERE id = ?1 AND status = 'pending'",
        )
        .bind(id)
        .bind(next_attempt_at.to_rfc3339())
        .bind(error)
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(RelayError::Db(format!("entry {id} is not pending")));
        }
        Ok(())
    }

    /// Mark an entry failed and release its lease. Terminal.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Db` if the entry is not pending or the update
    /// fails.
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE outbox SET status = 'failed', last_error = ?2, locked_at = NULL \
             WHERE id = ?1 AND status = 'pending'",
        )
        .bind(id)
        .bind(error)
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(RelayError::Db(format!("entry {id} is not pending")));
        }
        Ok(())
    }

    /// Count entries still awaiting delivery.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Db` if the query fails.
    pub async fn count_pending(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox WHERE status = 'pending'")
            .fetch_one(self.db.as_ref())
            .await?;
        Ok(count.unsigned_abs())
    }

    /// Purge delivered entries older than `before`. Failed entries are kept
    /// for operator review and never purged here.
    ///
    /// Returns the number of rows deleted.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Db` if the delete fails.
    pub async fn purge_delivered(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM outbox WHERE status = 'delivered' AND delivered_at < ?1",
        )
        .bind(before.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected())
    }
}
