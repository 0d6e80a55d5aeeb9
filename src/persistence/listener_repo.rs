//! Listener subscription repository for `SQLite` persistence.
//!
//! Subscriptions live in the database, not in memory, so a daemon restart
//! never erases an active interest.

use std::sync::Arc;

use crate::models::listener::ListenerSubscription;
use crate::Result;

use super::db::Database;
use super::parse_ts;

/// Repository for listener subscription records.
#[derive(Clone)]
pub struct ListenerRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct ListenerRow {
    target_session_id: String,
    caller_session_id: String,
    transport_ref: String,
    registered_at: String,
}

impl ListenerRow {
    fn into_subscription(self) -> Result<ListenerSubscription> {
        Ok(ListenerSubscription {
            target_session_id: self.target_session_id,
            caller_session_id: self.caller_session_id,
            transport_ref: self.transport_ref,
            registered_at: parse_ts("registered_at", &self.registered_at)?,
        })
    }
}

impl ListenerRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Register a subscription. Registering an existing `(target, caller)`
    /// pair is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Db` if the insert fails.
    pub async fn subscribe(&self, subscription: &ListenerSubscription) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO listener \
             (target_session_id, caller_session_id, transport_ref, registered_at) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&subscription.target_session_id)
        .bind(&subscription.caller_session_id)
        .bind(&subscription.transport_ref)
        .bind(subscription.registered_at.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Remove one subscription pair. Removing an absent pair is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Db` if the delete fails.
    pub async fn unsubscribe(&self, target_session_id: &str, caller_session_id: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM listener \
             WHERE target_session_id = ?1 AND caller_session_id = ?2",
        )
        .bind(target_session_id)
        .bind(caller_session_id)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Remove every subscription held by a caller (invoked on caller close).
    ///
    /// Returns the number of subscriptions removed.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Db` if the delete fails.
    pub async fn unsubscribe_all(&self, caller_session_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM listener WHERE caller_session_id = ?1")
            .bind(caller_session_id)
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected())
    }

    /// List current subscribers for a target, oldest registration first.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Db` if the query fails.
    pub async fn list_for_target(
        &self,
        target_session_id: &str,
    ) -> Result<Vec<ListenerSubscription>> {
        let rows: Vec<ListenerRow> = sqlx::query_as(
            "SELECT target_session_id, caller_session_id, transport_ref, registered_at \
             FROM listener WHERE target_session_id = ?1 \
             ORDER BY registered_at ASC, caller_session_id ASC",
        )
        .bind(target_session_id)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(ListenerRow::into_subscription).collect()
    }
}
