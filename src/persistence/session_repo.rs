//! Session repository for `SQLite` persistence.
//!
//! All mutations are single conditional statements so concurrent writers
//! serialize per row; a guard clause that matches zero rows means the row
//! changed under us and the caller gets a precise error instead of a
//! lost update.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::session::{Session, SessionStatus, Visibility};
use crate::{RelayError, Result};

use super::db::Database;
use super::{parse_opt_ts, parse_ts};

/// Repository for session records.
#[derive(Clone)]
pub struct SessionRepo {
    db: Arc<Database>,
}

/// Partial update applied by `update_fields`; `None` leaves a column as is.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    /// New observation scope.
    pub visibility: Option<Visibility>,
    /// New user role.
    pub user_role: Option<String>,
    /// Most recent tool-use event.
    pub last_tool_use_at: Option<DateTime<Utc>>,
    /// Most recent checkpoint event.
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    /// Most recent terminal output.
    pub last_output_at: Option<DateTime<Utc>>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionRow {
    session_id: String,
    computer_name: String,
    status: String,
    created_at: String,
    last_activity: String,
    closed_at: Option<String>,
    native_process_id: Option<i64>,
    pty_device: Option<String>,
    transcript_files: String,
    char_offset: i64,
    working_slug: String,
    visibility: String,
    user_role: String,
    last_tool_use_at: Option<String>,
    last_checkpoint_at: Option<String>,
    last_output_at: Option<String>,
}

impl SessionRow {
    fn into_session(self) -> Result<Session> {
        let native_process_id = self
            .native_process_id
            .map(u32::try_from)
            .transpose()
            .map_err(|e| RelayError::Db(format!("invalid native_process_id: {e}")))?;
        let transcript_files: Vec<String> = serde_json::from_str(&self.transcript_files)
            .map_err(|e| RelayError::Db(format!("invalid transcript_files: {e}")))?;

        Ok(Session {
            session_id: self.session_id,
            computer_name: self.computer_name,
            status: parse_status(&self.status)?,
            created_at: parse_ts("created_at", &self.created_at)?,
            last_activity: parse_ts("last_activity", &self.last_activity)?,
            closed_at: parse_opt_ts("closed_at", self.closed_at.as_deref())?,
            native_process_id,
            pty_device: self.pty_device,
            transcript_files,
            char_offset: self.char_offset,
            working_slug: self.working_slug,
            visibility: parse_visibility(&self.visibility)?,
            user_role: self.user_role,
            last_tool_use_at: parse_opt_ts("last_tool_use_at", self.last_tool_use_at.as_deref())?,
            last_checkpoint_at: parse_opt_ts(
                "last_checkpoint_at",
                self.last_checkpoint_at.as_deref(),
            )?,
            last_output_at: parse_opt_ts("last_output_at", self.last_output_at.as_deref())?,
        })
    }
}

fn parse_status(s: &str) -> Result<SessionStatus> {
    match s {
        "active" => Ok(SessionStatus::Active),
        "closing" => Ok(SessionStatus::Closing),
        "closed" => Ok(SessionStatus::Closed),
        other => Err(RelayError::Db(format!("invalid session status: {other}"))),
    }
}

fn status_str(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Active => "active",
        SessionStatus::Closing => "closing",
        SessionStatus::Closed => "closed",
    }
}

fn parse_visibility(s: &str) -> Result<Visibility> {
    match s {
        "private" => Ok(Visibility::Private),
        "shared" => Ok(Visibility::Shared),
        other => Err(RelayError::Db(format!("invalid visibility: {other}"))),
    }
}

fn visibility_str(visibility: Visibility) -> &'static str {
    match visibility {
        Visibility::Private => "private",
        Visibility::Shared => "shared",
    }
}

const SESSION_COLUMNS: &str = "session_id, computer_name, status, created_at, last_activity, \
     closed_at, native_process_id, pty_device, transcript_files, char_offset, working_slug, \
     visibility, user_role, last_tool_use_at, last_checkpoint_at, last_output_at";

impl SessionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new session record.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Db` if the insert fails (including a duplicate
    /// `session_id`).
    pub async fn create(&self, session: &Session) -> Result<Session> {
        let transcript_files = serde_json::to_string(&session.transcript_files)
            .map_err(|e| RelayError::Db(format!("invalid transcript_files: {e}")))?;

        sqlx::query(
            "INSERT INTO session (session_id, computer_name, status, created_at, last_activity, \
             closed_at, native_process_id, pty_device, transcript_files, char_offset, \
             working_slug, visibility, user_role, last_tool_use_at, last_checkpoint_at, \
             last_output_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        )
        .bind(&session.session_id)
        .bind(&session.computer_name)
        .bind(status_str(session.status))
        .bind(session.created_at.to_rfc3339())
        .bind(session.last_activity.to_rfc3339())
        .bind(session.closed_at.map(|t| t.to_rfc3339()))
        .bind(session.native_process_id.map(i64::from))
        .bind(&session.pty_device)
        .bind(&transcript_files)
        .bind(session.char_offset)
        .bind(&session.working_slug)
        .bind(visibility_str(session.visibility))
        .bind(&session.user_role)
        .bind(session.last_tool_use_at.map(|t| t.to_rfc3339()))
        .bind(session.last_checkpoint_at.map(|t| t.to_rfc3339()))
        .bind(session.last_output_at.map(|t| t.to_rfc3339()))
        .execute(self.db.as_ref())
        .await?;

        Ok(session.clone())
    }

    /// Retrieve a session by identifier.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::SessionNotFound` if the session does not exist.
    pub async fn get(&self, session_id: &str) -> Result<Session> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM session WHERE session_id = ?1"
        ))
        .bind(session_id)
        .fetch_optional(self.db.as_ref())
        .await?;

        row.map_or_else(
            || Err(RelayError::SessionNotFound(session_id.to_owned())),
            SessionRow::into_session,
        )
    }

    /// List all sessions, most recent activity first.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Db` if the query fails.
    pub async fn list_recent(&self) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM session ORDER BY last_activity DESC"
        ))
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(SessionRow::into_session).collect()
    }

    /// List sessions with the given status, most recent activity first.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Db` if the query fails.
    pub async fn list_by_status(&self, status: SessionStatus) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM session WHERE status = ?1 \
             ORDER BY last_activity DESC"
        ))
        .bind(status_str(status))
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(SessionRow::into_session).collect()
    }

    /// List sessions that are not yet closed, most recent activity first.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Db` if the query fails.
    pub async fn list_live(&self) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM session WHERE status != 'closed' \
             ORDER BY last_activity DESC"
        ))
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(SessionRow::into_session).collect()
    }

    /// List sessions stuck in `closing` whose last activity predates `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Db` if the query fails.
    pub async fn list_stuck_closing(&self, cutoff: DateTime<Utc>) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM session \
             WHERE status = 'closing' AND last_activity < ?1 \
             ORDER BY last_activity DESC"
        ))
        .bind(cutoff.to_rfc3339())
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(SessionRow::into_session).collect()
    }

    /// Count sessions with a live agent process.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Db` if the query fails.
    pub async fn count_active(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM session WHERE status = 'active'")
            .fetch_one(self.db.as_ref())
            .await?;
        Ok(count.unsigned_abs())
    }

    /// Apply a lifecycle transition, enforcing the forward-only state machine.
    ///
    /// Reaching `closed` also stamps `closed_at` and detaches the process
    /// linkage, leaving the row as immutable history.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::IllegalTransition` on a disallowed edge (also
    /// when losing a race with a concurrent transition) and
    /// `RelayError::SessionNotFound` if the session does not exist.
    pub async fn transition(&self, session_id: &str, next: SessionStatus) -> Result<Session> {
        let current = self.get(session_id).await?;
        if !current.can_transition_to(next) {
            return Err(RelayError::IllegalTransition {
                from: status_str(current.status).to_owned(),
                to: status_str(next).to_owned(),
            });
        }

        let now = Utc::now().to_rfc3339();
        let result = if next == SessionStatus::Closed {
            sqlx::query(
                "UPDATE session SET status = ?2, last_activity = ?3, closed_at = ?3, \
                 native_process_id = NULL, pty_device = NULL \
                 WHERE session_id = ?1 AND status = ?4",
            )
            .bind(session_id)
            .bind(status_str(next))
            .bind(&now)
            .bind(status_str(current.status))
            .execute(self.db.as_ref())
            .await?
        } else {
            sqlx::query(
                "UPDATE session SET status = ?2, last_activity = ?3 \
                 WHERE session_id = ?1 AND status = ?4",
            )
            .bind(session_id)
            .bind(status_str(next))
            .bind(&now)
            .bind(status_str(current.status))
            .execute(self.db.as_ref())
            .await?
        };

        if result.rows_affected() == 0 {
            let fresh = self.get(session_id).await?;
            return Err(RelayError::IllegalTransition {
                from: status_str(fresh.status).to_owned(),
                to: status_str(next).to_owned(),
            });
        }

        self.get(session_id).await
    }

    /// Record the spawned agent process and extend the transcript chain.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::SessionNotFound` if the session does not exist
    /// and `RelayError::SessionClosed` if it is no longer `active`.
    pub async fn attach_process(
        &self,
        session_id: &str,
        pid: u32,
        pty_device: Option<&str>,
        transcript_file: &str,
    ) -> Result<Session> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE session SET native_process_id = ?2, pty_device = ?3, \
             transcript_files = json_insert(transcript_files, '$[#]', ?4), \
             last_activity = ?5 \
             WHERE session_id = ?1 AND status = 'active'",
        )
        .bind(session_id)
        .bind(i64::from(pid))
        .bind(pty_device)
        .bind(transcript_file)
        .bind(&now)
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            let fresh = self.get(session_id).await?;
            return Err(RelayError::SessionClosed(format!(
                "{session_id} is {}",
                status_str(fresh.status)
            )));
        }

        self.get(session_id).await
    }

    /// Advance the transcript cursor, never letting it move backwards.
    ///
    /// Also stamps `last_output_at`. Permitted while the session is
    /// `active` or `closing` (output drains during close).
    ///
    /// # Errors
    ///
    /// Returns `RelayError::SessionNotFound` if the session does not exist
    /// and `RelayError::SessionClosed` if it is already closed.
    pub async fn advance_char_offset(&self, session_id: &str, offset: i64) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE session SET char_offset = MAX(char_offset, ?2), \
             last_output_at = ?3, last_activity = ?3 \
             WHERE session_id = ?1 AND status != 'closed'",
        )
        .bind(session_id)
        .bind(offset)
        .bind(&now)
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            let fresh = self.get(session_id).await?;
            return Err(RelayError::SessionClosed(fresh.session_id));
        }
        Ok(())
    }

    /// Refresh the last-activity timestamp.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::SessionNotFound` if the session does not exist
    /// and `RelayError::SessionClosed` if it is already closed.
    pub async fn touch_activity(&self, session_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE session SET last_activity = ?2 \
             WHERE session_id = ?1 AND status != 'closed'",
        )
        .bind(session_id)
        .bind(&now)
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            let fresh = self.get(session_id).await?;
            return Err(RelayError::SessionClosed(fresh.session_id));
        }
        Ok(())
    }

    /// Apply a partial update; unset patch fields keep their stored value.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::SessionNotFound` if the session does not exist
    /// and `RelayError::SessionClosed` if it is already closed.
    pub async fn update_fields(&self, session_id: &str, patch: &SessionPatch) -> Result<Session> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE session SET \
             visibility = COALESCE(?2, visibility), \
             user_role = COALESCE(?3, user_role), \
             last_tool_use_at = COALESCE(?4, last_tool_use_at), \
             last_checkpoint_at = COALESCE(?5, last_checkpoint_at), \
             last_output_at = COALESCE(?6, last_output_at), \
             last_activity = ?7 \
             WHERE session_id = ?1 AND status != 'closed'",
        )
        .bind(session_id)
        .bind(patch.visibility.map(visibility_str))
        .bind(patch.user_role.as_deref())
        .bind(patch.last_tool_use_at.map(|t| t.to_rfc3339()))
        .bind(patch.last_checkpoint_at.map(|t| t.to_rfc3339()))
        .bind(patch.last_output_at.map(|t| t.to_rfc3339()))
        .bind(&now)
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            let fresh = self.get(session_id).await?;
            return Err(RelayError::SessionClosed(fresh.session_id));
        }

        self.get(session_id).await
    }
}
