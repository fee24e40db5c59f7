use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::Serialize;
use serde_json::json;

use super::migrations::{self, MigrationReport};
use super::DirectoryError;
use crate::config::DatabaseConfig;
use crate::models::{AppUser, AuditAction, AuditEntry, UserStatus};

/// Upper bound on rows returned by [`UserDirectory::list`].
pub const LIST_LIMIT: i64 = 200;

/// How often a waiting call retries the connection lock.
const LOCK_POLL: Duration = Duration::from_millis(5);

const USER_COLUMNS: &str = "id, subject, email, display_name, status, created_at, updated_at";

/// Result of a connectivity check.
#[derive(Debug, Clone, Serialize)]
pub struct DbHealth {
    pub now: String,
    pub sqlite_version: String,
}

/// SQLite-backed user directory with its audit log.
///
/// Every call runs on the blocking pool against one serialized connection
/// and is bounded by the configured query timeout. Mutations and their
/// audit rows share a transaction.
#[derive(Clone)]
pub struct UserDirectory {
    pub(crate) conn: Arc<Mutex<Connection>>,
    timeout: Duration,
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<AppUser> {
    let status: String = row.get(4)?;
    Ok(AppUser {
        id: row.get(0)?,
        subject: row.get(1)?,
        email: row.get(2)?,
        display_name: row.get(3)?,
        status: status
            .parse::<UserStatus>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?,
        created_at: parse_timestamp(5, row.get(5)?)?,
        updated_at: parse_timestamp(6, row.get(6)?)?,
    })
}

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    let action: String = row.get(2)?;
    let details: Option<String> = row.get(4)?;
    Ok(AuditEntry {
        id: row.get(0)?,
        subject: row.get(1)?,
        action: action.parse::<AuditAction>().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into())
        })?,
        actor: row.get(3)?,
        details: details
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?,
        created_at: parse_timestamp(5, row.get(5)?)?,
    })
}

/// Take the connection, giving up once `deadline` passes so a timed-out
/// call frees its blocking thread instead of queueing on the mutex.
fn lock_until(
    conn: &Mutex<Connection>,
    deadline: Instant,
) -> Result<MutexGuard<'_, Connection>, DirectoryError> {
    loop {
        match conn.try_lock() {
            Ok(guard) => return Ok(guard),
            Err(TryLockError::Poisoned(_)) => return Err(DirectoryError::Poisoned),
            Err(TryLockError::WouldBlock) if Instant::now() >= deadline => {
                return Err(DirectoryError::Timeout)
            }
            Err(TryLockError::WouldBlock) => std::thread::sleep(LOCK_POLL),
        }
    }
}

fn insert_audit(
    tx: &Transaction<'_>,
    subject: &str,
    action: AuditAction,
    actor: Option<&str>,
    details: &serde_json::Value,
    at: &str,
) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO app_user_audit (subject, action, actor, details, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![subject, action.as_str(), actor, details.to_string(), at],
    )?;
    Ok(())
}

impl UserDirectory {
    /// Open the database named by `config.url` (`sqlite:` prefix optional).
    /// Migrations are not applied; call [`UserDirectory::migrate`].
    pub fn open(config: &DatabaseConfig) -> Result<Self, DirectoryError> {
        let path = config.url.strip_prefix("sqlite:").unwrap_or(&config.url);
        let timeout = Duration::from_millis(config.query_timeout_ms);

        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            Connection::open(path)?
        };
        conn.busy_timeout(timeout)?;

        tracing::info!("User directory opened: {}", path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            timeout,
        })
    }

    /// Fresh in-memory directory with the schema applied.
    pub fn open_in_memory() -> Result<Self, DirectoryError> {
        let directory = Self::open(&DatabaseConfig {
            url: ":memory:".to_string(),
            ..Default::default()
        })?;
        directory.migrate()?;
        Ok(directory)
    }

    /// Apply pending schema migrations. Intended for startup.
    pub fn migrate(&self) -> Result<MigrationReport, DirectoryError> {
        let mut conn = self.conn.lock().map_err(|_| DirectoryError::Poisoned)?;
        Ok(migrations::run(&mut conn)?)
    }

    /// Run `op` on the blocking pool within the query timeout.
    ///
    /// A statement that already holds the connection keeps it until SQLite
    /// returns, which `busy_timeout` bounds. Calls still waiting for the
    /// connection stop at the deadline.
    async fn run<T, F>(&self, op: F) -> Result<T, DirectoryError>
    where
        F: FnOnce(&mut Connection) -> Result<T, DirectoryError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let deadline = Instant::now() + self.timeout;
        let task = tokio::task::spawn_blocking(move || {
            let mut conn = lock_until(&conn, deadline)?;
            op(&mut conn)
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(DirectoryError::Task(e.to_string())),
            Err(_) => Err(DirectoryError::Timeout),
        }
    }

    /// Insert `subject` as pending, or refresh email and display name of the
    /// existing row without touching its status. Records `created` or
    /// `updated` in the same transaction.
    pub async fn upsert_pending(
        &self,
        subject: &str,
        email: &str,
        display_name: Option<&str>,
    ) -> Result<AppUser, DirectoryError> {
        let subject = subject.to_string();
        let email = email.to_string();
        let display_name = display_name.map(String::from);

        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = timestamp(Utc::now());

            let existed: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM app_user WHERE subject = ?1)",
                params![subject],
                |row| row.get(0),
            )?;

            let user = tx.query_row(
                &format!(
                    "INSERT INTO app_user (id, subject, email, display_name, status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?5)
                     ON CONFLICT(subject) DO UPDATE SET
                         email = excluded.email,
                         display_name = excluded.display_name,
                         updated_at = excluded.updated_at
                     RETURNING {USER_COLUMNS}"
                ),
                params![uuid::Uuid::new_v4().to_string(), subject, email, display_name, now],
                user_from_row,
            )?;

            let action = if existed { AuditAction::Updated } else { AuditAction::Created };
            insert_audit(
                &tx,
                &subject,
                action,
                None,
                &json!({ "email": email, "name": display_name }),
                &now,
            )?;
            tx.commit()?;

            if !existed {
                tracing::info!("Registered new user {} ({})", subject, email);
            }
            Ok(user)
        })
        .await
    }

    pub async fn get_by_subject(&self, subject: &str) -> Result<Option<AppUser>, DirectoryError> {
        let subject = subject.to_string();
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {USER_COLUMNS} FROM app_user WHERE subject = ?1"),
                    params![subject],
                    user_from_row,
                )
                .optional()?)
        })
        .await
    }

    /// Stored email for `subject`, used when a token carries no identifier.
    pub async fn email_for_subject(&self, subject: &str) -> Result<Option<String>, DirectoryError> {
        let subject = subject.to_string();
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT email FROM app_user WHERE subject = ?1 LIMIT 1",
                    params![subject],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    /// Move `subject` to `status` on behalf of `actor`.
    ///
    /// Always appends an audit row, even when the status is unchanged;
    /// `updated_at` only moves when the status does. Unknown subjects are
    /// `NotFound` and leave no audit trace.
    pub async fn set_status(
        &self,
        subject: &str,
        status: UserStatus,
        actor: &str,
    ) -> Result<AppUser, DirectoryError> {
        let subject = subject.to_string();
        let actor = actor.to_string();

        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = timestamp(Utc::now());

            let previous: Option<String> = tx
                .query_row(
                    "SELECT status FROM app_user WHERE subject = ?1",
                    params![subject],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(previous) = previous else {
                return Err(DirectoryError::NotFound(subject));
            };

            let user = tx.query_row(
                &format!(
                    "UPDATE app_user
                     SET status = ?1,
                         updated_at = CASE WHEN status = ?1 THEN updated_at ELSE ?2 END
                     WHERE subject = ?3
                     RETURNING {USER_COLUMNS}"
                ),
                params![status.as_str(), now, subject],
                user_from_row,
            )?;

            insert_audit(
                &tx,
                &subject,
                AuditAction::for_status(status),
                Some(&actor),
                &json!({ "previous_status": previous }),
                &now,
            )?;
            tx.commit()?;

            tracing::info!("User {} {} -> {} by {}", subject, previous, status, actor);
            Ok(user)
        })
        .await
    }

    /// Newest users first, optionally filtered by status, at most [`LIST_LIMIT`].
    pub async fn list(&self, filter: Option<UserStatus>) -> Result<Vec<AppUser>, DirectoryError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {USER_COLUMNS} FROM app_user
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?2"
            ))?;
            let users = stmt
                .query_map(params![filter.map(|s| s.as_str()), LIST_LIMIT], user_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(users)
        })
        .await
    }

    /// Audit history for `subject`, oldest first.
    pub async fn audit_for_subject(&self, subject: &str) -> Result<Vec<AuditEntry>, DirectoryError> {
        let subject = subject.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, subject, action, actor, details, created_at
                 FROM app_user_audit WHERE subject = ?1 ORDER BY id",
            )?;
            let entries = stmt
                .query_map(params![subject], audit_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
        .await
    }

    /// Round-trip a trivial query.
    pub async fn ping(&self) -> Result<DbHealth, DirectoryError> {
        self.run(|conn| {
            Ok(conn.query_row(
                "SELECT strftime('%Y-%m-%dT%H:%M:%fZ', 'now'), sqlite_version()",
                [],
                |row| {
                    Ok(DbHealth {
                        now: row.get(0)?,
                        sqlite_version: row.get(1)?,
                    })
                },
            )?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> UserDirectory {
        UserDirectory::open_in_memory().unwrap()
    }

    #[tokio::test]
    async fn test_upsert_creates_pending_user() {
        let dir = directory();
        let user = dir
            .upsert_pending("S1", "a@example.com", Some("a"))
            .await
            .unwrap();

        assert_eq!(user.subject, "S1");
        assert_eq!(user.email, "a@example.com");
        assert_eq!(user.display_name.as_deref(), Some("a"));
        assert_eq!(user.status, UserStatus::Pending);
        assert_eq!(user.created_at, user.updated_at);
        assert!(uuid::Uuid::parse_str(&user.id).is_ok());

        let audit = dir.audit_for_subject("S1").await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, AuditAction::Created);
        assert_eq!(audit[0].actor, None);
        assert_eq!(audit[0].details.as_ref().unwrap()["email"], "a@example.com");
    }

    #[tokio::test]
    async fn test_reregistration_updates_email_but_keeps_status() {
        let dir = directory();
        let first = dir.upsert_pending("S1", "old@example.com", Some("old")).await.unwrap();
        dir.set_status("S1", UserStatus::Approved, "boss@example.com").await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = dir.upsert_pending("S1", "new@example.com", Some("new")).await.unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.subject, "S1");
        assert_eq!(second.email, "new@example.com");
        assert_eq!(second.display_name.as_deref(), Some("new"));
        assert_eq!(second.status, UserStatus::Approved);
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at > first.updated_at);

        let actions: Vec<_> = dir
            .audit_for_subject("S1")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(
            actions,
            vec![AuditAction::Created, AuditAction::Approved, AuditAction::Updated]
        );
    }

    #[tokio::test]
    async fn test_get_by_subject() {
        let dir = directory();
        assert!(dir.get_by_subject("S1").await.unwrap().is_none());

        dir.upsert_pending("S1", "a@example.com", None).await.unwrap();
        let user = dir.get_by_subject("S1").await.unwrap().unwrap();
        assert_eq!(user.email, "a@example.com");
        assert_eq!(user.display_name, None);
    }

    #[tokio::test]
    async fn test_email_for_subject() {
        let dir = directory();
        dir.upsert_pending("S1", "a@example.com", None).await.unwrap();
        assert_eq!(
            dir.email_for_subject("S1").await.unwrap().as_deref(),
            Some("a@example.com")
        );
        assert_eq!(dir.email_for_subject("S2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_status_records_actor() {
        let dir = directory();
        dir.upsert_pending("S1", "a@example.com", None).await.unwrap();

        let user = dir
            .set_status("S1", UserStatus::Rejected, "boss@example.com")
            .await
            .unwrap();
        assert_eq!(user.status, UserStatus::Rejected);

        let audit = dir.audit_for_subject("S1").await.unwrap();
        let last = audit.last().unwrap();
        assert_eq!(last.action, AuditAction::Rejected);
        assert_eq!(last.actor.as_deref(), Some("boss@example.com"));
        assert_eq!(last.details.as_ref().unwrap()["previous_status"], "pending");
    }

    #[tokio::test]
    async fn test_repeat_approve_keeps_state_and_appends_audit() {
        let dir = directory();
        dir.upsert_pending("S1", "a@example.com", None).await.unwrap();

        let first = dir.set_status("S1", UserStatus::Approved, "boss@example.com").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = dir.set_status("S1", UserStatus::Approved, "boss@example.com").await.unwrap();

        assert_eq!(second.status, UserStatus::Approved);
        assert_eq!(second.updated_at, first.updated_at);
        assert_eq!(second.email, first.email);

        let approvals = dir
            .audit_for_subject("S1")
            .await
            .unwrap()
            .iter()
            .filter(|e| e.action == AuditAction::Approved)
            .count();
        assert_eq!(approvals, 2);
    }

    #[tokio::test]
    async fn test_set_status_unknown_subject() {
        let dir = directory();
        let err = dir
            .set_status("ghost", UserStatus::Approved, "boss@example.com")
            .await
            .unwrap_err();

        assert!(matches!(err, DirectoryError::NotFound(s) if s == "ghost"));
        assert!(dir.audit_for_subject("ghost").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_filters_and_orders_newest_first() {
        let dir = directory();
        for subject in ["S1", "S2", "S3"] {
            dir.upsert_pending(subject, &format!("{subject}@example.com"), None)
                .await
                .unwrap();
        }
        dir.set_status("S2", UserStatus::Approved, "boss@example.com").await.unwrap();

        let all: Vec<_> = dir.list(None).await.unwrap().into_iter().map(|u| u.subject).collect();
        assert_eq!(all, vec!["S3", "S2", "S1"]);

        let approved = dir.list(Some(UserStatus::Approved)).await.unwrap();
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].subject, "S2");

        let pending: Vec<_> = dir
            .list(Some(UserStatus::Pending))
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.subject)
            .collect();
        assert_eq!(pending, vec!["S3", "S1"]);

        assert!(dir.list(Some(UserStatus::Rejected)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_is_bounded() {
        let dir = directory();
        for i in 0..(LIST_LIMIT + 5) {
            dir.upsert_pending(&format!("S{i}"), "a@example.com", None).await.unwrap();
        }
        assert_eq!(dir.list(None).await.unwrap().len() as i64, LIST_LIMIT);
    }

    #[tokio::test]
    async fn test_concurrent_registration_same_subject() {
        let dir = directory();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let dir = dir.clone();
                tokio::spawn(async move {
                    dir.upsert_pending("S1", &format!("a{i}@example.com"), None).await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(dir.list(None).await.unwrap().len(), 1);
        let audit = dir.audit_for_subject("S1").await.unwrap();
        assert_eq!(audit.len(), 8);
        assert_eq!(
            audit.iter().filter(|e| e.action == AuditAction::Created).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_ping() {
        let health = directory().ping().await.unwrap();
        assert!(health.sqlite_version.starts_with('3'));
        assert!(health.now.ends_with('Z'));
    }

    #[tokio::test]
    async fn test_busy_connection_times_out() {
        let dir = UserDirectory::open(&DatabaseConfig {
            url: ":memory:".to_string(),
            query_timeout_ms: 50,
            ..Default::default()
        })
        .unwrap();
        dir.migrate().unwrap();

        let holder = crate::test_util::stall_directory(&dir, Duration::from_millis(400));

        let err = dir.ping().await.unwrap_err();
        assert!(matches!(err, DirectoryError::Timeout), "{err:?}");

        // The waiting task gave up too; only the directory and the holder
        // still reference the connection.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(Arc::strong_count(&dir.conn), 2);

        holder.join().unwrap();
        assert!(dir.ping().await.is_ok());
    }

    #[test]
    fn test_lock_until_past_deadline() {
        let conn = Mutex::new(Connection::open_in_memory().unwrap());
        let _held = conn.lock().unwrap();

        let started = Instant::now();
        let err = lock_until(&conn, started + Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, DirectoryError::Timeout));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_file_database_persists_across_opens() {
        let tmp = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            url: format!("sqlite:{}", tmp.path().join("nested/approvals.db").display()),
            ..Default::default()
        };

        {
            let dir = UserDirectory::open(&config).unwrap();
            dir.migrate().unwrap();
            dir.upsert_pending("S1", "a@example.com", None).await.unwrap();
        }

        let dir = UserDirectory::open(&config).unwrap();
        let report = dir.migrate().unwrap();
        assert!(report.applied.is_empty());
        assert!(dir.get_by_subject("S1").await.unwrap().is_some());
    }
}
