use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Connection, FromRow, SqliteConnection};

use super::error::{
    ConflictSnafu, CreateSqliteDirectorySnafu, DuplicateIdSnafu, InvariantViolationSnafu,
    NotFoundSnafu,
    SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu,
    SqliteQuerySnafu, SqliteRuntimeInitSnafu, SqliteThreadSpawnSnafu, StorageError,
    StorageResult,
};
use super::ids::{MessageId, SessionId};
use super::types::{
    DEFAULT_SESSION_TITLE, MessageRecord, MessageRole, NewMessage, NewSession, SessionPatch,
    SessionRecord,
};
use super::{MessageStore, SessionStore};

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    database_url: String,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        let _: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        // Store calls open their own connections; the pool only prepares the file.
        pool.close().await;

        tracing::debug!(database_url = %database_url, "sqlite storage opened");
        Ok(Self { database_url })
    }

    fn run_db_call<T, F>(&self, stage: &'static str, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: Future<Output = StorageResult<T>> + Send + 'static,
    {
        // Store traits are sync, so each call executes on a dedicated worker thread
        // with its own current-thread runtime to avoid nested-runtime blocking panics.
        let worker = std::thread::Builder::new()
            .name(format!("sqlite-store-{stage}"))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context(SqliteRuntimeInitSnafu {
                        stage: "sqlite-store-runtime-build",
                    })?;
                runtime.block_on(op)
            })
            .context(SqliteThreadSpawnSnafu {
                stage: "sqlite-store-spawn-worker",
            })?;

        match worker.join() {
            Ok(result) => result,
            Err(_) => InvariantViolationSnafu {
                stage,
                details: "sqlite storage worker thread panicked".to_string(),
            }
            .fail(),
        }
    }
}

impl SessionStore for SqliteStorage {
    fn create_session(&self, input: NewSession) -> StorageResult<SessionRecord> {
        let database_url = self.database_url.clone();
        self.run_db_call("session-create", async move {
            let mut connection =
                connect_store_connection(&database_url, "session-create-connect").await?;
            let title = normalize_title(input.title);
            let session_id = SessionId::new_v7();
            let now = unix_timestamp_seconds();

            sqlx::query(
                "INSERT INTO sessions (id, title, created_at, updated_at, deleted_at) VALUES (?, ?, ?, ?, NULL)",
            )
            .bind(session_id.to_string())
            .bind(title.clone())
            .bind(now)
            .bind(now)
            .execute(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "session-create-insert",
            })?;

            Ok(SessionRecord {
                id: session_id,
                title,
                created_at_unix_seconds: i64_to_u64(now, "session-create-created-at")?,
                updated_at_unix_seconds: i64_to_u64(now, "session-create-updated-at")?,
                deleted_at_unix_seconds: None,
            })
        })
    }

    fn list_sessions(&self, include_deleted: bool) -> StorageResult<Vec<SessionRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("session-list", async move {
            let mut connection =
                connect_store_connection(&database_url, "session-list-connect").await?;
            let rows = if include_deleted {
                sqlx::query_as::<_, SessionRow>(
                    "SELECT id, title, created_at, updated_at, deleted_at FROM sessions ORDER BY updated_at DESC, id DESC",
                )
                .fetch_all(&mut connection)
                .await
            } else {
                sqlx::query_as::<_, SessionRow>(
                    "SELECT id, title, created_at, updated_at, deleted_at FROM sessions WHERE deleted_at IS NULL ORDER BY updated_at DESC, id DESC",
                )
                .fetch_all(&mut connection)
                .await
            }
            .context(SqliteQuerySnafu {
                stage: "session-list-query",
            })?;

            rows.into_iter().map(session_row_to_record).collect()
        })
    }

    fn get_session(&self, session_id: SessionId) -> StorageResult<Option<SessionRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("session-get", async move {
            let mut connection =
                connect_store_connection(&database_url, "session-get-connect").await?;
            let row = sqlx::query_as::<_, SessionRow>(
                "SELECT id, title, created_at, updated_at, deleted_at FROM sessions WHERE id = ?",
            )
            .bind(session_id.to_string())
            .fetch_optional(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "session-get-query",
            })?;

            row.map(session_row_to_record).transpose()
        })
    }

    fn update_session(
        &self,
        session_id: SessionId,
        patch: SessionPatch,
    ) -> StorageResult<SessionRecord> {
        let database_url = self.database_url.clone();
        self.run_db_call("session-update", async move {
            let mut connection =
                connect_store_connection(&database_url, "session-update-connect").await?;
            let now = unix_timestamp_seconds();
            let update_result = sqlx::query(
                "UPDATE sessions SET title = COALESCE(?, title), updated_at = ? WHERE id = ? AND deleted_at IS NULL",
            )
            .bind(patch.title.map(normalize_title))
            .bind(now)
            .bind(session_id.to_string())
            .execute(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "session-update-apply",
            })?;

            if update_result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "session-update-missing",
                    entity: "session",
                    id: session_id.to_string(),
                }
                .fail();
            }

            let row = sqlx::query_as::<_, SessionRow>(
                "SELECT id, title, created_at, updated_at, deleted_at FROM sessions WHERE id = ?",
            )
            .bind(session_id.to_string())
            .fetch_optional(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "session-update-load",
            })?
            .context(NotFoundSnafu {
                stage: "session-update-load-missing",
                entity: "session",
                id: session_id.to_string(),
            })?;

            session_row_to_record(row)
        })
    }

    fn soft_delete_session(&self, session_id: SessionId) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        self.run_db_call("session-soft-delete", async move {
            let mut connection =
                connect_store_connection(&database_url, "session-soft-delete-connect").await?;
            let now = unix_timestamp_seconds();
            let result = sqlx::query(
                "UPDATE sessions SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
            )
            .bind(now)
            .bind(now)
            .bind(session_id.to_string())
            .execute(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "session-soft-delete-apply",
            })?;

            if result.rows_affected() == 0 && !session_exists(&mut connection, session_id).await? {
                return NotFoundSnafu {
                    stage: "session-soft-delete-missing",
                    entity: "session",
                    id: session_id.to_string(),
                }
                .fail();
            }

            Ok(())
        })
    }
}

impl MessageStore for SqliteStorage {
    fn append_message(
        &self,
        session_id: SessionId,
        input: NewMessage,
    ) -> StorageResult<MessageRecord> {
        let database_url = self.database_url.clone();
        self.run_db_call("message-append", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-append-connect").await?;
            ensure_live_session(&mut connection, session_id, "message-append-ensure-session")
                .await?;

            if let Some(extra_json) = input.extra_json.as_deref() {
                let is_object = sqlx::query_scalar::<_, i64>(
                    "SELECT CASE WHEN json_valid(?1) THEN json_type(?1) = 'object' ELSE 0 END",
                )
                .bind(extra_json)
                .fetch_one(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-append-validate-extra",
                })?
                    == 1;
                if !is_object {
                    return ConflictSnafu {
                        stage: "message-append-invalid-extra",
                        entity: "message",
                        details: "extra_json must be a JSON object".to_string(),
                    }
                    .fail();
                }
            }

            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "message-append-begin",
            })?;

            let next_seq = sqlx::query_scalar::<_, i64>(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE session_id = ?",
            )
            .bind(session_id.to_string())
            .fetch_one(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-next-seq",
            })?;

            let message_id = input.id.unwrap_or_else(MessageId::new_v7);
            let taken = sqlx::query_scalar::<_, i64>("SELECT 1 FROM messages WHERE id = ? LIMIT 1")
                .bind(message_id.to_string())
                .fetch_optional(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-append-check-id",
                })?;
            if taken.is_some() {
                return DuplicateIdSnafu {
                    stage: "message-append-duplicate-id",
                    id_type: MessageId::ID_TYPE,
                    id: message_id.to_string(),
                }
                .fail();
            }

            let now = unix_timestamp_seconds();

            sqlx::query(
                "INSERT INTO messages (id, session_id, seq, role, content, extra_json, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(message_id.to_string())
            .bind(session_id.to_string())
            .bind(next_seq)
            .bind(input.role.as_str())
            .bind(input.content.clone())
            .bind(input.extra_json.clone())
            .bind(now)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-insert",
            })?;

            sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
                .bind(now)
                .bind(session_id.to_string())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-append-touch-session",
                })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-append-commit",
            })?;

            Ok(MessageRecord {
                id: message_id,
                session_id,
                seq: i64_to_u64(next_seq, "message-append-seq")?,
                role: input.role,
                content: input.content,
                extra_json: input.extra_json,
                created_at_unix_seconds: i64_to_u64(now, "message-append-created-at")?,
            })
        })
    }

    fn list_messages(&self, session_id: SessionId) -> StorageResult<Vec<MessageRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("message-list", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-list-connect").await?;
            ensure_live_session(&mut connection, session_id, "message-list-ensure-session").await?;

            let rows = sqlx::query_as::<_, MessageRow>(
                "SELECT id, session_id, seq, role, content, extra_json, created_at FROM messages WHERE session_id = ? ORDER BY seq ASC, id ASC",
            )
            .bind(session_id.to_string())
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-list-query",
            })?;

            rows.into_iter().map(message_row_to_record).collect()
        })
    }
}

#[derive(Debug, FromRow)]
struct SessionRow {
    id: String,
    title: String,
    created_at: i64,
    updated_at: i64,
    deleted_at: Option<i64>,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    session_id: String,
    seq: i64,
    role: String,
    content: String,
    extra_json: Option<String>,
    created_at: i64,
}

fn session_row_to_record(row: SessionRow) -> StorageResult<SessionRecord> {
    Ok(SessionRecord {
        id: SessionId::parse(&row.id)?,
        title: row.title,
        created_at_unix_seconds: i64_to_u64(row.created_at, "session-row-created-at")?,
        updated_at_unix_seconds: i64_to_u64(row.updated_at, "session-row-updated-at")?,
        deleted_at_unix_seconds: row
            .deleted_at
            .map(|value| i64_to_u64(value, "session-row-deleted-at"))
            .transpose()?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        session_id: SessionId::parse(&row.session_id)?,
        seq: i64_to_u64(row.seq, "message-row-seq")?,
        role: role_from_sql(&row.role)?,
        content: row.content,
        extra_json: row.extra_json,
        created_at_unix_seconds: i64_to_u64(row.created_at, "message-row-created-at")?,
    })
}

async fn connect_store_connection(
    database_url: &str,
    stage: &'static str,
) -> StorageResult<SqliteConnection> {
    let mut connection =
        SqliteConnection::connect(database_url)
            .await
            .context(SqliteConnectSnafu {
                stage,
                database_url: database_url.to_string(),
            })?;

    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-foreign-keys",
            pragma: "foreign_keys",
        })?;
    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-busy-timeout",
            pragma: "busy_timeout",
        })?;

    Ok(connection)
}

async fn session_exists(
    connection: &mut SqliteConnection,
    session_id: SessionId,
) -> StorageResult<bool> {
    let existing = sqlx::query_scalar::<_, i64>("SELECT 1 FROM sessions WHERE id = ? LIMIT 1")
        .bind(session_id.to_string())
        .fetch_optional(&mut *connection)
        .await
        .context(SqliteQuerySnafu {
            stage: "session-exists-query",
        })?;

    Ok(existing.is_some())
}

async fn ensure_live_session(
    connection: &mut SqliteConnection,
    session_id: SessionId,
    stage: &'static str,
) -> StorageResult<()> {
    let live = sqlx::query_scalar::<_, i64>(
        "SELECT 1 FROM sessions WHERE id = ? AND deleted_at IS NULL LIMIT 1",
    )
    .bind(session_id.to_string())
    .fetch_optional(&mut *connection)
    .await
    .context(SqliteQuerySnafu { stage })?;

    if live.is_none() {
        return NotFoundSnafu {
            stage,
            entity: "session",
            id: session_id.to_string(),
        }
        .fail();
    }

    Ok(())
}

fn role_from_sql(raw: &str) -> StorageResult<MessageRole> {
    MessageRole::parse(raw).context(InvariantViolationSnafu {
        stage: "message-role-from-sql",
        details: format!("unknown message role '{raw}'"),
    })
}

pub(crate) fn normalize_title(title: String) -> String {
    if title.trim().is_empty() {
        DEFAULT_SESSION_TITLE.to_string()
    } else {
        title
    }
}

pub(crate) fn unix_timestamp_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_secs() as i64)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Storage;

    async fn open_temp() -> (tempfile::TempDir, SqliteStorage) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("scenecast.sqlite");
        let storage = SqliteStorage::open(path.to_str().unwrap()).await.unwrap();
        (dir, storage)
    }

    #[test]
    fn database_urls_are_normalized() {
        assert_eq!(normalize_database_url(":memory:"), "sqlite::memory:");
        assert_eq!(normalize_database_url("sqlite://a.db"), "sqlite://a.db");
        assert_eq!(normalize_database_url("/tmp/a.db"), "sqlite:///tmp/a.db");
    }

    #[tokio::test]
    async fn session_messages_keep_sequence_and_extra_json() {
        let (_dir, storage) = open_temp().await;
        let session = storage
            .create_session(NewSession {
                title: "   ".to_string(),
            })
            .unwrap();
        assert_eq!(session.title, DEFAULT_SESSION_TITLE);

        storage
            .append_message(session.id, NewMessage::new(MessageRole::User, "topic"))
            .unwrap();
        storage
            .append_message(
                session.id,
                NewMessage::new(MessageRole::System, "Video generation finished: topic")
                    .with_extra_json(r#"{"step":"done","progress":1.0}"#),
            )
            .unwrap();

        let snapshot = storage.load_session(session.id).unwrap().unwrap();
        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(snapshot.messages[0].seq, 1);
        assert_eq!(snapshot.messages[0].extra_json, None);
        assert_eq!(snapshot.messages[1].seq, 2);
        assert_eq!(snapshot.messages[1].role, MessageRole::System);
        assert_eq!(
            snapshot.messages[1].extra_json.as_deref(),
            Some(r#"{"step":"done","progress":1.0}"#)
        );
    }

    #[tokio::test]
    async fn caller_chosen_message_ids_are_kept_and_unique() {
        let (_dir, storage) = open_temp().await;
        let session = storage
            .create_session(NewSession {
                title: "ids".to_string(),
            })
            .unwrap();
        let message_id = MessageId::new_v7();

        let record = storage
            .append_message(
                session.id,
                NewMessage::new(MessageRole::System, "done").with_id(message_id),
            )
            .unwrap();
        assert_eq!(record.id, message_id);
        assert_eq!(storage.list_messages(session.id).unwrap()[0].id, message_id);

        let error = storage
            .append_message(
                session.id,
                NewMessage::new(MessageRole::System, "again").with_id(message_id),
            )
            .unwrap_err();
        assert!(matches!(error, StorageError::DuplicateId { .. }), "{error}");
        assert_eq!(storage.list_messages(session.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn non_object_extra_json_is_rejected() {
        let (_dir, storage) = open_temp().await;
        let session = storage
            .create_session(NewSession {
                title: "t".to_string(),
            })
            .unwrap();

        for payload in ["not json", "[1,2]"] {
            let error = storage
                .append_message(
                    session.id,
                    NewMessage::new(MessageRole::System, "x").with_extra_json(payload),
                )
                .unwrap_err();
            assert!(matches!(error, StorageError::Conflict { .. }), "{error}");
        }
    }

    #[tokio::test]
    async fn soft_deleted_sessions_disappear_from_reads() {
        let (_dir, storage) = open_temp().await;
        let session = storage
            .create_session(NewSession {
                title: "gone".to_string(),
            })
            .unwrap();
        let renamed = storage
            .update_session(
                session.id,
                SessionPatch {
                    title: Some("renamed".to_string()),
                },
            )
            .unwrap();
        assert_eq!(renamed.title, "renamed");

        storage.soft_delete_session(session.id).unwrap();
        // Repeated deletes of an existing session are accepted.
        storage.soft_delete_session(session.id).unwrap();

        assert!(storage.list_sessions(false).unwrap().is_empty());
        assert_eq!(storage.list_sessions(true).unwrap().len(), 1);
        assert!(storage.load_session(session.id).unwrap().is_none());

        let error = storage
            .append_message(session.id, NewMessage::new(MessageRole::User, "late"))
            .unwrap_err();
        assert!(matches!(error, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let (_dir, storage) = open_temp().await;
        let missing = SessionId::new_v7();
        assert!(storage.get_session(missing).unwrap().is_none());
        assert!(matches!(
            storage.soft_delete_session(missing).unwrap_err(),
            StorageError::NotFound { .. }
        ));
    }
}
