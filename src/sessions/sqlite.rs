//! SQLite-backed session service.
//!
//! Two tables: `sessions` holds one row per session with its durable state as
//! a JSON document, `events` holds the serialized event log with a cascading
//! foreign key. An append writes the event row and the updated state document
//! in one transaction, so the log and the state snapshot never diverge.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, InterruptHandle, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::error::{SessionError, SessionResult};
use super::event::Event;
use super::session::Session;
use super::state::{without_temp_keys, StateMap};
use super::traits::{resolve_session_id, EventPage, GetSessionConfig, SessionKey, SessionService};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id          TEXT PRIMARY KEY,
    app_name    TEXT NOT NULL,
    user_id     TEXT NOT NULL,
    state       TEXT NOT NULL DEFAULT '{}',
    create_time TIMESTAMP NOT NULL,
    update_time TIMESTAMP NOT NULL,
    UNIQUE (app_name, user_id, id)
);

CREATE TABLE IF NOT EXISTS events (
    id         TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    event_data TEXT NOT NULL,
    timestamp  TIMESTAMP NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_app_user ON sessions(app_name, user_id);
CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id, timestamp);
";

/// Tuning knobs for [`SqliteSessionService`].
#[derive(Debug, Clone, Copy)]
pub struct SqliteOptions {
    /// How long SQLite waits on a locked database file before failing.
    pub busy_timeout: Duration,
    /// Upper bound for one operation, including time queued behind others.
    pub operation_timeout: Duration,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(5_000),
            operation_timeout: Duration::from_secs(30),
        }
    }
}

impl From<rusqlite::Error> for SessionError {
    fn from(err: rusqlite::Error) -> Self {
        Self::StorageUnavailable(err.to_string())
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation)
}

/// Truncate to the precision the `TIMESTAMP` columns keep.
fn storage_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> SessionResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| SessionError::InvalidState(format!("bad timestamp {raw:?}: {e}")))
}

fn decode_state(raw: &str, key: &SessionKey) -> SessionResult<StateMap> {
    serde_json::from_str(raw)
        .map_err(|e| SessionError::InvalidState(format!("state of session {key}: {e}")))
}

/// Load a session's events in append order, keeping those at or after `since`.
fn load_events(
    conn: &Connection,
    session_id: &str,
    since: Option<DateTime<Utc>>,
) -> SessionResult<Vec<Event>> {
    // Column precision is microseconds, so this is only a prefilter; the
    // strict comparison happens in GetSessionConfig::apply.
    let lower = since.map(|ts| format_ts(ts.trunc_subsecs(6))).unwrap_or_default();
    let mut stmt = conn.prepare(
        "SELECT event_data FROM events
         WHERE session_id = ?1 AND timestamp >= ?2
         ORDER BY rowid ASC",
    )?;
    let rows = stmt.query_map(params![session_id, lower], |row| row.get::<_, String>(0))?;

    let mut events = Vec::new();
    for raw in rows {
        let raw = raw?;
        let event: Event = serde_json::from_str(&raw).map_err(|e| {
            SessionError::InvalidState(format!("event in session {session_id}: {e}"))
        })?;
        events.push(event);
    }
    Ok(events)
}

#[derive(Debug, Default)]
struct OpState {
    running: bool,
    cancelled: bool,
}

/// Cancellation handshake between an operation's future and its blocking task.
pub(crate) struct OpControl {
    state: Mutex<OpState>,
    interrupt: Arc<InterruptHandle>,
}

impl OpControl {
    fn new(interrupt: Arc<InterruptHandle>) -> Self {
        Self {
            state: Mutex::new(OpState::default()),
            interrupt,
        }
    }

    /// Claim the connection for this operation; false once it was abandoned.
    fn begin(&self) -> bool {
        let mut state = self.state.lock();
        if state.cancelled {
            return false;
        }
        state.running = true;
        true
    }

    fn finish(&self) {
        self.state.lock().running = false;
    }

    /// Abandon the operation, interrupting its statement if one is executing.
    /// Returns whether the blocking task had already started.
    fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        state.cancelled = true;
        if state.running {
            self.interrupt.interrupt();
        }
        state.running
    }

    /// Fails once the caller has stopped waiting; checked before committing.
    pub(crate) fn ensure_live(&self, op: &str) -> SessionResult<()> {
        if self.state.lock().cancelled {
            return Err(SessionError::StorageUnavailable(format!(
                "{op} abandoned by caller, rolled back"
            )));
        }
        Ok(())
    }
}

/// Cancels the operation when its future is dropped before completion.
struct CancelOnDrop {
    control: Arc<OpControl>,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            let started = self.control.cancel();
            tracing::debug!(started, "sqlite operation dropped by caller");
        }
    }
}

/// Session service persisting to a single SQLite database file.
///
/// One connection is shared behind a mutex; every call runs on the blocking
/// pool and is bounded by `operation_timeout`. A call that times out while
/// its statement is executing interrupts the statement, which rolls back the
/// open transaction.
pub struct SqliteSessionService {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
    db_path: Option<PathBuf>,
    operation_timeout: Duration,
}

impl SqliteSessionService {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub async fn open(path: &Path, options: SqliteOptions) -> SessionResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                SessionError::StorageUnavailable(format!(
                    "failed to create {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let db_path = path.to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> SessionResult<Connection> {
            let conn = Connection::open(&db_path)?;
            init_connection(&conn, options.busy_timeout)?;
            Ok(conn)
        })
        .await
        .map_err(|e| SessionError::StorageUnavailable(format!("failed to open database: {e}")))??;

        tracing::debug!(path = %path.display(), "sqlite session store opened");
        Ok(Self::from_connection(conn, Some(path.to_path_buf()), options))
    }

    /// Private in-memory database; contents vanish with the service.
    pub fn open_in_memory() -> SessionResult<Self> {
        let options = SqliteOptions::default();
        let conn = Connection::open_in_memory()?;
        init_connection(&conn, options.busy_timeout)?;
        Ok(Self::from_connection(conn, None, options))
    }

    fn from_connection(conn: Connection, db_path: Option<PathBuf>, options: SqliteOptions) -> Self {
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Self {
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
            db_path,
            operation_timeout: options.operation_timeout,
        }
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    async fn run_blocking<F, R>(&self, op: &'static str, f: F) -> SessionResult<R>
    where
        F: FnOnce(&mut Connection, &OpControl) -> SessionResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let control = Arc::new(OpControl::new(Arc::clone(&self.interrupt)));
        let mut guard = CancelOnDrop {
            control: Arc::clone(&control),
            armed: true,
        };
        let task_control = Arc::clone(&control);

        let mut task = tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            if !task_control.begin() {
                return Err(SessionError::StorageUnavailable(format!(
                    "{op} cancelled before it started"
                )));
            }
            let result = f(&mut conn, &task_control);
            task_control.finish();
            result
        });

        let joined = match tokio::time::timeout(self.operation_timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                let started = control.cancel();
                tracing::warn!(
                    op,
                    started,
                    timeout_ms = u64::try_from(self.operation_timeout.as_millis()).unwrap_or(u64::MAX),
                    "sqlite operation timed out"
                );
                let timed_out = SessionError::StorageUnavailable(format!(
                    "{op} timed out after {:?}",
                    self.operation_timeout
                ));
                if !started {
                    guard.armed = false;
                    return Err(timed_out);
                }
                // The statement is interrupted and the closure rolls back at its
                // next liveness check; report whatever actually reached storage.
                let outcome = task.await;
                guard.armed = false;
                return match outcome {
                    Ok(Ok(value)) => Ok(value),
                    _ => Err(timed_out),
                };
            }
        };
        guard.armed = false;
        joined.map_err(|e| SessionError::StorageUnavailable(format!("{op} task failed: {e}")))?
    }
}

fn init_connection(conn: &Connection, busy_timeout: Duration) -> SessionResult<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

#[async_trait]
impl SessionService for SqliteSessionService {
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        initial_state: StateMap,
        session_id: Option<&str>,
    ) -> SessionResult<Session> {
        let id = resolve_session_id(session_id);
        let now = storage_now();
        let session = Session::from_parts(
            app_name.to_string(),
            user_id.to_string(),
            id,
            without_temp_keys(&initial_state),
            Vec::new(),
            now,
            now,
        );
        let key = session.key();
        let state_json = serde_json::to_string(&session.durable_state())?;

        let insert_key = key.clone();
        self.run_blocking("create_session", move |conn, _| {
            let stamp = format_ts(now);
            conn.execute(
                "INSERT INTO sessions (id, app_name, user_id, state, create_time, update_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    insert_key.session_id,
                    insert_key.app_name,
                    insert_key.user_id,
                    state_json,
                    stamp
                ],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    SessionError::DuplicateSession(insert_key.clone())
                } else {
                    e.into()
                }
            })?;
            Ok(())
        })
        .await?;

        tracing::debug!(session = %key, "session created");
        Ok(session)
    }

    async fn get_session(
        &self,
        key: &SessionKey,
        config: Option<&GetSessionConfig>,
    ) -> SessionResult<Session> {
        let key = key.clone();
        let config = config.cloned();
        self.run_blocking("get_session", move |conn, _| {
            let row = conn
                .query_row(
                    "SELECT state, create_time, update_time FROM sessions
                     WHERE app_name = ?1 AND user_id = ?2 AND id = ?3",
                    params![key.app_name, key.user_id, key.session_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()?;
            let Some((state_json, create_time, update_time)) = row else {
                return Err(SessionError::NotFound(key));
            };

            let state = decode_state(&state_json, &key)?;
            let since = config.as_ref().and_then(|c| c.after_timestamp);
            let mut events = load_events(conn, &key.session_id, since)?;
            if let Some(config) = &config {
                events = config.apply(events);
            }

            Ok(Session::from_parts(
                key.app_name,
                key.user_id,
                key.session_id,
                state,
                events,
                parse_ts(&create_time)?,
                parse_ts(&update_time)?,
            ))
        })
        .await
    }

    async fn list_sessions(&self, app_name: &str, user_id: &str) -> SessionResult<Vec<Session>> {
        let app_name = app_name.to_string();
        let user_id = user_id.to_string();
        self.run_blocking("list_sessions", move |conn, _| {
            let mut stmt = conn.prepare(
                "SELECT id, create_time, update_time FROM sessions
                 WHERE app_name = ?1 AND user_id = ?2
                 ORDER BY update_time DESC, id ASC",
            )?;
            let rows = stmt.query_map(params![app_name, user_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;

            let mut sessions = Vec::new();
            for row in rows {
                let (id, create_time, update_time) = row?;
                sessions.push(Session::from_parts(
                    app_name.clone(),
                    user_id.clone(),
                    id,
                    StateMap::new(),
                    Vec::new(),
                    parse_ts(&create_time)?,
                    parse_ts(&update_time)?,
                ));
            }
            Ok(sessions)
        })
        .await
    }

    async fn delete_session(&self, key: &SessionKey) -> SessionResult<()> {
        let key = key.clone();
        let deleted_key = key.clone();
        self.run_blocking("delete_session", move |conn, _| {
            let affected = conn.execute(
                "DELETE FROM sessions WHERE app_name = ?1 AND user_id = ?2 AND id = ?3",
                params![key.app_name, key.user_id, key.session_id],
            )?;
            if affected == 0 {
                return Err(SessionError::NotFound(key));
            }
            Ok(())
        })
        .await?;

        tracing::debug!(session = %deleted_key, "session deleted");
        Ok(())
    }

    async fn list_events(&self, key: &SessionKey) -> SessionResult<EventPage> {
        let key = key.clone();
        self.run_blocking("list_events", move |conn, _| {
            let exists = conn
                .query_row(
                    "SELECT 1 FROM sessions WHERE app_name = ?1 AND user_id = ?2 AND id = ?3",
                    params![key.app_name, key.user_id, key.session_id],
                    |_| Ok(()),
                )
                .optional()?;
            if exists.is_none() {
                return Err(SessionError::NotFound(key));
            }
            Ok(EventPage {
                events: load_events(conn, &key.session_id, None)?,
                next_page_token: String::new(),
            })
        })
        .await
    }

    async fn close_session(&self, session: &Session) -> SessionResult<()> {
        tracing::debug!(session = %session.key(), "session closed");
        Ok(())
    }

    async fn append_event(&self, session: &Session, event: Event) -> SessionResult<Event> {
        if event.partial {
            return Ok(event);
        }
        let key = session.key();
        let event = event.without_temp_state();
        let event_json = serde_json::to_string(&event)?;

        let tx_key = key.clone();
        let event_id = event.id.clone();
        let event_stamp = format_ts(event.timestamp);
        let delta = event.actions.durable_state_delta();

        let (events, state, update_time) = self
            .run_blocking("append_event", move |conn, control| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let state_json = tx
                    .query_row(
                        "SELECT state FROM sessions
                         WHERE app_name = ?1 AND user_id = ?2 AND id = ?3",
                        params![tx_key.app_name, tx_key.user_id, tx_key.session_id],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                let Some(state_json) = state_json else {
                    return Err(SessionError::NotFound(tx_key));
                };
                let mut state = decode_state(&state_json, &tx_key)?;

                tx.execute(
                    "INSERT INTO events (id, session_id, event_data, timestamp)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![event_id, tx_key.session_id, event_json, event_stamp],
                )
                .map_err(|e| {
                    if is_constraint_violation(&e) {
                        SessionError::DuplicateEvent {
                            session: tx_key.clone(),
                            event_id: event_id.clone(),
                        }
                    } else {
                        e.into()
                    }
                })?;

                state.extend(delta);
                let update_time = storage_now();
                tx.execute(
                    "UPDATE sessions SET state = ?1, update_time = ?2 WHERE id = ?3",
                    params![serde_json::to_string(&state)?, format_ts(update_time), tx_key.session_id],
                )?;
                let events = load_events(&tx, &tx_key.session_id, None)?;

                control.ensure_live("append_event")?;
                tx.commit()?;
                Ok((events, state, update_time))
            })
            .await?;

        session.resync(events, state, update_time);
        tracing::debug!(session = %key, event = %event.id, "event appended");
        Ok(event)
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}
