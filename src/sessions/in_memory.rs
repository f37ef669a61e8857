//! In-memory session service implementation.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::error::{SessionError, SessionResult};
use super::event::Event;
use super::session::Session;
use super::state::{without_temp_keys, StateMap};
use super::traits::{resolve_session_id, EventPage, GetSessionConfig, SessionKey, SessionService};

type UserSessions = HashMap<String, Session>;
type AppUsers = HashMap<String, UserSessions>;

/// Session service backed by nested app → user → session maps.
///
/// One reader/writer lock guards the whole structure; each stored
/// [`Session`] additionally serializes its own log and state.
pub struct InMemorySessionService {
    sessions: RwLock<HashMap<String, AppUsers>>,
}

impl InMemorySessionService {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .values()
            .flat_map(HashMap::values)
            .map(HashMap::len)
            .sum()
    }
}

impl Default for InMemorySessionService {
    fn default() -> Self {
        Self::new()
    }
}

fn lookup<'a>(
    sessions: &'a HashMap<String, AppUsers>,
    key: &SessionKey,
) -> SessionResult<&'a Session> {
    sessions
        .get(&key.app_name)
        .and_then(|users| users.get(&key.user_id))
        .and_then(|user_sessions| user_sessions.get(&key.session_id))
        .ok_or_else(|| SessionError::NotFound(key.clone()))
}

#[async_trait]
impl SessionService for InMemorySessionService {
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        initial_state: StateMap,
        session_id: Option<&str>,
    ) -> SessionResult<Session> {
        let id = resolve_session_id(session_id);
        let session = Session::new(app_name, user_id, id.as_str(), without_temp_keys(&initial_state));

        let mut sessions = self.sessions.write();
        let user_sessions = sessions
            .entry(app_name.to_string())
            .or_default()
            .entry(user_id.to_string())
            .or_default();
        if user_sessions.contains_key(&id) {
            return Err(SessionError::DuplicateSession(session.key()));
        }
        user_sessions.insert(id.clone(), session.clone());
        drop(sessions);

        tracing::debug!(app = app_name, user = user_id, session = %id, "session created");
        Ok(session)
    }

    async fn get_session(
        &self,
        key: &SessionKey,
        config: Option<&GetSessionConfig>,
    ) -> SessionResult<Session> {
        let sessions = self.sessions.read();
        let stored = lookup(&sessions, key)?;
        Ok(stored.windowed(config))
    }

    async fn list_sessions(&self, app_name: &str, user_id: &str) -> SessionResult<Vec<Session>> {
        let sessions = self.sessions.read();
        let mut results: Vec<Session> = sessions
            .get(app_name)
            .and_then(|users| users.get(user_id))
            .map(|user_sessions| user_sessions.values().map(Session::metadata_only).collect())
            .unwrap_or_default();

        results.sort_by(|a, b| {
            b.update_time()
                .cmp(&a.update_time())
                .then_with(|| a.id().cmp(b.id()))
        });
        Ok(results)
    }

    async fn delete_session(&self, key: &SessionKey) -> SessionResult<()> {
        let mut sessions = self.sessions.write();
        let Some(users) = sessions.get_mut(&key.app_name) else {
            return Err(SessionError::NotFound(key.clone()));
        };
        let Some(user_sessions) = users.get_mut(&key.user_id) else {
            return Err(SessionError::NotFound(key.clone()));
        };
        if user_sessions.remove(&key.session_id).is_none() {
            return Err(SessionError::NotFound(key.clone()));
        }

        if user_sessions.is_empty() {
            users.remove(&key.user_id);
        }
        if users.is_empty() {
            sessions.remove(&key.app_name);
        }
        drop(sessions);

        tracing::debug!(session = %key, "session deleted");
        Ok(())
    }

    async fn list_events(&self, key: &SessionKey) -> SessionResult<EventPage> {
        let sessions = self.sessions.read();
        let stored = lookup(&sessions, key)?;
        Ok(EventPage {
            events: stored.events(),
            next_page_token: String::new(),
        })
    }

    async fn close_session(&self, _session: &Session) -> SessionResult<()> {
        Ok(())
    }

    async fn append_event(&self, session: &Session, event: Event) -> SessionResult<Event> {
        if event.partial {
            return Ok(event);
        }
        let key = session.key();
        let event = event.without_temp_state();

        let sessions = self.sessions.write();
        let stored = lookup(&sessions, &key)?;
        if stored.contains_event(&event.id) {
            return Err(SessionError::DuplicateEvent {
                session: key,
                event_id: event.id,
            });
        }
        stored.add_event(event.clone());
        session.sync_from(stored);
        drop(sessions);

        tracing::debug!(session = %key, event = %event.id, "event appended");
        Ok(event)
    }

    fn name(&self) -> &str {
        "in_memory"
    }
}
