//! Session storage traits and types shared by every backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::SessionResult;
use super::event::Event;
use super::session::Session;
use super::state::StateMap;

/// Composite key identifying a unique session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub app_name: String,
    pub user_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(
        app_name: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.app_name, self.user_id, self.session_id)
    }
}

/// Restricts the event window returned by [`SessionService::get_session`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetSessionConfig {
    /// Keep only the most recent N events. `Some(0)` means no truncation.
    pub num_recent_events: Option<usize>,
    /// Keep only events strictly after this instant.
    pub after_timestamp: Option<DateTime<Utc>>,
}

impl GetSessionConfig {
    pub fn recent(n: usize) -> Self {
        Self {
            num_recent_events: Some(n),
            after_timestamp: None,
        }
    }

    pub fn after(timestamp: DateTime<Utc>) -> Self {
        Self {
            num_recent_events: None,
            after_timestamp: Some(timestamp),
        }
    }

    /// Timestamp filter first, tail truncation last.
    pub fn apply(&self, mut events: Vec<Event>) -> Vec<Event> {
        if let Some(after) = self.after_timestamp {
            events.retain(|event| event.timestamp > after);
        }
        if let Some(n) = self.num_recent_events.filter(|n| *n > 0) {
            let start = events.len().saturating_sub(n);
            events.drain(..start);
        }
        events
    }
}

/// One page of a session's event log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventPage {
    pub events: Vec<Event>,
    /// Continuation token; empty when there are no further pages.
    #[serde(default)]
    pub next_page_token: String,
}

/// Durable storage for conversation sessions, their event logs and state.
///
/// Every backend honors the same contract: session ids are unique per
/// `(app, user)`, partial events are never persisted, `temp:` state never
/// reaches storage, and events come back in append order.
#[async_trait]
pub trait SessionService: Send + Sync {
    /// Create a session. An empty or missing `session_id` gets a fresh id;
    /// an id that already exists is rejected with `DuplicateSession`.
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        initial_state: StateMap,
        session_id: Option<&str>,
    ) -> SessionResult<Session>;

    /// Fetch a session, optionally restricting the returned event window.
    async fn get_session(
        &self,
        key: &SessionKey,
        config: Option<&GetSessionConfig>,
    ) -> SessionResult<Session>;

    /// Session metadata for one user; no events, no state. Unknown app or
    /// user yields an empty list.
    async fn list_sessions(&self, app_name: &str, user_id: &str) -> SessionResult<Vec<Session>>;

    async fn delete_session(&self, key: &SessionKey) -> SessionResult<()>;

    async fn list_events(&self, key: &SessionKey) -> SessionResult<EventPage>;

    /// Backend-specific finalization hook.
    async fn close_session(&self, session: &Session) -> SessionResult<()>;

    /// Persist `event` and fold its durable state delta into the session.
    ///
    /// Partial events are returned unchanged without touching storage. On
    /// success the caller's `session` is resynchronized with the stored copy.
    async fn append_event(&self, session: &Session, event: Event) -> SessionResult<Event>;

    /// The name of this session backend.
    fn name(&self) -> &str;
}

/// Resolve the id for a new session: the caller's, or a fresh UUID.
pub(crate) fn resolve_session_id(session_id: Option<&str>) -> String {
    session_id
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn events_at(base: DateTime<Utc>, count: i64) -> Vec<Event> {
        (0..count)
            .map(|i| {
                let mut event = Event::new("inv", "user");
                event.id = format!("ev-{i}");
                event.timestamp = base + Duration::seconds(i);
                event
            })
            .collect()
    }

    fn ids(events: &[Event]) -> Vec<&str> {
        events.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn tail_keeps_last_events_in_order() {
        let events = events_at(Utc::now(), 5);
        let kept = GetSessionConfig::recent(2).apply(events);
        assert_eq!(ids(&kept), ["ev-3", "ev-4"]);
    }

    #[test]
    fn zero_recent_means_unbounded() {
        let events = events_at(Utc::now(), 3);
        assert_eq!(GetSessionConfig::recent(0).apply(events).len(), 3);
    }

    #[test]
    fn after_is_strict_and_applies_before_tail() {
        let base = Utc::now();
        let events = events_at(base, 5);
        let config = GetSessionConfig {
            num_recent_events: Some(10),
            after_timestamp: Some(base + Duration::seconds(2)),
        };
        assert_eq!(ids(&config.apply(events.clone())), ["ev-3", "ev-4"]);

        let config = GetSessionConfig {
            num_recent_events: Some(1),
            after_timestamp: Some(base),
        };
        assert_eq!(ids(&config.apply(events)), ["ev-4"]);
    }

    #[test]
    fn session_id_resolution() {
        assert_eq!(resolve_session_id(Some("abc")), "abc");
        assert_eq!(resolve_session_id(Some("  ")).len(), 36);
        assert_ne!(resolve_session_id(None), resolve_session_id(None));
    }
}
