//! Remote session service with in-memory fallback.
//!
//! Talks to a REST session API when an endpoint is configured. When no
//! endpoint is set, or the remote answers `501 Not Implemented`, the service
//! switches to an embedded [`InMemorySessionService`] for the rest of its
//! lifetime, so callers see the same contract either way.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::error::{SessionError, SessionResult};
use super::event::Event;
use super::in_memory::InMemorySessionService;
use super::session::{Session, SessionSnapshot};
use super::state::{without_temp_keys, StateMap};
use super::traits::{resolve_session_id, EventPage, GetSessionConfig, SessionKey, SessionService};
use crate::config::RemoteConfig;

const MAX_ERROR_BODY_CHARS: usize = 200;

#[derive(Debug, Serialize)]
struct CreateSessionBody<'a> {
    session_id: &'a str,
    state: &'a StateMap,
}

#[derive(Debug, Deserialize)]
struct ListSessionsResponse {
    #[serde(default)]
    sessions: Vec<SessionSnapshot>,
}

/// The recorded event plus the session as stored after the append.
#[derive(Debug, Deserialize)]
struct AppendEventResponse {
    event: Event,
    session: SessionSnapshot,
}

/// What a request addressed, for mapping 404/409 onto session errors.
#[derive(Debug, Clone, Copy)]
enum Target<'a> {
    Collection,
    Session(&'a SessionKey),
    Event {
        session: &'a SessionKey,
        event_id: &'a str,
    },
}

/// Thin REST client; `Ok(None)` means the remote does not implement the call.
struct RemoteClient {
    base_url: Url,
    api_key: Option<String>,
    client: Client,
}

impl RemoteClient {
    fn url(&self, segments: &[&str]) -> SessionResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                SessionError::StorageUnavailable(format!(
                    "remote endpoint {} cannot carry a path",
                    self.base_url
                ))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn sessions_url(&self, app_name: &str, user_id: &str) -> SessionResult<Url> {
        self.url(&["apps", app_name, "users", user_id, "sessions"])
    }

    fn session_url(&self, key: &SessionKey, tail: &[&str]) -> SessionResult<Url> {
        let mut segments = vec![
            "apps",
            key.app_name.as_str(),
            "users",
            key.user_id.as_str(),
            "sessions",
            key.session_id.as_str(),
        ];
        segments.extend_from_slice(tail);
        self.url(&segments)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn dispatch(builder: RequestBuilder) -> SessionResult<Response> {
        builder
            .send()
            .await
            .map_err(|e| SessionError::StorageUnavailable(format!("remote request failed: {e}")))
    }

    async fn send(
        &self,
        builder: RequestBuilder,
        target: Target<'_>,
    ) -> SessionResult<Option<Response>> {
        let response = Self::dispatch(builder).await?;
        let status = response.status();
        if status == StatusCode::NOT_IMPLEMENTED {
            return Ok(None);
        }
        if status.is_success() {
            return Ok(Some(response));
        }
        Err(status_error(status, response, target).await)
    }

    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        state: &StateMap,
        session_id: Option<&str>,
    ) -> SessionResult<Option<Session>> {
        let url = self.sessions_url(app_name, user_id)?;
        let key = SessionKey::new(app_name, user_id, resolve_session_id(session_id));
        let body = CreateSessionBody {
            session_id: &key.session_id,
            state,
        };
        let Some(response) = self
            .send(self.request(Method::POST, url).json(&body), Target::Session(&key))
            .await?
        else {
            return Ok(None);
        };
        let snapshot: SessionSnapshot = decode(response).await?;
        Ok(Some(Session::from_snapshot(snapshot)))
    }

    async fn get_session(
        &self,
        key: &SessionKey,
        config: Option<&GetSessionConfig>,
    ) -> SessionResult<Option<Session>> {
        let mut url = self.session_url(key, &[])?;
        if let Some(config) = config {
            if let Some(n) = config.num_recent_events {
                url.query_pairs_mut()
                    .append_pair("num_recent_events", &n.to_string());
            }
            if let Some(after) = config.after_timestamp {
                url.query_pairs_mut()
                    .append_pair("after_timestamp", &after.to_rfc3339());
            }
        }
        let Some(response) = self
            .send(self.request(Method::GET, url), Target::Session(key))
            .await?
        else {
            return Ok(None);
        };
        let snapshot: SessionSnapshot = decode(response).await?;
        let session = Session::from_snapshot(snapshot);
        // Re-apply locally in case the remote ignores the window parameters.
        Ok(Some(session.windowed(config)))
    }

    async fn list_sessions(
        &self,
        app_name: &str,
        user_id: &str,
    ) -> SessionResult<Option<Vec<Session>>> {
        let url = self.sessions_url(app_name, user_id)?;
        let response = Self::dispatch(self.request(Method::GET, url)).await?;
        let response = match response.status() {
            StatusCode::NOT_IMPLEMENTED => return Ok(None),
            StatusCode::NOT_FOUND => return Ok(Some(Vec::new())),
            status if status.is_success() => response,
            status => return Err(status_error(status, response, Target::Collection).await),
        };
        let listed: ListSessionsResponse = decode(response).await?;
        Ok(Some(
            listed
                .sessions
                .into_iter()
                .map(|snapshot| Session::from_snapshot(snapshot).metadata_only())
                .collect(),
        ))
    }

    async fn delete_session(&self, key: &SessionKey) -> SessionResult<Option<()>> {
        let url = self.session_url(key, &[])?;
        Ok(self
            .send(self.request(Method::DELETE, url), Target::Session(key))
            .await?
            .map(|_| ()))
    }

    async fn list_events(&self, key: &SessionKey) -> SessionResult<Option<EventPage>> {
        let url = self.session_url(key, &["events"])?;
        let Some(response) = self
            .send(self.request(Method::GET, url), Target::Session(key))
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(decode(response).await?))
    }

    async fn append_event(
        &self,
        key: &SessionKey,
        event: &Event,
    ) -> SessionResult<Option<AppendEventResponse>> {
        let url = self.session_url(key, &["events"])?;
        let Some(response) = self
            .send(
                self.request(Method::POST, url).json(event),
                Target::Event {
                    session: key,
                    event_id: &event.id,
                },
            )
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(decode(response).await?))
    }
}

async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> SessionResult<T> {
    let body = response
        .bytes()
        .await
        .map_err(|e| SessionError::StorageUnavailable(format!("remote body read failed: {e}")))?;
    serde_json::from_slice(&body)
        .map_err(|e| SessionError::InvalidState(format!("remote returned malformed document: {e}")))
}

async fn status_error(status: StatusCode, response: Response, target: Target<'_>) -> SessionError {
    match (status, target) {
        (StatusCode::NOT_FOUND, Target::Session(key) | Target::Event { session: key, .. }) => {
            return SessionError::NotFound(key.clone());
        }
        (StatusCode::CONFLICT, Target::Session(key)) => {
            return SessionError::DuplicateSession(key.clone());
        }
        (StatusCode::CONFLICT, Target::Event { session, event_id }) => {
            return SessionError::DuplicateEvent {
                session: session.clone(),
                event_id: event_id.to_string(),
            };
        }
        _ => {}
    }
    let body = response.text().await.unwrap_or_default();
    let body: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    SessionError::StorageUnavailable(format!("remote returned {status}: {body}"))
}

/// Session service delegating to a remote API, with an in-memory fallback.
pub struct RemoteSessionService {
    remote: Option<RemoteClient>,
    fallback: InMemorySessionService,
    degraded: AtomicBool,
}

impl RemoteSessionService {
    pub fn new(config: &RemoteConfig) -> SessionResult<Self> {
        let Some(endpoint) = config
            .endpoint
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
        else {
            return Ok(Self::fallback_only());
        };
        let base_url = Url::parse(endpoint).map_err(|e| {
            SessionError::StorageUnavailable(format!("invalid remote endpoint {endpoint:?}: {e}"))
        })?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new());

        Ok(Self {
            remote: Some(RemoteClient {
                base_url,
                api_key: config.api_key.clone(),
                client,
            }),
            fallback: InMemorySessionService::new(),
            degraded: AtomicBool::new(false),
        })
    }

    /// Service with no remote configured; everything is served in memory.
    pub fn fallback_only() -> Self {
        Self {
            remote: None,
            fallback: InMemorySessionService::new(),
            degraded: AtomicBool::new(false),
        }
    }

    /// Whether calls are currently served by the in-memory fallback.
    pub fn using_fallback(&self) -> bool {
        self.active().is_none()
    }

    fn active(&self) -> Option<&RemoteClient> {
        if self.degraded.load(Ordering::Acquire) {
            return None;
        }
        self.remote.as_ref()
    }

    fn degrade(&self, op: &str) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                op,
                "remote session API not implemented, switching to in-memory fallback"
            );
        }
    }
}

#[async_trait]
impl SessionService for RemoteSessionService {
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        initial_state: StateMap,
        session_id: Option<&str>,
    ) -> SessionResult<Session> {
        if let Some(remote) = self.active() {
            if let Some(session) = remote
                .create_session(app_name, user_id, &initial_state, session_id)
                .await?
            {
                return Ok(session);
            }
            self.degrade("create_session");
        }
        self.fallback
            .create_session(app_name, user_id, initial_state, session_id)
            .await
    }

    async fn get_session(
        &self,
        key: &SessionKey,
        config: Option<&GetSessionConfig>,
    ) -> SessionResult<Session> {
        if let Some(remote) = self.active() {
            if let Some(session) = remote.get_session(key, config).await? {
                return Ok(session);
            }
            self.degrade("get_session");
        }
        self.fallback.get_session(key, config).await
    }

    async fn list_sessions(&self, app_name: &str, user_id: &str) -> SessionResult<Vec<Session>> {
        if let Some(remote) = self.active() {
            if let Some(sessions) = remote.list_sessions(app_name, user_id).await? {
                return Ok(sessions);
            }
            self.degrade("list_sessions");
        }
        self.fallback.list_sessions(app_name, user_id).await
    }

    async fn delete_session(&self, key: &SessionKey) -> SessionResult<()> {
        if let Some(remote) = self.active() {
            if remote.delete_session(key).await?.is_some() {
                return Ok(());
            }
            self.degrade("delete_session");
        }
        self.fallback.delete_session(key).await
    }

    async fn list_events(&self, key: &SessionKey) -> SessionResult<EventPage> {
        if let Some(remote) = self.active() {
            if let Some(page) = remote.list_events(key).await? {
                return Ok(page);
            }
            self.degrade("list_events");
        }
        self.fallback.list_events(key).await
    }

    async fn close_session(&self, session: &Session) -> SessionResult<()> {
        if self.active().is_some() {
            return Ok(());
        }
        self.fallback.close_session(session).await
    }

    async fn append_event(&self, session: &Session, event: Event) -> SessionResult<Event> {
        if event.partial {
            return Ok(event);
        }
        if let Some(remote) = self.active() {
            let event = event.without_temp_state();
            if let Some(committed) = remote.append_event(&session.key(), &event).await? {
                let stored = committed.session;
                session.resync(stored.events, without_temp_keys(&stored.state), stored.update_time);
                return Ok(committed.event);
            }
            self.degrade("append_event");
        }
        self.fallback.append_event(session, event).await
    }

    fn name(&self) -> &str {
        "remote"
    }
}
