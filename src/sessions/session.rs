//! A single conversation: ordered event log plus derived state.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::event::Event;
use super::state::{without_temp_keys, State, StateMap};
use super::traits::{GetSessionConfig, SessionKey};

#[derive(Debug, Clone)]
struct EventLog {
    events: Vec<Event>,
    update_time: DateTime<Utc>,
}

/// One conversation's event log and state.
///
/// The event log and the state are mutated under the session's log lock, so
/// an [`add_event`](Session::add_event) is observed atomically by concurrent
/// readers of the same instance.
#[derive(Debug)]
pub struct Session {
    app_name: String,
    user_id: String,
    id: String,
    create_time: DateTime<Utc>,
    log: Mutex<EventLog>,
    state: State,
}

/// Serializable form of a [`Session`], used on the wire and by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSnapshot {
    pub app_name: String,
    pub user_id: String,
    pub id: String,
    #[serde(default)]
    pub state: StateMap,
    #[serde(default)]
    pub events: Vec<Event>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl Session {
    pub fn new(
        app_name: impl Into<String>,
        user_id: impl Into<String>,
        id: impl Into<String>,
        initial_state: StateMap,
    ) -> Self {
        let now = Utc::now();
        Self::from_parts(
            app_name.into(),
            user_id.into(),
            id.into(),
            initial_state,
            Vec::new(),
            now,
            now,
        )
    }

    pub(crate) fn from_parts(
        app_name: String,
        user_id: String,
        id: String,
        state: StateMap,
        events: Vec<Event>,
        create_time: DateTime<Utc>,
        update_time: DateTime<Utc>,
    ) -> Self {
        Self {
            app_name,
            user_id,
            id,
            create_time,
            log: Mutex::new(EventLog {
                events,
                update_time,
            }),
            state: State::from_map(state),
        }
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.app_name, &self.user_id, &self.id)
    }

    pub fn create_time(&self) -> DateTime<Utc> {
        self.create_time
    }

    pub fn update_time(&self) -> DateTime<Utc> {
        self.log.lock().update_time
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Append an event; non-partial events fold their durable delta into state.
    pub fn add_event(&self, event: Event) {
        let mut log = self.log.lock();
        if !event.partial {
            let delta = event.actions.durable_state_delta();
            self.state.update(&delta);
        }
        log.events.push(event);
        log.update_time = Utc::now();
    }

    pub fn get_event(&self, id: &str) -> Option<Event> {
        self.log
            .lock()
            .events
            .iter()
            .find(|event| event.id == id)
            .cloned()
    }

    pub fn contains_event(&self, id: &str) -> bool {
        self.log.lock().events.iter().any(|event| event.id == id)
    }

    pub fn get_state(&self, key: &str) -> Option<Value> {
        let _log = self.log.lock();
        self.state.get(key)
    }

    pub fn set_state(&self, key: impl Into<String>, value: Value) {
        let mut log = self.log.lock();
        self.state.set(key, value);
        log.update_time = Utc::now();
    }

    /// Snapshot of the event log; later appends are not visible through it.
    pub fn events(&self) -> Vec<Event> {
        self.log.lock().events.clone()
    }

    pub fn event_count(&self) -> usize {
        self.log.lock().events.len()
    }

    pub fn state_snapshot(&self) -> StateMap {
        let _log = self.log.lock();
        self.state.to_map()
    }

    /// State as it is persisted: no `temp:` keys.
    pub fn durable_state(&self) -> StateMap {
        let _log = self.log.lock();
        self.state.durable_snapshot()
    }

    /// Overwrite this copy's events, state and update time with `other`'s.
    pub fn sync_from(&self, other: &Session) {
        let (events, state, update_time) = {
            let log = other.log.lock();
            (log.events.clone(), other.state.to_map(), log.update_time)
        };
        self.resync(events, state, update_time);
    }

    /// Replace this copy's log and state with the backend's committed view.
    pub(crate) fn resync(&self, events: Vec<Event>, state: StateMap, update_time: DateTime<Utc>) {
        let mut log = self.log.lock();
        log.events = events;
        log.update_time = update_time;
        self.state.replace(state);
    }

    /// Shallow copy with the event window narrowed by `config`.
    pub fn windowed(&self, config: Option<&GetSessionConfig>) -> Session {
        let copy = self.clone();
        if let Some(config) = config {
            let mut log = copy.log.lock();
            let events = std::mem::take(&mut log.events);
            log.events = config.apply(events);
        }
        copy
    }

    /// Copy carrying identity and timestamps only.
    pub fn metadata_only(&self) -> Session {
        Self::from_parts(
            self.app_name.clone(),
            self.user_id.clone(),
            self.id.clone(),
            StateMap::new(),
            Vec::new(),
            self.create_time,
            self.update_time(),
        )
    }

    pub fn to_snapshot(&self) -> SessionSnapshot {
        let log = self.log.lock();
        SessionSnapshot {
            app_name: self.app_name.clone(),
            user_id: self.user_id.clone(),
            id: self.id.clone(),
            state: self.state.to_map(),
            events: log.events.clone(),
            create_time: self.create_time,
            update_time: log.update_time,
        }
    }

    pub fn from_snapshot(snapshot: SessionSnapshot) -> Self {
        Self::from_parts(
            snapshot.app_name,
            snapshot.user_id,
            snapshot.id,
            without_temp_keys(&snapshot.state),
            snapshot.events,
            snapshot.create_time,
            snapshot.update_time,
        )
    }
}

impl Clone for Session {
    fn clone(&self) -> Self {
        let log = self.log.lock();
        Self {
            app_name: self.app_name.clone(),
            user_id: self.user_id.clone(),
            id: self.id.clone(),
            create_time: self.create_time,
            log: Mutex::new(log.clone()),
            state: self.state.clone(),
        }
    }
}
