//! Conversation events: the append-only records a session is built from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::state::{is_temp_key, StateMap};

/// Outcome reported by an external code executor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    Failed,
    DeadlineExceeded,
}

/// A file produced by a code execution backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct File {
    pub name: String,
    pub mime_type: String,
    /// Base64 for binary payloads, raw text otherwise.
    pub content: String,
}

/// One part of a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    FunctionCall {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        name: String,
        #[serde(default)]
        args: Value,
    },
    FunctionResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        name: String,
        #[serde(default)]
        response: Value,
    },
    CodeExecutionResult {
        outcome: Outcome,
        #[serde(default)]
        output: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        output_files: Vec<File>,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Structured message carried by an event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Content {
    pub role: String,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            parts: Vec::new(),
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.parts.push(Part::text(text));
        self
    }

    pub fn with_part(mut self, part: Part) -> Self {
        self.parts.push(part);
        self
    }
}

/// Side effects an event asks the runtime to apply.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventActions {
    #[serde(default, skip_serializing_if = "StateMap::is_empty")]
    pub state_delta: StateMap,
    #[serde(default)]
    pub skip_summarization: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_to_agent: Option<String>,
    #[serde(default)]
    pub escalate: bool,
}

impl EventActions {
    /// State delta with every `temp:` key removed.
    pub fn durable_state_delta(&self) -> StateMap {
        self.state_delta
            .iter()
            .filter(|(key, _)| !is_temp_key(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

/// Immutable-once-recorded record of one message or action in a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: String,
    pub invocation_id: String,
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(default)]
    pub actions: EventActions,
    pub timestamp: DateTime<Utc>,
    /// Incomplete streaming chunk; never persisted.
    #[serde(default)]
    pub partial: bool,
    #[serde(default)]
    pub turn_complete: bool,
    /// Dot-separated agent path used to isolate sub-agent histories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl Event {
    pub fn new(invocation_id: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            invocation_id: invocation_id.into(),
            author: author.into(),
            content: None,
            actions: EventActions::default(),
            timestamp: Utc::now(),
            partial: false,
            turn_complete: false,
            branch: None,
        }
    }

    pub fn new_invocation_id() -> String {
        format!("e-{}", uuid::Uuid::new_v4())
    }

    pub fn with_content(mut self, content: Content) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_text(self, role: &str, text: impl Into<String>) -> Self {
        self.with_content(Content::new(role).with_text(text))
    }

    pub fn with_state_delta<K, I>(mut self, delta: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        self.actions
            .state_delta
            .extend(delta.into_iter().map(|(k, v)| (k.into(), v)));
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn as_partial(mut self) -> Self {
        self.partial = true;
        self
    }

    /// Copy of this event as it is persisted: `temp:` keys dropped from the delta.
    pub fn without_temp_state(&self) -> Self {
        let mut event = self.clone();
        event.actions.state_delta.retain(|key, _| !is_temp_key(key));
        event
    }

    pub fn function_calls(&self) -> Vec<&Part> {
        self.parts()
            .filter(|part| matches!(part, Part::FunctionCall { .. }))
            .collect()
    }

    pub fn function_responses(&self) -> Vec<&Part> {
        self.parts()
            .filter(|part| matches!(part, Part::FunctionResponse { .. }))
            .collect()
    }

    /// Whether this event ends the agent's turn and can be shown to the user.
    pub fn is_final_response(&self) -> bool {
        if self.actions.skip_summarization {
            return true;
        }
        !self.partial
            && self.function_calls().is_empty()
            && self.function_responses().is_empty()
            && !self.has_trailing_code_result()
    }

    fn parts(&self) -> impl Iterator<Item = &Part> {
        self.content.iter().flat_map(|content| content.parts.iter())
    }

    fn has_trailing_code_result(&self) -> bool {
        self.content
            .as_ref()
            .and_then(|content| content.parts.last())
            .is_some_and(|part| matches!(part, Part::CodeExecutionResult { .. }))
    }
}
