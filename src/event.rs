//! Learner event types consumed from the append-only event log.
//!
//! Events arrive ordered by `(created_at, id)` per user. The engine never
//! writes events; it reads them strictly after a persisted cursor and
//! reduces them into run state and planner decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::ids::{ActivityId, BlockId, EventId, NodeId, PathId, UserId};

/// Types of learner events recognized by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Learner opened a path
    PathOpened,
    /// Learner closed a path
    PathClosed,
    /// Learner opened a node
    NodeOpened,
    /// Learner closed a node
    NodeClosed,
    /// A content block scrolled into view
    BlockViewed,
    /// A content block was read (dwell heuristic on the client)
    BlockRead,
    /// Scroll depth checkpoint within the node document
    ScrollDepth,
    /// Learner selected text
    TextSelected,
    /// Learner answered a question
    QuestionAnswered,
    /// Learner used a hint
    HintUsed,
    /// Learner opened an activity
    ActivityOpened,
    /// Learner started an activity attempt
    ActivityStarted,
    /// Learner completed an activity
    ActivityCompleted,
    /// Learner completed a quiz
    QuizCompleted,
    /// Learner completed a runtime prompt
    RuntimePromptCompleted,
    /// Learner dismissed a runtime prompt
    RuntimePromptDismissed,
    /// Unrecognized event type; skipped but cursored past
    #[serde(other)]
    Unknown,
}

impl EventType {
    /// Parse the wire form; `Unknown` for unrecognized types.
    pub fn parse(s: &str) -> Self {
        serde_json::from_value(Value::String(s.to_string())).unwrap_or(Self::Unknown)
    }

    /// Wire form of this event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PathOpened => "path_opened",
            Self::PathClosed => "path_closed",
            Self::NodeOpened => "node_opened",
            Self::NodeClosed => "node_closed",
            Self::BlockViewed => "block_viewed",
            Self::BlockRead => "block_read",
            Self::ScrollDepth => "scroll_depth",
            Self::TextSelected => "text_selected",
            Self::QuestionAnswered => "question_answered",
            Self::HintUsed => "hint_used",
            Self::ActivityOpened => "activity_opened",
            Self::ActivityStarted => "activity_started",
            Self::ActivityCompleted => "activity_completed",
            Self::QuizCompleted => "quiz_completed",
            Self::RuntimePromptCompleted => "runtime_prompt_completed",
            Self::RuntimePromptDismissed => "runtime_prompt_dismissed",
            Self::Unknown => "unknown",
        }
    }

    /// Whether the planner considers this event at all.
    pub fn is_planner_relevant(&self) -> bool {
        matches!(
            self,
            Self::BlockViewed
                | Self::BlockRead
                | Self::ScrollDepth
                | Self::QuestionAnswered
                | Self::RuntimePromptCompleted
                | Self::RuntimePromptDismissed
                | Self::ActivityCompleted
                | Self::QuizCompleted
        )
    }

    /// Reading-phase events for the node state machine.
    pub fn is_reading(&self) -> bool {
        matches!(
            self,
            Self::ScrollDepth | Self::BlockViewed | Self::BlockRead | Self::TextSelected
        )
    }

    /// Practice-phase events for the node state machine.
    pub fn is_practice(&self) -> bool {
        matches!(
            self,
            Self::ActivityOpened
                | Self::ActivityStarted
                | Self::QuestionAnswered
                | Self::HintUsed
                | Self::ActivityCompleted
                | Self::QuizCompleted
        )
    }

    /// Forward-progress signals that make a node a prefetch candidate.
    pub fn is_forward_progress(&self) -> bool {
        matches!(
            self,
            Self::NodeOpened
                | Self::BlockRead
                | Self::ScrollDepth
                | Self::QuestionAnswered
                | Self::ActivityCompleted
                | Self::QuizCompleted
        )
    }

    /// Events that invalidate a cached readiness snapshot.
    pub fn invalidates_readiness(&self) -> bool {
        matches!(
            self,
            Self::QuestionAnswered
                | Self::ActivityCompleted
                | Self::QuizCompleted
                | Self::RuntimePromptCompleted
                | Self::RuntimePromptDismissed
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A learner event from the append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id
    pub id: EventId,
    /// Owning user
    pub user_id: UserId,
    /// Event type
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Client-observed time
    pub occurred_at: DateTime<Utc>,
    /// Server append time; ordering key together with `id`
    pub created_at: DateTime<Utc>,
    /// Client session, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Explicit path context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_id: Option<PathId>,
    /// Explicit node context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    /// Explicit activity context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<ActivityId>,
    /// Free-form payload
    #[serde(default)]
    pub data: HashMap<String, Value>,
}

impl Event {
    /// Create an event with the given type and context, stamping both
    /// timestamps to `now`.
    pub fn new(user_id: UserId, event_type: EventType, now: DateTime<Utc>) -> Self {
        Self {
            id: EventId::new(),
            user_id,
            event_type,
            occurred_at: now,
            created_at: now,
            session_id: None,
            path_id: None,
            node_id: None,
            activity_id: None,
            data: HashMap::new(),
        }
    }

    /// Set the session id.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the path context.
    pub fn with_path(mut self, path_id: PathId) -> Self {
        self.path_id = Some(path_id);
        self
    }

    /// Set the node context.
    pub fn with_node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    /// Set the activity context.
    pub fn with_activity(mut self, activity_id: ActivityId) -> Self {
        self.activity_id = Some(activity_id);
        self
    }

    /// Add a data field.
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Cursor ordering key.
    pub fn cursor_key(&self) -> (DateTime<Utc>, EventId) {
        (self.created_at, self.id)
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    fn bool_field(&self, key: &str) -> Option<bool> {
        self.data.get(key).and_then(Value::as_bool)
    }

    fn f64_field(&self, key: &str) -> Option<f64> {
        self.data.get(key).and_then(Value::as_f64)
    }

    /// Block referenced by the event, if any.
    pub fn block_id(&self) -> Option<BlockId> {
        self.str_field("block_id").map(BlockId::from)
    }

    /// Question referenced by the event, if any.
    pub fn question_id(&self) -> Option<&str> {
        self.str_field("question_id")
    }

    /// Correctness of an answered question.
    pub fn is_correct(&self) -> Option<bool> {
        self.bool_field("is_correct")
    }

    /// Client-reported progress state (`progressing`, ...).
    pub fn progress_state(&self) -> Option<&str> {
        self.str_field("progress_state")
    }

    /// Confidence attached to the progress state.
    pub fn progress_confidence(&self) -> Option<f64> {
        self.f64_field("progress_confidence")
    }

    /// Prompt referenced by a prompt-outcome event.
    pub fn prompt_id(&self) -> Option<PromptIdRef<'_>> {
        self.str_field("prompt_id").map(PromptIdRef)
    }

    /// Whether the event marks the node as completed.
    pub fn node_completed(&self) -> bool {
        self.bool_field("node_completed").unwrap_or(false)
    }

    /// Whether the answer demonstrated transfer to a new context.
    pub fn transfer_success(&self) -> bool {
        self.bool_field("transfer_success").unwrap_or(false)
    }

    /// Concept ids attached directly to the event payload.
    pub fn concept_ids(&self) -> Vec<crate::ids::ConceptId> {
        self.data
            .get("concept_ids")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .filter_map(crate::ids::ConceptId::parse)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Payload normalized for the transition record: the data bag with
    /// `event_id`, `event_type`, `session_id`, `occurred_at` injected
    /// when missing.
    pub fn normalized_data(&self) -> HashMap<String, Value> {
        let mut data = self.data.clone();
        data.entry("event_id".to_string())
            .or_insert_with(|| Value::String(self.id.to_string()));
        data.entry("event_type".to_string())
            .or_insert_with(|| Value::String(self.event_type.as_str().to_string()));
        if let Some(session_id) = &self.session_id {
            data.entry("session_id".to_string())
                .or_insert_with(|| Value::String(session_id.clone()));
        }
        data.entry("occurred_at".to_string())
            .or_insert_with(|| Value::String(self.occurred_at.to_rfc3339()));
        data
    }
}

/// Borrowed prompt-id field from an event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptIdRef<'a>(pub &'a str);

impl PromptIdRef<'_> {
    /// Whether this reference matches the given prompt id.
    pub fn matches(&self, id: &crate::ids::PromptId) -> bool {
        crate::ids::PromptId::parse(self.0).map(|p| p == *id).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_round_trip() {
        for ty in [
            EventType::NodeOpened,
            EventType::BlockRead,
            EventType::QuestionAnswered,
            EventType::RuntimePromptDismissed,
        ] {
            assert_eq!(EventType::parse(ty.as_str()), ty);
        }
    }

    #[test]
    fn test_unknown_event_type() {
        assert_eq!(EventType::parse("telepathy_detected"), EventType::Unknown);
        assert!(!EventType::Unknown.is_planner_relevant());
    }

    #[test]
    fn test_planner_relevance() {
        assert!(EventType::BlockRead.is_planner_relevant());
        assert!(EventType::QuizCompleted.is_planner_relevant());
        assert!(!EventType::NodeOpened.is_planner_relevant());
        assert!(!EventType::TextSelected.is_planner_relevant());
    }

    #[test]
    fn test_data_accessors() {
        let now = Utc::now();
        let event = Event::new(UserId::new(), EventType::QuestionAnswered, now)
            .with_data("block_id", "q1")
            .with_data("is_correct", true)
            .with_data("progress_confidence", 0.8);
        assert_eq!(event.block_id(), Some(BlockId::from("q1")));
        assert_eq!(event.is_correct(), Some(true));
        assert_eq!(event.progress_confidence(), Some(0.8));
        assert!(!event.node_completed());
    }

    #[test]
    fn test_normalized_data_injects_missing_fields() {
        let now = Utc::now();
        let event =
            Event::new(UserId::new(), EventType::BlockRead, now).with_session("sess-1");
        let data = event.normalized_data();
        assert_eq!(
            data.get("event_type").and_then(Value::as_str),
            Some("block_read")
        );
        assert_eq!(
            data.get("session_id").and_then(Value::as_str),
            Some("sess-1")
        );
        assert!(data.contains_key("event_id"));
        assert!(data.contains_key("occurred_at"));
    }

    #[test]
    fn test_normalized_data_preserves_explicit_fields() {
        let now = Utc::now();
        let event = Event::new(UserId::new(), EventType::BlockRead, now)
            .with_data("event_type", "already_set");
        let data = event.normalized_data();
        assert_eq!(
            data.get("event_type").and_then(Value::as_str),
            Some("already_set")
        );
    }
}
