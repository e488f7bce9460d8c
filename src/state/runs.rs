//! Per-user run rows for paths, nodes, and activities, plus the
//! idempotency transition record.
//!
//! Rows are upserted lazily on the first relevant event and never deleted.
//! Transition rows are insert-only and unique per `(user_id, event_id)`;
//! they are what makes event replay idempotent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::event::{Event, EventType};
use crate::ids::{ActivityId, EventId, NodeId, PathId, UserId};
use crate::state::machine::{
    activity_transition, node_transition, path_transition, ActivityRunState, NodeRunState,
    PathRunState,
};
use crate::state::runtime::{NodeRuntimeState, PathRuntimeState};

/// One user's run through a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathRun {
    /// Owning user
    pub user_id: UserId,
    /// Path
    pub path_id: PathId,
    /// Current run state
    pub state: PathRunState,
    /// Node the learner is currently in
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_node_id: Option<NodeId>,
    /// Activity the learner is currently in
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_activity_id: Option<ActivityId>,
    /// Engine-owned runtime state
    #[serde(default)]
    pub runtime: PathRuntimeState,
    /// Last update
    pub updated_at: DateTime<Utc>,
}

impl PathRun {
    /// In-memory default for a user who has no row yet.
    pub fn not_started(user_id: UserId, path_id: PathId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            path_id,
            state: PathRunState::NotStarted,
            active_node_id: None,
            active_activity_id: None,
            runtime: PathRuntimeState::default(),
            updated_at: now,
        }
    }

    /// Apply an event: compute the next state and maintain the active
    /// node/activity pointers. Returns `(from_state, to_state)`.
    pub fn apply_event(&mut self, event: &Event, now: DateTime<Utc>) -> (PathRunState, PathRunState) {
        let from = self.state;
        let to = path_transition(from, event);
        self.state = to;
        if let Some(node_id) = event.node_id {
            self.active_node_id = Some(node_id);
        }
        if let Some(activity_id) = event.activity_id {
            self.active_activity_id = Some(activity_id);
        }
        if matches!(
            event.event_type,
            EventType::ActivityCompleted | EventType::QuizCompleted
        ) {
            self.active_activity_id = None;
        }
        self.updated_at = now;
        (from, to)
    }
}

/// One user's run through a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRun {
    /// Owning user
    pub user_id: UserId,
    /// Node
    pub node_id: NodeId,
    /// Current run state
    pub state: NodeRunState,
    /// Answered-question attempts
    pub attempt_count: u32,
    /// Score of the last answer (1.0 / 0.0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_score: Option<f64>,
    /// First open
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Last reading activity
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Engine-owned runtime state
    #[serde(default)]
    pub runtime: NodeRuntimeState,
    /// Last update
    pub updated_at: DateTime<Utc>,
}

impl NodeRun {
    /// In-memory default for a node with no row yet.
    pub fn not_started(user_id: UserId, node_id: NodeId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            node_id,
            state: NodeRunState::NotStarted,
            attempt_count: 0,
            last_score: None,
            started_at: None,
            completed_at: None,
            last_seen_at: None,
            runtime: NodeRuntimeState::default(),
            updated_at: now,
        }
    }

    /// Apply an event to the run row and its runtime state.
    /// Returns `(from_state, to_state)`.
    pub fn apply_event(&mut self, event: &Event, now: DateTime<Utc>) -> (NodeRunState, NodeRunState) {
        let from = self.state;
        let to = node_transition(from, event);
        self.state = to;

        match event.event_type {
            EventType::NodeOpened => {
                if self.started_at.is_none() {
                    self.started_at = Some(event.occurred_at);
                }
            }
            EventType::BlockViewed => {
                self.runtime.note_block_viewed();
                self.last_seen_at = Some(event.occurred_at);
            }
            EventType::BlockRead => {
                if let Some(block_id) = event.block_id() {
                    self.runtime.note_block_read(block_id);
                }
                self.last_seen_at = Some(event.occurred_at);
            }
            EventType::ScrollDepth | EventType::TextSelected => {
                self.last_seen_at = Some(event.occurred_at);
            }
            EventType::QuestionAnswered => {
                let is_correct = event.is_correct().unwrap_or(false);
                self.attempt_count = self.attempt_count.saturating_add(1);
                self.last_score = Some(if is_correct { 1.0 } else { 0.0 });
                self.runtime.note_answer(is_correct);
            }
            _ => {}
        }

        if to == NodeRunState::Completed && self.completed_at.is_none() {
            self.completed_at = Some(event.occurred_at);
        }
        self.updated_at = now;
        (from, to)
    }
}

/// One user's run through an activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRun {
    /// Owning user
    pub user_id: UserId,
    /// Activity
    pub activity_id: ActivityId,
    /// Current run state
    pub state: ActivityRunState,
    /// Attempts (answers and hints)
    pub attempts: u32,
    /// Score of the last answer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_score: Option<f64>,
    /// Last attempt start
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Last update
    pub updated_at: DateTime<Utc>,
}

impl ActivityRun {
    /// In-memory default for an activity with no row yet.
    pub fn not_started(user_id: UserId, activity_id: ActivityId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            activity_id,
            state: ActivityRunState::NotStarted,
            attempts: 0,
            last_score: None,
            last_attempt_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Apply an event. Returns `(from_state, to_state)`.
    pub fn apply_event(
        &mut self,
        event: &Event,
        now: DateTime<Utc>,
    ) -> (ActivityRunState, ActivityRunState) {
        let from = self.state;
        let to = activity_transition(from, event);
        self.state = to;

        match event.event_type {
            EventType::ActivityOpened | EventType::ActivityStarted => {
                self.last_attempt_at = Some(event.occurred_at);
            }
            EventType::QuestionAnswered => {
                self.attempts = self.attempts.saturating_add(1);
                self.last_score = Some(if event.is_correct().unwrap_or(false) {
                    1.0
                } else {
                    0.0
                });
            }
            EventType::HintUsed => {
                self.attempts = self.attempts.saturating_add(1);
            }
            EventType::ActivityCompleted | EventType::QuizCompleted => {
                if self.completed_at.is_none() {
                    self.completed_at = Some(event.occurred_at);
                }
            }
            _ => {}
        }
        self.updated_at = now;
        (from, to)
    }
}

/// The idempotency record inserted once per processed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathRunTransition {
    /// Owning user
    pub user_id: UserId,
    /// Processed event; unique together with `user_id`
    pub event_id: EventId,
    /// Path the event applied to
    pub path_id: PathId,
    /// Event type
    pub event_type: EventType,
    /// Path state before the event
    pub from_state: PathRunState,
    /// Path state after the event
    pub to_state: PathRunState,
    /// Client-observed event time
    pub occurred_at: DateTime<Utc>,
    /// Normalized event payload
    #[serde(default)]
    pub payload: HashMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::BlockId;
    use pretty_assertions::assert_eq;

    fn user_event(event_type: EventType) -> Event {
        Event::new(UserId::new(), event_type, Utc::now())
    }

    #[test]
    fn test_path_run_tracks_active_pointers() {
        let now = Utc::now();
        let user = UserId::new();
        let path = PathId::new();
        let node = NodeId::new();
        let activity = ActivityId::new();
        let mut run = PathRun::not_started(user, path, now);

        run.apply_event(&user_event(EventType::NodeOpened).with_node(node), now);
        assert_eq!(run.state, PathRunState::InNode);
        assert_eq!(run.active_node_id, Some(node));

        run.apply_event(
            &user_event(EventType::ActivityOpened).with_activity(activity),
            now,
        );
        assert_eq!(run.state, PathRunState::InActivity);
        assert_eq!(run.active_activity_id, Some(activity));

        // Completing the activity clears the pointer and returns to the node
        run.apply_event(&user_event(EventType::ActivityCompleted), now);
        assert_eq!(run.state, PathRunState::InNode);
        assert_eq!(run.active_activity_id, None);
        assert_eq!(run.active_node_id, Some(node));
    }

    #[test]
    fn test_node_run_reading_bookkeeping() {
        let now = Utc::now();
        let mut run = NodeRun::not_started(UserId::new(), NodeId::new(), now);

        run.apply_event(&user_event(EventType::NodeOpened), now);
        assert_eq!(run.state, NodeRunState::Reading);
        assert!(run.started_at.is_some());

        run.apply_event(&user_event(EventType::BlockViewed).with_data("block_id", "p1"), now);
        run.apply_event(&user_event(EventType::BlockRead).with_data("block_id", "p1"), now);
        assert_eq!(run.runtime.blocks_seen, 1);
        assert_eq!(run.runtime.read_blocks, vec![BlockId::from("p1")]);
        assert!(run.last_seen_at.is_some());
    }

    #[test]
    fn test_node_run_scoring() {
        let now = Utc::now();
        let mut run = NodeRun::not_started(UserId::new(), NodeId::new(), now);

        run.apply_event(
            &user_event(EventType::QuestionAnswered).with_data("is_correct", false),
            now,
        );
        assert_eq!(run.state, NodeRunState::Practice);
        assert_eq!(run.attempt_count, 1);
        assert_eq!(run.last_score, Some(0.0));
        assert_eq!(run.runtime.fail_streak, 1);

        run.apply_event(
            &user_event(EventType::QuestionAnswered).with_data("is_correct", true),
            now,
        );
        assert_eq!(run.attempt_count, 2);
        assert_eq!(run.last_score, Some(1.0));
        assert_eq!(run.runtime.fail_streak, 0);
    }

    #[test]
    fn test_node_run_completion_stamp() {
        let now = Utc::now();
        let mut run = NodeRun::not_started(UserId::new(), NodeId::new(), now);
        run.apply_event(
            &user_event(EventType::QuizCompleted).with_data("node_completed", true),
            now,
        );
        assert_eq!(run.state, NodeRunState::Completed);
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn test_activity_run_attempts() {
        let now = Utc::now();
        let mut run = ActivityRun::not_started(UserId::new(), ActivityId::new(), now);

        run.apply_event(&user_event(EventType::ActivityStarted), now);
        assert_eq!(run.state, ActivityRunState::Attempting);
        assert!(run.last_attempt_at.is_some());

        run.apply_event(&user_event(EventType::HintUsed), now);
        assert_eq!(run.state, ActivityRunState::Attempting);
        assert_eq!(run.attempts, 1);

        run.apply_event(
            &user_event(EventType::QuestionAnswered).with_data("is_correct", true),
            now,
        );
        assert_eq!(run.state, ActivityRunState::Evaluated);
        assert_eq!(run.attempts, 2);
        assert_eq!(run.last_score, Some(1.0));

        run.apply_event(&user_event(EventType::ActivityCompleted), now);
        assert_eq!(run.state, ActivityRunState::Completed);
        assert!(run.completed_at.is_some());
    }
}
