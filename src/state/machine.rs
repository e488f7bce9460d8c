//! Run-state machines for paths, nodes, and activities.
//!
//! Transitions are pure functions of `(current_state, event_type, data)`.
//! All persistence happens elsewhere; these functions are called inside
//! the page transaction and never touch I/O.

use serde::{Deserialize, Serialize};

use crate::event::{Event, EventType};

/// Run state of a path for one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathRunState {
    /// No events observed yet
    NotStarted,
    /// Reading a node
    InNode,
    /// Working an activity
    InActivity,
    /// Answered; awaiting feedback
    AwaitingFeedback,
    /// Waiting on the learner
    AwaitingUser,
    /// Closed the node or path
    Paused,
    /// Terminal
    Completed,
}

/// Run state of a node for one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRunState {
    /// No events observed yet
    NotStarted,
    /// Reading the document
    Reading,
    /// Practicing (activities, questions)
    Practice,
    /// Terminal
    Completed,
}

/// Run state of an activity for one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityRunState {
    /// No events observed yet
    NotStarted,
    /// Attempt in progress
    Attempting,
    /// Last answer evaluated
    Evaluated,
    /// Terminal
    Completed,
}

/// Next path state for an event. Unhandled events leave the state as is.
pub fn path_transition(current: PathRunState, event: &Event) -> PathRunState {
    use EventType::*;
    // Completed is terminal
    if current == PathRunState::Completed {
        return current;
    }
    if event.node_completed() {
        return PathRunState::Completed;
    }
    match event.event_type {
        PathOpened | NodeOpened => PathRunState::InNode,
        ActivityOpened | ActivityStarted => PathRunState::InActivity,
        QuestionAnswered => PathRunState::AwaitingFeedback,
        ActivityCompleted | QuizCompleted => PathRunState::InNode,
        HintUsed if current == PathRunState::NotStarted => PathRunState::InActivity,
        NodeClosed if current == PathRunState::InNode => PathRunState::Paused,
        PathClosed => PathRunState::Paused,
        _ => current,
    }
}

/// Next node state for an event.
pub fn node_transition(current: NodeRunState, event: &Event) -> NodeRunState {
    if current == NodeRunState::Completed {
        return current;
    }
    if event.node_completed() {
        return NodeRunState::Completed;
    }
    if event.event_type == EventType::NodeOpened {
        return NodeRunState::Reading;
    }
    if event.event_type.is_practice() {
        return NodeRunState::Practice;
    }
    if event.event_type.is_reading() && current == NodeRunState::NotStarted {
        return NodeRunState::Reading;
    }
    current
}

/// Next activity state for an event.
pub fn activity_transition(current: ActivityRunState, event: &Event) -> ActivityRunState {
    use EventType::*;
    if current == ActivityRunState::Completed {
        return current;
    }
    match event.event_type {
        ActivityOpened | ActivityStarted => ActivityRunState::Attempting,
        QuestionAnswered => ActivityRunState::Evaluated,
        HintUsed => ActivityRunState::Attempting,
        ActivityCompleted | QuizCompleted => ActivityRunState::Completed,
        _ => current,
    }
}
