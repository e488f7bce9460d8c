//! Typed runtime state carried on path and node runs.
//!
//! The storage layer persists these as the `metadata.runtime` JSON blobs;
//! every field tolerates absence so blobs written by older builds keep
//! deserializing. The engine is the only writer.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::RlMode;
use crate::ids::{BlockId, NodeId, PromptId, TraceId};
use crate::readiness::ReadinessSnapshot;

/// Kind of runtime prompt surfaced to the learner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptType {
    /// Inline quick-check question
    QuickCheck,
    /// Flashcard review
    Flashcard,
    /// Suggested break
    Break,
}

impl PromptType {
    /// Wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QuickCheck => "quick_check",
            Self::Flashcard => "flashcard",
            Self::Break => "break",
        }
    }
}

impl std::fmt::Display for PromptType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a prompt was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptReason {
    /// Probing a suspected misconception
    CounterfactualProbe,
    /// Learner classified not ready
    ReadinessNotReady,
    /// Highest expected information gain
    BanditInfoGain,
    /// Plain cadence
    Cadence,
    /// Session time elapsed
    TimeElapsed,
    /// Fatigue threshold crossed
    Fatigue,
}

impl PromptReason {
    /// Wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CounterfactualProbe => "counterfactual_probe",
            Self::ReadinessNotReady => "readiness_not_ready",
            Self::BanditInfoGain => "bandit_info_gain",
            Self::Cadence => "cadence",
            Self::TimeElapsed => "time_elapsed",
            Self::Fatigue => "fatigue",
        }
    }
}

impl std::fmt::Display for PromptReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a runtime prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptStatus {
    /// Surfaced, outcome unknown
    Pending,
    /// Completed (or answered correctly)
    Completed,
    /// Dismissed by the learner
    Dismissed,
    /// Answered incorrectly
    Answered,
}

impl PromptStatus {
    /// Wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Dismissed => "dismissed",
            Self::Answered => "answered",
        }
    }
}

impl std::fmt::Display for PromptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A runtime prompt surfaced (or about to be surfaced) to the learner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimePrompt {
    /// Prompt id
    pub id: PromptId,
    /// Prompt kind
    #[serde(rename = "type")]
    pub prompt_type: PromptType,
    /// Node the prompt belongs to
    pub node_id: NodeId,
    /// Block backing the prompt; absent for breaks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_id: Option<BlockId>,
    /// Selection reason
    pub reason: PromptReason,
    /// Lifecycle status
    pub status: PromptStatus,
    /// When the prompt was emitted
    pub created_at: DateTime<Utc>,
    /// Policy snapshot key consulted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_key: Option<String>,
    /// Policy mode at emission
    pub policy_mode: RlMode,
    /// Policy snapshot version, when a model was loaded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_version: Option<i64>,
    /// Probability the acting distribution assigned the chosen candidate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub behavior_prob: Option<f64>,
    /// Probability the counterpart distribution assigned it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shadow_prob: Option<f64>,
    /// Decision trace recorded at emission
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_trace_id: Option<TraceId>,
}

/// Per-block bandit counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct BanditStats {
    /// Times the block was surfaced
    #[serde(default)]
    pub shown: u32,
    /// Answer attempts against the block
    #[serde(default)]
    pub attempts: u32,
    /// Correct answers
    #[serde(default)]
    pub correct: u32,
    /// Completions
    #[serde(default)]
    pub completed: u32,
    /// Dismissals
    #[serde(default)]
    pub dismissed: u32,
    /// Last time the block was surfaced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_shown_at: Option<DateTime<Utc>>,
    /// Score of the last attempt (1.0 / 0.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_score: Option<f64>,
    /// Info gain estimated when last shown
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_info_gain: Option<f64>,
}

/// Bandit state embedded in the node runtime blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BanditState {
    /// Per-block counters, keyed by block id
    #[serde(default)]
    pub blocks: HashMap<String, BanditStats>,
}

impl BanditState {
    /// Counters for a block, zeroed when absent.
    pub fn stats(&self, block_id: &BlockId) -> BanditStats {
        self.blocks.get(block_id.as_str()).copied().unwrap_or_default()
    }

    /// Mutable counters for a block, created when absent.
    pub fn stats_mut(&mut self, block_id: &BlockId) -> &mut BanditStats {
        self.blocks.entry(block_id.as_str().to_string()).or_default()
    }

    /// Total times any block was surfaced; drives UCB exploration.
    pub fn total_shown(&self) -> u32 {
        self.blocks.values().map(|s| s.shown).sum()
    }
}

/// Runtime state carried on a node run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NodeRuntimeState {
    /// Count of block-viewed events
    #[serde(default)]
    pub blocks_seen: u32,
    /// Blocks read, in first-read order
    #[serde(default)]
    pub read_blocks: Vec<BlockId>,
    /// Blocks surfaced as prompts
    #[serde(default)]
    pub shown_blocks: Vec<BlockId>,
    /// Prompt blocks completed
    #[serde(default)]
    pub completed_blocks: Vec<BlockId>,
    /// Quick-checks surfaced this node
    #[serde(default)]
    pub quick_checks_shown: u32,
    /// Flashcards surfaced this node
    #[serde(default)]
    pub flashcards_shown: u32,
    /// When the last quick-check was surfaced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_quick_check_at: Option<DateTime<Utc>>,
    /// Block progress when the last quick-check was surfaced
    #[serde(default)]
    pub last_quick_check_blocks: u32,
    /// When the last flashcard was surfaced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_flashcard_at: Option<DateTime<Utc>>,
    /// Block progress when the last flashcard was surfaced
    #[serde(default)]
    pub last_flashcard_blocks: u32,
    /// Consecutive incorrect answers
    #[serde(default)]
    pub fail_streak: u32,
    /// Per-block bandit counters
    #[serde(default)]
    pub bandit: BanditState,
    /// Cached readiness snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness: Option<ReadinessSnapshot>,
}

impl NodeRuntimeState {
    /// Block progress used by cadence gates.
    pub fn blocks_for_cadence(&self) -> u32 {
        self.blocks_seen.max(self.read_blocks.len() as u32)
    }

    /// Record a block-viewed event.
    pub fn note_block_viewed(&mut self) {
        self.blocks_seen = self.blocks_seen.saturating_add(1);
    }

    /// Record a block-read event.
    pub fn note_block_read(&mut self, block_id: BlockId) {
        if !self.read_blocks.contains(&block_id) {
            self.read_blocks.push(block_id);
        }
    }

    /// Record an answered question for the fail streak.
    pub fn note_answer(&mut self, is_correct: bool) {
        if is_correct {
            self.fail_streak = 0;
        } else {
            self.fail_streak = self.fail_streak.saturating_add(1);
        }
    }

    /// Whether a prompt block was already surfaced.
    pub fn was_shown(&self, block_id: &BlockId) -> bool {
        self.shown_blocks.contains(block_id)
    }

    /// Whether a prompt block was completed.
    pub fn was_completed(&self, block_id: &BlockId) -> bool {
        self.completed_blocks.contains(block_id)
    }

    /// Record a prompt emission for a block.
    pub fn mark_shown(
        &mut self,
        block_id: &BlockId,
        prompt_type: PromptType,
        info_gain: f64,
        now: DateTime<Utc>,
    ) {
        if !self.shown_blocks.contains(block_id) {
            self.shown_blocks.push(block_id.clone());
        }
        let blocks = self.blocks_for_cadence();
        match prompt_type {
            PromptType::QuickCheck => {
                self.quick_checks_shown = self.quick_checks_shown.saturating_add(1);
                self.last_quick_check_at = Some(now);
                self.last_quick_check_blocks = blocks;
            }
            PromptType::Flashcard => {
                self.flashcards_shown = self.flashcards_shown.saturating_add(1);
                self.last_flashcard_at = Some(now);
                self.last_flashcard_blocks = blocks;
            }
            PromptType::Break => {}
        }
        let stats = self.bandit.stats_mut(block_id);
        stats.shown = stats.shown.saturating_add(1);
        stats.last_shown_at = Some(now);
        stats.last_info_gain = Some(info_gain);
    }

    /// Record a prompt block completion.
    pub fn mark_block_completed(&mut self, block_id: &BlockId) {
        if !self.completed_blocks.contains(block_id) {
            self.completed_blocks.push(block_id.clone());
        }
        let stats = self.bandit.stats_mut(block_id);
        stats.completed = stats.completed.saturating_add(1);
    }

    /// Make a previously shown but uncompleted block eligible again.
    pub fn unshow_block(&mut self, block_id: &BlockId) {
        self.shown_blocks.retain(|b| b != block_id);
    }
}

/// Progress signal reconciled from one client session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSource {
    /// Last event type observed from the session
    pub last_event_type: String,
    /// When it was observed
    pub last_at: DateTime<Utc>,
    /// Client-reported progress state, when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_state: Option<String>,
    /// Confidence of the progress state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_confidence: Option<f64>,
}

/// Runtime state carried on a path run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PathRuntimeState {
    /// First event of the current session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_started_at: Option<DateTime<Utc>>,
    /// Start of the rolling prompt window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_window_started_at: Option<DateTime<Utc>>,
    /// Prompts emitted in the current window
    #[serde(default)]
    pub prompts_in_window: u32,
    /// Last prompt emission
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_prompt_at: Option<DateTime<Utc>>,
    /// Last break prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_break_at: Option<DateTime<Utc>>,
    /// Latest computed fatigue score
    #[serde(default)]
    pub fatigue_score: f64,
    /// Pending prompt, when one is outstanding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_prompt: Option<RuntimePrompt>,
    /// Terminal status of the most recently cleared prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_prompt_status: Option<PromptStatus>,
    /// Per-session progress signals
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub signal_sources: HashMap<String, SignalSource>,
    /// Since when the learner has been continuously progressing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progressing_since: Option<DateTime<Utc>>,
    /// Trigger of the last zero-event run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_runtime_trigger: Option<String>,
    /// When the last zero-event run happened
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_runtime_trigger_at: Option<DateTime<Utc>>,
    /// Last document prefetch enqueue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_prefetch_at: Option<DateTime<Utc>>,
    /// Start of the probe-selection budget window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_window_started_at: Option<DateTime<Utc>>,
    /// Probe selections enqueued in the current window
    #[serde(default)]
    pub probe_selects_in_window: u32,
}

impl PathRuntimeState {
    /// Record a planner-relevant event against its session, keeping
    /// `progressing_since` in line with the reported progress state.
    pub fn note_signal(&mut self, event: &crate::event::Event, now: DateTime<Utc>) {
        if self.session_started_at.is_none() {
            self.session_started_at = Some(now);
        }
        let progress_state = event.progress_state().map(str::to_string);
        if let Some(session_id) = &event.session_id {
            self.signal_sources.insert(
                session_id.clone(),
                SignalSource {
                    last_event_type: event.event_type.as_str().to_string(),
                    last_at: now,
                    progress_state: progress_state.clone(),
                    progress_confidence: event.progress_confidence(),
                },
            );
        }
        match progress_state.as_deref() {
            Some("progressing") => {
                if self.progressing_since.is_none() {
                    self.progressing_since = Some(now);
                }
            }
            Some(_) => self.progressing_since = None,
            None => {}
        }
    }

    /// The most recent progress signal across all sessions.
    pub fn latest_signal(&self) -> Option<&SignalSource> {
        self.signal_sources.values().max_by_key(|s| s.last_at)
    }

    /// Reset the prompt window when it is older than an hour, then
    /// report whether the hourly cap leaves room for another prompt.
    pub fn window_has_room(&mut self, max_prompts_per_hour: u32, now: DateTime<Utc>) -> bool {
        let stale = self
            .prompt_window_started_at
            .map(|start| now - start > Duration::hours(1))
            .unwrap_or(true);
        if stale {
            self.prompt_window_started_at = Some(now);
            self.prompts_in_window = 0;
        }
        self.prompts_in_window < max_prompts_per_hour
    }

    /// Record a prompt emission.
    pub fn note_prompt_emitted(&mut self, prompt: RuntimePrompt, now: DateTime<Utc>) {
        if prompt.prompt_type == PromptType::Break {
            self.last_break_at = Some(now);
        }
        self.prompts_in_window = self.prompts_in_window.saturating_add(1);
        self.last_prompt_at = Some(now);
        self.runtime_prompt = Some(prompt);
    }

    /// Clear the pending prompt with its terminal status.
    pub fn clear_prompt(&mut self, status: PromptStatus) -> Option<RuntimePrompt> {
        let cleared = self.runtime_prompt.take();
        if cleared.is_some() {
            self.last_prompt_status = Some(status);
        }
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventType};
    use crate::ids::UserId;

    #[test]
    fn test_blocks_for_cadence_takes_max() {
        let mut state = NodeRuntimeState::default();
        state.note_block_viewed();
        state.note_block_read(BlockId::from("p1"));
        state.note_block_read(BlockId::from("p2"));
        assert_eq!(state.blocks_for_cadence(), 2);
    }

    #[test]
    fn test_read_blocks_deduplicate() {
        let mut state = NodeRuntimeState::default();
        state.note_block_read(BlockId::from("p1"));
        state.note_block_read(BlockId::from("p1"));
        assert_eq!(state.read_blocks.len(), 1);
    }

    #[test]
    fn test_fail_streak_resets_on_correct() {
        let mut state = NodeRuntimeState::default();
        state.note_answer(false);
        state.note_answer(false);
        assert_eq!(state.fail_streak, 2);
        state.note_answer(true);
        assert_eq!(state.fail_streak, 0);
    }

    #[test]
    fn test_mark_shown_updates_kind_counters() {
        let now = Utc::now();
        let mut state = NodeRuntimeState::default();
        state.note_block_viewed();
        state.note_block_viewed();
        state.mark_shown(&BlockId::from("q1"), PromptType::QuickCheck, 0.4, now);
        assert_eq!(state.quick_checks_shown, 1);
        assert_eq!(state.last_quick_check_blocks, 2);
        assert_eq!(state.bandit.stats(&BlockId::from("q1")).shown, 1);
        assert!(state.was_shown(&BlockId::from("q1")));
    }

    #[test]
    fn test_prompt_window_reset() {
        let now = Utc::now();
        let mut state = PathRuntimeState::default();
        assert!(state.window_has_room(2, now));
        state.prompts_in_window = 2;
        assert!(!state.window_has_room(2, now));
        // A stale window resets and has room again
        state.prompt_window_started_at = Some(now - Duration::hours(2));
        assert!(state.window_has_room(2, now));
        assert_eq!(state.prompts_in_window, 0);
    }

    #[test]
    fn test_progressing_since_tracks_signal() {
        let now = Utc::now();
        let mut state = PathRuntimeState::default();
        let progressing = Event::new(UserId::new(), EventType::BlockRead, now)
            .with_session("s1")
            .with_data("progress_state", "progressing");
        state.note_signal(&progressing, now);
        assert_eq!(state.progressing_since, Some(now));

        let later = now + Duration::minutes(5);
        let stuck = Event::new(UserId::new(), EventType::BlockRead, later)
            .with_session("s1")
            .with_data("progress_state", "stalled");
        state.note_signal(&stuck, later);
        assert_eq!(state.progressing_since, None);
        assert_eq!(
            state.latest_signal().unwrap().progress_state.as_deref(),
            Some("stalled")
        );
    }

    #[test]
    fn test_runtime_state_round_trips_and_tolerates_old_blobs() {
        let mut state = NodeRuntimeState::default();
        state.note_block_read(BlockId::from("p1"));
        let json = serde_json::to_string(&state).unwrap();
        let back: NodeRuntimeState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);

        // A blob from an older build missing most fields still loads
        let old: NodeRuntimeState = serde_json::from_str(r#"{"blocks_seen": 3}"#).unwrap();
        assert_eq!(old.blocks_seen, 3);
        assert!(old.read_blocks.is_empty());
    }
}
