//! Cadence and break gates.
//!
//! Cadence gates decide whether a prompt kind is allowed at all right
//! now, before any candidate is scored: per-node caps, block-progress
//! gaps, time gaps, and the flashcard fail-streak trigger. Break timing
//! runs off the later of session start and sustained progress.

use chrono::{DateTime, Utc};

use crate::catalog::{BreakPolicy, FlashcardCadence, QuickCheckCadence};
use crate::state::{NodeRuntimeState, PathRuntimeState};

fn minutes_since(from: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - from).num_seconds() as f64 / 60.0
}

/// Whether the quick-check cadence allows another quick-check.
pub fn quick_check_eligible(
    cadence: &QuickCheckCadence,
    node: &NodeRuntimeState,
    now: DateTime<Utc>,
) -> bool {
    if node.quick_checks_shown >= cadence.max_per_lesson {
        return false;
    }
    let gap = node
        .blocks_for_cadence()
        .saturating_sub(node.last_quick_check_blocks);
    if gap < cadence.after_blocks.max(cadence.min_gap_blocks) {
        return false;
    }
    if let (Some(after_minutes), Some(last_at)) = (cadence.after_minutes, node.last_quick_check_at)
    {
        if minutes_since(last_at, now) < after_minutes {
            return false;
        }
    }
    true
}

/// Whether the flashcard cadence allows another flashcard.
pub fn flashcard_eligible(
    cadence: &FlashcardCadence,
    node: &NodeRuntimeState,
    now: DateTime<Utc>,
) -> bool {
    if node.flashcards_shown >= cadence.max_per_lesson {
        return false;
    }
    let gap = node
        .blocks_for_cadence()
        .saturating_sub(node.last_flashcard_blocks);
    if gap < cadence.after_blocks.max(cadence.min_gap_blocks) {
        return false;
    }
    if let (Some(after_minutes), Some(last_at)) = (cadence.after_minutes, node.last_flashcard_at) {
        if minutes_since(last_at, now) < after_minutes {
            return false;
        }
    }
    if let Some(required_streak) = cadence.after_fail_streak {
        if node.fail_streak < required_streak {
            return false;
        }
    }
    true
}

/// Whether a per-lesson cap still has room. Used by the readiness
/// remediation path, which bypasses block/time gaps but never the caps.
pub fn under_lesson_cap(shown: u32, max_per_lesson: u32) -> bool {
    shown < max_per_lesson
}

/// Whether session time alone warrants a break.
pub fn break_due(policy: &BreakPolicy, path: &PathRuntimeState, now: DateTime<Utc>) -> bool {
    // The clock starts at the later of session start and sustained progress
    let start = match (path.session_started_at, path.progressing_since) {
        (Some(session), Some(progressing)) => Some(session.max(progressing)),
        (Some(session), None) => Some(session),
        (None, progressing) => progressing,
    };
    let Some(start) = start else {
        return false;
    };
    if minutes_since(start, now) < policy.after_minutes {
        return false;
    }
    match path.last_break_at {
        None => true,
        Some(last) => minutes_since(last, now) >= policy.after_minutes,
    }
}

/// Whether a forced (fatigue) break respects the minimum break gap.
pub fn break_gap_ok(min_gap_minutes: f64, path: &PathRuntimeState, now: DateTime<Utc>) -> bool {
    match path.last_break_at {
        None => true,
        Some(last) => minutes_since(last, now) >= min_gap_minutes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::BlockId;
    use crate::state::PromptType;
    use chrono::Duration;

    fn node_with_blocks(read: u32) -> NodeRuntimeState {
        let mut node = NodeRuntimeState::default();
        for i in 0..read {
            node.note_block_viewed();
            node.note_block_read(BlockId::from(format!("b{}", i).as_str()));
        }
        node
    }

    #[test]
    fn test_quick_check_needs_block_progress() {
        let now = Utc::now();
        let cadence = QuickCheckCadence::default();
        assert!(!quick_check_eligible(&cadence, &node_with_blocks(1), now));
        assert!(quick_check_eligible(&cadence, &node_with_blocks(2), now));
    }

    #[test]
    fn test_quick_check_respects_lesson_cap() {
        let now = Utc::now();
        let cadence = QuickCheckCadence {
            max_per_lesson: 1,
            ..QuickCheckCadence::default()
        };
        let mut node = node_with_blocks(5);
        assert!(quick_check_eligible(&cadence, &node, now));
        node.mark_shown(&BlockId::from("q1"), PromptType::QuickCheck, 0.5, now);
        assert!(!quick_check_eligible(&cadence, &node, now));
    }

    #[test]
    fn test_quick_check_gap_counts_from_last_shown() {
        let now = Utc::now();
        let cadence = QuickCheckCadence::default();
        let mut node = node_with_blocks(2);
        node.mark_shown(&BlockId::from("q1"), PromptType::QuickCheck, 0.5, now);
        // No new blocks since the last quick-check
        assert!(!quick_check_eligible(&cadence, &node, now));
        node.note_block_read(BlockId::from("b9"));
        node.note_block_read(BlockId::from("b10"));
        assert!(quick_check_eligible(&cadence, &node, now));
    }

    #[test]
    fn test_quick_check_after_minutes_gate() {
        let now = Utc::now();
        let cadence = QuickCheckCadence {
            after_minutes: Some(10.0),
            ..QuickCheckCadence::default()
        };
        let mut node = node_with_blocks(6);
        node.last_quick_check_at = Some(now - Duration::minutes(5));
        assert!(!quick_check_eligible(&cadence, &node, now));
        node.last_quick_check_at = Some(now - Duration::minutes(15));
        assert!(quick_check_eligible(&cadence, &node, now));
    }

    #[test]
    fn test_flashcard_fail_streak_trigger() {
        let now = Utc::now();
        let cadence = FlashcardCadence::default();
        let mut node = node_with_blocks(4);
        assert!(!flashcard_eligible(&cadence, &node, now));
        node.fail_streak = 2;
        assert!(flashcard_eligible(&cadence, &node, now));
    }

    #[test]
    fn test_break_clock_uses_later_reference() {
        let now = Utc::now();
        let policy = BreakPolicy::default();
        let mut path = PathRuntimeState {
            session_started_at: Some(now - Duration::minutes(40)),
            ..PathRuntimeState::default()
        };
        assert!(break_due(&policy, &path, now));

        // Sustained progress that started recently resets the clock
        path.progressing_since = Some(now - Duration::minutes(10));
        assert!(!break_due(&policy, &path, now));
    }

    #[test]
    fn test_break_respects_last_break() {
        let now = Utc::now();
        let policy = BreakPolicy::default();
        let mut path = PathRuntimeState {
            session_started_at: Some(now - Duration::minutes(60)),
            last_break_at: Some(now - Duration::minutes(10)),
            ..PathRuntimeState::default()
        };
        assert!(!break_due(&policy, &path, now));
        path.last_break_at = Some(now - Duration::minutes(30));
        assert!(break_due(&policy, &path, now));
    }
}
