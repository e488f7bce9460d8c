//! Content catalog rows read by the engine: paths, nodes, activities,
//! and the per-path runtime plan.
//!
//! The catalog is owned by the authoring/generation pipeline; the engine
//! reads it to resolve event context and to load cadence policy.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ids::{ActivityId, NodeId, PathId};

/// Publication status of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathStatus {
    /// Still being authored or generated
    Building,
    /// Ready for learners
    Ready,
    /// No longer served
    Archived,
    /// Unrecognized status
    #[serde(other)]
    Other,
}

/// A study path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Path {
    /// Path id
    pub id: PathId,
    /// Publication status
    pub status: PathStatus,
    /// Source material set backing document generation, when any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub material_set_id: Option<String>,
    /// Cadence policy for runtime prompts
    #[serde(default)]
    pub runtime_plan: RuntimePlan,
}

impl Path {
    /// Create a ready path with the default runtime plan.
    pub fn new(id: PathId) -> Self {
        Self {
            id,
            status: PathStatus::Ready,
            material_set_id: None,
            runtime_plan: RuntimePlan::default(),
        }
    }

    /// Set the material set id.
    pub fn with_material_set(mut self, material_set_id: impl Into<String>) -> Self {
        self.material_set_id = Some(material_set_id.into());
        self
    }

    /// Set the runtime plan.
    pub fn with_runtime_plan(mut self, plan: RuntimePlan) -> Self {
        self.runtime_plan = plan;
        self
    }
}

/// An ordered node within a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathNode {
    /// Node id
    pub id: NodeId,
    /// Owning path
    pub path_id: PathId,
    /// Position within the path ordering
    pub position: u32,
    /// Display title
    #[serde(default)]
    pub title: String,
}

/// An activity attached to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeActivity {
    /// Activity id
    pub id: ActivityId,
    /// Owning node
    pub node_id: NodeId,
    /// Owning path
    pub path_id: PathId,
}

/// Cadence policy for quick-check prompts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuickCheckCadence {
    /// Most quick-checks surfaced per node
    pub max_per_lesson: u32,
    /// Blocks of progress required since the last quick-check
    pub after_blocks: u32,
    /// Hard floor on the block gap
    pub min_gap_blocks: u32,
    /// Minimum minutes since the last quick-check, when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_minutes: Option<f64>,
}

impl Default for QuickCheckCadence {
    fn default() -> Self {
        Self {
            max_per_lesson: 3,
            after_blocks: 2,
            min_gap_blocks: 2,
            after_minutes: None,
        }
    }
}

/// Cadence policy for flashcard prompts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashcardCadence {
    /// Most flashcards surfaced per node
    pub max_per_lesson: u32,
    /// Blocks of progress required since the last flashcard
    pub after_blocks: u32,
    /// Hard floor on the block gap
    pub min_gap_blocks: u32,
    /// Minimum minutes since the last flashcard, when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_minutes: Option<f64>,
    /// Fail streak that makes flashcards eligible, when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_fail_streak: Option<u32>,
}

impl Default for FlashcardCadence {
    fn default() -> Self {
        Self {
            max_per_lesson: 2,
            after_blocks: 3,
            min_gap_blocks: 3,
            after_minutes: None,
            after_fail_streak: Some(2),
        }
    }
}

/// Break scheduling policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakPolicy {
    /// Minutes of continuous session time before a break is suggested
    pub after_minutes: f64,
    /// Suggested break length lower bound, minutes
    pub break_min: u32,
    /// Suggested break length upper bound, minutes
    pub break_max: u32,
}

impl Default for BreakPolicy {
    fn default() -> Self {
        Self {
            after_minutes: 25.0,
            break_min: 3,
            break_max: 10,
        }
    }
}

/// Per-node overrides for the path-level runtime plan. Unset fields fall
/// through to the path level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RuntimePlanOverride {
    /// Override for the hourly prompt cap
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_prompts_per_hour: Option<u32>,
    /// Override for the quick-check cadence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quick_check: Option<QuickCheckCadence>,
    /// Override for the flashcard cadence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flashcard: Option<FlashcardCadence>,
    /// Override for the break policy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub break_policy: Option<BreakPolicy>,
}

/// Path-level cadence policy, with per-node overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimePlan {
    /// Most prompts surfaced in any rolling hour
    pub max_prompts_per_hour: u32,
    /// Minimum minutes between consecutive prompts
    pub min_prompt_gap_minutes: f64,
    /// Quick-check cadence
    #[serde(default)]
    pub quick_check: QuickCheckCadence,
    /// Flashcard cadence
    #[serde(default)]
    pub flashcard: FlashcardCadence,
    /// Break policy
    #[serde(default)]
    pub break_policy: BreakPolicy,
    /// Per-node overrides
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub node_overrides: HashMap<NodeId, RuntimePlanOverride>,
}

impl Default for RuntimePlan {
    fn default() -> Self {
        Self {
            max_prompts_per_hour: 4,
            min_prompt_gap_minutes: 2.0,
            quick_check: QuickCheckCadence::default(),
            flashcard: FlashcardCadence::default(),
            break_policy: BreakPolicy::default(),
            node_overrides: HashMap::new(),
        }
    }
}

impl RuntimePlan {
    /// Resolve the effective plan for a node, applying any override.
    pub fn for_node(&self, node_id: &NodeId) -> ResolvedPlan {
        let ov = self.node_overrides.get(node_id);
        ResolvedPlan {
            max_prompts_per_hour: ov
                .and_then(|o| o.max_prompts_per_hour)
                .unwrap_or(self.max_prompts_per_hour),
            min_prompt_gap_minutes: self.min_prompt_gap_minutes,
            quick_check: ov
                .and_then(|o| o.quick_check.clone())
                .unwrap_or_else(|| self.quick_check.clone()),
            flashcard: ov
                .and_then(|o| o.flashcard.clone())
                .unwrap_or_else(|| self.flashcard.clone()),
            break_policy: ov
                .and_then(|o| o.break_policy.clone())
                .unwrap_or_else(|| self.break_policy.clone()),
        }
    }
}

/// The runtime plan after per-node overrides are applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPlan {
    /// Most prompts surfaced in any rolling hour
    pub max_prompts_per_hour: u32,
    /// Minimum minutes between consecutive prompts
    pub min_prompt_gap_minutes: f64,
    /// Quick-check cadence
    pub quick_check: QuickCheckCadence,
    /// Flashcard cadence
    pub flashcard: FlashcardCadence,
    /// Break policy
    pub break_policy: BreakPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_plan_resolves_without_overrides() {
        let plan = RuntimePlan::default();
        let node = NodeId::new();
        let resolved = plan.for_node(&node);
        assert_eq!(resolved.max_prompts_per_hour, 4);
        assert_eq!(resolved.quick_check.max_per_lesson, 3);
    }

    #[test]
    fn test_node_override_wins() {
        let node = NodeId::new();
        let mut plan = RuntimePlan::default();
        plan.node_overrides.insert(
            node,
            RuntimePlanOverride {
                max_prompts_per_hour: Some(1),
                quick_check: Some(QuickCheckCadence {
                    max_per_lesson: 9,
                    ..QuickCheckCadence::default()
                }),
                ..RuntimePlanOverride::default()
            },
        );
        let resolved = plan.for_node(&node);
        assert_eq!(resolved.max_prompts_per_hour, 1);
        assert_eq!(resolved.quick_check.max_per_lesson, 9);
        // Untouched sections fall through to the path level
        assert_eq!(resolved.flashcard, plan.flashcard);

        let other = plan.for_node(&NodeId::new());
        assert_eq!(other.max_prompts_per_hour, 4);
    }

    #[test]
    fn test_plan_round_trips_as_json() {
        let plan = RuntimePlan::default();
        let json = serde_json::to_string(&plan).unwrap();
        let back: RuntimePlan = serde_json::from_str(&json).unwrap();
        assert_eq!(back, plan);
    }
}
