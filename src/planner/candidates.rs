//! Prompt candidate enumeration and baseline scoring.
//!
//! Every quick-check and flashcard block in the node document that has
//! not been surfaced yet, whose trigger ordering is satisfied, and whose
//! expected information gain clears the floor becomes a candidate. The
//! baseline score blends info gain, UCB exploration, testlet
//! uncertainty, readiness and counterfactual boosts, and a recency
//! penalty.

use chrono::{DateTime, Utc};

use crate::config::{BanditConfig, CounterfactualConfig, ReadinessConfig, TestletConfig};
use crate::document::{Block, NodeDocument};
use crate::ids::{BlockId, ConceptId};
use crate::readiness::{clip01, ReadinessResult, ReadinessStatus};
use crate::state::{BanditStats, NodeRuntimeState, PromptReason, PromptType};

/// Weight of the recency penalty term.
const RECENCY_PENALTY_WEIGHT: f64 = 0.25;
/// How many previous teaching blocks citation inference may claim.
const INFERRED_TRIGGER_LOOKBACK: usize = 3;

/// A scored prompt candidate.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Candidate block
    pub block_id: BlockId,
    /// Index of the block in the document
    pub index: usize,
    /// Prompt kind the block surfaces as
    pub prompt_type: PromptType,
    /// Concepts the block assesses
    pub concept_ids: Vec<ConceptId>,
    /// Expected information gain
    pub info_gain: f64,
    /// UCB exploration term
    pub explore: f64,
    /// Testlet uncertainty term, already weighted
    pub testlet_uncertainty: f64,
    /// Readiness boost
    pub readiness_boost: f64,
    /// Counterfactual boost
    pub counterfactual_boost: f64,
    /// Recency penalty
    pub recency_penalty: f64,
    /// Whether the candidate probes a suspected misconception
    pub counterfactual: bool,
    /// Selection reason the candidate would carry
    pub reason: PromptReason,
    /// Baseline score
    pub score: f64,
}

/// Tunables consulted during enumeration.
#[derive(Debug, Clone, Copy)]
pub struct ScoringConfig<'a> {
    /// Bandit tunables
    pub bandit: &'a BanditConfig,
    /// Counterfactual tunables
    pub counterfactual: &'a CounterfactualConfig,
    /// Testlet tunables
    pub testlet: &'a TestletConfig,
    /// Readiness tunables (for the prompt boost)
    pub readiness: &'a ReadinessConfig,
}

/// Enumerate and score candidates for a node document.
#[allow(clippy::too_many_arguments)]
pub fn enumerate_candidates(
    document: &NodeDocument,
    node: &NodeRuntimeState,
    readiness: Option<&ReadinessResult>,
    config: ScoringConfig<'_>,
    quick_check_allowed: bool,
    flashcard_allowed: bool,
    now: DateTime<Utc>,
) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    let total_shown = node.bandit.total_shown();
    let readiness_status = readiness.map(|r| r.snapshot.status);

    for (index, block) in document.promptable_blocks() {
        let prompt_type = match block.kind {
            crate::document::BlockKind::QuickCheck => PromptType::QuickCheck,
            crate::document::BlockKind::Flashcard => PromptType::Flashcard,
            _ => continue,
        };
        match prompt_type {
            PromptType::QuickCheck if !quick_check_allowed => continue,
            PromptType::Flashcard if !flashcard_allowed => continue,
            _ => {}
        }
        if node.was_completed(&block.id) || node.was_shown(&block.id) {
            continue;
        }
        if !trigger_satisfied(document, block, index, node) {
            continue;
        }

        let concept_ids = resolve_concepts(block, readiness);
        let info_gain = info_gain_for(&concept_ids, readiness);

        let counterfactual_trigger = config.counterfactual.enabled
            && (node.fail_streak >= config.counterfactual.fail_streak
                || has_misconception(&concept_ids, readiness));
        if info_gain < config.bandit.min_info_gain && !counterfactual_trigger {
            continue;
        }
        let counterfactual = config.counterfactual.enabled
            && (has_misconception(&concept_ids, readiness)
                || (counterfactual_trigger && info_gain >= config.bandit.min_info_gain));

        let stats = node.bandit.stats(&block.id);
        let explore = if config.bandit.enabled {
            ucb_explore(total_shown, stats.shown, config.bandit.exploration_weight)
        } else {
            0.0
        };
        let testlet_uncertainty = if config.testlet.enabled {
            testlet_term(&stats) * config.testlet.weight
        } else {
            0.0
        };
        let readiness_boost = match readiness_status {
            Some(ReadinessStatus::NotReady) => config.readiness.prompt_boost,
            Some(ReadinessStatus::Uncertain) => config.readiness.prompt_boost / 2.0,
            _ => 0.0,
        };
        let counterfactual_boost = if counterfactual {
            config.counterfactual.boost
        } else {
            0.0
        };
        let recency_penalty =
            recency_penalty(&stats, config.bandit.recency_penalty_minutes, now);

        let score = info_gain + explore + testlet_uncertainty + readiness_boost
            + counterfactual_boost
            - recency_penalty;

        let reason = if counterfactual {
            PromptReason::CounterfactualProbe
        } else if readiness_status == Some(ReadinessStatus::NotReady) {
            PromptReason::ReadinessNotReady
        } else if config.bandit.enabled && info_gain >= config.bandit.min_info_gain {
            PromptReason::BanditInfoGain
        } else {
            PromptReason::Cadence
        };

        candidates.push(Candidate {
            block_id: block.id.clone(),
            index,
            prompt_type,
            concept_ids,
            info_gain,
            explore,
            testlet_uncertainty,
            readiness_boost,
            counterfactual_boost,
            recency_penalty,
            counterfactual,
            reason,
            score,
        });
    }
    candidates
}

/// Whether the block's trigger ordering is satisfied.
///
/// Explicit `trigger_after_block_ids` must all sit at earlier indices and
/// be read. Without explicit triggers, the nearest previous teaching
/// blocks sharing a citation chunk are inferred as triggers. Without any
/// citation overlap, the block is eligible once the reading frontier has
/// reached it (at most one position past the last read block).
fn trigger_satisfied(
    document: &NodeDocument,
    block: &Block,
    index: usize,
    node: &NodeRuntimeState,
) -> bool {
    if !block.trigger_after_block_ids.is_empty() {
        return block.trigger_after_block_ids.iter().all(|trigger| {
            document
                .index_of(trigger)
                .map(|t| t < index)
                .unwrap_or(false)
                && node.read_blocks.contains(trigger)
        });
    }

    let mut inferred: Vec<&BlockId> = Vec::new();
    for other in document.blocks[..index].iter().rev() {
        if !other.kind.is_teaching() {
            continue;
        }
        if block.shares_citation_with(other) {
            inferred.push(&other.id);
            if inferred.len() == INFERRED_TRIGGER_LOOKBACK {
                break;
            }
        }
    }
    if !inferred.is_empty() {
        return inferred.iter().all(|t| node.read_blocks.contains(t));
    }

    let last_read_index = node
        .read_blocks
        .iter()
        .filter_map(|b| document.index_of(b))
        .max();
    match last_read_index {
        Some(last) => index <= last + 1,
        None => index == 0,
    }
}

fn resolve_concepts(block: &Block, readiness: Option<&ReadinessResult>) -> Vec<ConceptId> {
    let mut ids = block.concept_ids.clone();
    if let Some(result) = readiness {
        for id in result.concept_ids_for_keys(block.concept_keys.iter().map(String::as_str)) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    ids
}

/// Mean expected information gain over the block's concepts.
fn info_gain_for(concept_ids: &[ConceptId], readiness: Option<&ReadinessResult>) -> f64 {
    let Some(result) = readiness else {
        // No learner model loaded: neutral gain
        return 0.5;
    };
    if concept_ids.is_empty() {
        return 0.5;
    }
    let mut total = 0.0;
    for id in concept_ids {
        let gain = match result.states.get(id) {
            Some(state) => {
                let unc = state.max_uncertainty().max(1.0 - state.confidence);
                (1.0 - state.mastery) * (0.5 + 0.5 * clip01(unc))
            }
            // Unobserved concept: maximal gain
            None => 1.0,
        };
        total += gain;
    }
    clip01(total / concept_ids.len() as f64)
}

fn has_misconception(concept_ids: &[ConceptId], readiness: Option<&ReadinessResult>) -> bool {
    readiness
        .map(|r| concept_ids.iter().any(|id| r.misconceptions.contains_key(id)))
        .unwrap_or(false)
}

/// UCB-like exploration bonus.
fn ucb_explore(total_shown: u32, shown: u32, weight: f64) -> f64 {
    let numerator = (f64::from(total_shown) + 1.0).ln();
    (numerator / (f64::from(shown) + 1.0)).sqrt() * weight
}

/// Testlet uncertainty from the block's Beta posterior.
fn testlet_term(stats: &BanditStats) -> f64 {
    let a = f64::from(stats.correct) + 1.0;
    let b = f64::from(stats.attempts.saturating_sub(stats.correct)) + 1.0;
    let n = a + b;
    let variance = (a * b) / (n * n * (n + 1.0));
    clip01(variance / 0.25)
}

/// Penalty for blocks shown recently, fading linearly over the window.
fn recency_penalty(stats: &BanditStats, window_minutes: f64, now: DateTime<Utc>) -> f64 {
    if window_minutes <= 0.0 {
        return 0.0;
    }
    let Some(last_shown) = stats.last_shown_at else {
        return 0.0;
    };
    let minutes = (now - last_shown).num_seconds() as f64 / 60.0;
    if minutes >= window_minutes || minutes < 0.0 {
        return 0.0;
    }
    ((window_minutes - minutes) / window_minutes) * RECENCY_PENALTY_WEIGHT
}
