//! Learned-policy support: linear model snapshots, safety gates, softmax
//! scoring, and rollout bucketing.
//!
//! The engine never trains; it consumes a fitted linear policy and logs
//! decision traces the trainer joins later. A missing or unsafe snapshot
//! always degrades to baseline behavior, never errors.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::{RlConfig, RlMode};
use crate::error::Result;
use crate::ids::UserId;
use crate::storage::SqliteRuntimeStore;

/// Parameters of a fitted linear policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ModelParams {
    /// Intercept
    pub bias: f64,
    /// Coefficient per feature name
    #[serde(default)]
    pub weights: HashMap<String, f64>,
}

/// A versioned policy model snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    /// Snapshot key (one key per decision surface)
    pub key: String,
    /// Monotonic version
    pub version: i64,
    /// Whether this version is the serving one
    pub active: bool,
    /// Fitted parameters
    pub params: ModelParams,
}

impl ModelSnapshot {
    /// Score a feature map with this model.
    pub fn score(&self, features: &HashMap<String, f64>) -> f64 {
        let mut score = self.params.bias;
        for (name, value) in features {
            if let Some(coef) = self.params.weights.get(name) {
                score += coef * value;
            }
        }
        score
    }
}

/// Off-policy evaluation metrics for a policy key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyEvalSnapshot {
    /// Policy key evaluated
    pub key: String,
    /// Decision samples in the estimate
    pub samples: u64,
    /// Inverse-propensity-score estimate of policy value
    pub ips: f64,
    /// Estimated lift over baseline
    pub lift: f64,
}

impl PolicyEvalSnapshot {
    /// Whether these metrics clear the configured safety gates.
    pub fn passes_gates(&self, config: &RlConfig) -> bool {
        self.samples >= config.safe_min_samples
            && self.ips >= config.safe_min_ips
            && self.lift >= config.safe_min_lift
    }
}

/// Load the serving snapshot for a key: the most recent row flagged
/// active, else the latest row. `None` means baseline mode.
pub fn load_active_snapshot(
    store: &SqliteRuntimeStore,
    key: &str,
) -> Result<Option<ModelSnapshot>> {
    let recent = store.model_snapshots_by_key(key, 10)?;
    if let Some(active) = recent.iter().find(|s| s.active) {
        return Ok(Some(active.clone()));
    }
    Ok(recent.into_iter().next())
}

/// FNV-1a 32-bit hash; the rollout bucketing function.
pub fn fnv32(input: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in input.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Whether a user falls inside the active-mode rollout fraction.
pub fn in_rollout(user_id: UserId, pct: f64) -> bool {
    let bucket = fnv32(&user_id.to_string()) % 10_000;
    f64::from(bucket) < pct.clamp(0.0, 1.0) * 10_000.0
}

/// Softmax with temperature. Uniform over an all-equal input; stable in
/// input order (equal scores get equal probabilities).
pub fn softmax(scores: &[f64], temperature: f64) -> Vec<f64> {
    if scores.is_empty() {
        return Vec::new();
    }
    let temp = if temperature > 0.0 { temperature } else { 1.0 };
    let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|s| ((s - max) / temp).exp()).collect();
    let sum: f64 = exps.iter().sum();
    if sum <= 0.0 || !sum.is_finite() {
        let uniform = 1.0 / scores.len() as f64;
        return vec![uniform; scores.len()];
    }
    exps.iter().map(|e| e / sum).collect()
}

/// Index of the maximum score; ties break to the earliest index.
pub fn argmax(scores: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &s) in scores.iter().enumerate() {
        match best {
            Some((_, b)) if s <= b => {}
            _ => best = Some((i, s)),
        }
    }
    best.map(|(i, _)| i)
}

/// Decide the effective policy mode for one planning decision.
///
/// Active mode requires a fitted model, evaluation metrics clearing the
/// safety gates, and the user inside the rollout bucket; anything short
/// of that degrades to shadow. `Off` stays off.
pub fn effective_mode(
    config: &RlConfig,
    snapshot: Option<&ModelSnapshot>,
    eval: Option<&PolicyEvalSnapshot>,
    user_id: UserId,
) -> RlMode {
    match config.mode {
        RlMode::Off => RlMode::Off,
        RlMode::Shadow => RlMode::Shadow,
        RlMode::Active => {
            let gates_pass = eval.map(|e| e.passes_gates(config)).unwrap_or(false);
            if snapshot.is_some() && gates_pass && in_rollout(user_id, config.rollout_pct) {
                RlMode::Active
            } else {
                RlMode::Shadow
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn snapshot(active: bool, version: i64) -> ModelSnapshot {
        ModelSnapshot {
            key: "runtime_prompt".to_string(),
            version,
            active,
            params: ModelParams {
                bias: 0.1,
                weights: HashMap::from([
                    ("info_gain".to_string(), 2.0),
                    ("recency_penalty".to_string(), -1.0),
                ]),
            },
        }
    }

    #[test]
    fn test_model_scoring_ignores_unknown_features() {
        let model = snapshot(true, 1);
        let features = HashMap::from([
            ("info_gain".to_string(), 0.5),
            ("mystery".to_string(), 99.0),
        ]);
        assert!((model.score(&features) - 1.1).abs() < 1e-9);
    }

    #[test]
    fn test_softmax_normalizes() {
        let probs = softmax(&[0.8, 0.6, 0.1], 1.0);
        let sum: f64 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert!(probs[0] > probs[1] && probs[1] > probs[2]);
    }

    #[test]
    fn test_softmax_uniform_on_ties() {
        let probs = softmax(&[0.3, 0.3, 0.3], 0.5);
        for p in &probs {
            assert!((p - 1.0 / 3.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_softmax_temperature_sharpness() {
        let cold = softmax(&[1.0, 0.0], 0.1);
        let warm = softmax(&[1.0, 0.0], 5.0);
        assert!(cold[0] > warm[0]);
    }

    #[test]
    fn test_argmax_stable_under_ties() {
        assert_eq!(argmax(&[0.5, 0.5, 0.2]), Some(0));
        assert_eq!(argmax(&[]), None);
        assert_eq!(argmax(&[0.1, 0.9, 0.9]), Some(1));
    }

    #[test]
    fn test_fnv32_known_values() {
        // FNV-1a reference values
        assert_eq!(fnv32(""), 0x811c_9dc5);
        assert_eq!(fnv32("a"), 0xe40c_292c);
    }

    #[test]
    fn test_rollout_bucketing_is_deterministic() {
        let user = UserId(Uuid::new_v4());
        assert_eq!(in_rollout(user, 0.5), in_rollout(user, 0.5));
        assert!(!in_rollout(user, 0.0));
        assert!(in_rollout(user, 1.0));
    }

    #[test]
    fn test_effective_mode_gating() {
        let user = UserId::new();
        let model = snapshot(true, 1);
        let good_eval = PolicyEvalSnapshot {
            key: "runtime_prompt".to_string(),
            samples: 10_000,
            ips: 1.2,
            lift: 0.05,
        };
        let bad_eval = PolicyEvalSnapshot {
            key: "runtime_prompt".to_string(),
            samples: 10,
            ips: 1.2,
            lift: 0.05,
        };
        let config = RlConfig {
            mode: RlMode::Active,
            rollout_pct: 1.0,
            ..RlConfig::default()
        };

        assert_eq!(
            effective_mode(&config, Some(&model), Some(&good_eval), user),
            RlMode::Active
        );
        assert_eq!(
            effective_mode(&config, Some(&model), Some(&bad_eval), user),
            RlMode::Shadow
        );
        assert_eq!(
            effective_mode(&config, None, Some(&good_eval), user),
            RlMode::Shadow
        );
        let off = RlConfig {
            mode: RlMode::Off,
            ..RlConfig::default()
        };
        assert_eq!(effective_mode(&off, Some(&model), Some(&good_eval), user), RlMode::Off);
    }
}
