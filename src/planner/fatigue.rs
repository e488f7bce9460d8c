//! Fatigue scoring.
//!
//! Fatigue is a scalar in [0,1] blending session length, prompt rate,
//! and the current fail streak. Above the break threshold it forces a
//! break; above the suppress threshold it silences quick-checks and
//! flashcards.

use crate::config::FatigueConfig;
use crate::readiness::clip01;

/// Fail streak treated as maximal when normalizing.
const FAIL_STREAK_CAP: f64 = 4.0;

/// Compute the fatigue score. Zero when fatigue gating is disabled.
pub fn fatigue_score(
    config: &FatigueConfig,
    elapsed_minutes: f64,
    prompts_in_window: u32,
    fail_streak: u32,
) -> f64 {
    if !config.enabled {
        return 0.0;
    }
    let time_term = clip01(elapsed_minutes / config.max_session_minutes);
    let prompt_term = clip01(f64::from(prompts_in_window) / config.rate_cap);
    let fail_term = clip01(f64::from(fail_streak) / FAIL_STREAK_CAP);
    clip01(
        config.time_weight * time_term
            + config.prompt_weight * prompt_term
            + config.fail_weight * fail_term,
    )
}
