//! Engine configuration, loaded once per process from the environment.
//!
//! Every tunable has a default and a hard clamp so a bad deployment value
//! degrades to something sane instead of destabilizing the planner.

use serde::{Deserialize, Serialize};

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64, min: f64, max: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
        .clamp(min, max)
}

fn env_u32(key: &str, default: u32, min: u32, max: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
        .clamp(min, max)
}

/// Readiness evaluation tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessConfig {
    /// Whether readiness evaluation runs at all
    pub enabled: bool,
    /// Snapshot cache lifetime, seconds
    pub cache_seconds: u32,
    /// Minimum score for `ready`
    pub ready_min: f64,
    /// Score below which the learner is `not_ready`
    pub uncertain_min: f64,
    /// Minimum per-concept mastery for `ready`
    pub min_mastery: f64,
    /// Most active misconceptions tolerated while `ready`
    pub max_misconceptions_ready: u32,
    /// Candidate-score boost applied when not ready
    pub prompt_boost: f64,
    /// Whether block-level concept keys join the document-level set
    pub use_block_concepts: bool,
    /// Minimum prereq edge strength that pulls an upstream concept in
    pub prereq_edge_min_strength: f64,
    /// Whether mastery decays with elapsed time
    pub decay_enabled: bool,
    /// Default forgetting half-life, days
    pub decay_half_life_days: f64,
    /// Largest fraction of mastery decay can remove
    pub decay_max_drop: f64,
    /// Days after which confidence goes stale
    pub stale_days: f64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_seconds: 300,
            ready_min: 0.7,
            uncertain_min: 0.45,
            min_mastery: 0.3,
            max_misconceptions_ready: 0,
            prompt_boost: 0.3,
            use_block_concepts: true,
            prereq_edge_min_strength: 0.4,
            decay_enabled: true,
            decay_half_life_days: 14.0,
            decay_max_drop: 0.3,
            stale_days: 21.0,
        }
    }
}

impl ReadinessConfig {
    /// Load from `RUNTIME_READINESS_*` / `RUNTIME_*` environment keys.
    pub fn from_env() -> Self {
        Self {
            enabled: env_bool("RUNTIME_READINESS_ENABLED", true),
            cache_seconds: env_u32("RUNTIME_READINESS_CACHE_SECONDS", 300, 10, 3600),
            ready_min: env_f64("RUNTIME_READINESS_READY_MIN", 0.7, 0.0, 1.0),
            uncertain_min: env_f64("RUNTIME_READINESS_UNCERTAIN_MIN", 0.45, 0.0, 1.0),
            min_mastery: env_f64("RUNTIME_READINESS_MIN_MASTERY", 0.3, 0.0, 1.0),
            max_misconceptions_ready: env_u32(
                "RUNTIME_READINESS_MAX_MISCONCEPTIONS_READY",
                0,
                0,
                16,
            ),
            prompt_boost: env_f64("RUNTIME_READINESS_PROMPT_BOOST", 0.3, 0.0, 1.0),
            use_block_concepts: env_bool("RUNTIME_READINESS_USE_BLOCK_CONCEPTS", true),
            prereq_edge_min_strength: env_f64(
                "RUNTIME_READINESS_PREREQ_EDGE_MIN_STRENGTH",
                0.4,
                0.0,
                1.0,
            ),
            decay_enabled: env_bool("RUNTIME_READINESS_DECAY_ENABLED", true),
            decay_half_life_days: env_f64(
                "RUNTIME_READINESS_DECAY_HALF_LIFE_DAYS",
                14.0,
                1.0,
                365.0,
            ),
            decay_max_drop: env_f64("RUNTIME_READINESS_DECAY_MAX_DROP", 0.3, 0.0, 0.95),
            stale_days: env_f64("RUNTIME_READINESS_STALE_DAYS", 21.0, 1.0, 365.0),
        }
    }
}

/// Coverage-debt (overdue review pressure) tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageDebtConfig {
    /// Whether coverage debt contributes to readiness
    pub enabled: bool,
    /// Review cadence that defines "due", days
    pub due_days: f64,
    /// Debt above which a concept counts as due for review
    pub threshold: f64,
    /// Debt ceiling
    pub max: f64,
}

impl Default for CoverageDebtConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            due_days: 7.0,
            threshold: 0.5,
            max: 1.0,
        }
    }
}

impl CoverageDebtConfig {
    /// Load from `RUNTIME_COVERAGE_DEBT_*` environment keys.
    pub fn from_env() -> Self {
        Self {
            enabled: env_bool("RUNTIME_COVERAGE_DEBT_ENABLED", true),
            due_days: env_f64("RUNTIME_COVERAGE_DEBT_DUE_DAYS", 7.0, 0.5, 90.0),
            threshold: env_f64("RUNTIME_COVERAGE_DEBT_THRESHOLD", 0.5, 0.0, 1.0),
            max: env_f64("RUNTIME_COVERAGE_DEBT_MAX", 1.0, 0.0, 1.0),
        }
    }
}

/// Bandit exploration tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanditConfig {
    /// Whether bandit scoring runs
    pub enabled: bool,
    /// UCB exploration weight
    pub exploration_weight: f64,
    /// Window for the recency penalty, minutes
    pub recency_penalty_minutes: f64,
    /// Minimum info gain for a candidate to survive
    pub min_info_gain: f64,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            exploration_weight: 0.3,
            recency_penalty_minutes: 30.0,
            min_info_gain: 0.08,
        }
    }
}

impl BanditConfig {
    /// Load from `RUNTIME_BANDIT_*` environment keys.
    pub fn from_env() -> Self {
        Self {
            enabled: env_bool("RUNTIME_BANDIT_ENABLED", true),
            exploration_weight: env_f64("RUNTIME_BANDIT_EXPLORATION_WEIGHT", 0.3, 0.0, 2.0),
            recency_penalty_minutes: env_f64(
                "RUNTIME_BANDIT_RECENCY_PENALTY_MINUTES",
                30.0,
                0.0,
                240.0,
            ),
            min_info_gain: env_f64("RUNTIME_BANDIT_MIN_INFO_GAIN", 0.08, 0.0, 1.0),
        }
    }
}

/// Counterfactual probing tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterfactualConfig {
    /// Whether counterfactual probes fire
    pub enabled: bool,
    /// Fail streak that triggers a counterfactual probe
    pub fail_streak: u32,
    /// Candidate-score boost for counterfactual probes
    pub boost: f64,
}

impl Default for CounterfactualConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fail_streak: 2,
            boost: 0.25,
        }
    }
}

impl CounterfactualConfig {
    /// Load from `RUNTIME_COUNTERFACTUAL_*` environment keys.
    pub fn from_env() -> Self {
        Self {
            enabled: env_bool("RUNTIME_COUNTERFACTUAL_ENABLED", true),
            fail_streak: env_u32("RUNTIME_COUNTERFACTUAL_FAIL_STREAK", 2, 1, 10),
            boost: env_f64("RUNTIME_COUNTERFACTUAL_BOOST", 0.25, 0.0, 1.0),
        }
    }
}

/// Fatigue model tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FatigueConfig {
    /// Whether fatigue gating runs
    pub enabled: bool,
    /// Session length treated as maximal, minutes
    pub max_session_minutes: f64,
    /// Prompt rate treated as maximal, prompts per hour
    pub rate_cap: f64,
    /// Weight of session time in the fatigue score
    pub time_weight: f64,
    /// Weight of prompt rate in the fatigue score
    pub prompt_weight: f64,
    /// Weight of the fail streak in the fatigue score
    pub fail_weight: f64,
    /// Fatigue at which a break is forced
    pub break_threshold: f64,
    /// Fatigue at which quick-checks/flashcards are suppressed
    pub suppress_threshold: f64,
    /// Minimum minutes between forced breaks
    pub min_break_gap_minutes: f64,
}

impl Default for FatigueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_session_minutes: 50.0,
            rate_cap: 6.0,
            time_weight: 0.5,
            prompt_weight: 0.3,
            fail_weight: 0.2,
            break_threshold: 0.75,
            suppress_threshold: 0.6,
            min_break_gap_minutes: 15.0,
        }
    }
}

impl FatigueConfig {
    /// Load from `RUNTIME_FATIGUE_*` environment keys.
    pub fn from_env() -> Self {
        Self {
            enabled: env_bool("RUNTIME_FATIGUE_ENABLED", true),
            max_session_minutes: env_f64("RUNTIME_FATIGUE_MAX_SESSION_MINUTES", 50.0, 5.0, 240.0),
            rate_cap: env_f64("RUNTIME_FATIGUE_RATE_CAP", 6.0, 1.0, 30.0),
            time_weight: env_f64("RUNTIME_FATIGUE_TIME_WEIGHT", 0.5, 0.0, 1.0),
            prompt_weight: env_f64("RUNTIME_FATIGUE_PROMPT_WEIGHT", 0.3, 0.0, 1.0),
            fail_weight: env_f64("RUNTIME_FATIGUE_FAIL_WEIGHT", 0.2, 0.0, 1.0),
            break_threshold: env_f64("RUNTIME_FATIGUE_BREAK_THRESHOLD", 0.75, 0.0, 1.0),
            suppress_threshold: env_f64("RUNTIME_FATIGUE_SUPPRESS_THRESHOLD", 0.6, 0.0, 1.0),
            min_break_gap_minutes: env_f64(
                "RUNTIME_FATIGUE_MIN_BREAK_GAP_MINUTES",
                15.0,
                1.0,
                120.0,
            ),
        }
    }
}

/// Testlet uncertainty tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestletConfig {
    /// Whether testlet uncertainty joins the candidate score
    pub enabled: bool,
    /// Weight of the testlet term
    pub weight: f64,
}

impl Default for TestletConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            weight: 0.2,
        }
    }
}

impl TestletConfig {
    /// Load from `RUNTIME_TESTLET_*` environment keys.
    pub fn from_env() -> Self {
        Self {
            enabled: env_bool("RUNTIME_TESTLET_ENABLED", true),
            weight: env_f64("RUNTIME_TESTLET_WEIGHT", 0.2, 0.0, 1.0),
        }
    }
}

/// Policy (RL) mode for prompt selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RlMode {
    /// Baseline only; no policy scoring
    Off,
    /// Score with the policy, act on baseline
    Shadow,
    /// Act on the policy when safety gates pass
    Active,
}

impl RlMode {
    /// Parse the wire form; anything unrecognized falls back to `Off`.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "shadow" => Self::Shadow,
            "active" => Self::Active,
            _ => Self::Off,
        }
    }

    /// Wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Shadow => "shadow",
            Self::Active => "active",
        }
    }
}

impl std::fmt::Display for RlMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Learned-policy tunables and safety gates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RlConfig {
    /// Requested mode; active still degrades when gates fail
    pub mode: RlMode,
    /// Model snapshot key
    pub policy_key: String,
    /// Softmax temperature over policy scores
    pub softmax_temp: f64,
    /// Fraction of users in the active rollout, [0,1]
    pub rollout_pct: f64,
    /// Minimum evaluation samples before active mode
    pub safe_min_samples: u64,
    /// Minimum IPS estimate before active mode
    pub safe_min_ips: f64,
    /// Minimum estimated lift before active mode
    pub safe_min_lift: f64,
}

impl Default for RlConfig {
    fn default() -> Self {
        Self {
            mode: RlMode::Shadow,
            policy_key: "runtime_prompt".to_string(),
            softmax_temp: 1.0,
            rollout_pct: 0.1,
            safe_min_samples: 500,
            safe_min_ips: 0.9,
            safe_min_lift: 0.0,
        }
    }
}

impl RlConfig {
    /// Load from `RUNTIME_RL_*` environment keys.
    pub fn from_env() -> Self {
        Self {
            mode: RlMode::parse(&env_str("RUNTIME_RL_MODE", "shadow")),
            policy_key: env_str("RUNTIME_RL_POLICY_KEY", "runtime_prompt"),
            softmax_temp: env_f64("RUNTIME_RL_SOFTMAX_TEMP", 1.0, 0.05, 10.0),
            rollout_pct: env_f64("RUNTIME_RL_ROLLOUT_PCT", 0.1, 0.0, 1.0),
            safe_min_samples: env_u32("RUNTIME_RL_SAFE_MIN_SAMPLES", 500, 0, 1_000_000) as u64,
            safe_min_ips: env_f64("RUNTIME_RL_SAFE_MIN_IPS", 0.9, 0.0, 10.0),
            safe_min_lift: env_f64("RUNTIME_RL_SAFE_MIN_LIFT", 0.0, -1.0, 1.0),
        }
    }
}

/// Misconception resolution tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MisconceptionConfig {
    /// Correct-answer credit required to resolve
    pub resolve_min_correct: u32,
    /// Days until the post-resolution retention review
    pub review_days: f64,
    /// Whether a relapse resets accumulated counts
    pub relapse_reset: bool,
}

impl Default for MisconceptionConfig {
    fn default() -> Self {
        Self {
            resolve_min_correct: 2,
            review_days: 7.0,
            relapse_reset: true,
        }
    }
}

impl MisconceptionConfig {
    /// Load from `RUNTIME_MISCON_*` environment keys.
    pub fn from_env() -> Self {
        Self {
            resolve_min_correct: env_u32("RUNTIME_MISCON_RESOLVE_MIN_CORRECT", 2, 1, 10),
            review_days: env_f64("RUNTIME_MISCON_REVIEW_DAYS", 7.0, 0.5, 90.0),
            relapse_reset: env_bool("RUNTIME_MISCON_RELAPSE_RESET", true),
        }
    }
}

/// Prefetch trigger tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefetchConfig {
    /// Nodes ahead of the current one to keep built
    pub lookahead: u32,
    /// Minimum minutes between prefetch enqueues
    pub min_gap_minutes: f64,
    /// Hourly budget for probe-selection jobs
    pub probe_per_hour: u32,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            lookahead: 2,
            min_gap_minutes: 10.0,
            probe_per_hour: 2,
        }
    }
}

impl PrefetchConfig {
    /// Load from `RUNTIME_PREFETCH_*` environment keys.
    pub fn from_env() -> Self {
        Self {
            lookahead: env_u32("RUNTIME_PREFETCH_LOOKAHEAD", 2, 1, 10),
            min_gap_minutes: env_f64("RUNTIME_PREFETCH_MIN_GAP_MINUTES", 10.0, 1.0, 120.0),
            probe_per_hour: env_u32("RUNTIME_PREFETCH_PROBE_PER_HOUR", 2, 0, 20),
        }
    }
}

/// Pipeline paging tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Events claimed per page/transaction
    pub page_size: u32,
    /// Most pages processed per job invocation
    pub max_pages: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            page_size: 500,
            max_pages: 20,
        }
    }
}

impl PipelineConfig {
    /// Load from `RUNTIME_PIPELINE_*` environment keys.
    pub fn from_env() -> Self {
        Self {
            page_size: env_u32("RUNTIME_PIPELINE_PAGE_SIZE", 500, 1, 1000),
            max_pages: env_u32("RUNTIME_PIPELINE_MAX_PAGES", 20, 1, 1000),
        }
    }
}

/// Full engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    /// Readiness evaluation
    pub readiness: ReadinessConfig,
    /// Coverage debt
    pub coverage_debt: CoverageDebtConfig,
    /// Bandit exploration
    pub bandit: BanditConfig,
    /// Counterfactual probing
    pub counterfactual: CounterfactualConfig,
    /// Fatigue gating
    pub fatigue: FatigueConfig,
    /// Testlet uncertainty
    pub testlet: TestletConfig,
    /// Learned policy
    pub rl: RlConfig,
    /// Misconception resolution
    pub misconception: MisconceptionConfig,
    /// Prefetch trigger
    pub prefetch: PrefetchConfig,
    /// Pipeline paging
    pub pipeline: PipelineConfig,
    /// Minimum confidence a progress signal needs to gate prefetch
    pub progress_conf_min: f64,
    /// Whether uncompleted prompts become eligible to reshow
    pub reshow_uncompleted_prompts: bool,
}

impl RuntimeConfig {
    /// Load the full configuration from the environment.
    pub fn from_env() -> Self {
        Self {
            readiness: ReadinessConfig::from_env(),
            coverage_debt: CoverageDebtConfig::from_env(),
            bandit: BanditConfig::from_env(),
            counterfactual: CounterfactualConfig::from_env(),
            fatigue: FatigueConfig::from_env(),
            testlet: TestletConfig::from_env(),
            rl: RlConfig::from_env(),
            misconception: MisconceptionConfig::from_env(),
            prefetch: PrefetchConfig::from_env(),
            pipeline: PipelineConfig::from_env(),
            progress_conf_min: env_f64("RUNTIME_PROGRESS_CONF_MIN", 0.5, 0.0, 1.0),
            reshow_uncompleted_prompts: env_bool("RUNTIME_RESHOW_UNCOMPLETED_PROMPTS", false),
        }
    }
}
