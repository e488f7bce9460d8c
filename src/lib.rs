//! # adapt-core
//!
//! The runtime adaptation engine of a personalized learning backend.
//! Learners move through hierarchical study paths; as they interact with
//! a node's generated document, the client emits an event stream. This
//! crate consumes that stream exactly once per user and decides, in real
//! time, what run state the learner is in, whether to surface a runtime
//! prompt (quick-check, flashcard review, or break), which candidate
//! maximizes information gain under readiness, fatigue, and a learned
//! policy, and whether to prefetch downstream content.
//!
//! ## Core Components
//!
//! - **Pipeline**: per-user event paging with one transaction per page
//! - **State**: path / node / activity run machines and runtime metadata
//! - **Readiness**: concept mastery, uncertainty, and coverage debt
//! - **Planner**: cadence, fatigue, bandit, and policy-blended selection
//! - **Trace**: decision records joined by off-policy evaluation
//!
//! ## Example
//!
//! ```rust,ignore
//! use adapt_core::{
//!     Cancellation, PipelineDriver, RuntimeConfig, RuntimeUpdateJob, SqliteRuntimeStore,
//! };
//! use std::sync::Arc;
//!
//! let store = Arc::new(SqliteRuntimeStore::open("runtime.db")?);
//! let driver = PipelineDriver::new(store, RuntimeConfig::from_env())
//!     .with_job_service(jobs)
//!     .with_notifier(notifier);
//!
//! let report = driver.run(&RuntimeUpdateJob::new(user_id), &Cancellation::new()).await?;
//! println!("processed {} events", report.processed);
//! ```

pub mod catalog;
pub mod concept;
pub mod config;
pub mod document;
pub mod error;
pub mod event;
pub mod ids;
pub mod misconception;
pub mod pipeline;
pub mod planner;
pub mod policy;
pub mod prefetch;
pub mod readiness;
pub mod services;
pub mod state;
pub mod storage;
pub mod trace;

// Re-exports for convenience
pub use catalog::{
    BreakPolicy, FlashcardCadence, NodeActivity, Path, PathNode, PathStatus, QuickCheckCadence,
    ResolvedPlan, RuntimePlan, RuntimePlanOverride,
};
pub use concept::{
    Concept, ConceptEdge, ConceptState, EdgeType, FailedContext, MisconceptionInstance,
    MisconceptionResolutionState, MisconceptionStatus, MisconceptionSupport, ResolutionStatus,
};
pub use config::{
    BanditConfig, CounterfactualConfig, CoverageDebtConfig, FatigueConfig, MisconceptionConfig,
    PipelineConfig, PrefetchConfig, ReadinessConfig, RlConfig, RlMode, RuntimeConfig,
    TestletConfig,
};
pub use document::{Block, BlockKind, Citation, NodeDocument};
pub use error::{Error, JobStage, Result};
pub use event::{Event, EventType};
pub use ids::{
    ActivityId, BlockId, ConceptId, EventId, NodeId, PathId, PromptId, TraceId, UserId,
};
pub use misconception::MisconceptionResolver;
pub use pipeline::{
    Cancellation, PipelineDriver, RunReport, RuntimeUpdateJob, RUNTIME_UPDATE_CONSUMER,
};
pub use planner::{Candidate, PlannerOutcome, RuntimePlanner};
pub use policy::{ModelParams, ModelSnapshot, PolicyEvalSnapshot};
pub use prefetch::PrefetchTrigger;
pub use readiness::{
    ConceptBundle, ReadinessEvaluator, ReadinessResult, ReadinessSnapshot, ReadinessStatus,
};
pub use services::{
    DebouncedJob, JobKind, JobService, NoopJobService, NoopNotifier, PromptPayload,
    RuntimeNotifier,
};
#[cfg(feature = "webhook")]
pub use services::WebhookNotifier;
pub use state::{
    ActivityRun, ActivityRunState, BanditState, BanditStats, NodeRun, NodeRunState,
    NodeRuntimeState, PathRun, PathRunState, PathRunTransition, PathRuntimeState, PromptReason,
    PromptStatus, PromptType, RuntimePrompt, SignalSource,
};
pub use storage::SqliteRuntimeStore;
pub use trace::{CandidateTrace, ChosenTrace, ChosenUpdate, DecisionTrace, TraceInputs};
