//! Run state: machines, rows, and engine-owned runtime metadata.
//!
//! Three independent machines track a user's progress through a path, a
//! node, and an activity. The `runtime` blobs on path and node runs hold
//! everything the planner needs between events; they are owned
//! exclusively by this engine.

pub mod machine;
pub mod runs;
pub mod runtime;

pub use machine::{
    activity_transition, node_transition, path_transition, ActivityRunState, NodeRunState,
    PathRunState,
};
pub use runs::{ActivityRun, NodeRun, PathRun, PathRunTransition};
pub use runtime::{
    BanditState, BanditStats, NodeRuntimeState, PathRuntimeState, PromptReason, PromptStatus,
    PromptType, RuntimePrompt, SignalSource,
};
