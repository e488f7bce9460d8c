//! Property-based tests for the planner's numeric invariants.
//!
//! These verify the bounds the rest of the engine relies on:
//!
//! - Softmax outputs are a probability distribution
//! - Arg-max selection is stable under ties
//! - Fatigue and readiness quantities stay in [0,1]
//! - The rolling prompt window never exceeds its cap
//! - Decision-trace outcomes advance at most once
