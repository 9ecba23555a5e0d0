use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors surfaced by the dispatch core.
///
/// `Configuration` and `StateConsistency` indicate defective input or a
/// programming bug and are never retried. `InfeasibleWindow` and
/// `SolverTimeout` get one bounded retry (timeouts inside the solver with a
/// relaxed tolerance, infeasible windows in the controller with a shrunk
/// horizon) before the run aborts.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("no feasible dispatch for window {window_start}..{window_end}: {detail}")]
    InfeasibleWindow {
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        detail: String,
    },

    #[error("solver exceeded its {budget_ms} ms budget on window {window_start}..{window_end}")]
    SolverTimeout {
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        budget_ms: u64,
    },

    #[error("state consistency violation: {0}")]
    StateConsistency(String),
}

impl DispatchError {
    /// Whether the controller may retry the failing window once with a
    /// shrunk horizon.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InfeasibleWindow { .. } | Self::SolverTimeout { .. }
        )
    }
}
