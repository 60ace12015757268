//! Error types for rlm-runtime.

use thiserror::Error;

/// Result type alias using rlm-runtime's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// The resource kind a [`Error::BudgetExceeded`] breach refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BudgetKind {
    MaxSteps,
    MaxSubCalls,
    MaxDepth,
    MaxPromptReadChars,
    MaxTimeMs,
}

impl std::fmt::Display for BudgetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::MaxSteps => "maxSteps",
            Self::MaxSubCalls => "maxSubCalls",
            Self::MaxDepth => "maxDepth",
            Self::MaxPromptReadChars => "maxPromptReadChars",
            Self::MaxTimeMs => "maxTimeMs",
        };
        write!(f, "{s}")
    }
}

/// Errors that can occur during RLM operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A budget counter would exceed its configured limit. Fatal for the
    /// containing environment; propagates all the way to the caller.
    #[error("budget exceeded: {kind} (limit {limit}, used {used})")]
    BudgetExceeded {
        kind: BudgetKind,
        limit: u64,
        used: u64,
    },

    /// The LM emitted an action that failed shape/coercion validation.
    /// Recoverable: surfaced to the LM as an `rlm_error` turn.
    #[error("dsl validation error: {message}")]
    DslValidation { message: String },

    /// An action executed but failed for a data-dependent reason (missing
    /// scratch key, unknown column, etc). Recoverable, same as above.
    #[error("execution error: {message}")]
    ExecutionError { message: String },

    /// A sub-RLM invocation failed; propagated to the parent as the
    /// triggering action's error.
    #[error("sub-rlm error: {0}")]
    SubRlm(Box<Error>),

    /// The configured LM provider failed to produce a completion.
    #[error("lm provider error: {message}")]
    Provider { message: String },

    /// JSON encode/decode failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Candidate evaluation in the improvement loop threw.
    #[error("evaluation error: {0}")]
    Evaluation(String),
}

impl Error {
    pub fn budget_exceeded(kind: BudgetKind, limit: u64, used: u64) -> Self {
        Self::BudgetExceeded { kind, limit, used }
    }

    pub fn dsl_validation(message: impl Into<String>) -> Self {
        Self::DslValidation {
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::ExecutionError {
            message: message.into(),
        }
    }

    pub fn sub_rlm(source: Error) -> Self {
        Self::SubRlm(Box::new(source))
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
        }
    }

    /// Recoverable errors are ones the Root Loop can turn into an
    /// `rlm_error` user turn instead of propagating to the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::DslValidation { .. } | Error::ExecutionError { .. } | Error::SubRlm(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_exceeded_display() {
        let err = Error::budget_exceeded(BudgetKind::MaxSteps, 32, 33);
        assert_eq!(
            err.to_string(),
            "budget exceeded: maxSteps (limit 32, used 33)"
        );
    }

    #[test]
    fn recoverable_classification() {
        assert!(Error::dsl_validation("bad shape").is_recoverable());
        assert!(Error::execution("missing key").is_recoverable());
        assert!(!Error::budget_exceeded(BudgetKind::MaxDepth, 4, 5).is_recoverable());
        assert!(!Error::provider("timeout").is_recoverable());
    }
}
