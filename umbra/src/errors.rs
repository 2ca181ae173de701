/// Host-Level Error Types
///
/// Conditions are single tagged words and stay that way inside the runtime;
/// these enums exist for the boundary where results leave the interpreter
/// and need to be reported to a human or composed with std errors.

use thiserror::Error;

use crate::core::value::{Condition, ConditionCause, LookupErrorKind};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("heap exhausted ({requested} bytes requested); try a larger --semispace-size")]
    HeapExhausted { requested: u32 },

    #[error("out of memory")]
    OutOfMemory,

    #[error("unhandled signal{}", backtrace.as_deref().map(|b| format!("\n{}", b)).unwrap_or_default())]
    UnhandledSignal { backtrace: Option<String> },

    #[error("lookup failed: {kind:?}")]
    LookupFailed { kind: LookupErrorKind },

    #[error("module dependencies are circular")]
    CircularDependency,

    #[error("malformed library input")]
    InvalidInput,

    #[error("invalid library syntax")]
    InvalidSyntax,

    #[error("heap validation failed")]
    ValidationFailed,

    #[error("system error")]
    SystemError,

    #[error("runtime condition: {cause} (detail {detail})")]
    Other { cause: &'static str, detail: u32 },
}

impl RuntimeError {
    /// Maps an escaped condition to its host-side error, attaching the
    /// backtrace captured for unhandled signals.
    pub fn from_condition(condition: Condition, backtrace: Option<String>) -> RuntimeError {
        match condition.cause() {
            ConditionCause::HeapExhausted => {
                RuntimeError::HeapExhausted { requested: condition.detail() }
            }
            ConditionCause::OutOfMemory => RuntimeError::OutOfMemory,
            ConditionCause::Signal => RuntimeError::UnhandledSignal { backtrace },
            ConditionCause::LookupError => {
                RuntimeError::LookupFailed { kind: condition.lookup_error_kind() }
            }
            ConditionCause::Circular => RuntimeError::CircularDependency,
            ConditionCause::InvalidInput => RuntimeError::InvalidInput,
            ConditionCause::InvalidSyntax => RuntimeError::InvalidSyntax,
            ConditionCause::ValidationFailed => RuntimeError::ValidationFailed,
            ConditionCause::SystemError => RuntimeError::SystemError,
            cause => RuntimeError::Other { cause: cause.name(), detail: condition.detail() },
        }
    }
}

/// Problems reading or parsing a library before it ever reaches the heap.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("could not read library: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse library: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed library: {0}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_mapping() {
        let error = RuntimeError::from_condition(Condition::heap_exhausted(64), None);
        assert!(matches!(error, RuntimeError::HeapExhausted { requested: 64 }));
        let error = RuntimeError::from_condition(Condition::signal(true), Some("bt".into()));
        assert!(matches!(error, RuntimeError::UnhandledSignal { backtrace: Some(_) }));
    }
}
