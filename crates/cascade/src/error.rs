use thiserror::Error;

use crate::source::SourceRef;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Failure taxonomy for the engine.
///
/// Construction-time failures (wiring, scope discipline, arity) are returned
/// as hard `Err`s. Failures raised while forcing a deferred node are captured
/// as `Value::Error` so sibling expressions keep resolving; callers that need
/// a hard failure go through `Engine::fix_or_raise`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("variable not found: {name} (at {at})")]
    VariableNotFound { name: String, at: SourceRef },

    #[error("constraint '{label}' violated for {name} (at {at})")]
    ConstraintViolation {
        name: String,
        label: String,
        at: SourceRef,
    },

    #[error("purity violation: {message} (at {at})")]
    PurityViolation { message: String, at: SourceRef },

    #[error("{name} takes {min}..={max} arguments, got {given}")]
    Arity {
        name: String,
        given: usize,
        min: usize,
        max: usize,
    },

    #[error("builtin not found: {name}")]
    BuiltinNotFound { name: String },

    #[error("assertion failed: {message} (at {at})")]
    AssertionFailure { message: String, at: SourceRef },

    #[error("cannot reassign constant: {name}")]
    BindingImmutable { name: String },

    /// Always a defect in the engine or its embedding, never user error.
    #[error("internal consistency failure: {0}")]
    InternalConsistency(String),

    #[error("{message} (at {at})")]
    Script { message: String, at: SourceRef },
}

impl EngineError {
    /// Stable kind label, used when an error is captured as an error value.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::VariableNotFound { .. } => "variable-not-found",
            EngineError::ConstraintViolation { .. } => "constraint-violation",
            EngineError::PurityViolation { .. } => "purity-violation",
            EngineError::Arity { .. } => "arity",
            EngineError::BuiltinNotFound { .. } => "builtin-not-found",
            EngineError::AssertionFailure { .. } => "assertion-failure",
            EngineError::BindingImmutable { .. } => "binding-immutable",
            EngineError::InternalConsistency(_) => "internal",
            EngineError::Script { .. } => "script",
        }
    }

    pub fn at(&self) -> Option<&SourceRef> {
        match self {
            EngineError::VariableNotFound { at, .. }
            | EngineError::ConstraintViolation { at, .. }
            | EngineError::PurityViolation { at, .. }
            | EngineError::AssertionFailure { at, .. }
            | EngineError::Script { at, .. } => Some(at),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_error_is_a_std_error_with_location_rendering() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        let err = EngineError::Script {
            message: "boom".to_owned(),
            at: SourceRef::new("main", 3, 7),
        };
        assert_std_error(&err);
        assert_eq!(err.to_string(), "boom (at main:3:7)");
        assert_eq!(err.at().map(|at| at.line), Some(3));
    }
}
