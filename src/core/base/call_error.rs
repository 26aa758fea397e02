use std::error::Error;
use std::fmt;

/// `CallError` is the failure side of a guarded call.
///
/// Callers must be able to distinguish "the dependency failed" from "the
/// breaker refused to even try", so the two cases are separate variants and
/// the underlying error is carried unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallError<E> {
    /// The breaker is open and the operation was not invoked. There is no
    /// recent result to report, so this variant carries no payload.
    Open,
    /// The operation was invoked and failed with its own error.
    Inner(E),
}

impl<E> CallError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CallError::Open)
    }

    pub fn is_inner(&self) -> bool {
        matches!(self, CallError::Inner(_))
    }

    /// Returns the underlying error, if the operation was actually invoked.
    pub fn into_inner(self) -> Option<E> {
        match self {
            CallError::Open => None,
            CallError::Inner(e) => Some(e),
        }
    }
}

impl<E: fmt::Display> fmt::Display for CallError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Open => write!(f, "circuit breaker is open, call rejected"),
            CallError::Inner(e) => write!(f, "guarded operation failed: {}", e),
        }
    }
}

impl<E: Error + 'static> Error for CallError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CallError::Open => None,
            CallError::Inner(e) => Some(e),
        }
    }
}
