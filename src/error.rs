//! Error types for the hook engine.

use std::sync::Arc;

use crate::hook::HookKind;
use crate::source::SourceId;

/// Errors surfaced by the hook engine.
///
/// Programmer-misuse and policy-limit errors are fatal by design: continuing
/// past any of them would corrupt the hook list or loop forever. User errors
/// from reducers and snapshot selectors are carried through unchanged so the
/// outer error-boundary mechanism can surface them.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RenderError {
    /// A component called more hook primitives this render than during the
    /// previous render, or the committed list ran out mid-sequence.
    #[error("rendered more hooks than during the previous render")]
    ExtraHooks,

    /// A component called fewer hook primitives this render than during the
    /// previous render.
    #[error("rendered fewer hooks than during the previous render")]
    FewerHooks,

    /// The hook call order changed between renders.
    #[error("hook order changed: slot {index} was {expected:?} on the previous render, got {found:?}")]
    OrderMismatch {
        /// Zero-based position in the hook call sequence.
        index: usize,
        /// The hook kind recorded at this slot on the previous render.
        expected: HookKind,
        /// The hook kind encountered this render.
        found: HookKind,
    },

    /// A stateful hook primitive was invoked while no component was
    /// rendering.
    #[error("hook primitives may only be called while a component is rendering")]
    OutsideRender,

    /// A component kept scheduling updates against itself during its own
    /// render until the retry bound was exhausted.
    #[error("too many re-renders: the component scheduled render-phase updates in {0} consecutive attempts")]
    TooManyRerenders(u32),

    /// A mutable-source read observed a version inconsistent with earlier
    /// reads in the same render pass.
    #[error("torn read from mutable source {source_id:?} during an interleaved render")]
    Tearing {
        /// The source whose read was inconsistent.
        source_id: SourceId,
    },

    /// The engine was handed a fiber id it does not own.
    #[error("unknown fiber {0:?}")]
    UnknownFiber(crate::hook::FiberId),

    /// An error thrown by user code (a reducer, memo initializer, or
    /// snapshot selector).
    #[error("user error: {0}")]
    User(Arc<anyhow::Error>),
}

impl From<anyhow::Error> for RenderError {
    fn from(err: anyhow::Error) -> Self {
        RenderError::User(Arc::new(err))
    }
}

impl RenderError {
    /// Returns a reference to the inner user error, if any.
    pub fn user_error(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            RenderError::User(e) => Some(e),
            _ => None,
        }
    }

    /// Attempts to downcast the user error to a concrete type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.user_error().and_then(|e| e.downcast_ref::<E>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_error_from_anyhow() {
        let err: RenderError = anyhow::anyhow!("reducer exploded").into();
        assert!(matches!(err, RenderError::User(_)));
        assert!(err.to_string().contains("reducer exploded"));
    }

    #[test]
    fn test_downcast_user_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: RenderError = anyhow::Error::from(io).into();
        assert!(err.downcast_ref::<std::io::Error>().is_some());
        assert!(err.downcast_ref::<std::fmt::Error>().is_none());
    }
}
