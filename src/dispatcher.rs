//! The phase state machine that gates hook-primitive dispatch.
//!
//! Every primitive call is routed through the engine's current phase. The
//! phase is swapped at render boundaries: `Mount` or `Update` before the
//! component function runs, `Rerender` while folding in render-phase
//! updates, and `ContextOnly` on every exit path, including throws. In
//! `ContextOnly` all stateful primitives fail fast, which turns "hook called
//! outside a render" into an immediate error instead of silent corruption.

use crate::error::RenderError;

/// The dispatch phase selecting each primitive's behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderPhase {
    /// First render of a component instance: hooks are created.
    Mount,
    /// Subsequent render: hooks are cloned from the committed list.
    Update,
    /// Re-invocation after a render-phase update: pending updates apply
    /// unconditionally.
    Rerender,
    /// No component is rendering: only context reads are legal.
    #[default]
    ContextOnly,
}

impl RenderPhase {
    /// Fails unless a component function is currently executing.
    pub(crate) fn ensure_rendering(self) -> Result<(), RenderError> {
        match self {
            RenderPhase::ContextOnly => Err(RenderError::OutsideRender),
            _ => Ok(()),
        }
    }

    /// True while folding in render-phase updates.
    pub(crate) fn is_rerender(self) -> bool {
        matches!(self, RenderPhase::Rerender)
    }
}
