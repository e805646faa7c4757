//! Effect records and the per-commit effect list.

use std::sync::Arc;

use bitflags::bitflags;

use crate::value::Deps;

bitflags! {
    /// Kind and pending-work flags for one effect record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EffectTag: u8 {
        /// The effect body must run during the next flush of its kind.
        const HAS_EFFECT = 1 << 0;
        /// Flushed asynchronously after paint.
        const PASSIVE = 1 << 1;
        /// Flushed synchronously before paint.
        const LAYOUT = 1 << 2;
    }
}

/// The body of an effect. Returns an optional cleanup to run before the next
/// body, or on unmount.
pub type EffectCreate = Arc<dyn Fn() -> Option<EffectCleanup> + Send + Sync>;

/// A cleanup callback returned by an effect body.
pub type EffectCleanup = Arc<dyn Fn() + Send + Sync>;

/// One side-effect record registered by a hook during one render.
///
/// The fiber's pending commit owns a list of these, rebuilt wholesale on
/// every render attempt; registration order is flush order.
#[derive(Clone)]
pub struct Effect {
    /// Kind plus the pending-work flag.
    pub tag: EffectTag,
    /// The effect body.
    pub create: EffectCreate,
    /// Cleanup from the previous commit, relinked even when the body is
    /// skipped so unmount still tears it down.
    pub destroy: Option<EffectCleanup>,
    /// Dependency list; `None` means "always rerun".
    pub deps: Option<Deps>,
}

impl Effect {
    /// Returns true if this record's body must run during a flush of `kind`.
    pub fn is_pending(&self, kind: EffectTag) -> bool {
        self.tag.contains(EffectTag::HAS_EFFECT) && self.tag.intersects(kind)
    }
}

/// Summary of the pending work attached to a commit, handed to the external
/// effect-flushing phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitSummary {
    /// Union of the kind bits of every record with a pending body.
    pub flags: EffectTag,
    /// Number of effect records attached to the commit.
    pub effects: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_respects_kind_and_flag() {
        let noop: EffectCreate = Arc::new(|| None);
        let effect = Effect {
            tag: EffectTag::PASSIVE | EffectTag::HAS_EFFECT,
            create: noop.clone(),
            destroy: None,
            deps: None,
        };
        assert!(effect.is_pending(EffectTag::PASSIVE));
        assert!(!effect.is_pending(EffectTag::LAYOUT));

        let bailed = Effect {
            tag: EffectTag::PASSIVE,
            create: noop,
            destroy: None,
            deps: None,
        };
        assert!(!bailed.is_pending(EffectTag::PASSIVE));
    }
}
