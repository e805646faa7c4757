//! The per-component hook list and the fiber that owns it.
//!
//! Hooks live in flat vectors indexed by call order rather than in linked
//! cells: the committed list is what the last commit produced, the
//! work-in-progress list is rebuilt (by cloning committed slots) on every
//! render attempt and swapped in wholesale on commit. A discarded attempt is
//! therefore free; committed slots are never mutated in place.

use parking_lot::Mutex;
use slab::Slab;
use std::sync::Arc;

use crate::effect::{Effect, EffectTag};
use crate::error::RenderError;
use crate::lanes::Lanes;
use crate::source::SourceBinding;
use crate::update::{QueueId, Update, UpdateQueue};
use crate::value::{Deps, StateValue};

/// Identifies a component instance inside the engine's fiber arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(pub(crate) usize);

/// The kind of a hook call site.
///
/// The sequence of kinds encountered on every render of a mounted component
/// must be identical; this is what lets the N-th call of a new render reuse
/// the N-th committed hook's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// A plain state cell.
    State,
    /// A reducer cell.
    Reducer,
    /// A passive effect registration.
    Effect,
    /// A layout effect registration.
    LayoutEffect,
    /// A memoized value.
    Memo,
    /// A memoized callback.
    Callback,
    /// A mutable ref cell.
    Ref,
    /// A deferred-value cell.
    DeferredValue,
    /// A transition handle.
    Transition,
    /// A mutable external source subscription.
    MutableSource,
    /// A stable opaque identifier.
    OpaqueId,
}

/// A shared mutable cell whose identity is stable across renders.
#[derive(Clone)]
pub struct RefHandle {
    inner: Arc<Mutex<StateValue>>,
}

impl RefHandle {
    pub(crate) fn new(initial: StateValue) -> Self {
        Self {
            inner: Arc::new(Mutex::new(initial)),
        }
    }

    /// Read the current value.
    pub fn get(&self) -> StateValue {
        self.inner.lock().clone()
    }

    /// Replace the current value. Never schedules a render.
    pub fn set(&self, v: StateValue) {
        *self.inner.lock() = v;
    }
}

/// What a hook slot memoizes, by kind.
#[derive(Clone)]
pub(crate) enum HookMemo {
    /// State, reducer, and deferred-value cells: the last committed value.
    Value(StateValue),
    /// Effect hooks: index of this slot's record in the commit's effect list.
    Effect(usize),
    /// Memo and callback hooks: the value plus the deps that produced it.
    Memoized {
        value: StateValue,
        deps: Option<Deps>,
    },
    /// Ref hooks: the shared cell itself.
    Ref(RefHandle),
    /// Transition hooks: the memoized start handle.
    Transition(StateValue),
    /// Mutable-source hooks: the binding identities.
    Source(SourceBinding),
    /// Opaque-identifier hooks: the generated id.
    OpaqueId(String),
}

/// One hook call site's persistent cell.
#[derive(Clone)]
pub(crate) struct Hook {
    pub kind: HookKind,
    pub memoized: HookMemo,
    /// State before any unprocessed updates of insufficient priority.
    pub base_state: Option<StateValue>,
    /// Carried-over unprocessed update list.
    pub base_queue: Vec<Update>,
    /// The live pending-update queue, shared between the committed hook and
    /// its work-in-progress clone through the fiber's queue arena.
    pub queue: Option<QueueId>,
}

impl Hook {
    pub(crate) fn new(kind: HookKind, memoized: HookMemo) -> Self {
        Self {
            kind,
            memoized,
            base_state: None,
            base_queue: Vec::new(),
            queue: None,
        }
    }
}

/// Whether a hook slot was reused, cloned from the committed list, or
/// created fresh this attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotOrigin {
    /// Already built earlier this render pass (re-render case).
    Reused,
    /// Cloned from the committed list (normal update case).
    Cloned,
    /// Newly created (mount case).
    Fresh,
}

/// One component instance's persistent state.
pub(crate) struct Fiber {
    /// The committed hook list, in call order.
    pub hooks: Vec<Hook>,
    /// The hook list being built this render.
    pub wip_hooks: Vec<Hook>,
    /// Arena of update queues referenced by hooks via [`QueueId`].
    pub queues: Slab<UpdateQueue>,
    /// Lanes with pending updates against this fiber. Only commit retires
    /// lanes from this set; a discarded attempt leaves it untouched.
    pub lanes: Lanes,
    /// Lanes of updates skipped by the attempt in progress, folded back into
    /// `lanes` at commit.
    pub wip_lanes: Lanes,
    /// Effect records registered this render, replaced wholesale.
    pub pending_effects: Vec<Effect>,
    /// Effect records from the last commit.
    pub committed_effects: Vec<Effect>,
    /// Union of pending effect kinds for this render.
    pub flags: EffectTag,
    /// True once the fiber has committed at least once.
    pub mounted: bool,
    /// Set when a render-phase update was enqueued and not yet committed or
    /// rolled back; rollback uses it to know the pending queues are tainted.
    pub render_phase_pending: bool,
    /// Lanes of the most recent render attempt, consumed by commit.
    pub rendered_lanes: Lanes,
}

impl Fiber {
    pub(crate) fn new() -> Self {
        Self {
            hooks: Vec::new(),
            wip_hooks: Vec::new(),
            queues: Slab::new(),
            lanes: Lanes::NONE,
            wip_lanes: Lanes::NONE,
            pending_effects: Vec::new(),
            committed_effects: Vec::new(),
            flags: EffectTag::empty(),
            mounted: false,
            render_phase_pending: false,
            rendered_lanes: Lanes::NONE,
        }
    }

    /// Advance the work-in-progress list to slot `index`.
    ///
    /// Reuses a slot already built this pass (re-render), clones the next
    /// committed hook (update), or appends a fresh cell (mount). Fails when
    /// the committed list runs out before the call sequence does, or when
    /// the kind at this position changed since the last render.
    pub(crate) fn next_wip_slot(
        &mut self,
        index: usize,
        kind: HookKind,
        init: impl FnOnce() -> HookMemo,
    ) -> Result<SlotOrigin, RenderError> {
        if index < self.wip_hooks.len() {
            let found = self.wip_hooks[index].kind;
            if found != kind {
                return Err(RenderError::OrderMismatch {
                    index,
                    expected: found,
                    found: kind,
                });
            }
            return Ok(SlotOrigin::Reused);
        }
        if self.mounted {
            let Some(committed) = self.hooks.get(index) else {
                return Err(RenderError::ExtraHooks);
            };
            if committed.kind != kind {
                return Err(RenderError::OrderMismatch {
                    index,
                    expected: committed.kind,
                    found: kind,
                });
            }
            self.wip_hooks.push(committed.clone());
            Ok(SlotOrigin::Cloned)
        } else {
            self.wip_hooks.push(Hook::new(kind, init()));
            Ok(SlotOrigin::Fresh)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::value;

    fn cell(v: i64) -> HookMemo {
        HookMemo::Value(value(v))
    }

    #[test]
    fn test_mount_appends_fresh_slots() {
        let mut fiber = Fiber::new();
        assert_eq!(
            fiber.next_wip_slot(0, HookKind::State, || cell(0)).unwrap(),
            SlotOrigin::Fresh
        );
        assert_eq!(
            fiber.next_wip_slot(1, HookKind::Effect, || cell(0)).unwrap(),
            SlotOrigin::Fresh
        );
        assert_eq!(fiber.wip_hooks.len(), 2);
    }

    #[test]
    fn test_update_clones_committed_slots_in_lockstep() {
        let mut fiber = Fiber::new();
        fiber.hooks = vec![
            Hook::new(HookKind::State, cell(1)),
            Hook::new(HookKind::Effect, cell(2)),
        ];
        fiber.mounted = true;
        assert_eq!(
            fiber.next_wip_slot(0, HookKind::State, || cell(0)).unwrap(),
            SlotOrigin::Cloned
        );
        assert_eq!(
            fiber.next_wip_slot(1, HookKind::Effect, || cell(0)).unwrap(),
            SlotOrigin::Cloned
        );
        // The committed list is exhausted: one more call is fatal.
        assert!(matches!(
            fiber.next_wip_slot(2, HookKind::State, || cell(0)),
            Err(RenderError::ExtraHooks)
        ));
    }

    #[test]
    fn test_kind_mismatch_is_fatal() {
        let mut fiber = Fiber::new();
        fiber.hooks = vec![Hook::new(HookKind::State, cell(1))];
        fiber.mounted = true;
        let err = fiber
            .next_wip_slot(0, HookKind::Memo, || cell(0))
            .unwrap_err();
        assert!(matches!(
            err,
            RenderError::OrderMismatch {
                index: 0,
                expected: HookKind::State,
                found: HookKind::Memo,
            }
        ));
    }

    #[test]
    fn test_rerender_reuses_wip_slots() {
        let mut fiber = Fiber::new();
        fiber
            .next_wip_slot(0, HookKind::State, || cell(7))
            .unwrap();
        // The re-render pass walks the same list from the top.
        assert_eq!(
            fiber.next_wip_slot(0, HookKind::State, || cell(0)).unwrap(),
            SlotOrigin::Reused
        );
    }

    #[test]
    fn test_ref_handle_shares_one_cell() {
        let r = RefHandle::new(value(1i64));
        let r2 = r.clone();
        r.set(value(2i64));
        assert_eq!(*crate::value::downcast::<i64>(&r2.get()).unwrap(), 2);
    }
}
