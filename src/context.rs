//! The render context handed to component functions: every hook primitive
//! lives here.
//!
//! A [`HookContext`] only exists while the engine is executing a component
//! function; it borrows the engine and the scheduling collaborator for the
//! duration of one invocation. Each primitive advances the fiber's
//! work-in-progress hook list by exactly one slot, which is what makes the
//! call-order discipline checkable.

use std::sync::Arc;

use crate::effect::{EffectCreate, EffectTag};
use crate::engine::{Dispatch, HookEngine, QueuedAction, QueuedDispatch, Transition};
use crate::error::RenderError;
use crate::hook::{FiberId, HookKind, HookMemo, RefHandle, SlotOrigin};
use crate::lanes::Lanes;
use crate::scheduler::Scheduler;
use crate::source::{MutableSource, SnapshotFn, SourceBinding, SubscribeFn};
use crate::update::{
    basic_state_reducer, snapshot_reducer, Action, QueueId, Reducer, UpdateQueue,
};
use crate::value::{deps_equal, downcast, value, values_equal, Deps, StateValue};

/// The per-invocation render context.
pub struct HookContext<'a> {
    pub(crate) engine: &'a mut HookEngine,
    pub(crate) scheduler: &'a mut dyn Scheduler,
}

impl HookContext<'_> {
    fn fiber_id(&self) -> FiberId {
        self.engine.render_state().fiber
    }

    /// Claim the next hook slot for this call site.
    fn next_hook(
        &mut self,
        kind: HookKind,
        init: impl FnOnce() -> HookMemo,
    ) -> Result<(usize, SlotOrigin), RenderError> {
        self.engine.phase.ensure_rendering()?;
        let rs = self.engine.render_state_mut();
        let index = rs.hook_index;
        rs.hook_index += 1;
        let fiber_id = rs.fiber;
        let fiber = self.engine.fiber_mut(fiber_id)?;
        let origin = fiber.next_wip_slot(index, kind, init)?;
        Ok((index, origin))
    }

    /// A state cell with typed access. `init` runs only on mount.
    pub fn use_state<T: Send + Sync + 'static>(
        &mut self,
        init: impl FnOnce() -> T,
    ) -> Result<(Arc<T>, Dispatch), RenderError> {
        let (state, dispatch) = self.use_state_value(|| value(init()))?;
        let state = downcast::<T>(&state).ok_or_else(|| {
            RenderError::from(anyhow::anyhow!("state cell holds a value of another type"))
        })?;
        Ok((state, dispatch))
    }

    /// A type-erased state cell. `init` runs only on mount.
    pub fn use_state_value(
        &mut self,
        init: impl FnOnce() -> StateValue,
    ) -> Result<(StateValue, Dispatch), RenderError> {
        self.reducer_hook(HookKind::State, basic_state_reducer(), init)
    }

    /// A reducer cell: dispatched actions are folded in by `reducer`.
    /// `init` runs only on mount.
    pub fn use_reducer(
        &mut self,
        reducer: Reducer,
        init: impl FnOnce() -> StateValue,
    ) -> Result<(StateValue, Dispatch), RenderError> {
        self.reducer_hook(HookKind::Reducer, reducer, init)
    }

    fn reducer_hook(
        &mut self,
        kind: HookKind,
        reducer: Reducer,
        init: impl FnOnce() -> StateValue,
    ) -> Result<(StateValue, Dispatch), RenderError> {
        let (index, origin) = self.next_hook(kind, || HookMemo::Value(init()))?;
        if origin == SlotOrigin::Fresh {
            let fid = self.fiber_id();
            let fiber = self.engine.fiber_mut(fid)?;
            let initial = match &fiber.wip_hooks[index].memoized {
                HookMemo::Value(v) => v.clone(),
                _ => unreachable!("fresh state slot holds a non-value memo"),
            };
            let qid = QueueId(fiber.queues.insert(UpdateQueue::new(reducer, initial.clone())));
            let hook = &mut fiber.wip_hooks[index];
            hook.base_state = Some(initial.clone());
            hook.queue = Some(qid);
            return Ok((initial, Dispatch { fiber: fid, queue: qid }));
        }
        self.update_reducer(index, reducer)
    }

    /// Fold a mounted cell's pending updates for this render attempt.
    fn update_reducer(
        &mut self,
        index: usize,
        reducer: Reducer,
    ) -> Result<(StateValue, Dispatch), RenderError> {
        let rerender = self.engine.phase.is_rerender();
        let render_lanes = self.engine.render_state().lanes;
        let fid = self.fiber_id();
        let fiber = self.engine.fiber_mut(fid)?;
        let qid = match fiber.wip_hooks[index].queue {
            Some(qid) => qid,
            None => unreachable!("mounted state slot lost its queue"),
        };
        let dispatch = Dispatch { fiber: fid, queue: qid };

        let pending = {
            let queue = match fiber.queues.get_mut(qid.0) {
                Some(queue) => queue,
                None => unreachable!("hook references a freed update queue"),
            };
            queue.last_rendered_reducer = reducer.clone();
            std::mem::take(&mut queue.pending)
        };

        if rerender {
            // Render-phase updates apply unconditionally, in enqueue order.
            let mut state = match &fiber.wip_hooks[index].memoized {
                HookMemo::Value(v) => v.clone(),
                _ => unreachable!("state slot holds a non-value memo"),
            };
            for update in &pending {
                state = reducer(&state, &update.action).map_err(RenderError::from)?;
            }
            let hook = &mut fiber.wip_hooks[index];
            hook.memoized = HookMemo::Value(state.clone());
            if hook.base_queue.is_empty() {
                hook.base_state = Some(state.clone());
            }
            fiber.queues[qid.0].last_rendered_state = state.clone();
            return Ok((state, dispatch));
        }

        // Mirror the drained updates onto the committed hook too: if this
        // attempt is discarded, they must not be lost with it.
        if let Some(committed) = fiber.hooks.get_mut(index) {
            committed.base_queue.extend(pending.iter().cloned());
        }

        let (base_state, base_queue) = {
            let hook = &mut fiber.wip_hooks[index];
            let base_state = match (&hook.base_state, &hook.memoized) {
                (Some(base), _) => base.clone(),
                (None, HookMemo::Value(v)) => v.clone(),
                _ => unreachable!("state slot holds a non-value memo"),
            };
            (base_state, std::mem::take(&mut hook.base_queue))
        };

        let outcome = crate::update::process_update_queue(
            base_state,
            base_queue,
            pending,
            &reducer,
            render_lanes,
        )?;

        let hook = &mut fiber.wip_hooks[index];
        hook.memoized = HookMemo::Value(outcome.state.clone());
        hook.base_state = Some(outcome.base_state);
        hook.base_queue = outcome.base_queue;
        fiber.queues[qid.0].last_rendered_state = outcome.state.clone();

        if !outcome.skipped.is_none() {
            fiber.wip_lanes = fiber.wip_lanes.merge(outcome.skipped);
            self.scheduler.mark_skipped_lanes(outcome.skipped);
        }
        Ok((outcome.state, dispatch))
    }

    /// Enqueue an action against a state cell from inside a render.
    ///
    /// Dispatching against the fiber currently rendering records a
    /// render-phase update that is folded in by an immediate re-invocation.
    pub fn dispatch(&mut self, handle: &Dispatch, action: Action) -> Result<(), RenderError> {
        self.engine
            .dispatch_with_lane(handle, action, None, &mut *self.scheduler)
    }

    /// A passive effect, flushed asynchronously after the commit.
    pub fn use_effect(
        &mut self,
        create: EffectCreate,
        deps: Option<Deps>,
    ) -> Result<(), RenderError> {
        self.effect_hook(HookKind::Effect, EffectTag::PASSIVE, create, deps, None)
    }

    /// A layout effect, flushed synchronously within the commit.
    pub fn use_layout_effect(
        &mut self,
        create: EffectCreate,
        deps: Option<Deps>,
    ) -> Result<(), RenderError> {
        self.effect_hook(HookKind::LayoutEffect, EffectTag::LAYOUT, create, deps, None)
    }

    /// `force` overrides the deps comparison: `Some(true)` always reruns,
    /// `Some(false)` always bails (relinking the previous cleanup).
    fn effect_hook(
        &mut self,
        kind: HookKind,
        tag: EffectTag,
        create: EffectCreate,
        deps: Option<Deps>,
        force: Option<bool>,
    ) -> Result<(), RenderError> {
        let (index, _) = self.next_hook(kind, || HookMemo::Effect(usize::MAX))?;
        let fid = self.fiber_id();
        let fiber = self.engine.fiber_mut(fid)?;

        // The previous commit's record carries the deps to compare against
        // and the cleanup to relink on bail-out.
        let prev = if fiber.mounted {
            fiber.hooks.get(index).and_then(|h| match &h.memoized {
                HookMemo::Effect(i) => fiber.committed_effects.get(*i),
                _ => None,
            })
        } else {
            None
        };

        let (rerun, destroy) = match prev {
            Some(prev) => {
                let rerun =
                    force.unwrap_or_else(|| !deps_equal(prev.deps.as_ref(), deps.as_ref()));
                (rerun, prev.destroy.clone())
            }
            None => (true, None),
        };

        let mut record_tag = tag;
        if rerun {
            record_tag |= EffectTag::HAS_EFFECT;
        }
        fiber.pending_effects.push(crate::effect::Effect {
            tag: record_tag,
            create,
            destroy,
            deps,
        });
        fiber.wip_hooks[index].memoized = HookMemo::Effect(fiber.pending_effects.len() - 1);
        if rerun {
            fiber.flags |= tag;
        }
        Ok(())
    }

    /// A value recomputed only when `deps` change.
    pub fn use_memo(
        &mut self,
        create: impl FnOnce() -> StateValue,
        deps: Option<Deps>,
    ) -> Result<StateValue, RenderError> {
        self.memo_hook(HookKind::Memo, create, deps)
    }

    /// A callback (or any value) whose identity is kept stable while `deps`
    /// are unchanged.
    pub fn use_callback(
        &mut self,
        callback: StateValue,
        deps: Option<Deps>,
    ) -> Result<StateValue, RenderError> {
        self.memo_hook(HookKind::Callback, move || callback, deps)
    }

    fn memo_hook(
        &mut self,
        kind: HookKind,
        create: impl FnOnce() -> StateValue,
        deps: Option<Deps>,
    ) -> Result<StateValue, RenderError> {
        let mut create = Some(create);
        let deps_for_init = deps.clone();
        let (index, origin) = self.next_hook(kind, || HookMemo::Memoized {
            value: match create.take() {
                Some(f) => f(),
                None => unreachable!(),
            },
            deps: deps_for_init,
        })?;
        let fid = self.fiber_id();
        let fiber = self.engine.fiber_mut(fid)?;
        let (prev_value, prev_deps) = match &fiber.wip_hooks[index].memoized {
            HookMemo::Memoized { value, deps } => (value.clone(), deps.clone()),
            _ => unreachable!("memo slot holds a non-memo value"),
        };
        if origin == SlotOrigin::Fresh || deps_equal(prev_deps.as_ref(), deps.as_ref()) {
            return Ok(prev_value);
        }
        let next = match create.take() {
            Some(f) => f(),
            // `init` already consumed it, which only happens on Fresh.
            None => unreachable!(),
        };
        fiber.wip_hooks[index].memoized = HookMemo::Memoized {
            value: next.clone(),
            deps,
        };
        Ok(next)
    }

    /// A mutable cell with stable identity. Writes never schedule a render.
    pub fn use_ref(
        &mut self,
        init: impl FnOnce() -> StateValue,
    ) -> Result<RefHandle, RenderError> {
        let (index, _) = self.next_hook(HookKind::Ref, || {
            HookMemo::Ref(RefHandle::new(init()))
        })?;
        let fid = self.fiber_id();
        let fiber = self.engine.fiber_mut(fid)?;
        match &fiber.wip_hooks[index].memoized {
            HookMemo::Ref(handle) => Ok(handle.clone()),
            _ => unreachable!("ref slot holds a non-ref value"),
        }
    }

    /// Read a context value provided on the engine. Legal in every phase and
    /// consumes no hook slot.
    pub fn use_context<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.engine.read_context::<T>()
    }

    /// An identifier stable across the component's lifetime, generated once
    /// on mount.
    pub fn use_opaque_identifier(&mut self) -> Result<String, RenderError> {
        let next = self.engine.next_opaque_id;
        let (index, origin) = self.next_hook(HookKind::OpaqueId, || {
            HookMemo::OpaqueId(format!("weft:{next}"))
        })?;
        let fid = self.fiber_id();
        let fiber = self.engine.fiber_mut(fid)?;
        let id = match &fiber.wip_hooks[index].memoized {
            HookMemo::OpaqueId(id) => id.clone(),
            _ => unreachable!("opaque-id slot holds a non-id value"),
        };
        if origin == SlotOrigin::Fresh {
            self.engine.next_opaque_id += 1;
        }
        Ok(id)
    }

    /// A value that lags behind `latest` by one scheduled follow-up render
    /// on the deferred lane. Returns the previously committed value.
    pub fn use_deferred_value(&mut self, latest: StateValue) -> Result<StateValue, RenderError> {
        let (previous, set) = self.reducer_hook(HookKind::DeferredValue, basic_state_reducer(), || {
            latest.clone()
        })?;
        let queued = self.engine.queued.clone();
        let next = latest.clone();
        let create: EffectCreate = Arc::new(move || {
            queued.lock().push(QueuedDispatch {
                handle: set,
                action: QueuedAction::Value(next.clone()),
                lane: Some(Lanes::DEFERRED),
            });
            None
        });
        // Keyed on the value itself: an unchanged value schedules nothing.
        self.effect_hook(
            HookKind::Effect,
            EffectTag::PASSIVE,
            create,
            Some(vec![latest]),
            None,
        )?;
        Ok(previous)
    }

    /// A pending flag plus a handle for starting transitions through
    /// [`HookEngine::start_transition`].
    pub fn use_transition(&mut self) -> Result<(bool, Transition), RenderError> {
        let (pending, set_pending) = self.use_state::<bool>(|| false)?;
        let (index, _) = self.next_hook(HookKind::Transition, || {
            HookMemo::Transition(value(Transition { set_pending }))
        })?;
        let fid = self.fiber_id();
        let fiber = self.engine.fiber_mut(fid)?;
        let transition = match &fiber.wip_hooks[index].memoized {
            HookMemo::Transition(t) => match downcast::<Transition>(t) {
                Some(t) => (*t).clone(),
                None => unreachable!("transition slot holds a non-transition value"),
            },
            _ => unreachable!("transition slot holds a non-transition value"),
        };
        Ok((*pending, transition))
    }

    /// Read a snapshot from an externally mutated store, tear-free, and
    /// subscribe to its changes.
    ///
    /// The read fails with [`RenderError::Tearing`] when it cannot be proven
    /// consistent with the other reads of this render pass; the host is
    /// expected to retry the render at lanes covering the source's pending
    /// mutations.
    pub fn use_mutable_source(
        &mut self,
        source: &MutableSource,
        get_snapshot: SnapshotFn,
        subscribe: SubscribeFn,
    ) -> Result<StateValue, RenderError> {
        let current_version = source.version();
        let binding = SourceBinding {
            source: source.clone(),
            get_snapshot: get_snapshot.clone(),
            subscribe: subscribe.clone(),
            version: current_version,
        };
        let (index, origin) =
            self.next_hook(HookKind::MutableSource, || HookMemo::Source(binding.clone()))?;
        let render_lanes = self.engine.render_state().lanes;
        let fid = self.fiber_id();

        let prev = {
            let fiber = self.engine.fiber_mut(fid)?;
            match &fiber.wip_hooks[index].memoized {
                HookMemo::Source(prev) => prev.clone(),
                _ => unreachable!("source slot holds a non-source value"),
            }
        };
        let inputs_changed = origin != SlotOrigin::Fresh
            && prev.inputs_changed(source, &get_snapshot, &subscribe);

        // Consistency-checked read; also records the version observed so
        // later reads of this source in the same pass are validated.
        let snapshot =
            self.engine
                .read_from_unsubscribed_source(source, &get_snapshot, render_lanes)?;

        {
            let fiber = self.engine.fiber_mut(fid)?;
            fiber.wip_hooks[index].memoized = HookMemo::Source(binding);
        }

        let (state, set) = if origin == SlotOrigin::Fresh {
            self.seed_snapshot_cell(snapshot.clone(), false)?
        } else if inputs_changed {
            // A different store or selector: the old cell's pending updates
            // are about stale data, so the queue is replaced wholesale.
            self.seed_snapshot_cell(snapshot.clone(), true)?
        } else {
            let (state, set) = self.reducer_hook(HookKind::State, snapshot_reducer(), || {
                snapshot.clone()
            })?;
            if prev.version != current_version && !values_equal(&state, &snapshot) {
                // The store moved since the cell last synchronized; fold the
                // fresh snapshot in before this render is allowed to finish.
                self.dispatch(&set, snapshot.clone())?;
            }
            (state, set)
        };

        let resubscribe = origin == SlotOrigin::Fresh || inputs_changed;
        let queued = self.engine.queued.clone();
        let notify_source = source.clone();
        let notify_snapshot = get_snapshot.clone();
        let create: EffectCreate = Arc::new(move || {
            let queued = queued.clone();
            let source = notify_source.clone();
            let get_snapshot = notify_snapshot.clone();
            let handler: crate::source::ChangeHandler = Arc::new(move || {
                queued.lock().push(QueuedDispatch {
                    handle: set,
                    action: QueuedAction::Snapshot {
                        source: source.clone(),
                        get_snapshot: get_snapshot.clone(),
                    },
                    lane: Some(Lanes::MUTABLE_READ),
                });
            });
            Some((subscribe)(&notify_source, handler))
        });
        // Resubscription is keyed on binding identity, not on deps.
        self.effect_hook(
            HookKind::Effect,
            EffectTag::PASSIVE,
            create,
            None,
            Some(resubscribe),
        )?;

        Ok(state)
    }

    /// Build (or rebuild) the snapshot state cell around `snapshot`.
    fn seed_snapshot_cell(
        &mut self,
        snapshot: StateValue,
        replace: bool,
    ) -> Result<(StateValue, Dispatch), RenderError> {
        let (index, _) = self.next_hook(HookKind::State, || HookMemo::Value(snapshot.clone()))?;
        let fid = self.fiber_id();
        if !replace && self.engine.fiber_mut(fid)?.wip_hooks[index].queue.is_some() {
            // Mount re-render: the cell from the first attempt stands, with
            // any render-phase updates folded in the normal way.
            return self.update_reducer(index, snapshot_reducer());
        }
        let fiber = self.engine.fiber_mut(fid)?;
        let qid = QueueId(
            fiber
                .queues
                .insert(UpdateQueue::new(snapshot_reducer(), snapshot.clone())),
        );
        let hook = &mut fiber.wip_hooks[index];
        hook.memoized = HookMemo::Value(snapshot.clone());
        hook.base_state = Some(snapshot.clone());
        hook.base_queue.clear();
        hook.queue = Some(qid);
        Ok((snapshot, Dispatch { fiber: fid, queue: qid }))
    }
}
