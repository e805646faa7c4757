//! The hook engine: fiber arena, the bounded render-phase loop, the external
//! dispatch path, and commit/bailout/rollback.

use std::any::TypeId;
use std::sync::Arc;

use parking_lot::Mutex;
use slab::Slab;

use crate::context::HookContext;
use crate::dispatcher::RenderPhase;
use crate::effect::{CommitSummary, EffectTag};
use crate::error::RenderError;
use crate::hook::{Fiber, FiberId, HookMemo};
use crate::lanes::Lanes;
use crate::scheduler::Scheduler;
use crate::source::{MutableSource, SnapshotFn, SourceId, SourceVersion};
use crate::update::{Action, StoredError, Update};
use crate::value::{downcast, value, values_equal, StateValue};

/// Upper bound on render-phase re-invocations of one component within one
/// render. Hitting it is a deliberate policy failure, not a tunable: it is
/// the only defense against a component that unconditionally re-schedules
/// itself from its own render.
pub const MAX_RERENDERS: u32 = 25;

/// A component function: receives the render context and its props, returns
/// its rendered output. Both props and output are type-erased values.
pub type ComponentFn =
    Arc<dyn Fn(&mut HookContext<'_>, &StateValue) -> Result<StateValue, RenderError> + Send + Sync>;

/// A bound enqueue handle for one state cell.
///
/// Cheap to copy and valid for the lifetime of the hook's queue; dispatching
/// through it outside a render goes via [`HookEngine::dispatch`], inside a
/// render via [`HookContext::dispatch`](crate::HookContext::dispatch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    pub(crate) fiber: FiberId,
    pub(crate) queue: crate::update::QueueId,
}

/// The start handle returned by the transition hook.
#[derive(Clone)]
pub struct Transition {
    pub(crate) set_pending: Dispatch,
}

/// A dispatch requested from an effect body or a store notification, applied
/// when the host drains the queue between renders.
pub(crate) enum QueuedAction {
    Value(Action),
    Snapshot {
        source: MutableSource,
        get_snapshot: SnapshotFn,
    },
}

pub(crate) struct QueuedDispatch {
    pub handle: Dispatch,
    pub action: QueuedAction,
    pub lane: Option<Lanes>,
}

pub(crate) struct RenderState {
    pub fiber: FiberId,
    pub lanes: Lanes,
    pub hook_index: usize,
    pub did_schedule: bool,
}

/// The per-root hook engine.
///
/// Owns every fiber's hook state and the mutable-source consistency
/// trackers. All component-function execution is single-threaded through
/// [`render_with_hooks`](HookEngine::render_with_hooks); "concurrency" is
/// interleaving of attempts, which is safe because committed hook state is
/// never mutated in place by an in-progress attempt.
pub struct HookEngine {
    pub(crate) fibers: Slab<Fiber>,
    pub(crate) phase: RenderPhase,
    pub(crate) render: Option<RenderState>,
    contexts: ahash::HashMap<TypeId, StateValue>,
    /// Versions observed per source during the current render pass.
    wip_source_versions: ahash::HashMap<SourceId, SourceVersion>,
    /// Lanes with unflushed mutations per source.
    source_pending_lanes: ahash::HashMap<SourceId, Lanes>,
    /// Sources that failed a consistency check and must re-synchronize.
    dirty_sources: ahash::HashSet<SourceId>,
    /// Dispatches requested off the render path (effects, store handlers).
    pub(crate) queued: Arc<Mutex<Vec<QueuedDispatch>>>,
    pub(crate) transition_override: Option<Lanes>,
    pub(crate) next_opaque_id: u64,
}

impl Default for HookEngine {
    fn default() -> Self {
        Self {
            fibers: Slab::new(),
            phase: RenderPhase::ContextOnly,
            render: None,
            contexts: Default::default(),
            wip_source_versions: Default::default(),
            source_pending_lanes: Default::default(),
            dirty_sources: Default::default(),
            queued: Arc::new(Mutex::new(Vec::new())),
            transition_override: None,
            next_opaque_id: 0,
        }
    }
}

impl HookEngine {
    /// Create an empty engine.
    pub fn new() -> Self {
        Default::default()
    }

    /// Allocate a component instance.
    pub fn create_fiber(&mut self) -> FiberId {
        FiberId(self.fibers.insert(Fiber::new()))
    }

    /// Discard a component instance, running every committed effect cleanup
    /// in registration order.
    pub fn remove_fiber(&mut self, id: FiberId) -> Result<(), RenderError> {
        if !self.fibers.contains(id.0) {
            return Err(RenderError::UnknownFiber(id));
        }
        let fiber = self.fibers.remove(id.0);
        for effect in &fiber.committed_effects {
            if let Some(destroy) = &effect.destroy {
                destroy();
            }
        }
        Ok(())
    }

    /// Lanes with pending updates against a fiber.
    pub fn pending_lanes(&self, id: FiberId) -> Result<Lanes, RenderError> {
        self.fibers
            .get(id.0)
            .map(|f| f.lanes)
            .ok_or(RenderError::UnknownFiber(id))
    }

    /// Provide a context value readable by any component through
    /// [`HookContext::use_context`](crate::HookContext::use_context).
    pub fn provide_context<T: Send + Sync + 'static>(&mut self, v: T) {
        self.contexts.insert(TypeId::of::<T>(), value(v));
    }

    /// Read a provided context value. Legal in every phase, including
    /// outside renders.
    pub fn read_context<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.contexts
            .get(&TypeId::of::<T>())
            .and_then(|v| downcast::<T>(v))
    }

    pub(crate) fn fiber_mut(&mut self, id: FiberId) -> Result<&mut Fiber, RenderError> {
        self.fibers.get_mut(id.0).ok_or(RenderError::UnknownFiber(id))
    }

    pub(crate) fn render_state(&self) -> &RenderState {
        match &self.render {
            Some(rs) => rs,
            None => unreachable!("hook primitive reached without an active render"),
        }
    }

    pub(crate) fn render_state_mut(&mut self) -> &mut RenderState {
        match &mut self.render {
            Some(rs) => rs,
            None => unreachable!("hook primitive reached without an active render"),
        }
    }

    fn take_render_phase_flag(&mut self) -> bool {
        match &mut self.render {
            Some(rs) => std::mem::replace(&mut rs.did_schedule, false),
            None => false,
        }
    }

    /// Render a component: invoke `component` once, then re-invoke while it
    /// keeps scheduling updates against itself, up to [`MAX_RERENDERS`]
    /// attempts.
    ///
    /// On success the fiber's work-in-progress hook list holds the new
    /// state; nothing committed has changed until [`commit`](Self::commit).
    /// On error the caller must run
    /// [`reset_hooks_after_throw`](Self::reset_hooks_after_throw) before
    /// rendering this fiber again.
    pub fn render_with_hooks<S: Scheduler>(
        &mut self,
        id: FiberId,
        component: &ComponentFn,
        props: &StateValue,
        lanes: Lanes,
        scheduler: &mut S,
    ) -> Result<StateValue, RenderError> {
        {
            let fiber = self.fiber_mut(id)?;
            fiber.wip_hooks.clear();
            fiber.pending_effects.clear();
            fiber.flags = EffectTag::empty();
            fiber.wip_lanes = Lanes::NONE;
            fiber.rendered_lanes = lanes;
            self.phase = if fiber.mounted {
                RenderPhase::Update
            } else {
                RenderPhase::Mount
            };
        }
        self.render = Some(RenderState {
            fiber: id,
            lanes,
            hook_index: 0,
            did_schedule: false,
        });

        let result = self.render_attempts(id, component, props, scheduler);

        // Every exit path lands in the context-only phase.
        self.phase = RenderPhase::ContextOnly;
        self.render = None;
        result
    }

    fn render_attempts<S: Scheduler>(
        &mut self,
        id: FiberId,
        component: &ComponentFn,
        props: &StateValue,
        scheduler: &mut S,
    ) -> Result<StateValue, RenderError> {
        let mut output = self.invoke(component, props, scheduler)?;

        let mut rerenders: u32 = 0;
        while self.take_render_phase_flag() {
            rerenders += 1;
            if rerenders >= MAX_RERENDERS {
                return Err(RenderError::TooManyRerenders(MAX_RERENDERS));
            }
            {
                let fiber = self.fiber_mut(id)?;
                fiber.pending_effects.clear();
                fiber.flags = EffectTag::empty();
                self.render_state_mut().hook_index = 0;
            }
            self.phase = RenderPhase::Rerender;
            output = self.invoke(component, props, scheduler)?;
        }

        let fiber = self.fiber_mut(id)?;
        if fiber.mounted && fiber.wip_hooks.len() < fiber.hooks.len() {
            return Err(RenderError::FewerHooks);
        }
        Ok(output)
    }

    fn invoke<S: Scheduler>(
        &mut self,
        component: &ComponentFn,
        props: &StateValue,
        scheduler: &mut S,
    ) -> Result<StateValue, RenderError> {
        let mut ctx = HookContext {
            engine: self,
            scheduler,
        };
        component(&mut ctx, props)
    }

    /// Fast path for a render that changed nothing: carry the committed hook
    /// list and update queues over verbatim, clear pending effect flags, and
    /// record the rendered lanes for commit to retire. A commit after this is
    /// indistinguishable from having skipped the render.
    pub fn bailout_hooks(&mut self, id: FiberId, lanes: Lanes) -> Result<(), RenderError> {
        let fiber = self.fiber_mut(id)?;
        fiber.wip_hooks = fiber.hooks.clone();
        fiber.pending_effects = fiber
            .committed_effects
            .iter()
            .map(|e| {
                let mut e = e.clone();
                e.tag.remove(EffectTag::HAS_EFFECT);
                e
            })
            .collect();
        fiber.flags = EffectTag::empty();
        fiber.wip_lanes = Lanes::NONE;
        fiber.rendered_lanes = lanes;
        Ok(())
    }

    /// Roll a fiber back after a throw escaped its render.
    ///
    /// Discards the work-in-progress hook list and, if the aborted pass had
    /// flagged render-phase updates, the pending updates they enqueued.
    /// Committed state, including the lanes recorded by earlier dispatches,
    /// is untouched.
    pub fn reset_hooks_after_throw(&mut self, id: FiberId) -> Result<(), RenderError> {
        let fiber = self.fiber_mut(id)?;
        if fiber.render_phase_pending {
            for i in 0..fiber.wip_hooks.len() {
                if let Some(qid) = fiber.wip_hooks[i].queue {
                    if let Some(queue) = fiber.queues.get_mut(qid.0) {
                        queue.pending.clear();
                    }
                }
            }
            fiber.render_phase_pending = false;
        }
        fiber.wip_hooks.clear();
        fiber.pending_effects.clear();
        fiber.flags = EffectTag::empty();
        fiber.wip_lanes = Lanes::NONE;
        self.phase = RenderPhase::ContextOnly;
        self.render = None;
        Ok(())
    }

    /// Commit the work-in-progress hook list, making it the new committed
    /// state, and return the pending effect work for the external flush
    /// phase. Retires the rendered lanes; skipped updates and anything
    /// enqueued since the attempt finished stay pending.
    pub fn commit(&mut self, id: FiberId) -> Result<CommitSummary, RenderError> {
        let mut committed_sources = Vec::new();
        let (summary, rendered_lanes) = {
            let fiber = self.fiber_mut(id)?;
            fiber.hooks = std::mem::take(&mut fiber.wip_hooks);
            fiber.committed_effects = std::mem::take(&mut fiber.pending_effects);
            fiber.flags = EffectTag::empty();
            fiber.mounted = true;
            fiber.render_phase_pending = false;

            // Queues no committed hook references any more are garbage.
            let live: Vec<usize> = fiber
                .hooks
                .iter()
                .filter_map(|h| h.queue.map(|q| q.0))
                .collect();
            fiber.queues.retain(|key, _| live.contains(&key));

            // Retire the rendered lanes. Skipped updates keep theirs, and so
            // does anything dispatched between the attempt and this commit.
            let mut lanes = fiber
                .lanes
                .difference(fiber.rendered_lanes)
                .merge(fiber.wip_lanes);
            for (_, queue) in fiber.queues.iter() {
                for update in &queue.pending {
                    lanes = lanes.merge(update.lane);
                }
            }
            fiber.lanes = lanes;
            fiber.wip_lanes = Lanes::NONE;

            let mut flags = EffectTag::empty();
            for effect in &fiber.committed_effects {
                if effect.tag.contains(EffectTag::HAS_EFFECT) {
                    flags |= effect.tag & (EffectTag::PASSIVE | EffectTag::LAYOUT);
                }
            }
            for hook in &fiber.hooks {
                if let HookMemo::Source(binding) = &hook.memoized {
                    committed_sources.push(binding.source.id());
                }
            }
            (
                CommitSummary {
                    flags,
                    effects: fiber.committed_effects.len(),
                },
                fiber.rendered_lanes,
            )
        };

        // Mutations covered by this commit are now flushed for its sources.
        for source in committed_sources {
            if let Some(lanes) = self.source_pending_lanes.get_mut(&source) {
                *lanes = lanes.difference(rendered_lanes);
            }
            self.dirty_sources.remove(&source);
        }
        Ok(summary)
    }

    /// Run pending effect bodies of `kind` for a committed fiber.
    ///
    /// Cleanups from the previous commit run first, in registration order,
    /// then the new bodies, also in order. Returns how many bodies ran.
    pub fn flush_effects(&mut self, id: FiberId, kind: EffectTag) -> Result<usize, RenderError> {
        let fiber = self.fiber_mut(id)?;
        let pending: Vec<usize> = fiber
            .committed_effects
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_pending(kind))
            .map(|(i, _)| i)
            .collect();

        for &i in &pending {
            if let Some(destroy) = fiber.committed_effects[i].destroy.take() {
                destroy();
            }
        }
        for &i in &pending {
            let create = fiber.committed_effects[i].create.clone();
            let cleanup = create();
            let effect = &mut fiber.committed_effects[i];
            effect.destroy = cleanup;
            effect.tag.remove(EffectTag::HAS_EFFECT);
        }
        Ok(pending.len())
    }

    /// Apply every dispatch requested off the render path (deferred-value
    /// follow-ups, store change notifications). Returns how many updates
    /// were actually enqueued.
    pub fn flush_queued<S: Scheduler>(&mut self, scheduler: &mut S) -> Result<usize, RenderError> {
        let drained: Vec<QueuedDispatch> = std::mem::take(&mut *self.queued.lock());
        let mut applied = 0;
        for queued in drained {
            match queued.action {
                QueuedAction::Value(action) => {
                    match self.dispatch_with_lane(&queued.handle, action, queued.lane, scheduler) {
                        Ok(()) => applied += 1,
                        Err(RenderError::UnknownFiber(_)) => {} // unmounted since
                        Err(e) => return Err(e),
                    }
                }
                QueuedAction::Snapshot {
                    source,
                    get_snapshot,
                } => {
                    applied +=
                        self.apply_source_change(&queued.handle, &source, &get_snapshot, scheduler)?;
                }
            }
        }
        Ok(applied)
    }

    fn apply_source_change<S: Scheduler>(
        &mut self,
        handle: &Dispatch,
        source: &MutableSource,
        get_snapshot: &SnapshotFn,
        scheduler: &mut S,
    ) -> Result<usize, RenderError> {
        let action = match get_snapshot(source.payload()) {
            Ok(snapshot) => {
                let unchanged = self
                    .fibers
                    .get(handle.fiber.0)
                    .and_then(|f| f.queues.get(handle.queue.0))
                    .map(|q| values_equal(&q.last_rendered_state, &snapshot))
                    .unwrap_or(true);
                if unchanged {
                    return Ok(0);
                }
                snapshot
            }
            // The handler cannot surface errors itself; store the failure in
            // the state cell so the next render observes and propagates it.
            Err(e) => value(StoredError(Arc::new(e))),
        };

        let already_pending = self
            .source_pending_lanes
            .get(&source.id())
            .copied()
            .unwrap_or(Lanes::NONE);
        let entry = self
            .source_pending_lanes
            .entry(source.id())
            .or_insert(Lanes::NONE);
        *entry = entry.merge(Lanes::MUTABLE_READ);
        scheduler.mark_root_mutable_read(Lanes::MUTABLE_READ);
        // Pending reads of the same source must commit together.
        scheduler.mark_root_entangled(Lanes::MUTABLE_READ.merge(already_pending));

        match self.dispatch_with_lane(handle, action, Some(Lanes::MUTABLE_READ), scheduler) {
            Ok(()) => Ok(1),
            Err(RenderError::UnknownFiber(_)) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Enqueue an action against a state cell from outside a render.
    ///
    /// Inside a render against the same fiber this records a render-phase
    /// update instead of issuing a scheduling request.
    pub fn dispatch<S: Scheduler>(
        &mut self,
        handle: &Dispatch,
        action: Action,
        scheduler: &mut S,
    ) -> Result<(), RenderError> {
        self.dispatch_with_lane(handle, action, None, scheduler)
    }

    pub(crate) fn dispatch_with_lane(
        &mut self,
        handle: &Dispatch,
        action: Action,
        lane_override: Option<Lanes>,
        scheduler: &mut dyn Scheduler,
    ) -> Result<(), RenderError> {
        // Render-phase update: flag it and fold it in after this invocation
        // returns, instead of scheduling externally.
        let rendering_this_fiber = self
            .render
            .as_ref()
            .map(|rs| rs.fiber == handle.fiber)
            .unwrap_or(false);
        if rendering_this_fiber {
            let lane = lane_override
                .or(self.transition_override)
                .unwrap_or_else(|| scheduler.request_update_lane());
            self.render_state_mut().did_schedule = true;
            let fiber = self.fiber_mut(handle.fiber)?;
            fiber.render_phase_pending = true;
            if let Some(queue) = fiber.queues.get_mut(handle.queue.0) {
                queue.pending.push(Update::new(lane, action));
            }
            return Ok(());
        }

        let lane = lane_override
            .or(self.transition_override)
            .unwrap_or_else(|| scheduler.request_update_lane());
        let time = scheduler.request_event_time();
        let fiber = self.fiber_mut(handle.fiber)?;
        let Some(queue) = fiber.queues.get_mut(handle.queue.0) else {
            // The cell this handle pointed at was discarded (e.g. a mutable
            // source binding changed identity); the dispatch is a no-op.
            return Ok(());
        };

        let mut update = Update::new(lane, action);
        if fiber.lanes.is_none() {
            // The queue is otherwise fully drained: apply the action now and
            // cache the result. If the state would not change, the render
            // was never necessary and no scheduling request is issued.
            let reducer = queue.last_rendered_reducer.clone();
            match reducer(&queue.last_rendered_state, &update.action) {
                Ok(eager) => {
                    let bail = values_equal(&eager, &queue.last_rendered_state);
                    update.eager = Some((reducer, eager));
                    queue.pending.push(update);
                    if bail {
                        return Ok(());
                    }
                }
                // Suppressed on purpose: the authoritative apply during the
                // next render re-runs the reducer and surfaces the error.
                Err(_) => queue.pending.push(update),
            }
        } else {
            queue.pending.push(update);
        }

        fiber.lanes = fiber.lanes.merge(lane);
        scheduler.schedule_update(handle.fiber, lane, time);
        Ok(())
    }

    /// Mark the pending flag, then run `scope` with every dispatch inside it
    /// carried on the transition lane, then schedule the flag's reset on
    /// that same lane.
    pub fn start_transition<S: Scheduler>(
        &mut self,
        transition: &Transition,
        scheduler: &mut S,
        scope: impl FnOnce(&mut HookEngine, &mut S) -> Result<(), RenderError>,
    ) -> Result<(), RenderError> {
        self.dispatch_with_lane(&transition.set_pending, value(true), None, scheduler)?;
        let prev = self.transition_override.replace(Lanes::TRANSITION);
        let result = self
            .dispatch_with_lane(&transition.set_pending, value(false), None, scheduler)
            .and_then(|_| scope(self, scheduler));
        self.transition_override = prev;
        result
    }

    /// The tear-free read protocol for an unsubscribed mutable source.
    ///
    /// A read is safe when the store's version matches the version already
    /// observed this render pass, or, for the first read of a pass, when the
    /// lanes being rendered cover every lane with unflushed mutations
    /// against this source. An unsafe read marks the source dirty and fails:
    /// rendering must not proceed past an inconsistent value.
    pub(crate) fn read_from_unsubscribed_source(
        &mut self,
        source: &MutableSource,
        get_snapshot: &SnapshotFn,
        render_lanes: Lanes,
    ) -> Result<StateValue, RenderError> {
        let id = source.id();
        let current = source.version();
        match self.wip_source_versions.get(&id) {
            Some(observed) if *observed == current => {}
            Some(_) => {
                self.dirty_sources.insert(id);
                return Err(RenderError::Tearing { source_id: id });
            }
            None => {
                let pending = self
                    .source_pending_lanes
                    .get(&id)
                    .copied()
                    .unwrap_or(Lanes::NONE);
                if pending.is_subset_of(render_lanes) {
                    self.wip_source_versions.insert(id, current);
                } else {
                    self.dirty_sources.insert(id);
                    return Err(RenderError::Tearing { source_id: id });
                }
            }
        }
        get_snapshot(source.payload()).map_err(RenderError::from)
    }

    /// True if a source failed a consistency check and its committed
    /// subscribers must re-synchronize.
    pub fn is_source_dirty(&self, id: SourceId) -> bool {
        self.dirty_sources.contains(&id)
    }

    /// Forget the versions observed so far, ending the render pass for
    /// mutable-source consistency tracking.
    ///
    /// A pass may span several fibers and their commits; the host calls this
    /// once every fiber of the pass has landed, or when the pass is
    /// abandoned.
    pub fn reset_source_versions(&mut self) {
        self.wip_source_versions.clear();
    }
}
