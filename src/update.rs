//! The per-hook update queue: enqueue, the eager fast path, and the
//! fold/skip/rebase walk performed once per render attempt.

use std::sync::Arc;
use std::sync::OnceLock;

use crate::error::RenderError;
use crate::lanes::Lanes;
use crate::value::{downcast, value, StateValue};

/// The payload of an update. For reducer cells this is whatever the user's
/// reducer understands; for plain state cells it is either the next value or
/// an [`Updater`].
pub type Action = StateValue;

/// A reducer folds an action into the previous state.
///
/// Reducer identity (`Arc::ptr_eq`) gates reuse of eagerly computed results:
/// a cached eager state is only trusted while the reducer that produced it is
/// still the active one.
pub type Reducer =
    Arc<dyn Fn(&StateValue, &StateValue) -> Result<StateValue, anyhow::Error> + Send + Sync>;

/// A functional update for a plain state cell.
///
/// When a dispatched action downcasts to this, the basic state reducer
/// applies the closure to the previous value instead of replacing it.
pub struct Updater(
    pub Arc<dyn Fn(&StateValue) -> Result<StateValue, anyhow::Error> + Send + Sync>,
);

/// Build a typed functional update for a state cell holding `T`.
pub fn updater<T: Send + Sync + 'static>(
    f: impl Fn(&T) -> T + Send + Sync + 'static,
) -> Action {
    value(Updater(Arc::new(move |prev| {
        let prev = downcast::<T>(prev)
            .ok_or_else(|| anyhow::anyhow!("state updater applied to a value of another type"))?;
        Ok(value(f(&prev)))
    })))
}

/// The reducer backing plain state cells: replace the state with the action,
/// unless the action is an [`Updater`], in which case apply it.
pub fn basic_state_reducer() -> Reducer {
    static REDUCER: OnceLock<Reducer> = OnceLock::new();
    REDUCER
        .get_or_init(|| {
            Arc::new(|state, action| {
                if let Some(up) = downcast::<Updater>(action) {
                    (up.0)(state)
                } else {
                    Ok(action.clone())
                }
            })
        })
        .clone()
}

/// An error captured off the render path and redirected into a state cell.
///
/// The mutable-source change handler cannot surface errors itself (it runs
/// between renders), so a failed snapshot read is stored as the next action;
/// the snapshot reducer re-raises it on the following render.
pub struct StoredError(pub Arc<anyhow::Error>);

/// The reducer backing mutable-source snapshot cells: pass values through,
/// re-raise a [`StoredError`].
pub fn snapshot_reducer() -> Reducer {
    static REDUCER: OnceLock<Reducer> = OnceLock::new();
    REDUCER
        .get_or_init(|| {
            Arc::new(|_state, action| {
                if let Some(stored) = downcast::<StoredError>(action) {
                    Err(anyhow::anyhow!("mutable source snapshot failed: {}", stored.0))
                } else {
                    Ok(action.clone())
                }
            })
        })
        .clone()
}

/// One requested mutation against a state cell.
#[derive(Clone)]
pub struct Update {
    /// Priority lane the update travels on. `Lanes::NONE` marks a rebased
    /// clone that must apply on every attempt.
    pub lane: Lanes,
    /// The action payload.
    pub action: Action,
    /// Result of applying the action ahead of scheduling, valid only while
    /// the cached reducer is still the active one.
    pub eager: Option<(Reducer, StateValue)>,
}

impl Update {
    pub(crate) fn new(lane: Lanes, action: Action) -> Self {
        Self {
            lane,
            action,
            eager: None,
        }
    }

    /// A lane-cleared copy, appended to the new base queue behind a skipped
    /// update so the replay next render applies it unconditionally.
    fn rebased(&self) -> Self {
        Self {
            lane: Lanes::NONE,
            action: self.action.clone(),
            eager: self.eager.clone(),
        }
    }
}

/// Index of an [`UpdateQueue`] in its fiber's queue arena.
///
/// Both the committed hook and its work-in-progress clone reference the same
/// queue through this id, so enqueues through an old handle stay visible to
/// an in-flight render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub(crate) usize);

/// The live pending-update queue owned by one hook.
pub struct UpdateQueue {
    /// Newly enqueued, not-yet-folded-in updates, in enqueue order.
    pub(crate) pending: Vec<Update>,
    /// The reducer used on the most recent render. Drives the eager path.
    pub(crate) last_rendered_reducer: Reducer,
    /// The state produced by the most recent render. Drives the eager path.
    pub(crate) last_rendered_state: StateValue,
}

impl UpdateQueue {
    pub(crate) fn new(reducer: Reducer, initial: StateValue) -> Self {
        Self {
            pending: Vec::new(),
            last_rendered_reducer: reducer,
            last_rendered_state: initial,
        }
    }
}

/// Result of one fold/skip/rebase walk over a hook's combined update list.
pub(crate) struct ProcessOutcome {
    /// The state after applying every sufficient-priority update.
    pub state: StateValue,
    /// The state to replay future attempts from.
    pub base_state: StateValue,
    /// Skipped updates plus rebased clones of later applied ones.
    pub base_queue: Vec<Update>,
    /// Lanes of every skipped update, to be re-marked as pending.
    pub skipped: Lanes,
}

/// Fold the carried-over base queue plus the newly drained pending list into
/// the state, skipping updates whose lane is not a subset of `render_lanes`
/// and rebasing everything behind the first skip.
///
/// The walk preserves enqueue order. An eagerly computed result is reused
/// only while its reducer is pointer-identical to the active one; otherwise
/// the reducer runs and its error, if any, propagates as a user error.
pub(crate) fn process_update_queue(
    base_state: StateValue,
    base_queue: Vec<Update>,
    pending: Vec<Update>,
    reducer: &Reducer,
    render_lanes: Lanes,
) -> Result<ProcessOutcome, RenderError> {
    // Splice newly queued updates onto the end of the carried-over queue.
    let mut combined = base_queue;
    combined.extend(pending);

    let mut state = base_state;
    let mut new_base_state: Option<StateValue> = None;
    let mut new_base_queue: Vec<Update> = Vec::new();
    let mut skipped = Lanes::NONE;

    for update in &combined {
        if !update.lane.is_subset_of(render_lanes) {
            // Insufficient priority: keep the update for a future attempt.
            // The first skip pins the base state at the value just before it.
            if new_base_state.is_none() {
                new_base_state = Some(state.clone());
            }
            new_base_queue.push(update.clone());
            skipped = skipped.merge(update.lane);
            continue;
        }
        // Once something was skipped, every later applied update must also be
        // replayed against the rebased base state next time.
        if new_base_state.is_some() {
            new_base_queue.push(update.rebased());
        }
        state = match &update.eager {
            Some((eager_reducer, eager_state)) if Arc::ptr_eq(eager_reducer, reducer) => {
                eager_state.clone()
            }
            _ => reducer(&state, &update.action).map_err(RenderError::from)?,
        };
    }

    let base_state = match new_base_state {
        Some(pinned) => pinned,
        None => {
            debug_assert!(new_base_queue.is_empty());
            state.clone()
        }
    };

    Ok(ProcessOutcome {
        state,
        base_state,
        base_queue: new_base_queue,
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::values_equal;

    fn add_reducer() -> Reducer {
        Arc::new(|state, action| {
            let s = downcast::<i64>(state).unwrap();
            let a = downcast::<i64>(action).unwrap();
            Ok(value(*s + *a))
        })
    }

    fn updates(lane_actions: &[(Lanes, i64)]) -> Vec<Update> {
        lane_actions
            .iter()
            .map(|(lane, a)| Update::new(*lane, value(*a)))
            .collect()
    }

    fn as_i64(v: &StateValue) -> i64 {
        *downcast::<i64>(v).unwrap()
    }

    #[test]
    fn test_left_fold_in_enqueue_order() {
        let reducer = add_reducer();
        let out = process_update_queue(
            value(0i64),
            Vec::new(),
            updates(&[(Lanes::DEFAULT, 1), (Lanes::DEFAULT, 2), (Lanes::DEFAULT, 4)]),
            &reducer,
            Lanes::DEFAULT,
        )
        .unwrap();
        assert_eq!(as_i64(&out.state), 7);
        assert_eq!(as_i64(&out.base_state), 7);
        assert!(out.base_queue.is_empty());
        assert!(out.skipped.is_none());
    }

    #[test]
    fn test_skip_pins_base_state() {
        let reducer = add_reducer();
        let out = process_update_queue(
            value(0i64),
            Vec::new(),
            updates(&[
                (Lanes::DEFAULT, 1),
                (Lanes::TRANSITION, 10),
                (Lanes::DEFAULT, 2),
            ]),
            &reducer,
            Lanes::DEFAULT,
        )
        .unwrap();
        // The transition update is skipped; the default ones apply.
        assert_eq!(as_i64(&out.state), 3);
        // Base state is the value just before the first skipped update.
        assert_eq!(as_i64(&out.base_state), 1);
        // The skipped update plus a lane-cleared clone of the later one.
        assert_eq!(out.base_queue.len(), 2);
        assert_eq!(out.base_queue[0].lane, Lanes::TRANSITION);
        assert_eq!(out.base_queue[1].lane, Lanes::NONE);
        assert_eq!(out.skipped, Lanes::TRANSITION);
    }

    #[test]
    fn test_rebase_converges_to_full_fold() {
        let reducer = add_reducer();
        // First attempt renders only DEFAULT.
        let first = process_update_queue(
            value(0i64),
            Vec::new(),
            updates(&[
                (Lanes::DEFAULT, 1),
                (Lanes::TRANSITION, 10),
                (Lanes::DEFAULT, 2),
            ]),
            &reducer,
            Lanes::DEFAULT,
        )
        .unwrap();
        // Second attempt includes the skipped lane and replays from the base.
        let second = process_update_queue(
            first.base_state,
            first.base_queue,
            Vec::new(),
            &reducer,
            Lanes::DEFAULT | Lanes::TRANSITION,
        )
        .unwrap();
        assert_eq!(as_i64(&second.state), 13);
        assert_eq!(as_i64(&second.base_state), 13);
        assert!(second.base_queue.is_empty());
    }

    #[test]
    fn test_eager_state_reused_only_for_same_reducer() {
        let reducer = add_reducer();
        let other = add_reducer();
        let mut update = Update::new(Lanes::DEFAULT, value(1i64));
        // A bogus cached result proves which path ran.
        update.eager = Some((reducer.clone(), value(100i64)));

        let out = process_update_queue(
            value(0i64),
            Vec::new(),
            vec![update.clone()],
            &reducer,
            Lanes::DEFAULT,
        )
        .unwrap();
        assert_eq!(as_i64(&out.state), 100);

        let out = process_update_queue(
            value(0i64),
            Vec::new(),
            vec![update],
            &other,
            Lanes::DEFAULT,
        )
        .unwrap();
        assert_eq!(as_i64(&out.state), 1);
    }

    #[test]
    fn test_reducer_error_propagates_as_user_error() {
        let reducer: Reducer = Arc::new(|_, _| Err(anyhow::anyhow!("boom")));
        let err = process_update_queue(
            value(0i64),
            Vec::new(),
            updates(&[(Lanes::DEFAULT, 1)]),
            &reducer,
            Lanes::DEFAULT,
        )
        .err()
        .unwrap();
        assert!(matches!(err, RenderError::User(_)));
    }

    #[test]
    fn test_basic_state_reducer_applies_updaters() {
        let reducer = basic_state_reducer();
        let replaced = reducer(&value(1i64), &value(5i64)).unwrap();
        assert_eq!(as_i64(&replaced), 5);
        let bumped = reducer(&value(1i64), &updater(|n: &i64| n + 1)).unwrap();
        assert_eq!(as_i64(&bumped), 2);
    }

    #[test]
    fn test_snapshot_reducer_reraises_stored_errors() {
        let reducer = snapshot_reducer();
        let ok = reducer(&value(0i64), &value(7i64)).unwrap();
        assert!(values_equal(&ok, &value(7i64)));
        let stored = value(StoredError(Arc::new(anyhow::anyhow!("torn wire"))));
        assert!(reducer(&value(0i64), &stored).is_err());
    }
}
