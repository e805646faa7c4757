//! Effect registration, dependency bail-out, flush ordering, and the
//! memo/callback/ref/context/identifier primitives.

use std::sync::Arc;

use parking_lot::Mutex;
use weft_hooks::{
    downcast, value, ComponentFn, EffectCleanup, EffectCreate, EffectTag, HookEngine, Lanes,
    RecordingScheduler, StateValue,
};

type Log = Arc<Mutex<Vec<String>>>;

fn logging_effect(log: Log, name: &'static str) -> EffectCreate {
    Arc::new(move || {
        log.lock().push(format!("create {name}"));
        let log = log.clone();
        let cleanup: EffectCleanup = Arc::new(move || {
            log.lock().push(format!("destroy {name}"));
        });
        Some(cleanup)
    })
}

#[test]
fn test_effect_lifecycle_and_deps_bailout() {
    let mut engine = HookEngine::new();
    let mut sched = RecordingScheduler::default();
    let fiber = engine.create_fiber();
    let log: Log = Default::default();

    // Props drive the dependency; same props must not rerun the body.
    let effect_log = log.clone();
    let comp: ComponentFn = Arc::new(move |ctx, props| {
        ctx.use_effect(
            logging_effect(effect_log.clone(), "a"),
            Some(vec![props.clone()]),
        )?;
        Ok(value(()))
    });

    let props = value(1i64);
    engine
        .render_with_hooks(fiber, &comp, &props, Lanes::DEFAULT, &mut sched)
        .unwrap();
    let summary = engine.commit(fiber).unwrap();
    assert!(summary.flags.contains(EffectTag::PASSIVE));
    assert_eq!(engine.flush_effects(fiber, EffectTag::PASSIVE).unwrap(), 1);
    assert_eq!(*log.lock(), vec!["create a"]);

    // Unchanged deps: the record is carried over but the body is skipped.
    engine
        .render_with_hooks(fiber, &comp, &props, Lanes::DEFAULT, &mut sched)
        .unwrap();
    let summary = engine.commit(fiber).unwrap();
    assert!(summary.flags.is_empty());
    assert_eq!(engine.flush_effects(fiber, EffectTag::PASSIVE).unwrap(), 0);
    assert_eq!(*log.lock(), vec!["create a"]);

    // Changed deps: previous cleanup runs before the new body.
    engine
        .render_with_hooks(fiber, &comp, &value(2i64), Lanes::DEFAULT, &mut sched)
        .unwrap();
    engine.commit(fiber).unwrap();
    engine.flush_effects(fiber, EffectTag::PASSIVE).unwrap();
    assert_eq!(*log.lock(), vec!["create a", "destroy a", "create a"]);
}

#[test]
fn test_flush_runs_all_cleanups_before_any_body() {
    let mut engine = HookEngine::new();
    let mut sched = RecordingScheduler::default();
    let fiber = engine.create_fiber();
    let log: Log = Default::default();

    let (first, second) = (log.clone(), log.clone());
    let comp: ComponentFn = Arc::new(move |ctx, _props| {
        ctx.use_effect(logging_effect(first.clone(), "a"), None)?;
        ctx.use_effect(logging_effect(second.clone(), "b"), None)?;
        Ok(value(()))
    });

    engine
        .render_with_hooks(fiber, &comp, &value(()), Lanes::DEFAULT, &mut sched)
        .unwrap();
    engine.commit(fiber).unwrap();
    engine.flush_effects(fiber, EffectTag::PASSIVE).unwrap();
    assert_eq!(*log.lock(), vec!["create a", "create b"]);

    // No deps means always rerun; the flush tears both down first, in
    // registration order, then rebuilds both.
    engine
        .render_with_hooks(fiber, &comp, &value(()), Lanes::DEFAULT, &mut sched)
        .unwrap();
    engine.commit(fiber).unwrap();
    engine.flush_effects(fiber, EffectTag::PASSIVE).unwrap();
    assert_eq!(
        *log.lock(),
        vec![
            "create a",
            "create b",
            "destroy a",
            "destroy b",
            "create a",
            "create b",
        ]
    );
}

#[test]
fn test_layout_and_passive_flush_separately() {
    let mut engine = HookEngine::new();
    let mut sched = RecordingScheduler::default();
    let fiber = engine.create_fiber();
    let log: Log = Default::default();

    let (passive, layout) = (log.clone(), log.clone());
    let comp: ComponentFn = Arc::new(move |ctx, _props| {
        ctx.use_effect(logging_effect(passive.clone(), "passive"), None)?;
        ctx.use_layout_effect(logging_effect(layout.clone(), "layout"), None)?;
        Ok(value(()))
    });

    engine
        .render_with_hooks(fiber, &comp, &value(()), Lanes::DEFAULT, &mut sched)
        .unwrap();
    let summary = engine.commit(fiber).unwrap();
    assert!(summary.flags.contains(EffectTag::LAYOUT));
    assert!(summary.flags.contains(EffectTag::PASSIVE));

    engine.flush_effects(fiber, EffectTag::LAYOUT).unwrap();
    assert_eq!(*log.lock(), vec!["create layout"]);
    engine.flush_effects(fiber, EffectTag::PASSIVE).unwrap();
    assert_eq!(*log.lock(), vec!["create layout", "create passive"]);
}

#[test]
fn test_unmount_runs_committed_cleanups() {
    let mut engine = HookEngine::new();
    let mut sched = RecordingScheduler::default();
    let fiber = engine.create_fiber();
    let log: Log = Default::default();

    let effect_log = log.clone();
    let comp: ComponentFn = Arc::new(move |ctx, _props| {
        ctx.use_effect(logging_effect(effect_log.clone(), "a"), Some(vec![]))?;
        Ok(value(()))
    });

    engine
        .render_with_hooks(fiber, &comp, &value(()), Lanes::DEFAULT, &mut sched)
        .unwrap();
    engine.commit(fiber).unwrap();
    engine.flush_effects(fiber, EffectTag::PASSIVE).unwrap();

    engine.remove_fiber(fiber).unwrap();
    assert_eq!(*log.lock(), vec!["create a", "destroy a"]);
    assert!(engine.flush_effects(fiber, EffectTag::PASSIVE).is_err());
}

#[test]
fn test_memo_recomputes_only_on_dep_change() {
    let mut engine = HookEngine::new();
    let mut sched = RecordingScheduler::default();
    let fiber = engine.create_fiber();
    let computations = Arc::new(Mutex::new(0u32));

    let count = computations.clone();
    let comp: ComponentFn = Arc::new(move |ctx, props| {
        let count = count.clone();
        let doubled = ctx.use_memo(
            move || {
                *count.lock() += 1;
                let n = downcast::<i64>(props).unwrap();
                value(*n * 2)
            },
            Some(vec![props.clone()]),
        )?;
        Ok(doubled)
    });

    let props = value(3i64);
    let out = engine
        .render_with_hooks(fiber, &comp, &props, Lanes::DEFAULT, &mut sched)
        .unwrap();
    assert_eq!(*downcast::<i64>(&out).unwrap(), 6);
    engine.commit(fiber).unwrap();

    engine
        .render_with_hooks(fiber, &comp, &props, Lanes::DEFAULT, &mut sched)
        .unwrap();
    engine.commit(fiber).unwrap();
    assert_eq!(*computations.lock(), 1);

    let out = engine
        .render_with_hooks(fiber, &comp, &value(5i64), Lanes::DEFAULT, &mut sched)
        .unwrap();
    assert_eq!(*downcast::<i64>(&out).unwrap(), 10);
    assert_eq!(*computations.lock(), 2);
}

#[test]
fn test_callback_identity_is_stable_while_deps_hold() {
    let mut engine = HookEngine::new();
    let mut sched = RecordingScheduler::default();
    let fiber = engine.create_fiber();

    let comp: ComponentFn = Arc::new(|ctx, props| {
        let cb: StateValue = value("handler".to_string());
        ctx.use_callback(cb, Some(vec![props.clone()]))
    });

    let props = value(1i64);
    let first = engine
        .render_with_hooks(fiber, &comp, &props, Lanes::DEFAULT, &mut sched)
        .unwrap();
    engine.commit(fiber).unwrap();
    let second = engine
        .render_with_hooks(fiber, &comp, &props, Lanes::DEFAULT, &mut sched)
        .unwrap();
    engine.commit(fiber).unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let third = engine
        .render_with_hooks(fiber, &comp, &value(2i64), Lanes::DEFAULT, &mut sched)
        .unwrap();
    assert!(!Arc::ptr_eq(&first, &third));
}

#[test]
fn test_ref_cell_is_stable_and_silent() {
    let mut engine = HookEngine::new();
    let mut sched = RecordingScheduler::default();
    let fiber = engine.create_fiber();

    let comp: ComponentFn = Arc::new(|ctx, _props| {
        let r = ctx.use_ref(|| value(0i64))?;
        let seen = r.get();
        r.set(value(*downcast::<i64>(&seen).unwrap() + 1));
        Ok(seen)
    });

    engine
        .render_with_hooks(fiber, &comp, &value(()), Lanes::DEFAULT, &mut sched)
        .unwrap();
    engine.commit(fiber).unwrap();
    // Writes through the ref never scheduled anything.
    assert_eq!(sched.scheduled_count(), 0);

    let out = engine
        .render_with_hooks(fiber, &comp, &value(()), Lanes::DEFAULT, &mut sched)
        .unwrap();
    // The second render observes the first render's write.
    assert_eq!(*downcast::<i64>(&out).unwrap(), 1);
}

#[test]
fn test_opaque_identifiers_are_stable_and_unique() {
    let mut engine = HookEngine::new();
    let mut sched = RecordingScheduler::default();

    let comp: ComponentFn =
        Arc::new(|ctx, _props| Ok(value(ctx.use_opaque_identifier()?)));

    let a = engine.create_fiber();
    let b = engine.create_fiber();
    let id_a = engine
        .render_with_hooks(a, &comp, &value(()), Lanes::DEFAULT, &mut sched)
        .unwrap();
    engine.commit(a).unwrap();
    let id_b = engine
        .render_with_hooks(b, &comp, &value(()), Lanes::DEFAULT, &mut sched)
        .unwrap();
    engine.commit(b).unwrap();

    let id_a2 = engine
        .render_with_hooks(a, &comp, &value(()), Lanes::DEFAULT, &mut sched)
        .unwrap();
    assert_eq!(
        *downcast::<String>(&id_a).unwrap(),
        *downcast::<String>(&id_a2).unwrap()
    );
    assert_ne!(
        *downcast::<String>(&id_a).unwrap(),
        *downcast::<String>(&id_b).unwrap()
    );
}

#[test]
fn test_context_reads_without_a_hook_slot() {
    #[derive(Debug, PartialEq)]
    struct Theme(&'static str);

    let mut engine = HookEngine::new();
    let mut sched = RecordingScheduler::default();
    engine.provide_context(Theme("dark"));

    let fiber = engine.create_fiber();
    let comp: ComponentFn = Arc::new(|ctx, _props| {
        let theme = ctx
            .use_context::<Theme>()
            .ok_or_else(|| anyhow::anyhow!("theme not provided"))?;
        Ok(value(theme.0.to_string()))
    });

    let out = engine
        .render_with_hooks(fiber, &comp, &value(()), Lanes::DEFAULT, &mut sched)
        .unwrap();
    assert_eq!(*downcast::<String>(&out).unwrap(), "dark");
    // Context reads are legal outside renders too.
    assert_eq!(engine.read_context::<Theme>().unwrap().0, "dark");
}
