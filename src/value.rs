//! Type-erased state cells and the identity comparison used for bail-outs.

use std::any::Any;
use std::sync::Arc;

/// A type-erased, shared state value.
///
/// Every hook cell, action payload, and dependency entry is one of these.
/// Cloning is an `Arc` bump; the engine never deep-copies user state.
pub type StateValue = Arc<dyn Any + Send + Sync>;

/// Wrap a concrete value into a [`StateValue`].
pub fn value<T: Send + Sync + 'static>(v: T) -> StateValue {
    Arc::new(v)
}

/// Downcast a [`StateValue`] back to a concrete type.
///
/// Returns `None` if the cell holds a different type.
pub fn downcast<T: Send + Sync + 'static>(v: &StateValue) -> Option<Arc<T>> {
    v.clone().downcast::<T>().ok()
}

macro_rules! numeric_eq {
    ($a:expr, $b:expr, $($ty:ty),+) => {
        $(
            if let (Some(x), Some(y)) = (downcast::<$ty>($a), downcast::<$ty>($b)) {
                return *x == *y;
            }
        )+
    };
}

/// Identity comparison for bail-out decisions.
///
/// Two values are equal when they are the same allocation, or when both are
/// the same primitive type with equal contents. Floats compare NaN equal to
/// NaN, so a cell stuck at NaN still bails out instead of re-rendering
/// forever. This is never a deep structural comparison: two distinct
/// allocations of the same struct are different values.
pub fn values_equal(a: &StateValue, b: &StateValue) -> bool {
    if Arc::ptr_eq(a, b) {
        return true;
    }
    if let (Some(x), Some(y)) = (downcast::<f64>(a), downcast::<f64>(b)) {
        return *x == *y || (x.is_nan() && y.is_nan());
    }
    if let (Some(x), Some(y)) = (downcast::<f32>(a), downcast::<f32>(b)) {
        return *x == *y || (x.is_nan() && y.is_nan());
    }
    numeric_eq!(a, b, i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, bool, char);
    if let (Some(x), Some(y)) = (downcast::<String>(a), downcast::<String>(b)) {
        return *x == *y;
    }
    if let (Some(x), Some(y)) = (downcast::<&'static str>(a), downcast::<&'static str>(b)) {
        return *x == *y;
    }
    false
}

/// A dependency list attached to an effect, memo, or callback hook.
pub type Deps = Vec<StateValue>;

/// Shallow per-element comparison of two dependency lists.
///
/// A missing list on either side means "always rerun". Elements are compared
/// with [`values_equal`] up to the shorter length; a silent length change is
/// the caller's bug, not something this engine papers over.
pub fn deps_equal(prev: Option<&Deps>, next: Option<&Deps>) -> bool {
    match (prev, next) {
        (Some(prev), Some(next)) => prev
            .iter()
            .zip(next.iter())
            .all(|(a, b)| values_equal(a, b)),
        _ => false,
    }
}
