use bitflags::bitflags;

bitflags! {
    /// Lanes is an opaque priority/identity bitmask tagging an update or a
    /// render attempt.
    ///
    /// The engine never interprets individual bits beyond subset checks; the
    /// named constants exist so the scheduling collaborator and the engine
    /// agree on which bit a given class of work travels on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Lanes: u32 {
        /// Synchronous, must-flush-now work (discrete input).
        const SYNC = 1 << 0;
        /// Continuous input (drag, scroll).
        const INPUT = 1 << 1;
        /// Default priority for updates scheduled outside any event.
        const DEFAULT = 1 << 2;
        /// Updates enqueued inside a transition.
        const TRANSITION = 1 << 3;
        /// Updates scheduled because a mutable external source changed.
        const MUTABLE_READ = 1 << 4;
        /// Deferred-value follow-up updates.
        const DEFERRED = 1 << 5;
        /// Lowest priority, may be starved indefinitely.
        const IDLE = 1 << 6;
    }
}

impl Lanes {
    /// No pending work.
    pub const NONE: Lanes = Lanes::empty();

    /// Every lane; renders at `ALL` never skip an update.
    pub const ALL: Lanes = Lanes::all();

    /// Returns true if every lane in `self` is also present in `set`.
    ///
    /// `Lanes::NONE` is a subset of everything, which is what makes
    /// lane-cleared rebased updates apply unconditionally.
    pub fn is_subset_of(self, set: Lanes) -> bool {
        set.contains(self)
    }

    /// Union of two lane sets.
    #[must_use]
    pub fn merge(self, other: Lanes) -> Lanes {
        self | other
    }

    /// Returns true if no lane is set.
    pub fn is_none(self) -> bool {
        self.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subset_algebra() {
        let render = Lanes::SYNC | Lanes::DEFAULT;
        assert!(Lanes::SYNC.is_subset_of(render));
        assert!(Lanes::NONE.is_subset_of(render));
        assert!(!Lanes::TRANSITION.is_subset_of(render));
        assert!(!(Lanes::SYNC | Lanes::TRANSITION).is_subset_of(render));
    }

    #[test]
    fn test_merge_and_difference() {
        let lanes = Lanes::DEFAULT.merge(Lanes::TRANSITION);
        assert!(lanes.contains(Lanes::TRANSITION));
        let lanes = lanes.difference(Lanes::TRANSITION);
        assert_eq!(lanes, Lanes::DEFAULT);
        assert!(lanes.difference(Lanes::DEFAULT).is_none());
    }
}
