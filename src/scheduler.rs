//! The external scheduling collaborator.
//!
//! The engine never decides *when* work runs; it reports scheduling requests
//! and lane bookkeeping to an implementation of [`Scheduler`] and lets the
//! host runtime pick attempt timing and priorities. Notification methods
//! default to no-ops so implementations only override what they care about.

use crate::hook::FiberId;
use crate::lanes::Lanes;

/// The scheduling interface the engine calls out through.
pub trait Scheduler {
    /// Pick the lane a freshly dispatched update should travel on.
    fn request_update_lane(&self) -> Lanes {
        Lanes::DEFAULT
    }

    /// Timestamp attached to a scheduling request.
    fn request_event_time(&self) -> u64 {
        0
    }

    /// A fiber has a new pending update on `lane` and needs a render.
    ///
    /// This is the only required method.
    fn schedule_update(&mut self, fiber: FiberId, lane: Lanes, time: u64);

    /// Updates on `lanes` were skipped this attempt and remain pending.
    fn mark_skipped_lanes(&mut self, _lanes: Lanes) {}

    /// `lanes` must commit together from now on.
    fn mark_root_entangled(&mut self, _lanes: Lanes) {}

    /// A mutable-source read happened on a render at `lanes`.
    fn mark_root_mutable_read(&mut self, _lanes: Lanes) {}
}

/// Discards every scheduling request.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopScheduler;

impl Scheduler for NoopScheduler {
    fn schedule_update(&mut self, _fiber: FiberId, _lane: Lanes, _time: u64) {}
}

/// One recorded call out of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// `schedule_update` was called.
    Update {
        /// The fiber needing a render.
        fiber: FiberId,
        /// The lane the update travels on.
        lane: Lanes,
        /// The event time attached to the request.
        time: u64,
    },
    /// `mark_skipped_lanes` was called.
    Skipped(Lanes),
    /// `mark_root_entangled` was called.
    Entangled(Lanes),
    /// `mark_root_mutable_read` was called.
    MutableRead(Lanes),
}

/// Records every request for assertions in tests.
#[derive(Debug, Default)]
pub struct RecordingScheduler {
    /// Every call out of the engine, in order.
    pub events: Vec<SchedulerEvent>,
    /// The lane handed to new dispatches.
    pub update_lane: Lanes,
    /// The timestamp handed to scheduling requests.
    pub now: u64,
}

impl RecordingScheduler {
    /// A recorder dispatching on `lane`.
    pub fn with_lane(lane: Lanes) -> Self {
        Self {
            update_lane: lane,
            ..Default::default()
        }
    }

    /// Number of `schedule_update` calls recorded.
    pub fn scheduled_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, SchedulerEvent::Update { .. }))
            .count()
    }
}

impl Scheduler for RecordingScheduler {
    fn request_update_lane(&self) -> Lanes {
        if self.update_lane.is_none() {
            Lanes::DEFAULT
        } else {
            self.update_lane
        }
    }

    fn request_event_time(&self) -> u64 {
        self.now
    }

    fn schedule_update(&mut self, fiber: FiberId, lane: Lanes, time: u64) {
        self.events.push(SchedulerEvent::Update { fiber, lane, time });
    }

    fn mark_skipped_lanes(&mut self, lanes: Lanes) {
        self.events.push(SchedulerEvent::Skipped(lanes));
    }

    fn mark_root_entangled(&mut self, lanes: Lanes) {
        self.events.push(SchedulerEvent::Entangled(lanes));
    }

    fn mark_root_mutable_read(&mut self, lanes: Lanes) {
        self.events.push(SchedulerEvent::MutableRead(lanes));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_scheduler_keeps_order() {
        let mut s = RecordingScheduler::with_lane(Lanes::SYNC);
        s.schedule_update(FiberId(0), Lanes::SYNC, 1);
        s.mark_skipped_lanes(Lanes::TRANSITION);
        assert_eq!(
            s.events,
            vec![
                SchedulerEvent::Update {
                    fiber: FiberId(0),
                    lane: Lanes::SYNC,
                    time: 1
                },
                SchedulerEvent::Skipped(Lanes::TRANSITION),
            ]
        );
        assert_eq!(s.scheduled_count(), 1);
    }
}
