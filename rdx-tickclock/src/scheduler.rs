//! The drift-correcting beat scheduler.
//!
//! `TickScheduler` is a synchronous state machine. It never reads a clock or
//! sleeps: callers pass the current monotonic `now` into every operation and
//! get back an [`Arm`] describing when they should call [`TickScheduler::on_timer`]
//! next. The engine drives it with tokio timers; tests drive it with
//! synthetic instants.
//!
//! ## Drift correction
//!
//! A host timer only guarantees a minimum delay, so every firing is a little
//! late. On each firing the scheduler measures that lateness against the
//! absolute deadline, advances the deadline by exactly one interval, and
//! shortens the next wait by the lateness. The deadline grid never moves, so
//! lateness cannot compound and the long-run beat rate matches the tempo.
//!
//! When the host stalls past several beat boundaries, only one beat fires per
//! invocation and the deadline advances by one interval. The following
//! invocations are armed with a zero delay until the grid is reached again.

use crate::common::{Bpm, TimerHandle};
use crate::components::sink::{deliver, BeatSink};
use crate::error::TickError;
use crate::events::BeatEvent;
use crate::time::{arm_after, Arm, Generations};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// The outcome of one scheduling cycle.
#[derive(Debug)]
pub struct Cycle {
    /// The beat fired during this cycle, if one was due.
    pub beat: Option<BeatEvent>,
    /// Set when the sink failed on `beat`.
    pub sink_failure: Option<TickError>,
    /// The timer that is now pending.
    pub arm: Arm,
}

/// Owns the beat clock and the single outstanding timer.
pub struct TickScheduler<S> {
    sink: S,
    tempo: Bpm,
    interval: Duration,
    next_deadline: Option<Instant>,
    accumulated_drift: Duration,
    running: bool,
    pending: Option<Arm>,
    generations: Generations,
    beats_fired: u64,
    last_beat: Option<BeatEvent>,
}

impl<S: BeatSink> TickScheduler<S> {
    /// Creates a stopped scheduler. `bpm` becomes the tempo used by
    /// [`TickScheduler::resume`].
    pub fn new(bpm: f64, sink: S) -> Result<Self, TickError> {
        let tempo = Bpm::new(bpm)?;
        Ok(Self {
            sink,
            tempo,
            interval: tempo.interval(),
            next_deadline: None,
            accumulated_drift: Duration::ZERO,
            running: false,
            pending: None,
            generations: Generations::default(),
            beats_fired: 0,
            last_beat: None,
        })
    }

    /// Starts beating at `bpm`. The first beat fires during this call.
    ///
    /// Starting an already running scheduler never creates a second schedule:
    /// at the same tempo it is a no-op that returns the pending arm, at a
    /// different tempo it behaves like [`TickScheduler::set_tempo`].
    pub fn start(&mut self, bpm: f64, now: Instant) -> Result<Cycle, TickError> {
        let tempo = Bpm::new(bpm)?;
        if self.running {
            if tempo == self.tempo {
                debug!("Already running at {}; keeping the current schedule.", tempo);
                return Ok(Cycle {
                    beat: None,
                    sink_failure: None,
                    arm: self.armed()?,
                });
            }
            return self.retune(tempo, now);
        }
        self.apply_tempo(tempo);
        self.begin(now)
    }

    /// Starts beating at the stored tempo.
    pub fn resume(&mut self, now: Instant) -> Result<Cycle, TickError> {
        self.start(self.tempo.get(), now)
    }

    /// Changes the tempo.
    ///
    /// When stopped this only stores the tempo and returns `None`. When
    /// running, the pending timer is replaced and a fresh phase begins at
    /// `now`, so the next beat fires during this call.
    pub fn set_tempo(&mut self, bpm: f64, now: Instant) -> Result<Option<Cycle>, TickError> {
        let tempo = Bpm::new(bpm)?;
        if !self.running {
            self.apply_tempo(tempo);
            return Ok(None);
        }
        self.retune(tempo, now).map(Some)
    }

    /// Stops beating. Returns the handle of the cancelled timer, if any.
    pub fn stop(&mut self) -> Option<TimerHandle> {
        let cancelled = self.pending.take().map(|arm| arm.handle);
        if self.running {
            info!("Metronome stopped after {} beats.", self.beats_fired);
        }
        self.running = false;
        self.next_deadline = None;
        self.accumulated_drift = Duration::ZERO;
        cancelled
    }

    /// Handles a fired timer.
    ///
    /// Returns `None` when `handle` is not the pending timer, i.e. it was
    /// superseded by `start`, `set_tempo` or `stop` while in flight.
    pub fn on_timer(&mut self, handle: TimerHandle, now: Instant) -> Result<Option<Cycle>, TickError> {
        match self.pending {
            Some(arm) if self.running && arm.handle == handle => self.rearm(now).map(Some),
            _ => {
                debug!("Discarding stale timer generation {}.", handle.generation());
                Ok(None)
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn tempo(&self) -> Bpm {
        self.tempo
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// When the next beat is due. `None` while stopped.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.next_deadline
    }

    /// Drift still waiting to be folded into a delay. Zero between cycles.
    pub fn accumulated_drift(&self) -> Duration {
        self.accumulated_drift
    }

    /// The single outstanding timer. `Some` exactly when running.
    pub fn pending(&self) -> Option<Arm> {
        self.pending
    }

    pub fn beats_fired(&self) -> u64 {
        self.beats_fired
    }

    /// The most recently fired beat. Kept across `stop`.
    ///
    /// When a cycle ends in a timer failure after its beat already reached
    /// the sink, this is the only place that beat is still available.
    pub fn last_beat(&self) -> Option<BeatEvent> {
        self.last_beat
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }
}

// Core implementation block for the scheduling cycle.
impl<S: BeatSink> TickScheduler<S> {
    #[doc(hidden)]
    fn apply_tempo(&mut self, tempo: Bpm) {
        self.tempo = tempo;
        self.interval = tempo.interval();
    }

    #[doc(hidden)]
    fn begin(&mut self, now: Instant) -> Result<Cycle, TickError> {
        self.next_deadline = Some(now);
        self.accumulated_drift = Duration::ZERO;
        self.running = true;
        info!("Metronome started at {} ({:?} per beat).", self.tempo, self.interval);
        self.rearm(now)
    }

    #[doc(hidden)]
    fn retune(&mut self, tempo: Bpm, now: Instant) -> Result<Cycle, TickError> {
        if let Some(arm) = self.pending.take() {
            debug!("Cancelled timer generation {} for tempo change.", arm.handle.generation());
        }
        info!("Tempo changed from {} to {}.", self.tempo, tempo);
        self.apply_tempo(tempo);
        self.next_deadline = Some(now);
        self.accumulated_drift = Duration::ZERO;
        self.rearm(now)
    }

    #[doc(hidden)]
    fn armed(&self) -> Result<Arm, TickError> {
        self.pending
            .ok_or_else(|| TickError::TimerFailure("running without a pending timer".to_string()))
    }

    /// One scheduling cycle: fire if due, then arm the next timer.
    #[doc(hidden)]
    fn rearm(&mut self, now: Instant) -> Result<Cycle, TickError> {
        let deadline = *self.next_deadline.get_or_insert(now);
        let mut beat = None;
        let mut sink_failure = None;

        if now >= deadline {
            let drift = now - deadline;
            let event = BeatEvent {
                index: self.beats_fired,
                deadline,
                fired_at: now,
                drift,
                tempo: self.tempo,
            };
            self.beats_fired += 1;
            trace!("Beat #{} fired {:?} late.", event.index, drift);
            sink_failure = self.notify_sink(&event);
            self.last_beat = Some(event);
            beat = Some(event);

            self.accumulated_drift += drift;
            let Some(next) = deadline.checked_add(self.interval) else {
                let reason = format!(
                    "deadline {:?} after {:?} overflows the monotonic clock",
                    self.interval, deadline
                );
                return Err(self.fail_timer(reason));
            };
            self.next_deadline = Some(next);
        }

        let corrected = self.interval.saturating_sub(self.accumulated_drift);
        let until = self
            .next_deadline
            .map_or(Duration::ZERO, |next| next.saturating_duration_since(now));
        let delay = until.min(corrected);

        let arm = match arm_after(&mut self.generations, now, delay) {
            Ok(arm) => arm,
            Err(reason) => return Err(self.fail_timer(reason)),
        };
        self.pending = Some(arm);
        self.accumulated_drift = Duration::ZERO;
        debug!(
            "Armed timer generation {} in {:?}.",
            arm.handle.generation(),
            delay
        );

        Ok(Cycle {
            beat,
            sink_failure,
            arm,
        })
    }

    #[doc(hidden)]
    fn notify_sink(&mut self, event: &BeatEvent) -> Option<TickError> {
        let reason = match deliver(&mut self.sink, event) {
            Ok(()) => return None,
            Err(e) => format!("{:#}", e),
        };
        warn!("Beat sink failed on beat #{}: {}", event.index, reason);
        Some(TickError::SinkFailure {
            beat: event.index,
            reason,
        })
    }

    #[doc(hidden)]
    fn fail_timer(&mut self, reason: String) -> TickError {
        error!("Timer failure, stopping metronome: {}", reason);
        self.stop();
        TickError::TimerFailure(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::sink::{from_fn, FnSink, SinkSet};
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    type Recorded = Arc<Mutex<Vec<BeatEvent>>>;

    fn recorder() -> (FnSink<impl FnMut(&BeatEvent) -> anyhow::Result<()> + Send>, Recorded) {
        let beats: Recorded = Arc::default();
        let sink_beats = beats.clone();
        let sink = from_fn(move |beat: &BeatEvent| {
            sink_beats.lock().unwrap().push(*beat);
            Ok(())
        });
        (sink, beats)
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    /// Fires the pending timer `late` after it was due.
    fn fire<S: BeatSink>(sched: &mut TickScheduler<S>, late: Duration) -> Cycle {
        let arm = sched.pending().expect("scheduler should be armed");
        sched
            .on_timer(arm.handle, arm.at + late)
            .unwrap()
            .expect("pending timer should not be stale")
    }

    #[test]
    fn test_created_stopped() {
        let (sink, beats) = recorder();
        let sched = TickScheduler::new(60.0, sink).unwrap();
        assert!(!sched.is_running());
        assert!(sched.pending().is_none());
        assert!(sched.next_deadline().is_none());
        assert!(beats.lock().unwrap().is_empty());
    }

    #[test]
    fn test_start_fires_immediately() {
        let (sink, beats) = recorder();
        let mut sched = TickScheduler::new(60.0, sink).unwrap();
        let t0 = Instant::now();
        let cycle = sched.start(60.0, t0).unwrap();

        let beat = cycle.beat.expect("first beat fires on start");
        assert_eq!(beat.index, 0);
        assert_eq!(beat.fired_at, t0);
        assert_eq!(beat.drift, Duration::ZERO);
        assert_eq!(cycle.arm.at, t0 + ms(1000));
        assert_eq!(sched.pending(), Some(cycle.arm));
        assert_eq!(beats.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_deadlines_at_60_bpm_without_jitter() {
        let (sink, beats) = recorder();
        let mut sched = TickScheduler::new(60.0, sink).unwrap();
        let t0 = Instant::now();
        sched.start(60.0, t0).unwrap();
        for _ in 0..3 {
            fire(&mut sched, Duration::ZERO);
        }

        let deadlines: Vec<Duration> = beats
            .lock()
            .unwrap()
            .iter()
            .map(|beat| beat.deadline - t0)
            .collect();
        assert_eq!(deadlines, vec![ms(0), ms(1000), ms(2000), ms(3000)]);
    }

    #[test]
    fn test_recovers_from_single_late_firing_within_one_cycle() {
        let (sink, beats) = recorder();
        let mut sched = TickScheduler::new(60.0, sink).unwrap();
        let t0 = Instant::now();
        sched.start(60.0, t0).unwrap();

        // The second callback arrives after 1500 ms instead of 1000 ms.
        let late = fire(&mut sched, ms(500));
        assert_eq!(late.beat.unwrap().drift, ms(500));
        assert_eq!(late.arm.delay, ms(500));
        assert_eq!(late.arm.at, t0 + ms(2000));

        fire(&mut sched, Duration::ZERO);
        fire(&mut sched, Duration::ZERO);

        let fired: Vec<Duration> = beats
            .lock()
            .unwrap()
            .iter()
            .map(|beat| beat.fired_at - t0)
            .collect();
        assert_eq!(fired, vec![ms(0), ms(1500), ms(2000), ms(3000)]);
    }

    #[test]
    fn test_average_interval_converges_under_jitter() {
        let (sink, beats) = recorder();
        let mut sched = TickScheduler::new(120.0, sink).unwrap();
        let t0 = Instant::now();
        sched.start(120.0, t0).unwrap();

        let max_jitter = ms(22);
        for i in 0..2_000u64 {
            fire(&mut sched, ms((i * 37) % 23));
        }

        let beats = beats.lock().unwrap();
        assert_eq!(beats.len(), 2_001);
        let interval = ms(500);
        for (n, beat) in beats.iter().enumerate() {
            assert_eq!(beat.deadline, t0 + interval * n as u32, "grid moved at beat {}", n);
            assert!(beat.drift <= max_jitter, "drift compounded at beat {}: {:?}", n, beat.drift);
        }

        for window in [10usize, 100, 1_000, 2_000] {
            let span = beats[window].fired_at - beats[0].fired_at;
            let average_ms = span.as_secs_f64() * 1000.0 / window as f64;
            let tolerance = max_jitter.as_secs_f64() * 1000.0 / window as f64;
            assert!(
                (average_ms - 500.0).abs() <= tolerance,
                "average over {} beats was {} ms",
                window,
                average_ms
            );
        }
    }

    #[test]
    fn test_drift_is_cleared_after_every_cycle() {
        let (sink, _beats) = recorder();
        let mut sched = TickScheduler::new(90.0, sink).unwrap();
        sched.start(90.0, Instant::now()).unwrap();
        assert_eq!(sched.accumulated_drift(), Duration::ZERO);
        for late in [0, 5, 120, 3, 400] {
            let cycle = fire(&mut sched, ms(late));
            assert_eq!(cycle.beat.unwrap().drift, ms(late));
            assert_eq!(sched.accumulated_drift(), Duration::ZERO);
        }
    }

    #[test]
    fn test_early_timer_rearms_for_deadline_without_firing() {
        let (sink, beats) = recorder();
        let mut sched = TickScheduler::new(60.0, sink).unwrap();
        let t0 = Instant::now();
        let cycle = sched.start(60.0, t0).unwrap();

        let early = sched
            .on_timer(cycle.arm.handle, t0 + ms(400))
            .unwrap()
            .unwrap();
        assert!(early.beat.is_none());
        assert_eq!(early.arm.at, t0 + ms(1000));
        assert_eq!(beats.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_long_stall_fires_once_and_advances_one_interval() {
        let (sink, beats) = recorder();
        let mut sched = TickScheduler::new(60.0, sink).unwrap();
        let t0 = Instant::now();
        let cycle = sched.start(60.0, t0).unwrap();

        let stalled = sched
            .on_timer(cycle.arm.handle, t0 + ms(3500))
            .unwrap()
            .unwrap();
        assert_eq!(stalled.beat.unwrap().deadline, t0 + ms(1000));
        assert_eq!(sched.next_deadline(), Some(t0 + ms(2000)));
        assert_eq!(stalled.arm.delay, Duration::ZERO);
        assert_eq!(beats.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_double_start_keeps_one_schedule() {
        let (sink, beats) = recorder();
        let mut sched = TickScheduler::new(60.0, sink).unwrap();
        let t0 = Instant::now();
        let first = sched.start(60.0, t0).unwrap();
        let second = sched.start(60.0, t0 + ms(10)).unwrap();

        assert!(second.beat.is_none());
        assert_eq!(second.arm, first.arm);
        assert_eq!(sched.pending(), Some(first.arm));
        assert_eq!(beats.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_start_at_new_tempo_while_running_replaces_schedule() {
        let (sink, _beats) = recorder();
        let mut sched = TickScheduler::new(60.0, sink).unwrap();
        let t0 = Instant::now();
        let first = sched.start(60.0, t0).unwrap();
        let second = sched.start(90.0, t0 + ms(100)).unwrap();

        assert!(second.beat.is_some());
        assert_ne!(second.arm.handle, first.arm.handle);
        assert_eq!(sched.tempo().get(), 90.0);
        assert!(sched.on_timer(first.arm.handle, first.arm.at).unwrap().is_none());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (sink, _beats) = recorder();
        let mut sched = TickScheduler::new(60.0, sink).unwrap();
        let cycle = sched.start(60.0, Instant::now()).unwrap();

        assert_eq!(sched.stop(), Some(cycle.arm.handle));
        assert!(!sched.is_running());
        assert_eq!(sched.stop(), None);
        assert!(!sched.is_running());
        assert!(sched.pending().is_none());
        assert!(sched.next_deadline().is_none());
        assert_eq!(sched.beats_fired(), 1);
    }

    #[test]
    fn test_timer_after_stop_is_discarded() {
        let (sink, beats) = recorder();
        let mut sched = TickScheduler::new(60.0, sink).unwrap();
        let cycle = sched.start(60.0, Instant::now()).unwrap();
        sched.stop();

        assert!(sched.on_timer(cycle.arm.handle, cycle.arm.at).unwrap().is_none());
        assert!(!sched.is_running());
        assert_eq!(beats.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_restart_after_stop_begins_new_phase() {
        let (sink, _beats) = recorder();
        let mut sched = TickScheduler::new(60.0, sink).unwrap();
        let t0 = Instant::now();
        sched.start(60.0, t0).unwrap();
        fire(&mut sched, Duration::ZERO);
        sched.stop();

        let restart = t0 + ms(1700);
        let cycle = sched.resume(restart).unwrap();
        assert_eq!(cycle.beat.unwrap().deadline, restart);
        assert_eq!(sched.next_deadline(), Some(restart + ms(1000)));
    }

    #[test]
    fn test_set_tempo_while_running_fires_immediately() {
        let (sink, _beats) = recorder();
        let mut sched = TickScheduler::new(60.0, sink).unwrap();
        let t0 = Instant::now();
        let first = sched.start(60.0, t0).unwrap();

        let change_at = t0 + ms(300);
        let cycle = sched.set_tempo(120.0, change_at).unwrap().unwrap();
        let beat = cycle.beat.expect("tempo change fires at once");
        assert_eq!(beat.fired_at, change_at);
        assert_eq!(beat.tempo.get(), 120.0);
        assert_eq!(cycle.arm.at, change_at + ms(500));
        assert_eq!(sched.interval(), ms(500));

        // The timer armed at the old tempo is now stale.
        assert!(sched.on_timer(first.arm.handle, first.arm.at).unwrap().is_none());
    }

    #[test]
    fn test_set_tempo_while_stopped_only_stores_tempo() {
        let (sink, beats) = recorder();
        let mut sched = TickScheduler::new(60.0, sink).unwrap();
        assert!(sched.set_tempo(90.0, Instant::now()).unwrap().is_none());
        assert!(!sched.is_running());
        assert_eq!(sched.tempo().get(), 90.0);
        assert!(beats.lock().unwrap().is_empty());

        let t0 = Instant::now();
        let cycle = sched.resume(t0).unwrap();
        assert_eq!(cycle.arm.at, t0 + Duration::from_secs_f64(60.0 / 90.0));
    }

    #[test]
    fn test_invalid_tempo_leaves_state_unchanged() {
        let (sink, _beats) = recorder();
        let mut sched = TickScheduler::new(60.0, sink).unwrap();
        let cycle = sched.start(60.0, Instant::now()).unwrap();

        for bad in [0.0, -5.0, f64::NAN] {
            let err = sched.set_tempo(bad, Instant::now()).unwrap_err();
            assert!(matches!(err, TickError::InvalidTempo(_)));
            assert_eq!(sched.tempo().get(), 60.0);
            assert!(sched.is_running());
            assert_eq!(sched.pending(), Some(cycle.arm));
        }

        assert!(matches!(
            sched.start(f64::INFINITY, Instant::now()),
            Err(TickError::InvalidTempo(_))
        ));
        assert_eq!(sched.pending(), Some(cycle.arm));
        assert!(TickScheduler::new(0.0, from_fn(|_| Ok(()))).is_err());
    }

    #[test]
    fn test_sink_error_does_not_disturb_timing() {
        let sink = from_fn(|beat: &BeatEvent| {
            if beat.index == 1 {
                Err(anyhow!("sound not loaded"))
            } else {
                Ok(())
            }
        });
        let mut sched = TickScheduler::new(60.0, sink).unwrap();
        let t0 = Instant::now();
        sched.start(60.0, t0).unwrap();

        let cycle = fire(&mut sched, Duration::ZERO);
        match cycle.sink_failure {
            Some(TickError::SinkFailure { beat, reason }) => {
                assert_eq!(beat, 1);
                assert!(reason.contains("sound not loaded"));
            }
            other => panic!("expected a sink failure, got {:?}", other),
        }
        assert_eq!(cycle.arm.at, t0 + ms(2000));
        assert!(sched.is_running());

        let next = fire(&mut sched, Duration::ZERO);
        assert!(next.sink_failure.is_none());
    }

    #[test]
    fn test_sink_panic_is_contained() {
        let sink = from_fn(|_: &BeatEvent| -> anyhow::Result<()> { panic!("audio device vanished") });
        let mut sched = TickScheduler::new(60.0, sink).unwrap();
        let t0 = Instant::now();
        let cycle = sched.start(60.0, t0).unwrap();

        match cycle.sink_failure {
            Some(TickError::SinkFailure { reason, .. }) => {
                assert!(reason.contains("audio device vanished"), "{}", reason)
            }
            other => panic!("expected a sink failure, got {:?}", other),
        }
        assert!(sched.is_running());
        assert_eq!(cycle.arm.at, t0 + ms(1000));
    }

    #[test]
    fn test_unarmable_deadline_stops_scheduler() {
        // An interval of 1e19 seconds cannot be added to any monotonic instant.
        let bpm = 60.0 / 1e19;
        let (sink, beats) = recorder();
        let mut sched = TickScheduler::new(bpm, sink).unwrap();

        let t0 = Instant::now();
        let err = sched.start(bpm, t0).unwrap_err();
        assert!(matches!(err, TickError::TimerFailure(_)));
        assert!(!sched.is_running());
        assert!(sched.pending().is_none());
        assert_eq!(beats.lock().unwrap().len(), 1);

        // The beat the sink saw before the failure is still reachable.
        let last = sched.last_beat().expect("the first beat fired before the failure");
        assert_eq!(last.index, 0);
        assert_eq!(last.fired_at, t0);
        assert_eq!(sched.beats_fired(), 1);
    }

    #[test]
    fn test_panicking_sink_does_not_starve_the_rest_of_a_sink_set() {
        let counter = Arc::new(AtomicU32::new(0));
        let healthy = counter.clone();
        let mut set = SinkSet::new();
        set.insert(from_fn(|_| -> anyhow::Result<()> { panic!("device gone") }));
        set.insert(from_fn(move |_| {
            healthy.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }));
        let mut sched = TickScheduler::new(60.0, set).unwrap();

        let first = sched.start(60.0, Instant::now()).unwrap();
        let second = fire(&mut sched, Duration::ZERO);
        for cycle in [first, second] {
            match cycle.sink_failure {
                Some(TickError::SinkFailure { reason, .. }) => {
                    assert!(reason.contains("device gone"), "{}", reason)
                }
                other => panic!("expected a sink failure, got {:?}", other),
            }
        }
        assert_eq!(counter.load(Ordering::Relaxed), 2);
        assert!(sched.is_running());
    }
}
