//! Defines all public event types broadcast by the Tickclock engine.
//!
//! Beats go out on their own stream so that a renderer can subscribe to them
//! without also receiving lifecycle noise. Everything else is a `SystemEvent`.

use crate::common::{Bpm, SinkId};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

/// One fired beat.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeatEvent {
    /// Zero-based count of beats fired since the scheduler was created.
    pub index: u64,
    /// When the beat was due.
    pub deadline: Instant,
    /// When the beat actually fired.
    pub fired_at: Instant,
    /// How late the firing was, `fired_at - deadline`.
    pub drift: Duration,
    /// The tempo the beat was fired at.
    pub tempo: Bpm,
}

/// Events related to the lifecycle and state of the metronome itself.
#[derive(Debug, Clone)]
pub enum SystemEvent {
    /// Fired once when the engine's driver task begins.
    EngineStarted { timestamp: Instant },
    /// Fired when beats start flowing after a `start`.
    MetronomeStarted { tempo: Bpm, wall_time: DateTime<Utc> },
    /// Fired when the tempo of a running metronome changes.
    TempoChanged { from: Bpm, to: Bpm },
    /// Fired when a running metronome is stopped.
    MetronomeStopped { beats_fired: u64 },
    /// A sink failed on a beat. Timing carried on.
    SinkFailed { beat: u64, reason: String },
    /// A timer could not be armed and the metronome stopped.
    TimerFailed { reason: String },
    SinkAdded { id: SinkId },
    SinkRemoved { id: SinkId },
    /// Fired once when the engine's driver task is about to exit.
    EngineShutdown,
}
