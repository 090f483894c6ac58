//! Error types surfaced by the scheduler and the engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TickError {
    /// The tempo was zero, negative, NaN, infinite, or its beat interval
    /// cannot be represented. State is left unchanged.
    #[error("invalid tempo {0}: expected a positive, finite number of beats per minute")]
    InvalidTempo(f64),

    /// A beat sink returned an error or panicked while handling a beat.
    /// The next beat is armed regardless.
    #[error("beat sink failed on beat #{beat}: {reason}")]
    SinkFailure { beat: u64, reason: String },

    /// The next timer could not be armed. The scheduler has stopped.
    #[error("timer could not be armed: {0}")]
    TimerFailure(String),

    /// The engine's driver task is no longer running.
    #[error("the metronome engine has shut down")]
    EngineClosed,

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}
