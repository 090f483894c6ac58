//! # Tickclock
//!
//! A drift-correcting tempo clock for Rust.
//!
//! Tickclock fires a beat at a steady BPM on top of timers that only promise a
//! *minimum* delay. Every firing measures how late it was against an absolute
//! deadline grid and shortens the next wait by that amount, so lateness never
//! accumulates and the long-run rate matches the requested tempo.
//!
//! ## Core Concepts
//!
//! - **TickScheduler**: A synchronous state machine that owns the beat clock.
//!   It takes the current monotonic instant as input and answers with the
//!   next timer to arm. It never sleeps, which makes it trivial to test with
//!   synthetic time.
//! - **BeatSink**: The capability a scheduler calls on every beat: play a cue,
//!   pulse an indicator. Sink failures are logged and never stop timekeeping.
//! - **MetronomeEngine**: A tokio task that drives a scheduler with real
//!   timers, serializes control calls through a command queue, and broadcasts
//!   `BeatEvent`s and `SystemEvent`s.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use tickclock::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // 1. Spawn the engine with a default configuration.
//!     let engine = MetronomeEngine::spawn(TickclockConfig::default())?;
//!
//!     // 2. Register a sink before starting.
//!     engine
//!         .add_sink(from_fn(|beat| {
//!             println!("tick #{} ({:?} late)", beat.index, beat.drift);
//!             Ok(())
//!         }))
//!         .await?;
//!
//!     // 3. Start at 90 BPM. The first beat fires immediately.
//!     engine.start(90.0).await?;
//!
//!     // 4. Run until Ctrl+C.
//!     engine.run_until_ctrl_c().await?;
//!
//!     Ok(())
//! }
//! ```

pub const ENGINE_NAME: &str = "Tickclock";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Declare all the modules in the crate.
pub mod common;
pub mod components;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod scheduler;
pub mod time;

/// A prelude module for easy importing of the most common Tickclock types.
pub mod prelude {
    pub use crate::common::{Bpm, SinkId, TimerHandle};
    pub use crate::components::sink::{from_fn, BeatSink, ChannelSink, SinkSet};
    pub use crate::config::TickclockConfig;
    pub use crate::engine::{MetronomeEngine, TickStatus};
    pub use crate::error::TickError;
    pub use crate::events::{BeatEvent, SystemEvent};
    pub use crate::scheduler::{Cycle, TickScheduler};
    pub use crate::time::Arm;
}
