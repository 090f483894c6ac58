//! Contains the building blocks that turn fired beats into something audible
//! or visible.
//!
//! The scheduler only knows the `BeatSink` trait. The concrete sinks here
//! cover the common wiring: closures, channels, and fan-out to several sinks.

pub mod sink;
