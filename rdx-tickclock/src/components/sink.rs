//! Defines the `BeatSink` capability and a few ready-made sinks.

use crate::common::SinkId;
use crate::events::BeatEvent;
use anyhow::anyhow;
use slotmap::SlotMap;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use tokio::sync::mpsc;

/// Something that reacts to fired beats: plays a cue, pulses an indicator.
///
/// `on_beat` is called synchronously from the timing loop, which does not wait
/// on whatever the sink kicks off. A sink must therefore return quickly; hand
/// slow work to another task. Errors are logged by the scheduler and never
/// interrupt timekeeping.
pub trait BeatSink: Send {
    fn on_beat(&mut self, beat: &BeatEvent) -> anyhow::Result<()>;
}

impl<S: BeatSink + ?Sized> BeatSink for Box<S> {
    fn on_beat(&mut self, beat: &BeatEvent) -> anyhow::Result<()> {
        (**self).on_beat(beat)
    }
}

/// Calls `sink` for `beat`, turning a panic into an error.
pub(crate) fn deliver<S: BeatSink + ?Sized>(sink: &mut S, beat: &BeatEvent) -> anyhow::Result<()> {
    match panic::catch_unwind(AssertUnwindSafe(|| sink.on_beat(beat))) {
        Ok(result) => result,
        Err(payload) => Err(anyhow!("sink panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Adapts a closure into a `BeatSink`.
pub struct FnSink<F>(F);

/// Wraps `f` so it can be used wherever a `BeatSink` is expected.
pub fn from_fn<F>(f: F) -> FnSink<F>
where
    F: FnMut(&BeatEvent) -> anyhow::Result<()> + Send,
{
    FnSink(f)
}

impl<F> BeatSink for FnSink<F>
where
    F: FnMut(&BeatEvent) -> anyhow::Result<()> + Send,
{
    fn on_beat(&mut self, beat: &BeatEvent) -> anyhow::Result<()> {
        (self.0)(beat)
    }
}

/// Forwards every beat into an unbounded channel.
///
/// Sending never blocks, so the timing loop only pays for a clone. Once the
/// receiving half is dropped every beat reports a failure.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<BeatEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BeatEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl BeatSink for ChannelSink {
    fn on_beat(&mut self, beat: &BeatEvent) -> anyhow::Result<()> {
        self.tx
            .send(*beat)
            .map_err(|_| anyhow!("beat receiver has been dropped"))
    }
}

/// A collection of sinks that are all invoked for every beat.
///
/// A failing or panicking sink does not prevent the others from seeing the
/// beat. All failures of one beat are reported together.
#[derive(Default)]
pub struct SinkSet {
    sinks: SlotMap<SinkId, Box<dyn BeatSink>>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, sink: impl BeatSink + 'static) -> SinkId {
        self.sinks.insert(Box::new(sink))
    }

    pub fn insert_boxed(&mut self, sink: Box<dyn BeatSink>) -> SinkId {
        self.sinks.insert(sink)
    }

    /// Returns `true` if the sink was registered.
    pub fn remove(&mut self, id: SinkId) -> bool {
        self.sinks.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl BeatSink for SinkSet {
    fn on_beat(&mut self, beat: &BeatEvent) -> anyhow::Result<()> {
        let total = self.sinks.len();
        let failures: Vec<String> = self
            .sinks
            .iter_mut()
            .filter_map(|(id, sink)| {
                deliver(sink, beat)
                    .err()
                    .map(|e| format!("{:?}: {:#}", id, e))
            })
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "{} of {} sinks failed: {}",
                failures.len(),
                total,
                failures.join("; ")
            ))
        }
    }
}
