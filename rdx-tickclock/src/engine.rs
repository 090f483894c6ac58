//! The async engine that drives a `TickScheduler` with tokio timers.
//!
//! A single driver task owns the scheduler. Control calls are sent to it as
//! commands over an mpsc queue, and timer firings are handled inside the same
//! `select!` loop, so every mutation of the beat clock is serialized. The
//! sleep future is rebuilt from the scheduler's pending arm on every loop
//! iteration; a timer superseded by a command is simply dropped.

use crate::common::{Bpm, SinkId};
use crate::components::sink::{BeatSink, SinkSet};
use crate::config::TickclockConfig;
use crate::error::TickError;
use crate::events::{BeatEvent, SystemEvent};
use crate::scheduler::{Cycle, TickScheduler};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{error, info, trace, warn};

/// A snapshot of the metronome's state, published after every change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickStatus {
    pub running: bool,
    pub tempo: Bpm,
    pub beats_fired: u64,
}

#[doc(hidden)]
enum Command {
    Start {
        tempo: Bpm,
        reply: oneshot::Sender<Result<(), TickError>>,
    },
    SetTempo {
        tempo: Bpm,
        reply: oneshot::Sender<Result<(), TickError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    AddSink {
        sink: Box<dyn BeatSink>,
        reply: oneshot::Sender<SinkId>,
    },
    RemoveSink {
        id: SinkId,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// The main Tickclock engine.
///
/// A cheap, cloneable handle to the driver task. All clones control the same
/// metronome.
#[derive(Clone)]
pub struct MetronomeEngine {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<TickStatus>,
    beat_sender: broadcast::Sender<BeatEvent>,
    system_event_sender: broadcast::Sender<SystemEvent>,
    config: Arc<TickclockConfig>,
}

// Public API implementation block.
impl MetronomeEngine {
    /// Validates `config` and spawns the driver task on the current runtime.
    ///
    /// The metronome starts out stopped.
    pub fn spawn(config: TickclockConfig) -> Result<Self, TickError> {
        config.validate()?;
        let scheduler = TickScheduler::new(config.tempo_bpm, SinkSet::new())?;

        let (commands, command_rx) = mpsc::channel(config.channels.command_capacity);
        let (beat_sender, _) = broadcast::channel(config.channels.beat_capacity);
        let (system_event_sender, _) = broadcast::channel(config.channels.system_capacity);
        let (status_tx, status) = watch::channel(snapshot(&scheduler));

        let driver = Driver {
            scheduler,
            commands: command_rx,
            status: status_tx,
            beat_sender: beat_sender.clone(),
            system_event_sender: system_event_sender.clone(),
        };
        tokio::spawn(driver.run());

        Ok(Self {
            commands,
            status,
            beat_sender,
            system_event_sender,
            config: Arc::new(config),
        })
    }

    /// Starts the metronome at `bpm`; the first beat fires right away.
    ///
    /// Calling `start` on a running metronome never creates a second beat
    /// stream. At a different tempo it behaves like [`Self::set_tempo`].
    pub async fn start(&self, bpm: f64) -> Result<(), TickError> {
        let tempo = Bpm::new(bpm)?;
        self.request(|reply| Command::Start { tempo, reply }).await?
    }

    /// Changes the tempo. A running metronome beats immediately at the new
    /// tempo; a stopped one uses it on the next `start`.
    pub async fn set_tempo(&self, bpm: f64) -> Result<(), TickError> {
        let tempo = Bpm::new(bpm)?;
        self.request(|reply| Command::SetTempo { tempo, reply }).await?
    }

    /// Stops the metronome. Stopping a stopped metronome is a no-op.
    pub async fn stop(&self) -> Result<(), TickError> {
        self.request(|reply| Command::Stop { reply }).await
    }

    /// Preset-button behaviour: stops a running metronome, otherwise starts
    /// it at `bpm`. Returns whether the metronome is running afterwards.
    pub async fn toggle(&self, bpm: f64) -> Result<bool, TickError> {
        if self.is_running() {
            self.stop().await?;
            Ok(false)
        } else {
            self.start(bpm).await?;
            Ok(true)
        }
    }

    pub fn is_running(&self) -> bool {
        self.status.borrow().running
    }

    pub fn status(&self) -> TickStatus {
        *self.status.borrow()
    }

    pub fn config(&self) -> &TickclockConfig {
        &self.config
    }

    /// Registers a sink that is invoked on every beat.
    pub async fn add_sink(&self, sink: impl BeatSink + 'static) -> Result<SinkId, TickError> {
        let sink: Box<dyn BeatSink> = Box::new(sink);
        self.request(|reply| Command::AddSink { sink, reply }).await
    }

    /// Removes a sink. Returns `true` if it was registered.
    pub async fn remove_sink(&self, id: SinkId) -> Result<bool, TickError> {
        self.request(|reply| Command::RemoveSink { id, reply }).await
    }

    /// Subscribes to the `BeatEvent` stream.
    pub fn subscribe_beats(&self) -> broadcast::Receiver<BeatEvent> {
        self.beat_sender.subscribe()
    }

    /// Subscribes to the `SystemEvent` stream.
    pub fn subscribe_system_events(&self) -> broadcast::Receiver<SystemEvent> {
        self.system_event_sender.subscribe()
    }

    /// Stops the metronome and ends the driver task.
    pub async fn shutdown(&self) -> Result<(), TickError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    /// Waits for Ctrl+C, then shuts the engine down.
    pub async fn run_until_ctrl_c(&self) -> anyhow::Result<()> {
        info!("Metronome engine running. Press Ctrl+C to shut down.");
        tokio::signal::ctrl_c().await?;
        info!("Shutdown signal received.");
        self.shutdown().await?;
        Ok(())
    }

    #[doc(hidden)]
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, TickError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| TickError::EngineClosed)?;
        response.await.map_err(|_| TickError::EngineClosed)
    }
}

fn snapshot<S: BeatSink>(scheduler: &TickScheduler<S>) -> TickStatus {
    TickStatus {
        running: scheduler.is_running(),
        tempo: scheduler.tempo(),
        beats_fired: scheduler.beats_fired(),
    }
}

/// Owns the scheduler inside the spawned task.
#[doc(hidden)]
struct Driver {
    scheduler: TickScheduler<SinkSet>,
    commands: mpsc::Receiver<Command>,
    status: watch::Sender<TickStatus>,
    beat_sender: broadcast::Sender<BeatEvent>,
    system_event_sender: broadcast::Sender<SystemEvent>,
}

impl Driver {
    async fn run(mut self) {
        info!("Metronome engine starting up...");
        self.system_event_sender
            .send(SystemEvent::EngineStarted {
                timestamp: Instant::now(),
            })
            .ok();

        loop {
            let pending = self.scheduler.pending();
            let wake_at = pending.map_or_else(Instant::now, |arm| arm.at);
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                    None => {
                        self.halt();
                        break;
                    }
                },
                _ = tokio::time::sleep_until(wake_at), if pending.is_some() => {
                    if let Some(arm) = pending {
                        let beats_before = self.scheduler.beats_fired();
                        let result = self.scheduler.on_timer(arm.handle, Instant::now());
                        match result {
                            Ok(Some(cycle)) => self.publish_cycle(cycle),
                            Ok(None) => trace!("Timer fired after being superseded."),
                            Err(e) => self.publish_error(e, beats_before),
                        }
                    }
                }
            }
            self.publish_status();
        }

        self.system_event_sender.send(SystemEvent::EngineShutdown).ok();
        info!("Metronome engine has shut down.");
    }

    /// Applies one command. Returns `false` once the engine should exit.
    #[doc(hidden)]
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Start { tempo, reply } => {
                let was_running = self.scheduler.is_running();
                let previous = self.scheduler.tempo();
                let beats_before = self.scheduler.beats_fired();
                let result = self.scheduler.start(tempo.get(), Instant::now());
                // A timer failure still means the metronome started and fired.
                if !matches!(result, Err(TickError::InvalidTempo(_))) {
                    if !was_running {
                        self.system_event_sender
                            .send(SystemEvent::MetronomeStarted {
                                tempo,
                                wall_time: chrono::Utc::now(),
                            })
                            .ok();
                    } else if previous != tempo {
                        self.system_event_sender
                            .send(SystemEvent::TempoChanged { from: previous, to: tempo })
                            .ok();
                    }
                }
                let outcome = self.settle(result.map(Some), beats_before);
                self.publish_status();
                reply.send(outcome).ok();
            }
            Command::SetTempo { tempo, reply } => {
                let previous = self.scheduler.tempo();
                let was_running = self.scheduler.is_running();
                let beats_before = self.scheduler.beats_fired();
                let result = self.scheduler.set_tempo(tempo.get(), Instant::now());
                let retuned = matches!(result, Ok(Some(_)) | Err(TickError::TimerFailure(_)));
                if was_running && retuned && previous != tempo {
                    self.system_event_sender
                        .send(SystemEvent::TempoChanged { from: previous, to: tempo })
                        .ok();
                }
                let outcome = self.settle(result, beats_before);
                self.publish_status();
                reply.send(outcome).ok();
            }
            Command::Stop { reply } => {
                self.halt();
                self.publish_status();
                reply.send(()).ok();
            }
            Command::AddSink { sink, reply } => {
                let id = self.scheduler.sink_mut().insert_boxed(sink);
                self.system_event_sender.send(SystemEvent::SinkAdded { id }).ok();
                reply.send(id).ok();
            }
            Command::RemoveSink { id, reply } => {
                let removed = self.scheduler.sink_mut().remove(id);
                if removed {
                    self.system_event_sender.send(SystemEvent::SinkRemoved { id }).ok();
                }
                reply.send(removed).ok();
            }
            Command::Shutdown { reply } => {
                self.halt();
                self.publish_status();
                reply.send(()).ok();
                return false;
            }
        }
        true
    }

    /// Publishes the outcome of a command-triggered cycle and converts it to
    /// the caller's reply. Timer failures are both broadcast and returned.
    #[doc(hidden)]
    fn settle(
        &self,
        result: Result<Option<Cycle>, TickError>,
        beats_before: u64,
    ) -> Result<(), TickError> {
        match result {
            Ok(Some(cycle)) => {
                self.publish_cycle(cycle);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(TickError::TimerFailure(reason)) => {
                self.publish_error(TickError::TimerFailure(reason.clone()), beats_before);
                Err(TickError::TimerFailure(reason))
            }
            Err(e) => Err(e),
        }
    }

    #[doc(hidden)]
    fn halt(&mut self) {
        if self.scheduler.is_running() {
            self.scheduler.stop();
            self.system_event_sender
                .send(SystemEvent::MetronomeStopped {
                    beats_fired: self.scheduler.beats_fired(),
                })
                .ok();
        }
    }

    #[doc(hidden)]
    fn publish_cycle(&self, cycle: Cycle) {
        if let Some(beat) = cycle.beat {
            self.beat_sender.send(beat).ok();
        }
        if let Some(TickError::SinkFailure { beat, reason }) = cycle.sink_failure {
            self.system_event_sender
                .send(SystemEvent::SinkFailed { beat, reason })
                .ok();
        }
    }

    /// Reports a failed cycle. A timer failure has already stopped the
    /// scheduler, possibly after the cycle's beat reached the sinks; that
    /// beat is still broadcast, followed by `TimerFailed` and
    /// `MetronomeStopped`.
    #[doc(hidden)]
    fn publish_error(&self, e: TickError, beats_before: u64) {
        match e {
            TickError::TimerFailure(reason) => {
                if self.scheduler.beats_fired() > beats_before {
                    if let Some(beat) = self.scheduler.last_beat() {
                        self.beat_sender.send(beat).ok();
                    }
                }
                error!("Metronome stopped: timer could not be armed.");
                self.system_event_sender
                    .send(SystemEvent::TimerFailed { reason })
                    .ok();
                self.system_event_sender
                    .send(SystemEvent::MetronomeStopped {
                        beats_fired: self.scheduler.beats_fired(),
                    })
                    .ok();
            }
            other => warn!("Unexpected scheduler error: {}", other),
        }
    }

    #[doc(hidden)]
    fn publish_status(&self) {
        let next = snapshot(&self.scheduler);
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}
