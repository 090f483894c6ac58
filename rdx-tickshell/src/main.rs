use anyhow::Result;
use colored::Colorize;
use rustyline::highlight::Highlighter;
use rustyline::Editor;
use rustyline_derive::{Completer, Helper, Hinter, Validator};
use std::borrow::Cow;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tickclock::prelude::*;
use tickclock::{ENGINE_NAME, VERSION as LIB_VERSION};
use tokio::sync::mpsc;
use tracing::info;

const SHELL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A custom helper struct for rustyline that enables syntax highlighting.
#[derive(Completer, Helper, Hinter, Validator)]
struct ShellHighlighter;

impl Highlighter for ShellHighlighter {
    fn highlight<'l>(&self, line: &'l str, _pos: usize) -> Cow<'l, str> {
        if let Some((command, rest)) = line.split_once(' ') {
            let colored_command = command.yellow().bold();
            let colored_rest = rest.yellow();
            Cow::Owned(format!("{} {}", colored_command, colored_rest))
        } else {
            Cow::Owned(line.yellow().bold().to_string())
        }
    }
    fn highlight_char(&self, _line: &str, _pos: usize, _forced: bool) -> bool {
        true
    }
}

/// The two click sounds, selected with `page`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cue {
    Woodblock,
    Clock,
}

impl Cue {
    fn from_page(page: u8) -> Self {
        if page == 0 {
            Cue::Woodblock
        } else {
            Cue::Clock
        }
    }

    fn sound(self) -> &'static str {
        match self {
            Cue::Woodblock => "tok",
            Cue::Clock => "tick",
        }
    }
}

fn print_banner() {
    if env::var("QUIET_MODE").is_ok() {
        return;
    }
    println!("{}", format!("  {} shell", ENGINE_NAME).cyan().bold());

    let version_string = format!(
        "          Shell   v{:<8} Library   v{:<8}",
        SHELL_VERSION, LIB_VERSION
    );
    println!("{}", "-".repeat(64).dimmed());
    println!("{}", version_string);
    let license_blurb = "
    This software is provided 'as is', without warranty of any kind.
    Distributed under the MIT OR Apache-2.0 license. Use at your own risk.
    ";
    println!("{}", license_blurb.dimmed());
    println!("{}", "-".repeat(64).dimmed());
}

/// Renders beats handed over by the engine's `ChannelSink`.
///
/// The sink only enqueues, so printing never holds up the timing loop.
fn spawn_beat_renderer(mut beats: mpsc::UnboundedReceiver<BeatEvent>, page: Arc<AtomicU8>) {
    tokio::spawn(async move {
        while let Some(beat) = beats.recv().await {
            let cue = Cue::from_page(page.load(Ordering::Relaxed));
            let marker = if beat.index % 2 == 0 { "●" } else { "○" };
            println!(
                "<-- {} {} #{} @ {} ({:.2} ms late)",
                marker.green().bold(),
                cue.sound().green(),
                beat.index,
                beat.tempo,
                beat.drift.as_secs_f64() * 1000.0
            );
        }
    });
}

/// Prints system events that a user at the prompt should know about.
fn spawn_event_listeners(engine: &MetronomeEngine) {
    let mut system_rx = engine.subscribe_system_events();
    tokio::spawn(async move {
        while let Ok(event) = system_rx.recv().await {
            match event {
                SystemEvent::SinkFailed { beat, reason } => {
                    println!("\n<-- {} beat #{}: {}\n>> ", "[SINK FAILED]".red(), beat, reason)
                }
                SystemEvent::TimerFailed { reason } => {
                    println!("\n<-- {} {}\n>> ", "[TIMER FAILED]".red().bold(), reason)
                }
                SystemEvent::MetronomeStarted { tempo, wall_time } => println!(
                    "\n<-- [SYSTEM EVENT] Started at {} ({})\n>> ",
                    tempo,
                    wall_time.with_timezone(&chrono::Local).format("%H:%M:%S")
                ),
                other => println!("\n<-- [SYSTEM EVENT] {:?}\n>> ", other),
            }
        }
    });
}

fn parse_bpm(arg: Option<&&str>, usage: &str) -> Option<f64> {
    match arg.map(|s| s.parse::<f64>()) {
        Some(Ok(bpm)) => Some(bpm),
        Some(Err(_)) => {
            println!("Error: '{}' is not a valid tempo.", arg.copied().unwrap_or_default());
            None
        }
        None => {
            println!("Usage: {}", usage);
            None
        }
    }
}

fn report(result: Result<(), TickError>, success: impl FnOnce()) {
    match result {
        Ok(()) => success(),
        Err(e) => println!("{} {}", "Error:".red(), e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    print_banner();

    let config_path = env::args_os().nth(1).map(PathBuf::from);
    let config = TickclockConfig::load(config_path.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(config.log_filter()?)
        .with_target(false)
        .init();

    let engine = MetronomeEngine::spawn(config)?;

    // The renderer reads the current page on every beat.
    let page = Arc::new(AtomicU8::new(0));
    let (sink, beat_rx) = ChannelSink::new();
    engine.add_sink(sink).await?;
    spawn_beat_renderer(beat_rx, page.clone());
    spawn_event_listeners(&engine);

    info!("{} engine spawned.", ENGINE_NAME);

    let mut rl = Editor::new()?;
    rl.set_helper(Some(ShellHighlighter));

    println!("{} is ready. Type 'help' for commands or 'exit' to quit.", ENGINE_NAME.cyan());

    loop {
        let prompt = format!("{}", ">> ".cyan().bold());
        let readline = rl.readline(&prompt);
        match readline {
            Ok(line) => {
                rl.add_history_entry(line.as_str())?;
                let args = line.split_whitespace().collect::<Vec<_>>();

                if let Some(command) = args.first() {
                    match *command {
                        "preset" => {
                            if let Some(bpm) = parse_bpm(args.get(1), "preset <BPM>") {
                                match engine.toggle(bpm).await {
                                    Ok(true) => println!("--> Started at {} BPM.", bpm),
                                    Ok(false) => println!("--> Stopped."),
                                    Err(e) => println!("{} {}", "Error:".red(), e),
                                }
                            }
                        }
                        "start" => {
                            if let Some(bpm) = parse_bpm(args.get(1), "start <BPM>") {
                                report(engine.start(bpm).await, || {
                                    println!("--> Running at {} BPM.", bpm)
                                });
                            }
                        }
                        "tempo" => {
                            if let Some(bpm) = parse_bpm(args.get(1), "tempo <BPM>") {
                                report(engine.set_tempo(bpm).await, || {
                                    println!("--> Tempo set to {} BPM.", bpm)
                                });
                            }
                        }
                        "stop" => report(engine.stop().await, || println!("--> Stopped.")),
                        "page" => match args.get(1).and_then(|s| s.parse::<u8>().ok()) {
                            Some(n @ 1..=2) => {
                                page.store(n - 1, Ordering::Relaxed);
                                println!("--> Page {}: '{}' cue.", n, Cue::from_page(n - 1).sound());
                            }
                            _ => println!("Usage: page <1|2>"),
                        },
                        "presets" => {
                            let presets = engine
                                .config()
                                .presets
                                .iter()
                                .map(|bpm| bpm.to_string())
                                .collect::<Vec<_>>();
                            println!("Presets: {}", presets.join(", "));
                        }
                        "status" => {
                            let status = engine.status();
                            let state = if status.running {
                                "running".green()
                            } else {
                                "stopped".yellow()
                            };
                            println!(
                                "Metronome is {} at {} ({} beats fired, page {}).",
                                state,
                                status.tempo,
                                status.beats_fired,
                                page.load(Ordering::Relaxed) + 1
                            );
                        }
                        "help" => {
                            println!("Available commands:");
                            println!("  preset <BPM>          - Starts at BPM, or stops if running.");
                            println!("  start <BPM>           - Starts the metronome at BPM.");
                            println!("  tempo <BPM>           - Changes the tempo.");
                            println!("  stop                  - Stops the metronome.");
                            println!("  page <1|2>            - Switches the click sound.");
                            println!("  presets               - Lists the configured preset tempos.");
                            println!("  status                - Shows tempo and beat count.");
                            println!("  exit                  - Quits the shell.");
                        }
                        "exit" => break,
                        _ => println!("Unknown command: '{}'. Type 'help'.", line),
                    }
                }
            }
            Err(_) => {
                println!("Exiting tickshell...");
                break;
            }
        }
    }

    engine.shutdown().await?;
    Ok(())
}
