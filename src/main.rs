use anyhow::{bail, Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use kws_rs::display::ConsoleDisplay;
use kws_rs::{
    ChannelStream, ClassList, Config, FileModelStore, FrameFeeder, ModelLocation,
    SessionController, SpectrogramFrame,
};

type Session = SessionController<ChannelStream, FileModelStore, ConsoleDisplay>;

#[derive(Parser)]
#[command(name = "kws-rs")]
#[command(about = "Collect keyword snippets, train a small CNN on the fly and classify a feature stream")]
struct Args {
    /// TOML configuration file (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSON-lines spectrogram frames replayed into the active stream
    #[arg(short, long)]
    frames: Option<PathBuf>,

    /// Delay between replayed frames (milliseconds)
    #[arg(long, default_value = "23")]
    frame_interval_ms: u64,

    /// Log filter, overrides RUST_LOG (e.g. "info", "kws_rs=debug")
    #[arg(long)]
    log_level: Option<String>,
}

enum Command {
    Collect(String),
    Stop,
    Train,
    Listen,
    Threshold(f32),
    Save,
    Export,
    Load(ModelLocation),
    Reset,
    Status,
    Quit,
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let Some(verb) = parts.next() else {
            bail!("empty command");
        };
        let arg = parts.next();

        let command = match (verb, arg) {
            ("collect", Some(label)) => Command::Collect(label.to_string()),
            ("stop", None) => Command::Stop,
            ("train", None) => Command::Train,
            ("listen", None) => Command::Listen,
            ("threshold", Some(t)) => {
                Command::Threshold(t.parse().with_context(|| format!("bad threshold '{t}'"))?)
            }
            ("save", None) => Command::Save,
            ("export", None) => Command::Export,
            ("load", Some(location)) => Command::Load(location.parse()?),
            ("reset", None) => Command::Reset,
            ("status", None) => Command::Status,
            ("quit" | "exit", None) => Command::Quit,
            _ => bail!("unknown command '{line}'"),
        };
        Ok(command)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_level.as_deref())?;

    let config = match &args.config {
        Some(path) => Config::load_from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::default(),
    };

    println!("kws-rs - keyword snippet trainer");
    println!("================================");
    println!("Classes: {}", config.session.classes.iter().collect::<Vec<_>>().join(", "));
    println!("Window: {} frames x {} bins", config.stream.frames, config.stream.bins);
    println!("Model: {}", config.store.local_model);
    println!();

    let stream = ChannelStream::new(config.stream.channel_capacity);
    let feeder = stream.feeder();
    let store = FileModelStore::new(&config.store.root, &config.store.downloads);
    let mut session = SessionController::new(&config, stream, store, ConsoleDisplay::stdout())?;
    session.init()?;

    if let Some(path) = &args.frames {
        let frames = load_frames(path)?;
        println!("Replaying {} frames from {}", frames.len(), path.display());
        spawn_replay(feeder, frames, Duration::from_millis(args.frame_interval_ms));
    }

    println!("Commands: collect <label>, stop, train, listen, threshold <t>, save, export,");
    println!("          load <location>, reset, status, quit");
    println!();

    let commands = spawn_command_reader();
    run(&mut session, &commands);

    session.teardown();
    Ok(())
}

fn init_tracing(level: Option<&str>) -> Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).context("invalid --log-level")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn run(session: &mut Session, commands: &Receiver<String>) {
    loop {
        match commands.recv_timeout(Duration::from_millis(5)) {
            Ok(line) => match line.parse::<Command>() {
                Ok(Command::Quit) => break,
                Ok(command) => {
                    if let Err(e) = execute(session, command) {
                        println!("error: {e}");
                    }
                }
                Err(e) => println!("error: {e}"),
            },
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if let Err(e) = session.process_pending() {
            warn!(error = %e, "frame rejected");
        }
    }
}

fn execute(session: &mut Session, command: Command) -> Result<()> {
    match command {
        Command::Collect(label) => {
            let label = resolve_label(session.classes(), &label)?;
            session.collect(Some(label))?;
        }
        Command::Stop => session.collect(None)?,
        Command::Train => {
            session.train()?;
        }
        Command::Listen => session.listen()?,
        Command::Threshold(t) => session.set_threshold(t)?,
        Command::Save => session.save_model()?,
        Command::Export => session.export_model()?,
        Command::Load(location) => session.load_model(&location)?,
        Command::Reset => session.reset()?,
        Command::Status => print_status(session),
        Command::Quit => {}
    }
    Ok(())
}

/// Accept either a class name or its index.
fn resolve_label(classes: &ClassList, label: &str) -> Result<usize> {
    if let Some(index) = classes.position(label) {
        return Ok(index);
    }
    match label.parse::<usize>() {
        Ok(index) if classes.contains(index) => Ok(index),
        _ => bail!("unknown class '{label}'"),
    }
}

fn print_status(session: &Session) {
    let classes = session.classes();
    let counts = session.dataset().label_counts(classes.len());

    println!("State: {}", session.state());
    println!("Threshold: {:.2}", session.threshold());
    println!("Examples: {}", session.dataset().len());
    for (name, count) in classes.iter().zip(counts) {
        println!("  {name}: {count}");
    }
}

fn load_frames(path: &Path) -> Result<Vec<SpectrogramFrame>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut frames = Vec::new();

    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let frame: SpectrogramFrame = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid frame", path.display(), n + 1))?;
        frames.push(frame);
    }

    if frames.is_empty() {
        bail!("{} holds no frames", path.display());
    }
    Ok(frames)
}

/// Feed frames in a loop, the way a live extractor ticks. Frames pushed while
/// no activation is outstanding are dropped.
fn spawn_replay(feeder: FrameFeeder, frames: Vec<SpectrogramFrame>, interval: Duration) {
    thread::spawn(move || {
        for frame in frames.iter().cycle() {
            if !feeder.push(frame.clone()) {
                debug!("frame dropped, stream inactive");
            }
            thread::sleep(interval);
        }
    });
}

fn spawn_command_reader() -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}
