use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use mocap_stream_core::sim::{SimBehaviour, SimFactory, SimScene};
use mocap_stream_core::{
    AppConfig, BackendMode, ConnectionManager, MocapError, QueryFacade, StreamMode,
};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

/// How long to wait for the first connected notification.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

fn main() -> mocap_stream_core::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.command)?;
    init_tracing(&config.logging.level);

    match cli.command {
        Commands::Stream {
            frames,
            tick_ms,
            fail_connects,
            ..
        } => run_stream(&config, frames, tick_ms, fail_connects),
        Commands::Resolve { .. } => {
            println!("{}", config.stream.combined_target()?);
            Ok(())
        }
    }
}

fn load_config(command: &Commands) -> mocap_stream_core::Result<AppConfig> {
    let (common, stream_args) = match command {
        Commands::Stream { common, args, .. } => (common, Some(args)),
        Commands::Resolve { common } => (common, None),
    };

    let mut config = match &common.config {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::default(),
    };

    if !common.target.is_empty() {
        config.stream.targets = common.target.clone();
    }
    if let Some(port) = common.port {
        config.stream.port = port;
    }

    if let Some(args) = stream_args {
        if let Some(mode) = args.mode {
            config.stream.mode = mode.into();
        }
        if let Some(stream_mode) = args.stream_mode {
            config.stream.stream_mode = stream_mode.into();
        }
        if let Some(offset) = args.offset {
            config.stream.offset_seconds = offset;
        }
        if !args.subject.is_empty() {
            config.stream.subject_filter = args.subject.clone();
        }
        if args.ticks {
            config.stream.consumer_ticks = true;
        }
    }

    config.stream.validate()?;
    Ok(config)
}

fn run_stream(
    config: &AppConfig,
    frames: u32,
    tick_ms: u64,
    fail_connects: u32,
) -> mocap_stream_core::Result<()> {
    let factory = SimFactory::new(
        SimScene::demo(),
        SimBehaviour {
            failed_connects: fail_connects,
            frame_delay: Some(Duration::from_millis(1)),
            ..Default::default()
        },
    );

    let mut manager = ConnectionManager::new(factory);
    let (tx, rx) = mpsc::channel();
    manager.on_connection_changed(move |connected| {
        let _ = tx.send(connected);
    });

    manager.start(&config.stream)?;
    match rx.recv_timeout(CONNECT_TIMEOUT) {
        Ok(true) => {}
        Ok(false) | Err(_) => {
            manager.stop()?;
            return Err(MocapError::msg("stream server did not become available"));
        }
    }

    let query = manager
        .query()
        .ok_or_else(|| MocapError::msg("no active session"))?;
    let tick = Duration::from_millis(tick_ms);

    for _ in 0..frames {
        if let Some(status) = manager.tick()? {
            if !status.is_success() {
                tracing::warn!(%status, "frame acquisition failed");
            }
        }
        println!("{}", frame_report(&query));
        thread::sleep(tick);
    }

    tracing::info!(frames = manager.frames_acquired(), "stream finished");
    manager.stop()
}

/// One JSON object describing the latest frame.
fn frame_report(query: &QueryFacade) -> Value {
    let frame = query.frame_number();
    let subjects: Vec<Value> = query
        .subject_names()
        .value
        .iter()
        .map(|subject| {
            let markers = query.skeleton_markers(subject);
            let segments: Vec<Value> = query
                .segment_names(subject)
                .value
                .iter()
                .map(|segment| {
                    let translation = query.scaled_segment_translation(subject, segment);
                    json!({
                        "name": segment,
                        "parent": query.segment_parent_name(subject, segment).value,
                        "translation": translation.value,
                        "status": translation.status,
                    })
                })
                .collect();
            json!({
                "name": subject,
                "markers": markers.value,
                "segments": segments,
            })
        })
        .collect();

    json!({
        "frame": frame.value,
        "frame_status": frame.status,
        "latency": query.latency_total().value,
        "subjects": subjects,
    })
}

fn init_tracing(default_level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Motion-capture stream client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct CommonArgs {
    /// Configuration file (`.toml` or `.json`).
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Server to connect to. Repeat or join with `;` for fallbacks.
    #[arg(short, long)]
    target: Vec<String>,
    /// Port used for targets without one.
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(clap::Args, Debug)]
struct StreamArgs {
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,
    #[arg(long, value_enum)]
    stream_mode: Option<StreamModeArg>,
    /// Retiming offset in seconds.
    #[arg(long)]
    offset: Option<f64>,
    /// Restrict the stream to these subjects.
    #[arg(long)]
    subject: Vec<String>,
    /// Drive acquisition from this loop instead of a background thread.
    #[arg(long)]
    ticks: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to the simulated server and print frames as JSON lines.
    Stream {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        args: StreamArgs,
        /// Number of frames to print.
        #[arg(long, default_value_t = 10)]
        frames: u32,
        /// Delay between printed frames.
        #[arg(long, default_value_t = 10)]
        tick_ms: u64,
        /// Connection attempts the simulated server refuses first.
        #[arg(long, default_value_t = 0)]
        fail_connects: u32,
    },
    /// Print the combined connection target.
    Resolve {
        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Direct,
    Retimed,
}

impl From<ModeArg> for BackendMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Direct => BackendMode::Direct,
            ModeArg::Retimed => BackendMode::Retimed,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StreamModeArg {
    ServerPush,
    ClientPull,
    ClientPullPreFetch,
}

impl From<StreamModeArg> for StreamMode {
    fn from(mode: StreamModeArg) -> Self {
        match mode {
            StreamModeArg::ServerPush => StreamMode::ServerPush,
            StreamModeArg::ClientPull => StreamMode::ClientPull,
            StreamModeArg::ClientPullPreFetch => StreamMode::ClientPullPreFetch,
        }
    }
}
