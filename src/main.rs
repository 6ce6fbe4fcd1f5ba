// SPDX-License-Identifier: MIT
#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]

use std::io::{self, BufReader, BufWriter, StdoutLock, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use log::{info, warn};
use num_format::{Locale, ToFormattedString};

use trackrec::config::Settings;
use trackrec::datasource::{TrackSnapshot, TrackTable};
use trackrec::feed::FeedWorker;
use trackrec::recording::{
    LoadedSession, RecorderState, Recorder, ReplayState, Replayer, SessionStore, TrackSink,
    export_csv,
};

const MAX_LOOP_SLEEP: Duration = Duration::from_millis(50);

type StdoutSink = LineSink<BufWriter<StdoutLock<'static>>>;

#[derive(Parser)]
#[command(
    name = "trackrec",
    version,
    about = "trackrec: record and replay live track snapshots"
)]
struct Cli {
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,

    /// Settings file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record tracks read from stdin into a new session
    Record {
        /// Session file to create instead of a generated name
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Capture interval in milliseconds
        #[arg(short, long)]
        interval: Option<u64>,
        /// Stop after this many seconds (0 = until interrupted)
        #[arg(long, default_value = "0")]
        duration: u64,
    },
    /// Replay a session to stdout
    Replay {
        path: PathBuf,
        /// Speed multiplier
        #[arg(short, long)]
        speed: Option<f64>,
        /// Start position as a fraction of the session (0.0 - 1.0)
        #[arg(long, default_value = "0")]
        start: f64,
    },
    /// List sessions in the recordings directory
    List,
    /// Show header and track statistics of a session
    Info { path: PathBuf },
    /// Delete a session
    Delete { path: PathBuf },
    /// Copy a session, optionally as a zstd archive
    Copy {
        src: PathBuf,
        dest: PathBuf,
        #[arg(short, long)]
        compress: bool,
    },
    /// Export a session to CSV, one row per snapshot
    Export {
        path: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.verbose.log_level_filter())
        .format_timestamp_millis()
        .init();

    let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;
    let store = SessionStore::new(&settings.recordings_dir);

    match cli.command {
        Commands::Record {
            output,
            interval,
            duration,
        } => cmd_record(settings, store, output.as_deref(), interval, duration),
        Commands::Replay { path, speed, start } => {
            cmd_replay(&settings, &store.resolve(&path), speed, start)
        }
        Commands::List => cmd_list(&store),
        Commands::Info { path } => cmd_info(&store.resolve(&path)),
        Commands::Delete { path } => {
            let path = store.resolve(&path);
            store
                .delete(&path)
                .with_context(|| format!("failed to delete {}", path.display()))?;
            eprintln!("Deleted {}", path.display());
            Ok(())
        }
        Commands::Copy {
            src,
            dest,
            compress,
        } => cmd_copy(&store, &store.resolve(&src), &dest, compress),
        Commands::Export { path, output } => cmd_export(&store.resolve(&path), &output),
    }
}

// ---------------------------------------------------------------------------
// Signal handling
// ---------------------------------------------------------------------------

struct Signals {
    shutdown: Arc<AtomicBool>,
    toggle_pause: Arc<AtomicBool>,
}

impl Signals {
    fn install() -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let toggle_pause = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))
            .context("failed to register SIGINT handler")?;
        signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))
            .context("failed to register SIGTERM handler")?;
        signal_hook::flag::register(signal_hook::consts::SIGUSR1, Arc::clone(&toggle_pause))
            .context("failed to register SIGUSR1 handler")?;
        Ok(Self {
            shutdown,
            toggle_pause,
        })
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    fn take_pause_toggle(&self) -> bool {
        self.toggle_pause.swap(false, Ordering::Relaxed)
    }
}

fn sleep_until_due(due_in: Option<Duration>) {
    std::thread::sleep(due_in.map_or(MAX_LOOP_SLEEP, |d| d.min(MAX_LOOP_SLEEP)));
}

// ---------------------------------------------------------------------------
// Record subcommand
// ---------------------------------------------------------------------------

fn cmd_record(
    mut settings: Settings,
    store: SessionStore,
    output: Option<&Path>,
    interval_ms: Option<u64>,
    duration_secs: u64,
) -> Result<()> {
    if let Some(ms) = interval_ms {
        settings.capture_interval_ms = ms;
    }
    settings.validate()?;

    let signals = Signals::install()?;
    let table = TrackTable::new();
    let feed = FeedWorker::spawn(BufReader::new(io::stdin()), table.clone())
        .context("failed to spawn track feed thread")?;

    let mut recorder = Recorder::with_interval(table, store, settings.capture_interval());
    let start = Instant::now();
    match output {
        Some(path) => recorder
            .start_at(path, start)
            .with_context(|| format!("failed to start recording to {}", path.display()))?,
        None => {
            recorder
                .start(start)
                .context("failed to start recording")?;
        }
    }
    let path = recorder
        .session_path()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    eprintln!("Recording to {} ...", path.display());

    let result = run_record_loop(
        &signals,
        &mut recorder,
        &feed,
        &settings,
        duration_secs,
        start,
    );
    let stopped = recorder.stop().context("failed to close session file");
    result?;
    stopped?;

    eprintln!(
        "Finished: {} frames written to {}",
        recorder.frame_count().to_formatted_string(&Locale::en),
        path.display()
    );
    Ok(())
}

fn run_record_loop(
    signals: &Signals,
    recorder: &mut Recorder<TrackTable>,
    feed: &FeedWorker,
    settings: &Settings,
    duration_secs: u64,
    start: Instant,
) -> Result<()> {
    let max_duration = (duration_secs > 0).then(|| Duration::from_secs(duration_secs));
    let mut last_status = start;
    let mut feed_closed = false;

    loop {
        if signals.shutdown_requested() {
            eprintln!("\nInterrupted.");
            break;
        }
        if let Some(max) = max_duration
            && start.elapsed() >= max
        {
            eprintln!("\nDuration limit reached.");
            break;
        }

        let now = Instant::now();
        if signals.take_pause_toggle() {
            match recorder.state() {
                RecorderState::Recording => recorder.pause(),
                RecorderState::Paused => recorder.resume(now),
                RecorderState::Idle | RecorderState::Stopped => {}
            }
            eprintln!("Recorder {}", recorder.state());
        }

        recorder.poll(now).context("capture failed")?;

        if !feed_closed && feed.is_closed() {
            feed_closed = true;
            info!("input closed; recording the last known tracks");
        }

        if let Some(every) = settings.status_interval()
            && now.duration_since(last_status) >= every
        {
            print_recording_status(recorder, feed, start.elapsed());
            last_status = now;
        }

        sleep_until_due(recorder.time_until_due(Instant::now()));
    }
    Ok(())
}

#[allow(clippy::cast_precision_loss)]
fn print_recording_status(recorder: &Recorder<TrackTable>, feed: &FeedWorker, elapsed: Duration) {
    eprintln!(
        "  [{}s] {} {} frames, {} tracks, {:.1} KB, {} feed lines ({} rejected)",
        elapsed.as_secs(),
        recorder.state(),
        recorder.frame_count().to_formatted_string(&Locale::en),
        recorder.source().len().to_formatted_string(&Locale::en),
        recorder.bytes_written() as f64 / 1024.0,
        feed.applied().to_formatted_string(&Locale::en),
        feed.rejected().to_formatted_string(&Locale::en),
    );
}

// ---------------------------------------------------------------------------
// Replay subcommand
// ---------------------------------------------------------------------------

/// Writes one line per replayed snapshot.
struct LineSink<W> {
    out: W,
    timestamp_ms: i64,
    failed: Option<io::Error>,
}

impl<W: Write> TrackSink for LineSink<W> {
    fn deliver(&mut self, s: &TrackSnapshot) {
        if self.failed.is_some() {
            return;
        }
        if let Err(e) = writeln!(
            self.out,
            "{} id={} x={} y={} z={} heading={} velocity={} identity={}",
            self.timestamp_ms,
            s.track_id,
            s.x,
            s.y,
            s.z,
            s.heading,
            s.velocity,
            s.identity_label()
        ) {
            self.failed = Some(e);
        }
    }
}

fn cmd_replay(settings: &Settings, path: &Path, speed: Option<f64>, start: f64) -> Result<()> {
    let signals = Signals::install()?;
    let sink = LineSink {
        out: BufWriter::new(io::stdout().lock()),
        timestamp_ms: 0,
        failed: None,
    };

    let mut replayer = Replayer::new(sink);
    replayer
        .load(path)
        .with_context(|| format!("failed to load {}", path.display()))?;

    let now = Instant::now();
    replayer
        .set_speed(speed.unwrap_or(settings.replay_speed), now)
        .context("invalid --speed")?;
    replayer.seek(start).context("invalid --start")?;

    let (cursor, total) = replayer.progress();
    eprintln!(
        "Replaying {} frames from frame {cursor} at {}x ...",
        total.to_formatted_string(&Locale::en),
        replayer.speed()
    );

    replayer.play(now)?;
    let result = run_replay_loop(&signals, &mut replayer);

    let (cursor, total) = replayer.progress();
    let state = replayer.state();
    let mut sink = replayer.into_sink();
    sink.out.flush().context("failed to flush stdout")?;
    result?;

    eprintln!("Replay {state} at frame {cursor} of {total}");
    Ok(())
}

fn run_replay_loop(signals: &Signals, replayer: &mut Replayer<StdoutSink>) -> Result<()> {
    while matches!(replayer.state(), ReplayState::Playing | ReplayState::Paused) {
        if signals.shutdown_requested() {
            eprintln!("\nInterrupted.");
            replayer.pause();
            break;
        }

        let now = Instant::now();
        if signals.take_pause_toggle() {
            if replayer.state() == ReplayState::Playing {
                replayer.pause();
            } else {
                replayer.play(now)?;
            }
            eprintln!("Replay {}", replayer.state());
        }

        let timestamp_ms = replayer.current_timestamp_ms().unwrap_or_default();
        replayer.sink_mut().timestamp_ms = timestamp_ms;
        if replayer.poll(now) {
            let sink = replayer.sink_mut();
            sink.out.flush().context("failed to write to stdout")?;
            if let Some(e) = sink.failed.take() {
                return Err(e).context("failed to write to stdout");
            }
        }

        sleep_until_due(replayer.time_until_due(Instant::now()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Store subcommands
// ---------------------------------------------------------------------------

fn format_time_ms(ms: i64) -> String {
    DateTime::from_timestamp_millis(ms).map_or_else(
        || ms.to_string(),
        |t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string(),
    )
}

fn cmd_list(store: &SessionStore) -> Result<()> {
    let sessions = store
        .list()
        .with_context(|| format!("failed to list {}", store.base_dir().display()))?;

    if sessions.is_empty() {
        eprintln!("No sessions in {}", store.base_dir().display());
        return Ok(());
    }

    println!("{:<40} {:<20} {:>14}", "NAME", "CREATED", "BYTES");
    for session in &sessions {
        let created = session
            .created_at_ms
            .map_or_else(|| "-".to_string(), format_time_ms);
        let mut flags = String::new();
        if session.open {
            flags.push_str(" (recording)");
        }
        if session.compressed {
            flags.push_str(" (zstd)");
        }
        println!(
            "{:<40} {:<20} {:>14}{flags}",
            session.file_name,
            created,
            session.size_bytes.to_formatted_string(&Locale::en)
        );
    }
    Ok(())
}

#[allow(clippy::cast_precision_loss)]
fn cmd_info(path: &Path) -> Result<()> {
    let session =
        LoadedSession::open(path).with_context(|| format!("failed to load {}", path.display()))?;
    let stats = session.stats();

    println!("file:            {}", path.display());
    println!("format version:  {}", session.header.format_version);
    println!(
        "created:         {}",
        format_time_ms(session.header.created_at_ms)
    );
    println!(
        "frames:          {}",
        session.frame_count().to_formatted_string(&Locale::en)
    );
    println!(
        "duration:        {:.1} s",
        session.duration_ms() as f64 / 1000.0
    );
    println!(
        "snapshots:       {}",
        stats.total_snapshots.to_formatted_string(&Locale::en)
    );
    println!("distinct tracks: {}", stats.distinct_tracks);
    println!("max per frame:   {}", stats.max_tracks_per_frame);
    println!("empty frames:    {}", stats.empty_frames);
    if session.dropped_tail_bytes > 0 {
        println!(
            "dropped tail:    {} bytes (incomplete final frame)",
            session.dropped_tail_bytes
        );
    }
    Ok(())
}

fn cmd_copy(store: &SessionStore, src: &Path, dest: &Path, compress: bool) -> Result<()> {
    let bytes = if compress {
        store.archive(src, dest)
    } else {
        store.copy(src, dest)
    }
    .with_context(|| format!("failed to copy {} to {}", src.display(), dest.display()))?;

    eprintln!(
        "Wrote {} bytes to {}",
        bytes.to_formatted_string(&Locale::en),
        dest.display()
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Export subcommand
// ---------------------------------------------------------------------------

fn cmd_export(input: &Path, output: &Path) -> Result<()> {
    let session =
        LoadedSession::open(input).with_context(|| format!("failed to load {}", input.display()))?;
    let rows = export_csv(&session, output)
        .with_context(|| format!("failed to export to {}", output.display()))?;

    if session.frames.iter().all(|f| f.tracks.is_empty()) {
        warn!("{} holds no track snapshots", input.display());
    }
    eprintln!(
        "Exported {} rows from {} frames of {} to {}",
        rows.to_formatted_string(&Locale::en),
        session.frame_count().to_formatted_string(&Locale::en),
        input.display(),
        output.display()
    );
    Ok(())
}
