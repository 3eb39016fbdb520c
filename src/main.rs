use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::time::{interval, Duration, MissedTickBehavior};

use atlas_telemetry::event_bus::{event_bus, DEFAULT_CAPACITY};
use atlas_telemetry::fusion::{FusionEngine, FusionUpdate};
use atlas_telemetry::geo::is_valid_coordinate;
use atlas_telemetry::link::{AtlasLink, LinkConfig, SimConfig, SimulatedTransport};
use atlas_telemetry::live_status::LiveStatus;
use atlas_telemetry::marks::{MarkCommand, MarksStore};
use atlas_telemetry::types::current_timestamp;

#[derive(Parser, Debug)]
#[command(name = "atlas_telemetry")]
#[command(
    about = "Atlas 2 telemetry link, SOG/COG fusion and start-line tracking",
    long_about = None
)]
struct Args {
    /// Duration in seconds (0 = continuous)
    #[arg(value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// Device address, or a name fragment to match while scanning
    #[arg(long)]
    device: Option<String>,

    /// Scan window in seconds
    #[arg(long, default_value = "8")]
    scan_timeout: f64,

    /// Seconds without telemetry before warning and forcing polling
    #[arg(long, default_value = "6")]
    no_data_timeout: f64,

    /// Seconds after connect before polling starts if notifications are silent
    #[arg(long, default_value = "1.5")]
    poll_delay: f64,

    #[arg(long, default_value = "200")]
    poll_interval_ms: u64,

    /// Race marks file
    #[arg(long, default_value = "logs/atlas_marks.json")]
    marks_file: PathBuf,

    /// Output directory for live_status.json
    #[arg(long, default_value = "atlas_sessions")]
    output_dir: PathBuf,

    /// Simulated unit answers reads only, never notifies
    #[arg(long)]
    sim_silent: bool,

    /// Simulated unit broadcasts this start line: PIN_LAT,PIN_LON,RCB_LAT,RCB_LON
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    sim_start_line: Option<Vec<f64>>,

    /// Read JSON mark commands from stdin, one per line
    #[arg(long)]
    commands: bool,
}

fn secs(name: &str, value: f64) -> Result<Duration> {
    if !value.is_finite() || value <= 0.0 {
        bail!("--{} must be a positive number of seconds, got {}", name, value);
    }
    Ok(Duration::from_secs_f64(value))
}

fn parse_start_line(values: Option<&[f64]>) -> Result<Option<((f64, f64), (f64, f64))>> {
    let Some(v) = values else {
        return Ok(None);
    };
    if v.len() != 4 {
        bail!("--sim-start-line needs PIN_LAT,PIN_LON,RCB_LAT,RCB_LON");
    }
    if !is_valid_coordinate(v[0], v[1]) || !is_valid_coordinate(v[2], v[3]) {
        bail!("--sim-start-line coordinates out of range");
    }
    Ok(Some(((v[0], v[1]), (v[2], v[3]))))
}

async fn next_command(lines: &mut Option<Lines<BufReader<Stdin>>>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}

fn persist_marks(store: &MarksStore, engine: &FusionEngine, updates: &[FusionUpdate]) -> bool {
    if !updates.contains(&FusionUpdate::MarksChanged) {
        return false;
    }
    match store.save(engine.marks()) {
        Ok(()) => true,
        Err(e) => {
            log::warn!("Could not save marks to {}: {}", store.path().display(), e);
            false
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let link_config = LinkConfig {
        device_hint: args.device.clone(),
        scan_timeout: secs("scan-timeout", args.scan_timeout)?,
        no_data_timeout: secs("no-data-timeout", args.no_data_timeout)?,
        poll_start_delay: secs("poll-delay", args.poll_delay)?,
        poll_interval: Duration::from_millis(args.poll_interval_ms.max(10)),
        ..LinkConfig::default()
    };
    let sim_config = SimConfig {
        notifications: !args.sim_silent,
        start_line: parse_start_line(args.sim_start_line.as_deref())?,
        ..SimConfig::default()
    };

    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("creating {}", args.output_dir.display()))?;
    let status_path = args.output_dir.join("live_status.json");

    log::info!("Atlas telemetry starting");
    log::info!("  Duration: {} seconds (0=continuous)", args.duration);
    log::info!("  Device: {}", args.device.as_deref().unwrap_or("<scan>"));
    log::info!("  Marks: {}", args.marks_file.display());
    log::info!("  Status: {}", status_path.display());

    let store = MarksStore::new(&args.marks_file);
    let mut engine = FusionEngine::default();
    engine.set_marks(store.load_or_default());

    let (tx, mut rx) = event_bus(DEFAULT_CAPACITY);
    let link = AtlasLink::new(SimulatedTransport::new(sim_config), link_config, tx);
    let stop = link.stop_handle();
    let phase = link.watch_phase();

    let ctrl_c = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupted, stopping link");
            ctrl_c.cancel();
        }
    });
    if args.duration > 0 {
        let timer = stop.clone();
        let duration = args.duration;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(duration)).await;
            log::info!("Duration of {}s reached, stopping link", duration);
            timer.cancel();
        });
    }

    let link_task = async move {
        link.run().await;
        // Last sender gone: the consumer drains the queue and exits
        drop(link);
    };

    let consumer = async {
        let started = Instant::now();
        let mut processed = 0u64;
        let mut frames = 0u64;
        let mut saved = 0u64;
        let mut commands = args.commands.then(|| BufReader::new(tokio::io::stdin()).lines());
        let mut status_tick = interval(Duration::from_secs(2));
        status_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let write_status = |engine: &FusionEngine, processed, frames, saved, dropped| {
            let mut status = LiveStatus::new(engine.snapshot());
            status.uptime_seconds = started.elapsed().as_secs();
            status.link_phase = phase.borrow().as_str().to_string();
            status.events_processed = processed;
            status.telemetry_frames = frames;
            status.marks_saved = saved;
            status.events_dropped = dropped;
            if let Err(e) = status.save(&status_path) {
                log::warn!("Could not write {}: {}", status_path.display(), e);
            }
        };

        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    processed += 1;
                    if event.is_telemetry() {
                        frames += 1;
                    }
                    let updates = engine.apply(&event);
                    if persist_marks(&store, &engine, &updates) {
                        saved += 1;
                    }
                }
                line = next_command(&mut commands) => {
                    let Some(line) = line else {
                        commands = None;
                        continue;
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<MarkCommand>(line.trim()) {
                        Ok(command) => {
                            let updates = engine.handle_command(&command, current_timestamp());
                            if persist_marks(&store, &engine, &updates) {
                                saved += 1;
                            }
                        }
                        Err(e) => log::warn!("Ignoring command {:?}: {}", line, e),
                    }
                }
                _ = status_tick.tick() => {
                    write_status(&engine, processed, frames, saved, rx.dropped());
                }
            }
        }

        write_status(&engine, processed, frames, saved, rx.dropped());
        log::info!(
            "Processed {} events ({} telemetry frames, {} dropped, {} marks saves)",
            processed,
            frames,
            rx.dropped(),
            saved
        );
    };

    tokio::join!(link_task, consumer);
    Ok(())
}
