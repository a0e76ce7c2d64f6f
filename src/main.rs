use anyhow::Result;
use chrono::Utc;
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration};
use trip_recorder::sensors::{SimulatedGps, SimulatedMeasurements, SimulatedObd};
use trip_recorder::storage::create_gpx_track;
use trip_recorder::strategy::{Recorder, SignalPolicy};
use trip_recorder::{
    EventBus, FuelType, MemoryTrackSink, RecorderSettings, RecordingListener, RecordingState,
    RecordingStrategy, SettingsSource, StrategyBuilder, Track,
};

#[derive(Parser, Debug)]
#[command(name = "trip_recorder")]
#[command(about = "Record a simulated vehicle trip (GPS or OBD strategy)", long_about = None)]
struct Args {
    /// Recording strategy
    #[arg(long, value_enum, default_value = "gps")]
    mode: Mode,

    /// Duration in seconds (0 = until the session ends by itself)
    #[arg(long, value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// JSON settings file; missing keys keep their defaults
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Let the link go silent after this many fixes (GPS) or replies (OBD)
    #[arg(long)]
    dropout_after: Option<u64>,

    /// Fuel type for the consumption estimate
    #[arg(long, value_enum, default_value = "gasoline")]
    fuel: Fuel,

    /// Output directory
    #[arg(long, default_value = "trip_recorder_sessions")]
    output_dir: String,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    Gps,
    Obd,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Fuel {
    Gasoline,
    Diesel,
    Electric,
}

impl From<Fuel> for FuelType {
    fn from(fuel: Fuel) -> Self {
        match fuel {
            Fuel::Gasoline => FuelType::Gasoline,
            Fuel::Diesel => FuelType::Diesel,
            Fuel::Electric => FuelType::Electric,
        }
    }
}

/// Prints every callback and keeps the finished track
#[derive(Default)]
struct PrintingListener {
    finished: Mutex<Option<Track>>,
}

impl RecordingListener for PrintingListener {
    fn on_recording_state_changed(&self, state: RecordingState) {
        println!("[{}] Recording state: {:?}", ts_now(), state);
    }

    fn on_track_finished(&self, track: Track) {
        println!("[{}] Track finished: {} ({})", ts_now(), track.id, track.name);
        if let Ok(mut finished) = self.finished.lock() {
            *finished = Some(track);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let settings = match &args.settings {
        Some(path) => RecorderSettings::load(path)?,
        None => RecorderSettings::default(),
    };

    println!("[{}] Trip Recorder Starting", ts_now());
    println!("  Mode: {:?}", args.mode);
    println!("  Duration: {} seconds (0=until stopped)", args.duration);
    println!("  Fuel: {:?}", args.fuel);
    println!("  Output Dir: {}", args.output_dir);
    println!("  Settings: {:?}", settings);

    std::fs::create_dir_all(&args.output_dir)?;

    let bus = EventBus::new();
    let (printer_id, bus_rx) = bus.subscribe_channel()?;
    let printer = std::thread::spawn(move || {
        for event in bus_rx.iter() {
            println!("[{}] Bus: {:?}", ts_now(), event);
        }
    });

    // watchdog timers get their own worker so enrichment never delays them
    let timer_runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("recorder-timers")
        .enable_time()
        .build()?;

    let settings_source = SettingsSource::new(settings)?;
    let sink = MemoryTrackSink::new();
    let listener = Arc::new(PrintingListener::default());
    let tick = Duration::from_secs(1);

    let track = match args.mode {
        Mode::Gps => {
            let mut gps = SimulatedGps::new(tick);
            if let Some(fixes) = args.dropout_after {
                gps = gps.with_dropout_after(fixes);
            }
            let strategy = StrategyBuilder::new(
                Arc::new(gps),
                Arc::new(SimulatedMeasurements::gps_only()),
                Arc::new(sink.clone()),
            )
            .settings(settings_source.clone())
            .event_bus(bus.clone())
            .fuel_type(args.fuel.into())
            .timer_scheduler(timer_runtime.handle().clone())
            .build_gps();
            record(strategy, listener.clone(), args.duration).await
        }
        Mode::Obd => {
            let mut obd = SimulatedObd::new(Duration::from_secs(2), tick);
            if let Some(replies) = args.dropout_after {
                obd = obd.with_disconnect_after(replies);
            }
            let strategy = StrategyBuilder::new(
                Arc::new(obd),
                Arc::new(SimulatedMeasurements::with_obd()),
                Arc::new(sink.clone()),
            )
            .settings(settings_source.clone())
            .event_bus(bus.clone())
            .fuel_type(args.fuel.into())
            .timer_scheduler(timer_runtime.handle().clone())
            .build_obd();
            record(strategy, listener.clone(), args.duration).await
        }
    };

    timer_runtime.shutdown_background();
    bus.unsubscribe(printer_id)?;
    if printer.join().is_err() {
        log::warn!("Bus printer thread panicked");
    }

    match track {
        Some(track) => save_track(&sink, &track, Path::new(&args.output_dir))?,
        None => println!("[{}] Session ended without a track", ts_now()),
    }

    Ok(())
}

/// Run one session until it ends, the duration elapses or Ctrl-C
async fn record<P: SignalPolicy>(
    mut strategy: Recorder<P>,
    listener: Arc<PrintingListener>,
    duration: u64,
) -> Option<Track> {
    strategy.start_recording(listener.clone());

    if let Some(handle) = strategy.stop_handle() {
        let on_signal = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("\n[{}] Interrupted, stopping", ts_now());
                on_signal.stop();
            }
        });

        if duration > 0 {
            tokio::spawn(async move {
                sleep(Duration::from_secs(duration)).await;
                println!("[{}] Duration elapsed, stopping", ts_now());
                handle.stop();
            });
        }
    }

    strategy.join().await;
    if let Some(session) = strategy.session() {
        println!(
            "[{}] Session {} ended: {:?}, {} measurement(s)",
            ts_now(),
            session.session_id,
            session.stop_reason,
            session.measurement_count
        );
    }
    strategy.shutdown().await;

    let track = listener.finished.lock().ok().and_then(|mut t| t.take());
    track
}

fn save_track(sink: &MemoryTrackSink, track: &Track, output_dir: &Path) -> Result<()> {
    let export = sink
        .export(&track.id)
        .ok_or_else(|| anyhow::anyhow!("track {} not in storage", track.id))?;

    let stem = format!("{}_{}", track.id, ts_now_clean());
    let json_path = output_dir.join(format!("{}.json", stem));
    std::fs::write(&json_path, export.to_json()?)?;

    let gpx = create_gpx_track(track, &export.measurements);
    let gpx_path = output_dir.join(format!("{}.gpx", stem));
    std::fs::write(&gpx_path, gpx.to_gpx_xml())?;

    let stats = export.stats();
    println!("[{}] Saved {}", ts_now(), json_path.display());
    println!("[{}] Saved {}", ts_now(), gpx_path.display());
    println!("  Measurements: {}", stats.measurement_count);
    println!("  Duration: {:.0} s", stats.duration_seconds);
    println!("  Peak speed: {:.1} km/h", stats.peak_speed_kmh);
    println!("  Fuel: {:.3} l", stats.fuel_litres);
    println!("  CO2: {:.3} kg", stats.co2_kg);

    Ok(())
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}

fn ts_now_clean() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}
