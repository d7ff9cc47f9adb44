//! aicamd - camera polling and notification daemon
//!
//! Loads the configuration, builds the model set and collaborators, then
//! runs the capture loop until SIGINT/SIGTERM (or a single cycle with --once).

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use aicam::camera::Camera;
use aicam::config::AicamConfig;
use aicam::home::{ActionBook, CachedHome, HomeAssistant, StaticHome, UnreachablePolicy};
use aicam::notify::{MemoryTransport, NotificationTransport, Notifier, PlateLookup, Pushover};
use aicam::pipeline::Pipeline;
use aicam::plates::{CodeProjectAlpr, PlateBook};
use aicam::priority::PriorityEngine;
use aicam::publish::{CountSink, MemoryCountSink, MqttCountSink};
use aicam::scheduler::{Scheduler, Shutdown};
use aicam::snapshot::SnapshotStore;
use aicam::watchdog::Watchdog;
use aicam::ModelSet;

#[derive(Parser, Debug)]
#[command(author, version, about = "Poll cameras, detect objects and notify the household")]
struct Args {
    /// Configuration file (TOML, or JSON by extension).
    #[arg(value_name = "CONFIG", env = "AICAM_CONFIG")]
    config: Option<PathBuf>,

    /// Run a single cycle and exit.
    #[arg(long)]
    once: bool,

    /// Capture every camera on the serial lane.
    #[arg(long)]
    sync: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = AicamConfig::load(args.config.as_deref())?;
    cfg.scheduler.once |= args.once;
    cfg.scheduler.sync |= args.sync;

    log::info!("loading models");
    let models = ModelSet::load(&cfg.models).context("load models")?;
    log::info!("loaded models {}", models.names().join(", "));

    let home = match &cfg.home_assistant {
        Some(ha) => CachedHome::new(
            Box::new(HomeAssistant::new(ha.settings.clone())),
            ha.on_unreachable,
            ha.fallback_mode,
        ),
        None => CachedHome::new(
            Box::new(StaticHome::new(cfg.mode)),
            UnreachablePolicy::Permissive,
            cfg.mode,
        ),
    };

    let transport: Box<dyn NotificationTransport> = match &cfg.pushover {
        Some(p) => Box::new(Pushover::new(&p.token, &p.user, p.timeout)),
        None => {
            log::warn!("pushover not configured, notifications are only logged");
            Box::new(MemoryTransport::new())
        }
    };
    let snapshots = SnapshotStore::new(&cfg.save_path, cfg.colors.clone());
    let mut notifier =
        Notifier::new(transport, cfg.sounds.clone()).with_static_crops(snapshots.clone());
    if let Some(plates) = &cfg.plates {
        notifier = notifier.with_plates(PlateLookup {
            reader: Box::new(CodeProjectAlpr::new(&plates.url, plates.timeout)),
            book: PlateBook::open(&plates.book),
        });
    }

    let mqtt = match &cfg.mqtt {
        Some(settings) => Some(Arc::new(MqttCountSink::connect(settings)?)),
        None => None,
    };
    let counts: Arc<dyn CountSink> = match &mqtt {
        Some(sink) => sink.clone() as Arc<dyn CountSink>,
        None => Arc::new(MemoryCountSink::new()),
    };
    for cam in cfg.cameras.iter().filter(|c| c.vehicle_check) {
        if let Err(err) = counts.announce_vehicle_sensor(&cam.name) {
            log::warn!("{}: vehicle sensor discovery failed: {:#}", cam.name, err);
        }
    }

    let pipeline = Pipeline::new(
        models,
        cfg.thresholds.clone(),
        PriorityEngine::new(cfg.priority.clone()),
        notifier,
        snapshots,
    )
    .with_home(home)
    .with_actions(ActionBook::new(cfg.actions.clone()))
    .with_counts(counts)
    .with_settings(cfg.pipeline.clone());

    let cameras = cfg
        .cameras
        .iter()
        .cloned()
        .map(Camera::new)
        .collect::<Result<Vec<_>>>()?;

    let watchdog = Watchdog::from_env()?;
    if let Some(watchdog) = &watchdog {
        watchdog.ready()?;
    }
    let mut scheduler = Scheduler::new(cameras, Arc::new(pipeline), cfg.scheduler.clone())?
        .with_watchdog(watchdog);

    let shutdown = Shutdown::new();
    let handler = shutdown.clone();
    ctrlc::set_handler(move || handler.trigger()).context("install signal handler")?;

    log::info!("aicamd running, saving to {}", cfg.save_path.display());

    let result = scheduler.run(&shutdown);

    log::info!("graceful shutdown initiated");
    scheduler.close();
    if let Some(mqtt) = mqtt {
        if let Err(err) = mqtt.disconnect() {
            log::warn!("mqtt disconnect failed: {:#}", err);
        }
    }
    result
}
