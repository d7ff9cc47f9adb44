use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::camera::{CameraSettings, DEFAULT_INTERVAL, DEFAULT_REBOOT_AFTER_FAILURES};
use crate::detect::{ModelSettings, ModelsSettings};
use crate::filter::{ExclusionSet, RoadLine, SpatialFilter, Thresholds, ZoneRule, DEFAULT_STICKY_THRESHOLD};
use crate::home::{ActionRule, HomeAssistantSettings, Mode, UnreachablePolicy};
use crate::ingest::{DropFolder, HttpConfig};
use crate::notify::{Sounds, DEFAULT_SOUND};
use crate::pipeline::{
    PipelineSettings, DEFAULT_DEPARTURE_MIN_AGE, DEFAULT_DEPARTURE_MIN_LIFETIME,
    DEFAULT_TRACK_EXPIRY, DEFAULT_WARMUP_CYCLES,
};
use crate::priority::RuleBook;
use crate::publish::{parse_broker, MqttSettings, DEFAULT_COUNTED_CLASSES, DEFAULT_DISCOVERY_PREFIX};
use crate::scheduler::{
    SchedulerSettings, DEFAULT_BATCH_TIMEOUT, DEFAULT_BUSY_THRESHOLD, DEFAULT_IDLE_SLEEP,
    DEFAULT_QUIET_WINDOW,
};

const DEFAULT_SAVE_PATH: &str = "/var/lib/aicam";
const DEFAULT_THRESHOLD: f32 = 0.6;
const DEFAULT_MODEL_SIZE: u32 = 416;
const DEFAULT_MODEL_CHANNELS: u32 = 3;
const DEFAULT_MODEL_PROB: f32 = 0.1;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 20;
const DEFAULT_HA_TIMEOUT_SECS: u64 = 5;
const DEFAULT_NIGHT_ENTITY: &str = "input_boolean.night_mode";
const DEFAULT_PRESENCE_ENTITY: &str = "group.family";
const DEFAULT_PUSHOVER_TIMEOUT_SECS: u64 = 10;
const DEFAULT_ALPR_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MQTT_CLIENT_ID: &str = "aicam";

#[derive(Debug, Deserialize, Default)]
struct AicamConfigFile {
    save_path: Option<PathBuf>,
    excludes: Option<PathBuf>,
    mode: Option<Mode>,
    detector: Option<DetectorConfigFile>,
    models: Option<ModelsConfigFile>,
    scheduler: Option<SchedulerConfigFile>,
    tracker: Option<TrackerConfigFile>,
    #[serde(default)]
    cameras: Vec<CameraConfigFile>,
    priority: Option<RuleBook>,
    #[serde(default)]
    actions: Vec<ActionRule>,
    home_assistant: Option<HomeAssistantConfigFile>,
    pushover: Option<PushoverConfigFile>,
    sounds: Option<SoundsConfigFile>,
    #[serde(default)]
    colors: BTreeMap<String, String>,
    mqtt: Option<MqttConfigFile>,
    plates: Option<PlatesConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    threshold: Option<f32>,
    sticky_threshold: Option<f32>,
    thresholds: Option<BTreeMap<String, f32>>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelsConfigFile {
    color: Option<ModelConfigFile>,
    grey: Option<ModelConfigFile>,
    vehicle: Option<ModelConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    path: Option<String>,
    labels: Option<Vec<String>>,
    width: Option<u32>,
    height: Option<u32>,
    channels: Option<u32>,
    prob_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct SchedulerConfigFile {
    batch_timeout_secs: Option<u64>,
    idle_sleep_ms: Option<u64>,
    quiet_window_secs: Option<u64>,
    sync: Option<bool>,
    once: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackerConfigFile {
    expiry_secs: Option<u64>,
    warmup_cycles: Option<u64>,
    departure_min_age: Option<u32>,
    departure_min_lifetime_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    name: String,
    display_name: Option<String>,
    url: Option<String>,
    user: Option<String>,
    password: Option<String>,
    timeout_secs: Option<u64>,
    file: Option<String>,
    drop_folder: Option<PathBuf>,
    interval_secs: Option<u64>,
    concurrent: Option<bool>,
    vehicle_check: Option<bool>,
    ignore_all: Option<bool>,
    message: Option<String>,
    reboot_after_failures: Option<u32>,
    road: Option<RoadLine>,
    #[serde(default)]
    zones: Vec<ZoneRule>,
}

#[derive(Debug, Deserialize, Default)]
struct HomeAssistantConfigFile {
    url: Option<String>,
    token: Option<String>,
    timeout_secs: Option<u64>,
    night_entity: Option<String>,
    presence_entity: Option<String>,
    #[serde(default)]
    gates: BTreeMap<String, String>,
    vacation_entity: Option<String>,
    on_unreachable: Option<UnreachablePolicy>,
    fallback_mode: Option<Mode>,
}

#[derive(Debug, Deserialize, Default)]
struct PushoverConfigFile {
    token: Option<String>,
    user: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SoundsConfigFile {
    default: Option<String>,
    departed: Option<String>,
    #[serde(default)]
    classes: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    discovery_prefix: Option<String>,
    counted_classes: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct PlatesConfigFile {
    url: Option<String>,
    book: Option<PathBuf>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct AicamConfig {
    pub save_path: PathBuf,
    pub excludes_path: Option<PathBuf>,
    pub thresholds: Thresholds,
    pub models: ModelsSettings,
    pub scheduler: SchedulerSettings,
    pub pipeline: PipelineSettings,
    pub cameras: Vec<CameraSettings>,
    pub priority: RuleBook,
    pub actions: Vec<ActionRule>,
    /// Mode used when no home automation is configured.
    pub mode: Mode,
    pub home_assistant: Option<HomeAssistantConfig>,
    pub pushover: Option<PushoverSettings>,
    pub sounds: Sounds,
    pub colors: BTreeMap<String, String>,
    pub mqtt: Option<MqttSettings>,
    pub plates: Option<PlatesSettings>,
}

#[derive(Debug, Clone)]
pub struct HomeAssistantConfig {
    pub settings: HomeAssistantSettings,
    pub on_unreachable: UnreachablePolicy,
    pub fallback_mode: Mode,
}

#[derive(Debug, Clone)]
pub struct PushoverSettings {
    pub token: String,
    pub user: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PlatesSettings {
    pub url: String,
    pub book: PathBuf,
    pub timeout: Duration,
}

impl AicamConfig {
    /// Load `path`, or the file named by `AICAM_CONFIG`, then apply env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => std::env::var("AICAM_CONFIG")
                .ok()
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from)
                .ok_or_else(|| anyhow!("no config file given and AICAM_CONFIG is not set"))?,
        };
        let file_cfg = read_config_file(&path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let mut cfg = Self::from_file(file_cfg, base)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: AicamConfigFile, base: &Path) -> Result<Self> {
        let save_path = file
            .save_path
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SAVE_PATH));

        let detector = file.detector.unwrap_or_default();
        let mut thresholds = Thresholds::new(detector.threshold.unwrap_or(DEFAULT_THRESHOLD));
        thresholds.sticky = detector.sticky_threshold.unwrap_or(DEFAULT_STICKY_THRESHOLD);
        thresholds.per_class = detector.thresholds.unwrap_or_default();

        let models = file.models.unwrap_or_default();
        let models = ModelsSettings {
            color: model_settings("color", models.color.unwrap_or_default()),
            grey: model_settings("grey", models.grey.unwrap_or_default()),
            vehicle: models.vehicle.map(|m| model_settings("vehicle", m)),
        };

        let sched = file.scheduler.unwrap_or_default();
        let scheduler = SchedulerSettings {
            batch_timeout: sched
                .batch_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_BATCH_TIMEOUT),
            idle_sleep: sched
                .idle_sleep_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_IDLE_SLEEP),
            quiet_window: sched
                .quiet_window_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_QUIET_WINDOW),
            busy_threshold: DEFAULT_BUSY_THRESHOLD,
            sync: sched.sync.unwrap_or(false),
            once: sched.once.unwrap_or(false),
        };

        let tracker = file.tracker.unwrap_or_default();
        let counted_classes = file
            .mqtt
            .as_ref()
            .and_then(|m| m.counted_classes.clone())
            .unwrap_or_else(|| DEFAULT_COUNTED_CLASSES.iter().map(|c| c.to_string()).collect());
        let pipeline = PipelineSettings {
            track_expiry: tracker
                .expiry_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_TRACK_EXPIRY),
            warmup_cycles: tracker.warmup_cycles.unwrap_or(DEFAULT_WARMUP_CYCLES),
            departure_min_age: tracker.departure_min_age.unwrap_or(DEFAULT_DEPARTURE_MIN_AGE),
            departure_min_lifetime: tracker
                .departure_min_lifetime_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_DEPARTURE_MIN_LIFETIME),
            counted_classes,
        };

        let excludes_path = file.excludes.map(|p| resolve(base, &p));
        let mut excludes = match &excludes_path {
            Some(path) => ExclusionSet::load_file(path)
                .with_context(|| format!("invalid excludes file {}", path.display()))?,
            None => BTreeMap::new(),
        };

        let cameras = file
            .cameras
            .into_iter()
            .map(|cam| {
                let set = excludes.remove(&cam.name).unwrap_or_default();
                camera_settings(cam, set, base)
            })
            .collect();
        for unused in excludes.keys() {
            log::warn!("excludes file names unknown camera {}", unused);
        }

        let priority = file
            .priority
            .ok_or_else(|| anyhow!("config is missing the [priority] table"))?;

        let home_assistant = file.home_assistant.map(|ha| HomeAssistantConfig {
            settings: HomeAssistantSettings {
                url: ha.url.unwrap_or_default(),
                token: ha.token.unwrap_or_default(),
                timeout: Duration::from_secs(ha.timeout_secs.unwrap_or(DEFAULT_HA_TIMEOUT_SECS)),
                night_entity: ha
                    .night_entity
                    .unwrap_or_else(|| DEFAULT_NIGHT_ENTITY.to_string()),
                presence_entity: ha
                    .presence_entity
                    .unwrap_or_else(|| DEFAULT_PRESENCE_ENTITY.to_string()),
                gates: ha.gates,
                vacation_entity: ha.vacation_entity,
            },
            on_unreachable: ha.on_unreachable.unwrap_or_default(),
            fallback_mode: ha.fallback_mode.unwrap_or(Mode::Home),
        });

        let pushover = file.pushover.map(|p| PushoverSettings {
            token: p.token.unwrap_or_default(),
            user: p.user.unwrap_or_default(),
            timeout: Duration::from_secs(p.timeout_secs.unwrap_or(DEFAULT_PUSHOVER_TIMEOUT_SECS)),
        });

        let sounds = file.sounds.unwrap_or_default();
        let sounds = Sounds {
            default: sounds.default.unwrap_or_else(|| DEFAULT_SOUND.to_string()),
            departed: sounds.departed.unwrap_or_else(|| DEFAULT_SOUND.to_string()),
            per_class: sounds.classes,
        };

        let mqtt = match &file.mqtt {
            Some(m) => match m.broker.as_deref() {
                Some(broker) => Some(mqtt_settings(broker, m)?),
                None => None,
            },
            None => None,
        };

        let plates = match file.plates {
            Some(p) => {
                let url = p
                    .url
                    .ok_or_else(|| anyhow!("[plates] needs the plate reader url"))?;
                let book = p
                    .book
                    .map(|b| resolve(base, &b))
                    .ok_or_else(|| anyhow!("[plates] needs the plate book path"))?;
                Some(PlatesSettings {
                    url,
                    book,
                    timeout: Duration::from_secs(p.timeout_secs.unwrap_or(DEFAULT_ALPR_TIMEOUT_SECS)),
                })
            }
            None => None,
        };

        Ok(Self {
            save_path,
            excludes_path,
            thresholds,
            models,
            scheduler,
            pipeline,
            cameras,
            priority,
            actions: file.actions,
            mode: file.mode.unwrap_or(Mode::Home),
            home_assistant,
            pushover,
            sounds,
            colors: file.colors,
            mqtt,
            plates,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("AICAM_SAVE_PATH") {
            if !path.trim().is_empty() {
                self.save_path = PathBuf::from(path);
            }
        }
        if let Ok(threshold) = std::env::var("AICAM_THRESHOLD") {
            self.thresholds.default = threshold
                .trim()
                .parse()
                .map_err(|_| anyhow!("AICAM_THRESHOLD must be a number between 0 and 1"))?;
        }
        if let Ok(secs) = std::env::var("AICAM_BATCH_TIMEOUT_SECS") {
            let secs: u64 = secs.trim().parse().map_err(|_| {
                anyhow!("AICAM_BATCH_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.scheduler.batch_timeout = Duration::from_secs(secs);
        }
        if let Ok(broker) = std::env::var("AICAM_MQTT_BROKER") {
            if !broker.trim().is_empty() {
                let (host, port) = parse_broker(&broker)?;
                match &mut self.mqtt {
                    Some(mqtt) => {
                        mqtt.host = host;
                        mqtt.port = port;
                    }
                    None => {
                        self.mqtt = Some(mqtt_settings(&broker, &MqttConfigFile::default())?);
                    }
                }
            }
        }
        if let Ok(token) = std::env::var("AICAM_HA_TOKEN") {
            if !token.trim().is_empty() {
                match &mut self.home_assistant {
                    Some(ha) => ha.settings.token = token,
                    None => log::warn!("AICAM_HA_TOKEN set but [home_assistant] is not configured"),
                }
            }
        }
        let token = std::env::var("AICAM_PUSHOVER_TOKEN").ok().filter(|t| !t.trim().is_empty());
        let user = std::env::var("AICAM_PUSHOVER_USER").ok().filter(|u| !u.trim().is_empty());
        if token.is_some() || user.is_some() {
            let pushover = self.pushover.get_or_insert_with(|| PushoverSettings {
                token: String::new(),
                user: String::new(),
                timeout: Duration::from_secs(DEFAULT_PUSHOVER_TIMEOUT_SECS),
            });
            if let Some(token) = token {
                pushover.token = token;
            }
            if let Some(user) = user {
                pushover.user = user;
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.thresholds.default) {
            bail!("detector threshold must be between 0 and 1");
        }
        if self.cameras.is_empty() {
            bail!("no cameras configured");
        }
        let mut names = BTreeSet::new();
        for cam in &self.cameras {
            if !names.insert(cam.name.clone()) {
                bail!("duplicate camera name {}", cam.name);
            }
            if cam.interval.is_zero() {
                bail!("camera {} has a zero interval", cam.name);
            }
            if cam.http.is_none() && cam.file.is_none() && cam.drop_folder.is_none() {
                bail!("camera {} needs a url, a file or a drop folder", cam.name);
            }
            if let Some(road) = &cam.filter.road {
                road.validate()
                    .with_context(|| format!("camera {} road line", cam.name))?;
            }
        }
        self.priority.validate(&names)?;

        let mut action_names = BTreeSet::new();
        for action in &self.actions {
            if !action_names.insert(action.name.as_str()) {
                bail!("duplicate action name {}", action.name);
            }
            if let Some(unknown) = action.cameras.iter().find(|c| !names.contains(*c)) {
                bail!("action {} names unknown camera {}", action.name, unknown);
            }
        }
        if self.scheduler.batch_timeout.is_zero() {
            bail!("scheduler batch timeout must be greater than zero");
        }
        if let Some(pushover) = &self.pushover {
            if pushover.token.is_empty() || pushover.user.is_empty() {
                bail!("pushover needs both a token and a user key");
            }
        }
        if let Some(ha) = &self.home_assistant {
            if ha.settings.url.is_empty() {
                bail!("[home_assistant] needs a url");
            }
        }
        Ok(())
    }

    pub fn camera(&self, name: &str) -> Option<&CameraSettings> {
        self.cameras.iter().find(|c| c.name == name)
    }
}

fn model_settings(name: &str, file: ModelConfigFile) -> ModelSettings {
    ModelSettings {
        name: name.to_string(),
        path: file.path.unwrap_or_else(|| format!("stub://{}", name)),
        labels: file.labels.unwrap_or_default(),
        width: file.width.unwrap_or(DEFAULT_MODEL_SIZE),
        height: file.height.unwrap_or(DEFAULT_MODEL_SIZE),
        channels: file.channels.unwrap_or(DEFAULT_MODEL_CHANNELS),
        prob_threshold: file.prob_threshold.unwrap_or(DEFAULT_MODEL_PROB),
    }
}

fn camera_settings(file: CameraConfigFile, excludes: ExclusionSet, base: &Path) -> CameraSettings {
    let mut cam = CameraSettings::new(file.name);
    if let Some(display) = file.display_name {
        cam.display_name = display;
    }
    cam.http = file.url.map(|url| HttpConfig {
        url,
        user: file.user,
        password: file.password,
        timeout: Duration::from_secs(file.timeout_secs.unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS)),
    });
    cam.file = file.file;
    cam.drop_folder = file.drop_folder.map(|p| DropFolder::new(resolve(base, &p)));
    cam.interval = file
        .interval_secs
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_INTERVAL);
    cam.concurrent = file.concurrent.unwrap_or(false);
    cam.vehicle_check = file.vehicle_check.unwrap_or(false);
    cam.message = file.message;
    cam.reboot_after_failures = file
        .reboot_after_failures
        .unwrap_or(DEFAULT_REBOOT_AFTER_FAILURES);
    cam.filter = SpatialFilter {
        ignore_all: file.ignore_all.unwrap_or(false),
        road: file.road,
        zones: file.zones,
        excludes,
    };
    cam
}

fn mqtt_settings(broker: &str, file: &MqttConfigFile) -> Result<MqttSettings> {
    let (host, port) = parse_broker(broker)?;
    Ok(MqttSettings {
        host,
        port,
        client_id: file
            .client_id
            .clone()
            .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
        username: file.username.clone(),
        password: file.password.clone(),
        discovery_prefix: file
            .discovery_prefix
            .clone()
            .unwrap_or_else(|| DEFAULT_DISCOVERY_PREFIX.to_string()),
    })
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn read_config_file(path: &Path) -> Result<AicamConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
