use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::TempDir;

use aicam::config::AicamConfig;
use aicam::filter::RoadPolicy;
use aicam::home::{Mode, UnreachablePolicy};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "AICAM_CONFIG",
        "AICAM_SAVE_PATH",
        "AICAM_THRESHOLD",
        "AICAM_BATCH_TIMEOUT_SECS",
        "AICAM_MQTT_BROKER",
        "AICAM_HA_TOKEN",
        "AICAM_PUSHOVER_TOKEN",
        "AICAM_PUSHOVER_USER",
    ] {
        std::env::remove_var(key);
    }
}

const BASE: &str = r#"
save_path = "/srv/aicam"
excludes = "excludes.json"

[detector]
threshold = 0.55

[detector.thresholds]
cat = 0.7

[scheduler]
batch_timeout_secs = 90

[tracker]
expiry_secs = 120
warmup_cycles = 3

[[cameras]]
name = "driveway"
url = "http://driveway.home/cgi-bin/snapshot.cgi"
user = "admin"
password = "secret"
concurrent = true
vehicle_check = true
interval_secs = 10
road = { points = [{ x = 0.0, y = 0.31 }, { x = 0.651, y = 0.348 }, { x = 1.0, y = 0.479 }] }

[[cameras]]
name = "front entry"
drop_folder = "ftp/front"
message = "{objects} at the {camera}"
zones = [{ reason = "in grass", classes = ["package"], max_center_x = 0.178125 }]

[priority.classes]
person = 1
vehicle = 0

[priority.modes.night]
person = 2

[[priority.rules]]
name = "garage cat"
cameras = ["driveway"]
classes = ["cat"]
priority = -3

[home_assistant]
url = "http://homeassistant.home:8123/api"
on_unreachable = "restrictive"
fallback_mode = "away"
vacation_entity = "input_boolean.vacation_mode"

[mqtt]
broker = "mqtt.home"
client_id = "garage-aicam"
counted_classes = ["vehicle", "deer"]
"#;

const EXCLUDES: &str = r#"{
    "driveway": {
        "vehicle": [{"left": 0.1, "top": 0.1, "width": 0.2, "height": 0.2, "comment": "parked"}]
    }
}"#;

fn write_config(dir: &TempDir, name: &str, body: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).expect("create config");
    file.write_all(body.as_bytes()).expect("write config");
    std::fs::write(dir.path().join("excludes.json"), EXCLUDES).expect("write excludes");
    path
}

#[test]
fn loads_toml_with_defaults_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "aicam.toml", BASE);

    std::env::set_var("AICAM_THRESHOLD", "0.65");
    std::env::set_var("AICAM_BATCH_TIMEOUT_SECS", "30");
    std::env::set_var("AICAM_HA_TOKEN", "long-lived-token");
    std::env::set_var("AICAM_PUSHOVER_TOKEN", "app");
    std::env::set_var("AICAM_PUSHOVER_USER", "user");

    let cfg = AicamConfig::load(Some(&path)).expect("load config");

    assert_eq!(cfg.save_path, std::path::PathBuf::from("/srv/aicam"));
    assert!((cfg.thresholds.default - 0.65).abs() < f32::EPSILON);
    assert!((cfg.thresholds.for_class("cat") - 0.7).abs() < f32::EPSILON);
    assert_eq!(cfg.scheduler.batch_timeout, Duration::from_secs(30));
    assert_eq!(cfg.pipeline.track_expiry, Duration::from_secs(120));
    assert_eq!(cfg.pipeline.warmup_cycles, 3);

    let driveway = cfg.camera("driveway").expect("driveway");
    assert!(driveway.concurrent);
    assert!(driveway.vehicle_check);
    assert_eq!(driveway.interval, Duration::from_secs(10));
    assert_eq!(driveway.http.as_ref().unwrap().user.as_deref(), Some("admin"));
    assert_eq!(driveway.filter.road.as_ref().unwrap().policy, RoadPolicy::Ignore);
    assert!(!driveway.filter.excludes.is_empty());

    let front = cfg.camera("front entry").expect("front entry");
    assert!(!front.concurrent);
    assert_eq!(
        front.drop_folder.as_ref().unwrap().root(),
        dir.path().join("ftp/front")
    );
    assert_eq!(front.filter.zones[0].reason, "in grass");
    assert!(front.filter.excludes.is_empty());

    let ha = cfg.home_assistant.as_ref().expect("home assistant");
    assert_eq!(ha.settings.token, "long-lived-token");
    assert_eq!(ha.on_unreachable, UnreachablePolicy::Restrictive);
    assert_eq!(ha.fallback_mode, Mode::Away);
    assert_eq!(
        ha.settings.vacation_entity.as_deref(),
        Some("input_boolean.vacation_mode")
    );

    let pushover = cfg.pushover.as_ref().expect("pushover from env");
    assert_eq!((pushover.token.as_str(), pushover.user.as_str()), ("app", "user"));

    let mqtt = cfg.mqtt.as_ref().expect("mqtt");
    assert_eq!((mqtt.host.as_str(), mqtt.port), ("mqtt.home", 1883));
    assert_eq!(mqtt.client_id, "garage-aicam");
    assert_eq!(cfg.pipeline.counted_classes, vec!["vehicle".to_string(), "deer".to_string()]);
    assert_eq!(cfg.priority.modes[&Mode::Night]["person"], 2);

    clear_env();
}

#[test]
fn config_path_comes_from_env_and_json_is_accepted() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    let dir = TempDir::new().unwrap();
    let json = r#"{
        "cameras": [{"name": "deck", "file": "stub://deck"}],
        "priority": {"classes": {"dog": 1}}
    }"#;
    let path = write_config(&dir, "aicam.json", json);
    std::env::set_var("AICAM_CONFIG", &path);
    std::env::set_var("AICAM_MQTT_BROKER", "mqtt://broker.lan:1884");

    let cfg = AicamConfig::load(None).expect("load json config");
    assert_eq!(cfg.cameras.len(), 1);
    assert_eq!(cfg.cameras[0].file.as_deref(), Some("stub://deck"));
    assert_eq!(cfg.mode, Mode::Home);
    assert_eq!(cfg.scheduler.batch_timeout, Duration::from_secs(180));
    let mqtt = cfg.mqtt.as_ref().expect("mqtt from env");
    assert_eq!((mqtt.host.as_str(), mqtt.port), ("broker.lan", 1884));

    clear_env();
}

fn load_err(body: &str) -> String {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "aicam.toml", body);
    format!("{:#}", AicamConfig::load(Some(&path)).unwrap_err())
}

#[test]
fn rejects_missing_priority_table() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    let err = load_err(
        r#"
        [[cameras]]
        name = "deck"
        file = "stub://deck"
        "#,
    );
    assert!(err.contains("priority"), "{}", err);
}

#[test]
fn rejects_unknown_camera_in_rule() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    let err = load_err(
        r#"
        [[cameras]]
        name = "deck"
        file = "stub://deck"

        [[priority.rules]]
        name = "porch people"
        cameras = ["porch"]
        priority = 1
        "#,
    );
    assert!(err.contains("porch"), "{}", err);
}

#[test]
fn rejects_duplicate_names_and_zero_interval() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    let dup = load_err(
        r#"
        [[cameras]]
        name = "deck"
        file = "stub://deck"

        [[cameras]]
        name = "deck"
        file = "stub://deck2"

        [priority]
        "#,
    );
    assert!(dup.contains("duplicate camera name deck"), "{}", dup);

    let zero = load_err(
        r#"
        [[cameras]]
        name = "deck"
        file = "stub://deck"
        interval_secs = 0

        [priority]
        "#,
    );
    assert!(zero.contains("zero interval"), "{}", zero);
}

#[test]
fn rejects_unsorted_road_line() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    let err = load_err(
        r#"
        [[cameras]]
        name = "driveway"
        file = "stub://driveway"
        road = { points = [{ x = 0.7, y = 0.3 }, { x = 0.2, y = 0.35 }] }

        [priority]
        "#,
    );
    assert!(err.contains("sorted"), "{}", err);
}

#[test]
fn rejects_invalid_excludes_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("aicam.toml");
    std::fs::write(
        &path,
        r#"
        excludes = "excludes.json"

        [[cameras]]
        name = "deck"
        file = "stub://deck"

        [priority]
        "#,
    )
    .unwrap();
    std::fs::write(dir.path().join("excludes.json"), "{ not json").unwrap();
    let err = format!("{:#}", AicamConfig::load(Some(&path)).unwrap_err());
    assert!(err.contains("excludes"), "{}", err);
}
