//! Home-automation collaborator.
//!
//! The pipeline asks the house for the current mode, whether a class is
//! currently allowed to notify (a "gate") and whether the household is away on
//! vacation, and asks it to fire one-shot actions. `CachedHome` wraps the real backend with last-known answers and an
//! explicit policy for when the backend cannot be reached.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Home,
    Night,
    Away,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::Home => "home",
            Mode::Night => "night",
            Mode::Away => "away",
        };
        f.write_str(s)
    }
}

/// What to assume for a gate or the vacation switch when the backend is down
/// and nothing is cached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnreachablePolicy {
    /// Gates open and not on vacation: notify.
    #[default]
    Permissive,
    /// Gates closed and on vacation: suppress.
    Restrictive,
}

/// One-shot service call, e.g. a script or scene.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ActionRequest {
    #[serde(skip)]
    pub name: String,
    /// Service path such as `script/turn_on`.
    #[serde(skip)]
    pub service: String,
    pub entity_id: String,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub variables: serde_json::Value,
    #[serde(skip)]
    pub cooldown: Option<Duration>,
}

pub trait HomeAutomation: Send + Sync {
    fn current_mode(&self) -> Result<Mode>;
    fn should_notify(&self, class: &str) -> Result<bool>;
    /// While on vacation no notification is pushed at all.
    fn vacation_mode(&self) -> Result<bool>;
    fn trigger(&self, action: &ActionRequest) -> Result<()>;
}

/// Fixed answers, used when no home-automation backend is configured.
pub struct StaticHome {
    mode: Mode,
}

impl StaticHome {
    pub fn new(mode: Mode) -> Self {
        Self { mode }
    }
}

impl HomeAutomation for StaticHome {
    fn current_mode(&self) -> Result<Mode> {
        Ok(self.mode)
    }

    fn should_notify(&self, _class: &str) -> Result<bool> {
        Ok(true)
    }

    fn vacation_mode(&self) -> Result<bool> {
        Ok(false)
    }

    fn trigger(&self, action: &ActionRequest) -> Result<()> {
        log::info!("no home automation configured, skipping action {}", action.name);
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct HomeAssistantSettings {
    /// API root, e.g. `http://homeassistant.home:8123/api/`.
    pub url: String,
    pub token: String,
    pub timeout: Duration,
    pub night_entity: String,
    pub presence_entity: String,
    /// Class to the `input_boolean` that enables its notifications.
    pub gates: BTreeMap<String, String>,
    /// `input_boolean` that silences all notifications while it is on.
    pub vacation_entity: Option<String>,
}

/// Home Assistant REST API.
pub struct HomeAssistant {
    settings: HomeAssistantSettings,
    agent: ureq::Agent,
}

#[derive(Deserialize)]
struct EntityState {
    state: String,
}

impl HomeAssistant {
    pub fn new(mut settings: HomeAssistantSettings) -> Self {
        if !settings.url.ends_with('/') {
            settings.url.push('/');
        }
        let agent = ureq::AgentBuilder::new().timeout(settings.timeout).build();
        Self { settings, agent }
    }

    fn state(&self, entity: &str) -> Result<String> {
        let url = format!("{}states/{}", self.settings.url, entity);
        let state: EntityState = self
            .agent
            .get(&url)
            .set("Authorization", &format!("Bearer {}", self.settings.token))
            .call()
            .with_context(|| format!("query home assistant entity {}", entity))?
            .into_json()
            .with_context(|| format!("invalid state for entity {}", entity))?;
        Ok(state.state)
    }

    fn is_on(&self, entity: &str) -> Result<bool> {
        Ok(self.state(entity)? == "on")
    }
}

impl HomeAutomation for HomeAssistant {
    fn current_mode(&self) -> Result<Mode> {
        if self.is_on(&self.settings.night_entity)? {
            return Ok(Mode::Night);
        }
        if self.state(&self.settings.presence_entity)? == "home" {
            return Ok(Mode::Home);
        }
        Ok(Mode::Away)
    }

    fn should_notify(&self, class: &str) -> Result<bool> {
        match self.settings.gates.get(class) {
            Some(entity) => self.is_on(entity),
            None => Ok(true),
        }
    }

    fn vacation_mode(&self) -> Result<bool> {
        match &self.settings.vacation_entity {
            Some(entity) => self.is_on(entity),
            None => Ok(false),
        }
    }

    fn trigger(&self, action: &ActionRequest) -> Result<()> {
        let url = format!("{}services/{}", self.settings.url, action.service);
        let response = self
            .agent
            .post(&url)
            .set("Authorization", &format!("Bearer {}", self.settings.token))
            .send_json(action)
            .with_context(|| format!("trigger action {}", action.name))?;
        log::info!("triggered {} status={}", action.name, response.status());
        Ok(())
    }
}

#[derive(Default)]
struct HomeCache {
    mode: Option<Mode>,
    gates: BTreeMap<String, bool>,
    vacation: Option<bool>,
    fired: BTreeMap<String, Instant>,
}

/// Last-known answers plus the unreachable policy.
pub struct CachedHome {
    inner: Box<dyn HomeAutomation>,
    policy: UnreachablePolicy,
    fallback_mode: Mode,
    cache: Mutex<HomeCache>,
}

impl CachedHome {
    pub fn new(inner: Box<dyn HomeAutomation>, policy: UnreachablePolicy, fallback_mode: Mode) -> Self {
        Self {
            inner,
            policy,
            fallback_mode,
            cache: Mutex::new(HomeCache::default()),
        }
    }

    fn cache(&self) -> Result<std::sync::MutexGuard<'_, HomeCache>> {
        self.cache.lock().map_err(|_| anyhow!("home cache lock poisoned"))
    }

    /// Gates currently closed for `classes`.
    pub fn closed_gates<'a>(&self, classes: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
        classes
            .into_iter()
            .filter(|class| !self.should_notify(class).unwrap_or(true))
            .map(str::to_string)
            .collect()
    }
}

impl HomeAutomation for CachedHome {
    fn current_mode(&self) -> Result<Mode> {
        match self.inner.current_mode() {
            Ok(mode) => {
                self.cache()?.mode = Some(mode);
                Ok(mode)
            }
            Err(err) => {
                let cached = self.cache()?.mode;
                let mode = cached.unwrap_or(self.fallback_mode);
                log::warn!("home automation unreachable ({:#}), using mode {}", err, mode);
                Ok(mode)
            }
        }
    }

    fn should_notify(&self, class: &str) -> Result<bool> {
        match self.inner.should_notify(class) {
            Ok(open) => {
                self.cache()?.gates.insert(class.to_string(), open);
                Ok(open)
            }
            Err(err) => {
                let cached = self.cache()?.gates.get(class).copied();
                let open = cached.unwrap_or(self.policy == UnreachablePolicy::Permissive);
                log::warn!("gate for {} unreachable ({:#}), assuming open={}", class, err, open);
                Ok(open)
            }
        }
    }

    fn vacation_mode(&self) -> Result<bool> {
        match self.inner.vacation_mode() {
            Ok(away) => {
                self.cache()?.vacation = Some(away);
                Ok(away)
            }
            Err(err) => {
                let cached = self.cache()?.vacation;
                let away = cached.unwrap_or(self.policy == UnreachablePolicy::Restrictive);
                log::warn!("vacation mode unreachable ({:#}), assuming vacation={}", err, away);
                Ok(away)
            }
        }
    }

    fn trigger(&self, action: &ActionRequest) -> Result<()> {
        let now = Instant::now();
        if let Some(cooldown) = action.cooldown {
            if let Some(last) = self.cache()?.fired.get(&action.name) {
                if now.duration_since(*last) < cooldown {
                    log::debug!("action {} still cooling down", action.name);
                    return Ok(());
                }
            }
        }
        self.inner.trigger(action)?;
        self.cache()?.fired.insert(action.name.clone(), now);
        Ok(())
    }
}

/// When an [`ActionRule`] fires.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionWhen {
    /// Every cycle the class is present. Targets must be idempotent.
    #[default]
    Present,
    /// Only when the class newly arrives.
    New,
    /// Only when named explicitly, e.g. from a plate record.
    Manual,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ActionRule {
    pub name: String,
    #[serde(default)]
    pub when: ActionWhen,
    #[serde(default)]
    pub cameras: Vec<String>,
    #[serde(default)]
    pub classes: Vec<String>,
    pub service: String,
    pub entity_id: String,
    /// Added to `variables` as `location` with the camera name.
    #[serde(default)]
    pub pass_location: bool,
    pub cooldown_secs: Option<u64>,
}

impl ActionRule {
    pub fn request(&self, camera: &str) -> ActionRequest {
        let variables = if self.pass_location {
            serde_json::json!({ "location": camera })
        } else {
            serde_json::Value::Null
        };
        ActionRequest {
            name: self.name.clone(),
            service: self.service.clone(),
            entity_id: self.entity_id.clone(),
            variables,
            cooldown: self.cooldown_secs.map(Duration::from_secs),
        }
    }

    fn applies(&self, camera: &str, classes: &BTreeSet<String>) -> bool {
        (self.cameras.is_empty() || self.cameras.iter().any(|c| c == camera))
            && self.classes.iter().any(|c| classes.contains(c))
    }
}

/// Configured actions, fired after filtering and tracking.
#[derive(Clone, Debug, Default)]
pub struct ActionBook {
    rules: Vec<ActionRule>,
}

impl ActionBook {
    pub fn new(rules: Vec<ActionRule>) -> Self {
        Self { rules }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.name.as_str())
    }

    /// Fire every rule whose classes are present (or new). Errors are logged.
    pub fn fire(
        &self,
        home: &dyn HomeAutomation,
        camera: &str,
        present: &BTreeSet<String>,
        new: &BTreeSet<String>,
    ) -> usize {
        let mut fired = 0;
        for rule in &self.rules {
            let classes = match rule.when {
                ActionWhen::Present => present,
                ActionWhen::New => new,
                ActionWhen::Manual => continue,
            };
            if rule.applies(camera, classes) {
                if let Err(err) = home.trigger(&rule.request(camera)) {
                    log::warn!("{} action {} failed: {:#}", camera, rule.name, err);
                } else {
                    fired += 1;
                }
            }
        }
        fired
    }

    /// Fire one action by name regardless of its trigger.
    pub fn fire_named(&self, home: &dyn HomeAutomation, name: &str, camera: &str) -> Result<()> {
        let rule = self
            .rules
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| anyhow!("unknown action {}", name))?;
        home.trigger(&rule.request(camera))
    }
}
