use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::PathBuf, sync::RwLock, time::Duration};

use crate::session::{CameraId, PollCadence};

pub const SETTINGS_PATH_ENV: &str = "VIDWATCH_SETTINGS";
pub const API_URL_ENV: &str = "VIDWATCH_API_URL";
pub const DEFAULT_SETTINGS_FILE: &str = "vidwatch.json";

/// Out-of-range periods from a hand-edited file are pulled back into range
/// rather than handed to the timers.
fn clamped_cadence(section: &str, frame_ms: u64, report_ms: u64) -> PollCadence {
    let requested = PollCadence::new(Duration::from_millis(frame_ms), Duration::from_millis(report_ms));
    let cadence = requested.clamped();
    if cadence != requested {
        warn!(
            "Adjusted {} cadence from {:?}/{:?} to {:?}/{:?}",
            section, requested.frame, requested.report, cadence.frame, cadence.report
        );
    }
    cadence
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveSettings {
    /// Camera index or stream URL handed to the backend on start.
    pub source: String,
    pub frame_every_ms: u64,
    pub report_every_ms: u64,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            source: "0".into(),
            frame_every_ms: 1000,
            report_every_ms: 5000,
        }
    }
}

impl LiveSettings {
    pub fn cadence(&self) -> PollCadence {
        clamped_cadence("live", self.frame_every_ms, self.report_every_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurveillanceSettings {
    pub cameras: BTreeMap<u8, String>,
    pub frame_every_ms: u64,
    pub report_every_ms: u64,
}

impl Default for SurveillanceSettings {
    fn default() -> Self {
        Self {
            cameras: (1..=3).map(|id| (id, String::new())).collect(),
            frame_every_ms: 2000,
            report_every_ms: 10_000,
        }
    }
}

impl SurveillanceSettings {
    pub fn cadence(&self) -> PollCadence {
        clamped_cadence("surveillance", self.frame_every_ms, self.report_every_ms)
    }

    pub fn feeds(&self) -> impl Iterator<Item = (CameraId, String)> + '_ {
        self.cameras
            .iter()
            .map(|(id, url)| (CameraId(*id), url.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub api_base_url: String,
    pub request_timeout_ms: u64,
    pub stop_timeout_ms: u64,
    pub live: LiveSettings,
    pub surveillance: SurveillanceSettings,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:5000/api".into(),
            request_timeout_ms: 30_000,
            stop_timeout_ms: 5000,
            live: LiveSettings::default(),
            surveillance: SurveillanceSettings::default(),
        }
    }
}

impl MonitorSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<MonitorSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!(
                    "Ignoring malformed settings in {}: {}; using defaults",
                    path.display(),
                    err
                );
                MonitorSettings::default()
            })
        } else {
            MonitorSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    /// Loads from `VIDWATCH_SETTINGS` (or `./vidwatch.json`) and applies the
    /// environment overrides on top.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var_os(SETTINGS_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_FILE));
        let store = Self::new(path)?;
        if let Ok(url) = std::env::var(API_URL_ENV) {
            store.override_api_url(url);
        }
        Ok(store)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn settings(&self) -> MonitorSettings {
        self.read().clone()
    }

    pub fn override_api_url(&self, url: impl Into<String>) {
        let url = url.into();
        if url.trim().is_empty() {
            return;
        }
        self.write().api_base_url = url;
    }

    pub fn update_camera(&self, camera: CameraId, url: impl Into<String>) -> Result<()> {
        let mut guard = self.write();
        guard.surveillance.cameras.insert(camera.0, url.into());
        self.persist(&guard)
    }

    pub fn update_live_source(&self, source: impl Into<String>) -> Result<()> {
        let mut guard = self.write();
        guard.live.source = source.into();
        self.persist(&guard)
    }

    fn persist(&self, data: &MonitorSettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }

    pub fn reload(&self) -> Result<()> {
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read settings from {}", self.path.display()))?;
        let data: MonitorSettings = serde_json::from_str(&contents)
            .with_context(|| format!("Malformed settings in {}", self.path.display()))?;
        *self.write() = data;
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MonitorSettings> {
        self.data
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MonitorSettings> {
        self.data
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
