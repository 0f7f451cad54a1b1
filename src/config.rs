//! Configuration for the ei core.

use chrono::NaiveTime;
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Ei configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for checkpoints and local state.
    pub data_dir: PathBuf,
    /// Request queue settings.
    pub queue: QueueSettings,
    /// Conversational context settings.
    pub context: ContextSettings,
    /// Extraction thresholds.
    pub extraction: ExtractionSettings,
    /// Heartbeat settings.
    pub heartbeat: HeartbeatSettings,
    /// Daily ceremony settings.
    pub ceremony: CeremonySettings,
    /// Checkpoint settings.
    pub checkpoint: CheckpointSettings,
    /// Remote sync. `None` means sync is not configured.
    pub sync: Option<SyncSettings>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")).join("ei");

        Self {
            data_dir,
            queue: QueueSettings::default(),
            context: ContextSettings::default(),
            extraction: ExtractionSettings::default(),
            heartbeat: HeartbeatSettings::default(),
            ceremony: CeremonySettings::default(),
            checkpoint: CheckpointSettings::default(),
            sync: None,
        }
    }
}

impl Config {
    /// Load configuration with fallback chain.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try primary location: ~/.config/ei/ei.yml
        if let Some(config_dir) = dirs::config_dir() {
            let primary_config = config_dir.join("ei").join("ei.yml");
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./ei.yml
        let fallback_config = PathBuf::from("ei.yml");
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Directory holding checkpoint slot files.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }
}

/// Request queue settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Attempts after which a failing item is dropped. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// How long the run loop sleeps when there is nothing to do.
    #[serde(with = "humantime_serde")]
    pub idle_poll: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: None,
            idle_poll: Duration::from_millis(500),
        }
    }
}

/// Conversational context settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ContextSettings {
    /// Sliding window for messages with default context status.
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(8 * 60 * 60),
        }
    }
}

/// Message-count thresholds that gate full extraction per data type.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExtractionSettings {
    pub fact_threshold: u32,
    pub trait_threshold: u32,
    pub topic_threshold: u32,
    pub person_threshold: u32,
    /// Extracted facts below this confidence need validation.
    pub low_confidence: f64,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            fact_threshold: 10,
            trait_threshold: 15,
            topic_threshold: 6,
            person_threshold: 6,
            low_confidence: 0.5,
        }
    }
}

/// Heartbeat settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    /// Silence required before a persona may reach out, unless the persona overrides it.
    #[serde(with = "humantime_serde")]
    pub default_delay: Duration,
    /// How often the scheduler evaluates heartbeats and the ceremony.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    /// How far `level_current` decays toward zero per day of silence.
    pub decay_per_day: f64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            default_delay: Duration::from_secs(30 * 60),
            tick_interval: Duration::from_secs(60),
            decay_per_day: 0.1,
        }
    }
}

/// Daily ceremony settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CeremonySettings {
    pub enabled: bool,
    /// Local time of day after which the ceremony may run.
    pub time: NaiveTime,
    /// Alias of the persona that delivers the digest.
    pub persona: String,
    /// Maximum validations rendered in the digest.
    pub max_items: usize,
}

impl Default for CeremonySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            time: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default(),
            persona: "Ei".to_string(),
            max_items: 5,
        }
    }
}

/// Checkpoint settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CheckpointSettings {
    #[serde(with = "humantime_serde")]
    pub auto_save_interval: Duration,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            auto_save_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Remote sync settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncSettings {
    /// Directory that holds the remote copy (e.g. a mounted shared folder).
    pub remote_dir: PathBuf,
    /// Push the local state when the processor shuts down.
    #[serde(default = "default_push_on_shutdown")]
    pub push_on_shutdown: bool,
}

fn default_push_on_shutdown() -> bool {
    true
}
