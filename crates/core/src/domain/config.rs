//! Configuration management for Soundscape
//!
//! This module provides:
//! - Configuration structs for the renderer, scene defaults, loudspeakers and
//!   the network bridges
//! - TOML serialization with defaults for every field
//! - `ConfigManager` creating, loading and backing up the main config file

use crate::domain::geometry::{DirectionalPoint, Orientation, Position};
use crate::domain::publisher::{Control, PublisherSettings};
use crate::domain::source::{db_to_linear, Loudspeaker, LoudspeakerModel};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, instrument, warn};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Sample rate of the renderer
    pub sample_rate: u32,

    /// Frames per audio cycle
    pub block_size: u32,

    /// Metering query period in milliseconds
    pub query_interval_ms: u64,

    /// Name the renderer reports to clients
    pub renderer_name: String,

    /// Prefix for live-input port numbers
    pub input_port_prefix: String,

    /// Scene loaded at startup
    pub scene_file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            block_size: 1024,
            query_interval_ms: 10,
            renderer_name: "simulated".to_string(),
            input_port_prefix: "system:capture_".to_string(),
            scene_file: None,
        }
    }
}

impl AppConfig {
    pub fn query_interval(&self) -> Duration {
        Duration::from_millis(self.query_interval_ms.max(1))
    }

    /// Duration of one audio cycle
    pub fn cycle_period(&self) -> Duration {
        Duration::from_secs_f64(self.block_size as f64 / self.sample_rate.max(1) as f64)
    }
}

/// Scene-wide values applied before any scene file is loaded
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneDefaults {
    pub master_volume_db: f32,
    pub decay_exponent: f32,
    pub amplitude_reference_distance: f32,
    pub auto_rotation: bool,
}

impl Default for SceneDefaults {
    fn default() -> Self {
        Self {
            master_volume_db: 0.0,
            decay_exponent: 1.0,
            amplitude_reference_distance: 3.0,
            auto_rotation: true,
        }
    }
}

impl SceneDefaults {
    /// Publish the defaults through a control guard
    pub fn apply(&self, control: &Control<'_>) {
        control.set_master_volume(db_to_linear(self.master_volume_db));
        control.set_decay_exponent(self.decay_exponent);
        if control
            .set_amplitude_reference_distance(self.amplitude_reference_distance)
            .is_err()
        {
            warn!("Keeping the built-in amplitude reference distance");
        }
    }
}

/// Role of the OSC bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OscMode {
    #[default]
    Off,
    Server,
    Client,
}

impl FromStr for OscMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "off" => Ok(OscMode::Off),
            "server" => Ok(OscMode::Server),
            "client" => Ok(OscMode::Client),
            other => Err(ConfigError::Invalid(format!("unknown OSC mode {:?}", other))),
        }
    }
}

impl fmt::Display for OscMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OscMode::Off => "off",
            OscMode::Server => "server",
            OscMode::Client => "client",
        })
    }
}

/// How much an OSC peer is sent
///
/// Scene facts reach every level. Transport frames and metering go to
/// `Client` peers only, as they arrive once per query interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageLevel {
    /// The upstream server of a client-role bridge
    Server,
    #[default]
    ThinClient,
    Client,
}

impl MessageLevel {
    /// Level from its `/message_level` wire number
    pub fn from_wire(level: i32) -> Option<Self> {
        match level {
            0 => Some(MessageLevel::Server),
            1 => Some(MessageLevel::ThinClient),
            2 => Some(MessageLevel::Client),
            _ => None,
        }
    }

    pub fn wants_metering(self) -> bool {
        self == MessageLevel::Client
    }
}

/// OSC bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OscConfig {
    pub mode: OscMode,

    /// Local UDP port
    pub port: u16,

    /// `host:port` of clients to address in server mode
    pub clients: Vec<String>,

    /// `host:port` of the server in client mode; learned from `/poll` if unset
    pub server: Option<String>,

    /// Level of configured and newly learned clients until they send
    /// `/message_level`
    pub client_level: MessageLevel,

    /// Server-mode `/poll` period in milliseconds
    pub poll_interval_ms: u64,

    /// Log every OSC packet sent and received
    pub trace_messages: bool,
}

impl Default for OscConfig {
    fn default() -> Self {
        Self {
            mode: OscMode::Off,
            port: 50001,
            clients: Vec::new(),
            server: None,
            client_level: MessageLevel::ThinClient,
            poll_interval_ms: 1000,
            trace_messages: false,
        }
    }
}

impl OscConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// WebSocket bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1".to_string(),
            port: 9422,
        }
    }
}

impl WebSocketConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Complete Soundscape configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SoundscapeConfig {
    pub app: AppConfig,
    pub scene: SceneDefaults,
    pub loudspeakers: Vec<Loudspeaker>,
    pub osc: OscConfig,
    pub websocket: WebSocketConfig,
}

impl SoundscapeConfig {
    /// Load configuration from TOML file
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;

        debug!("Configuration loaded successfully");
        Ok(config)
    }

    /// Save configuration to TOML file
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let toml_str = toml::to_string_pretty(self)?;
        fs::write(path, toml_str).await?;

        debug!("Configuration saved successfully");
        Ok(())
    }

    /// Factory default: eight loudspeakers on a circle around the listener
    pub fn factory_default() -> Self {
        Self {
            loudspeakers: circular_array(8, 1.5),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.app.sample_rate == 0 {
            return Err(ConfigError::Invalid("sample rate must be positive".to_string()));
        }
        if self.app.block_size == 0 {
            return Err(ConfigError::Invalid("block size must be positive".to_string()));
        }
        if self.scene.amplitude_reference_distance <= 1.0 {
            return Err(ConfigError::Invalid(format!(
                "amplitude reference distance must be > 1, got {}",
                self.scene.amplitude_reference_distance
            )));
        }
        Ok(())
    }

    pub fn publisher_settings(&self) -> PublisherSettings {
        PublisherSettings {
            input_port_prefix: self.app.input_port_prefix.clone(),
            auto_rotation: self.scene.auto_rotation,
        }
    }
}

/// `count` loudspeakers evenly spaced on a circle, facing the centre
pub fn circular_array(count: usize, radius: f32) -> Vec<Loudspeaker> {
    (0..count)
        .map(|i| {
            let azimuth = 90.0 - 360.0 * i as f32 / count as f32;
            let position = Position::new(radius, 0.0).rotate(Orientation::new(azimuth));
            let pose = DirectionalPoint::new(position, Orientation::new(azimuth + 180.0).normalized());
            Loudspeaker::new(pose, LoudspeakerModel::Normal)
        })
        .collect()
}

/// Configuration manager for the main Soundscape config
///
/// Manages the main configuration file at `~/.config/soundscape/config.toml`.
pub struct ConfigManager {
    config_dir: PathBuf,
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new ConfigManager
    ///
    /// # Arguments
    /// * `config_dir` - Configuration directory path (e.g., `~/.config/soundscape`)
    pub fn new(config_dir: PathBuf) -> Self {
        let config_path = config_dir.join("config.toml");

        Self {
            config_dir,
            config_path,
        }
    }

    /// Manager for an explicit config file
    pub fn with_path(config_path: PathBuf) -> Self {
        let config_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        Self {
            config_dir,
            config_path,
        }
    }

    /// Get the default config directory path
    ///
    /// Returns `~/.config/soundscape` on Linux, the platform equivalent elsewhere
    pub fn default_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("soundscape"))
            .ok_or_else(|| ConfigError::Invalid("Could not determine config directory".to_string()))
    }

    /// Get the config file path
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load configuration from file
    ///
    /// If the config file doesn't exist, returns factory default.
    /// If the config file is corrupt, logs an error and returns factory default.
    #[instrument(skip(self))]
    pub async fn load(&self) -> SoundscapeConfig {
        if !self.config_path.exists() {
            info!(
                path = %self.config_path.display(),
                "Config file not found, creating factory default"
            );

            let config = SoundscapeConfig::factory_default();

            if let Err(e) = self.save(&config).await {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to save factory default config"
                );
            }

            return config;
        }

        match SoundscapeConfig::load_from_file(&self.config_path).await {
            Ok(config) => {
                info!(
                    path = %self.config_path.display(),
                    "Configuration loaded successfully"
                );
                config
            }
            Err(e) => {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to load config, using factory default"
                );

                let backup_path = self.config_path.with_extension("toml.corrupt");
                if let Err(copy_err) = fs::copy(&self.config_path, &backup_path).await {
                    error!(
                        path = %backup_path.display(),
                        error = %copy_err,
                        "Failed to backup corrupt config"
                    );
                }

                SoundscapeConfig::factory_default()
            }
        }
    }

    /// Save configuration to file
    #[instrument(skip(self, config))]
    pub async fn save(&self, config: &SoundscapeConfig) -> Result<()> {
        if !self.config_dir.as_os_str().is_empty() {
            fs::create_dir_all(&self.config_dir).await?;
        }

        config.save_to_file(&self.config_path).await
    }

    /// Check if config file exists
    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }
}
