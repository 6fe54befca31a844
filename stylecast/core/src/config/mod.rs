//! TOML Configuration File Support
//!
//! Centralized configuration loading for the daemon and the streaming core,
//! backed by a TOML file at `~/.config/stylecast/stylecast.toml`.
//!
//! # Configuration Priority
//!
//! Values are resolved with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! bind_address = "127.0.0.1:8765"
//! max_connections = 64
//! max_message_size = 8388608
//!
//! [stream]
//! max_fps = 15.0            # 0 disables rate limiting
//! default_model = "adain"
//! transform_timeout_ms = 0  # 0 = no timeout
//! egress_capacity = 4
//!
//! [engine]
//! style_strength = 1.0
//! max_dimension = 512
//! jpeg_quality = 95
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::ColorTransferConfig;
use crate::rate_limit::FrameRateConfig;

/// Smallest non-zero frame rate ceiling: one frame every 100 seconds
pub const MIN_MAX_FPS: f64 = 0.01;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[server]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Address to listen on
    pub bind_address: Option<String>,
    /// Maximum concurrent connections
    pub max_connections: Option<usize>,
    /// Maximum WebSocket message size in bytes
    pub max_message_size: Option<usize>,
}

/// `[stream]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamToml {
    /// Frames-per-second ceiling (0 = unlimited)
    pub max_fps: Option<f64>,
    /// Model a new session starts with
    pub default_model: Option<String>,
    /// Per-transform timeout in milliseconds (0 = none)
    pub transform_timeout_ms: Option<u64>,
    /// Result frames buffered between worker and socket
    pub egress_capacity: Option<usize>,
}

/// `[engine]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineToml {
    /// Blend between content (0.0) and fully styled (1.0)
    pub style_strength: Option<f32>,
    /// Longest edge after downsizing
    pub max_dimension: Option<u32>,
    /// JPEG quality of result frames
    pub jpeg_quality: Option<u8>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StylecastToml {
    /// Server section
    pub server: ServerToml,
    /// Stream section
    pub stream: StreamToml,
    /// Engine section
    pub engine: EngineToml,
}

// =============================================================================
// Resolved Settings
// =============================================================================

/// Listener settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerSettings {
    /// Address to listen on
    pub bind_address: String,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Maximum WebSocket message size in bytes
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8765".to_string(),
            max_connections: 64,
            max_message_size: 8 * 1024 * 1024,
        }
    }
}

/// Per-session streaming settings
#[derive(Clone, Debug, PartialEq)]
pub struct StreamSettings {
    /// Frames-per-second ceiling (0 = unlimited)
    pub max_fps: f64,
    /// Model a new session starts with
    pub default_model: String,
    /// Per-transform timeout in milliseconds (0 = none)
    pub transform_timeout_ms: u64,
    /// Result frames buffered between worker and socket
    pub egress_capacity: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            max_fps: 15.0,
            default_model: "adain".to_string(),
            transform_timeout_ms: 0,
            egress_capacity: 4,
        }
    }
}

impl StreamSettings {
    /// Rate limiter configuration for one session
    #[must_use]
    pub fn rate_config(&self) -> FrameRateConfig {
        FrameRateConfig::new()
            .with_max_fps(self.max_fps)
            .with_enabled(self.max_fps > 0.0)
    }

    /// Transform timeout, `None` when unbounded
    #[must_use]
    pub fn transform_timeout(&self) -> Option<Duration> {
        (self.transform_timeout_ms > 0).then(|| Duration::from_millis(self.transform_timeout_ms))
    }
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Centralized configuration
///
/// Use [`load_config`] to load with proper priority handling.
#[derive(Clone, Debug)]
pub struct StylecastConfig {
    /// Listener settings
    pub server: ServerSettings,

    /// Per-session streaming settings
    pub stream: StreamSettings,

    /// Built-in engine settings
    pub engine: ColorTransferConfig,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    source: ConfigSource,
}

impl Default for StylecastConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            stream: StreamSettings::default(),
            engine: ColorTransferConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl StylecastConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the highest-priority source that contributed a value
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        if !self.stream.max_fps.is_finite() || self.stream.max_fps < 0.0 {
            return invalid(format!(
                "stream.max_fps must be a finite number >= 0, got {}",
                self.stream.max_fps
            ));
        }
        if self.stream.max_fps > 0.0 && self.stream.max_fps < MIN_MAX_FPS {
            return invalid(format!(
                "stream.max_fps must be 0 (unlimited) or at least {MIN_MAX_FPS}, got {}",
                self.stream.max_fps
            ));
        }
        if self.stream.default_model.trim().is_empty() {
            return invalid("stream.default_model must not be empty".to_string());
        }
        if self.stream.egress_capacity == 0 {
            return invalid("stream.egress_capacity must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.engine.style_strength) {
            return invalid(format!(
                "engine.style_strength must be between 0 and 1, got {}",
                self.engine.style_strength
            ));
        }
        if self.engine.max_dimension == 0 {
            return invalid("engine.max_dimension must be greater than 0".to_string());
        }
        if !(1..=100).contains(&self.engine.jpeg_quality) {
            return invalid(format!(
                "engine.jpeg_quality must be between 1 and 100, got {}",
                self.engine.jpeg_quality
            ));
        }
        if self.server.max_connections == 0 {
            return invalid("server.max_connections must be greater than 0".to_string());
        }
        if self.server.max_message_size == 0 {
            return invalid("server.max_message_size must be greater than 0".to_string());
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/stylecast/stylecast.toml` or
/// `~/.config/stylecast/stylecast.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("stylecast").join("stylecast.toml"))
}

/// Load configuration from the default path, then the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<StylecastConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path, then the environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<StylecastConfig, ConfigError> {
    let mut config = load_file_config(path)?;
    apply_env_config(&mut config);
    Ok(config)
}

/// Load defaults overlaid with the TOML file, ignoring the environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_file_config(path: Option<PathBuf>) -> Result<StylecastConfig, ConfigError> {
    let mut config = StylecastConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: StylecastToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    Ok(config)
}

fn apply_toml_config(config: &mut StylecastConfig, toml: &StylecastToml) {
    // Server settings
    if let Some(ref bind) = toml.server.bind_address {
        config.server.bind_address = bind.clone();
    }
    if let Some(max) = toml.server.max_connections {
        config.server.max_connections = max;
    }
    if let Some(size) = toml.server.max_message_size {
        config.server.max_message_size = size;
    }

    // Stream settings
    if let Some(fps) = toml.stream.max_fps {
        config.stream.max_fps = fps;
    }
    if let Some(ref model) = toml.stream.default_model {
        config.stream.default_model = model.clone();
    }
    if let Some(ms) = toml.stream.transform_timeout_ms {
        config.stream.transform_timeout_ms = ms;
    }
    if let Some(capacity) = toml.stream.egress_capacity {
        config.stream.egress_capacity = capacity;
    }

    // Engine settings, range-checked later by validate()
    if let Some(strength) = toml.engine.style_strength {
        config.engine.style_strength = strength;
    }
    if let Some(dim) = toml.engine.max_dimension {
        config.engine.max_dimension = dim;
    }
    if let Some(quality) = toml.engine.jpeg_quality {
        config.engine.jpeg_quality = quality;
    }
}

/// Apply environment variable overrides to the config
pub fn apply_env_config(config: &mut StylecastConfig) {
    apply_env_config_from(config, |key| std::env::var(key).ok());
}

/// Apply overrides from an arbitrary variable lookup
///
/// Unparseable values are ignored with a warning.
pub fn apply_env_config_from<F>(config: &mut StylecastConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    fn parsed<T: std::str::FromStr>(key: &str, raw: String) -> Option<T> {
        let value = raw.trim().parse().ok();
        if value.is_none() {
            tracing::warn!(key, value = %raw, "Ignoring unparseable environment variable");
        }
        value
    }

    if let Some(bind) = lookup("STYLECAST_BIND") {
        config.server.bind_address = bind;
        config.source = ConfigSource::Env;
    }
    if let Some(n) = lookup("STYLECAST_MAX_CONNECTIONS")
        .and_then(|raw| parsed::<usize>("STYLECAST_MAX_CONNECTIONS", raw))
    {
        config.server.max_connections = n;
        config.source = ConfigSource::Env;
    }
    if let Some(size) = lookup("STYLECAST_MAX_MESSAGE_SIZE")
        .and_then(|raw| parsed::<usize>("STYLECAST_MAX_MESSAGE_SIZE", raw))
    {
        config.server.max_message_size = size;
        config.source = ConfigSource::Env;
    }
    if let Some(fps) =
        lookup("STYLECAST_MAX_FPS").and_then(|raw| parsed::<f64>("STYLECAST_MAX_FPS", raw))
    {
        config.stream.max_fps = fps;
        config.source = ConfigSource::Env;
    }
    if let Some(model) = lookup("STYLECAST_DEFAULT_MODEL") {
        config.stream.default_model = model;
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = lookup("STYLECAST_TRANSFORM_TIMEOUT_MS")
        .and_then(|raw| parsed::<u64>("STYLECAST_TRANSFORM_TIMEOUT_MS", raw))
    {
        config.stream.transform_timeout_ms = ms;
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Bind address override
    pub bind_address: Option<String>,

    /// Frames-per-second ceiling override
    pub max_fps: Option<f64>,

    /// Default model override
    pub default_model: Option<String>,

    /// Transform timeout override (milliseconds)
    pub transform_timeout_ms: Option<u64>,

    /// Connection limit override
    pub max_connections: Option<usize>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set bind address override
    #[must_use]
    pub fn with_bind_address(mut self, bind: String) -> Self {
        self.bind_address = Some(bind);
        self
    }

    /// Set frames-per-second override
    #[must_use]
    pub fn with_max_fps(mut self, fps: f64) -> Self {
        self.max_fps = Some(fps);
        self
    }

    /// Set default model override
    #[must_use]
    pub fn with_default_model(mut self, model: String) -> Self {
        self.default_model = Some(model);
        self
    }

    /// Set transform timeout override
    #[must_use]
    pub fn with_transform_timeout_ms(mut self, ms: u64) -> Self {
        self.transform_timeout_ms = Some(ms);
        self
    }

    /// Set connection limit override
    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    fn is_empty(&self) -> bool {
        self.bind_address.is_none()
            && self.max_fps.is_none()
            && self.default_model.is_none()
            && self.transform_timeout_ms.is_none()
            && self.max_connections.is_none()
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut StylecastConfig) {
        if !self.is_empty() {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref bind) = self.bind_address {
            config.server.bind_address = bind.clone();
        }
        if let Some(fps) = self.max_fps {
            config.stream.max_fps = fps;
        }
        if let Some(ref model) = self.default_model {
            config.stream.default_model = model.clone();
        }
        if let Some(ms) = self.transform_timeout_ms {
            config.stream.transform_timeout_ms = ms;
        }
        if let Some(max) = self.max_connections {
            config.server.max_connections = max;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::{FrameRateLimiter, RateLimitResult};
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn write_toml(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    // =========================================================================
    // Default Configuration Tests
    // =========================================================================

    #[test]
    fn test_default_config() {
        let config = StylecastConfig::default();

        assert_eq!(config.server.bind_address, "127.0.0.1:8765");
        assert_eq!(config.server.max_connections, 64);
        assert_eq!(config.server.max_message_size, 8_388_608);
        assert_eq!(config.stream.max_fps, 15.0);
        assert_eq!(config.stream.default_model, "adain");
        assert_eq!(config.stream.transform_timeout(), None);
        assert_eq!(config.stream.egress_capacity, 4);
        assert_eq!(config.engine.jpeg_quality, 95);
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        if let Some(path) = default_config_path() {
            assert!(path.ends_with("stylecast/stylecast.toml"));
        }
    }

    #[test]
    fn test_stream_settings_conversions() {
        let settings = StreamSettings {
            max_fps: 2.0,
            transform_timeout_ms: 250,
            ..StreamSettings::default()
        };
        assert_eq!(
            settings.rate_config().min_interval(),
            Some(Duration::from_millis(500))
        );
        assert_eq!(
            settings.transform_timeout(),
            Some(Duration::from_millis(250))
        );

        let unlimited = StreamSettings {
            max_fps: 0.0,
            ..StreamSettings::default()
        };
        assert!(!unlimited.rate_config().enabled);
        assert_eq!(unlimited.rate_config().min_interval(), None);
    }

    // =========================================================================
    // File Loading Tests
    // =========================================================================

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config =
            load_file_config(Some(PathBuf::from("/nonexistent/stylecast.toml"))).unwrap();
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.config_file_path.is_none());
    }

    #[test]
    fn test_load_full_file() {
        let file = write_toml(
            r#"
[server]
bind_address = "0.0.0.0:9000"
max_connections = 8
max_message_size = 1048576

[stream]
max_fps = 24.0
default_model = "sanet"
transform_timeout_ms = 500
egress_capacity = 2

[engine]
style_strength = 0.6
max_dimension = 256
jpeg_quality = 80
"#,
        );

        let config = load_file_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.server.bind_address, "0.0.0.0:9000");
        assert_eq!(config.server.max_connections, 8);
        assert_eq!(config.server.max_message_size, 1_048_576);
        assert_eq!(config.stream.max_fps, 24.0);
        assert_eq!(config.stream.default_model, "sanet");
        assert_eq!(config.stream.transform_timeout_ms, 500);
        assert_eq!(config.stream.egress_capacity, 2);
        assert_eq!(config.engine.style_strength, 0.6);
        assert_eq!(config.engine.max_dimension, 256);
        assert_eq!(config.engine.jpeg_quality, 80);
        assert_eq!(config.source(), ConfigSource::File);
        assert_eq!(config.config_file_path.as_deref(), Some(file.path()));
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let file = write_toml("[stream]\nmax_fps = 5.0\n");
        let config = load_file_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.stream.max_fps, 5.0);
        assert_eq!(config.stream.default_model, "adain");
        assert_eq!(config.server, ServerSettings::default());
    }

    #[test]
    fn test_load_invalid_toml() {
        let file = write_toml("[stream\nmax_fps = ");
        let err = load_file_config(Some(file.path().to_path_buf())).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_load_wrong_type() {
        let file = write_toml("[stream]\nmax_fps = \"fast\"\n");
        let err = load_file_config(Some(file.path().to_path_buf())).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    // =========================================================================
    // Environment Tests
    // =========================================================================

    #[test]
    fn test_env_overrides_file() {
        let file = write_toml("[stream]\nmax_fps = 5.0\ndefault_model = \"sanet\"\n");
        let mut config = load_file_config(Some(file.path().to_path_buf())).unwrap();

        apply_env_config_from(
            &mut config,
            env(&[
                ("STYLECAST_MAX_FPS", "30"),
                ("STYLECAST_BIND", "0.0.0.0:1234"),
                ("STYLECAST_TRANSFORM_TIMEOUT_MS", "750"),
                ("STYLECAST_MAX_CONNECTIONS", "3"),
                ("STYLECAST_MAX_MESSAGE_SIZE", "4096"),
            ]),
        );

        assert_eq!(config.stream.max_fps, 30.0);
        assert_eq!(config.stream.default_model, "sanet");
        assert_eq!(config.server.bind_address, "0.0.0.0:1234");
        assert_eq!(config.stream.transform_timeout_ms, 750);
        assert_eq!(config.server.max_connections, 3);
        assert_eq!(config.server.max_message_size, 4096);
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_env_ignores_unparseable_values() {
        let mut config = StylecastConfig::default();
        apply_env_config_from(
            &mut config,
            env(&[
                ("STYLECAST_MAX_FPS", "lots"),
                ("STYLECAST_MAX_CONNECTIONS", "-1"),
            ]),
        );
        assert_eq!(config.stream.max_fps, 15.0);
        assert_eq!(config.server.max_connections, 64);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_env_default_model() {
        let mut config = StylecastConfig::default();
        apply_env_config_from(&mut config, env(&[("STYLECAST_DEFAULT_MODEL", "sanet")]));
        assert_eq!(config.stream.default_model, "sanet");
    }

    // =========================================================================
    // CLI Override Tests
    // =========================================================================

    #[test]
    fn test_overrides_take_priority() {
        let mut config = StylecastConfig::default();
        apply_env_config_from(&mut config, env(&[("STYLECAST_MAX_FPS", "30")]));

        ConfigOverrides::new()
            .with_max_fps(10.0)
            .with_default_model("sanet".to_string())
            .with_bind_address("[::1]:8000".to_string())
            .with_transform_timeout_ms(100)
            .with_max_connections(2)
            .apply(&mut config);

        assert_eq!(config.stream.max_fps, 10.0);
        assert_eq!(config.stream.default_model, "sanet");
        assert_eq!(config.server.bind_address, "[::1]:8000");
        assert_eq!(config.stream.transform_timeout_ms, 100);
        assert_eq!(config.server.max_connections, 2);
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_empty_overrides_keep_source() {
        let mut config = StylecastConfig::default();
        ConfigOverrides::new().apply(&mut config);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    // =========================================================================
    // Validation Tests
    // =========================================================================

    #[test]
    fn test_validation_rejects_bad_values() {
        let cases: Vec<(&str, Box<dyn Fn(&mut StylecastConfig)>)> = vec![
            ("max_fps", Box::new(|c| c.stream.max_fps = -1.0)),
            ("max_fps", Box::new(|c| c.stream.max_fps = f64::INFINITY)),
            ("max_fps", Box::new(|c| c.stream.max_fps = 1e-30)),
            ("max_fps", Box::new(|c| c.stream.max_fps = 0.009)),
            ("default_model", Box::new(|c| c.stream.default_model = " ".into())),
            ("egress_capacity", Box::new(|c| c.stream.egress_capacity = 0)),
            ("style_strength", Box::new(|c| c.engine.style_strength = 1.5)),
            ("max_dimension", Box::new(|c| c.engine.max_dimension = 0)),
            ("jpeg_quality", Box::new(|c| c.engine.jpeg_quality = 0)),
            ("jpeg_quality", Box::new(|c| c.engine.jpeg_quality = 101)),
            ("max_connections", Box::new(|c| c.server.max_connections = 0)),
        ];

        for (field, mutate) in cases {
            let mut config = StylecastConfig::default();
            mutate(&mut config);
            let err = config.validate().unwrap_err();
            assert!(
                err.to_string().contains(field),
                "expected error about {field}, got: {err}"
            );
        }
    }

    #[test]
    fn test_validation_accepts_unlimited_fps() {
        let mut config = StylecastConfig::default();
        config.stream.max_fps = 0.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validated_fps_builds_a_limiter() {
        for max_fps in [0.0, MIN_MAX_FPS, 0.5, 15.0, 1e9] {
            let mut config = StylecastConfig::default();
            config.stream.max_fps = max_fps;
            assert!(config.validate().is_ok(), "max_fps = {max_fps}");

            let mut limiter = FrameRateLimiter::new(&config.stream.rate_config());
            assert_eq!(
                limiter.admit(tokio::time::Instant::now()),
                RateLimitResult::Admitted
            );
        }
    }

    #[test]
    fn test_tiny_env_fps_is_caught_by_validation() {
        let mut config = StylecastConfig::default();
        apply_env_config_from(&mut config, env(&[("STYLECAST_MAX_FPS", "1e-30")]));

        assert_eq!(config.stream.max_fps, 1e-30);
        assert!(config.validate().is_err());
        // Unvalidated, the limiter still must not panic
        let _ = FrameRateLimiter::new(&config.stream.rate_config());
    }

    #[test]
    fn test_config_source_display() {
        assert_eq!(ConfigSource::Cli.to_string(), "CLI");
        assert_eq!(ConfigSource::Env.to_string(), "environment");
        assert_eq!(ConfigSource::File.to_string(), "config file");
        assert_eq!(ConfigSource::Default.to_string(), "default");
    }
}
