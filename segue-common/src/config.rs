//! Engine configuration loading
//!
//! Configuration lives in a single TOML file. Every field has a built-in
//! default, so an absent file or an empty section yields a usable config.
//!
//! # Config file resolution priority
//!
//! 1. Command-line argument (`--config`)
//! 2. Environment variable (`SEGUE_CONFIG`)
//! 3. Platform config directory (`<config_dir>/segue/config.toml`)
//! 4. Built-in defaults (no file)
//!
//! The quality table and transition window are product-tuning values, which
//! is why they are configuration rather than constants.

use crate::clip::{QualitySpec, QualityTier};
use crate::fade::Easing;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "SEGUE_CONFIG";

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub export: ExportConfig,

    #[serde(default)]
    pub quality: QualityTable,

    #[serde(default)]
    pub playback: PlaybackConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Export path tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Fixed compositing/encode rate, independent of display refresh
    #[serde(default = "default_encode_fps")]
    pub encode_fps: f64,

    /// Refresh rate the frame timer ticks at
    #[serde(default = "default_display_refresh_hz")]
    pub display_refresh_hz: f64,

    /// Cross-fade length at each clip boundary
    #[serde(default = "default_transition_window_ms")]
    pub transition_window_ms: f64,

    #[serde(default)]
    pub easing: Easing,

    /// Upper bound on a single decode-ready wait
    #[serde(default = "default_preload_timeout_ms")]
    pub preload_timeout_ms: u64,

    /// Extra attempts after a decode failure (timeouts are not retried)
    #[serde(default = "default_preload_retries")]
    pub preload_retries: u32,

    /// Concurrent preloads; 0 means all clips at once
    #[serde(default)]
    pub preload_concurrency: usize,

    /// Fragment count above which output fragments are consolidated
    #[serde(default = "default_chunk_ceiling")]
    pub chunk_ceiling: usize,

    #[serde(default)]
    pub default_quality: QualityTier,

    /// Recorder container types in order of preference
    #[serde(default = "default_recorder_mime_candidates")]
    pub recorder_mime_candidates: Vec<String>,
}

impl ExportConfig {
    pub fn preload_timeout(&self) -> Duration {
        Duration::from_millis(self.preload_timeout_ms)
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            encode_fps: default_encode_fps(),
            display_refresh_hz: default_display_refresh_hz(),
            transition_window_ms: default_transition_window_ms(),
            easing: Easing::default(),
            preload_timeout_ms: default_preload_timeout_ms(),
            preload_retries: default_preload_retries(),
            preload_concurrency: 0,
            chunk_ceiling: default_chunk_ceiling(),
            default_quality: QualityTier::default(),
            recorder_mime_candidates: default_recorder_mime_candidates(),
        }
    }
}

/// Quality tier table: tier label → geometry and bitrate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityTable {
    #[serde(rename = "720p", default = "default_720p")]
    pub hd720: QualitySpec,

    #[serde(rename = "1080p", default = "default_1080p")]
    pub hd1080: QualitySpec,

    #[serde(rename = "1440p", default = "default_1440p")]
    pub qhd1440: QualitySpec,
}

impl QualityTable {
    /// Configured spec for `tier`
    pub fn spec(&self, tier: QualityTier) -> QualitySpec {
        match tier {
            QualityTier::Hd720 => self.hd720,
            QualityTier::Hd1080 => self.hd1080,
            QualityTier::Qhd1440 => self.qhd1440,
        }
    }
}

impl Default for QualityTable {
    fn default() -> Self {
        Self {
            hd720: default_720p(),
            hd1080: default_1080p(),
            qhd1440: default_1440p(),
        }
    }
}

/// Gapless playback tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Clip payloads fetched at once
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,

    /// Interval of the clip-boundary poller
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Seconds of already-played data kept when evicting after a quota error
    #[serde(default = "default_evict_keep_behind_seconds")]
    pub evict_keep_behind_seconds: f64,

    /// Segment container types in order of preference
    #[serde(default = "default_segment_mime_candidates")]
    pub segment_mime_candidates: Vec<String>,

    #[serde(default = "default_initial_volume")]
    pub initial_volume: f64,
}

impl PlaybackConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            fetch_concurrency: default_fetch_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            evict_keep_behind_seconds: default_evict_keep_behind_seconds(),
            segment_mime_candidates: default_segment_mime_candidates(),
            initial_volume: default_initial_volume(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_encode_fps() -> f64 {
    30.0
}

fn default_display_refresh_hz() -> f64 {
    60.0
}

fn default_transition_window_ms() -> f64 {
    50.0
}

fn default_preload_timeout_ms() -> u64 {
    30_000
}

fn default_preload_retries() -> u32 {
    2
}

fn default_chunk_ceiling() -> usize {
    50
}

fn default_recorder_mime_candidates() -> Vec<String> {
    vec![
        "video/webm;codecs=vp9,opus".to_string(),
        "video/webm;codecs=vp8,opus".to_string(),
        "video/webm".to_string(),
        "video/mp4".to_string(),
    ]
}

fn default_720p() -> QualitySpec {
    QualityTier::Hd720.default_spec()
}

fn default_1080p() -> QualitySpec {
    QualityTier::Hd1080.default_spec()
}

fn default_1440p() -> QualitySpec {
    QualityTier::Qhd1440.default_spec()
}

fn default_fetch_concurrency() -> usize {
    3
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_evict_keep_behind_seconds() -> f64 {
    2.0
}

fn default_segment_mime_candidates() -> Vec<String> {
    vec![
        "video/mp4; codecs=\"avc1.42E01E, mp4a.40.2\"".to_string(),
        "video/webm; codecs=\"vp9, opus\"".to_string(),
        "video/webm; codecs=\"vp8, vorbis\"".to_string(),
    ]
}

fn default_initial_volume() -> f64 {
    1.0
}

fn default_log_level() -> String {
    "info".to_string()
}

impl EngineConfig {
    /// Parse configuration from TOML text and validate it
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "Loaded config file");
        Self::from_toml_str(&content)
    }

    /// Resolve and load configuration following the priority order
    ///
    /// An explicitly requested file (CLI or environment) must exist; the
    /// platform default is optional.
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        match resolve_config_path(cli_path) {
            Some(path) => {
                info!(path = %path.display(), "Using configuration file");
                Self::load_from_file(&path)
            }
            None => {
                info!("No configuration file found, using built-in defaults");
                Ok(Self::default())
            }
        }
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let export = &self.export;
        if !(export.encode_fps.is_finite() && export.encode_fps > 0.0) {
            return Err(Error::Config(format!(
                "export.encode_fps must be positive, got {}",
                export.encode_fps
            )));
        }
        if !(export.display_refresh_hz.is_finite() && export.display_refresh_hz > 0.0) {
            return Err(Error::Config(format!(
                "export.display_refresh_hz must be positive, got {}",
                export.display_refresh_hz
            )));
        }
        if !(export.transition_window_ms.is_finite() && export.transition_window_ms > 0.0) {
            return Err(Error::Config(format!(
                "export.transition_window_ms must be positive, got {}",
                export.transition_window_ms
            )));
        }
        if export.preload_timeout_ms == 0 {
            return Err(Error::Config(
                "export.preload_timeout_ms must be positive".to_string(),
            ));
        }
        if export.chunk_ceiling == 0 {
            return Err(Error::Config(
                "export.chunk_ceiling must be at least 1".to_string(),
            ));
        }
        if export.recorder_mime_candidates.is_empty() {
            return Err(Error::Config(
                "export.recorder_mime_candidates must not be empty".to_string(),
            ));
        }

        for tier in QualityTier::all_variants() {
            let spec = self.quality.spec(*tier);
            if spec.width == 0 || spec.height == 0 || spec.bitrate == 0 {
                return Err(Error::Config(format!(
                    "quality.{} has zero dimension or bitrate",
                    tier
                )));
            }
        }

        let playback = &self.playback;
        if playback.fetch_concurrency == 0 {
            return Err(Error::Config(
                "playback.fetch_concurrency must be at least 1".to_string(),
            ));
        }
        if playback.poll_interval_ms == 0 {
            return Err(Error::Config(
                "playback.poll_interval_ms must be positive".to_string(),
            ));
        }
        if playback.segment_mime_candidates.is_empty() {
            return Err(Error::Config(
                "playback.segment_mime_candidates must not be empty".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&playback.initial_volume) {
            return Err(Error::Config(format!(
                "playback.initial_volume must be within [0, 1], got {}",
                playback.initial_volume
            )));
        }

        Ok(())
    }
}

/// Config file resolution:
/// 1. Command-line argument (highest priority)
/// 2. `SEGUE_CONFIG` environment variable
/// 3. Platform config directory, only if the file exists
/// 4. None (built-in defaults)
pub fn resolve_config_path(cli_path: Option<&Path>) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_path {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: Platform config directory
    default_config_path().filter(|path| path.exists())
}

/// Platform default config file location
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("segue").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.export.encode_fps, 30.0);
        assert_eq!(config.export.transition_window_ms, 50.0);
        assert_eq!(config.export.chunk_ceiling, 50);
        assert_eq!(config.export.preload_timeout(), Duration::from_secs(30));
        assert_eq!(config.playback.fetch_concurrency, 3);
        assert_eq!(config.playback.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.quality.spec(QualityTier::Hd1080).width, 1920);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_yields_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_partial_toml_overrides() {
        let toml = r#"
            [export]
            transition_window_ms = 80.0
            easing = "ease_in_out"
            default_quality = "720p"

            [quality.1440p]
            width = 2560
            height = 1440
            bitrate = 20000000

            [logging]
            level = "debug"
        "#;
        let config = EngineConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.export.transition_window_ms, 80.0);
        assert_eq!(config.export.easing, Easing::EaseInOut);
        assert_eq!(config.export.default_quality, QualityTier::Hd720);
        assert_eq!(config.export.encode_fps, 30.0);
        assert_eq!(config.quality.spec(QualityTier::Qhd1440).bitrate, 20_000_000);
        assert_eq!(config.quality.spec(QualityTier::Hd720).width, 1280);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let cases = [
            "[export]\nencode_fps = 0.0",
            "[export]\ntransition_window_ms = -5.0",
            "[export]\nchunk_ceiling = 0",
            "[export]\nrecorder_mime_candidates = []",
            "[quality.720p]\nwidth = 0\nheight = 720\nbitrate = 1",
            "[playback]\nfetch_concurrency = 0",
            "[playback]\ninitial_volume = 1.5",
        ];
        for case in cases {
            let result = EngineConfig::from_toml_str(case);
            assert!(matches!(result, Err(Error::Config(_))), "accepted: {case}");
        }
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let result = EngineConfig::from_toml_str("[export\nencode_fps = ");
        assert!(matches!(result, Err(Error::ConfigParse(_))));
    }

    #[test]
    #[serial]
    fn test_cli_path_beats_env() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[export]\nencode_fps = 24.0").unwrap();

        std::env::set_var(CONFIG_ENV_VAR, "/nonexistent/segue.toml");
        let resolved = resolve_config_path(Some(file.path()));
        std::env::remove_var(CONFIG_ENV_VAR);

        assert_eq!(resolved.as_deref(), Some(file.path()));
        let config = EngineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.export.encode_fps, 24.0);
    }

    #[test]
    #[serial]
    fn test_env_var_used_without_cli() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[playback]\npoll_interval_ms = 250").unwrap();

        std::env::set_var(CONFIG_ENV_VAR, file.path());
        let config = EngineConfig::load(None);
        std::env::remove_var(CONFIG_ENV_VAR);

        assert_eq!(config.unwrap().playback.poll_interval_ms, 250);
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_is_error() {
        std::env::remove_var(CONFIG_ENV_VAR);
        let result = EngineConfig::load(Some(Path::new("/nonexistent/segue.toml")));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
