//! Clip model shared by the export and playback paths
//!
//! A session is described by an ordered list of [`ClipSource`]s. The export
//! path turns it into one [`ExportArtifact`] at a chosen [`QualityTier`].

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Immutable descriptor of one input clip
///
/// `duration_seconds` is authoritative for planning. When a decode surface
/// later reports a different duration, the decode-reported value is used for
/// playback scheduling instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipSource {
    /// Independently fetchable location of the encoded clip
    pub source_location: String,

    /// Declared clip duration in seconds
    pub duration_seconds: f64,
}

impl ClipSource {
    /// Create a new clip descriptor
    pub fn new(source_location: impl Into<String>, duration_seconds: f64) -> Self {
        Self {
            source_location: source_location.into(),
            duration_seconds,
        }
    }

    /// Reject descriptors the engine cannot schedule
    pub fn validate(&self) -> Result<()> {
        if self.source_location.trim().is_empty() {
            return Err(Error::InvalidInput(
                "clip source location is empty".to_string(),
            ));
        }
        if !self.duration_seconds.is_finite() || self.duration_seconds <= 0.0 {
            return Err(Error::InvalidInput(format!(
                "clip {} has invalid duration {}",
                self.source_location, self.duration_seconds
            )));
        }
        Ok(())
    }
}

/// Validate a whole clip list (non-empty, every clip schedulable)
pub fn validate_clips(clips: &[ClipSource]) -> Result<()> {
    if clips.is_empty() {
        return Err(Error::InvalidInput("clip list is empty".to_string()));
    }
    clips.iter().try_for_each(ClipSource::validate)
}

/// Sum of declared clip durations in seconds
pub fn total_duration(clips: &[ClipSource]) -> f64 {
    clips.iter().map(|c| c.duration_seconds).sum()
}

/// Named output quality preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QualityTier {
    /// 1280×720
    #[serde(rename = "720p")]
    Hd720,
    /// 1920×1080
    #[serde(rename = "1080p")]
    Hd1080,
    /// 2560×1440
    #[serde(rename = "1440p")]
    Qhd1440,
}

impl QualityTier {
    /// Canonical tier label ("720p", "1080p", "1440p")
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityTier::Hd720 => "720p",
            QualityTier::Hd1080 => "1080p",
            QualityTier::Qhd1440 => "1440p",
        }
    }

    /// Built-in geometry and bitrate for this tier
    ///
    /// These are product-tuning defaults; the configured table in
    /// [`crate::config::QualityTable`] takes precedence at runtime.
    pub fn default_spec(&self) -> QualitySpec {
        match self {
            QualityTier::Hd720 => QualitySpec::new(1280, 720, 5_000_000),
            QualityTier::Hd1080 => QualitySpec::new(1920, 1080, 8_000_000),
            QualityTier::Qhd1440 => QualitySpec::new(2560, 1440, 16_000_000),
        }
    }

    /// All tiers, smallest first
    pub fn all_variants() -> &'static [QualityTier] {
        &[QualityTier::Hd720, QualityTier::Hd1080, QualityTier::Qhd1440]
    }
}

impl Default for QualityTier {
    fn default() -> Self {
        QualityTier::Hd1080
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityTier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "720p" | "720" | "hd" => Ok(QualityTier::Hd720),
            "1080p" | "1080" | "fullhd" | "full_hd" => Ok(QualityTier::Hd1080),
            "1440p" | "1440" | "qhd" => Ok(QualityTier::Qhd1440),
            other => Err(Error::InvalidInput(format!("unknown quality tier: {other}"))),
        }
    }
}

/// Output frame geometry and target bitrate of a quality tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualitySpec {
    pub width: u32,
    pub height: u32,
    /// Target bitrate in bits per second
    pub bitrate: u64,
}

impl QualitySpec {
    pub const fn new(width: u32, height: u32, bitrate: u64) -> Self {
        Self {
            width,
            height,
            bitrate,
        }
    }

    /// Width-to-height ratio
    pub fn aspect_ratio(&self) -> f64 {
        if self.height == 0 {
            return 0.0;
        }
        self.width as f64 / self.height as f64
    }
}

/// Terminal, immutable result of a successful export
#[derive(Clone)]
pub struct ExportArtifact {
    /// Encoded output container bytes
    pub bytes: Vec<u8>,
    /// Ephemeral playable location for the bytes (blob-style URI)
    pub playable_location: String,
    /// Rendered duration (frame count over encode rate)
    pub total_duration_seconds: f64,
    /// Byte length of `bytes`
    pub size_bytes: u64,
    pub quality_tier: QualityTier,
    /// Container/codec type reported by the recording sink
    pub mime_type: String,
    /// Number of composited frames captured
    pub frame_count: u64,
}

impl fmt::Debug for ExportArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportArtifact")
            .field("playable_location", &self.playable_location)
            .field("total_duration_seconds", &self.total_duration_seconds)
            .field("size_bytes", &self.size_bytes)
            .field("quality_tier", &self.quality_tier)
            .field("mime_type", &self.mime_type)
            .field("frame_count", &self.frame_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_list_deserializes_from_camel_case() {
        let json = r#"[
            {"sourceLocation": "https://cdn.example/a.mp4", "durationSeconds": 4.0},
            {"sourceLocation": "https://cdn.example/b.mp4", "durationSeconds": 6.5}
        ]"#;
        let clips: Vec<ClipSource> = serde_json::from_str(json).unwrap();
        assert_eq!(clips.len(), 2);
        assert_eq!(clips[1].source_location, "https://cdn.example/b.mp4");
        assert_eq!(total_duration(&clips), 10.5);
    }

    #[test]
    fn test_validate_rejects_bad_clips() {
        assert!(validate_clips(&[]).is_err());
        assert!(ClipSource::new("", 1.0).validate().is_err());
        assert!(ClipSource::new("a.mp4", 0.0).validate().is_err());
        assert!(ClipSource::new("a.mp4", f64::NAN).validate().is_err());
        assert!(validate_clips(&[ClipSource::new("a.mp4", 2.0)]).is_ok());
    }

    #[test]
    fn test_quality_tier_parse_and_display() {
        for tier in QualityTier::all_variants() {
            assert_eq!(tier.as_str().parse::<QualityTier>().unwrap(), *tier);
        }
        assert_eq!("QHD".parse::<QualityTier>().unwrap(), QualityTier::Qhd1440);
        assert!("4k".parse::<QualityTier>().is_err());
        assert_eq!(format!("{}", QualityTier::Hd1080), "1080p");
    }

    #[test]
    fn test_quality_tier_serde_uses_labels() {
        let json = serde_json::to_string(&QualityTier::Hd720).unwrap();
        assert_eq!(json, "\"720p\"");
        let tier: QualityTier = serde_json::from_str("\"1440p\"").unwrap();
        assert_eq!(tier, QualityTier::Qhd1440);
    }

    #[test]
    fn test_default_specs() {
        let spec = QualityTier::Hd1080.default_spec();
        assert_eq!((spec.width, spec.height), (1920, 1080));
        assert!((spec.aspect_ratio() - 16.0 / 9.0).abs() < 1e-9);
    }
}
