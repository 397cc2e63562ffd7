//! One-shot detection of segmented playback support

use crate::host::HostCapabilities;
use std::fmt;

/// Why segmented playback is unavailable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsupportedReason {
    /// Host has no segmented append buffer
    NoSegmentedBuffer,
    /// None of the candidate segment formats is accepted
    NoSupportedFormat,
    /// Platform is known to misbehave with segmented playback
    KnownUnreliable,
}

impl fmt::Display for UnsupportedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            UnsupportedReason::NoSegmentedBuffer => "segmented buffer unavailable",
            UnsupportedReason::NoSupportedFormat => "no supported segment format",
            UnsupportedReason::KnownUnreliable => "platform is known to be unreliable",
        };
        f.write_str(text)
    }
}

/// Result of capability detection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    Supported { format: String },
    Unsupported { reason: UnsupportedReason },
}

impl Capability {
    pub fn is_supported(&self) -> bool {
        matches!(self, Capability::Supported { .. })
    }
}

/// Probe `host` once, picking the first supported candidate format
pub fn detect_capability(host: &dyn HostCapabilities, candidates: &[String]) -> Capability {
    if host.known_unreliable() {
        return Capability::Unsupported {
            reason: UnsupportedReason::KnownUnreliable,
        };
    }
    if !host.segmented_buffer_available() {
        return Capability::Unsupported {
            reason: UnsupportedReason::NoSegmentedBuffer,
        };
    }
    match candidates.iter().find(|mime| host.is_type_supported(mime)) {
        Some(format) => Capability::Supported {
            format: format.clone(),
        },
        None => Capability::Unsupported {
            reason: UnsupportedReason::NoSupportedFormat,
        },
    }
}
