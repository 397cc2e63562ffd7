//! Human-readable time and size formatting for progress output
//!
//! Format selection follows the magnitude of the value being shown:
//! - Short (`X.XXs`): under 100 seconds
//! - Medium (`M:SS.Xs`): under 100 minutes
//! - Long (`H:MM:SS`): anything longer

const SHORT_FORMAT_MAX: f64 = 100.0;
const MEDIUM_FORMAT_MAX: f64 = 6000.0;

/// Format a duration in seconds for display
///
/// # Examples
///
/// ```
/// use segue_common::human_time::format_duration;
///
/// assert_eq!(format_duration(13.0), "13.00s");
/// assert_eq!(format_duration(330.0), "5:30.0s");
/// assert_eq!(format_duration(3661.0), "1:01:01");
/// assert_eq!(format_duration(-2.5), "-2.50s");
/// ```
pub fn format_duration(seconds: f64) -> String {
    if !seconds.is_finite() {
        return "--".to_string();
    }

    let is_negative = seconds < 0.0;
    let abs_seconds = seconds.abs();

    let formatted = if abs_seconds < SHORT_FORMAT_MAX {
        format!("{:.2}s", abs_seconds)
    } else if abs_seconds < MEDIUM_FORMAT_MAX {
        let minutes = (abs_seconds / 60.0).floor();
        let secs = abs_seconds - minutes * 60.0;
        format!("{}:{:04.1}s", minutes as u64, secs)
    } else {
        let total = abs_seconds.round() as u64;
        let hours = total / 3600;
        let mins = (total % 3600) / 60;
        let secs = total % 60;
        format!("{}:{:02}:{:02}", hours, mins, secs)
    };

    if is_negative {
        format!("-{}", formatted)
    } else {
        formatted
    }
}

/// Format an optional remaining-time estimate
///
/// Returns "--" when no estimate is available yet.
pub fn format_eta(seconds: Option<f64>) -> String {
    match seconds {
        Some(s) if s.is_finite() && s >= 0.0 => format!("~{}", format_duration(s)),
        _ => "--".to_string(),
    }
}

/// Format a byte count with binary units
///
/// ```
/// use segue_common::human_time::format_bytes;
///
/// assert_eq!(format_bytes(512), "512 B");
/// assert_eq!(format_bytes(1536), "1.5 KiB");
/// assert_eq!(format_bytes(8 * 1024 * 1024), "8.0 MiB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}
