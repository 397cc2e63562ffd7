//! # Segue Common Library
//!
//! Shared code for the segue engine and its command-line front end:
//! - Clip model (clip sources, quality tiers, export artifacts)
//! - Fade law (easing curves and conserved opacity pairs)
//! - Frame timing helpers and the cumulative clip timeline
//! - Event types and the EventBus
//! - Configuration loading
//! - Human-readable time formatting

pub mod clip;
pub mod config;
pub mod error;
pub mod events;
pub mod fade;
pub mod human_time;
pub mod time;
pub mod timing;

pub use clip::{ClipSource, ExportArtifact, QualitySpec, QualityTier};
pub use error::{Error, Result};
pub use fade::{Easing, OpacityPair, TransitionWindow};
pub use timing::ClipTimeline;
