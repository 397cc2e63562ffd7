//! Audio mixing for the export path

pub mod sync;

pub use sync::{AudioSyncController, CrossfadeSchedule};
