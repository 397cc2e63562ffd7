//! Frame-exact export path

pub mod pipeline;
pub mod state;

pub use pipeline::{
    CompleteCallback, ErrorCallback, ExportCallbacks, ExportPipeline, ExportRequest,
    ProgressCallback,
};
pub use state::ExportSession;
