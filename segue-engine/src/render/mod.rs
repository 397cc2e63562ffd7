//! Frame-synchronous rendering primitives used by the export pipeline

pub mod chunked_output;
pub mod double_buffer;
pub mod frame_timer;
pub mod placement;

pub use chunked_output::{ChunkStats, ChunkedOutputManager};
pub use double_buffer::{ClipInfo, DecodedClipHandle, DoubleBufferManager, PreloadOptions};
pub use frame_timer::{FrameLoopStats, FrameTick, FrameTimer};
pub use placement::{fit_rect, Placement};
