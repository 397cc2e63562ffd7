//! Decode surfaces, compositing surface and recorder of the memory host

use super::HostShared;
use crate::error::{Error, Result};
use crate::host::{AudioSourceId, CompositingSurface, DecodeSurface, RecorderConfig, RecordingSink};
use crate::render::Placement;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Container type produced by [`MemoryRecorder`]
pub const RECORDING_MIME: &str = "video/x-segue-digest";

const RECORDING_MAGIC: &[u8; 4] = b"SGRC";
const HEADER_LEN: usize = 16;
const RECORD_LEN: usize = 16;

/// Solid-colour decode surface
pub struct MemoryDecodeSurface {
    id: u64,
    shared: Arc<HostShared>,
    natural_size: (u32, u32),
    duration: f64,
    audio: Option<AudioSourceId>,
}

impl MemoryDecodeSurface {
    pub(crate) fn new(
        id: u64,
        shared: Arc<HostShared>,
        natural_size: (u32, u32),
        duration: f64,
        audio: Option<AudioSourceId>,
    ) -> Self {
        Self {
            id,
            shared,
            natural_size,
            duration,
            audio,
        }
    }
}

impl DecodeSurface for MemoryDecodeSurface {
    fn id(&self) -> u64 {
        self.id
    }

    fn natural_size(&self) -> (u32, u32) {
        self.natural_size
    }

    fn duration_seconds(&self) -> f64 {
        self.duration
    }

    fn audio_source(&self) -> Option<AudioSourceId> {
        self.audio
    }

    fn release(&self) -> Result<()> {
        self.shared.release_surface(self.id)
    }
}

/// One recorded draw call
#[derive(Debug, Clone, PartialEq)]
pub struct DrawOp {
    pub surface_id: u64,
    pub color: [u8; 4],
    pub clip_time: f64,
    pub placement: Placement,
    pub opacity: f64,
}

/// Draw-list compositing surface
///
/// Draws accumulate additively; [`MemoryCanvas::sample`] evaluates the list
/// at a point.
pub struct MemoryCanvas {
    id: u64,
    width: u32,
    height: u32,
    shared: Arc<HostShared>,
    draws: Mutex<Vec<DrawOp>>,
}

impl MemoryCanvas {
    pub(crate) fn new(id: u64, width: u32, height: u32, shared: Arc<HostShared>) -> Self {
        Self {
            id,
            width,
            height,
            shared,
            draws: Mutex::new(Vec::new()),
        }
    }

    fn draw_list(&self) -> MutexGuard<'_, Vec<DrawOp>> {
        self.draws.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Draw calls since the last clear
    pub fn draws(&self) -> Vec<DrawOp> {
        self.draw_list().clone()
    }

    /// Summed opacity of all draws covering `(x, y)`
    pub fn opacity_at(&self, x: f64, y: f64) -> f64 {
        self.draw_list()
            .iter()
            .filter(|op| op.placement.contains(x, y))
            .map(|op| op.opacity)
            .sum()
    }

    /// Composited RGB at `(x, y)`, channels in `[0, 255]` before clamping
    pub fn sample(&self, x: f64, y: f64) -> [f64; 3] {
        self.draw_list()
            .iter()
            .filter(|op| op.placement.contains(x, y))
            .fold([0.0; 3], |mut acc, op| {
                for (channel, value) in acc.iter_mut().zip(op.color.iter()) {
                    *channel += *value as f64 * op.opacity;
                }
                acc
            })
    }
}

impl CompositingSurface for MemoryCanvas {
    fn id(&self) -> u64 {
        self.id
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn clear(&self) {
        self.draw_list().clear();
    }

    fn draw(
        &self,
        surface: &dyn DecodeSurface,
        clip_time: f64,
        placement: Placement,
        opacity: f64,
    ) -> Result<()> {
        let color = self
            .shared
            .surface_color(surface.id())
            .ok_or_else(|| Error::Host(format!("draw from released surface {}", surface.id())))?;
        self.draw_list().push(DrawOp {
            surface_id: surface.id(),
            color,
            clip_time,
            placement,
            opacity,
        });
        Ok(())
    }

    fn release(&self) -> Result<()> {
        self.draw_list().clear();
        self.shared.release_canvas(self.id)
    }
}

/// One decoded frame record of a memory recording
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameRecord {
    pub frame: u32,
    pub timestamp_ms: u32,
    /// Centre pixel colour
    pub rgba: [u8; 4],
    /// Summed draw opacity at the centre pixel
    pub opacity: f32,
}

/// Parsed memory recording
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingDigest {
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub frames: Vec<FrameRecord>,
}

impl RecordingDigest {
    pub fn duration_seconds(&self) -> f64 {
        if self.fps <= 0.0 {
            return 0.0;
        }
        self.frames.len() as f64 / self.fps
    }
}

/// Parse bytes produced by [`MemoryRecorder`]
pub fn decode_recording(bytes: &[u8]) -> Result<RecordingDigest> {
    if bytes.len() < HEADER_LEN || &bytes[..4] != RECORDING_MAGIC {
        return Err(Error::InvalidInput("not a segue digest recording".to_string()));
    }
    let word = |offset: usize| {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&bytes[offset..offset + 4]);
        buf
    };
    let fps = u32::from_le_bytes(word(4)) as f64 / 1000.0;
    let width = u32::from_le_bytes(word(8));
    let height = u32::from_le_bytes(word(12));

    let body = &bytes[HEADER_LEN..];
    if body.len() % RECORD_LEN != 0 {
        return Err(Error::InvalidInput(format!(
            "truncated recording: {} trailing bytes",
            body.len() % RECORD_LEN
        )));
    }

    let frames = body
        .chunks_exact(RECORD_LEN)
        .map(|record| {
            let field = |offset: usize| {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(&record[offset..offset + 4]);
                buf
            };
            FrameRecord {
                frame: u32::from_le_bytes(field(0)),
                timestamp_ms: u32::from_le_bytes(field(4)),
                rgba: field(8),
                opacity: f32::from_le_bytes(field(12)),
            }
        })
        .collect();

    Ok(RecordingDigest {
        fps,
        width,
        height,
        frames,
    })
}

#[derive(Default)]
struct RecorderState {
    started: bool,
    stopped: bool,
    aborted: bool,
    header_written: bool,
    frames: u64,
    pending: Vec<u8>,
    output: Vec<Vec<u8>>,
}

/// Recorder emitting a per-frame digest of the bound canvas
pub struct MemoryRecorder {
    canvas: Arc<MemoryCanvas>,
    config: RecorderConfig,
    frames_per_fragment: u64,
    fail_on_stop: bool,
    state: Mutex<RecorderState>,
}

impl MemoryRecorder {
    pub(crate) fn new(
        canvas: Arc<MemoryCanvas>,
        config: RecorderConfig,
        frames_per_fragment: u64,
        fail_on_stop: bool,
    ) -> Self {
        Self {
            canvas,
            config,
            frames_per_fragment: frames_per_fragment.max(1),
            fail_on_stop,
            state: Mutex::new(RecorderState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn frames_captured(&self) -> u64 {
        self.state().frames
    }

    pub fn is_aborted(&self) -> bool {
        self.state().aborted
    }

    pub fn is_stopped(&self) -> bool {
        self.state().stopped
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    fn header(&self) -> Vec<u8> {
        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(RECORDING_MAGIC);
        header.extend_from_slice(&((self.config.fps * 1000.0).round() as u32).to_le_bytes());
        header.extend_from_slice(&self.config.width.to_le_bytes());
        header.extend_from_slice(&self.config.height.to_le_bytes());
        header
    }
}

#[async_trait]
impl RecordingSink for MemoryRecorder {
    fn mime_type(&self) -> String {
        self.config.mime_type.clone()
    }

    fn start(&self) -> Result<()> {
        let mut state = self.state();
        if state.started {
            return Err(Error::Sink("recorder already started".to_string()));
        }
        state.started = true;
        Ok(())
    }

    fn capture(&self, timestamp: Duration) -> Result<()> {
        let cx = self.canvas.width() as f64 / 2.0;
        let cy = self.canvas.height() as f64 / 2.0;
        let rgb = self.canvas.sample(cx, cy);
        let opacity = self.canvas.opacity_at(cx, cy);

        let mut state = self.state();
        if !state.started || state.stopped {
            return Err(Error::Sink("recorder is not recording".to_string()));
        }
        if !state.header_written {
            let header = self.header();
            state.pending.extend_from_slice(&header);
            state.header_written = true;
        }

        let frame = state.frames as u32;
        state.pending.extend_from_slice(&frame.to_le_bytes());
        state
            .pending
            .extend_from_slice(&(timestamp.as_millis() as u32).to_le_bytes());
        for channel in rgb {
            state.pending.push(channel.round().clamp(0.0, 255.0) as u8);
        }
        state.pending.push(255);
        state.pending.extend_from_slice(&(opacity as f32).to_le_bytes());
        state.frames += 1;

        if state.frames % self.frames_per_fragment == 0 {
            let fragment = std::mem::take(&mut state.pending);
            state.output.push(fragment);
        }
        Ok(())
    }

    fn take_output(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.state().output)
    }

    async fn stop(&self) -> Result<Vec<Vec<u8>>> {
        // Flush latency of a real encoder
        tokio::time::sleep(Duration::from_millis(5)).await;

        let mut state = self.state();
        if state.stopped {
            return Err(Error::Sink("recorder already stopped".to_string()));
        }
        state.stopped = true;
        if self.fail_on_stop {
            state.pending.clear();
            state.output.clear();
            return Err(Error::Sink("encoder failed while flushing".to_string()));
        }
        if !state.pending.is_empty() {
            let fragment = std::mem::take(&mut state.pending);
            state.output.push(fragment);
        }
        Ok(std::mem::take(&mut state.output))
    }

    fn abort(&self) {
        let mut state = self.state();
        state.stopped = true;
        state.aborted = true;
        state.pending.clear();
        state.output.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::MemoryHost;
    use crate::host::MediaHost;
    use segue_common::fade::{opacity_pair, Easing};
    use segue_common::ClipSource;

    fn recorder_config() -> RecorderConfig {
        RecorderConfig {
            width: 1280,
            height: 720,
            fps: 30.0,
            bitrate: 5_000_000,
            mime_type: RECORDING_MIME.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_complementary_draws_composite_to_full_opacity() {
        let host = MemoryHost::new();
        let decoder = host.decoder();
        let a = decoder.open(&ClipSource::new("mem://a", 1.0)).await.unwrap();
        let b = decoder.open(&ClipSource::new("mem://b", 1.0)).await.unwrap();
        let canvas = host.create_surface(1280, 720).unwrap();
        let full = Placement::full(1280, 720);

        let pair = opacity_pair(0.3, Easing::EaseInOut);
        canvas.draw(a.as_ref(), 0.5, full, pair.outgoing).unwrap();
        canvas.draw(b.as_ref(), 0.0, full, pair.incoming).unwrap();

        let recorder = host.open_recorder(&canvas, &recorder_config()).unwrap();
        recorder.start().unwrap();
        recorder.capture(Duration::ZERO).unwrap();
        let fragments = recorder.stop().await.unwrap();

        let digest = decode_recording(&fragments.concat()).unwrap();
        assert_eq!(digest.frames.len(), 1);
        assert_eq!(digest.frames[0].opacity, 1.0);
        assert_eq!((digest.width, digest.height), (1280, 720));
        assert_eq!(digest.fps, 30.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recorder_fragments_and_abort() {
        let host = MemoryHost::new();
        host.set_frames_per_fragment(4);
        let canvas = host.create_surface(1280, 720).unwrap();
        let recorder = host.open_recorder(&canvas, &recorder_config()).unwrap();

        assert!(recorder.capture(Duration::ZERO).is_err());
        recorder.start().unwrap();
        for i in 0..9u64 {
            recorder.capture(Duration::from_millis(i * 33)).unwrap();
        }
        assert_eq!(recorder.take_output().len(), 2);
        assert!(recorder.take_output().is_empty());

        recorder.abort();
        recorder.abort();
        assert!(recorder.capture(Duration::ZERO).is_err());
        assert!(recorder.stop().await.is_err());
    }

    #[test]
    fn test_draw_from_released_surface_fails() {
        let host = MemoryHost::new();
        let canvas = host.create_surface(64, 64).unwrap();
        canvas.release().unwrap();
        assert!(canvas.release().is_err());
        assert_eq!(host.live_compositing_surfaces(), 0);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_recording(b"nope").is_err());
        let mut bytes = b"SGRC".to_vec();
        bytes.extend_from_slice(&[0; 12]);
        bytes.push(1);
        assert!(decode_recording(&bytes).is_err());
    }
}
