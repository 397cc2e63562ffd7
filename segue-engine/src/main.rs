//! Segue command-line front end
//!
//! - `segue plan`: print the clip timeline, transition windows and tier geometry
//! - `segue export`: run a headless export through the in-memory host and
//!   write the artifact

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt, TryStreamExt};
use segue_common::config::EngineConfig;
use segue_common::events::{EventBus, ExportStatus};
use segue_common::human_time::{format_bytes, format_duration, format_eta};
use segue_common::timing::ClipTimeline;
use segue_common::{ClipSource, QualityTier, TransitionWindow};
use segue_engine::export::{ExportPipeline, ExportRequest};
use segue_engine::host::fetch::HttpFetcher;
use segue_engine::host::memory::MemoryHost;
use segue_engine::host::PayloadFetcher;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for segue
#[derive(Parser, Debug)]
#[command(name = "segue")]
#[command(about = "Gapless clip stitching and export")]
#[command(version)]
struct Args {
    /// Configuration file (overrides SEGUE_CONFIG and the platform default)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the clip timeline and transition windows
    Plan {
        /// JSON file with an array of {sourceLocation, durationSeconds}
        #[arg(long)]
        clips: PathBuf,

        /// Quality tier (720p, 1080p, 1440p)
        #[arg(short, long)]
        quality: Option<QualityTier>,
    },

    /// Render the clip sequence into one artifact
    Export {
        /// JSON file with an array of {sourceLocation, durationSeconds}
        #[arg(long)]
        clips: PathBuf,

        /// Quality tier (720p, 1080p, 1440p)
        #[arg(short, long)]
        quality: Option<QualityTier>,

        /// Where to write the artifact
        #[arg(short, long)]
        output: PathBuf,

        /// Skip checking that every clip location can be fetched
        #[arg(long)]
        skip_fetch_check: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = EngineConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match args.command {
        Command::Plan { clips, quality } => {
            let clips = read_clips(&clips).await?;
            print_plan(&config, &clips, quality.unwrap_or(config.export.default_quality));
            Ok(())
        }
        Command::Export {
            clips,
            quality,
            output,
            skip_fetch_check,
        } => {
            let clips = read_clips(&clips).await?;
            if !skip_fetch_check {
                check_fetchable(&config, &clips).await?;
            }
            let tier = quality.unwrap_or(config.export.default_quality);
            run_export(config, clips, tier, &output).await
        }
    }
}

async fn read_clips(path: &Path) -> Result<Vec<ClipSource>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read clip list {}", path.display()))?;
    let clips: Vec<ClipSource> =
        serde_json::from_str(&content).context("Failed to parse clip list")?;
    segue_common::clip::validate_clips(&clips).context("Invalid clip list")?;
    Ok(clips)
}

fn print_plan(config: &EngineConfig, clips: &[ClipSource], tier: QualityTier) {
    let export = &config.export;
    let spec = config.quality.spec(tier);
    let timeline = ClipTimeline::from_clips(clips);

    println!(
        "Tier {}: {}x{} @ {} bps, {} fps",
        tier, spec.width, spec.height, spec.bitrate, export.encode_fps
    );
    for (index, clip) in clips.iter().enumerate() {
        let start = timeline.start_of(index).unwrap_or(0.0);
        let (first, end) = timeline.frame_span(index, export.encode_fps);
        print!(
            "  #{:<3} {:>10} +{:<10} frames {:>6}..{:<6} {}",
            index,
            format_duration(start),
            format_duration(clip.duration_seconds),
            first,
            end,
            clip.source_location
        );
        if index + 1 < clips.len() {
            let window =
                TransitionWindow::at_clip_tail(clip.duration_seconds * 1000.0, export.transition_window_ms);
            print!(
                "  fade {:.0}ms at {}",
                window.duration_ms,
                format_duration(start + window.start_ms / 1000.0)
            );
        }
        println!();
    }
    println!(
        "Total {} ({} frames)",
        format_duration(timeline.total_duration()),
        timeline.total_frames(export.encode_fps)
    );
}

async fn check_fetchable(config: &EngineConfig, clips: &[ClipSource]) -> Result<()> {
    let fetcher = HttpFetcher::new().context("Failed to create fetcher")?;
    let token = CancellationToken::new();
    let fetcher = &fetcher;
    let token = &token;

    let sizes: Vec<usize> = stream::iter(clips)
        .map(|clip| async move {
            fetcher
                .fetch(&clip.source_location, token)
                .await
                .map(|bytes| bytes.len())
        })
        .buffered(config.playback.fetch_concurrency.max(1))
        .try_collect()
        .await
        .context("Clip location is not fetchable")?;

    let total: usize = sizes.iter().sum();
    info!(clips = sizes.len(), bytes = total, "All clip locations fetchable");
    Ok(())
}

async fn run_export(
    config: EngineConfig,
    clips: Vec<ClipSource>,
    tier: QualityTier,
    output: &Path,
) -> Result<()> {
    let host = Arc::new(MemoryHost::new());
    let pipeline = Arc::new(ExportPipeline::new(host, config, EventBus::default()));

    let mut progress = pipeline.subscribe();
    let reporter = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let state = progress.borrow_and_update().clone();
            info!(
                status = %state.status,
                percent = format!("{:.0}", state.progress_percent),
                clip = state.current_clip_index + 1,
                eta = %format_eta(state.estimated_seconds_remaining),
                "{}",
                state.message
            );
            if state.status.is_terminal() {
                break;
            }
        }
    });

    let cancel_on_signal = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                warn!("Received Ctrl+C, cancelling export");
                pipeline.cancel();
            }
        })
    };

    let result = pipeline.export(ExportRequest::new(tier, clips)).await;
    cancel_on_signal.abort();
    let _ = reporter.await;

    let artifact = match result {
        Ok(artifact) => artifact,
        Err(e) if pipeline.state().status == ExportStatus::Cancelled => {
            info!("Export cancelled");
            return Err(e).context("Export cancelled");
        }
        Err(e) => return Err(e).context("Export failed"),
    };

    tokio::fs::write(output, &artifact.bytes)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;
    pipeline.dispose();

    println!(
        "Wrote {} ({}, {}, {} frames, {})",
        output.display(),
        format_bytes(artifact.size_bytes),
        format_duration(artifact.total_duration_seconds),
        artifact.frame_count,
        artifact.mime_type
    );
    Ok(())
}
