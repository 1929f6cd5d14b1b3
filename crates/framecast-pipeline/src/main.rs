//! framecast probe: drive the capture pipeline for a bounded number of frames.
//!
//! ```text
//! CapturePipeline::new(backends)
//!   → initialize (retried with backoff on any retryable error kind)
//!   → capture_frame on a tokio interval at the configured frame rate
//!   → cleanup, summary
//! ```
//!
//! Environment:
//! - `FRAMECAST_CONFIG`    JSON capture configuration file (camelCase or snake_case keys)
//! - `FRAMECAST_SYNTHETIC` `1` to use in-process display, grabber and transforms
//! - `FRAMECAST_FRAMES`    frames to poll (default 120)
//! - `RUST_LOG`            tracing filter (default `info`)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use framecast_capture::synthetic::{SyntheticDisplay, SyntheticGrabber};
use framecast_core::{CaptureConfig, CaptureMethod, Resolution};
use framecast_encoder::synthetic::SyntheticProvider;
use framecast_pipeline::{Backends, CaptureFrameResult, CapturePipeline, FrameStatus, InitResult};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_FRAMES: u64 = 120;
const INIT_ATTEMPTS: u32 = 5;
const INIT_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
struct Summary {
    polls:        u64,
    packets:      u64,
    keyframes:    u64,
    raw_frames:   u64,
    images:       u64,
    warm_up:      u64,
    no_new_frame: u64,
    failures:     u64,
    bytes:        u64,
}

impl Summary {
    fn record(&mut self, result: &CaptureFrameResult) {
        self.polls += 1;
        self.bytes += result.size.unwrap_or(0) as u64;
        match result.status {
            FrameStatus::Packet => {
                self.packets += 1;
                if result.keyframe == Some(true) {
                    self.keyframes += 1;
                }
            }
            FrameStatus::Raw => self.raw_frames += 1,
            FrameStatus::Image => self.images += 1,
            FrameStatus::NeedsMoreInput => self.warm_up += 1,
            FrameStatus::NoNewFrame => self.no_new_frame += 1,
            FrameStatus::Failed => self.failures += 1,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("framecast probe v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config()?;
    let frames = match std::env::var("FRAMECAST_FRAMES") {
        Ok(v) => v.parse::<u64>().with_context(|| format!("FRAMECAST_FRAMES={v:?} is not a number"))?,
        Err(_) => DEFAULT_FRAMES,
    };

    let synthetic = std::env::var("FRAMECAST_SYNTHETIC").is_ok_and(|v| v == "1");
    let backends = if synthetic {
        info!("Using synthetic backends");
        Backends::synthetic(
            SyntheticDisplay::new(Resolution::FHD),
            SyntheticGrabber::new(Resolution::FHD),
            SyntheticProvider::new(),
        )
    } else {
        Backends::platform()
    };

    let pipeline = Arc::new(CapturePipeline::new(backends).context("claiming the capture pipeline")?);
    let screen = pipeline.screen_info();
    info!(width = screen.width, height = screen.height, "Primary screen");

    let init = initialize_with_retry(&pipeline, &config).await?;

    let summary = tokio::select! {
        summary = poll(&pipeline, &config, &init, frames) => summary?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            Summary::default()
        }
    };

    pipeline.cleanup();
    info!(
        polls = summary.polls,
        packets = summary.packets,
        keyframes = summary.keyframes,
        raw_frames = summary.raw_frames,
        images = summary.images,
        warm_up = summary.warm_up,
        no_new_frame = summary.no_new_frame,
        failures = summary.failures,
        bytes = summary.bytes,
        "Probe finished"
    );
    Ok(())
}

fn load_config() -> Result<CaptureConfig> {
    let Ok(path) = std::env::var("FRAMECAST_CONFIG") else {
        return Ok(CaptureConfig::default());
    };
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    let config = serde_json::from_str(&text).with_context(|| format!("parsing {path}"))?;
    info!(path = %path, "Loaded capture config");
    Ok(config)
}

/// Initialize, backing off and retrying while the failure is retryable.
async fn initialize_with_retry(pipeline: &Arc<CapturePipeline>, config: &CaptureConfig) -> Result<InitResult> {
    let mut backoff = INIT_BACKOFF;
    let mut attempt = 1;
    loop {
        let p = Arc::clone(pipeline);
        let c = config.clone();
        let init = tokio::task::spawn_blocking(move || p.initialize(c))
            .await
            .context("initialize task panicked")?;

        if init.success {
            info!(
                width = init.width,
                height = init.height,
                encoder_enabled = init.encoder_enabled,
                hardware_active = init.hardware_active,
                method = ?init.capture_method,
                "Pipeline initialized"
            );
            return Ok(init);
        }

        let reason = init.error.clone().unwrap_or_default();
        let retryable = init.error_kind.is_some_and(|kind| kind.is_retryable());
        if !retryable || attempt >= INIT_ATTEMPTS {
            bail!("initialize failed after {attempt} attempt(s): {reason}");
        }
        warn!(attempt, backoff_ms = backoff.as_millis() as u64, "Initialize failed ({reason}), retrying");
        tokio::time::sleep(backoff).await;
        backoff *= 2;
        attempt += 1;
    }
}

async fn poll(
    pipeline: &Arc<CapturePipeline>,
    config: &CaptureConfig,
    init: &InitResult,
    frames: u64,
) -> Result<Summary> {
    let fps = match init.capture_method {
        Some(CaptureMethod::BitmapCopy) => pipeline.bitmap_settings().fps,
        _ => config.effective_frame_rate(),
    };
    let mut ticker = tokio::time::interval(Duration::from_micros(1_000_000 / fps.max(1) as u64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut summary = Summary::default();
    while summary.polls < frames {
        ticker.tick().await;
        let p = Arc::clone(pipeline);
        let result = tokio::task::spawn_blocking(move || p.capture_frame())
            .await
            .context("capture task panicked")?;
        summary.record(&result);

        if !result.success {
            let reason = result.error.unwrap_or_default();
            if !result.error_kind.is_some_and(|kind| kind.is_retryable()) {
                bail!("capture failed: {reason}");
            }
            warn!("Capture session lost ({reason}), reinitializing");
            initialize_with_retry(pipeline, config).await?;
        }
    }
    Ok(summary)
}
