/*
 * Diarization Server - Rust Edition
 * Copyright (c) 2024 Diarization Server Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::audio::{self, TARGET_SAMPLE_RATE};
use crate::config::Config;
use crate::error::ServiceError;
use crate::types::Segment;

/// The separation model can produce at most this many sources.
const MAX_SOURCES: usize = 2;

/// Stdout cap for one worker invocation.
const MAX_WORKER_STDOUT: usize = 50 * 1024 * 1024;

/// Final stdout line of the separation worker.
#[derive(Debug, Deserialize)]
struct WorkerResponse {
    success: bool,
    #[serde(default)]
    output_paths: Vec<String>,
    #[serde(default)]
    num_sources: Option<usize>,
    #[serde(default)]
    error: Option<String>,
}

/// Every intermediate path a separation run creates, so one cleanup call can
/// unlink everything on any exit. Destructors are not relied on.
#[derive(Debug, Default)]
struct TempTracker {
    files: HashSet<PathBuf>,
    dirs: HashSet<PathBuf>,
}

impl TempTracker {
    fn track_file(&mut self, path: PathBuf) -> PathBuf {
        self.files.insert(path.clone());
        path
    }

    fn track_dir(&mut self, path: PathBuf) -> PathBuf {
        self.dirs.insert(path.clone());
        path
    }

    /// Unlink one tracked file right away.
    fn remove_file_now(&mut self, path: &Path) {
        if self.files.remove(path) {
            if let Err(e) = fs::remove_file(path) {
                tracing::warn!("failed to remove temp file {:?}: {}", path, e);
            }
        }
    }

    fn remove_dir_now(&mut self, path: &Path) {
        if self.dirs.remove(path) {
            if let Err(e) = fs::remove_dir_all(path) {
                tracing::warn!("failed to remove temp dir {:?}: {}", path, e);
            }
        }
    }

    /// Best-effort unlink of everything still tracked. Failures are logged
    /// and do not propagate.
    fn cleanup_all(&mut self) {
        for path in self.files.drain() {
            if path.exists() {
                if let Err(e) = fs::remove_file(&path) {
                    tracing::warn!("failed to remove temp file {:?}: {}", path, e);
                }
            }
        }
        for path in self.dirs.drain() {
            if path.exists() {
                if let Err(e) = fs::remove_dir_all(&path) {
                    tracing::warn!("failed to remove temp dir {:?}: {}", path, e);
                }
            }
        }
    }
}

/// Per-segment source separation orchestrator.
///
/// Slices the normalized audio per diarization segment, runs the external
/// separation worker on each slice, keeps the clip matching the segment's
/// speaker and bundles all clips into a ZIP archive. Only one separation may
/// run per process; overlapping attempts fail with `Busy`.
pub struct SeparationPipeline {
    processing: AtomicBool,
}

static GLOBAL: OnceLock<SeparationPipeline> = OnceLock::new();

pub fn global() -> &'static SeparationPipeline {
    GLOBAL.get_or_init(SeparationPipeline::new)
}

struct LatchGuard<'a>(&'a AtomicBool);

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SeparationPipeline {
    pub fn new() -> Self {
        Self {
            processing: AtomicBool::new(false),
        }
    }

    /// Run the full separation flow and return the ZIP archive bytes.
    ///
    /// `num_speakers` is the caller's claimed speaker count; the worker is
    /// asked for at most two sources and clips rotate across the returned
    /// tracks by first-seen speaker index, so speakers 3+ may share tracks.
    pub async fn separate(
        &self,
        audio_bytes: &[u8],
        segments: &[Segment],
        num_speakers: usize,
        config: &Config,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ServiceError> {
        if self.processing.swap(true, Ordering::SeqCst) {
            return Err(ServiceError::Busy);
        }
        let _latch = LatchGuard(&self.processing);

        let mut tracker = TempTracker::default();
        let result = self
            .run(audio_bytes, segments, num_speakers, config, cancel, &mut tracker)
            .await;
        tracker.cleanup_all();
        result
    }

    async fn run(
        &self,
        audio_bytes: &[u8],
        segments: &[Segment],
        num_speakers: usize,
        config: &Config,
        cancel: &CancellationToken,
        tracker: &mut TempTracker,
    ) -> Result<Vec<u8>, ServiceError> {
        if segments.is_empty() {
            return Err(ServiceError::InputValidation(
                "segments list is empty".to_string(),
            ));
        }

        let samples = audio::normalize_upload(audio_bytes, config, cancel).await?;
        let sources = num_speakers.max(1).min(MAX_SOURCES);
        tracing::info!(
            "separating {} segments with {} requested sources",
            segments.len(),
            sources
        );

        let mut clips: Vec<(Segment, PathBuf)> = Vec::with_capacity(segments.len());
        for segment in segments {
            if cancel.is_cancelled() {
                return Err(ServiceError::Cancelled);
            }

            let slice = slice_samples(&samples, segment);
            if slice.is_empty() {
                return Err(ServiceError::InputValidation(format!(
                    "segment {:.2}-{:.2} lies outside the audio",
                    segment.start_time, segment.end_time
                )));
            }

            let slice_path = tracker.track_file(config.temp_file("slice", "wav"));
            audio::write_wav_file(&slice_path, &slice)?;

            let out_dir = tracker.track_dir(config.temp_file("sep", "out"));
            fs::create_dir_all(&out_dir)
                .map_err(|e| ServiceError::Internal(format!("failed to create {out_dir:?}: {e}")))?;

            let response = run_worker(config, &slice_path, &out_dir, sources, cancel).await?;
            if !response.success {
                return Err(ServiceError::SeparationFailure(
                    response
                        .error
                        .unwrap_or_else(|| "separation worker reported failure".to_string()),
                ));
            }

            let outputs: Vec<PathBuf> = response.output_paths.iter().map(PathBuf::from).collect();
            for path in &outputs {
                tracker.track_file(path.clone());
            }
            if outputs.is_empty() {
                return Err(ServiceError::SeparationFailure(
                    "separation worker returned no output paths".to_string(),
                ));
            }
            if let Some(reported) = response.num_sources {
                if reported != outputs.len() {
                    tracing::warn!(
                        "worker reported {} sources but returned {} paths",
                        reported,
                        outputs.len()
                    );
                }
            }

            // The clip for this segment is the track matching its speaker's
            // first-seen position, wrapped across the available sources.
            let chosen_index = segment.speaker % outputs.len();
            let clip_path = tracker.track_file(config.temp_file("clip", "wav"));
            fs::copy(&outputs[chosen_index], &clip_path).map_err(|e| {
                ServiceError::SeparationFailure(format!(
                    "failed to collect separated clip: {e}"
                ))
            })?;

            for path in &outputs {
                tracker.remove_file_now(path);
            }
            tracker.remove_file_now(&slice_path);
            tracker.remove_dir_now(&out_dir);

            clips.push((*segment, clip_path));
        }

        if cancel.is_cancelled() {
            return Err(ServiceError::Cancelled);
        }

        build_archive(&clips)
    }
}

impl Default for SeparationPipeline {
    fn default() -> Self {
        Self::new()
    }
}

fn slice_samples(samples: &[f32], segment: &Segment) -> Vec<f32> {
    let start = (segment.start_time * TARGET_SAMPLE_RATE as f64).round() as usize;
    let end = (segment.end_time * TARGET_SAMPLE_RATE as f64).round() as usize;
    let start = start.min(samples.len());
    let end = end.min(samples.len());
    samples[start..end].to_vec()
}

/// Invoke the external separation worker: `SCRIPT IN_WAV OUT_DIR N`.
///
/// Stdout is capped, the call is bounded by the subprocess timeout and the
/// child is killed when the request is cancelled. The final non-empty stdout
/// line carries the JSON response.
async fn run_worker(
    config: &Config,
    input: &Path,
    out_dir: &Path,
    sources: usize,
    cancel: &CancellationToken,
) -> Result<WorkerResponse, ServiceError> {
    let mut cmd = Command::new(&config.separation_script);
    cmd.arg(input)
        .arg(out_dir)
        .arg(sources.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    tracing::debug!(
        "running separation worker {:?} {:?} {:?} {}",
        config.separation_script,
        input,
        out_dir,
        sources
    );

    let mut child = cmd.spawn().map_err(|e| {
        ServiceError::SeparationFailure(format!("failed to launch separation worker: {e}"))
    })?;
    let stdout = child.stdout.take().ok_or_else(|| {
        ServiceError::SeparationFailure("separation worker has no stdout".to_string())
    })?;

    // Dropping this future on cancel or timeout kills the child.
    let wait = async move {
        let mut buffer = Vec::new();
        let mut limited = stdout.take((MAX_WORKER_STDOUT + 1) as u64);
        limited.read_to_end(&mut buffer).await?;
        let status = child.wait().await?;
        Ok::<_, std::io::Error>((buffer, status))
    };
    tokio::pin!(wait);

    let (buffer, status) = tokio::select! {
        finished = &mut wait => finished
            .map_err(|e| ServiceError::SeparationFailure(format!("worker io error: {e}")))?,
        _ = cancel.cancelled() => {
            tracing::debug!("separation cancelled, killing worker");
            return Err(ServiceError::Cancelled);
        }
        _ = sleep(config.subprocess_timeout) => {
            tracing::warn!("separation worker timed out after {:?}", config.subprocess_timeout);
            return Err(ServiceError::SeparationFailure("separation worker timed out".to_string()));
        }
    };

    if buffer.len() > MAX_WORKER_STDOUT {
        return Err(ServiceError::SeparationFailure(
            "separation worker output exceeded 50 MiB".to_string(),
        ));
    }
    if !status.success() {
        return Err(ServiceError::SeparationFailure(format!(
            "separation worker exited with {status}"
        )));
    }

    parse_worker_response(&String::from_utf8_lossy(&buffer))
}

/// Parse the final non-empty stdout line as the worker's JSON response.
fn parse_worker_response(stdout: &str) -> Result<WorkerResponse, ServiceError> {
    let line = stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| {
            ServiceError::SeparationFailure("separation worker produced no output".to_string())
        })?;
    serde_json::from_str(line.trim()).map_err(|e| {
        ServiceError::SeparationFailure(format!("invalid worker response: {e}"))
    })
}

/// Bundle the per-segment clips into an in-memory ZIP archive. Entry names
/// carry the display speaker and the segment bounds to two decimals.
fn build_archive(clips: &[(Segment, PathBuf)]) -> Result<Vec<u8>, ServiceError> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    let mut zip = ZipWriter::new(&mut cursor);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for (segment, path) in clips {
        let name = format!(
            "{}_{:.2}-{:.2}.wav",
            segment.display_name(),
            segment.start_time,
            segment.end_time
        );
        zip.start_file(&name, options)
            .map_err(|e| ServiceError::Internal(format!("failed to add zip entry: {e}")))?;
        let data = fs::read(path)
            .map_err(|e| ServiceError::Internal(format!("failed to read clip {path:?}: {e}")))?;
        zip.write_all(&data)
            .map_err(|e| ServiceError::Internal(format!("failed to write zip entry: {e}")))?;
    }

    zip.finish()
        .map_err(|e| ServiceError::Internal(format!("failed to finish zip: {e}")))?;

    Ok(cursor.into_inner())
}
