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

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::ServiceError;

/// Sample rate the segmentation model expects.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Temp files older than this are fair game for the janitor.
const STALE_TEMP_AGE_SECS: u64 = 3600;

/// Normalize an uploaded recording to mono 16 kHz f32 samples in [-1, 1].
///
/// Native WAV uploads are decoded in-process. Everything else is handed to
/// ffmpeg, which resamples and downmixes into a temporary WAV that is read
/// back and deleted. Fails with `AudioDecodeFailure` when neither path can
/// make sense of the bytes and with `EmptyAudio` when decoding produced no
/// samples.
pub async fn normalize_upload(
    bytes: &[u8],
    config: &Config,
    cancel: &CancellationToken,
) -> Result<Vec<f32>, ServiceError> {
    let samples = match decode_wav_native(bytes) {
        Some(samples) => samples,
        None => decode_via_ffmpeg(bytes, config, cancel).await?,
    };
    if samples.is_empty() {
        return Err(ServiceError::EmptyAudio);
    }
    Ok(samples)
}

/// In-process WAV decode. Returns `None` when the bytes are not WAV at all
/// (or are too mangled for hound), which routes the upload to ffmpeg.
fn decode_wav_native(bytes: &[u8]) -> Option<Vec<f32>> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes)).ok()?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>().ok()?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|sample| sample as f32 / scale))
                .collect::<Result<_, _>>()
                .ok()?
        }
    };

    let mono = downmix(&interleaved, spec.channels as usize);
    Some(resample_linear(&mono, spec.sample_rate, TARGET_SAMPLE_RATE))
}

/// Sample-wise arithmetic mean across channels.
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Linear-interpolation resampling; output length is
/// `round(len · to_rate / from_rate)`.
pub fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }

    let output_len = (input.len() as f64 * to_rate as f64 / from_rate as f64).round() as usize;
    let ratio = from_rate as f64 / to_rate as f64;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let pos = i as f64 * ratio;
        let idx = pos as usize;
        let frac = (pos - idx as f64) as f32;
        let sample = match (input.get(idx), input.get(idx + 1)) {
            (Some(&a), Some(&b)) => a * (1.0 - frac) + b * frac,
            (Some(&a), None) => a,
            _ => *input.last().unwrap_or(&0.0),
        };
        output.push(sample);
    }

    output
}

async fn decode_via_ffmpeg(
    bytes: &[u8],
    config: &Config,
    cancel: &CancellationToken,
) -> Result<Vec<f32>, ServiceError> {
    let input_path = config.temp_file("upload", "bin");
    let output_path = config.temp_file("normalized", "wav");

    tokio::fs::write(&input_path, bytes)
        .await
        .map_err(|e| ServiceError::Internal(format!("failed to stage upload: {e}")))?;

    let result = run_ffmpeg(&input_path, &output_path, config, cancel).await;
    let _ = fs::remove_file(&input_path);

    let decoded = match result {
        Ok(()) => fs::read(&output_path)
            .map_err(|e| ServiceError::AudioDecodeFailure(format!("ffmpeg output unreadable: {e}")))
            .and_then(|wav| {
                decode_wav_native(&wav).ok_or_else(|| {
                    ServiceError::AudioDecodeFailure("ffmpeg produced an invalid WAV".to_string())
                })
            }),
        Err(e) => Err(e),
    };
    let _ = fs::remove_file(&output_path);

    decoded
}

async fn run_ffmpeg(
    input: &Path,
    output: &Path,
    config: &Config,
    cancel: &CancellationToken,
) -> Result<(), ServiceError> {
    let mut cmd = Command::new(&config.ffmpeg_path);
    cmd.args([
        "-i",
        &input.to_string_lossy(),
        "-ar",
        &TARGET_SAMPLE_RATE.to_string(),
        "-ac",
        "1",
        &output.to_string_lossy(),
        "-y",
    ])
    .stdin(Stdio::null())
    .stdout(Stdio::null())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    tracing::debug!(
        "running {} -i {:?} -ar {} -ac 1 {:?} -y",
        config.ffmpeg_path,
        input,
        TARGET_SAMPLE_RATE,
        output
    );

    let child = cmd
        .spawn()
        .map_err(|e| ServiceError::AudioDecodeFailure(format!("failed to launch ffmpeg: {e}")))?;

    // Dropping the wait future kills the child via kill_on_drop.
    let wait = child.wait_with_output();
    tokio::pin!(wait);

    let finished = tokio::select! {
        finished = &mut wait => finished
            .map_err(|e| ServiceError::AudioDecodeFailure(format!("ffmpeg did not run: {e}")))?,
        _ = cancel.cancelled() => {
            tracing::debug!("audio decode cancelled, killing ffmpeg");
            return Err(ServiceError::Cancelled);
        }
        _ = sleep(config.subprocess_timeout) => {
            tracing::warn!("ffmpeg timed out after {:?}", config.subprocess_timeout);
            return Err(ServiceError::AudioDecodeFailure("ffmpeg timed out".to_string()));
        }
    };

    if !finished.status.success() {
        let stderr = String::from_utf8_lossy(&finished.stderr);
        let excerpt: String = stderr.lines().rev().take(4).collect::<Vec<_>>().join(" | ");
        return Err(ServiceError::AudioDecodeFailure(format!(
            "ffmpeg exited with {}: {}",
            finished.status, excerpt
        )));
    }

    Ok(())
}

/// Hourly sweep of stale temp files left behind by crashed or killed
/// requests. Normal request paths clean up after themselves; this only
/// catches what they could not.
pub fn spawn_temp_janitor(temp_dir: PathBuf) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            sleep(Duration::from_secs(STALE_TEMP_AGE_SECS)).await;
            if let Err(e) = cleanup_stale_temp_files(&temp_dir) {
                tracing::warn!("temp janitor sweep failed: {}", e);
            }
        }
    })
}

fn cleanup_stale_temp_files(temp_dir: &Path) -> std::io::Result<()> {
    if !temp_dir.exists() {
        return Ok(());
    }

    for entry in fs::read_dir(temp_dir)? {
        let entry = entry?;
        let path = entry.path();

        let Some(filename) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        let owned = ["upload_", "normalized_", "slice_", "sep_", "clip_"]
            .iter()
            .any(|prefix| filename.starts_with(prefix));
        if !owned {
            continue;
        }

        if let Ok(metadata) = entry.metadata() {
            if let Ok(modified) = metadata.modified() {
                let age = std::time::SystemTime::now()
                    .duration_since(modified)
                    .unwrap_or_default();
                if age.as_secs() > STALE_TEMP_AGE_SECS {
                    if metadata.is_dir() {
                        let _ = fs::remove_dir_all(&path);
                    } else {
                        let _ = fs::remove_file(&path);
                    }
                    tracing::debug!("janitor removed stale temp entry {:?}", path);
                }
            }
        }
    }

    Ok(())
}

/// Encode mono 16 kHz samples as a 16-bit PCM WAV file.
pub fn write_wav_file(path: &Path, samples: &[f32]) -> Result<(), ServiceError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: TARGET_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .map_err(|e| ServiceError::Internal(format!("failed to create {path:?}: {e}")))?;
    for &sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        writer
            .write_sample(value)
            .map_err(|e| ServiceError::Internal(format!("failed to write {path:?}: {e}")))?;
    }
    writer
        .finalize()
        .map_err(|e| ServiceError::Internal(format!("failed to finalize {path:?}: {e}")))
}
