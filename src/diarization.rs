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

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::audio::{self, TARGET_SAMPLE_RATE};
use crate::config::Config;
use crate::error::ServiceError;
use crate::types::{DiarizationResult, Segment, SpeakerSummary, SPEAKER_PALETTE};

/// A frame is attributed to a speaker slot only when its softmax probability
/// clears this threshold; everything else is non-speech.
const SPEECH_THRESHOLD: f32 = 0.3;

/// Candidate segments shorter than this are suppressed.
const MIN_SEGMENT_SECS: f64 = 0.5;

/// The loaded segmentation model with its resolved tensor names.
struct SegmentationModel {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
}

static MODEL: OnceLock<SegmentationModel> = OnceLock::new();
static MODEL_INIT: Mutex<()> = Mutex::new(());

/// Lazily load the process-wide segmentation session. The init lock keeps
/// concurrent first callers from building two sessions.
fn model(model_path: &Path) -> Result<&'static SegmentationModel, ServiceError> {
    if let Some(model) = MODEL.get() {
        return Ok(model);
    }

    let _guard = MODEL_INIT.lock();
    if let Some(model) = MODEL.get() {
        return Ok(model);
    }

    if !model_path.exists() {
        return Err(ServiceError::ModelLoadFailure(format!(
            "segmentation model not found at {}",
            model_path.display()
        )));
    }

    tracing::info!("loading segmentation model from {:?}", model_path);
    let session = Session::builder()
        .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
        .and_then(|b| b.commit_from_file(model_path))
        .map_err(|e| ServiceError::ModelLoadFailure(e.to_string()))?;

    let input_name = session
        .inputs
        .first()
        .map(|i| i.name.clone())
        .ok_or_else(|| ServiceError::ModelLoadFailure("model has no inputs".to_string()))?;
    let output_name = session
        .outputs
        .first()
        .map(|o| o.name.clone())
        .ok_or_else(|| ServiceError::ModelLoadFailure("model has no outputs".to_string()))?;

    Ok(MODEL.get_or_init(|| SegmentationModel {
        session: Mutex::new(session),
        input_name,
        output_name,
    }))
}

/// Run the segmentation model over a mono 16 kHz waveform and convert its
/// frame activations to raw speaker segments.
///
/// Blocking; call from `spawn_blocking`.
pub fn run_segmentation(samples: &[f32], model_path: &Path) -> Result<Vec<Segment>, ServiceError> {
    let model = model(model_path)?;
    let duration = samples.len() as f64 / TARGET_SAMPLE_RATE as f64;

    let input = Tensor::from_array(([1i64, 1, samples.len() as i64], samples.to_vec()))
        .map_err(|e| ServiceError::InferenceFailure(e.to_string()))?;

    let mut session = model.session.lock();
    let outputs = session
        .run(ort::inputs![model.input_name.as_str() => input])
        .map_err(|e| ServiceError::InferenceFailure(e.to_string()))?;

    let output = outputs
        .get(model.output_name.as_str())
        .ok_or_else(|| ServiceError::InferenceFailure("missing model output".to_string()))?;
    let (shape, logits) = output
        .try_extract_tensor::<f32>()
        .map_err(|e| ServiceError::InferenceFailure(e.to_string()))?;

    if shape.len() != 3 || shape[0] != 1 {
        return Err(ServiceError::InferenceFailure(format!(
            "unexpected output shape {shape:?}"
        )));
    }
    let frames = shape[1] as usize;
    let classes = shape[2] as usize;
    if frames == 0 || classes < 2 {
        return Err(ServiceError::InferenceFailure(format!(
            "degenerate output shape {shape:?}"
        )));
    }

    tracing::debug!(
        "segmentation produced {} frames x {} classes for {:.1}s of audio",
        frames,
        classes,
        duration
    );

    Ok(frames_to_segments(logits, frames, classes, duration))
}

/// Walk frame activations and emit speaker segments.
///
/// The frame step is derived from the audio duration and the frame count the
/// model actually emitted. Class 0 is non-speech; classes 1..C map to
/// speakers 0..C-1. A segment is emitted on every speaker transition
/// (including to/from silence) once it meets the minimum duration, and any
/// open segment is flushed at end of stream.
pub fn frames_to_segments(
    logits: &[f32],
    frames: usize,
    classes: usize,
    total_duration: f64,
) -> Vec<Segment> {
    let frame_step = total_duration / frames as f64;
    let mut segments = Vec::new();
    let mut current: Option<(usize, f64)> = None;

    for frame in 0..frames {
        let row = &logits[frame * classes..(frame + 1) * classes];
        let active = active_speaker(row);
        let time = frame as f64 * frame_step;

        match (current, active) {
            (Some((speaker, _)), Some(next)) if next == speaker => {}
            (Some((speaker, start)), next) => {
                if time - start >= MIN_SEGMENT_SECS {
                    segments.push(Segment {
                        start_time: start,
                        end_time: time,
                        speaker,
                    });
                }
                current = next.map(|speaker| (speaker, time));
            }
            (None, Some(next)) => current = Some((next, time)),
            (None, None) => {}
        }
    }

    if let Some((speaker, start)) = current {
        if total_duration - start >= MIN_SEGMENT_SECS {
            segments.push(Segment {
                start_time: start,
                end_time: total_duration,
                speaker,
            });
        }
    }

    segments
}

/// Softmax (stabilized against the per-frame max logit) followed by an
/// argmax over the speaker classes. Returns the 0-based speaker when its
/// probability clears the speech threshold.
fn active_speaker(row: &[f32]) -> Option<usize> {
    let max_logit = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = row.iter().map(|&logit| (logit - max_logit).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum <= 0.0 {
        return None;
    }

    let mut best_class = 0;
    let mut best_prob = 0.0f32;
    for (class, &e) in exps.iter().enumerate().skip(1) {
        let prob = e / sum;
        if prob > best_prob {
            best_class = class;
            best_prob = prob;
        }
    }

    (best_class >= 1 && best_prob > SPEECH_THRESHOLD).then(|| best_class - 1)
}

/// Remap raw model speaker slots to dense first-appearance indices and
/// attach per-speaker summaries.
pub fn assemble_result(raw_segments: Vec<Segment>, duration: f64) -> DiarizationResult {
    let mut first_seen: Vec<usize> = Vec::new();
    let mut segments = Vec::with_capacity(raw_segments.len());

    for segment in &raw_segments {
        let display = match first_seen.iter().position(|&slot| slot == segment.speaker) {
            Some(index) => index,
            None => {
                first_seen.push(segment.speaker);
                first_seen.len() - 1
            }
        };
        segments.push(Segment {
            speaker: display,
            ..*segment
        });
    }

    let speakers = summarize_speakers(&segments);
    DiarizationResult {
        segments,
        speakers,
        duration,
    }
}

/// Per-speaker rollups; indices are already dense and first-seen ordered.
pub fn summarize_speakers(segments: &[Segment]) -> Vec<SpeakerSummary> {
    let speaker_count = segments.iter().map(|s| s.speaker + 1).max().unwrap_or(0);

    (0..speaker_count)
        .map(|index| {
            let owned = segments.iter().filter(|s| s.speaker == index);
            SpeakerSummary {
                id: index + 1,
                display_name: format!("Speaker {}", index + 1),
                segment_count: owned.clone().count(),
                total_duration: owned.map(|s| s.duration()).sum(),
                display_color: SPEAKER_PALETTE[index % SPEAKER_PALETTE.len()].to_string(),
            }
        })
        .collect()
}

/// Full diarization pipeline for one upload: normalize, infer, assemble.
///
/// Inference happens on a blocking thread; if the request is cancelled the
/// blocking work is abandoned to finish on its own while the request unwinds.
pub async fn run_pipeline(
    audio_bytes: Bytes,
    config: Arc<Config>,
    cancel: CancellationToken,
) -> Result<DiarizationResult, ServiceError> {
    let samples = audio::normalize_upload(&audio_bytes, &config, &cancel).await?;
    let duration = samples.len() as f64 / TARGET_SAMPLE_RATE as f64;
    tracing::info!("normalized upload to {:.1}s of mono 16 kHz audio", duration);

    if cancel.is_cancelled() {
        return Err(ServiceError::Cancelled);
    }

    let model_path: PathBuf = config.segmentation_model.clone();
    let inference = tokio::task::spawn_blocking(move || run_segmentation(&samples, &model_path));

    let raw_segments = tokio::select! {
        joined = inference => match joined {
            Ok(result) => result?,
            Err(e) => {
                return Err(ServiceError::InferenceFailure(format!(
                    "inference task failed: {e}"
                )));
            }
        },
        _ = cancel.cancelled() => return Err(ServiceError::Cancelled),
    };

    let result = assemble_result(raw_segments, duration);
    tracing::info!(
        "diarization found {} segments across {} speakers",
        result.segments.len(),
        result.total_speakers()
    );
    Ok(result)
}
