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

use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// Fixed speaker colors, assigned cyclically in order of first appearance.
pub const SPEAKER_PALETTE: &[&str] = &["#276b4d", "#518764", "#76a483", "#416e54", "#b8d6b6"];

/// Method label reported with every diarization result.
pub const DIARIZATION_METHOD: &str = "PyAnnote ONNX";

/// A contiguous stretch of audio attributed to a single speaker.
///
/// `speaker` is the 0-based index of the speaker in order of first
/// appearance; the 1-based display name ("Speaker 1", ...) is derived from it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub start_time: f64,
    pub end_time: f64,
    pub speaker: usize,
}

impl Segment {
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    pub fn display_name(&self) -> String {
        format!("Speaker {}", self.speaker + 1)
    }
}

/// Per-speaker rollup over a diarization result.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeakerSummary {
    /// 1-based index in order of first appearance.
    pub id: usize,
    pub display_name: String,
    pub segment_count: usize,
    pub total_duration: f64,
    pub display_color: String,
}

/// The complete output of one diarization run.
#[derive(Debug, Clone, PartialEq)]
pub struct DiarizationResult {
    pub segments: Vec<Segment>,
    pub speakers: Vec<SpeakerSummary>,
    pub duration: f64,
}

impl DiarizationResult {
    pub fn total_speakers(&self) -> usize {
        self.speakers.len()
    }
}

/// Wire form of a segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentDto {
    pub id: String,
    pub speaker: String,
    pub start_time: f64,
    pub end_time: f64,
    pub duration: f64,
}

/// Wire form of a speaker summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakerDto {
    pub id: String,
    pub name: String,
    pub segment_count: usize,
    pub total_duration: f64,
    pub color: String,
}

/// Wire form of a diarization result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiarizationDto {
    pub segments: Vec<SegmentDto>,
    pub speakers: Vec<SpeakerDto>,
    pub duration: f64,
    pub total_speakers: usize,
    pub method: String,
}

impl From<&DiarizationResult> for DiarizationDto {
    fn from(result: &DiarizationResult) -> Self {
        let segments = result
            .segments
            .iter()
            .map(|s| SegmentDto {
                id: format!("{}-{:.2}-{:.2}", s.speaker + 1, s.start_time, s.end_time),
                speaker: s.display_name(),
                start_time: s.start_time,
                end_time: s.end_time,
                duration: s.duration(),
            })
            .collect();

        let speakers = result
            .speakers
            .iter()
            .map(|s| SpeakerDto {
                id: s.id.to_string(),
                name: s.display_name.clone(),
                segment_count: s.segment_count,
                total_duration: s.total_duration,
                color: s.display_color.clone(),
            })
            .collect();

        DiarizationDto {
            segments,
            speakers,
            duration: result.duration,
            total_speakers: result.total_speakers(),
            method: DIARIZATION_METHOD.to_string(),
        }
    }
}

/// A segment as submitted to the separation endpoint.
///
/// Clients usually post back the segments they received from the diarization
/// endpoint, so the speaker is accepted either as a display name
/// ("Speaker 2") or as a bare numeric index.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentSpec {
    pub speaker: SpeakerRef,
    pub start_time: f64,
    pub end_time: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SpeakerRef {
    Index(u32),
    Name(String),
}

/// Validate submitted segment specs and resolve speaker references to dense
/// 0-based indices.
pub fn resolve_segments(specs: &[SegmentSpec]) -> Result<Vec<Segment>, ServiceError> {
    if specs.is_empty() {
        return Err(ServiceError::InputValidation(
            "segments list is empty".to_string(),
        ));
    }

    let mut unknown_names: Vec<String> = Vec::new();
    let mut segments = Vec::with_capacity(specs.len());

    for spec in specs {
        if !spec.start_time.is_finite()
            || !spec.end_time.is_finite()
            || spec.start_time < 0.0
            || spec.end_time <= spec.start_time
        {
            return Err(ServiceError::InputValidation(format!(
                "invalid segment times {}-{}",
                spec.start_time, spec.end_time
            )));
        }

        let speaker = match &spec.speaker {
            SpeakerRef::Index(i) => *i as usize,
            SpeakerRef::Name(name) => match trailing_number(name) {
                Some(k) if k >= 1 => k - 1,
                _ => match unknown_names.iter().position(|n| n == name) {
                    Some(pos) => pos,
                    None => {
                        unknown_names.push(name.clone());
                        unknown_names.len() - 1
                    }
                },
            },
        };

        segments.push(Segment {
            start_time: spec.start_time,
            end_time: spec.end_time,
            speaker,
        });
    }

    Ok(segments)
}

fn trailing_number(name: &str) -> Option<usize> {
    let digits: String = name
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}
