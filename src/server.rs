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

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{DefaultBodyLimit, Multipart, Request, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::cache::ResultCache;
use crate::config::Config;
use crate::error::ServiceError;
use crate::scheduler::JobScheduler;
use crate::types::{resolve_segments, DiarizationDto, SegmentSpec};
use crate::{diarization, separation};

/// Headroom over the upload cap for multipart boundaries and form fields.
const BODY_LIMIT_SLACK: u64 = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub scheduler: JobScheduler,
    pub cache: Arc<ResultCache>,
    pub started_at: Instant,
}

pub fn router(state: AppState) -> Router {
    let body_limit = (state.config.max_upload_bytes + BODY_LIMIT_SLACK) as usize;
    Router::new()
        .route("/api/diarization", post(diarize))
        .route("/api/separate", post(separate))
        .route("/api/health", get(health))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            enforce_upload_limit,
        ))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Reject oversized requests from the Content-Length header alone, before
/// any of the body is read. Requests without the header are admitted and
/// bounded during the read instead.
async fn enforce_upload_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let declared = request
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());

    if let Some(length) = declared {
        if length > state.config.max_upload_bytes {
            return ServiceError::PayloadTooLarge(state.config.max_upload_bytes).into_response();
        }
    }

    next.run(request).await
}

async fn diarize(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, ServiceError> {
    let audio = read_audio_field(multipart).await?;
    if audio.len() as u64 > state.config.max_upload_bytes {
        return Err(ServiceError::PayloadTooLarge(state.config.max_upload_bytes));
    }

    if let Some(cached) = state.cache.get(&audio) {
        tracing::info!("serving diarization from cache");
        let body = json!({
            "success": true,
            "data": DiarizationDto::from(&cached),
            "cached": true,
        });
        return Ok(Json(body).into_response());
    }

    // Dropping the handler (client disconnect) cancels everything downstream.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let task_id = Uuid::new_v4().to_string();
    let config = state.config.clone();
    let task_audio = audio.clone();
    let result = state
        .scheduler
        .submit(task_id, cancel.clone(), move |task_cancel| {
            diarization::run_pipeline(task_audio, config, task_cancel)
        })
        .await?;

    state.cache.set(&audio, result.clone());
    let body = json!({
        "success": true,
        "data": DiarizationDto::from(&result),
    });
    Ok(Json(body).into_response())
}

async fn separate(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, ServiceError> {
    let form = read_separation_form(multipart).await?;
    if form.audio.len() as u64 > state.config.max_upload_bytes {
        return Err(ServiceError::PayloadTooLarge(state.config.max_upload_bytes));
    }

    let specs: Vec<SegmentSpec> = serde_json::from_str(&form.segments)
        .map_err(|e| ServiceError::InputValidation(format!("invalid segments JSON: {e}")))?;
    let segments = resolve_segments(&specs)?;

    let num_speakers = form.num_speakers.unwrap_or_else(|| {
        let mut speakers: Vec<usize> = segments.iter().map(|s| s.speaker).collect();
        speakers.sort_unstable();
        speakers.dedup();
        speakers.len()
    });

    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let task_id = Uuid::new_v4().to_string();
    let config = state.config.clone();
    let audio = form.audio.clone();
    let archive = state
        .scheduler
        .submit(task_id, cancel.clone(), move |task_cancel| async move {
            separation::global()
                .separate(&audio, &segments, num_speakers, &config, &task_cancel)
                .await
        })
        .await?;

    let filename = format!(
        "separated-speakers-{}.zip",
        chrono::Utc::now().timestamp_millis()
    );
    let headers = [
        (CONTENT_TYPE, "application/zip".to_string()),
        (
            CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        ),
    ];
    Ok((headers, archive).into_response())
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let queue = state.scheduler.status();
    let mut system = sysinfo::System::new();
    system.refresh_memory();

    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime": state.started_at.elapsed().as_secs(),
        "queue": {
            "active": queue.active,
            "pending": queue.pending,
            "capacity": queue.max_concurrent,
            "maxQueue": queue.max_queue_size,
            "available": queue.max_queue_size.saturating_sub(queue.pending),
        },
        "memory": {
            "used": system.used_memory(),
            "total": system.total_memory(),
        },
    }))
}

async fn read_audio_field(mut multipart: Multipart) -> Result<Bytes, ServiceError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServiceError::InputValidation(format!("malformed multipart body: {e}")))?
    {
        if field.name() == Some("audio") {
            return field
                .bytes()
                .await
                .map_err(|e| ServiceError::InputValidation(format!("failed to read upload: {e}")));
        }
    }
    Err(ServiceError::InputValidation(
        "missing 'audio' file field".to_string(),
    ))
}

struct SeparationForm {
    audio: Bytes,
    segments: String,
    num_speakers: Option<usize>,
}

async fn read_separation_form(mut multipart: Multipart) -> Result<SeparationForm, ServiceError> {
    let mut audio: Option<Bytes> = None;
    let mut segments: Option<String> = None;
    let mut num_speakers: Option<usize> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServiceError::InputValidation(format!("malformed multipart body: {e}")))?
    {
        match field.name() {
            Some("audio") => {
                audio = Some(field.bytes().await.map_err(|e| {
                    ServiceError::InputValidation(format!("failed to read upload: {e}"))
                })?);
            }
            Some("segments") => {
                segments = Some(field.text().await.map_err(|e| {
                    ServiceError::InputValidation(format!("failed to read segments: {e}"))
                })?);
            }
            Some("numSpeakers") => {
                let text = field.text().await.map_err(|e| {
                    ServiceError::InputValidation(format!("failed to read numSpeakers: {e}"))
                })?;
                let parsed = text.trim().parse::<usize>().map_err(|_| {
                    ServiceError::InputValidation(format!(
                        "numSpeakers must be a non-negative integer, got '{text}'"
                    ))
                })?;
                num_speakers = Some(parsed);
            }
            _ => {}
        }
    }

    Ok(SeparationForm {
        audio: audio.ok_or_else(|| {
            ServiceError::InputValidation("missing 'audio' file field".to_string())
        })?,
        segments: segments.ok_or_else(|| {
            ServiceError::InputValidation("missing 'segments' field".to_string())
        })?,
        num_speakers,
    })
}
