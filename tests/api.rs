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

//! Router-level tests driven in-process. None of these need the ONNX model,
//! ffmpeg or the separation worker to be installed; they exercise the HTTP
//! surface, validation and error mapping.

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use tower::ServiceExt;

use diarization_server_rs::cache::{CacheConfig, ResultCache};
use diarization_server_rs::config::Config;
use diarization_server_rs::scheduler::{JobScheduler, SchedulerConfig};
use diarization_server_rs::server::{router, AppState};

const BOUNDARY: &str = "test-boundary-7d93a1";

fn test_config(temp_dir: PathBuf, max_upload_bytes: u64) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        max_upload_bytes,
        max_concurrent_jobs: 2,
        max_queue_size: 10,
        task_timeout: Duration::from_secs(30),
        cache_ttl: Duration::from_secs(3600),
        cache_max_entries: 50,
        temp_dir,
        segmentation_model: PathBuf::from("models").join("missing-for-tests.onnx"),
        separation_script: PathBuf::from("scripts").join("missing-for-tests.py"),
        ffmpeg_path: "ffmpeg".to_string(),
        subprocess_timeout: Duration::from_secs(5),
    }
}

fn test_state(temp_dir: PathBuf, max_upload_bytes: u64) -> AppState {
    AppState {
        config: Arc::new(test_config(temp_dir, max_upload_bytes)),
        scheduler: JobScheduler::new(SchedulerConfig::default()),
        cache: ResultCache::new(CacheConfig::default()),
        started_at: Instant::now(),
    }
}

/// Hand-rolled multipart/form-data body.
fn multipart_body(parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, filename, content) in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match filename {
            Some(filename) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
            ),
        }
        body.extend_from_slice(content);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn multipart_request(uri: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .header(header::CONTENT_LENGTH, body.len())
        .body(Body::from(body))
        .unwrap()
}

fn tiny_wav(frames: usize) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 16_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for i in 0..frames {
            writer.write_sample(((i % 64) as i16 - 32) * 512).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_queue_and_memory() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state(dir.path().to_path_buf(), 1024 * 1024));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert!(body["timestamp"].is_string());
    assert!(body["uptime"].is_number());
    assert_eq!(body["queue"]["active"], 0);
    assert_eq!(body["queue"]["pending"], 0);
    assert_eq!(body["queue"]["capacity"], 2);
    assert_eq!(body["queue"]["maxQueue"], 10);
    assert_eq!(body["queue"]["available"], 10);
    assert!(body["memory"]["total"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn diarization_without_audio_field_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state(dir.path().to_path_buf(), 1024 * 1024));

    let body = multipart_body(&[("somethingelse", None, b"data")]);
    let response = app
        .oneshot(multipart_request("/api/diarization", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("audio"));
}

#[tokio::test]
async fn oversized_content_length_is_rejected_up_front() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state(dir.path().to_path_buf(), 1024));

    let request = Request::builder()
        .method("POST")
        .uri("/api/diarization")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .header(header::CONTENT_LENGTH, 10_000u64)
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn content_length_at_the_limit_passes_the_gate() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state(dir.path().to_path_buf(), 1024 * 1024));

    let body = multipart_body(&[("audio", Some("a.wav"), &tiny_wav(1600))]);
    let response = app
        .oneshot(multipart_request("/api/diarization", body))
        .await
        .unwrap();
    // Past the gate the pipeline runs and fails on the missing model.
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("ModelLoadFailure"));
}

#[tokio::test]
async fn corrupt_audio_reports_decode_failure() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state(dir.path().to_path_buf(), 1024 * 1024));

    let body = multipart_body(&[("audio", Some("fake.wav"), b"this is not audio at all")]);
    let response = app
        .oneshot(multipart_request("/api/diarization", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("AudioDecodeFailure"));
}

#[tokio::test]
async fn separate_with_invalid_segments_json_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state(dir.path().to_path_buf(), 1024 * 1024));

    let wav = tiny_wav(1600);
    let body = multipart_body(&[
        ("audio", Some("a.wav"), &wav),
        ("segments", None, b"definitely not json"),
    ]);
    let response = app
        .oneshot(multipart_request("/api/separate", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("segments"));
}

#[tokio::test]
async fn separate_without_segments_field_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state(dir.path().to_path_buf(), 1024 * 1024));

    let wav = tiny_wav(1600);
    let body = multipart_body(&[("audio", Some("a.wav"), &wav)]);
    let response = app
        .oneshot(multipart_request("/api/separate", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn separate_with_bad_num_speakers_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state(dir.path().to_path_buf(), 1024 * 1024));

    let wav = tiny_wav(1600);
    let body = multipart_body(&[
        ("audio", Some("a.wav"), &wav),
        (
            "segments",
            None,
            br#"[{"speaker": "Speaker 1", "startTime": 0.0, "endTime": 1.0}]"#,
        ),
        ("numSpeakers", None, b"two"),
    ]);
    let response = app
        .oneshot(multipart_request("/api/separate", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("numSpeakers"));
}

#[tokio::test]
async fn separate_with_missing_worker_reports_separation_failure() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state(dir.path().to_path_buf(), 1024 * 1024));

    // One second of silence and one valid segment; the worker script path
    // does not exist, so the pipeline fails after normalization.
    let wav = tiny_wav(16_000);
    let body = multipart_body(&[
        ("audio", Some("a.wav"), &wav),
        (
            "segments",
            None,
            br#"[{"speaker": "Speaker 1", "startTime": 0.0, "endTime": 1.0}]"#,
        ),
    ]);
    let response = app
        .oneshot(multipart_request("/api/separate", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("SeparationFailure"));
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state(dir.path().to_path_buf(), 1024 * 1024));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
