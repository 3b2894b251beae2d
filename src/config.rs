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

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use dirs::home_dir;

use crate::cache::CacheConfig;
use crate::scheduler::SchedulerConfig;

const DEFAULT_MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Hard cap on the uploaded request body, enforced before the body is read.
    pub max_upload_bytes: u64,
    pub max_concurrent_jobs: usize,
    pub max_queue_size: usize,
    pub task_timeout: Duration,
    pub cache_ttl: Duration,
    pub cache_max_entries: usize,
    pub temp_dir: PathBuf,
    /// Segmentation model, resolved relative to the working directory.
    pub segmentation_model: PathBuf,
    /// External source-separation worker, invoked as `SCRIPT IN_WAV OUT_DIR N`.
    pub separation_script: PathBuf,
    pub ffmpeg_path: String,
    /// Wall-time budget for a single external subprocess invocation.
    pub subprocess_timeout: Duration,
}

impl Config {
    pub async fn load() -> Result<Self> {
        // Load environment variables from .env file if it exists
        dotenv::dotenv().ok();

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse::<u16>()
            .unwrap_or(8080);

        let max_upload_bytes = env::var("MAX_UPLOAD_BYTES")
            .unwrap_or_else(|_| DEFAULT_MAX_UPLOAD_BYTES.to_string())
            .parse::<u64>()
            .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);

        let max_concurrent_jobs = env::var("MAX_CONCURRENT_JOBS")
            .unwrap_or_else(|_| "2".to_string())
            .parse::<usize>()
            .unwrap_or(2);

        let max_queue_size = env::var("MAX_QUEUE_SIZE")
            .unwrap_or_else(|_| "10".to_string())
            .parse::<usize>()
            .unwrap_or(10);

        let task_timeout_secs = env::var("TASK_TIMEOUT_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse::<u64>()
            .unwrap_or(300);

        let cache_ttl_secs = env::var("CACHE_TTL_SECS")
            .unwrap_or_else(|_| "3600".to_string())
            .parse::<u64>()
            .unwrap_or(3600);

        let cache_max_entries = env::var("CACHE_MAX_ENTRIES")
            .unwrap_or_else(|_| "50".to_string())
            .parse::<usize>()
            .unwrap_or(50);

        let subprocess_timeout_secs = env::var("SUBPROCESS_TIMEOUT_SECS")
            .unwrap_or_else(|_| "120".to_string())
            .parse::<u64>()
            .unwrap_or(120);

        let segmentation_model = env::var("SEGMENTATION_MODEL")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("models").join("segmentation.onnx"));

        let separation_script = env::var("SEPARATION_SCRIPT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("scripts").join("separate_sources.py"));

        let ffmpeg_path = env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string());

        // Temporary directory
        let temp_dir = env::var("TEMP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                home_dir()
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".diarization-server")
                    .join("temp")
            });

        // Ensure temp directory exists
        std::fs::create_dir_all(&temp_dir)
            .context("Failed to create temporary directory")?;

        Ok(Config {
            host,
            port,
            max_upload_bytes,
            max_concurrent_jobs,
            max_queue_size,
            task_timeout: Duration::from_secs(task_timeout_secs),
            cache_ttl: Duration::from_secs(cache_ttl_secs),
            cache_max_entries,
            temp_dir,
            segmentation_model,
            separation_script,
            ffmpeg_path,
            subprocess_timeout: Duration::from_secs(subprocess_timeout_secs),
        })
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent: self.max_concurrent_jobs,
            max_queue_size: self.max_queue_size,
            task_timeout: self.task_timeout,
            ..SchedulerConfig::default()
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_entries: self.cache_max_entries,
            ttl: self.cache_ttl,
            ..CacheConfig::default()
        }
    }

    /// A fresh path in the temp dir, salted with a timestamp and a random
    /// suffix so concurrent workers sharing the directory cannot collide.
    pub fn temp_file(&self, prefix: &str, extension: &str) -> PathBuf {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let salt = uuid::Uuid::new_v4().simple().to_string();
        let filename = format!("{}_{}_{}.{}", prefix, timestamp, &salt[..8], extension);
        self.temp_dir.join(filename)
    }
}

#[cfg(test)]
impl Config {
    /// Fixture with defaults and an isolated temp dir, for unit tests.
    pub fn for_tests(temp_dir: PathBuf) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            max_concurrent_jobs: 2,
            max_queue_size: 10,
            task_timeout: Duration::from_secs(300),
            cache_ttl: Duration::from_secs(3600),
            cache_max_entries: 50,
            temp_dir,
            segmentation_model: PathBuf::from("models").join("segmentation.onnx"),
            separation_script: PathBuf::from("scripts").join("separate_sources.py"),
            ffmpeg_path: "ffmpeg".to_string(),
            subprocess_timeout: Duration::from_secs(120),
        }
    }
}
