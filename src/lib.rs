pub mod queue;
pub mod storage;
pub mod utils;
pub mod web;

use std::{env, sync::Arc};

use once_cell::sync::Lazy;
use queue::TaskQueue;

pub struct AppContext {
    pub queue: Arc<TaskQueue>,
}

const AUDIOQ_DATABASE_URL: &str = "sqlite://./audioq_data/database/storage.db?mode=rwc";
const AUDIOQ_INFERENCE_URL: &str = "http://127.0.0.1:9000";
const AUDIOQ_WORKER_COUNT: usize = 4;

pub static DATABASE_URL: Lazy<String> = Lazy::new(|| {
    match env::var("AUDIOQ_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            dotenv::var("AUDIOQ_DATABASE_URL").unwrap_or_else(|_| AUDIOQ_DATABASE_URL.to_string())
        }
    }
});

pub static INFERENCE_URL: Lazy<String> = Lazy::new(|| {
    match env::var("AUDIOQ_INFERENCE_URL") {
        Ok(url) => url,
        Err(_) => {
            dotenv::var("AUDIOQ_INFERENCE_URL").unwrap_or_else(|_| AUDIOQ_INFERENCE_URL.to_string())
        }
    }
});

pub static WORKER_COUNT: Lazy<usize> = Lazy::new(|| {
    env::var("AUDIOQ_WORKER_COUNT")
        .ok()
        .or_else(|| dotenv::var("AUDIOQ_WORKER_COUNT").ok())
        .and_then(|n| n.parse().ok())
        .unwrap_or(AUDIOQ_WORKER_COUNT)
});

pub fn init_env() {
    dotenv::dotenv().ok();

    if let Some(db_path) = DATABASE_URL.strip_prefix("sqlite://") {
        let db_path = db_path.split('?').next().unwrap_or(db_path);
        if let Some(dir) = std::path::Path::new(db_path).parent() {
            std::fs::create_dir_all(dir).unwrap_or_else(|e| {
                eprintln!("Failed to create database directory: {}", e);
            });
        }
    }
}
