#![allow(clippy::uninlined_format_args)]

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use audioq_rs::queue::handlers::{register_audio_handlers, InferenceClient};
use audioq_rs::queue::{create_task_queue, HandlerRegistry};
use audioq_rs::storage::task::SqliteTaskRepository;
use audioq_rs::utils::logger;
use audioq_rs::{init_env, AppContext, DATABASE_URL, INFERENCE_URL, WORKER_COUNT};

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = logger::init("./logs".to_string())?;
    init_env();

    info!("Starting audio task queue service...");

    info!("Initializing task repository...");
    let repository = Arc::new(SqliteTaskRepository::new(&DATABASE_URL).await?);

    info!("Registering audio handlers...");
    let inference = Arc::new(InferenceClient::new(INFERENCE_URL.clone()));
    let mut registry = HandlerRegistry::new();
    register_audio_handlers(&mut registry, inference);

    info!("Starting worker pool with {} workers...", *WORKER_COUNT);
    let queue = create_task_queue(registry, repository, *WORKER_COUNT);

    let ctx = Arc::new(AppContext { queue });

    let addr = SocketAddr::from(([127, 0, 0, 1], 7300));
    info!("Starting HTTP server at http://{}", addr);

    match audioq_rs::web::start_server(ctx, addr).await {
        Ok(_) => info!("Server stopped gracefully"),
        Err(e) => {
            tracing::error!("Server error: {}", e);
            return Err(e);
        }
    }

    Ok(())
}
