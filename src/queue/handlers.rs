use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::queue::registry::{HandlerRegistry, TaskHandler};
use crate::queue::types::TaskParameters;

/// Client for the external inference service that performs the actual ML
/// work. The queue never sees audio bytes; parameters carry upload
/// identifiers and the inference service resolves them.
pub struct InferenceClient {
    client: reqwest::Client,
    base_url: String,
}

impl InferenceClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn post(&self, route: &str, parameters: &TaskParameters) -> Result<Value> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), route);
        info!("Dispatching inference request to {}", url);

        let response = self
            .client
            .post(&url)
            .json(parameters)
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json().await?)
    }
}

/// Handler that forwards a task's parameters to one inference route and
/// stores the JSON response as the task result. Safe to re-run: each attempt
/// issues the full request again.
pub struct InferenceHandler {
    client: Arc<InferenceClient>,
    route: &'static str,
}

impl InferenceHandler {
    pub fn new(client: Arc<InferenceClient>, route: &'static str) -> Self {
        Self { client, route }
    }
}

#[async_trait]
impl TaskHandler for InferenceHandler {
    async fn run(&self, parameters: &TaskParameters) -> Result<Value> {
        self.client.post(self.route, parameters).await
    }
}

/// Binds the audio pipeline stages to their inference routes. Called once at
/// startup, before any worker runs.
pub fn register_audio_handlers(registry: &mut HandlerRegistry, client: Arc<InferenceClient>) {
    let stages = [
        ("transcription", "transcribe"),
        ("alignment", "align"),
        ("diarization", "diarize"),
        ("speaker_assignment", "assign-speakers"),
    ];

    for (task_type, route) in stages {
        registry.register(
            task_type,
            Arc::new(InferenceHandler::new(client.clone(), route)),
        );
    }
}
