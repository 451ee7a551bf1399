//! Gateway shared state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use parley_core::config::ParleyConfig;
use parley_models::coordinator::{EngineSet, PipelineContext};
use parley_models::device::DeviceDetector;
use parley_models::handle::ModelStatus;
use parley_worker::PipelineOptions;

/// Shared gateway state accessible from all connections and handlers.
pub struct GatewayState {
    pub config: Arc<ParleyConfig>,
    pub engines: EngineSet,
    pub detector: Arc<dyn DeviceDetector>,
    pub connections: RwLock<HashMap<String, ConnectionState>>,
}

/// Per-connection state.
pub struct ConnectionState {
    pub conn_id: String,
    pub connected_at: DateTime<Utc>,
    pub pipeline: Arc<PipelineContext>,
}

/// `/health` view of one connection.
#[derive(Debug, Serialize)]
pub struct ConnectionSummary {
    pub conn_id: String,
    pub connected_at: DateTime<Utc>,
    pub models: Vec<ModelStatus>,
}

impl GatewayState {
    pub fn new(config: Arc<ParleyConfig>, engines: EngineSet, detector: Arc<dyn DeviceDetector>) -> Self {
        Self {
            config,
            engines,
            detector,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Fresh pipeline for a new connection, with the configured identities.
    pub fn new_pipeline(&self) -> Arc<PipelineContext> {
        Arc::new(PipelineContext::from_config(
            &self.config,
            self.engines.clone(),
            self.detector.clone(),
        ))
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions::from_config(&self.config)
    }

    pub async fn register(&self, conn_id: &str, pipeline: Arc<PipelineContext>) {
        self.connections.write().await.insert(
            conn_id.to_string(),
            ConnectionState {
                conn_id: conn_id.to_string(),
                connected_at: Utc::now(),
                pipeline,
            },
        );
    }

    pub async fn unregister(&self, conn_id: &str) {
        self.connections.write().await.remove(conn_id);
    }

    pub async fn summaries(&self) -> Vec<ConnectionSummary> {
        let connections = self.connections.read().await;
        let mut summaries: Vec<ConnectionSummary> = connections
            .values()
            .map(|conn| ConnectionSummary {
                conn_id: conn.conn_id.clone(),
                connected_at: conn.connected_at,
                models: conn.pipeline.snapshot(),
            })
            .collect();
        summaries.sort_by_key(|s| s.connected_at);
        summaries
    }
}
