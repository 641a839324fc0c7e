use std::sync::Arc;

use outpaint_core::config::{OutpaintConfig, SharedConfig};
use outpaint_core::error::OutpaintError;
use outpaint_pipeline::generator::JobOrchestrator;

use crate::config::ServerConfig;

/// Builds the request-scoped orchestrator for one configuration snapshot.
pub trait OrchestratorFactory: Send + Sync {
    fn build(&self, config: OutpaintConfig) -> Result<JobOrchestrator, OutpaintError>;
}

/// Production factory: adapters come straight from the configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfiguredBackends;

impl OrchestratorFactory for ConfiguredBackends {
    fn build(&self, config: OutpaintConfig) -> Result<JobOrchestrator, OutpaintError> {
        JobOrchestrator::new(config)
    }
}

impl<F> OrchestratorFactory for F
where
    F: Fn(OutpaintConfig) -> Result<JobOrchestrator, OutpaintError> + Send + Sync,
{
    fn build(&self, config: OutpaintConfig) -> Result<JobOrchestrator, OutpaintError> {
        self(config)
    }
}

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable; everything is behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// Base outpaint settings. Requests copy and override them.
    pub outpaint: Arc<SharedConfig>,
    pub orchestrators: Arc<dyn OrchestratorFactory>,
}

impl AppState {
    pub fn new(config: ServerConfig, outpaint: OutpaintConfig) -> Self {
        Self {
            config: Arc::new(config),
            outpaint: Arc::new(SharedConfig::new(outpaint)),
            orchestrators: Arc::new(ConfiguredBackends),
        }
    }

    pub fn with_orchestrators(mut self, factory: impl OrchestratorFactory + 'static) -> Self {
        self.orchestrators = Arc::new(factory);
        self
    }
}
