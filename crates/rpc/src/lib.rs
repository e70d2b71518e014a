//! Smart irrigation ingestion service
//!
//! Axum router over the sensor store, the firmware orchestration
//! collaborator and the moisture model handle.

pub mod model_handle;
pub mod orchestrator;
pub mod server;

pub use model_handle::ModelHandle;
pub use orchestrator::{
    ControlPlaneConfig, ControlPlaneOrchestrator, DeployOutcome, Orchestrator,
    OrchestratorError, UnavailableOrchestrator,
};
pub use server::{build_router, start_server, AppState, SharedState};
