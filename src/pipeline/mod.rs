//! Pipeline orchestration

pub mod orchestrator;
pub mod state;

pub use crate::stage::CancelSignal;
pub use orchestrator::{
    CapabilityListing, PipelineOrchestrator, PipelineRun, RunRequest, StageFailure,
};
pub use state::PipelineState;
