//! Pipeline stages: typed outputs, schemas, instructions and the stage runner

pub mod cancel;
pub mod instructions;
pub mod runner;
pub mod schema;
pub mod types;

pub use cancel::CancelSignal;
pub use instructions::InstructionTemplate;
pub use runner::{StageRunner, StageSpec};
pub use schema::{clean_json_block, parse_stage_output};
pub use types::{
    Artifact, NotifyAck, NotifyStatus, PromptSet, RenderedArtifacts, Report, ResearchFindings, StageId,
    StageInput, StageOutput, StageResult,
};
