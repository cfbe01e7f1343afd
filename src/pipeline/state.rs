//! Pipeline run state machine

use crate::stage::StageId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a run is. `Completed` and `Failed` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Researching,
    Synthesizing,
    Rendering,
    Notifying,
    Completed,
    Failed(StageId),
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Failed(_))
    }

    /// Stage executed while in this state
    pub fn stage(&self) -> Option<StageId> {
        match self {
            PipelineState::Researching => Some(StageId::Research),
            PipelineState::Synthesizing => Some(StageId::PromptSynthesis),
            PipelineState::Rendering => Some(StageId::Render),
            PipelineState::Notifying => Some(StageId::Notify),
            _ => None,
        }
    }

    /// State that runs `stage`
    pub fn running(stage: StageId) -> Self {
        match stage {
            StageId::Research => PipelineState::Researching,
            StageId::PromptSynthesis => PipelineState::Synthesizing,
            StageId::Render => PipelineState::Rendering,
            StageId::Notify => PipelineState::Notifying,
        }
    }

    /// State after the current stage succeeds. Terminal states stay put.
    pub fn advance(self) -> Self {
        match self {
            PipelineState::Idle => PipelineState::Researching,
            PipelineState::Researching => PipelineState::Synthesizing,
            PipelineState::Synthesizing => PipelineState::Rendering,
            PipelineState::Rendering => PipelineState::Notifying,
            PipelineState::Notifying => PipelineState::Completed,
            terminal => terminal,
        }
    }

    /// State after the current stage fails. Terminal states stay put.
    pub fn fail(self) -> Self {
        match self.stage() {
            Some(stage) => PipelineState::Failed(stage),
            None if self == PipelineState::Idle => PipelineState::Failed(StageId::Research),
            None => self,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Idle => f.write_str("idle"),
            PipelineState::Researching => f.write_str("researching"),
            PipelineState::Synthesizing => f.write_str("synthesizing"),
            PipelineState::Rendering => f.write_str("rendering"),
            PipelineState::Notifying => f.write_str("notifying"),
            PipelineState::Completed => f.write_str("completed"),
            PipelineState::Failed(stage) => write!(f, "failed at {}", stage),
        }
    }
}
