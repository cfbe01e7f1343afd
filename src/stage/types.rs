//! Stage identifiers, typed stage outputs and hand-off inputs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Research,
    PromptSynthesis,
    Render,
    Notify,
}

impl StageId {
    pub const ALL: [StageId; 4] = [
        StageId::Research,
        StageId::PromptSynthesis,
        StageId::Render,
        StageId::Notify,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Research => "research",
            StageId::PromptSynthesis => "prompt_synthesis",
            StageId::Render => "render",
            StageId::Notify => "notify",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Research findings on one crop disease
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchFindings {
    pub pathogen: String,
    #[serde(default)]
    pub treatment: String,
    #[serde(default)]
    pub medicine: String,
}

/// Ordered image prompts with optional captions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptSet {
    pub prompts: Vec<String>,
    #[serde(default)]
    pub captions: Vec<String>,
}

/// One persisted render
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Ordinal of the prompt that produced it
    pub index: usize,
    pub prompt: String,
    pub path: PathBuf,
}

impl Artifact {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RenderedArtifacts {
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyStatus {
    Success,
    Failure,
}

/// Acknowledgement of the notification capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyAck {
    pub status: NotifyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl NotifyAck {
    pub fn is_success(&self) -> bool {
        self.status == NotifyStatus::Success
    }
}

/// Typed stage output, or the raw text when the stage is not validated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StageOutput {
    Research(ResearchFindings),
    Prompts(PromptSet),
    Rendered(RenderedArtifacts),
    Notified(NotifyAck),
    Unvalidated(String),
}

impl StageOutput {
    pub fn as_research(&self) -> Option<&ResearchFindings> {
        match self {
            StageOutput::Research(findings) => Some(findings),
            _ => None,
        }
    }

    pub fn as_prompts(&self) -> Option<&PromptSet> {
        match self {
            StageOutput::Prompts(prompts) => Some(prompts),
            _ => None,
        }
    }

    pub fn as_rendered(&self) -> Option<&RenderedArtifacts> {
        match self {
            StageOutput::Rendered(rendered) => Some(rendered),
            _ => None,
        }
    }

    pub fn as_ack(&self) -> Option<&NotifyAck> {
        match self {
            StageOutput::Notified(ack) => Some(ack),
            _ => None,
        }
    }

    pub fn is_unvalidated(&self) -> bool {
        matches!(self, StageOutput::Unvalidated(_))
    }
}

/// Result of one stage execution. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageId,
    pub output: StageOutput,
    /// Unparsed agent answer
    pub raw: String,
    /// Text of every capability result the stage consumed, in call order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_text: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

impl StageResult {
    pub fn new<S: Into<String>>(stage: StageId, output: StageOutput, raw: S) -> Self {
        Self {
            stage,
            output,
            raw: raw.into(),
            tool_text: Vec::new(),
            completed_at: Utc::now(),
        }
    }

    pub fn with_tool_text(mut self, tool_text: Vec<String>) -> Self {
        self.tool_text = tool_text;
        self
    }
}

/// Consolidated report handed to the notify stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub query: String,
    pub crop: String,
    pub findings: ResearchFindings,
    pub captions: Vec<String>,
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_summary: Option<String>,
}

impl Report {
    /// Plain-text report body
    pub fn body(&self) -> String {
        let mut body = format!(
            "Crop: {}\nQuery: {}\n\nTreatment: {}\nMedicine: {}\nPathogen: {}\n",
            self.crop, self.query, self.findings.treatment, self.findings.medicine, self.findings.pathogen
        );

        if !self.captions.is_empty() {
            body.push_str("\nCaptions:\n");
            for (i, caption) in self.captions.iter().enumerate() {
                body.push_str(&format!("{}. {}\n", i + 1, caption));
            }
        }

        if !self.artifacts.is_empty() {
            body.push_str("\nImages:\n");
            for artifact in &self.artifacts {
                body.push_str(&format!("- {}\n", artifact));
            }
        }

        if let Some(ref summary) = self.reference_summary {
            body.push_str(&format!("\nReferences: {}\n", summary));
        }
        body
    }
}

/// Input handed to an agent-driven stage
#[derive(Debug, Clone, PartialEq)]
pub enum StageInput {
    Query { query: String, crop: String },
    Findings(ResearchFindings),
    Report(Report),
}

impl StageInput {
    /// User message for the stage agent
    pub fn to_message(&self) -> String {
        match self {
            StageInput::Query { query, .. } => query.clone(),
            StageInput::Findings(findings) => findings.pathogen.clone(),
            StageInput::Report(report) => report.body(),
        }
    }
}
