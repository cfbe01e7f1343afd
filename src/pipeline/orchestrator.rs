//! Pipeline orchestrator: Research, PromptSynthesis, Render, Notify

use crate::agent::BackendRegistry;
use crate::config::{load_providers, Config, ProviderConfig};
use crate::error::{PipelineError, Result};
use crate::evaluation::{evaluate_references, ReferenceCheck, AGRO_DOMAINS, SCIENCE_DOMAINS};
use crate::pipeline::state::PipelineState;
use crate::provider::{
    CapabilityDescriptor, ConnectionFailure, ConnectionSupervisor, Connector, StdioConnector,
};
use crate::render::{ImageRenderer, RenderStage};
use crate::stage::{
    CancelSignal, InstructionTemplate, PromptSet, Report, ResearchFindings, StageId, StageInput,
    StageResult, StageRunner, StageSpec,
};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

/// What to research
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub query: String,
    pub crop: String,
    /// Overrides the configured recipients when non-empty
    #[serde(default)]
    pub recipients: Vec<String>,
}

impl RunRequest {
    pub fn new<Q: Into<String>, C: Into<String>>(query: Q, crop: C) -> Self {
        Self {
            query: query.into(),
            crop: crop.into(),
            recipients: Vec::new(),
        }
    }

    pub fn with_recipients(mut self, recipients: Vec<String>) -> Self {
        self.recipients = recipients;
        self
    }
}

/// The stage a run failed at and why
#[derive(Debug, Clone)]
pub struct StageFailure {
    pub stage: StageId,
    pub error: PipelineError,
}

/// One pipeline execution
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub id: Uuid,
    pub request: RunRequest,
    pub state: PipelineState,
    /// Stage results in execution order
    pub results: Vec<StageResult>,
    pub failure: Option<StageFailure>,
    /// Advisory check of the links cited during research
    pub reference_check: Option<ReferenceCheck>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    fn new(request: RunRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            state: PipelineState::Idle,
            results: Vec::new(),
            failure: None,
            reference_check: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == PipelineState::Completed
    }

    pub fn result(&self, stage: StageId) -> Option<&StageResult> {
        self.results.iter().find(|r| r.stage == stage)
    }

    /// The run itself when completed, otherwise the failing stage's error
    pub fn into_result(self) -> Result<Self> {
        match self.failure {
            Some(failure) => Err(failure.error),
            None => Ok(self),
        }
    }

    fn begin(&mut self, stage: StageId) {
        self.state = PipelineState::running(stage);
        info!("Run {} is {}", self.id, self.state);
    }

    fn record(&mut self, result: StageResult) {
        self.results.push(result);
    }
}

/// Providers and capabilities reachable from this configuration
#[derive(Debug)]
pub struct CapabilityListing {
    /// `(provider, capability)` in registration order
    pub capabilities: Vec<(String, CapabilityDescriptor)>,
    pub errors: Vec<ConnectionFailure>,
}

/// Runs the four-stage pipeline. Each run owns its own supervisor, so
/// independent runs may execute concurrently; rendering is serialized.
pub struct PipelineOrchestrator {
    config: Arc<Config>,
    runner: StageRunner,
    connector: Arc<dyn Connector>,
    renderer: Option<Arc<dyn ImageRenderer>>,
    render_lock: Arc<Mutex<()>>,
}

impl PipelineOrchestrator {
    pub fn new(
        config: Config,
        providers: Vec<ProviderConfig>,
        connector: Arc<dyn Connector>,
        backends: BackendRegistry,
    ) -> Self {
        Self {
            config: Arc::new(config),
            runner: StageRunner::new(Arc::new(backends), Arc::new(providers)),
            connector,
            renderer: None,
            render_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Orchestrator over stdio providers and HTTP backends
    pub async fn from_config(config: Config) -> Result<Self> {
        let providers = load_providers(&config.providers_file).await?;
        let connector = Arc::new(StdioConnector::new(config.provider_client.clone()));
        let backends = BackendRegistry::from_config(&config)?;
        Ok(Self::new(config, providers, connector, backends))
    }

    /// Render in process instead of through a provider capability
    pub fn with_renderer(mut self, renderer: Arc<dyn ImageRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Connect every provider, collect the catalog, then tear down
    pub async fn list_capabilities(&self) -> Result<CapabilityListing> {
        let providers = self.runner.select_providers(None)?;
        let mut supervisor = ConnectionSupervisor::new(Arc::clone(&self.connector));
        let outcome = supervisor.connect_all(&providers).await;

        let capabilities = supervisor
            .registry()
            .entries()
            .iter()
            .map(|entry| (entry.provider.clone(), entry.descriptor.clone()))
            .collect();

        let mut errors = outcome.errors;
        errors.extend(supervisor.cleanup().await);
        Ok(CapabilityListing { capabilities, errors })
    }

    pub async fn run(&self, request: RunRequest) -> PipelineRun {
        self.run_with_cancel(request, CancelSignal::new()).await
    }

    /// Run the pipeline. Cancellation is observed at stage boundaries and
    /// during agent turns; teardown runs either way.
    pub async fn run_with_cancel(&self, request: RunRequest, cancel: CancelSignal) -> PipelineRun {
        let mut run = PipelineRun::new(request);
        let mut supervisor = ConnectionSupervisor::new(Arc::clone(&self.connector));

        info!(
            "Starting run {} for '{}' ({})",
            run.id, run.request.query, run.request.crop
        );

        let outcome = self.execute(&mut run, &mut supervisor, &cancel).await;

        for failure in supervisor.cleanup().await {
            warn!("Teardown of run {} failed for '{}': {}", run.id, failure.provider, failure.error);
        }

        match outcome {
            Ok(()) => {
                run.state = run.state.advance();
                info!("Run {} completed with {} stage results", run.id, run.results.len());
            }
            Err(error) => {
                let stage = run.state.stage().unwrap_or(StageId::Research);
                run.state = run.state.fail();
                error!("Run {} failed at {}: {}", run.id, stage, error);
                run.failure = Some(StageFailure { stage, error });
            }
        }

        run.finished_at = Some(Utc::now());
        run
    }

    async fn execute(
        &self,
        run: &mut PipelineRun,
        supervisor: &mut ConnectionSupervisor,
        cancel: &CancelSignal,
    ) -> Result<()> {
        let stages = &self.config.stages;
        let pipeline = &self.config.pipeline;

        // Research
        run.begin(StageId::Research);
        let spec = StageSpec::from_config(
            StageId::Research,
            InstructionTemplate::Research {
                crop_disease: format!("{} {}", run.request.crop, run.request.query),
                today: Local::now().date_naive(),
            },
            &stages.research,
        );
        let input = StageInput::Query {
            query: run.request.query.clone(),
            crop: run.request.crop.clone(),
        };
        let research = self.runner.run(&spec, &input, supervisor, cancel).await?;

        let domains: Vec<&str> = AGRO_DOMAINS.iter().chain(SCIENCE_DOMAINS).copied().collect();
        let cited = std::iter::once(research.raw.as_str())
            .chain(research.tool_text.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join("\n");
        let check = evaluate_references(&cited, &domains, pipeline.reference_min_ratio);
        if check.passed {
            info!("Reference check: {}", check.summary());
        } else {
            warn!("Reference check: {}", check.summary());
        }
        run.reference_check = Some(check);
        run.record(research);

        // Prompt synthesis
        run.begin(StageId::PromptSynthesis);
        let findings = findings_of(run)?;
        let spec = StageSpec::from_config(
            StageId::PromptSynthesis,
            InstructionTemplate::PromptSynthesis {
                crop: run.request.crop.clone(),
                max_images: stages.render.max_images,
            },
            &stages.prompt_synthesis,
        );
        let synthesis = self
            .runner
            .run(&spec, &StageInput::Findings(findings.clone()), supervisor, cancel)
            .await?;
        run.record(synthesis);

        // Render
        run.begin(StageId::Render);
        let prompts = prompts_of(run)?;
        let mut render = RenderStage::new(stages.render.clone());
        if let Some(ref renderer) = self.renderer {
            render = render.with_renderer(Arc::clone(renderer));
        }
        let rendered = render
            .run(&prompts, &self.runner, supervisor, cancel, &self.render_lock)
            .await?;
        let artifacts: Vec<String> = rendered
            .output
            .as_rendered()
            .map(|r| r.artifacts.iter().map(|a| a.file_name()).collect())
            .unwrap_or_default();
        run.record(rendered);

        // Notify
        run.begin(StageId::Notify);
        let recipients = if run.request.recipients.is_empty() {
            pipeline.recipients.clone()
        } else {
            run.request.recipients.clone()
        };
        let report = Report {
            query: run.request.query.clone(),
            crop: run.request.crop.clone(),
            findings,
            captions: prompts.captions.clone(),
            artifacts,
            reference_summary: run.reference_check.as_ref().map(|c| c.summary()),
        };
        let spec = StageSpec::from_config(
            StageId::Notify,
            InstructionTemplate::Notify {
                recipients,
                subject: pipeline.subject.clone(),
                mail_capability: stages.notify.mail_capability.clone(),
            },
            &stages.notify.agent,
        )
        .with_ack_capability(stages.notify.mail_capability.clone());
        let notified = self
            .runner
            .run(&spec, &StageInput::Report(report), supervisor, cancel)
            .await?;

        if let Some(ack) = notified.output.as_ack() {
            if !ack.is_success() {
                return Err(PipelineError::notification(
                    ack.message
                        .clone()
                        .unwrap_or_else(|| "notification reported failure".to_string()),
                ));
            }
        }
        run.record(notified);

        Ok(())
    }
}

fn findings_of(run: &PipelineRun) -> Result<ResearchFindings> {
    let result = run
        .result(StageId::Research)
        .ok_or_else(|| PipelineError::validation("research result missing"))?;
    result.output.as_research().cloned().ok_or_else(|| {
        PipelineError::schema(
            StageId::PromptSynthesis,
            "research output was not validated; typed findings are required",
            result.raw.clone(),
        )
    })
}

fn prompts_of(run: &PipelineRun) -> Result<PromptSet> {
    let result = run
        .result(StageId::PromptSynthesis)
        .ok_or_else(|| PipelineError::validation("prompt synthesis result missing"))?;
    result.output.as_prompts().cloned().ok_or_else(|| {
        PipelineError::schema(
            StageId::Render,
            "prompt synthesis output was not validated; typed prompts are required",
            result.raw.clone(),
        )
    })
}
