//! Stage runner: one agent-driven stage from connect to teardown

use crate::agent::{Agent, AgentRun, BackendRegistry};
use crate::config::{AgentStageConfig, ProviderConfig};
use crate::error::{PipelineError, Result};
use crate::provider::ConnectionSupervisor;
use crate::stage::cancel::CancelSignal;
use crate::stage::instructions::InstructionTemplate;
use crate::stage::schema::{parse_stage_output, parse_value};
use crate::stage::types::{StageId, StageInput, StageOutput, StageResult};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Everything needed to run one stage
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub id: StageId,
    pub instructions: InstructionTemplate,
    /// Backend name; `None` uses the default backend
    pub backend: Option<String>,
    /// Providers the stage needs. `None` connects every provider.
    pub providers: Option<Vec<String>>,
    pub max_turns: usize,
    /// Validate the answer against the stage schema
    pub structured: bool,
    /// Capability whose result is the stage acknowledgement
    pub ack_capability: Option<String>,
}

impl StageSpec {
    pub fn new(id: StageId, instructions: InstructionTemplate) -> Self {
        Self {
            id,
            instructions,
            backend: None,
            providers: None,
            max_turns: 10,
            structured: true,
            ack_capability: None,
        }
    }

    /// Stage spec from its configuration section
    pub fn from_config(id: StageId, instructions: InstructionTemplate, config: &AgentStageConfig) -> Self {
        Self {
            id,
            instructions,
            backend: config.backend.clone(),
            providers: config.providers.clone(),
            max_turns: config.max_turns,
            structured: config.structured,
            ack_capability: None,
        }
    }

    pub fn with_ack_capability<S: Into<String>>(mut self, capability: S) -> Self {
        self.ack_capability = Some(capability.into());
        self
    }
}

/// Runs stages against a supervisor owned by the caller
#[derive(Debug, Clone)]
pub struct StageRunner {
    backends: Arc<BackendRegistry>,
    providers: Arc<Vec<ProviderConfig>>,
}

impl StageRunner {
    pub fn new(backends: Arc<BackendRegistry>, providers: Arc<Vec<ProviderConfig>>) -> Self {
        Self { backends, providers }
    }

    /// Provider configs for a stage scope, in declaration order
    pub fn select_providers(&self, scope: Option<&[String]>) -> Result<Vec<ProviderConfig>> {
        let scope = match scope {
            Some(scope) => scope,
            None => return Ok(self.providers.as_ref().clone()),
        };

        if let Some(missing) = scope
            .iter()
            .find(|name| !self.providers.iter().any(|p| &p.name == *name))
        {
            return Err(PipelineError::config(format!(
                "Stage references unknown provider '{}'",
                missing
            )));
        }

        Ok(self
            .providers
            .iter()
            .filter(|p| scope.contains(&p.name))
            .cloned()
            .collect())
    }

    /// Connect the providers a stage needs.
    ///
    /// Providers named by the stage are required; an unscoped stage keeps
    /// going with whatever connected.
    pub async fn connect_scoped(
        &self,
        stage: StageId,
        scope: Option<&[String]>,
        supervisor: &mut ConnectionSupervisor,
    ) -> Result<()> {
        let configs = self.select_providers(scope)?;
        let outcome = supervisor.connect_all(&configs).await;

        if outcome.errors.is_empty() {
            return Ok(());
        }

        if scope.is_some() {
            if let Some(failure) = outcome.errors.into_iter().next() {
                error!("Stage {} cannot run without provider '{}'", stage, failure.provider);
                return Err(failure.error);
            }
        } else {
            for failure in &outcome.errors {
                warn!(
                    "Stage {} continues without provider '{}': {}",
                    stage, failure.provider, failure.error
                );
            }
        }
        Ok(())
    }

    /// Run one stage. Stage-scoped connections are always released before
    /// this returns, whether the stage succeeded, failed or was cancelled.
    pub async fn run(
        &self,
        spec: &StageSpec,
        input: &StageInput,
        supervisor: &mut ConnectionSupervisor,
        cancel: &CancelSignal,
    ) -> Result<StageResult> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled { stage: spec.id });
        }

        info!("Running stage {}", spec.id);
        let result = self.execute(spec, input, supervisor, cancel).await;

        for failure in supervisor.cleanup().await {
            warn!(
                "Teardown after stage {} failed for '{}': {}",
                spec.id, failure.provider, failure.error
            );
        }

        match &result {
            Ok(_) => info!("Stage {} completed", spec.id),
            Err(e) => error!("Stage {} failed: {}", spec.id, e),
        }
        result
    }

    async fn execute(
        &self,
        spec: &StageSpec,
        input: &StageInput,
        supervisor: &mut ConnectionSupervisor,
        cancel: &CancelSignal,
    ) -> Result<StageResult> {
        self.connect_scoped(spec.id, spec.providers.as_deref(), supervisor)
            .await?;

        let router = supervisor.router();
        let snapshot = router.capabilities();
        debug!("Stage {} sees {} capabilities", spec.id, snapshot.len());

        let backend = self.backends.resolve(spec.backend.as_deref())?;
        let agent = Agent::new(spec.id.as_str(), spec.instructions.render(&snapshot), backend)
            .with_capabilities(snapshot)
            .with_max_turns(spec.max_turns);

        let message = input.to_message();
        let run = tokio::select! {
            result = agent.run(&router, &message) => result?,
            _ = cancel.cancelled() => {
                warn!("Stage {} cancelled", spec.id);
                return Err(PipelineError::Cancelled { stage: spec.id });
            }
        };

        let output = interpret(spec, &run)?;
        let tool_text = run.tool_outputs.iter().map(|o| o.text()).collect();
        Ok(StageResult::new(spec.id, output, run.output).with_tool_text(tool_text))
    }
}

/// Turn an agent run into the stage output.
///
/// With an acknowledgement capability the capability's own result decides
/// the outcome; the agent's answer is used only when that result carries no
/// status of its own.
fn interpret(spec: &StageSpec, run: &AgentRun) -> Result<StageOutput> {
    if !spec.structured {
        return Ok(StageOutput::Unvalidated(run.output.clone()));
    }

    if let Some(ref capability) = spec.ack_capability {
        let ack = run
            .tool_outputs
            .iter()
            .rev()
            .find(|output| &output.capability == capability)
            .ok_or_else(|| {
                PipelineError::notification(format!(
                    "'{}' was never invoked by stage {}",
                    capability, spec.id
                ))
            })?;

        match parse_value(spec.id, ack.to_value(), &ack.text()) {
            Ok(output) => return Ok(output),
            Err(e) => debug!("'{}' result is not an acknowledgement ({}), using agent answer", capability, e),
        }
    }

    parse_stage_output(spec.id, &run.output, true)
}
