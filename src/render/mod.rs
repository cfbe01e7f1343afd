//! Image rendering stage
//!
//! Renders a bounded prefix of the synthesized prompts one at a time and
//! persists each image before the next render starts.

use crate::config::RenderStageConfig;
use crate::error::{PipelineError, Result};
use crate::provider::{ConnectionSupervisor, ScarceResource};
use crate::routing::ToolRouter;
use crate::stage::{Artifact, CancelSignal, PromptSet, RenderedArtifacts, StageId, StageOutput, StageResult, StageRunner};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Local, TimeZone};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Encoded image bytes
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedImage {
    pub bytes: Vec<u8>,
    /// File extension without the dot
    pub extension: String,
}

impl RenderedImage {
    pub fn png(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            extension: "png".to_string(),
        }
    }
}

/// Turns a prompt into an image
#[async_trait]
pub trait ImageRenderer: Send + Sync {
    fn name(&self) -> &str;

    async fn render(&self, prompt: &str) -> Result<RenderedImage>;

    /// Called after the last render of a stage, while providers are still connected
    async fn finish(&self) -> Result<()> {
        Ok(())
    }

    /// Release held resources (model weights, accelerator memory)
    async fn release(&self) -> Result<()>;
}

/// Renderer backed by a provider capability returning base64 image content
pub struct CapabilityRenderer {
    router: ToolRouter,
    capability: String,
    release_capability: Option<String>,
}

impl CapabilityRenderer {
    pub fn new<S: Into<String>>(router: ToolRouter, capability: S, release_capability: Option<String>) -> Self {
        Self {
            router,
            capability: capability.into(),
            release_capability,
        }
    }
}

fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "png",
    }
}

/// Decode base64 image data, accepting `data:` URLs
pub fn decode_image(data: &str) -> Result<Vec<u8>> {
    let payload = match data.find(";base64,") {
        Some(pos) if data.starts_with("data:") => &data[pos + ";base64,".len()..],
        _ => data,
    };
    STANDARD
        .decode(payload.trim())
        .map_err(|e| PipelineError::render(format!("image data is not valid base64: {}", e)))
}

#[async_trait]
impl ImageRenderer for CapabilityRenderer {
    fn name(&self) -> &str {
        &self.capability
    }

    async fn render(&self, prompt: &str) -> Result<RenderedImage> {
        let output = self
            .router
            .invoke(&self.capability, json!({ "prompt": prompt }))
            .await?;

        if let Some((data, mime_type)) = output.first_image() {
            return Ok(RenderedImage {
                bytes: decode_image(data)?,
                extension: extension_for(mime_type).to_string(),
            });
        }

        // Some providers answer with `{"image": "<base64>"}`
        if let Some(data) = output
            .structured
            .as_ref()
            .and_then(|s| s.get("image"))
            .and_then(|v| v.as_str())
        {
            return Ok(RenderedImage::png(decode_image(data)?));
        }

        Err(PipelineError::render(format!(
            "'{}' returned no image content",
            self.capability
        )))
    }

    async fn finish(&self) -> Result<()> {
        if let Some(ref capability) = self.release_capability {
            info!("Asking provider to release render resources via '{}'", capability);
            self.router.invoke(capability, json!({})).await?;
        }
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        debug!("Renderer '{}' released", self.capability);
        Ok(())
    }
}

/// Holds a renderer until supervisor cleanup
struct RendererResource(Arc<dyn ImageRenderer>);

#[async_trait]
impl ScarceResource for RendererResource {
    fn resource_name(&self) -> &str {
        self.0.name()
    }

    async fn release(&self) -> Result<()> {
        self.0.release().await
    }
}

/// File name for the `index`-th render captured at `at`
pub fn artifact_name<Tz: TimeZone>(index: usize, at: &DateTime<Tz>, extension: &str) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("prompt_{}_{}.{}", index, at.format("%Y_%m_%d_%H%M%S"), extension)
}

/// The render stage
pub struct RenderStage {
    config: RenderStageConfig,
    renderer: Option<Arc<dyn ImageRenderer>>,
}

impl RenderStage {
    pub fn new(config: RenderStageConfig) -> Self {
        Self { config, renderer: None }
    }

    /// Render with an in-process renderer instead of a provider capability
    pub fn with_renderer(mut self, renderer: Arc<dyn ImageRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn output_dir(&self) -> &Path {
        Path::new(&self.config.output_dir)
    }

    /// Render the capped prompt prefix. Connections and the renderer are
    /// released before this returns.
    pub async fn run(
        &self,
        prompts: &PromptSet,
        runner: &StageRunner,
        supervisor: &mut ConnectionSupervisor,
        cancel: &CancelSignal,
        render_lock: &Mutex<()>,
    ) -> Result<StageResult> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled { stage: StageId::Render });
        }

        // One renderer alive at a time across runs, from connect until teardown
        let _guard = render_lock.lock().await;

        info!("Running stage {}", StageId::Render);
        let result = self.execute(prompts, runner, supervisor, cancel).await;

        for failure in supervisor.cleanup().await {
            warn!(
                "Teardown after stage {} failed for '{}': {}",
                StageId::Render,
                failure.provider,
                failure.error
            );
        }
        result
    }

    async fn renderer(
        &self,
        runner: &StageRunner,
        supervisor: &mut ConnectionSupervisor,
    ) -> Result<Arc<dyn ImageRenderer>> {
        if let Some(ref renderer) = self.renderer {
            return Ok(Arc::clone(renderer));
        }

        runner
            .connect_scoped(StageId::Render, self.config.providers.as_deref(), supervisor)
            .await?;

        let router = supervisor.router();
        if !router.registry().contains(&self.config.capability) {
            return Err(PipelineError::unknown_capability(&self.config.capability));
        }

        Ok(Arc::new(CapabilityRenderer::new(
            router,
            self.config.capability.clone(),
            self.config.release_capability.clone(),
        )))
    }

    async fn execute(
        &self,
        prompts: &PromptSet,
        runner: &StageRunner,
        supervisor: &mut ConnectionSupervisor,
        cancel: &CancelSignal,
    ) -> Result<StageResult> {
        let renderer = self.renderer(runner, supervisor).await?;
        supervisor.hold_resource(Arc::new(RendererResource(Arc::clone(&renderer))));

        let output_dir = PathBuf::from(&self.config.output_dir);
        tokio::fs::create_dir_all(&output_dir).await?;

        let count = prompts.prompts.len().min(self.config.max_images);
        if prompts.prompts.len() > count {
            info!(
                "Rendering the first {} of {} prompts",
                count,
                prompts.prompts.len()
            );
        }

        let mut artifacts = Vec::with_capacity(count);
        for (index, prompt) in prompts.prompts.iter().take(count).enumerate() {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled { stage: StageId::Render });
            }

            debug!("Rendering prompt {}: {}", index, prompt);
            let image = renderer.render(prompt).await?;

            let path = output_dir.join(artifact_name(index, &Local::now(), &image.extension));
            tokio::fs::write(&path, &image.bytes).await?;
            info!("Saved {}", path.display());

            artifacts.push(Artifact {
                index,
                prompt: prompt.clone(),
                path,
            });
        }

        if let Err(e) = renderer.finish().await {
            warn!("Renderer '{}' failed to finish cleanly: {}", renderer.name(), e);
        }

        let rendered = RenderedArtifacts { artifacts };
        let raw = serde_json::to_string(&rendered)?;
        Ok(StageResult::new(StageId::Render, StageOutput::Rendered(rendered), raw))
    }
}
