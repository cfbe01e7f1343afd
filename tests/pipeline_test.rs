//! End-to-end pipeline runs over in-memory providers, backends and renderers

mod common;

use agromesh::agent::{
    BackendRegistry, ChatRole, CompletionRequest, CompletionResponse, InferenceBackend,
};
use agromesh::config::Config;
use agromesh::error::{PipelineError, Result};
use agromesh::pipeline::{CancelSignal, PipelineOrchestrator, PipelineState, RunRequest};
use agromesh::render::{ImageRenderer, RenderedImage};
use agromesh::stage::StageId;
use async_trait::async_trait;
use common::*;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

const FINDINGS: &str = r#"{"pathogen": "Maize streak virus", "treatment": "Plant resistant hybrids", "medicine": "Imidacloprid seed dressing"}
Sources: https://www.fao.org/maize-streak https://www.cimmyt.org/msv https://example.com/blog"#;

const PROMPTS: &str = r#"```json
{"prompts": ["week 1 leaf", "week 2 leaf", "week 4 leaf", "week 6 plant", "week 8 field"],
 "captions": ["Early streaks", "Spreading", "Chlorosis", "Stunting", "Yield loss"]}
```"#;

struct Fixture {
    orchestrator: PipelineOrchestrator,
    log: EventLog,
    backend: Arc<ScriptedBackend>,
    output: TempDir,
}

fn config(output: &TempDir, max_images: usize) -> Config {
    let mut config = Config::default();
    config.stages.render.output_dir = output.path().to_string_lossy().to_string();
    config.stages.render.max_images = max_images;
    config.pipeline.recipients = vec!["farmer@example.com".to_string()];
    config
}

fn fixture(providers: Vec<FakeProvider>, script: Vec<CompletionResponse>, max_images: usize) -> Fixture {
    let output = TempDir::new().unwrap();
    let configs = providers.iter().map(|p| p.config()).collect();
    let connector = FakeConnector::new(providers);
    let log = connector.log.clone();
    let backend = Arc::new(ScriptedBackend::new(script));
    let orchestrator = PipelineOrchestrator::new(
        config(&output, max_images),
        configs,
        Arc::new(connector),
        backends(backend.clone()),
    );
    Fixture {
        orchestrator,
        log,
        backend,
        output,
    }
}

fn search() -> FakeProvider {
    FakeProvider::new("search", &["web_search"])
}

fn mail(status: &str) -> FakeProvider {
    FakeProvider::new("mail", &["send_mail"]).reply(
        "send_mail",
        FakeReply::Payload(json!({"status": status, "message": format!("mail {}", status)})),
    )
}

fn happy_script() -> Vec<CompletionResponse> {
    vec![
        call("r1", "web_search", json!({"query": "maize streak virus"})),
        text(FINDINGS),
        text(PROMPTS),
        call("n1", "send_mail", json!({"to": "farmer@example.com", "body": "<html/>"})),
        text(r#"{"status": "success"}"#),
    ]
}

fn request() -> RunRequest {
    RunRequest::new("Maize Streak Virus (MSV)", "Maize")
}

fn files_in(dir: &TempDir) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_full_run_completes_all_stages() {
    let f = fixture(vec![search(), mail("success")], happy_script(), 4);
    let renderer = Arc::new(FakeRenderer::default());
    let orchestrator = f.orchestrator.with_renderer(renderer.clone());

    let run = orchestrator.run(request()).await;

    assert!(run.failure.is_none(), "{:?}", run.failure);
    assert_eq!(run.state, PipelineState::Completed);
    assert!(run.finished_at.is_some());

    let stages: Vec<StageId> = run.results.iter().map(|r| r.stage).collect();
    assert_eq!(stages, StageId::ALL.to_vec());

    let findings = run.result(StageId::Research).unwrap().output.as_research().unwrap();
    assert_eq!(findings.pathogen, "Maize streak virus");

    // Five prompts, four rendered
    let rendered = run.result(StageId::Render).unwrap().output.as_rendered().unwrap();
    assert_eq!(rendered.artifacts.len(), 4);
    assert_eq!(renderer.render_count(), 4);
    assert_eq!(renderer.finishes.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(renderer.release_count(), 1);

    let files = files_in(&f.output);
    assert_eq!(files.len(), 4);
    assert!(files.iter().all(|name| name.starts_with("prompt_") && name.ends_with(".png")));
    assert_eq!(std::fs::read(&rendered.artifacts[0].path).unwrap(), b"week 1 leaf");

    let ack = run.result(StageId::Notify).unwrap().output.as_ack().unwrap();
    assert!(ack.is_success());
    assert_eq!(f.log.invocation_count("send_mail"), 1);

    let check = run.reference_check.as_ref().unwrap();
    assert_eq!(check.total, 3);
    assert_eq!(check.preferred, 2);
    assert!(check.passed);

    // Every stage connection was released
    assert_eq!(f.log.connects().len(), f.log.closes().len());
    assert_eq!(f.backend.remaining(), 0);
}

#[tokio::test]
async fn test_notify_instructions_carry_recipients_and_report() {
    let f = fixture(vec![search(), mail("success")], happy_script(), 2);
    let orchestrator = f.orchestrator.with_renderer(Arc::new(FakeRenderer::default()));

    let run = orchestrator
        .run(request().with_recipients(vec!["coop@example.org".to_string()]))
        .await;
    assert!(run.is_completed());

    let requests = f.backend.requests();
    let notify = requests.iter().find(|r| r.system.contains("coop@example.org")).unwrap();
    assert!(notify.messages[0].content.contains("Maize streak virus"));
}

#[tokio::test]
async fn test_render_cap_limits_artifacts() {
    let f = fixture(vec![search(), mail("success")], happy_script(), 2);
    let renderer = Arc::new(FakeRenderer::default());
    let orchestrator = f.orchestrator.with_renderer(renderer.clone());

    let run = orchestrator.run(request()).await;

    assert!(run.is_completed());
    assert_eq!(renderer.render_count(), 2);
    assert_eq!(
        *renderer.rendered.lock().unwrap(),
        vec!["week 1 leaf".to_string(), "week 2 leaf".to_string()]
    );
    assert_eq!(files_in(&f.output).len(), 2);
}

#[tokio::test]
async fn test_research_failure_stops_the_pipeline() {
    let f = fixture(
        vec![search(), mail("success")],
        vec![text("I could not find anything useful.")],
        4,
    );
    let renderer = Arc::new(FakeRenderer::default());
    let orchestrator = f.orchestrator.with_renderer(renderer.clone());

    let run = orchestrator.run(request()).await;

    assert_eq!(run.state, PipelineState::Failed(StageId::Research));
    let failure = run.failure.as_ref().unwrap();
    assert_eq!(failure.stage, StageId::Research);
    assert!(matches!(failure.error, PipelineError::SchemaValidation { .. }));
    assert!(run.results.is_empty());
    assert_eq!(renderer.render_count(), 0);
    assert_eq!(f.log.invocation_count("send_mail"), 0);
    assert!(files_in(&f.output).is_empty());
    assert_eq!(f.log.connects().len(), f.log.closes().len());
}

#[tokio::test]
async fn test_failed_notification_fails_the_run() {
    let f = fixture(vec![search(), mail("failure")], happy_script(), 4);
    let orchestrator = f.orchestrator.with_renderer(Arc::new(FakeRenderer::default()));

    let run = orchestrator.run(request()).await;

    assert_eq!(run.state, PipelineState::Failed(StageId::Notify));
    assert_eq!(run.results.len(), 3);
    match run.into_result() {
        Err(PipelineError::Notification { message }) => assert_eq!(message, "mail failure"),
        other => panic!("unexpected outcome: {:?}", other.map(|r| r.state)),
    }
}

#[tokio::test]
async fn test_notify_without_mail_call_is_a_failure() {
    let script = vec![
        text(FINDINGS),
        text(PROMPTS),
        text(r#"{"status": "success"}"#),
    ];
    let f = fixture(vec![search(), mail("success")], script, 4);
    let orchestrator = f.orchestrator.with_renderer(Arc::new(FakeRenderer::default()));

    let run = orchestrator.run(request()).await;

    assert_eq!(run.state, PipelineState::Failed(StageId::Notify));
    assert!(matches!(
        run.failure.as_ref().map(|f| &f.error),
        Some(PipelineError::Notification { .. })
    ));
}

/// Renderer that cancels the run while rendering its first image
struct CancellingRenderer {
    inner: FakeRenderer,
    cancel: CancelSignal,
}

#[async_trait]
impl ImageRenderer for CancellingRenderer {
    fn name(&self) -> &str {
        "cancelling-renderer"
    }

    async fn render(&self, prompt: &str) -> Result<RenderedImage> {
        self.cancel.cancel();
        self.inner.render(prompt).await
    }

    async fn release(&self) -> Result<()> {
        self.inner.release().await
    }
}

#[tokio::test]
async fn test_cancellation_still_releases_everything() {
    let f = fixture(vec![search(), mail("success")], happy_script(), 4);
    let cancel = CancelSignal::new();
    let renderer = Arc::new(CancellingRenderer {
        inner: FakeRenderer::default(),
        cancel: cancel.clone(),
    });
    let orchestrator = f.orchestrator.with_renderer(renderer.clone());

    let run = orchestrator.run_with_cancel(request(), cancel).await;

    assert_eq!(run.state, PipelineState::Failed(StageId::Render));
    assert!(matches!(
        run.failure.as_ref().map(|f| &f.error),
        Some(PipelineError::Cancelled { stage: StageId::Render })
    ));
    assert_eq!(renderer.inner.render_count(), 1);
    assert_eq!(renderer.inner.release_count(), 1);
    assert_eq!(f.log.invocation_count("send_mail"), 0);
    assert_eq!(f.log.connects().len(), f.log.closes().len());
}

#[tokio::test]
async fn test_render_through_imaging_provider() {
    let imaging = FakeProvider::new("imaging", &["generate_image", "release_model"]).reply(
        "generate_image",
        FakeReply::Payload(json!({
            "content": [{"type": "image", "data": "aGVsbG8=", "mimeType": "image/png"}]
        })),
    );
    let providers = vec![search(), mail("success"), imaging];
    let output = TempDir::new().unwrap();
    let mut config = config(&output, 2);
    config.stages.render.release_capability = Some("release_model".to_string());
    config.stages.render.providers = Some(vec!["imaging".to_string()]);

    let configs = providers.iter().map(|p| p.config()).collect();
    let connector = FakeConnector::new(providers);
    let log = connector.log.clone();
    let orchestrator = PipelineOrchestrator::new(
        config,
        configs,
        Arc::new(connector),
        backends(Arc::new(ScriptedBackend::new(happy_script()))),
    );

    let run = orchestrator.run(request()).await;

    assert!(run.is_completed(), "{:?}", run.failure);
    let files = files_in(&output);
    assert_eq!(files.len(), 2);
    assert_eq!(std::fs::read(output.path().join(&files[0])).unwrap(), b"hello");
    assert_eq!(log.invocation_count("generate_image"), 2);
    assert_eq!(log.invocation_count("release_model"), 1);
    assert_eq!(log.connects().len(), log.closes().len());
}

#[tokio::test]
async fn test_search_and_mail_run_renders_capped_prompts() {
    let search = FakeProvider::new("search", &["search"]);
    let mail = FakeProvider::new("mail", &["send_mail"]).reply(
        "send_mail",
        FakeReply::Payload(json!({"status": "success", "message": "sent"})),
    );
    let script = vec![
        call("r1", "search", json!({"query": "Maize Streak Virus"})),
        text(r#"{"pathogen": "Maize Streak Virus"}"#),
        text(PROMPTS),
        call("n1", "send_mail", json!({"to": "farmer@example.com", "body": "<html/>"})),
        text(r#"{"status": "success"}"#),
    ];
    let f = fixture(vec![search, mail], script, 4);
    let renderer = Arc::new(FakeRenderer::default());
    let orchestrator = f.orchestrator.with_renderer(renderer.clone());

    let run = orchestrator.run(request()).await;

    assert_eq!(run.state, PipelineState::Completed);
    assert_eq!(run.results.len(), 4);

    let findings = run.result(StageId::Research).unwrap().output.as_research().unwrap();
    assert_eq!(findings.pathogen, "Maize Streak Virus");
    assert!(findings.treatment.is_empty());

    let rendered = run.result(StageId::Render).unwrap().output.as_rendered().unwrap();
    let indices: Vec<usize> = rendered.artifacts.iter().map(|a| a.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);
    assert_eq!(renderer.render_count(), 4);

    assert_eq!(f.log.invocation_count("search"), 1);
    assert_eq!(f.log.invocation_count("send_mail"), 1);
    assert_eq!(f.log.connects().len(), f.log.closes().len());
}

#[tokio::test]
async fn test_unusable_prompts_fail_at_prompt_synthesis() {
    let script = vec![text(FINDINGS), text("Draw a sick maize leaf, then a field.")];
    let f = fixture(vec![search(), mail("success")], script, 4);
    let renderer = Arc::new(FakeRenderer::default());
    let orchestrator = f.orchestrator.with_renderer(renderer.clone());

    let run = orchestrator.run(request()).await;

    assert_eq!(run.state, PipelineState::Failed(StageId::PromptSynthesis));
    let failure = run.failure.as_ref().unwrap();
    assert_eq!(failure.stage, StageId::PromptSynthesis);
    assert!(matches!(
        failure.error,
        PipelineError::SchemaValidation { stage: StageId::PromptSynthesis, .. }
    ));
    let stages: Vec<StageId> = run.results.iter().map(|r| r.stage).collect();
    assert_eq!(stages, vec![StageId::Research]);
    assert_eq!(renderer.render_count(), 0);
    assert_eq!(renderer.release_count(), 0);
    assert_eq!(f.log.invocation_count("send_mail"), 0);
    assert_eq!(f.log.connects().len(), f.log.closes().len());
}

#[tokio::test]
async fn test_reference_check_counts_links_from_search_results() {
    let search = FakeProvider::new("search", &["web_search"]).reply(
        "web_search",
        FakeReply::Payload(json!({
            "content": [{"type": "text", "text": "Maize streak: https://www.fao.org/msv https://iita.org/msv"}]
        })),
    );
    let script = vec![
        call("r1", "web_search", json!({"query": "maize streak virus"})),
        text(r#"{"pathogen": "Maize Streak Virus"}"#),
        text(PROMPTS),
        call("n1", "send_mail", json!({"to": "farmer@example.com"})),
        text(r#"{"status": "success"}"#),
    ];
    let f = fixture(vec![search, mail("success")], script, 1);
    let orchestrator = f.orchestrator.with_renderer(Arc::new(FakeRenderer::default()));

    let run = orchestrator.run(request()).await;

    assert!(run.is_completed(), "{:?}", run.failure);
    let research = run.result(StageId::Research).unwrap();
    assert_eq!(research.tool_text.len(), 1);
    let check = run.reference_check.as_ref().unwrap();
    assert_eq!(check.total, 2);
    assert_eq!(check.preferred, 2);
    assert!(check.passed);
}

/// Answers every stage from its instructions, so interleaved runs can share it
struct StageAwareBackend;

#[async_trait]
impl InferenceBackend for StageAwareBackend {
    fn name(&self) -> &str {
        "stage-aware"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        tokio::task::yield_now().await;
        if request.system.contains("diagnosis researcher") {
            return Ok(text(FINDINGS));
        }
        if request.system.contains("visual crop disease") {
            return Ok(text(PROMPTS));
        }
        if request.messages.iter().any(|m| m.role == ChatRole::Tool) {
            return Ok(text(r#"{"status": "success"}"#));
        }
        Ok(call("n1", "send_mail", json!({"to": "farmer@example.com"})))
    }
}

/// Renderer that records renders and releases in the order they happen
#[derive(Default)]
struct SequencedRenderer {
    events: std::sync::Mutex<Vec<&'static str>>,
}

#[async_trait]
impl ImageRenderer for SequencedRenderer {
    fn name(&self) -> &str {
        "sequenced-renderer"
    }

    async fn render(&self, prompt: &str) -> Result<RenderedImage> {
        self.events.lock().unwrap().push("render");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        Ok(RenderedImage::png(prompt.as_bytes().to_vec()))
    }

    async fn release(&self) -> Result<()> {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        self.events.lock().unwrap().push("release");
        Ok(())
    }
}

#[tokio::test]
async fn test_concurrent_runs_never_share_the_renderer() {
    let output = TempDir::new().unwrap();
    let providers = vec![search(), mail("success")];
    let configs = providers.iter().map(|p| p.config()).collect();
    let connector = FakeConnector::new(providers);
    let log = connector.log.clone();
    let mut registry = BackendRegistry::new("stage-aware");
    registry.register("stage-aware", Arc::new(StageAwareBackend));

    let renderer = Arc::new(SequencedRenderer::default());
    let orchestrator = PipelineOrchestrator::new(config(&output, 2), configs, Arc::new(connector), registry)
        .with_renderer(renderer.clone());

    let (first, second) = tokio::join!(orchestrator.run(request()), orchestrator.run(request()));

    assert!(first.is_completed(), "{:?}", first.failure);
    assert!(second.is_completed(), "{:?}", second.failure);
    assert_ne!(first.id, second.id);

    // Each run renders and releases before the other one starts rendering
    let events = renderer.events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec!["render", "render", "release", "render", "render", "release"]
    );
    assert_eq!(log.invocation_count("send_mail"), 2);
    assert_eq!(log.connects().len(), log.closes().len());
}
