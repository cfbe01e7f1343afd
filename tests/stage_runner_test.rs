//! Stage runner: scoped connections, capability snapshots, schema checks and teardown

mod common;

use agromesh::agent::{BackendRegistry, CompletionRequest, CompletionResponse, InferenceBackend};
use agromesh::config::ProviderConfig;
use agromesh::error::{PipelineError, Result};
use agromesh::provider::ConnectionSupervisor;
use agromesh::stage::{
    CancelSignal, InstructionTemplate, StageId, StageInput, StageOutput, StageRunner, StageSpec,
};
use async_trait::async_trait;
use common::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    runner: StageRunner,
    supervisor: ConnectionSupervisor,
    log: EventLog,
    backend: Arc<ScriptedBackend>,
}

fn harness(providers: Vec<FakeProvider>, configs: Vec<ProviderConfig>, script: Vec<CompletionResponse>) -> Harness {
    let connector = FakeConnector::new(providers);
    let log = connector.log.clone();
    let backend = Arc::new(ScriptedBackend::new(script));
    Harness {
        runner: StageRunner::new(Arc::new(backends(backend.clone())), Arc::new(configs)),
        supervisor: ConnectionSupervisor::new(Arc::new(connector)),
        log,
        backend,
    }
}

fn research_spec() -> StageSpec {
    StageSpec::new(StageId::Research, InstructionTemplate::Text("research".to_string()))
}

fn query() -> StageInput {
    StageInput::Query {
        query: "Maize Streak Virus (MSV)".to_string(),
        crop: "Maize".to_string(),
    }
}

#[tokio::test]
async fn test_stage_routes_tool_calls_and_validates_answer() {
    let search = FakeProvider::new("search", &["web_search"]);
    let mut h = harness(
        vec![search.clone()],
        vec![search.config()],
        vec![
            call("c1", "web_search", json!({"query": "maize streak"})),
            text(r#"{"pathogen": "Maize streak virus", "treatment": "resistant varieties", "medicine": "none"}"#),
        ],
    );

    let result = h
        .runner
        .run(&research_spec(), &query(), &mut h.supervisor, &CancelSignal::new())
        .await
        .unwrap();

    let findings = result.output.as_research().unwrap();
    assert_eq!(findings.pathogen, "Maize streak virus");
    assert_eq!(h.log.invocations(), vec!["search:web_search".to_string()]);
    assert_eq!(h.log.closes(), vec!["search".to_string()]);
    assert!(h.supervisor.connection_names().is_empty());
}

#[tokio::test]
async fn test_backend_sees_the_registry_snapshot() {
    let search = FakeProvider::new("search", &["web_search", "fetch_page"]);
    let mail = FakeProvider::new("mail", &["send_mail"]);
    let mut h = harness(
        vec![search.clone(), mail.clone()],
        vec![search.config(), mail.config()],
        vec![text(r#"{"pathogen": "MSV"}"#)],
    );

    h.runner
        .run(&research_spec(), &query(), &mut h.supervisor, &CancelSignal::new())
        .await
        .unwrap();

    let requests = h.backend.requests();
    assert_eq!(requests.len(), 1);
    let tools: Vec<&str> = requests[0].tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(tools, vec!["web_search", "fetch_page", "send_mail"]);
}

#[tokio::test]
async fn test_schema_failure_carries_raw_output_and_cleans_up() {
    let search = FakeProvider::new("search", &["web_search"]);
    let mut h = harness(
        vec![search.clone()],
        vec![search.config()],
        vec![text("The pathogen is probably a virus.")],
    );

    let err = h
        .runner
        .run(&research_spec(), &query(), &mut h.supervisor, &CancelSignal::new())
        .await
        .unwrap_err();

    match err {
        PipelineError::SchemaValidation { stage, raw, .. } => {
            assert_eq!(stage, StageId::Research);
            assert_eq!(raw, "The pathogen is probably a virus.");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(h.log.closes(), vec!["search".to_string()]);
}

#[tokio::test]
async fn test_unstructured_stage_keeps_raw_answer() {
    let mut h = harness(vec![], vec![], vec![text("free-form findings")]);
    let mut spec = research_spec();
    spec.structured = false;

    let result = h
        .runner
        .run(&spec, &query(), &mut h.supervisor, &CancelSignal::new())
        .await
        .unwrap();

    assert_eq!(result.output, StageOutput::Unvalidated("free-form findings".to_string()));
}

#[tokio::test]
async fn test_scoped_provider_failure_stops_the_stage() {
    let search = FakeProvider::new("search", &["web_search"]);
    let mut h = harness(
        vec![search.clone()],
        vec![search.config(), invalid_provider_config("imaging")],
        vec![text(r#"{"pathogen": "MSV"}"#)],
    );
    let mut spec = research_spec();
    spec.providers = Some(vec!["search".to_string(), "imaging".to_string()]);

    let err = h
        .runner
        .run(&spec, &query(), &mut h.supervisor, &CancelSignal::new())
        .await
        .unwrap_err();

    match err {
        PipelineError::Connection { provider, .. } => assert_eq!(provider, "imaging"),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(h.backend.remaining(), 1);
    assert_eq!(h.log.closes(), vec!["search".to_string()]);
}

#[tokio::test]
async fn test_unscoped_stage_tolerates_failed_providers() {
    let search = FakeProvider::new("search", &["web_search"]);
    let mut h = harness(
        vec![search.clone()],
        vec![search.config(), invalid_provider_config("imaging")],
        vec![text(r#"{"pathogen": "MSV"}"#)],
    );

    let result = h
        .runner
        .run(&research_spec(), &query(), &mut h.supervisor, &CancelSignal::new())
        .await
        .unwrap();

    assert!(result.output.as_research().is_some());
    assert_eq!(h.backend.requests()[0].tools.len(), 1);
}

#[tokio::test]
async fn test_unknown_scoped_provider_is_config_error() {
    let mut h = harness(vec![], vec![], vec![]);
    let mut spec = research_spec();
    spec.providers = Some(vec!["nowhere".to_string()]);

    let err = h
        .runner
        .run(&spec, &query(), &mut h.supervisor, &CancelSignal::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Config { .. }));
}

#[tokio::test]
async fn test_unknown_capability_from_model_fails_the_stage() {
    let search = FakeProvider::new("search", &["web_search"]);
    let mut h = harness(
        vec![search.clone()],
        vec![search.config()],
        vec![call("c1", "generate_image", json!({"prompt": "leaf"}))],
    );

    let err = h
        .runner
        .run(&research_spec(), &query(), &mut h.supervisor, &CancelSignal::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::UnknownCapability { .. }));
    assert!(h.log.invocations().is_empty());
    assert_eq!(h.log.closes(), vec!["search".to_string()]);
}

#[tokio::test]
async fn test_cancelled_before_start_connects_nothing() {
    let search = FakeProvider::new("search", &["web_search"]);
    let mut h = harness(vec![search.clone()], vec![search.config()], vec![]);
    let cancel = CancelSignal::new();
    cancel.cancel();

    let err = h
        .runner
        .run(&research_spec(), &query(), &mut h.supervisor, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Cancelled { stage: StageId::Research }));
    assert!(h.log.connects().is_empty());
}

/// Backend that never answers
struct StalledBackend;

#[async_trait]
impl InferenceBackend for StalledBackend {
    fn name(&self) -> &str {
        "stalled"
    }

    async fn complete(&self, _request: &CompletionRequest) -> Result<CompletionResponse> {
        std::future::pending::<()>().await;
        Err(PipelineError::backend("unreachable"))
    }
}

#[tokio::test]
async fn test_cancel_interrupts_a_running_agent() {
    let search = FakeProvider::new("search", &["web_search"]);
    let connector = FakeConnector::new(vec![search.clone()]);
    let log = connector.log.clone();

    let mut registry = BackendRegistry::new("stalled");
    registry.register("stalled", Arc::new(StalledBackend));
    let runner = StageRunner::new(Arc::new(registry), Arc::new(vec![search.config()]));
    let mut supervisor = ConnectionSupervisor::new(Arc::new(connector));

    let cancel = CancelSignal::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        runner.run(&research_spec(), &query(), &mut supervisor, &cancel),
    )
    .await
    .expect("cancellation must end the stage");

    assert!(matches!(result, Err(PipelineError::Cancelled { .. })));
    assert_eq!(log.connects(), vec!["search".to_string()]);
    assert_eq!(log.closes(), vec!["search".to_string()]);
}
