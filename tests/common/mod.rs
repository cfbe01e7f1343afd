//! In-memory providers, backends and renderers shared by the integration tests

#![allow(dead_code)]

use agromesh::agent::{
    BackendRegistry, CompletionRequest, CompletionResponse, InferenceBackend, ToolCallRequest,
};
use agromesh::config::{LaunchSpec, ProviderConfig};
use agromesh::error::{InvocationErrorKind, PipelineError, Result};
use agromesh::provider::{CapabilityDescriptor, Connector, ProviderConnection, ScarceResource};
use agromesh::render::{ImageRenderer, RenderedImage};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Ordered record of everything the fakes were asked to do
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn with_prefix(&self, prefix: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| e.strip_prefix(prefix).map(|s| s.to_string()))
            .collect()
    }

    /// Provider names in the order they were connected
    pub fn connects(&self) -> Vec<String> {
        self.with_prefix("connect:")
    }

    /// Provider names in the order they were closed
    pub fn closes(&self) -> Vec<String> {
        self.with_prefix("close:")
    }

    /// `provider:capability` for every invocation
    pub fn invocations(&self) -> Vec<String> {
        self.with_prefix("invoke:")
    }

    /// How often a capability was invoked on any provider
    pub fn invocation_count(&self, capability: &str) -> usize {
        self.invocations()
            .iter()
            .filter(|i| i.split(':').nth(1) == Some(capability))
            .count()
    }
}

/// How a fake provider answers one capability
#[derive(Clone)]
pub enum FakeReply {
    /// Return this payload as the raw provider result
    Payload(Value),
    /// Fail with a provider invocation error
    Invocation(InvocationErrorKind, String),
    /// Fail with an error that is not an invocation error
    Broken(String),
}

#[derive(Clone)]
pub struct FakeProvider {
    pub name: String,
    pub capabilities: Vec<CapabilityDescriptor>,
    pub replies: HashMap<String, FakeReply>,
    pub fail_close: bool,
    pub fail_listing: bool,
}

impl FakeProvider {
    pub fn new(name: &str, capabilities: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            capabilities: capabilities.iter().map(|c| descriptor(c)).collect(),
            replies: HashMap::new(),
            fail_close: false,
            fail_listing: false,
        }
    }

    pub fn reply(mut self, capability: &str, reply: FakeReply) -> Self {
        self.replies.insert(capability.to_string(), reply);
        self
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn failing_listing(mut self) -> Self {
        self.fail_listing = true;
        self
    }

    /// Config that launches this provider through the fake connector
    pub fn config(&self) -> ProviderConfig {
        provider_config(&self.name)
    }
}

pub fn descriptor(name: &str) -> CapabilityDescriptor {
    CapabilityDescriptor::new(name, format!("{} capability", name), json!({"type": "object"}))
}

pub fn provider_config(name: &str) -> ProviderConfig {
    ProviderConfig::new(name, LaunchSpec::new(format!("fake-{}", name), vec![]))
}

/// A config whose launch spec fails validation
pub fn invalid_provider_config(name: &str) -> ProviderConfig {
    ProviderConfig::new(name, LaunchSpec::new("", vec![]))
}

pub struct FakeConnection {
    provider: FakeProvider,
    log: EventLog,
    alive: AtomicBool,
}

#[async_trait]
impl ProviderConnection for FakeConnection {
    fn name(&self) -> &str {
        &self.provider.name
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn list_capabilities(&self) -> Result<Vec<CapabilityDescriptor>> {
        if self.provider.fail_listing {
            return Err(PipelineError::invocation(
                &self.provider.name,
                "tools/list",
                InvocationErrorKind::Transport,
                "listing failed",
            ));
        }
        Ok(self.provider.capabilities.clone())
    }

    async fn invoke(&self, capability: &str, _arguments: Value) -> Result<Value> {
        self.log.push(format!("invoke:{}:{}", self.provider.name, capability));
        match self.provider.replies.get(capability) {
            Some(FakeReply::Payload(value)) => Ok(value.clone()),
            Some(FakeReply::Invocation(kind, message)) => Err(PipelineError::invocation(
                &self.provider.name,
                capability,
                *kind,
                message.clone(),
            )),
            Some(FakeReply::Broken(message)) => Err(PipelineError::validation(message.clone())),
            None => Ok(json!({
                "content": [{"type": "text", "text": format!("{} result", capability)}]
            })),
        }
    }

    async fn close(&self) -> Result<()> {
        self.log.push(format!("close:{}", self.provider.name));
        self.alive.store(false, Ordering::SeqCst);
        if self.provider.fail_close {
            return Err(PipelineError::connection(&self.provider.name, "close failed"));
        }
        Ok(())
    }
}

/// Connects providers by name from a fixed set
#[derive(Clone)]
pub struct FakeConnector {
    providers: HashMap<String, FakeProvider>,
    pub log: EventLog,
}

impl FakeConnector {
    pub fn new(providers: Vec<FakeProvider>) -> Self {
        Self {
            providers: providers.into_iter().map(|p| (p.name.clone(), p)).collect(),
            log: EventLog::default(),
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, config: &ProviderConfig) -> Result<Arc<dyn ProviderConnection>> {
        config
            .launch
            .expanded()
            .validate()
            .map_err(|e| PipelineError::connection(&config.name, e))?;

        let provider = self
            .providers
            .get(&config.name)
            .cloned()
            .ok_or_else(|| PipelineError::connection(&config.name, "no such provider"))?;

        self.log.push(format!("connect:{}", config.name));
        Ok(Arc::new(FakeConnection {
            provider,
            log: self.log.clone(),
            alive: AtomicBool::new(true),
        }))
    }
}

/// Backend that plays back a fixed script of responses
#[derive(Default)]
pub struct ScriptedBackend {
    script: Mutex<VecDeque<CompletionResponse>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedBackend {
    pub fn new(script: Vec<CompletionResponse>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        self.requests.lock().unwrap().push(request.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| PipelineError::backend("script exhausted"))
    }
}

pub fn text(content: &str) -> CompletionResponse {
    CompletionResponse::text(content)
}

pub fn call(id: &str, capability: &str, arguments: Value) -> CompletionResponse {
    CompletionResponse::calls(vec![ToolCallRequest::new(id, capability, arguments)])
}

pub fn backends(backend: Arc<ScriptedBackend>) -> BackendRegistry {
    let mut registry = BackendRegistry::new("scripted");
    registry.register("scripted", backend);
    registry
}

/// Renderer that writes the prompt text as the image bytes
#[derive(Default)]
pub struct FakeRenderer {
    pub rendered: Mutex<Vec<String>>,
    pub finishes: AtomicUsize,
    pub releases: AtomicUsize,
}

impl FakeRenderer {
    pub fn render_count(&self) -> usize {
        self.rendered.lock().unwrap().len()
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageRenderer for FakeRenderer {
    fn name(&self) -> &str {
        "fake-renderer"
    }

    async fn render(&self, prompt: &str) -> Result<RenderedImage> {
        self.rendered.lock().unwrap().push(prompt.to_string());
        Ok(RenderedImage::png(prompt.as_bytes().to_vec()))
    }

    async fn finish(&self) -> Result<()> {
        self.finishes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Scarce resource that counts releases
pub struct CountingResource {
    pub name: String,
    pub releases: AtomicUsize,
}

impl CountingResource {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            releases: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ScarceResource for CountingResource {
    fn resource_name(&self) -> &str {
        &self.name
    }

    async fn release(&self) -> Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
