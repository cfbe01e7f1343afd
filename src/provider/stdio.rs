//! Stdio provider transport
//!
//! Spawns a provider as a child process and speaks newline-delimited JSON-RPC
//! over its stdin/stdout. Provider stderr is forwarded to the debug log.

use crate::config::{LaunchSpec, ProviderClientConfig, ProviderConfig};
use crate::error::{InvocationErrorKind, PipelineError, Result};
use crate::provider::connection::{Connector, ProviderConnection};
use crate::provider::types::{
    CapabilityDescriptor, JsonRpcError, JsonRpcMessage, JsonRpcRequest, ToolListResponse,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type PendingRequests = Arc<Mutex<HashMap<String, oneshot::Sender<JsonRpcMessage>>>>;

/// Why a request did not produce a result
#[derive(Debug)]
enum RpcFailure {
    Timeout,
    Closed,
    Transport(String),
    Remote(JsonRpcError),
}

impl RpcFailure {
    fn kind(&self) -> InvocationErrorKind {
        match self {
            RpcFailure::Timeout => InvocationErrorKind::Timeout,
            RpcFailure::Closed => InvocationErrorKind::Closed,
            RpcFailure::Transport(_) => InvocationErrorKind::Transport,
            RpcFailure::Remote(_) => InvocationErrorKind::Remote,
        }
    }

    fn describe(&self) -> String {
        match self {
            RpcFailure::Timeout => "request timed out".to_string(),
            RpcFailure::Closed => "connection closed".to_string(),
            RpcFailure::Transport(message) => message.clone(),
            RpcFailure::Remote(error) => format!("{} (code {})", error.message, error.code),
        }
    }
}

/// A provider process reached over its standard streams
pub struct StdioConnection {
    name: String,
    client_config: ProviderClientConfig,
    child: Mutex<Option<Child>>,
    stdin_sender: std::sync::Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: PendingRequests,
    alive: Arc<AtomicBool>,
    started_at: Instant,
}

impl StdioConnection {
    /// Spawn the provider process. The handshake is a separate step.
    pub fn spawn(name: &str, launch: &LaunchSpec, client_config: ProviderClientConfig) -> Result<Self> {
        let launch = launch.expanded();
        launch
            .validate()
            .map_err(|e| PipelineError::connection(name, format!("invalid launch spec: {}", e)))?;

        info!("Starting provider '{}': {} {:?}", name, launch.command, launch.args);

        let mut cmd = Command::new(&launch.command);
        cmd.args(&launch.args);

        if let Some(ref env) = launch.env {
            for (key, value) in env {
                cmd.env(key, value);
            }
        }

        if let Some(ref cwd) = launch.cwd {
            cmd.current_dir(cwd);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            PipelineError::connection(name, format!("failed to spawn '{}': {}", launch.command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PipelineError::connection(name, "failed to get stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::connection(name, "failed to get stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PipelineError::connection(name, "failed to get stderr"))?;

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();

        // Writer: one JSON document per line
        let provider = name.to_string();
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(message) = stdin_rx.recv().await {
                if let Err(e) = stdin.write_all(message.as_bytes()).await {
                    error!("Failed to write to provider '{}' stdin: {}", provider, e);
                    break;
                }
                if let Err(e) = stdin.write_all(b"\n").await {
                    error!("Failed to write newline to provider '{}' stdin: {}", provider, e);
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    error!("Failed to flush provider '{}' stdin: {}", provider, e);
                    break;
                }
            }
            debug!("Provider '{}' stdin writer ended", provider);
        });

        // Reader: match responses to pending requests
        let pending: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        {
            let pending = Arc::clone(&pending);
            let alive = Arc::clone(&alive);
            let provider = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    debug!("Provider '{}' stdout: {}", provider, line);

                    let message = match serde_json::from_str::<JsonRpcMessage>(&line) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!("Ignoring non JSON-RPC line from provider '{}': {} (line: {})", provider, e, line);
                            continue;
                        }
                    };

                    match message.response_key() {
                        Some(key) => {
                            let sender = pending.lock().await.remove(&key);
                            match sender {
                                Some(sender) => {
                                    if sender.send(message).is_err() {
                                        debug!("Waiter for request {} on provider '{}' is gone", key, provider);
                                    }
                                }
                                None => warn!("Unmatched response {} from provider '{}'", key, provider),
                            }
                        }
                        None => {
                            debug!(
                                "Skipping provider '{}' message {:?}",
                                provider,
                                message.method.as_deref().unwrap_or("<none>")
                            );
                        }
                    }
                }

                warn!("Provider '{}' stdout reader ended", provider);
                alive.store(false, Ordering::SeqCst);
                // Dropping the senders wakes every waiter with a closed channel
                pending.lock().await.clear();
            });
        }

        let provider = name.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("Provider '{}' stderr: {}", provider, line);
            }
        });

        debug!("Provider '{}' spawned with pid {:?}", name, child.id());

        Ok(Self {
            name: name.to_string(),
            client_config,
            child: Mutex::new(Some(child)),
            stdin_sender: std::sync::Mutex::new(Some(stdin_tx)),
            pending,
            alive,
            started_at: Instant::now(),
        })
    }

    /// Perform the initialize handshake, bounded by the connect timeout
    pub async fn handshake(&self) -> Result<Value> {
        debug!(
            "Initializing provider '{}' with protocol version {}, client {}@{}",
            self.name,
            self.client_config.protocol_version,
            self.client_config.client_name,
            self.client_config.client_version
        );

        let params = json!({
            "protocolVersion": self.client_config.protocol_version,
            "capabilities": {},
            "clientInfo": {
                "name": self.client_config.client_name,
                "version": self.client_config.client_version
            }
        });

        let wait = Duration::from_secs(self.client_config.connect_timeout_secs);
        let result = self
            .send_request("initialize", Some(params), wait)
            .await
            .map_err(|f| PipelineError::connection(&self.name, format!("initialize failed: {}", f.describe())))?;

        self.send_notification("notifications/initialized", None)
            .map_err(|f| PipelineError::connection(&self.name, f.describe()))?;

        if let Some(info) = result.get("serverInfo") {
            info!("Provider '{}' initialized: {}", self.name, info);
        } else {
            info!("Provider '{}' initialized", self.name);
        }
        Ok(result)
    }

    /// Process id while the child is running
    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(|child| child.id())
    }

    fn write_line(&self, line: String) -> std::result::Result<(), RpcFailure> {
        let sender = match self.stdin_sender.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => return Err(RpcFailure::Transport("stdin sender lock poisoned".to_string())),
        };

        match sender {
            Some(sender) => sender.send(line).map_err(|_| RpcFailure::Closed),
            None => Err(RpcFailure::Closed),
        }
    }

    fn send_notification(&self, method: &str, params: Option<Value>) -> std::result::Result<(), RpcFailure> {
        let line = serde_json::to_string(&JsonRpcRequest::notification(method, params))
            .map_err(|e| RpcFailure::Transport(format!("failed to serialize notification: {}", e)))?;
        self.write_line(line)
    }

    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        wait: Duration,
    ) -> std::result::Result<Value, RpcFailure> {
        if !self.is_alive() {
            return Err(RpcFailure::Closed);
        }

        let request_id = Uuid::new_v4().to_string();
        let line = serde_json::to_string(&JsonRpcRequest::request(request_id.clone(), method, params))
            .map_err(|e| RpcFailure::Transport(format!("failed to serialize request: {}", e)))?;

        debug!("Sending {} request {} to provider '{}'", method, request_id, self.name);

        let (response_tx, response_rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), response_tx);

        if let Err(failure) = self.write_line(line) {
            self.pending.lock().await.remove(&request_id);
            return Err(failure);
        }

        match timeout(wait, response_rx).await {
            Ok(Ok(message)) => match message.error {
                Some(error) => Err(RpcFailure::Remote(error)),
                None => Ok(message.result.unwrap_or(Value::Null)),
            },
            Ok(Err(_)) => Err(RpcFailure::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(RpcFailure::Timeout)
            }
        }
    }
}

#[async_trait]
impl ProviderConnection for StdioConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn list_capabilities(&self) -> Result<Vec<CapabilityDescriptor>> {
        let wait = Duration::from_secs(self.client_config.request_timeout_secs);
        let mut descriptors = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = match cursor {
                Some(ref c) => json!({ "cursor": c }),
                None => json!({}),
            };

            let result = self
                .send_request("tools/list", Some(params), wait)
                .await
                .map_err(|f| PipelineError::invocation(&self.name, "tools/list", f.kind(), f.describe()))?;

            let page: ToolListResponse = serde_json::from_value(result).map_err(|e| {
                PipelineError::invocation(
                    &self.name,
                    "tools/list",
                    InvocationErrorKind::Remote,
                    format!("malformed tool listing: {}", e),
                )
            })?;

            descriptors.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        info!("Discovered {} capabilities from provider '{}'", descriptors.len(), self.name);
        Ok(descriptors)
    }

    async fn invoke(&self, capability: &str, arguments: Value) -> Result<Value> {
        let wait = Duration::from_secs(self.client_config.request_timeout_secs);
        let params = json!({
            "name": capability,
            "arguments": arguments
        });

        self.send_request("tools/call", Some(params), wait)
            .await
            .map_err(|f| PipelineError::invocation(&self.name, capability, f.kind(), f.describe()))
    }

    async fn close(&self) -> Result<()> {
        self.alive.store(false, Ordering::SeqCst);

        // Closing stdin ends the writer task and lets well-behaved providers exit
        if let Ok(mut sender) = self.stdin_sender.lock() {
            sender.take();
        }

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            info!("Stopping provider '{}' after {:?}", self.name, self.started_at.elapsed());

            match timeout(Duration::from_millis(500), child.wait()).await {
                Ok(Ok(status)) => info!("Provider '{}' exited with status: {}", self.name, status),
                _ => match timeout(Duration::from_secs(5), child.kill()).await {
                    Ok(Ok(())) => info!("Provider '{}' killed", self.name),
                    Ok(Err(e)) => {
                        self.pending.lock().await.clear();
                        return Err(PipelineError::connection(
                            &self.name,
                            format!("failed to kill provider process: {}", e),
                        ));
                    }
                    Err(_) => warn!("Provider '{}' did not exit within timeout", self.name),
                },
            }
        }

        self.pending.lock().await.clear();
        Ok(())
    }
}

/// Default connector: launches providers as child processes
#[derive(Debug, Clone)]
pub struct StdioConnector {
    client_config: ProviderClientConfig,
}

impl StdioConnector {
    pub fn new(client_config: ProviderClientConfig) -> Self {
        Self { client_config }
    }
}

#[async_trait]
impl Connector for StdioConnector {
    async fn connect(&self, config: &ProviderConfig) -> Result<Arc<dyn ProviderConnection>> {
        let connection = StdioConnection::spawn(&config.name, &config.launch, self.client_config.clone())?;

        match connection.handshake().await {
            Ok(_) => Ok(Arc::new(connection)),
            Err(e) => {
                error!("Failed to initialize provider '{}': {}", config.name, e);
                if let Err(close_err) = connection.close().await {
                    warn!("Failed to stop provider '{}' after handshake failure: {}", config.name, close_err);
                }
                Err(e)
            }
        }
    }
}
