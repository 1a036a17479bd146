// stdio transport for MCP
//
// Newline-delimited JSON-RPC over the stdin/stdout of a spawned server
// process. The server's stderr is forwarded to the log.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::{check_response, McpTransport, TransportError, DEFAULT_REQUEST_TIMEOUT};
use crate::mcp::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};

/// stdio transport for MCP server communication
pub struct StdioTransport {
    label: String,
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<BufReader<ChildStdout>>,
    next_id: AtomicI64,
    closed: AtomicBool,
    timeout: Duration,
}

impl StdioTransport {
    /// Create a new stdio transport by spawning an MCP server process
    pub async fn spawn(
        program: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        working_directory: Option<&Path>,
    ) -> Result<Self, TransportError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = working_directory {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| TransportError::Spawn {
            command: program.to_string(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Protocol("failed to capture server stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Protocol("failed to capture server stdout".into()))?;

        let label = program.to_string();

        // Spawn a task to read and log stderr
        if let Some(stderr) = child.stderr.take() {
            let label = label.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %label, "stderr: {}", line);
                }
            });
        }

        debug!("Spawned MCP server '{}' (pid {:?})", label, child.id());

        Ok(Self {
            label,
            child: Mutex::new(child),
            stdin: Mutex::new(Some(stdin)),
            stdout: Mutex::new(BufReader::new(stdout)),
            next_id: AtomicI64::new(1),
            closed: AtomicBool::new(false),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn write_line(&self, json: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(TransportError::Closed)?;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Read lines until the response carrying `id` shows up
    async fn read_response(
        &self,
        stdout: &mut BufReader<ChildStdout>,
        id: &RequestId,
    ) -> Result<JsonRpcResponse, TransportError> {
        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = stdout.read_line(&mut line).await?;
            if bytes_read == 0 {
                return Err(TransportError::Closed);
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let value: serde_json::Value = match serde_json::from_str(trimmed) {
                Ok(v) => v,
                Err(_) => {
                    // Servers sometimes print banners on stdout
                    debug!(server = %self.label, "ignoring non JSON-RPC line: {}", trimmed);
                    continue;
                }
            };

            // Notifications and responses to other requests are skipped
            match value.get("id") {
                Some(response_id) if value.get("method").is_none() => {
                    let response_id: RequestId = serde_json::from_value(response_id.clone())?;
                    if &response_id == id {
                        return Ok(serde_json::from_value(value)?);
                    }
                    trace!(server = %self.label, "skipping response to request {}", response_id);
                }
                _ => trace!(server = %self.label, "skipping message: {}", trimmed),
            }
        }
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(method, params, id);
        let request_json = serde_json::to_string(&request)?;
        trace!(server = %self.label, "-> {}", request_json);

        // One exchange at a time: holding stdout keeps concurrent callers
        // from consuming each other's responses
        let mut stdout = self.stdout.lock().await;
        self.write_line(&request_json).await?;

        let id = RequestId::Number(id);
        let response = tokio::time::timeout(self.timeout, self.read_response(&mut stdout, &id))
            .await
            .map_err(|_| TransportError::Timeout {
                method: method.to_string(),
                secs: self.timeout.as_secs(),
            })??;

        check_response(response)
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), TransportError> {
        let notification = JsonRpcNotification::new(method, params);
        let json = serde_json::to_string(&notification)?;
        self.write_line(&json).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Closing stdin is the polite shutdown; kill if it does not exit
        self.stdin.lock().await.take();
        let mut child = self.child.lock().await;
        match tokio::time::timeout(Duration::from_secs(2), child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                child.kill().await?;
            }
        }
        debug!("Closed MCP server '{}'", self.label);
        Ok(())
    }
}
