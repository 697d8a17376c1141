//! One supervised language server child process.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use lsp_types::notification::{Exit, Initialized};
use lsp_types::request::{Initialize, Shutdown};
use lsp_types::{
    ClientCapabilities, CodeActionClientCapabilities, CodeActionKindLiteralSupport,
    CodeActionLiteralSupport, HoverClientCapabilities, InitializeParams, InitializeResult,
    InitializedParams, MarkupKind, PublishDiagnosticsClientCapabilities, RenameClientCapabilities,
    ServerCapabilities, TextDocumentClientCapabilities, TextDocumentSyncClientCapabilities,
    WorkspaceFolder,
};
use tokio::io::AsyncBufReadExt;
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ServerSpec;
use crate::edits::PositionEncoding;
use crate::error::{Error, Result};
use crate::rpc::RpcClient;
use crate::sync::{DiagnosticsStore, DocumentTracker};
use crate::uri::file_uri;

/// How long a freshly spawned child gets to prove it didn't die on arrival.
const SPAWN_GRACE: Duration = Duration::from_millis(200);
const INITIALIZE_DEADLINE: Duration = Duration::from_secs(10);
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);
const EXIT_WAIT: Duration = Duration::from_secs(2);
const KILL_WAIT: Duration = Duration::from_secs(1);
const STDERR_TAIL_LINES: usize = 40;

/// Bounded ring of the child's most recent stderr lines.
///
/// Stderr is otherwise discarded; the tail only surfaces in `spawn-failed`
/// summaries and debug logs.
#[derive(Clone, Default)]
pub(crate) struct StderrTail {
    lines: Arc<StdMutex<VecDeque<String>>>,
}

impl StderrTail {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock().expect("stderr tail poisoned");
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// One-line summary of the last few stderr lines.
    pub(crate) fn summary(&self) -> String {
        let lines = self.lines.lock().expect("stderr tail poisoned");
        if lines.is_empty() {
            return "<no stderr output>".to_string();
        }
        lines
            .iter()
            .rev()
            .take(5)
            .rev()
            .cloned()
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// A running, initialized language server.
///
/// The handle owns the child process, the RPC connection, the open-document
/// tracker, and the diagnostics cache. It is created only by a successful
/// spawn + `initialize` handshake, so holding one implies the invariant
/// "initialized ⇒ child running and rpc usable".
pub struct ServerHandle {
    name: String,
    command: Vec<String>,
    pid: u32,
    rpc: RpcClient,
    child: Mutex<Child>,
    created_at: Instant,
    last_used_ms: AtomicU64,
    docs: DocumentTracker,
    diagnostics: Arc<DiagnosticsStore>,
    capabilities: ServerCapabilities,
    position_encoding: PositionEncoding,
}

impl ServerHandle {
    /// Spawns the server described by `spec`, performs the `initialize`
    /// handshake, and returns a ready handle.
    pub(crate) async fn spawn(spec: &ServerSpec, workspace_root: &Path) -> Result<Arc<Self>> {
        let program = spec.command.first().ok_or_else(|| {
            Error::SpawnFailed(format!("server `{}` has an empty command", spec.name))
        })?;

        info!(server = %spec.name, command = ?spec.command, "starting language server");
        let mut child = Command::new(program)
            .args(&spec.command[1..])
            .envs(&spec.env)
            .current_dir(workspace_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    Error::SpawnFailed(format!("binary not found: {}", program))
                }
                _ => Error::SpawnFailed(format!("failed to launch {}: {}", program, e)),
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::SpawnFailed("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::SpawnFailed("child stdout unavailable".to_string()))?;

        let stderr_tail = StderrTail::default();
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr, spec.name.clone(), stderr_tail.clone()));
        }

        // Catch servers that die on arrival (bad flags, missing runtime)
        // before wasting the full initialize deadline on them.
        tokio::time::sleep(SPAWN_GRACE).await;
        if let Some(status) = child
            .try_wait()
            .map_err(|e| Error::SpawnFailed(e.to_string()))?
        {
            return Err(Error::SpawnFailed(format!(
                "{} exited during startup ({}): {}",
                program,
                status,
                stderr_tail.summary()
            )));
        }

        let pid = child.id().unwrap_or_default();
        let rpc = RpcClient::new(stdin, stdout);
        let diagnostics = DiagnosticsStore::attach(&rpc);

        let result = match initialize(&rpc, workspace_root).await {
            Ok(result) => result,
            Err(e) => {
                warn!(server = %spec.name, "initialize failed: {}", e);
                rpc.close().await;
                terminate(&mut child).await;
                return Err(e);
            }
        };

        let capabilities = result.capabilities;
        let position_encoding = PositionEncoding::negotiated(&capabilities);
        info!(server = %spec.name, pid, "language server ready");

        Ok(Arc::new(ServerHandle {
            name: spec.name.clone(),
            command: spec.command.clone(),
            pid,
            rpc,
            child: Mutex::new(child),
            created_at: Instant::now(),
            last_used_ms: AtomicU64::new(0),
            docs: DocumentTracker::new(),
            diagnostics,
            capabilities,
            position_encoding,
        }))
    }

    /// The JSON-RPC connection to this server.
    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.capabilities
    }

    pub fn position_encoding(&self) -> PositionEncoding {
        self.position_encoding
    }

    pub(crate) fn docs(&self) -> &DocumentTracker {
        &self.docs
    }

    pub(crate) fn diagnostics(&self) -> &Arc<DiagnosticsStore> {
        &self.diagnostics
    }

    /// Marks the server as used now. Never moves the timestamp backward.
    pub(crate) fn touch(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_used_ms.fetch_max(elapsed, Ordering::AcqRel);
    }

    /// Time since the last acquire/request.
    pub(crate) fn idle(&self) -> Duration {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        Duration::from_millis(elapsed.saturating_sub(self.last_used_ms.load(Ordering::Acquire)))
    }

    pub(crate) fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Graceful shutdown ladder: `shutdown` request (timeout tolerated),
    /// `exit` notification, connection teardown, then wait-or-kill on the
    /// child.
    pub(crate) async fn shutdown(&self) {
        info!(server = %self.name, pid = self.pid, "shutting down language server");
        if let Err(e) = self.rpc.request::<Shutdown>((), SHUTDOWN_DEADLINE).await {
            debug!(server = %self.name, "shutdown request failed: {}", e);
        }
        let _ = self.rpc.notify::<Exit>(()).await;
        self.rpc.close().await;

        let mut child = self.child.lock().await;
        terminate(&mut child).await;
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("alive", &self.rpc.is_alive())
            .finish()
    }
}

async fn initialize(rpc: &RpcClient, workspace_root: &Path) -> Result<InitializeResult> {
    let root_uri = file_uri(workspace_root)?;
    let folder_name = workspace_root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("workspace")
        .to_string();

    #[allow(deprecated)]
    let params = InitializeParams {
        process_id: None,
        root_uri: Some(root_uri.clone()),
        capabilities: client_capabilities(),
        workspace_folders: Some(vec![WorkspaceFolder {
            uri: root_uri,
            name: folder_name,
        }]),
        ..Default::default()
    };

    let result = rpc.request::<Initialize>(params, INITIALIZE_DEADLINE).await?;
    rpc.notify::<Initialized>(InitializedParams {}).await?;
    Ok(result)
}

fn client_capabilities() -> ClientCapabilities {
    ClientCapabilities {
        text_document: Some(TextDocumentClientCapabilities {
            hover: Some(HoverClientCapabilities {
                content_format: Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]),
                ..Default::default()
            }),
            rename: Some(RenameClientCapabilities {
                prepare_support: Some(true),
                ..Default::default()
            }),
            code_action: Some(CodeActionClientCapabilities {
                code_action_literal_support: Some(CodeActionLiteralSupport {
                    code_action_kind: CodeActionKindLiteralSupport {
                        value_set: vec![
                            "quickfix".to_string(),
                            "refactor".to_string(),
                            "refactor.extract".to_string(),
                            "source.fixAll".to_string(),
                        ],
                    },
                }),
                ..Default::default()
            }),
            synchronization: Some(TextDocumentSyncClientCapabilities {
                did_save: Some(true),
                ..Default::default()
            }),
            publish_diagnostics: Some(PublishDiagnosticsClientCapabilities::default()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Waits briefly for the child to exit on its own, then kills it.
async fn terminate(child: &mut Child) {
    match tokio::time::timeout(EXIT_WAIT, child.wait()).await {
        Ok(Ok(status)) => {
            debug!("child exited with {}", status);
            return;
        }
        Ok(Err(e)) => {
            warn!("error waiting for child: {}", e);
            return;
        }
        Err(_) => {}
    }

    warn!("child did not exit in time, killing");
    if child.start_kill().is_ok() {
        let _ = tokio::time::timeout(KILL_WAIT, child.wait()).await;
    }
}

async fn drain_stderr(stderr: ChildStderr, name: String, tail: StderrTail) {
    let mut lines = tokio::io::BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(server = %name, "stderr: {}", line);
        tail.push(line);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn spec(name: &str, command: &[&str]) -> ServerSpec {
        ServerSpec {
            name: name.to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
            extensions: vec![],
            root_markers: vec![],
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_failed() {
        let dir = tempfile::tempdir().unwrap();
        let err = ServerHandle::spawn(
            &spec("ghost", &["definitely-not-a-real-language-server"]),
            dir.path(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), "spawn-failed");
        assert!(err.to_string().contains("binary not found"));
    }

    #[tokio::test]
    async fn immediate_exit_is_spawn_failed() {
        let dir = tempfile::tempdir().unwrap();
        let err = ServerHandle::spawn(&spec("dead", &["false"]), dir.path())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "spawn-failed");
        assert!(err.to_string().contains("exited during startup"));
    }

    #[tokio::test]
    async fn empty_command_is_spawn_failed() {
        let dir = tempfile::tempdir().unwrap();
        let err = ServerHandle::spawn(&spec("blank", &[]), dir.path())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "spawn-failed");
    }

    #[test]
    fn stderr_tail_is_bounded() {
        let tail = StderrTail::default();
        for n in 0..100 {
            tail.push(format!("line {}", n));
        }
        let summary = tail.summary();
        assert!(summary.contains("line 99"));
        assert!(!summary.contains("line 0;"));
        assert_eq!(tail.lines.lock().unwrap().len(), STDERR_TAIL_LINES);
    }
}
