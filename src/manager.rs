//! The pool manager: registry, lazy starts, restarts, status, shutdown.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::{PoolConfig, ServerSpec};
use crate::error::{Error, Result};
use crate::health::{self, MonitorHandle};
use crate::server::ServerHandle;

/// Backoff saturates here regardless of the attempt count.
const MAX_BACKOFF_SECS: f64 = 60.0;

#[derive(Clone, Copy, Debug, Default)]
struct AttemptState {
    attempts: u32,
    not_before: Option<Instant>,
}

pub(crate) struct ManagerInner {
    config: PoolConfig,
    registry: HashMap<String, ServerSpec>,
    by_extension: HashMap<String, String>,
    workspace_root: PathBuf,
    /// Initialized servers, readable without the lifecycle lock.
    ready: DashMap<String, Arc<ServerHandle>>,
    /// Serializes every start/stop transition. Only one start per pool may
    /// be in flight; concurrent acquirers of the same language queue here
    /// and find the winner's handle on re-check.
    lifecycle: Mutex<()>,
    attempts: DashMap<String, AttemptState>,
    terminated: AtomicBool,
    monitor: StdMutex<Option<MonitorHandle>>,
}

/// Owns every language server in the pool.
///
/// The "singleton" is a deployment choice, not a type-level one: embedders
/// typically construct one `Manager` per process, while tests build fresh
/// managers with test registries. Clones share the same pool.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Manager {
    /// Creates a pool over the given registry, rooted at `workspace_root`
    /// (the `rootUri` every server is initialized with).
    pub fn new(config: PoolConfig, workspace_root: impl Into<PathBuf>) -> Self {
        let mut registry = HashMap::new();
        let mut by_extension = HashMap::new();
        for spec in &config.server_specs {
            for ext in &spec.extensions {
                by_extension.insert(ext.to_ascii_lowercase(), spec.name.clone());
            }
            registry.insert(spec.name.clone(), spec.clone());
        }

        Manager {
            inner: Arc::new(ManagerInner {
                config,
                registry,
                by_extension,
                workspace_root: workspace_root.into(),
                ready: DashMap::new(),
                lifecycle: Mutex::new(()),
                attempts: DashMap::new(),
                terminated: AtomicBool::new(false),
                monitor: StdMutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn workspace_root(&self) -> &Path {
        &self.inner.workspace_root
    }

    /// The logical server name responsible for the given file, per the
    /// registry's extension map.
    pub fn language_for_path(&self, path: &Path) -> Option<String> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        self.inner.by_extension.get(&ext).cloned()
    }

    /// Returns a ready, initialized server for `language`, starting it
    /// lazily if needed.
    ///
    /// Returns `Ok(None)` when no spec is registered for the language or the
    /// pool has been shut down. Bumps the server's `last_used` stamp and
    /// makes sure the health monitor is running.
    pub async fn acquire(&self, language: &str) -> Result<Option<Arc<ServerHandle>>> {
        if self.inner.terminated.load(Ordering::Acquire) {
            return Ok(None);
        }
        let Some(spec) = self.inner.registry.get(language) else {
            return Ok(None);
        };

        // Fast path: a caller that sees a live handle may proceed without
        // the lifecycle lock.
        if let Some(handle) = self.inner.ready.get(language) {
            if handle.rpc().is_alive() {
                handle.touch();
                self.ensure_monitor();
                return Ok(Some(handle.value().clone()));
            }
        }

        let _guard = self.inner.lifecycle.lock().await;
        if self.inner.terminated.load(Ordering::Acquire) {
            return Ok(None);
        }
        // Re-check: another caller may have finished the start while we
        // waited on the lock.
        if let Some(handle) = self.inner.ready.get(language) {
            if handle.rpc().is_alive() {
                handle.touch();
                self.ensure_monitor();
                return Ok(Some(handle.value().clone()));
            }
        }
        if let Some((_, dead)) = self.inner.ready.remove(language) {
            dead.shutdown().await;
        }

        if let Some(state) = self.inner.attempts.get(language) {
            if let Some(not_before) = state.not_before {
                if Instant::now() < not_before {
                    return Err(Error::SpawnFailed(format!(
                        "server `{}` is backing off after {} failed start(s)",
                        language, state.attempts
                    )));
                }
            }
        }

        let handle = self.start_locked(spec).await?;
        Ok(Some(handle))
    }

    /// Starts a server. Caller must hold the lifecycle lock.
    async fn start_locked(&self, spec: &ServerSpec) -> Result<Arc<ServerHandle>> {
        match ServerHandle::spawn(spec, &self.inner.workspace_root).await {
            Ok(handle) => {
                handle.touch();
                self.inner
                    .attempts
                    .insert(spec.name.clone(), AttemptState::default());
                self.inner.ready.insert(spec.name.clone(), handle.clone());
                self.ensure_monitor();
                Ok(handle)
            }
            Err(e) => {
                let mut state = self.inner.attempts.entry(spec.name.clone()).or_default();
                let delay = backoff_delay(state.attempts);
                state.attempts += 1;
                state.not_before = Some(Instant::now() + delay);
                warn!(
                    server = %spec.name,
                    attempts = state.attempts,
                    "start failed: {}", e
                );
                Err(e)
            }
        }
    }

    /// Failed-start count since the last successful start.
    pub fn restart_attempts(&self, language: &str) -> u32 {
        self.inner
            .attempts
            .get(language)
            .map(|s| s.attempts)
            .unwrap_or(0)
    }

    /// Point-in-time snapshot of every registered server. Pure read.
    pub fn status(&self) -> Vec<ServerStatus> {
        let mut names: Vec<&String> = self.inner.registry.keys().collect();
        names.sort();

        names
            .into_iter()
            .map(|name| {
                let spec = &self.inner.registry[name];
                let handle = self
                    .inner
                    .ready
                    .get(name)
                    .filter(|h| h.rpc().is_alive())
                    .map(|h| h.value().clone());
                ServerStatus {
                    name: name.clone(),
                    running: handle.is_some(),
                    pid: handle.as_ref().map(|h| h.pid()),
                    restarts: self.restart_attempts(name),
                    idle_seconds: handle.as_ref().map(|h| h.idle().as_secs()),
                    uptime_seconds: handle.as_ref().map(|h| h.uptime().as_secs()),
                    command: spec.command.clone(),
                }
            })
            .collect()
    }

    /// Tears the whole pool down: stops the health monitor, then shuts every
    /// running server down concurrently. Subsequent `acquire` calls return
    /// `None`. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.terminated.swap(true, Ordering::AcqRel) {
            return;
        }

        let monitor = self.inner.monitor.lock().expect("monitor slot poisoned").take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }

        // Drain outstanding lifecycle work before tearing servers down.
        let _guard = self.inner.lifecycle.lock().await;
        let handles: Vec<Arc<ServerHandle>> = self
            .inner
            .ready
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.inner.ready.clear();

        futures::future::join_all(handles.iter().map(|handle| handle.shutdown())).await;
        info!("pool shut down");
    }

    /// Called by the operations layer when a request fails with
    /// `connection-lost`. Tears the dead server down and schedules a
    /// backoff restart in the background.
    pub(crate) fn report_connection_lost(&self, language: &str) {
        let this = self.clone();
        let language = language.to_string();
        tokio::spawn(async move {
            {
                let _guard = this.inner.lifecycle.lock().await;
                let is_dead = this
                    .inner
                    .ready
                    .get(&language)
                    .map(|h| !h.rpc().is_alive())
                    .unwrap_or(false);
                if !is_dead {
                    // Already replaced or already torn down; someone else is
                    // on it.
                    return;
                }
                if let Some((_, dead)) = this.inner.ready.remove(&language) {
                    dead.shutdown().await;
                }
            }
            this.restart_with_backoff(&language).await;
        });
    }

    /// Sleeps out the backoff delay for the next attempt, then restarts the
    /// server unless a live one appeared in the meantime.
    pub(crate) async fn restart_with_backoff(&self, language: &str) {
        if self.inner.terminated.load(Ordering::Acquire) {
            return;
        }

        let delay = {
            let mut state = self.inner.attempts.entry(language.to_string()).or_default();
            let delay = backoff_delay(state.attempts);
            state.attempts += 1;
            state.not_before = Some(Instant::now() + delay);
            delay
        };
        warn!(
            server = language,
            delay_secs = delay.as_secs_f64(),
            "scheduling restart"
        );
        tokio::time::sleep(delay).await;

        if self.inner.terminated.load(Ordering::Acquire) {
            return;
        }
        let Some(spec) = self.inner.registry.get(language) else {
            return;
        };

        let _guard = self.inner.lifecycle.lock().await;
        if let Some(handle) = self.inner.ready.get(language) {
            if handle.rpc().is_alive() {
                return;
            }
        }
        match self.start_locked(spec).await {
            Ok(_) => info!(server = language, "restarted"),
            Err(e) => warn!(server = language, "restart failed: {}", e),
        }
    }

    /// One health monitor pass: idle-shutdown, then ping, then restart
    /// anything unhealthy. Runs under the lifecycle lock.
    pub(crate) async fn run_health_checks(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        if self.inner.terminated.load(Ordering::Acquire) {
            return;
        }

        let snapshot: Vec<(String, Arc<ServerHandle>)> = self
            .inner
            .ready
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (name, handle) in snapshot {
            if handle.idle() > self.inner.config.idle_timeout() {
                info!(server = %name, idle_secs = handle.idle().as_secs(), "idle timeout");
                self.inner.ready.remove(&name);
                handle.shutdown().await;
                continue;
            }

            // Re-sending `initialize` is the liveness probe: universally
            // implemented and cheap. Even a JSON-RPC error means the server
            // spoke, which is all we ask.
            let ping = handle
                .rpc()
                .request_raw(
                    "initialize",
                    json!({ "capabilities": {} }),
                    self.inner.config.health_check_timeout(),
                )
                .await;
            let healthy = matches!(ping, Ok(_) | Err(Error::Server(_)));
            if healthy {
                continue;
            }

            warn!(server = %name, "health check failed, restarting");
            self.inner.ready.remove(&name);
            handle.shutdown().await;
            if let Some(spec) = self.inner.registry.get(&name) {
                if let Err(e) = self.start_locked(spec).await {
                    warn!(server = %name, "immediate restart failed: {}", e);
                }
            }
        }
    }

    fn ensure_monitor(&self) {
        if self.inner.terminated.load(Ordering::Acquire) {
            return;
        }
        let mut monitor = self.inner.monitor.lock().expect("monitor slot poisoned");
        if monitor.is_none() {
            *monitor = Some(health::spawn(self.clone()));
        }
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Manager")
            .field("servers", &self.inner.registry.keys())
            .field("running", &self.inner.ready.len())
            .finish()
    }
}

/// `min(60, 2^attempts)` seconds plus up to one second of uniform jitter.
fn backoff_delay(attempts: u32) -> Duration {
    let base = 2f64.powi(attempts.min(16) as i32).min(MAX_BACKOFF_SECS);
    let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
    Duration::from_secs_f64(base + jitter)
}

/// One row of [`Manager::status`].
#[derive(Clone, Debug)]
pub struct ServerStatus {
    pub name: String,
    pub running: bool,
    pub pid: Option<u32>,
    pub restarts: u32,
    pub idle_seconds: Option<u64>,
    pub uptime_seconds: Option<u64>,
    pub command: Vec<String>,
}

impl Display for ServerStatus {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        if self.running {
            write!(
                f,
                "{}: running pid={} restarts={} idle={}s uptime={}s ({})",
                self.name,
                self.pid.unwrap_or_default(),
                self.restarts,
                self.idle_seconds.unwrap_or_default(),
                self.uptime_seconds.unwrap_or_default(),
                self.command.join(" ")
            )
        } else {
            write!(
                f,
                "{}: stopped restarts={} ({})",
                self.name,
                self.restarts,
                self.command.join(" ")
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;

    use super::*;

    fn test_config(specs: Vec<ServerSpec>) -> PoolConfig {
        PoolConfig {
            server_specs: specs,
            ..PoolConfig::default()
        }
    }

    fn broken_spec(name: &str) -> ServerSpec {
        ServerSpec {
            name: name.to_string(),
            command: vec!["definitely-not-a-real-language-server".to_string()],
            extensions: vec!["py".to_string()],
            root_markers: vec![],
            env: StdHashMap::new(),
        }
    }

    #[test]
    fn backoff_grows_and_saturates() {
        let first = backoff_delay(0).as_secs_f64();
        assert!((1.0..2.0).contains(&first), "attempt 0 gave {}", first);

        let third = backoff_delay(3).as_secs_f64();
        assert!((8.0..9.0).contains(&third), "attempt 3 gave {}", third);

        let huge = backoff_delay(30).as_secs_f64();
        assert!((60.0..61.0).contains(&huge), "attempt 30 gave {}", huge);
    }

    #[tokio::test]
    async fn unknown_language_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::new(test_config(vec![]), dir.path());
        assert!(manager.acquire("cobol").await.unwrap().is_none());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn spawn_failure_counts_attempts_and_backs_off() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::new(test_config(vec![broken_spec("python")]), dir.path());

        let err = manager.acquire("python").await.unwrap_err();
        assert_eq!(err.kind(), "spawn-failed");
        assert!(err.to_string().contains("binary not found"));
        assert_eq!(manager.restart_attempts("python"), 1);

        // Inside the backoff window the next acquire is refused fast.
        let err = manager.acquire("python").await.unwrap_err();
        assert_eq!(err.kind(), "spawn-failed");
        assert!(err.to_string().contains("backing off"));
        assert_eq!(manager.restart_attempts("python"), 1);

        let status = manager.status();
        assert_eq!(status.len(), 1);
        assert!(!status[0].running);
        assert_eq!(status[0].restarts, 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn acquire_after_shutdown_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::new(test_config(vec![broken_spec("python")]), dir.path());
        manager.shutdown().await;
        assert!(manager.acquire("python").await.unwrap().is_none());
        // Idempotent.
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn routes_extensions_to_languages() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::new(test_config(vec![broken_spec("python")]), dir.path());
        assert_eq!(
            manager.language_for_path(Path::new("/t/a.py")),
            Some("python".to_string())
        );
        assert_eq!(manager.language_for_path(Path::new("/t/a.rs")), None);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn status_renders_human_readable_rows() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::new(test_config(vec![broken_spec("python")]), dir.path());
        let rows = manager.status();
        let rendered = rows[0].to_string();
        assert!(rendered.starts_with("python: stopped"));
        assert!(rendered.contains("definitely-not-a-real-language-server"));
        manager.shutdown().await;
    }
}
