//! Document synchronization and diagnostics tracking for one server.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use lsp_types::notification::{DidChangeTextDocument, DidOpenTextDocument};
use lsp_types::{
    Diagnostic, DidChangeTextDocumentParams, DidOpenTextDocumentParams, PublishDiagnosticsParams,
    TextDocumentContentChangeEvent, TextDocumentItem, Url, VersionedTextDocumentIdentifier,
};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::rpc::{RpcClient, ServerMessage};
use crate::uri::{file_uri, language_id_for};

/// What [`DocumentTracker::ensure_synced`] had to do.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncOutcome {
    /// First sighting; `didOpen` was sent with version 1.
    Opened,
    /// Content differed from the last push; `didChange` was sent.
    Changed,
    /// The server already has these bytes.
    Unchanged,
}

struct DocState {
    version: i32,
    content_hash: u64,
}

/// Tracks which documents a server has open and at which version.
///
/// The version counter for a URI is strictly monotonically increasing within
/// a server's lifetime; the map lock is held across the notification send so
/// versions hit the wire in order.
#[derive(Default)]
pub struct DocumentTracker {
    docs: Mutex<HashMap<Url, DocState>>,
}

impl DocumentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes sure `path`'s current bytes are what the server sees, sending
    /// `didOpen` or a full-content `didChange` as needed.
    ///
    /// External mutation is handled the same way as caller edits: whenever
    /// the bytes on disk differ from the last push, a new version is sent.
    pub async fn ensure_synced(
        &self,
        rpc: &RpcClient,
        path: &Path,
    ) -> Result<(Url, SyncOutcome)> {
        let uri = file_uri(path)?;
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::NotFound(format!("cannot read {}: {}", path.display(), e)))?;
        let content_hash = {
            let mut hasher = DefaultHasher::new();
            text.hash(&mut hasher);
            hasher.finish()
        };

        let mut docs = self.docs.lock().await;
        if let Some(state) = docs.get_mut(&uri) {
            if state.content_hash == content_hash {
                return Ok((uri, SyncOutcome::Unchanged));
            }
            state.version += 1;
            state.content_hash = content_hash;
            let version = state.version;
            debug!(uri = %uri, version, "didChange");
            rpc.notify::<DidChangeTextDocument>(DidChangeTextDocumentParams {
                text_document: VersionedTextDocumentIdentifier {
                    uri: uri.clone(),
                    version,
                },
                content_changes: vec![TextDocumentContentChangeEvent {
                    range: None,
                    range_length: None,
                    text,
                }],
            })
            .await?;
            return Ok((uri, SyncOutcome::Changed));
        }

        debug!(uri = %uri, "didOpen");
        rpc.notify::<DidOpenTextDocument>(DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: uri.clone(),
                language_id: language_id_for(path).to_string(),
                version: 1,
                text,
            },
        })
        .await?;
        docs.insert(
            uri.clone(),
            DocState {
                version: 1,
                content_hash,
            },
        );
        Ok((uri, SyncOutcome::Opened))
    }

    /// Current version of an open document, if any.
    pub async fn version(&self, uri: &Url) -> Option<i32> {
        self.docs.lock().await.get(uri).map(|s| s.version)
    }

    /// Number of documents currently open on the server.
    pub async fn open_count(&self) -> usize {
        self.docs.lock().await.len()
    }
}

/// Latest published diagnostics per URI for one server.
///
/// Servers push diagnostics asynchronously via
/// `textDocument/publishDiagnostics`; this store subscribes to the server's
/// message ring and caches the most recent set per document.
pub struct DiagnosticsStore {
    latest: DashMap<Url, Vec<Diagnostic>>,
    publish_counts: DashMap<Url, u64>,
    generation: AtomicU64,
    notify_tx: watch::Sender<u64>,
    notify_rx: watch::Receiver<u64>,
}

impl DiagnosticsStore {
    /// Creates a store and spawns the listener task consuming `rpc`'s
    /// server messages. The task exits when the connection closes.
    pub fn attach(rpc: &RpcClient) -> Arc<Self> {
        let (notify_tx, notify_rx) = watch::channel(0);
        let store = Arc::new(DiagnosticsStore {
            latest: DashMap::new(),
            publish_counts: DashMap::new(),
            generation: AtomicU64::new(0),
            notify_tx,
            notify_rx,
        });

        let listener = store.clone();
        let rx = rpc.subscribe();
        tokio::spawn(listen(listener, rx));
        store
    }

    fn record(&self, params: PublishDiagnosticsParams) {
        debug!(uri = %params.uri, count = params.diagnostics.len(), "publishDiagnostics");
        *self.publish_counts.entry(params.uri.clone()).or_insert(0) += 1;
        self.latest.insert(params.uri, params.diagnostics);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let _ = self.notify_tx.send(generation);
    }

    /// Latest cached diagnostics for the given URI.
    pub fn current(&self, uri: &Url) -> Vec<Diagnostic> {
        self.latest.get(uri).map(|e| e.clone()).unwrap_or_default()
    }

    /// Waits up to `window` for a publish for `uri`, then returns whatever is
    /// cached. Returns immediately once a new publish lands.
    pub async fn wait_for_publish(&self, uri: &Url, window: Duration) -> Vec<Diagnostic> {
        let initial = self.publish_counts.get(uri).map(|e| *e).unwrap_or(0);
        let mut rx = self.notify_rx.clone();
        let deadline = tokio::time::Instant::now() + window;

        loop {
            let seen = self.publish_counts.get(uri).map(|e| *e).unwrap_or(0);
            if seen > initial {
                break;
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                // Window elapsed, or the listener is gone.
                _ => break,
            }
        }
        self.current(uri)
    }
}

async fn listen(store: Arc<DiagnosticsStore>, mut rx: broadcast::Receiver<ServerMessage>) {
    loop {
        match rx.recv().await {
            Ok(ServerMessage::Notification { method, params })
                if method == "textDocument/publishDiagnostics" =>
            {
                let params = params.unwrap_or_default();
                match serde_json::from_value::<PublishDiagnosticsParams>(params) {
                    Ok(params) => store.record(params),
                    Err(e) => warn!("malformed publishDiagnostics: {}", e),
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("diagnostics listener dropped {} oldest message(s)", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio::io::{duplex, DuplexStream};
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;
    use crate::codec::LanguageServerCodec;

    fn client_over(io: DuplexStream) -> RpcClient {
        let (read, write) = tokio::io::split(io);
        RpcClient::new(write, read)
    }

    #[tokio::test]
    async fn open_then_change_then_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.py");
        tokio::fs::write(&path, "x = 1\n").await.unwrap();

        let (ours, theirs) = duplex(64 * 1024);
        let observed = tokio::spawn(async move {
            let (read, _write) = tokio::io::split(theirs);
            let mut reader = FramedRead::new(read, LanguageServerCodec::default());
            let mut frames = Vec::new();
            for _ in 0..2 {
                let frame: Value =
                    serde_json::from_str(&reader.next().await.unwrap().unwrap()).unwrap();
                frames.push(frame);
            }
            frames
        });
        let rpc = client_over(ours);
        let tracker = DocumentTracker::new();

        let (uri, outcome) = tracker.ensure_synced(&rpc, &path).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Opened);
        assert_eq!(tracker.version(&uri).await, Some(1));

        let (_, outcome) = tracker.ensure_synced(&rpc, &path).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Unchanged);

        tokio::fs::write(&path, "x = 2\n").await.unwrap();
        let (_, outcome) = tracker.ensure_synced(&rpc, &path).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Changed);
        assert_eq!(tracker.version(&uri).await, Some(2));
        assert_eq!(tracker.open_count().await, 1);

        let frames = observed.await.unwrap();
        assert_eq!(frames[0]["method"], json!("textDocument/didOpen"));
        assert_eq!(frames[0]["params"]["textDocument"]["version"], json!(1));
        assert_eq!(
            frames[0]["params"]["textDocument"]["languageId"],
            json!("python")
        );
        assert_eq!(frames[1]["method"], json!("textDocument/didChange"));
        assert_eq!(frames[1]["params"]["textDocument"]["version"], json!(2));
        rpc.close().await;
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let (ours, _theirs) = duplex(4096);
        let rpc = client_over(ours);
        let tracker = DocumentTracker::new();

        let err = tracker
            .ensure_synced(&rpc, Path::new("/definitely/not/here.py"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not-found");
        rpc.close().await;
    }

    #[tokio::test]
    async fn published_diagnostics_release_the_wait() {
        let (ours, theirs) = duplex(4096);
        let rpc = client_over(ours);
        let store = DiagnosticsStore::attach(&rpc);

        let uri: Url = "file:///t/a.py".parse().unwrap();
        let publisher = tokio::spawn(async move {
            let (_read, write) = tokio::io::split(theirs);
            let mut writer = FramedWrite::new(write, LanguageServerCodec::default());
            tokio::time::sleep(Duration::from_millis(50)).await;
            let notif = json!({
                "jsonrpc": "2.0",
                "method": "textDocument/publishDiagnostics",
                "params": {
                    "uri": "file:///t/a.py",
                    "diagnostics": [{
                        "range": {
                            "start": {"line": 0, "character": 0},
                            "end": {"line": 0, "character": 1}
                        },
                        "severity": 1,
                        "message": "undefined name"
                    }]
                }
            })
            .to_string();
            writer.send(notif).await.unwrap();
            // Keep the stream open long enough for delivery.
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let diagnostics = store.wait_for_publish(&uri, Duration::from_secs(2)).await;
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].message, "undefined name");

        publisher.await.unwrap();
        rpc.close().await;
    }

    #[tokio::test]
    async fn wait_window_elapses_without_publish() {
        let (ours, _theirs) = duplex(4096);
        let rpc = client_over(ours);
        let store = DiagnosticsStore::attach(&rpc);

        let uri: Url = "file:///t/quiet.py".parse().unwrap();
        let diagnostics = store
            .wait_for_publish(&uri, Duration::from_millis(50))
            .await;
        assert!(diagnostics.is_empty());
        rpc.close().await;
    }
}
