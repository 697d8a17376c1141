//! Pool-level behavior that needs no live language server.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use lsp_pool::{
    Error, FallbackChain, FallbackRequest, FallbackStrategy, Manager, OpKind, Operations,
    PoolConfig, Result, ServerSpec,
};

fn spec(name: &str, command: &[&str], extensions: &[&str]) -> ServerSpec {
    ServerSpec {
        name: name.to_string(),
        command: command.iter().map(|s| s.to_string()).collect(),
        extensions: extensions.iter().map(|s| s.to_string()).collect(),
        root_markers: vec![".git".to_string()],
        env: HashMap::new(),
    }
}

fn pool_with(specs: Vec<ServerSpec>, root: &Path) -> Manager {
    let config = PoolConfig {
        server_specs: specs,
        ..PoolConfig::default()
    };
    Manager::new(config, root)
}

#[tokio::test]
async fn acquire_unknown_language_returns_none() {
    let dir = tempfile::tempdir().unwrap();
    let manager = pool_with(vec![], dir.path());

    assert!(manager.acquire("python").await.unwrap().is_none());
    manager.shutdown().await;
}

#[tokio::test]
async fn missing_binary_surfaces_spawn_failed_and_stays_registered() {
    let dir = tempfile::tempdir().unwrap();
    let manager = pool_with(
        vec![spec("python", &["no-such-language-server-binary"], &["py"])],
        dir.path(),
    );

    let err = manager.acquire("python").await.unwrap_err();
    assert_eq!(err.kind(), "spawn-failed");
    assert!(err.to_string().contains("binary not found"));

    // The slot stays registered: not running, attempts counted, command kept.
    let status = manager.status();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].name, "python");
    assert!(!status[0].running);
    assert_eq!(status[0].restarts, 1);
    assert_eq!(status[0].pid, None);
    assert_eq!(status[0].command, vec!["no-such-language-server-binary"]);

    manager.shutdown().await;
}

#[tokio::test]
async fn shutdown_is_terminal_and_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let manager = pool_with(vec![spec("python", &["false"], &["py"])], dir.path());

    manager.shutdown().await;
    manager.shutdown().await;
    assert!(manager.acquire("python").await.unwrap().is_none());
}

#[tokio::test]
async fn operations_fall_back_when_no_server_is_registered() {
    struct Canned;

    #[async_trait]
    impl FallbackStrategy for Canned {
        fn name(&self) -> &'static str {
            "canned"
        }

        fn supports(&self, _op: OpKind, _language: Option<&str>) -> bool {
            true
        }

        async fn run(&self, _op: OpKind, _request: &FallbackRequest) -> Result<String> {
            Ok("def f(x) -> x".to_string())
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("a.py");
    std::fs::write(&file, "def f(x):\n  return x\n").unwrap();

    // `python` is routed but its binary does not exist, so the LSP path
    // reports spawn-failed and the chain takes over.
    let manager = pool_with(
        vec![spec("python", &["no-such-language-server-binary"], &["py"])],
        dir.path(),
    );
    let ops = Operations::with_fallbacks(
        manager.clone(),
        FallbackChain::with_strategies(vec![Arc::new(Canned)]),
    );

    let hover = ops.hover(&file, 1, 4).await.unwrap();
    assert_eq!(hover.via, Some("canned"));
    assert_eq!(hover.to_string(), "def f(x) -> x (via fallback: canned)");

    // The server never initialized.
    assert!(!manager.status()[0].running);
    manager.shutdown().await;
}

#[tokio::test]
async fn exhausted_fallbacks_name_the_missing_tools() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("a.py");
    std::fs::write(&file, "x = 1\n").unwrap();

    let manager = pool_with(
        vec![spec("python", &["no-such-language-server-binary"], &["py"])],
        dir.path(),
    );
    let ops = Operations::with_fallbacks(manager.clone(), FallbackChain::with_strategies(vec![]));

    let err = ops.hover(&file, 1, 0).await.unwrap_err();
    assert_eq!(err.kind(), "unavailable");
    match err {
        Error::Unavailable(attempts) => {
            assert_eq!(attempts.len(), 1);
            assert_eq!(attempts[0].0, "lsp");
            assert!(attempts[0].1.contains("binary not found"));
        }
        other => panic!("expected unavailable, got {:?}", other),
    }
    manager.shutdown().await;
}

#[tokio::test]
async fn status_rows_render_for_every_registered_server() {
    let dir = tempfile::tempdir().unwrap();
    let manager = pool_with(
        vec![
            spec("python", &["jedi-language-server"], &["py"]),
            spec("typescript", &["typescript-language-server", "--stdio"], &["ts"]),
        ],
        dir.path(),
    );

    let rows = manager.status();
    assert_eq!(rows.len(), 2);
    // Deterministic ordering by name.
    assert_eq!(rows[0].name, "python");
    assert_eq!(rows[1].name, "typescript");
    assert!(rows.iter().all(|row| !row.running));

    manager.shutdown().await;
}
