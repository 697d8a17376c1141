//! A supervised pool of language servers with semantic operations on top.
//!
//! The pool owns a small set of language-server subprocesses, multiplexes
//! JSON-RPC requests over their stdio pipes, and exposes code-intelligence
//! operations (hover, definition, references, symbols, rename, code actions,
//! diagnostics) to embedders. Servers start lazily on first use, are shut
//! down when idle, and are restarted with exponential backoff when they
//! crash or stop answering. When a server is missing or failing, each
//! operation falls back to a chain of simpler strategies (jedi, ctags, text
//! search, ruff) before giving up.
//!
//! # Example
//!
//! ```no_run
//! use lsp_pool::{Manager, Operations, PoolConfig};
//!
//! # async fn run() -> lsp_pool::Result<()> {
//! let manager = Manager::new(PoolConfig::default(), "/path/to/workspace");
//! let ops = Operations::new(manager.clone());
//!
//! let hover = ops.hover("src/app.py".as_ref(), 3, 4).await?;
//! println!("{}", hover);
//!
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! Nothing is persisted between runs; the pool is fully in-memory and
//! `Manager::shutdown` joins every background task, so it embeds cleanly in
//! test harnesses.

#![forbid(unsafe_code)]

mod codec;
mod config;
mod edits;
mod error;
mod fallback;
mod health;
mod jsonrpc;
mod manager;
mod ops;
mod rpc;
mod server;
mod sync;
mod uri;

pub use self::codec::{LanguageServerCodec, ParseError};
pub use self::config::{default_server_specs, OperationTimeouts, PoolConfig, ServerSpec};
pub use self::edits::{
    apply_edits, apply_workspace_edit, collect_changes, position_to_offset, unified_diff,
    EditSummary, FileEdits, PositionEncoding,
};
pub use self::error::{Error, Result, ServerError};
pub use self::fallback::{
    FallbackChain, FallbackOutcome, FallbackRequest, FallbackStrategy, OpKind,
};
pub use self::manager::{Manager, ServerStatus};
pub use self::ops::{
    ActionEntry, CodeActionList, DiagnosticItem, ExtractKind, ExtractPreview, FileDiagnostics,
    HoverResult, Locations, Operations, PrepareRenameResult, RenameResult, ResolveOutcome,
    SymbolNode, SymbolOutline, WorkspaceSymbols,
};
pub use self::rpc::{RpcClient, ServerMessage};
pub use self::server::ServerHandle;
pub use self::sync::{DiagnosticsStore, DocumentTracker, SyncOutcome};
pub use self::uri::{file_uri, find_workspace_root, language_id_for, uri_to_path};
