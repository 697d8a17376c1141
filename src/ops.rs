//! The operations layer: semantic code-intelligence calls over the pool.
//!
//! Each operation takes caller coordinates (1-based lines, 0-based columns),
//! converts them to LSP positions, makes sure the document is synced, issues
//! the request, and formats a deterministic result. When the LSP path is
//! unavailable or fails, the per-operation fallback chain runs and successful
//! results are annotated with the strategy that produced them.

mod code_action;
mod diagnostics;
mod hover;
mod navigate;
mod rename;
mod symbols;

pub use code_action::{ActionEntry, CodeActionList, ExtractKind, ExtractPreview, ResolveOutcome};
pub use diagnostics::{DiagnosticItem, FileDiagnostics};
pub use hover::HoverResult;
pub use navigate::Locations;
pub use rename::{PrepareRenameResult, RenameResult};
pub use symbols::{SymbolNode, SymbolOutline, WorkspaceSymbols};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use lsp_types::{Position, Range, Url};
use serde_json::Value;

use crate::config::OperationTimeouts;
use crate::error::{Error, Result};
use crate::fallback::{FallbackChain, FallbackRequest};
use crate::manager::Manager;
use crate::server::ServerHandle;
use crate::uri::uri_to_path;

/// Facade over the pool exposing the semantic operations.
///
/// Holds only transient references to acquired servers; nothing is cached
/// across calls except the code-action table that `code-action-resolve`
/// replays from.
pub struct Operations {
    manager: Manager,
    fallbacks: FallbackChain,
    action_cache: DashMap<(PathBuf, String), CachedAction>,
}

#[derive(Clone, Debug)]
struct CachedAction {
    value: Value,
    title: String,
}

impl Operations {
    /// Builds the operations layer with the standard fallback chain.
    pub fn new(manager: Manager) -> Self {
        Self::with_fallbacks(manager, FallbackChain::standard())
    }

    /// Builds the operations layer over a custom fallback chain.
    pub fn with_fallbacks(manager: Manager, fallbacks: FallbackChain) -> Self {
        Operations {
            manager,
            fallbacks,
            action_cache: DashMap::new(),
        }
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    pub(crate) fn fallbacks(&self) -> &FallbackChain {
        &self.fallbacks
    }

    pub(crate) fn timeouts(&self) -> &OperationTimeouts {
        &self.manager.config().operation_timeouts
    }

    pub(crate) fn cache_action(&self, file: &Path, id: String, value: Value, title: String) {
        self.action_cache
            .insert((file.to_path_buf(), id), CachedAction { value, title });
    }

    pub(crate) fn cached_action(&self, file: &Path, id: &str) -> Option<(Value, String)> {
        self.action_cache
            .get(&(file.to_path_buf(), id.to_string()))
            .map(|entry| (entry.value.clone(), entry.title.clone()))
    }

    /// Converts caller coordinates (1-based line, 0-based character) to an
    /// LSP position.
    pub(crate) fn to_position(line: u32, col: u32) -> Result<Position> {
        if line == 0 {
            return Err(Error::InvalidPosition(
                "line numbers are 1-based".to_string(),
            ));
        }
        Ok(Position::new(line - 1, col))
    }

    /// Acquires the server responsible for `file`, or fails with the error
    /// that should head the fallback attempt list.
    pub(crate) async fn client_for(
        &self,
        file: &Path,
        language: &Option<String>,
    ) -> Result<Arc<ServerHandle>> {
        let Some(language) = language else {
            return Err(Error::NotFound(format!(
                "no language server registered for {}",
                file.display()
            )));
        };
        match self.manager.acquire(language).await? {
            Some(handle) => Ok(handle),
            None => Err(Error::NotFound(format!(
                "no language server registered for `{}`",
                language
            ))),
        }
    }

    /// The standard prologue for positional requests: acquire the server and
    /// push the file's current bytes.
    pub(crate) async fn positional(
        &self,
        file: &Path,
        language: &Option<String>,
    ) -> Result<(Arc<ServerHandle>, Url)> {
        let handle = self.client_for(file, language).await?;
        let (uri, _) = handle.docs().ensure_synced(handle.rpc(), file).await?;
        handle.touch();
        Ok((handle, uri))
    }

    /// Records a failed LSP attempt; `connection-lost` additionally schedules
    /// the backoff restart.
    pub(crate) fn note_failure(&self, language: &Option<String>, error: &Error) {
        if let (Some(language), Error::ConnectionLost(_)) = (language, error) {
            self.manager.report_connection_lost(language);
        }
    }

    pub(crate) fn fallback_request(
        &self,
        language: &Option<String>,
        file: Option<&Path>,
        position: Option<Position>,
    ) -> FallbackRequest {
        FallbackRequest {
            language: language.clone(),
            file: file.map(|p| p.to_path_buf()),
            line: position.map(|p| p.line),
            col: position.map(|p| p.character),
            workspace_root: self.manager.workspace_root().to_path_buf(),
            max_results: self.manager.config().max_references_returned,
            ..Default::default()
        }
    }

    pub(crate) fn deadline(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }
}

/// Whether a failed LSP attempt should hand off to the fallback chain.
///
/// Operation-level failures surface verbatim; only unavailability and
/// transport failures are worth retrying elsewhere.
pub(crate) fn should_fall_back(error: &Error) -> bool {
    !matches!(
        error,
        Error::InvalidPosition(_) | Error::Server(_) | Error::OverlappingEdits(_)
    )
}

/// Renders a location as `path:line:col` with a 1-based line.
pub(crate) fn format_location(uri: &Url, range: &Range) -> String {
    format!(
        "{}:{}:{}",
        uri_to_path(uri).display(),
        range.start.line + 1,
        range.start.character
    )
}

/// Suffix appended to results produced by a fallback strategy.
pub(crate) fn via_suffix(via: Option<&'static str>) -> String {
    match via {
        Some(strategy) => format!(" (via fallback: {})", strategy),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_coordinates_are_one_based_lines() {
        let position = Operations::to_position(3, 4).unwrap();
        assert_eq!(position, Position::new(2, 4));

        let err = Operations::to_position(0, 0).unwrap_err();
        assert_eq!(err.kind(), "invalid-position");
    }

    #[test]
    fn locations_render_one_based() {
        let uri: Url = "file:///t/a.py".parse().unwrap();
        let range = Range::new(Position::new(2, 4), Position::new(2, 8));
        assert_eq!(format_location(&uri, &range), "/t/a.py:3:4");
    }
}
