//! Code actions: listing, resolving/applying, and extract-refactor previews.

use std::fmt::{self, Display, Formatter};
use std::path::Path;

use lsp_types::request::CodeActionRequest;
use lsp_types::{
    CodeActionContext, CodeActionKind, CodeActionOrCommand, CodeActionParams, Range,
    TextDocumentIdentifier, WorkspaceEdit,
};
use serde_json::Value;

use super::{via_suffix, Operations};
use crate::edits::{apply_edits, apply_workspace_edit, collect_changes, unified_diff, EditSummary};
use crate::error::{Error, Result};
use crate::fallback::OpKind;
use crate::uri::uri_to_path;

/// One action offered for a range.
#[derive(Clone, Debug, PartialEq)]
pub struct ActionEntry {
    /// Opaque id to pass to `code_action_resolve`.
    pub id: String,
    pub title: String,
    pub kind: Option<String>,
}

/// Actions available for a file range.
#[derive(Clone, Debug)]
pub struct CodeActionList {
    pub actions: Vec<ActionEntry>,
    pub via: Option<&'static str>,
    fallback_text: Option<String>,
}

impl Display for CodeActionList {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        if let Some(text) = &self.fallback_text {
            return write!(f, "{}{}", text, via_suffix(self.via));
        }
        let lines: Vec<String> = self
            .actions
            .iter()
            .map(|action| {
                format!(
                    "[{}] {}{}",
                    action.id,
                    action.title,
                    action
                        .kind
                        .as_deref()
                        .map(|k| format!(" ({})", k))
                        .unwrap_or_default()
                )
            })
            .collect();
        write!(f, "{}", lines.join("\n"))
    }
}

/// The edits applied by resolving an action.
#[derive(Clone, Debug)]
pub struct ResolveOutcome {
    pub title: String,
    pub summary: Option<EditSummary>,
    pub via: Option<&'static str>,
    fallback_text: Option<String>,
}

impl Display for ResolveOutcome {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        if let Some(text) = &self.fallback_text {
            return write!(f, "{}{}", text, via_suffix(self.via));
        }
        match &self.summary {
            Some(summary) => write!(f, "{}: {}", self.title, summary),
            None => write!(f, "{}: no edits", self.title),
        }
    }
}

/// What an extract refactor would change, as a unified diff.
#[derive(Clone, Debug)]
pub struct ExtractPreview {
    pub action_title: String,
    pub new_name: String,
    pub diff: String,
}

impl Display for ExtractPreview {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        writeln!(f, "{} (as `{}`):", self.action_title, self.new_name)?;
        write!(f, "{}", self.diff)
    }
}

/// The extract target shape.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExtractKind {
    Function,
    Variable,
}

impl Operations {
    /// Lists the code actions a server offers for the given range (1-based
    /// lines, 0-based columns).
    pub async fn code_actions(
        &self,
        file: &Path,
        start_line: u32,
        start_col: u32,
        end_line: u32,
        end_col: u32,
    ) -> Result<CodeActionList> {
        let range = Range::new(
            Self::to_position(start_line, start_col)?,
            Self::to_position(end_line, end_col)?,
        );
        let language = self.manager().language_for_path(file);

        let primary = match self.code_actions_lsp(file, &language, range, None).await {
            Ok((actions, _)) => {
                let entries = self.cache_actions(file, &actions);
                return Ok(CodeActionList {
                    actions: entries,
                    via: None,
                    fallback_text: None,
                });
            }
            Err(e) => {
                self.note_failure(&language, &e);
                e
            }
        };
        if !super::should_fall_back(&primary) {
            return Err(primary);
        }

        let request = self.fallback_request(&language, Some(file), Some(range.start));
        let outcome = self
            .fallbacks()
            .run(OpKind::CodeActions, &request, primary)
            .await?;
        Ok(CodeActionList {
            actions: parse_fallback_actions(&outcome.text),
            via: Some(outcome.strategy),
            fallback_text: Some(outcome.text),
        })
    }

    /// Resolves a previously listed action and applies its edits to disk.
    pub async fn code_action_resolve(&self, file: &Path, action_id: &str) -> Result<ResolveOutcome> {
        let language = self.manager().language_for_path(file);

        // Linter-sourced actions carry their fix code in the id.
        if let Some(code) = action_id.strip_prefix("ruff:") {
            let mut request = self.fallback_request(&language, Some(file), None);
            request.fix_code = Some(code.to_string());
            let primary = Error::NotFound(format!(
                "`{}` is a linter action, not a server action",
                action_id
            ));
            let outcome = self
                .fallbacks()
                .run(OpKind::CodeActionResolve, &request, primary)
                .await?;
            return Ok(ResolveOutcome {
                title: action_id.to_string(),
                summary: None,
                via: Some(outcome.strategy),
                fallback_text: Some(outcome.text),
            });
        }

        let Some((action, title)) = self.cached_action(file, action_id) else {
            return Err(Error::NotFound(format!(
                "unknown action id `{}`; list code actions first",
                action_id
            )));
        };

        let handle = self.client_for(file, &language).await?;
        handle.touch();

        let edit = match extract_edit(&action)? {
            Some(edit) => edit,
            None => {
                // No inline edit; ask the server to fill it in.
                let deadline = Self::deadline(self.timeouts().code_action_resolve_ms);
                let resolved = handle
                    .rpc()
                    .request_raw("codeAction/resolve", action.clone(), deadline)
                    .await
                    .map_err(|e| {
                        self.note_failure(&language, &e);
                        e
                    })?;
                extract_edit(&resolved)?.ok_or_else(|| {
                    Error::NotFound(format!("action `{}` resolved to no edit", title))
                })?
            }
        };

        let summary = apply_workspace_edit(&edit, handle.position_encoding(), false).await?;
        Ok(ResolveOutcome {
            title,
            summary: Some(summary),
            via: None,
            fallback_text: None,
        })
    }

    /// Previews an extract-function/extract-variable refactor as a unified
    /// diff. Nothing is applied; apply is a follow-on resolve call.
    pub async fn extract_refactor(
        &self,
        file: &Path,
        start_line: u32,
        start_col: u32,
        end_line: u32,
        end_col: u32,
        new_name: &str,
        kind: ExtractKind,
    ) -> Result<ExtractPreview> {
        let range = Range::new(
            Self::to_position(start_line, start_col)?,
            Self::to_position(end_line, end_col)?,
        );
        let language = self.manager().language_for_path(file);

        let (actions, handle) = self
            .code_actions_lsp(file, &language, range, Some(CodeActionKind::REFACTOR_EXTRACT))
            .await
            .map_err(|e| {
                self.note_failure(&language, &e);
                e
            })?;

        let wanted = match kind {
            ExtractKind::Function => ["function", "method"].as_slice(),
            ExtractKind::Variable => ["variable", "constant"].as_slice(),
        };
        let chosen = actions
            .iter()
            .filter_map(|action| match action {
                CodeActionOrCommand::CodeAction(action) => Some(action),
                CodeActionOrCommand::Command(_) => None,
            })
            .find(|action| {
                let title = action.title.to_ascii_lowercase();
                wanted.iter().any(|w| title.contains(w))
            })
            .or_else(|| {
                actions.iter().find_map(|action| match action {
                    CodeActionOrCommand::CodeAction(action) => Some(action),
                    CodeActionOrCommand::Command(_) => None,
                })
            })
            .ok_or_else(|| {
                Error::NotFound("server offered no extract actions for this range".to_string())
            })?;

        let edit = match &chosen.edit {
            Some(edit) => edit.clone(),
            None => {
                let deadline = Self::deadline(self.timeouts().extract_ms);
                let value = serde_json::to_value(chosen)
                    .map_err(|e| Error::Protocol(format!("unserializable action: {}", e)))?;
                let resolved = handle
                    .rpc()
                    .request_raw("codeAction/resolve", value, deadline)
                    .await?;
                extract_edit(&resolved)?.ok_or_else(|| {
                    Error::NotFound("extract action resolved to no edit".to_string())
                })?
            }
        };

        let diff = render_edit_diff(&edit, handle.position_encoding()).await?;
        Ok(ExtractPreview {
            action_title: chosen.title.clone(),
            new_name: new_name.to_string(),
            diff,
        })
    }

    async fn code_actions_lsp(
        &self,
        file: &Path,
        language: &Option<String>,
        range: Range,
        only: Option<CodeActionKind>,
    ) -> Result<(Vec<CodeActionOrCommand>, std::sync::Arc<crate::server::ServerHandle>)> {
        let (handle, uri) = self.positional(file, language).await?;
        let params = CodeActionParams {
            text_document: TextDocumentIdentifier { uri: uri.clone() },
            range,
            context: CodeActionContext {
                diagnostics: handle.diagnostics().current(&uri),
                only: only.map(|kind| vec![kind]),
                ..Default::default()
            },
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };

        let deadline = Self::deadline(self.timeouts().code_actions_ms);
        let response = handle
            .rpc()
            .request::<CodeActionRequest>(params, deadline)
            .await?;

        let actions = response.unwrap_or_default();
        if actions.is_empty() {
            return Err(Error::NotFound(
                "no code actions available for this range".to_string(),
            ));
        }
        Ok((actions, handle))
    }

    fn cache_actions(&self, file: &Path, actions: &[CodeActionOrCommand]) -> Vec<ActionEntry> {
        actions
            .iter()
            .enumerate()
            .filter_map(|(index, action)| {
                let id = index.to_string();
                let (title, kind) = match action {
                    CodeActionOrCommand::CodeAction(action) => (
                        action.title.clone(),
                        action.kind.as_ref().map(|k| k.as_str().to_string()),
                    ),
                    CodeActionOrCommand::Command(command) => (command.title.clone(), None),
                };
                let value = serde_json::to_value(action).ok()?;
                self.cache_action(file, id.clone(), value, title.clone());
                Some(ActionEntry { id, title, kind })
            })
            .collect()
    }
}

/// Pulls the `edit` member out of a raw code-action value, if present.
fn extract_edit(action: &Value) -> Result<Option<WorkspaceEdit>> {
    let edit = &action["edit"];
    if edit.is_null() {
        return Ok(None);
    }
    serde_json::from_value(edit.clone())
        .map(Some)
        .map_err(|e| Error::Protocol(format!("malformed workspace edit: {}", e)))
}

/// Lines like `ruff:F401 fix available — …` become resolvable entries.
fn parse_fallback_actions(text: &str) -> Vec<ActionEntry> {
    text.lines()
        .filter_map(|line| {
            let id = line.split_whitespace().next()?;
            id.starts_with("ruff:").then(|| ActionEntry {
                id: id.to_string(),
                title: line.to_string(),
                kind: Some("quickfix".to_string()),
            })
        })
        .collect()
}

/// Renders every file touched by the edit as one concatenated unified diff.
async fn render_edit_diff(
    edit: &WorkspaceEdit,
    encoding: crate::edits::PositionEncoding,
) -> Result<String> {
    let mut out = String::new();
    for (uri, edits) in collect_changes(edit) {
        let path = uri_to_path(&uri);
        let old = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::NotFound(format!("cannot read {}: {}", path.display(), e)))?;
        let new = apply_edits(&old, &edits, encoding)?;
        out.push_str(&unified_diff(&path, &old, &new));
    }
    if out.is_empty() {
        return Err(Error::NotFound("edit changes nothing".to_string()));
    }
    Ok(out)
}
