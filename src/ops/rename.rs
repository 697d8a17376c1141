//! Prepare-rename and rename.

use std::fmt::{self, Display, Formatter};
use std::path::Path;

use lsp_types::request::{PrepareRenameRequest, Rename};
use lsp_types::{
    Position, PrepareRenameResponse, Range, RenameParams, TextDocumentIdentifier,
    TextDocumentPositionParams,
};

use super::{via_suffix, Operations};
use crate::edits::{apply_workspace_edit, EditSummary};
use crate::error::{Error, Result};
use crate::fallback::OpKind;

/// What the server will rename at a position, if anything.
#[derive(Clone, Debug, PartialEq)]
pub struct PrepareRenameResult {
    pub renameable: bool,
    /// The placeholder/current text of the rename target, when reported.
    pub placeholder: Option<String>,
    /// The range that will be renamed, when reported.
    pub range: Option<Range>,
    pub via: Option<&'static str>,
}

impl Display for PrepareRenameResult {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        if !self.renameable {
            return write!(f, "not renameable");
        }
        match (&self.placeholder, &self.range) {
            (Some(placeholder), _) => write!(f, "renameable symbol: {}", placeholder)?,
            (None, Some(range)) => write!(
                f,
                "renameable range {}:{}-{}:{}",
                range.start.line + 1,
                range.start.character,
                range.end.line + 1,
                range.end.character
            )?,
            (None, None) => write!(f, "renameable")?,
        }
        write!(f, "{}", via_suffix(self.via))
    }
}

/// The outcome of a rename: which files changed (or would change) and how
/// many edits each took.
#[derive(Clone, Debug, PartialEq)]
pub struct RenameResult {
    pub summary: EditSummary,
    /// Raw preview text (a diff) when a fallback produced the result.
    pub preview: Option<String>,
    pub via: Option<&'static str>,
}

impl Display for RenameResult {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match &self.preview {
            Some(preview) => write!(f, "{}{}", preview, via_suffix(self.via)),
            None => write!(f, "{}{}", self.summary, via_suffix(self.via)),
        }
    }
}

impl Operations {
    /// Asks whether the symbol at the position can be renamed.
    pub async fn prepare_rename(
        &self,
        file: &Path,
        line: u32,
        col: u32,
    ) -> Result<PrepareRenameResult> {
        let position = Self::to_position(line, col)?;
        let language = self.manager().language_for_path(file);

        let primary = match self.prepare_rename_lsp(file, &language, position).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                self.note_failure(&language, &e);
                e
            }
        };
        if !super::should_fall_back(&primary) {
            return Err(primary);
        }

        let request = self.fallback_request(&language, Some(file), Some(position));
        let outcome = self
            .fallbacks()
            .run(OpKind::PrepareRename, &request, primary)
            .await?;
        Ok(PrepareRenameResult {
            renameable: true,
            placeholder: outcome
                .text
                .strip_prefix("renameable symbol: ")
                .map(str::to_string),
            range: None,
            via: Some(outcome.strategy),
        })
    }

    /// Renames the symbol at the position across the workspace.
    ///
    /// With `dry_run` the returned summary describes the edits without
    /// touching disk. The fallback chain only serves dry runs; a real rename
    /// requires the server's `WorkspaceEdit`.
    pub async fn rename(
        &self,
        file: &Path,
        line: u32,
        col: u32,
        new_name: &str,
        dry_run: bool,
    ) -> Result<RenameResult> {
        let position = Self::to_position(line, col)?;
        let language = self.manager().language_for_path(file);

        let primary = match self
            .rename_lsp(file, &language, position, new_name, dry_run)
            .await
        {
            Ok(result) => return Ok(result),
            Err(e) => {
                self.note_failure(&language, &e);
                e
            }
        };
        if !dry_run || !super::should_fall_back(&primary) {
            return Err(primary);
        }

        let mut request = self.fallback_request(&language, Some(file), Some(position));
        request.new_name = Some(new_name.to_string());
        let outcome = self
            .fallbacks()
            .run(OpKind::Rename, &request, primary)
            .await?;
        Ok(RenameResult {
            summary: EditSummary {
                files: vec![],
                applied: false,
            },
            preview: Some(outcome.text),
            via: Some(outcome.strategy),
        })
    }

    async fn prepare_rename_lsp(
        &self,
        file: &Path,
        language: &Option<String>,
        position: Position,
    ) -> Result<PrepareRenameResult> {
        let (handle, uri) = self.positional(file, language).await?;
        let params = TextDocumentPositionParams {
            text_document: TextDocumentIdentifier { uri },
            position,
        };

        let deadline = Self::deadline(self.timeouts().prepare_rename_ms);
        let response = handle
            .rpc()
            .request::<PrepareRenameRequest>(params, deadline)
            .await?;

        Ok(match response {
            None => PrepareRenameResult {
                renameable: false,
                placeholder: None,
                range: None,
                via: None,
            },
            Some(PrepareRenameResponse::Range(range)) => PrepareRenameResult {
                renameable: true,
                placeholder: None,
                range: Some(range),
                via: None,
            },
            Some(PrepareRenameResponse::RangeWithPlaceholder { range, placeholder }) => {
                PrepareRenameResult {
                    renameable: true,
                    placeholder: Some(placeholder),
                    range: Some(range),
                    via: None,
                }
            }
            Some(PrepareRenameResponse::DefaultBehavior { .. }) => PrepareRenameResult {
                renameable: true,
                placeholder: None,
                range: None,
                via: None,
            },
        })
    }

    async fn rename_lsp(
        &self,
        file: &Path,
        language: &Option<String>,
        position: Position,
        new_name: &str,
        dry_run: bool,
    ) -> Result<RenameResult> {
        let (handle, uri) = self.positional(file, language).await?;
        let params = RenameParams {
            text_document_position: TextDocumentPositionParams {
                text_document: TextDocumentIdentifier { uri },
                position,
            },
            new_name: new_name.to_string(),
            work_done_progress_params: Default::default(),
        };

        let deadline = Self::deadline(self.timeouts().rename_ms);
        let edit = handle.rpc().request::<Rename>(params, deadline).await?;

        let Some(edit) = edit else {
            return Err(Error::NotFound(
                "server returned no rename edit".to_string(),
            ));
        };

        let summary =
            apply_workspace_edit(&edit, handle.position_encoding(), dry_run).await?;
        Ok(RenameResult {
            summary,
            preview: None,
            via: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::edits::FileEdits;

    #[test]
    fn prepare_rename_response_shapes_deserialize() {
        let range: PrepareRenameResponse = serde_json::from_value(json!({
            "start": {"line": 1, "character": 0}, "end": {"line": 1, "character": 3}
        }))
        .unwrap();
        assert!(matches!(range, PrepareRenameResponse::Range(_)));

        let with_placeholder: PrepareRenameResponse = serde_json::from_value(json!({
            "range": {"start": {"line": 1, "character": 0}, "end": {"line": 1, "character": 3}},
            "placeholder": "old_name"
        }))
        .unwrap();
        assert!(matches!(
            with_placeholder,
            PrepareRenameResponse::RangeWithPlaceholder { .. }
        ));

        let default: PrepareRenameResponse =
            serde_json::from_value(json!({"defaultBehavior": true})).unwrap();
        assert!(matches!(
            default,
            PrepareRenameResponse::DefaultBehavior { .. }
        ));
    }

    #[test]
    fn render_not_renameable() {
        let result = PrepareRenameResult {
            renameable: false,
            placeholder: None,
            range: None,
            via: None,
        };
        assert_eq!(result.to_string(), "not renameable");
    }

    #[test]
    fn rename_result_mentions_files_and_counts() {
        let result = RenameResult {
            summary: EditSummary {
                files: vec![
                    FileEdits {
                        path: "/t/a.py".into(),
                        edit_count: 2,
                    },
                    FileEdits {
                        path: "/t/b.py".into(),
                        edit_count: 1,
                    },
                ],
                applied: false,
            },
            preview: None,
            via: None,
        };
        assert_eq!(
            result.to_string(),
            "would apply 2 edit(s) in /t/a.py, 1 edit(s) in /t/b.py"
        );
    }
}
