//! Applying server-returned text edits to caller files.
//!
//! This is the only part of the crate that writes caller files. Writes go
//! through a temp file and a rename, so concurrent readers observe either the
//! old or the new content, never a torn mix.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use lsp_types::{
    DocumentChangeOperation, DocumentChanges, OneOf, Position, PositionEncodingKind, Range,
    ServerCapabilities, TextEdit, Url, WorkspaceEdit,
};

use crate::error::{Error, Result};
use crate::uri::uri_to_path;

/// How `Position.character` is measured, negotiated during `initialize`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PositionEncoding {
    /// Character counts UTF-8 bytes.
    Utf8,
    /// Character counts UTF-16 code units. The protocol default.
    Utf16,
}

impl PositionEncoding {
    pub(crate) fn negotiated(capabilities: &ServerCapabilities) -> Self {
        match &capabilities.position_encoding {
            Some(kind) if *kind == PositionEncodingKind::UTF8 => PositionEncoding::Utf8,
            _ => PositionEncoding::Utf16,
        }
    }
}

/// Byte offsets of every line start in `text`.
fn line_starts(text: &str) -> Vec<usize> {
    let mut starts = vec![0];
    for (idx, byte) in text.bytes().enumerate() {
        if byte == b'\n' {
            starts.push(idx + 1);
        }
    }
    starts
}

/// Converts an LSP position to a byte offset in `text`.
///
/// A character past the end of its line clamps to the line end, per protocol
/// convention; a line past the end of the file is an `invalid-position`
/// error.
pub fn position_to_offset(
    text: &str,
    position: Position,
    encoding: PositionEncoding,
) -> Result<usize> {
    let starts = line_starts(text);
    let line = position.line as usize;
    if line >= starts.len() {
        return Err(Error::InvalidPosition(format!(
            "line {} is past the end of the file ({} lines)",
            position.line,
            starts.len()
        )));
    }

    let line_start = starts[line];
    let line_end = match starts.get(line + 1) {
        Some(&next) => {
            let mut end = next - 1; // exclude '\n'
            if end > line_start && text.as_bytes()[end - 1] == b'\r' {
                end -= 1;
            }
            end
        }
        None => text.len(),
    };
    let line_text = &text[line_start..line_end];

    let offset = match encoding {
        PositionEncoding::Utf8 => {
            let mut offset = line_start + (position.character as usize).min(line_text.len());
            while !text.is_char_boundary(offset) {
                offset -= 1;
            }
            offset
        }
        PositionEncoding::Utf16 => {
            let mut units = 0u32;
            let mut offset = line_start;
            for ch in line_text.chars() {
                if units >= position.character {
                    break;
                }
                units += ch.len_utf16() as u32;
                offset += ch.len_utf8();
            }
            offset
        }
    };

    Ok(offset)
}

fn range_to_offsets(text: &str, range: Range, encoding: PositionEncoding) -> Result<(usize, usize)> {
    let start = position_to_offset(text, range.start, encoding)?;
    let end = position_to_offset(text, range.end, encoding)?;
    if end < start {
        return Err(Error::InvalidPosition(format!(
            "range end {}:{} precedes its start",
            range.end.line, range.end.character
        )));
    }
    Ok((start, end))
}

fn pos_key(position: Position) -> (u32, u32) {
    (position.line, position.character)
}

/// Applies a set of edits to a string, returning the new content.
///
/// Edits are applied in descending start order so earlier offsets stay valid
/// while later spans are spliced. Overlapping edits are rejected.
pub fn apply_edits(text: &str, edits: &[TextEdit], encoding: PositionEncoding) -> Result<String> {
    let mut sorted: Vec<&TextEdit> = edits.iter().collect();
    sorted.sort_by(|a, b| pos_key(b.range.start).cmp(&pos_key(a.range.start)));

    for pair in sorted.windows(2) {
        let (later, earlier) = (pair[0], pair[1]);
        if pos_key(earlier.range.end) > pos_key(later.range.start) {
            return Err(Error::OverlappingEdits(format!(
                "edit at {}:{} overlaps edit at {}:{}",
                earlier.range.start.line,
                earlier.range.start.character,
                later.range.start.line,
                later.range.start.character
            )));
        }
    }

    let mut result = text.to_string();
    for edit in &sorted {
        let (start, end) = range_to_offsets(text, edit.range, encoding)?;
        result.replace_range(start..end, &edit.new_text);
    }
    Ok(result)
}

/// Flattens a `WorkspaceEdit` into per-URI edit lists.
///
/// Both the `changes` map and the `documentChanges` array are accepted;
/// resource operations (file create/rename/delete) are not produced by the
/// requests this pool issues and are skipped. URIs are returned in sorted
/// order so output is deterministic.
pub fn collect_changes(edit: &WorkspaceEdit) -> Vec<(Url, Vec<TextEdit>)> {
    let mut merged: Vec<(Url, Vec<TextEdit>)> = Vec::new();
    let mut push = |uri: Url, edits: Vec<TextEdit>| {
        if let Some((_, existing)) = merged.iter_mut().find(|(u, _)| *u == uri) {
            existing.extend(edits);
        } else {
            merged.push((uri, edits));
        }
    };

    if let Some(changes) = &edit.changes {
        for (uri, edits) in changes {
            push(uri.clone(), edits.clone());
        }
    } else if let Some(document_changes) = &edit.document_changes {
        let edits_iter: Vec<&lsp_types::TextDocumentEdit> = match document_changes {
            DocumentChanges::Edits(edits) => edits.iter().collect(),
            DocumentChanges::Operations(ops) => ops
                .iter()
                .filter_map(|op| match op {
                    DocumentChangeOperation::Edit(edit) => Some(edit),
                    DocumentChangeOperation::Op(_) => None,
                })
                .collect(),
        };
        for doc_edit in edits_iter {
            let edits = doc_edit
                .edits
                .iter()
                .map(|e| match e {
                    OneOf::Left(edit) => edit.clone(),
                    OneOf::Right(annotated) => annotated.text_edit.clone(),
                })
                .collect();
            push(doc_edit.text_document.uri.clone(), edits);
        }
    }

    merged.sort_by(|(a, _), (b, _)| a.as_str().cmp(b.as_str()));
    merged
}

/// One file touched by a workspace edit.
#[derive(Clone, Debug, PartialEq)]
pub struct FileEdits {
    pub path: PathBuf,
    pub edit_count: usize,
}

/// What a workspace edit did (or would do, for a dry run).
#[derive(Clone, Debug, PartialEq)]
pub struct EditSummary {
    pub files: Vec<FileEdits>,
    pub applied: bool,
}

impl std::fmt::Display for EditSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.files.is_empty() {
            return write!(f, "no edits");
        }
        let verb = if self.applied { "applied" } else { "would apply" };
        let parts: Vec<String> = self
            .files
            .iter()
            .map(|file| format!("{} edit(s) in {}", file.edit_count, file.path.display()))
            .collect();
        write!(f, "{} {}", verb, parts.join(", "))
    }
}

/// Applies a `WorkspaceEdit` to disk.
///
/// With `dry_run` the files are read and the edits validated (including
/// overlap detection), but nothing is written.
pub async fn apply_workspace_edit(
    edit: &WorkspaceEdit,
    encoding: PositionEncoding,
    dry_run: bool,
) -> Result<EditSummary> {
    let mut files = Vec::new();

    for (uri, edits) in collect_changes(edit) {
        let path = uri_to_path(&uri);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::NotFound(format!("cannot read {}: {}", path.display(), e)))?;

        let new_text = apply_edits(&text, &edits, encoding)
            .map_err(|e| match e {
                Error::OverlappingEdits(_) => {
                    Error::OverlappingEdits(format!("{}", path.display()))
                }
                other => other,
            })?;

        if !dry_run {
            write_atomic(&path, &new_text).await?;
        }
        files.push(FileEdits {
            path,
            edit_count: edits.len(),
        });
    }

    Ok(EditSummary {
        files,
        applied: !dry_run,
    })
}

/// Writes via a sibling temp file plus rename.
async fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "edit".to_string());
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()));

    let write = async {
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, path).await
    };
    if let Err(e) = write.await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(Error::NotFound(format!(
            "cannot write {}: {}",
            path.display(),
            e
        )));
    }
    Ok(())
}

/// Renders a unified diff between two versions of one file.
///
/// Changed lines are collapsed into a single hunk with up to three lines of
/// context on each side. Returns an empty string when the contents match.
pub fn unified_diff(path: &Path, old: &str, new: &str) -> String {
    if old == new {
        return String::new();
    }

    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();

    let mut prefix = 0;
    while prefix < old_lines.len()
        && prefix < new_lines.len()
        && old_lines[prefix] == new_lines[prefix]
    {
        prefix += 1;
    }
    let mut suffix = 0;
    while suffix < old_lines.len() - prefix
        && suffix < new_lines.len() - prefix
        && old_lines[old_lines.len() - 1 - suffix] == new_lines[new_lines.len() - 1 - suffix]
    {
        suffix += 1;
    }

    const CONTEXT: usize = 3;
    let ctx_start = prefix.saturating_sub(CONTEXT);
    let old_changed_end = old_lines.len() - suffix;
    let new_changed_end = new_lines.len() - suffix;
    let old_ctx_end = (old_changed_end + CONTEXT).min(old_lines.len());

    let old_count = old_ctx_end - ctx_start;
    let new_count = new_changed_end + (old_ctx_end - old_changed_end) - ctx_start;

    let mut out = String::new();
    let _ = writeln!(out, "--- a{}", path.display());
    let _ = writeln!(out, "+++ b{}", path.display());
    let _ = writeln!(
        out,
        "@@ -{},{} +{},{} @@",
        ctx_start + 1,
        old_count,
        ctx_start + 1,
        new_count
    );
    for line in &old_lines[ctx_start..prefix] {
        let _ = writeln!(out, " {}", line);
    }
    for line in &old_lines[prefix..old_changed_end] {
        let _ = writeln!(out, "-{}", line);
    }
    for line in &new_lines[prefix..new_changed_end] {
        let _ = writeln!(out, "+{}", line);
    }
    for line in &old_lines[old_changed_end..old_ctx_end] {
        let _ = writeln!(out, " {}", line);
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::uri::file_uri;

    fn edit(start: (u32, u32), end: (u32, u32), text: &str) -> TextEdit {
        TextEdit {
            range: Range::new(
                Position::new(start.0, start.1),
                Position::new(end.0, end.1),
            ),
            new_text: text.to_string(),
        }
    }

    #[test]
    fn applies_single_edit() {
        let text = "def f(x):\n  return x\n";
        let out = apply_edits(
            text,
            &[edit((0, 4), (0, 5), "g")],
            PositionEncoding::Utf16,
        )
        .unwrap();
        assert_eq!(out, "def g(x):\n  return x\n");
    }

    #[test]
    fn applies_edits_in_descending_order() {
        let text = "alpha beta gamma\n";
        let out = apply_edits(
            text,
            &[
                edit((0, 0), (0, 5), "ALPHA"),
                edit((0, 11), (0, 16), "GAMMA"),
            ],
            PositionEncoding::Utf16,
        )
        .unwrap();
        assert_eq!(out, "ALPHA beta GAMMA\n");
    }

    #[test]
    fn rejects_overlapping_edits() {
        let text = "abcdef\n";
        let err = apply_edits(
            text,
            &[edit((0, 0), (0, 4), "x"), edit((0, 2), (0, 6), "y")],
            PositionEncoding::Utf16,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "overlapping-edits");
    }

    #[test]
    fn touching_edits_are_not_overlapping() {
        let text = "abcdef\n";
        let out = apply_edits(
            text,
            &[edit((0, 0), (0, 3), "x"), edit((0, 3), (0, 6), "y")],
            PositionEncoding::Utf16,
        )
        .unwrap();
        assert_eq!(out, "xy\n");
    }

    #[test]
    fn utf16_offsets_count_surrogate_pairs() {
        // '🦀' is two UTF-16 code units and four UTF-8 bytes.
        let text = "a🦀b\n";
        let out = apply_edits(
            text,
            &[edit((0, 3), (0, 4), "X")],
            PositionEncoding::Utf16,
        )
        .unwrap();
        assert_eq!(out, "a🦀X\n");
    }

    #[test]
    fn utf8_offsets_count_bytes() {
        let text = "a🦀b\n";
        let out = apply_edits(text, &[edit((0, 5), (0, 6), "X")], PositionEncoding::Utf8).unwrap();
        assert_eq!(out, "a🦀X\n");
    }

    #[test]
    fn character_past_line_end_clamps() {
        let text = "ab\ncd\n";
        let offset =
            position_to_offset(text, Position::new(0, 99), PositionEncoding::Utf16).unwrap();
        assert_eq!(offset, 2);
    }

    #[test]
    fn line_past_eof_is_invalid_position() {
        let text = "ab\n";
        let err =
            position_to_offset(text, Position::new(5, 0), PositionEncoding::Utf16).unwrap_err();
        assert_eq!(err.kind(), "invalid-position");
    }

    #[test]
    fn edited_ranges_read_back_exactly() {
        let text = "one\ntwo\nthree\nfour\n";
        let edits = vec![edit((1, 0), (1, 3), "TWO"), edit((3, 0), (3, 4), "FOUR")];
        let out = apply_edits(text, &edits, PositionEncoding::Utf16).unwrap();
        assert_eq!(out, "one\nTWO\nthree\nFOUR\n");
        // Lines outside any edit range are byte-identical.
        assert_eq!(out.lines().nth(0), text.lines().nth(0));
        assert_eq!(out.lines().nth(2), text.lines().nth(2));
    }

    #[tokio::test]
    async fn dry_run_leaves_disk_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.py");
        tokio::fs::write(&path, "x = 1\n").await.unwrap();

        let mut changes = HashMap::new();
        changes.insert(
            file_uri(&path).unwrap(),
            vec![edit((0, 0), (0, 1), "name")],
        );
        let ws_edit = WorkspaceEdit {
            changes: Some(changes),
            ..Default::default()
        };

        let summary = apply_workspace_edit(&ws_edit, PositionEncoding::Utf16, true)
            .await
            .unwrap();
        assert!(!summary.applied);
        assert_eq!(summary.files.len(), 1);
        assert_eq!(summary.files[0].edit_count, 1);
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "x = 1\n");

        let summary = apply_workspace_edit(&ws_edit, PositionEncoding::Utf16, false)
            .await
            .unwrap();
        assert!(summary.applied);
        assert_eq!(
            tokio::fs::read_to_string(&path).await.unwrap(),
            "name = 1\n"
        );
    }

    #[tokio::test]
    async fn multi_file_edit_touches_every_file() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.py");
        let b = dir.path().join("b.py");
        tokio::fs::write(&a, "old()\n").await.unwrap();
        tokio::fs::write(&b, "old()\nold()\n").await.unwrap();

        let mut changes = HashMap::new();
        changes.insert(file_uri(&a).unwrap(), vec![edit((0, 0), (0, 3), "new")]);
        changes.insert(
            file_uri(&b).unwrap(),
            vec![edit((0, 0), (0, 3), "new"), edit((1, 0), (1, 3), "new")],
        );
        let ws_edit = WorkspaceEdit {
            changes: Some(changes),
            ..Default::default()
        };

        let summary = apply_workspace_edit(&ws_edit, PositionEncoding::Utf16, false)
            .await
            .unwrap();
        assert_eq!(summary.files.len(), 2);
        assert_eq!(tokio::fs::read_to_string(&a).await.unwrap(), "new()\n");
        assert_eq!(
            tokio::fs::read_to_string(&b).await.unwrap(),
            "new()\nnew()\n"
        );
    }

    #[test]
    fn unified_diff_marks_changed_lines() {
        let old = "a\nb\nc\nd\ne\nf\ng\nh\n";
        let new = "a\nb\nc\nd\nE\nf\ng\nh\n";
        let diff = unified_diff(Path::new("/t/x.py"), old, new);

        assert!(diff.starts_with("--- a/t/x.py\n+++ b/t/x.py\n"));
        assert!(diff.contains("-e\n"));
        assert!(diff.contains("+E\n"));
        assert!(diff.contains("@@ -2,7 +2,7 @@"));
    }

    #[test]
    fn unified_diff_of_identical_content_is_empty() {
        assert_eq!(unified_diff(Path::new("/t/x.py"), "a\n", "a\n"), "");
    }
}
