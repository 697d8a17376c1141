//! Diagnostics for one file, fed by server publishes.

use std::fmt::{self, Display, Formatter};
use std::path::Path;
use std::time::Duration;

use lsp_types::{Diagnostic, DiagnosticSeverity, NumberOrString};

use super::{via_suffix, Operations};
use crate::error::Result;
use crate::fallback::OpKind;
use crate::sync::SyncOutcome;

/// One reported problem.
#[derive(Clone, Debug, PartialEq)]
pub struct DiagnosticItem {
    /// 1-based line.
    pub line: u32,
    /// 0-based character.
    pub col: u32,
    pub severity: String,
    pub code: Option<String>,
    pub message: String,
}

/// All current diagnostics for a file.
#[derive(Clone, Debug)]
pub struct FileDiagnostics {
    pub items: Vec<DiagnosticItem>,
    pub via: Option<&'static str>,
    fallback_text: Option<String>,
}

impl Display for FileDiagnostics {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        if let Some(text) = &self.fallback_text {
            return write!(f, "{}{}", text, via_suffix(self.via));
        }
        if self.items.is_empty() {
            return write!(f, "no diagnostics");
        }
        let lines: Vec<String> = self
            .items
            .iter()
            .map(|item| {
                format!(
                    "{}:{} {}{} {}",
                    item.line,
                    item.col,
                    item.severity,
                    item.code
                        .as_deref()
                        .map(|c| format!("[{}]", c))
                        .unwrap_or_default(),
                    item.message
                )
            })
            .collect();
        write!(f, "{}", lines.join("\n"))
    }
}

impl Operations {
    /// Current diagnostics for `file`.
    ///
    /// The file is synced first; when that sync actually sent didOpen or
    /// didChange, the call waits a short window for the server's first
    /// publish before returning what is cached.
    pub async fn diagnostics(&self, file: &Path) -> Result<FileDiagnostics> {
        let language = self.manager().language_for_path(file);

        let primary = match self.diagnostics_lsp(file, &language).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                self.note_failure(&language, &e);
                e
            }
        };
        if !super::should_fall_back(&primary) {
            return Err(primary);
        }

        let request = self.fallback_request(&language, Some(file), None);
        let outcome = self
            .fallbacks()
            .run(OpKind::Diagnostics, &request, primary)
            .await?;
        Ok(FileDiagnostics {
            items: vec![],
            via: Some(outcome.strategy),
            fallback_text: Some(outcome.text),
        })
    }

    async fn diagnostics_lsp(
        &self,
        file: &Path,
        language: &Option<String>,
    ) -> Result<FileDiagnostics> {
        let handle = self.client_for(file, language).await?;
        let (uri, outcome) = handle.docs().ensure_synced(handle.rpc(), file).await?;
        handle.touch();

        let window = Duration::from_millis(self.timeouts().diagnostics_wait_ms);
        let diagnostics = match outcome {
            SyncOutcome::Opened | SyncOutcome::Changed => {
                handle.diagnostics().wait_for_publish(&uri, window).await
            }
            SyncOutcome::Unchanged => handle.diagnostics().current(&uri),
        };

        Ok(FileDiagnostics {
            items: diagnostics.iter().map(to_item).collect(),
            via: None,
            fallback_text: None,
        })
    }
}

fn to_item(diagnostic: &Diagnostic) -> DiagnosticItem {
    DiagnosticItem {
        line: diagnostic.range.start.line + 1,
        col: diagnostic.range.start.character,
        severity: severity_name(diagnostic.severity),
        code: diagnostic.code.as_ref().map(|code| match code {
            NumberOrString::Number(n) => n.to_string(),
            NumberOrString::String(s) => s.clone(),
        }),
        message: diagnostic.message.clone(),
    }
}

fn severity_name(severity: Option<DiagnosticSeverity>) -> String {
    match severity {
        Some(DiagnosticSeverity::ERROR) => "error",
        Some(DiagnosticSeverity::WARNING) => "warning",
        Some(DiagnosticSeverity::INFORMATION) => "info",
        Some(DiagnosticSeverity::HINT) => "hint",
        _ => "unknown",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use lsp_types::{Position, Range};
    use serde_json::json;

    use super::*;

    #[test]
    fn formats_diagnostic_rows() {
        let diagnostic: Diagnostic = serde_json::from_value(json!({
            "range": {"start": {"line": 2, "character": 4},
                      "end": {"line": 2, "character": 9}},
            "severity": 1,
            "code": "F821",
            "message": "undefined name `x`"
        }))
        .unwrap();

        let item = to_item(&diagnostic);
        assert_eq!(item.line, 3);
        assert_eq!(item.col, 4);
        assert_eq!(item.severity, "error");
        assert_eq!(item.code.as_deref(), Some("F821"));

        let rendered = FileDiagnostics {
            items: vec![item],
            via: None,
            fallback_text: None,
        }
        .to_string();
        assert_eq!(rendered, "3:4 error[F821] undefined name `x`");
    }

    #[test]
    fn missing_severity_is_unknown() {
        let diagnostic = Diagnostic {
            range: Range::new(Position::new(0, 0), Position::new(0, 1)),
            message: "something".to_string(),
            ..Default::default()
        };
        assert_eq!(to_item(&diagnostic).severity, "unknown");
    }

    #[test]
    fn empty_diagnostics_render_placeholder() {
        let rendered = FileDiagnostics {
            items: vec![],
            via: None,
            fallback_text: None,
        }
        .to_string();
        assert_eq!(rendered, "no diagnostics");
    }
}
