//! The hover operation.

use std::fmt::{self, Display, Formatter};
use std::path::Path;

use lsp_types::request::HoverRequest;
use lsp_types::{
    HoverContents, HoverParams, MarkedString, Position, TextDocumentIdentifier,
    TextDocumentPositionParams,
};

use super::{via_suffix, Operations};
use crate::error::Result;
use crate::fallback::OpKind;

/// Rendered hover content at a position.
#[derive(Clone, Debug, PartialEq)]
pub struct HoverResult {
    pub text: String,
    pub via: Option<&'static str>,
}

impl Display for HoverResult {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}{}", self.text, via_suffix(self.via))
    }
}

impl Operations {
    /// Hover documentation at the given position (1-based line, 0-based
    /// column).
    pub async fn hover(&self, file: &Path, line: u32, col: u32) -> Result<HoverResult> {
        let position = Self::to_position(line, col)?;
        let language = self.manager().language_for_path(file);

        let primary = match self.hover_lsp(file, &language, position).await {
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
            .run(OpKind::Hover, &request, primary)
            .await?;
        Ok(HoverResult {
            text: outcome.text,
            via: Some(outcome.strategy),
        })
    }

    async fn hover_lsp(
        &self,
        file: &Path,
        language: &Option<String>,
        position: Position,
    ) -> Result<HoverResult> {
        let (handle, uri) = self.positional(file, language).await?;
        let params = HoverParams {
            text_document_position_params: TextDocumentPositionParams {
                text_document: TextDocumentIdentifier { uri },
                position,
            },
            work_done_progress_params: Default::default(),
        };

        let deadline = Self::deadline(self.timeouts().hover_ms);
        let hover = handle.rpc().request::<HoverRequest>(params, deadline).await?;

        let text = match hover {
            Some(hover) => render_contents(hover.contents),
            None => String::new(),
        };
        if text.is_empty() {
            return Ok(HoverResult {
                text: "no hover info".to_string(),
                via: None,
            });
        }
        Ok(HoverResult { text, via: None })
    }
}

fn render_contents(contents: HoverContents) -> String {
    match contents {
        HoverContents::Scalar(marked) => render_marked(marked),
        HoverContents::Array(parts) => parts
            .into_iter()
            .map(render_marked)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n"),
        HoverContents::Markup(markup) => markup.value,
    }
}

fn render_marked(marked: MarkedString) -> String {
    match marked {
        MarkedString::String(text) => text,
        MarkedString::LanguageString(ls) => format!("```{}\n{}\n```", ls.language, ls.value),
    }
}

#[cfg(test)]
mod tests {
    use lsp_types::{LanguageString, MarkupContent, MarkupKind};

    use super::*;

    #[test]
    fn renders_markup_and_marked_strings() {
        let markup = HoverContents::Markup(MarkupContent {
            kind: MarkupKind::Markdown,
            value: "**f** a function".to_string(),
        });
        assert_eq!(render_contents(markup), "**f** a function");

        let scalar = HoverContents::Scalar(MarkedString::LanguageString(LanguageString {
            language: "python".to_string(),
            value: "def f(x)".to_string(),
        }));
        assert_eq!(render_contents(scalar), "```python\ndef f(x)\n```");

        let array = HoverContents::Array(vec![
            MarkedString::String("sig".to_string()),
            MarkedString::String(String::new()),
            MarkedString::String("doc".to_string()),
        ]);
        assert_eq!(render_contents(array), "sig\n\ndoc");
    }

    #[test]
    fn fallback_results_are_annotated() {
        let result = HoverResult {
            text: "f(x) -> x".to_string(),
            via: Some("jedi"),
        };
        assert_eq!(result.to_string(), "f(x) -> x (via fallback: jedi)");

        let direct = HoverResult {
            text: "f(x) -> x".to_string(),
            via: None,
        };
        assert_eq!(direct.to_string(), "f(x) -> x");
    }
}
