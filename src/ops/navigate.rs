//! Go-to-definition and find-references.

use std::fmt::{self, Display, Formatter};
use std::path::Path;

use lsp_types::request::{GotoDefinition, References};
use lsp_types::{
    GotoDefinitionParams, GotoDefinitionResponse, Location, Position, ReferenceContext,
    ReferenceParams, TextDocumentIdentifier, TextDocumentPositionParams,
};

use super::{format_location, via_suffix, Operations};
use crate::error::{Error, Result};
use crate::fallback::OpKind;

/// A formatted list of `file:line:col` locations, possibly truncated.
#[derive(Clone, Debug, PartialEq)]
pub struct Locations {
    pub items: Vec<String>,
    /// How many further locations were truncated away.
    pub more: usize,
    pub via: Option<&'static str>,
}

impl Display for Locations {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.items.join("\n"))?;
        if self.more > 0 {
            write!(f, "\n... and {} more", self.more)?;
        }
        write!(f, "{}", via_suffix(self.via))
    }
}

impl Operations {
    /// Definition site(s) of the symbol at the given position.
    pub async fn goto_definition(&self, file: &Path, line: u32, col: u32) -> Result<Locations> {
        let position = Self::to_position(line, col)?;
        let language = self.manager().language_for_path(file);

        let primary = match self.definition_lsp(file, &language, position).await {
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
            .run(OpKind::Definition, &request, primary)
            .await?;
        Ok(Locations {
            items: outcome.text.lines().map(str::to_string).collect(),
            more: 0,
            via: Some(outcome.strategy),
        })
    }

    /// All references to the symbol at the given position, truncated to the
    /// configured maximum.
    pub async fn find_references(
        &self,
        file: &Path,
        line: u32,
        col: u32,
        include_declaration: bool,
    ) -> Result<Locations> {
        let position = Self::to_position(line, col)?;
        let language = self.manager().language_for_path(file);

        let primary = match self
            .references_lsp(file, &language, position, include_declaration)
            .await
        {
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
            .run(OpKind::References, &request, primary)
            .await?;
        let max = self.manager().config().max_references_returned.max(1);
        let all: Vec<String> = outcome.text.lines().map(str::to_string).collect();
        let more = all.len().saturating_sub(max);
        Ok(Locations {
            items: all.into_iter().take(max).collect(),
            more,
            via: Some(outcome.strategy),
        })
    }

    async fn definition_lsp(
        &self,
        file: &Path,
        language: &Option<String>,
        position: Position,
    ) -> Result<Locations> {
        let (handle, uri) = self.positional(file, language).await?;
        let params = GotoDefinitionParams {
            text_document_position_params: TextDocumentPositionParams {
                text_document: TextDocumentIdentifier { uri },
                position,
            },
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };

        let deadline = Self::deadline(self.timeouts().definition_ms);
        let response = handle
            .rpc()
            .request::<GotoDefinition>(params, deadline)
            .await?;

        let items = flatten_definition(response);
        if items.is_empty() {
            return Err(Error::NotFound("no definition found".to_string()));
        }
        Ok(Locations {
            items,
            more: 0,
            via: None,
        })
    }

    async fn references_lsp(
        &self,
        file: &Path,
        language: &Option<String>,
        position: Position,
        include_declaration: bool,
    ) -> Result<Locations> {
        let (handle, uri) = self.positional(file, language).await?;
        let params = ReferenceParams {
            text_document_position: TextDocumentPositionParams {
                text_document: TextDocumentIdentifier { uri },
                position,
            },
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
            context: ReferenceContext {
                include_declaration,
            },
        };

        let deadline = Self::deadline(self.timeouts().references_ms);
        let response = handle.rpc().request::<References>(params, deadline).await?;

        let locations = response.unwrap_or_default();
        if locations.is_empty() {
            return Err(Error::NotFound("no references found".to_string()));
        }

        let max = self.manager().config().max_references_returned.max(1);
        let more = locations.len().saturating_sub(max);
        let items = locations
            .iter()
            .take(max)
            .map(|l| format_location(&l.uri, &l.range))
            .collect();
        Ok(Locations {
            items,
            more,
            via: None,
        })
    }
}

/// Servers answer `textDocument/definition` with a single `Location`, a
/// `Location[]`, or a `LocationLink[]`; all three collapse to the same
/// formatted list.
fn flatten_definition(response: Option<GotoDefinitionResponse>) -> Vec<String> {
    match response {
        None => vec![],
        Some(GotoDefinitionResponse::Scalar(location)) => {
            vec![format_location(&location.uri, &location.range)]
        }
        Some(GotoDefinitionResponse::Array(locations)) => locations
            .iter()
            .map(|l: &Location| format_location(&l.uri, &l.range))
            .collect(),
        Some(GotoDefinitionResponse::Link(links)) => links
            .iter()
            .map(|link| format_location(&link.target_uri, &link.target_selection_range))
            .collect(),
    }
}
