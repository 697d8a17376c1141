//! Document and workspace symbol listings.

use std::fmt::{self, Display, Formatter, Write as _};
use std::path::Path;

use lsp_types::request::DocumentSymbolRequest;
use lsp_types::{
    DocumentSymbol, DocumentSymbolParams, DocumentSymbolResponse, SymbolInformation, SymbolKind,
    TextDocumentIdentifier, Url,
};
use serde_json::{json, Value};

use super::{via_suffix, Operations};
use crate::error::{Error, Result};
use crate::fallback::OpKind;
use crate::uri::uri_to_path;

/// One node of a document outline.
#[derive(Clone, Debug, PartialEq)]
pub struct SymbolNode {
    pub name: String,
    pub kind: String,
    /// 1-based line of the symbol's selection range.
    pub line: u32,
    pub children: Vec<SymbolNode>,
}

/// Hierarchical outline of one document.
#[derive(Clone, Debug)]
pub struct SymbolOutline {
    pub roots: Vec<SymbolNode>,
    pub via: Option<&'static str>,
    /// Pre-rendered text when a fallback produced the outline.
    fallback_text: Option<String>,
}

impl Display for SymbolOutline {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        if let Some(text) = &self.fallback_text {
            return write!(f, "{}{}", text, via_suffix(self.via));
        }
        let mut out = String::new();
        for root in &self.roots {
            render_node(&mut out, root, 0);
        }
        write!(f, "{}", out.trim_end())
    }
}

fn render_node(out: &mut String, node: &SymbolNode, depth: usize) {
    let _ = writeln!(
        out,
        "{}{} {} (line {})",
        "  ".repeat(depth),
        node.kind,
        node.name,
        node.line
    );
    for child in &node.children {
        render_node(out, child, depth + 1);
    }
}

/// Flat workspace-wide symbol listing.
#[derive(Clone, Debug)]
pub struct WorkspaceSymbols {
    pub items: Vec<String>,
    pub via: Option<&'static str>,
}

impl Display for WorkspaceSymbols {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}{}", self.items.join("\n"), via_suffix(self.via))
    }
}

impl Operations {
    /// Hierarchical outline of `file`.
    pub async fn document_symbols(&self, file: &Path) -> Result<SymbolOutline> {
        let language = self.manager().language_for_path(file);

        let primary = match self.document_symbols_lsp(file, &language).await {
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
            .run(OpKind::DocumentSymbols, &request, primary)
            .await?;
        Ok(SymbolOutline {
            roots: vec![],
            via: Some(outcome.strategy),
            fallback_text: Some(outcome.text),
        })
    }

    /// Workspace-wide fuzzy symbol query.
    pub async fn workspace_symbols(&self, language: &str, query: &str) -> Result<WorkspaceSymbols> {
        let language = Some(language.to_string());

        let primary = match self.workspace_symbols_lsp(&language, query).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                self.note_failure(&language, &e);
                e
            }
        };
        if !super::should_fall_back(&primary) {
            return Err(primary);
        }

        let mut request = self.fallback_request(&language, None, None);
        request.query = Some(query.to_string());
        let outcome = self
            .fallbacks()
            .run(OpKind::WorkspaceSymbols, &request, primary)
            .await?;
        Ok(WorkspaceSymbols {
            items: outcome.text.lines().map(str::to_string).collect(),
            via: Some(outcome.strategy),
        })
    }

    async fn document_symbols_lsp(
        &self,
        file: &Path,
        language: &Option<String>,
    ) -> Result<SymbolOutline> {
        let (handle, uri) = self.positional(file, language).await?;
        let params = DocumentSymbolParams {
            text_document: TextDocumentIdentifier { uri },
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };

        let deadline = Self::deadline(self.timeouts().document_symbols_ms);
        let response = handle
            .rpc()
            .request::<DocumentSymbolRequest>(params, deadline)
            .await?;

        let roots = match response {
            Some(DocumentSymbolResponse::Nested(symbols)) => {
                symbols.iter().map(nested_node).collect()
            }
            Some(DocumentSymbolResponse::Flat(symbols)) => {
                symbols.iter().map(flat_node).collect()
            }
            None => vec![],
        };
        if roots.is_empty() {
            return Err(Error::NotFound("no symbols in document".to_string()));
        }
        Ok(SymbolOutline {
            roots,
            via: None,
            fallback_text: None,
        })
    }

    async fn workspace_symbols_lsp(
        &self,
        language: &Option<String>,
        query: &str,
    ) -> Result<WorkspaceSymbols> {
        let Some(language) = language else {
            return Err(Error::NotFound("no language given".to_string()));
        };
        let handle = match self.manager().acquire(language).await? {
            Some(handle) => handle,
            None => {
                return Err(Error::NotFound(format!(
                    "no language server registered for `{}`",
                    language
                )))
            }
        };
        handle.touch();

        // Response shapes differ between servers (SymbolInformation[] vs
        // WorkspaceSymbol[]), so go through the raw path and sniff fields.
        let deadline = Self::deadline(self.timeouts().workspace_symbols_ms);
        let value = handle
            .rpc()
            .request_raw("workspace/symbol", json!({ "query": query }), deadline)
            .await?;

        let items = parse_workspace_symbols(&value);
        if items.is_empty() {
            return Err(Error::NotFound(format!("no symbols match `{}`", query)));
        }
        Ok(WorkspaceSymbols { items, via: None })
    }
}

fn nested_node(symbol: &DocumentSymbol) -> SymbolNode {
    SymbolNode {
        name: symbol.name.clone(),
        kind: kind_name(symbol.kind).to_string(),
        line: symbol.selection_range.start.line + 1,
        children: symbol
            .children
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(nested_node)
            .collect(),
    }
}

fn flat_node(symbol: &SymbolInformation) -> SymbolNode {
    SymbolNode {
        name: symbol.name.clone(),
        kind: kind_name(symbol.kind).to_string(),
        line: symbol.location.range.start.line + 1,
        children: vec![],
    }
}

/// Defensive parse of a `workspace/symbol` result.
fn parse_workspace_symbols(value: &Value) -> Vec<String> {
    let Some(array) = value.as_array() else {
        return vec![];
    };
    array
        .iter()
        .filter_map(|item| {
            let name = item["name"].as_str()?;
            let kind = item["kind"]
                .as_u64()
                .map(|k| kind_name(kind_from_number(k)))
                .unwrap_or("symbol");
            let location = &item["location"];
            let place = match location["uri"].as_str() {
                Some(uri) => {
                    let path = uri
                        .parse::<Url>()
                        .map(|u| uri_to_path(&u).display().to_string())
                        .unwrap_or_else(|_| uri.to_string());
                    let line = location["range"]["start"]["line"]
                        .as_u64()
                        .map(|l| l + 1)
                        .unwrap_or(0);
                    format!(" — {}:{}", path, line)
                }
                None => String::new(),
            };
            Some(format!("{} {}{}", kind, name, place))
        })
        .collect()
}

fn kind_from_number(value: u64) -> SymbolKind {
    serde_json::from_value(json!(value)).unwrap_or(SymbolKind::NULL)
}

fn kind_name(kind: SymbolKind) -> &'static str {
    const NAMES: &[(SymbolKind, &str)] = &[
        (SymbolKind::FILE, "file"),
        (SymbolKind::MODULE, "module"),
        (SymbolKind::NAMESPACE, "namespace"),
        (SymbolKind::PACKAGE, "package"),
        (SymbolKind::CLASS, "class"),
        (SymbolKind::METHOD, "method"),
        (SymbolKind::PROPERTY, "property"),
        (SymbolKind::FIELD, "field"),
        (SymbolKind::CONSTRUCTOR, "constructor"),
        (SymbolKind::ENUM, "enum"),
        (SymbolKind::INTERFACE, "interface"),
        (SymbolKind::FUNCTION, "function"),
        (SymbolKind::VARIABLE, "variable"),
        (SymbolKind::CONSTANT, "constant"),
        (SymbolKind::STRING, "string"),
        (SymbolKind::NUMBER, "number"),
        (SymbolKind::BOOLEAN, "boolean"),
        (SymbolKind::ARRAY, "array"),
        (SymbolKind::OBJECT, "object"),
        (SymbolKind::KEY, "key"),
        (SymbolKind::ENUM_MEMBER, "enum member"),
        (SymbolKind::STRUCT, "struct"),
        (SymbolKind::EVENT, "event"),
        (SymbolKind::OPERATOR, "operator"),
        (SymbolKind::TYPE_PARAMETER, "type parameter"),
    ];
    NAMES
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, name)| *name)
        .unwrap_or("symbol")
}
