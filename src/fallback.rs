//! Tiered fallback strategies for when the LSP path is missing or failing.
//!
//! Every operation owns an ordered list of alternatives: direct
//! static-analysis shell-outs (jedi for Python), a universal tag indexer
//! (ctags), plain text search, and a linter with JSON output (ruff). When the
//! whole chain comes up empty the caller gets a structured `unavailable`
//! error naming each strategy that was attempted and why it failed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// Deadline for any single fallback shell-out.
const TOOL_DEADLINE: Duration = Duration::from_secs(15);

/// Which operation a fallback is standing in for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpKind {
    Hover,
    Definition,
    References,
    DocumentSymbols,
    WorkspaceSymbols,
    PrepareRename,
    Rename,
    CodeActions,
    CodeActionResolve,
    Diagnostics,
}

/// Inputs handed to a fallback strategy. Populated fields depend on the
/// operation.
#[derive(Clone, Debug, Default)]
pub struct FallbackRequest {
    pub language: Option<String>,
    pub file: Option<PathBuf>,
    /// 0-based line, LSP convention.
    pub line: Option<u32>,
    /// 0-based character.
    pub col: Option<u32>,
    pub query: Option<String>,
    pub new_name: Option<String>,
    /// Lint code to apply for `CodeActionResolve` (e.g. `F401`).
    pub fix_code: Option<String>,
    pub workspace_root: PathBuf,
    pub max_results: usize,
}

/// A successful fallback result, tagged with the strategy that produced it.
#[derive(Clone, Debug)]
pub struct FallbackOutcome {
    pub strategy: &'static str,
    pub text: String,
}

/// One alternative provider for semantic operations.
#[async_trait]
pub trait FallbackStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this strategy can serve the operation for the language.
    fn supports(&self, op: OpKind, language: Option<&str>) -> bool;

    /// Runs the strategy and renders its result as display text.
    async fn run(&self, op: OpKind, request: &FallbackRequest) -> Result<String>;
}

/// Ordered chain of fallback strategies.
pub struct FallbackChain {
    strategies: Vec<Arc<dyn FallbackStrategy>>,
}

impl FallbackChain {
    /// The production chain: jedi, ctags, text search, ruff.
    pub fn standard() -> Self {
        FallbackChain {
            strategies: vec![
                Arc::new(JediStrategy),
                Arc::new(CtagsStrategy),
                Arc::new(TextSearchStrategy),
                Arc::new(RuffStrategy),
            ],
        }
    }

    /// A chain over caller-supplied strategies.
    pub fn with_strategies(strategies: Vec<Arc<dyn FallbackStrategy>>) -> Self {
        FallbackChain { strategies }
    }

    /// Tries each supporting strategy in order, returning the first success.
    ///
    /// `primary` is the error from the LSP path; it heads the attempt list in
    /// the aggregated `unavailable` error when nothing succeeds.
    pub async fn run(
        &self,
        op: OpKind,
        request: &FallbackRequest,
        primary: Error,
    ) -> Result<FallbackOutcome> {
        let mut attempts = vec![("lsp".to_string(), primary.to_string())];

        for strategy in &self.strategies {
            if !strategy.supports(op, request.language.as_deref()) {
                continue;
            }
            debug!(strategy = strategy.name(), ?op, "trying fallback");
            match strategy.run(op, request).await {
                Ok(text) => {
                    return Ok(FallbackOutcome {
                        strategy: strategy.name(),
                        text,
                    })
                }
                Err(e) => attempts.push((strategy.name().to_string(), e.to_string())),
            }
        }

        Err(Error::Unavailable(attempts))
    }
}

/// Runs an external tool and captures stdout.
async fn run_tool(program: &str, args: &[String], cwd: &PathBuf) -> Result<String> {
    let output = tokio::time::timeout(
        TOOL_DEADLINE,
        Command::new(program).args(args).current_dir(cwd).output(),
    )
    .await
    .map_err(|_| Error::timeout(program.to_string(), TOOL_DEADLINE))?
    .map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            Error::SpawnFailed(format!("binary not found: {}", program))
        }
        _ => Error::SpawnFailed(format!("failed to run {}: {}", program, e)),
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() && stdout.is_empty() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::SpawnFailed(format!(
            "{} failed ({}): {}",
            program,
            output.status,
            stderr.lines().next().unwrap_or("no output")
        )));
    }
    Ok(stdout)
}

fn require<'a, T>(value: &'a Option<T>, what: &str) -> Result<&'a T> {
    value
        .as_ref()
        .ok_or_else(|| Error::NotFound(format!("fallback request is missing {}", what)))
}

// ---------------------------------------------------------------------------
// jedi

/// Python static analysis via the `jedi` library, invoked through a small
/// inline script so no helper files need to ship.
struct JediStrategy;

const JEDI_SCRIPT: &str = r#"
import json, sys
import jedi

op, path, line, col = sys.argv[1], sys.argv[2], int(sys.argv[3]), int(sys.argv[4])
source = open(path).read()
script = jedi.Script(source, path=path)

if op == "hover":
    out = [{"name": h.name, "doc": h.docstring()} for h in script.help(line, col)]
elif op == "definition":
    out = [{"path": str(d.module_path), "line": d.line, "col": d.column}
           for d in script.goto(line, col)]
elif op == "references":
    out = [{"path": str(r.module_path), "line": r.line, "col": r.column}
           for r in script.get_references(line, col)]
elif op == "prepare":
    out = [{"name": h.name} for h in script.help(line, col)]
elif op == "rename":
    out = {"diff": script.rename(line, col, new_name=sys.argv[5]).get_diff()}
elif op == "symbols":
    out = [{"name": n.name, "kind": n.type, "line": n.line}
           for n in script.get_names(all_scopes=True)]
else:
    out = []
print(json.dumps(out))
"#;

#[async_trait]
impl FallbackStrategy for JediStrategy {
    fn name(&self) -> &'static str {
        "jedi"
    }

    fn supports(&self, op: OpKind, language: Option<&str>) -> bool {
        language == Some("python")
            && matches!(
                op,
                OpKind::Hover
                    | OpKind::Definition
                    | OpKind::References
                    | OpKind::PrepareRename
                    | OpKind::Rename
                    | OpKind::DocumentSymbols
            )
    }

    async fn run(&self, op: OpKind, request: &FallbackRequest) -> Result<String> {
        let file = require(&request.file, "a file")?;
        // jedi takes 1-based lines and 0-based columns.
        let line = (request.line.unwrap_or(0) + 1).to_string();
        let col = request.col.unwrap_or(0).to_string();
        let op_name = match op {
            OpKind::Hover => "hover",
            OpKind::Definition => "definition",
            OpKind::References => "references",
            OpKind::PrepareRename => "prepare",
            OpKind::Rename => "rename",
            OpKind::DocumentSymbols => "symbols",
            _ => return Err(Error::NotFound("unsupported jedi operation".to_string())),
        };

        let mut args = vec![
            "-c".to_string(),
            JEDI_SCRIPT.to_string(),
            op_name.to_string(),
            file.display().to_string(),
            line,
            col,
        ];
        if op == OpKind::Rename {
            args.push(require(&request.new_name, "a new name")?.clone());
        }

        let stdout = run_tool("python3", &args, &request.workspace_root).await?;
        let value: Value = serde_json::from_str(stdout.trim())
            .map_err(|e| Error::Protocol(format!("jedi produced invalid JSON: {}", e)))?;
        render_jedi(op, &value)
    }
}

fn render_jedi(op: OpKind, value: &Value) -> Result<String> {
    let empty = || Error::NotFound("jedi found nothing at this position".to_string());
    match op {
        OpKind::Hover => {
            let items = value.as_array().ok_or_else(empty)?;
            let docs: Vec<&str> = items
                .iter()
                .filter_map(|i| i["doc"].as_str())
                .filter(|d| !d.is_empty())
                .collect();
            if docs.is_empty() {
                return Err(empty());
            }
            Ok(docs.join("\n\n"))
        }
        OpKind::Definition | OpKind::References => {
            let items = value.as_array().ok_or_else(empty)?;
            if items.is_empty() {
                return Err(empty());
            }
            Ok(items
                .iter()
                .map(|i| {
                    format!(
                        "{}:{}:{}",
                        i["path"].as_str().unwrap_or("?"),
                        i["line"].as_u64().unwrap_or(0),
                        i["col"].as_u64().unwrap_or(0)
                    )
                })
                .collect::<Vec<_>>()
                .join("\n"))
        }
        OpKind::PrepareRename => {
            let items = value.as_array().ok_or_else(empty)?;
            let name = items
                .first()
                .and_then(|i| i["name"].as_str())
                .ok_or_else(empty)?;
            Ok(format!("renameable symbol: {}", name))
        }
        OpKind::Rename => {
            let diff = value["diff"].as_str().ok_or_else(empty)?;
            Ok(diff.to_string())
        }
        OpKind::DocumentSymbols => {
            let items = value.as_array().ok_or_else(empty)?;
            Ok(items
                .iter()
                .map(|i| {
                    format!(
                        "{} {} (line {})",
                        i["kind"].as_str().unwrap_or("symbol"),
                        i["name"].as_str().unwrap_or("?"),
                        i["line"].as_u64().unwrap_or(0)
                    )
                })
                .collect::<Vec<_>>()
                .join("\n"))
        }
        _ => Err(empty()),
    }
}

// ---------------------------------------------------------------------------
// ctags

/// Universal ctags with JSON output, for symbol outlines and workspace-wide
/// symbol search.
struct CtagsStrategy;

#[derive(Debug, Deserialize)]
struct CtagsTag {
    #[serde(rename = "_type")]
    entry_type: String,
    name: String,
    path: String,
    #[serde(default)]
    line: Option<u64>,
    #[serde(default)]
    kind: Option<String>,
}

fn parse_ctags(stdout: &str) -> Vec<CtagsTag> {
    stdout
        .lines()
        .filter_map(|line| serde_json::from_str::<CtagsTag>(line).ok())
        .filter(|tag| tag.entry_type == "tag")
        .collect()
}

fn render_tags(tags: &[CtagsTag]) -> String {
    tags.iter()
        .map(|tag| {
            format!(
                "{} {} — {}:{}",
                tag.kind.as_deref().unwrap_or("symbol"),
                tag.name,
                tag.path,
                tag.line.unwrap_or(0)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl FallbackStrategy for CtagsStrategy {
    fn name(&self) -> &'static str {
        "ctags"
    }

    fn supports(&self, op: OpKind, _language: Option<&str>) -> bool {
        matches!(op, OpKind::DocumentSymbols | OpKind::WorkspaceSymbols)
    }

    async fn run(&self, op: OpKind, request: &FallbackRequest) -> Result<String> {
        let mut args: Vec<String> = vec![
            "--output-format=json".to_string(),
            "--fields=+n".to_string(),
            "-f".to_string(),
            "-".to_string(),
        ];
        match op {
            OpKind::DocumentSymbols => {
                args.push(require(&request.file, "a file")?.display().to_string());
            }
            OpKind::WorkspaceSymbols => {
                args.insert(0, "-R".to_string());
                args.push(".".to_string());
            }
            _ => return Err(Error::NotFound("unsupported ctags operation".to_string())),
        }

        let stdout = run_tool("ctags", &args, &request.workspace_root).await?;
        let mut tags = parse_ctags(&stdout);

        if op == OpKind::WorkspaceSymbols {
            let query = require(&request.query, "a query")?.to_ascii_lowercase();
            tags.retain(|tag| tag.name.to_ascii_lowercase().contains(&query));
            tags.truncate(request.max_results.max(1));
        }
        if tags.is_empty() {
            return Err(Error::NotFound("no symbols found".to_string()));
        }
        Ok(render_tags(&tags))
    }
}

// ---------------------------------------------------------------------------
// text search

/// Recursive text search, the last resort for workspace symbols.
struct TextSearchStrategy;

#[async_trait]
impl FallbackStrategy for TextSearchStrategy {
    fn name(&self) -> &'static str {
        "text-search"
    }

    fn supports(&self, op: OpKind, _language: Option<&str>) -> bool {
        op == OpKind::WorkspaceSymbols
    }

    async fn run(&self, _op: OpKind, request: &FallbackRequest) -> Result<String> {
        let query = require(&request.query, "a query")?;
        let args: Vec<String> = vec![
            "-rn".to_string(),
            "-I".to_string(),
            "--exclude-dir=.git".to_string(),
            query.clone(),
            ".".to_string(),
        ];
        let stdout = run_tool("grep", &args, &request.workspace_root).await?;

        let lines: Vec<&str> = stdout
            .lines()
            .take(request.max_results.max(1))
            .collect();
        if lines.is_empty() {
            return Err(Error::NotFound(format!("no matches for `{}`", query)));
        }
        Ok(lines.join("\n"))
    }
}

// ---------------------------------------------------------------------------
// ruff

/// Python linting via ruff's JSON output, covering diagnostics, quickfix
/// listings, and selective fix application.
struct RuffStrategy;

#[derive(Debug, Deserialize)]
struct RuffItem {
    code: Option<String>,
    message: String,
    location: RuffLocation,
    #[serde(default)]
    fix: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RuffLocation {
    row: u64,
    column: u64,
}

fn parse_ruff(stdout: &str) -> Result<Vec<RuffItem>> {
    serde_json::from_str(stdout.trim())
        .map_err(|e| Error::Protocol(format!("ruff produced invalid JSON: {}", e)))
}

fn render_ruff_diagnostics(items: &[RuffItem]) -> String {
    items
        .iter()
        .map(|item| {
            format!(
                "{}:{} {} {}",
                item.location.row,
                item.location.column,
                item.code.as_deref().unwrap_or("-"),
                item.message
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_ruff_actions(items: &[RuffItem]) -> String {
    items
        .iter()
        .filter(|item| item.fix.is_some())
        .map(|item| {
            format!(
                "ruff:{} fix available — {} (line {})",
                item.code.as_deref().unwrap_or("-"),
                item.message,
                item.location.row
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl FallbackStrategy for RuffStrategy {
    fn name(&self) -> &'static str {
        "ruff"
    }

    fn supports(&self, op: OpKind, language: Option<&str>) -> bool {
        language == Some("python")
            && matches!(
                op,
                OpKind::CodeActions | OpKind::CodeActionResolve | OpKind::Diagnostics
            )
    }

    async fn run(&self, op: OpKind, request: &FallbackRequest) -> Result<String> {
        let file = require(&request.file, "a file")?.display().to_string();

        match op {
            OpKind::Diagnostics | OpKind::CodeActions => {
                let args: Vec<String> = vec![
                    "check".to_string(),
                    "--output-format".to_string(),
                    "json".to_string(),
                    "--exit-zero".to_string(),
                    file,
                ];
                let stdout = run_tool("ruff", &args, &request.workspace_root).await?;
                let items = parse_ruff(&stdout)?;
                if op == OpKind::Diagnostics {
                    Ok(render_ruff_diagnostics(&items))
                } else if items.iter().any(|i| i.fix.is_some()) {
                    Ok(render_ruff_actions(&items))
                } else {
                    Err(Error::NotFound("ruff offers no fixes here".to_string()))
                }
            }
            OpKind::CodeActionResolve => {
                let code = require(&request.fix_code, "a fix code")?;
                let args: Vec<String> = vec![
                    "check".to_string(),
                    "--fix".to_string(),
                    "--select".to_string(),
                    code.clone(),
                    "--exit-zero".to_string(),
                    file.clone(),
                ];
                run_tool("ruff", &args, &request.workspace_root).await?;
                Ok(format!("applied ruff fix {} to {}", code, file))
            }
            _ => Err(Error::NotFound("unsupported ruff operation".to_string())),
        }
    }
}
