use anyhow::{Context, Result, bail};
use ignore::WalkBuilder;
use regex::Regex;
use serde_json::{Value, json};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::llm::types::ToolDef;
use crate::tools::{ToolHandler, ToolResult, arg_str, arg_usize};

const DEFAULT_READ_LIMIT: usize = 2_000;
const MAX_SEARCH_MATCHES: usize = 500;

/// Resolves `path` against `root` and rejects anything that escapes it.
/// Works lexically so paths that do not exist yet (for writes) resolve too.
pub(crate) fn resolve_in_root(root: &Path, path: &str) -> Result<PathBuf> {
    let candidate = Path::new(path);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };
    let normalized = normalize(&joined);
    if !normalized.starts_with(normalize(root)) {
        bail!(
            "Access to files outside the project root is not allowed: {}",
            path
        );
    }
    Ok(normalized)
}

fn normalize(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in p.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn relative(root: &Path, p: &Path) -> String {
    p.strip_prefix(root)
        .unwrap_or(p)
        .to_string_lossy()
        .to_string()
}

#[derive(Debug, Clone)]
pub struct FsRead {
    root: PathBuf,
}

impl FsRead {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait::async_trait]
impl ToolHandler for FsRead {
    fn definition(&self) -> ToolDef {
        ToolDef::function(
            "fs_read",
            "Reads a text file inside the project. Optionally pass a 1-based start_line and a maximum number of lines (limit).",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "start_line": {"type": "integer"},
                    "limit": {"type": "integer"}
                },
                "required": ["path"]
            }),
        )
    }

    async fn call(&self, args: Value) -> Result<ToolResult> {
        let path = arg_str(&args, "path")?;
        let full = resolve_in_root(&self.root, path)?;
        let text = tokio::fs::read_to_string(&full)
            .await
            .with_context(|| format!("read {}", full.display()))?;

        let start = arg_usize(&args, "start_line").unwrap_or(1).max(1);
        let limit = arg_usize(&args, "limit").unwrap_or(DEFAULT_READ_LIMIT);
        let total = text.lines().count();
        let selected: Vec<&str> = text.lines().skip(start - 1).take(limit).collect();
        let end = start - 1 + selected.len();
        let mut content = selected.join("\n");
        if text.ends_with('\n') && end == total && !content.is_empty() {
            content.push('\n');
        }

        debug!(path = %full.display(), start, end, total, "fs_read");
        Ok(ToolResult::ok(content)
            .with_display(format!("Read lines {start}-{end} of {total} from {path}")))
    }
}

#[derive(Debug, Clone)]
pub struct FsWrite {
    root: PathBuf,
}

impl FsWrite {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait::async_trait]
impl ToolHandler for FsWrite {
    fn definition(&self) -> ToolDef {
        ToolDef::function(
            "fs_write",
            "Writes content to a file inside the project, creating parent directories and replacing any existing file.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"]
            }),
        )
    }

    async fn call(&self, args: Value) -> Result<ToolResult> {
        let path = arg_str(&args, "path")?;
        let content = arg_str(&args, "content")?;
        let full = resolve_in_root(&self.root, path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        tokio::fs::write(&full, content)
            .await
            .with_context(|| format!("write {}", full.display()))?;
        Ok(ToolResult::ok(format!(
            "Wrote {} bytes to {}",
            content.len(),
            path
        )))
    }
}

#[derive(Debug, Clone)]
pub struct FsList {
    root: PathBuf,
}

impl FsList {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn list(
        &self,
        path: &str,
        max_depth: Option<usize>,
        pattern: Option<&str>,
    ) -> Result<Vec<String>> {
        let dir = resolve_in_root(&self.root, path)?;
        if !dir.is_dir() {
            bail!("not a directory: {path}");
        }
        let pattern = pattern
            .map(glob::Pattern::new)
            .transpose()
            .context("invalid glob pattern")?;

        let mut out = Vec::new();
        for entry in WalkBuilder::new(&dir)
            .max_depth(Some(max_depth.unwrap_or(1)))
            .build()
            .filter_map(Result::ok)
        {
            if entry.depth() == 0 {
                continue;
            }
            if let Some(p) = &pattern
                && !p.matches(&entry.file_name().to_string_lossy())
            {
                continue;
            }
            out.push(relative(&self.root, entry.path()));
        }
        out.sort();
        Ok(out)
    }
}

#[async_trait::async_trait]
impl ToolHandler for FsList {
    fn definition(&self) -> ToolDef {
        ToolDef::function(
            "fs_list",
            "Lists files and directories under a project path. max_depth defaults to 1; pattern is an optional glob on file names.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "max_depth": {"type": "integer"},
                    "pattern": {"type": "string"}
                }
            }),
        )
    }

    async fn call(&self, args: Value) -> Result<ToolResult> {
        let path = args.get("path").and_then(Value::as_str).unwrap_or(".");
        let pattern = args.get("pattern").and_then(Value::as_str);
        let entries = self.list(path, arg_usize(&args, "max_depth"), pattern)?;
        let count = entries.len();
        Ok(ToolResult::ok(entries.join("\n")).with_display(format!("{count} entries in {path}")))
    }
}

#[derive(Debug, Clone)]
pub struct SearchText {
    root: PathBuf,
}

impl SearchText {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Returns `(relative path, 1-based line number, line)` for each match.
    pub fn search(
        &self,
        search_pattern: &str,
        file_glob: Option<&str>,
    ) -> Result<Vec<(String, usize, String)>> {
        let re = Regex::new(search_pattern).context("invalid search pattern")?;
        let glob = file_glob
            .map(glob::Pattern::new)
            .transpose()
            .context("invalid file glob")?;
        let opts = glob::MatchOptions {
            require_literal_separator: false,
            ..Default::default()
        };

        let mut results = Vec::new();
        'files: for entry in WalkBuilder::new(&self.root).build().filter_map(Result::ok) {
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let rel = relative(&self.root, entry.path());
            if let Some(g) = &glob
                && !g.matches_with(&rel, opts)
            {
                continue;
            }
            // Binary and unreadable files are skipped.
            let Ok(text) = fs::read_to_string(entry.path()) else {
                continue;
            };
            for (idx, line) in text.lines().enumerate() {
                if re.is_match(line) {
                    results.push((rel.clone(), idx + 1, line.to_string()));
                    if results.len() >= MAX_SEARCH_MATCHES {
                        break 'files;
                    }
                }
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        Ok(results)
    }
}

#[async_trait::async_trait]
impl ToolHandler for SearchText {
    fn definition(&self) -> ToolDef {
        ToolDef::function(
            "search_text",
            "Searches file contents for a regular expression. file_glob (e.g. 'src/**/*.rs') limits which files are searched. Returns path:line:text for each match.",
            json!({
                "type": "object",
                "properties": {
                    "search_pattern": {"type": "string"},
                    "file_glob": {"type": "string"}
                },
                "required": ["search_pattern"]
            }),
        )
    }

    async fn call(&self, args: Value) -> Result<ToolResult> {
        let pattern = arg_str(&args, "search_pattern")?.to_string();
        let file_glob = args
            .get("file_glob")
            .and_then(Value::as_str)
            .map(str::to_string);
        let this = self.clone();
        let matches = tokio::task::spawn_blocking(move || {
            this.search(&pattern, file_glob.as_deref())
        })
        .await
        .context("search task failed")??;

        let count = matches.len();
        let body = matches
            .into_iter()
            .map(|(path, line, text)| format!("{path}:{line}:{text}"))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(ToolResult::ok(body).with_display(format!("{count} matches")))
    }
}
