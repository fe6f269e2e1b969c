//! Workspace file tools, sandboxed to a run's workspace directory.
//!
//! Every tool takes a `path` relative to the workspace root. Sanitization
//! rejects empty, absolute, and escaping paths; symlinks are resolved before
//! the containment check so a link inside the workspace cannot reach outside
//! it.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::llm::ToolSpec;
use crate::tools::{object_schema, Result, Tool, ToolError};

/// Which file operation a workspace tool performs.
#[derive(Debug, Clone, Copy)]
enum Op {
    Write,
    Read,
    List,
    Append,
    Edit,
    Delete,
    Mkdir,
}

/// A single workspace file operation bound to a sandbox base directory.
pub struct WorkspaceFileTool {
    name: &'static str,
    description: &'static str,
    parameters: serde_json::Value,
    op: Op,
    base_dir: PathBuf,
}

/// All workspace file tools for the given sandbox base.
pub fn build_workspace_tools(base_dir: &Path) -> Vec<Arc<dyn Tool>> {
    let specs: Vec<(&'static str, &'static str, serde_json::Value, Op)> = vec![
        (
            "workspace_write",
            "Create or overwrite a file in the workspace. Creates parent directories as needed.",
            object_schema(&[
                ("path", "string", "Relative path within the workspace"),
                ("content", "string", "File content to write"),
            ]),
            Op::Write,
        ),
        (
            "workspace_read",
            "Read the contents of a file in the workspace.",
            object_schema(&[
                ("path", "string", "Relative path within the workspace"),
                ("max_lines", "integer", "Maximum lines to return (default 200)"),
            ]),
            Op::Read,
        ),
        (
            "workspace_list",
            "List entries in a workspace directory.",
            object_schema(&[("path", "string", "Relative directory path (default '.')")]),
            Op::List,
        ),
        (
            "workspace_append",
            "Append content to a file in the workspace. Creates the file if it does not exist.",
            object_schema(&[
                ("path", "string", "Relative path within the workspace"),
                ("content", "string", "Content to append"),
            ]),
            Op::Append,
        ),
        (
            "workspace_edit",
            "Edit an existing file using either a single-match regex replacement or a line-range \
             replacement. Preview by default; apply requires explicit confirmation hash.",
            object_schema(&[
                ("path", "string", "Relative path within the workspace"),
                ("mode", "string", "Edit mode: regex_replace or line_replace"),
                ("search", "string", "Regex pattern for regex_replace mode; must match exactly once"),
                ("replace", "string", "Replacement content"),
                ("start_line", "integer", "1-based start line for line_replace mode"),
                ("end_line", "integer", "1-based end line for line_replace mode (inclusive)"),
                ("apply", "boolean", "Whether to apply edit (defaults to false for preview)"),
                (
                    "expected_original_sha256",
                    "string",
                    "Required when apply=true; must match preview original_sha256",
                ),
            ]),
            Op::Edit,
        ),
        (
            "workspace_delete",
            "Delete a file in the workspace.",
            object_schema(&[("path", "string", "Relative path within the workspace")]),
            Op::Delete,
        ),
        (
            "workspace_mkdir",
            "Create a directory (and parents) in the workspace.",
            object_schema(&[("path", "string", "Relative directory path to create")]),
            Op::Mkdir,
        ),
    ];

    specs
        .into_iter()
        .map(|(name, description, parameters, op)| {
            Arc::new(WorkspaceFileTool {
                name,
                description,
                parameters,
                op,
                base_dir: base_dir.to_path_buf(),
            }) as Arc<dyn Tool>
        })
        .collect()
}

#[async_trait]
impl Tool for WorkspaceFileTool {
    async fn info(&self) -> Result<ToolSpec> {
        Ok(ToolSpec {
            name: self.name.to_string(),
            description: self.description.to_string(),
            parameters: self.parameters.clone(),
        })
    }

    async fn invoke(&self, arguments: &str) -> Result<String> {
        match self.op {
            Op::Write => handle_write(&self.base_dir, arguments),
            Op::Read => handle_read(&self.base_dir, arguments),
            Op::List => handle_list(&self.base_dir, arguments),
            Op::Append => handle_append(&self.base_dir, arguments),
            Op::Edit => handle_edit(&self.base_dir, arguments),
            Op::Delete => handle_delete(&self.base_dir, arguments),
            Op::Mkdir => handle_mkdir(&self.base_dir, arguments),
        }
    }
}

/// Validate and resolve a relative path within the sandbox base.
fn sanitize_path(base_dir: &Path, rel_path: &str) -> Result<PathBuf> {
    if rel_path.is_empty() {
        return Err(ToolError::Invalid("path is required".to_string()));
    }
    let rel = Path::new(rel_path);
    if rel.is_absolute() {
        return Err(ToolError::Invalid(
            "absolute paths are not allowed".to_string(),
        ));
    }

    // Lexical normalization: `..` may not pop above the base.
    let mut parts: Vec<std::ffi::OsString> = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(c) => parts.push(c.to_os_string()),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(ToolError::Invalid(
                        "path escapes workspace directory".to_string(),
                    ));
                }
            }
            _ => {
                return Err(ToolError::Invalid(
                    "absolute paths are not allowed".to_string(),
                ));
            }
        }
    }

    let mut joined = base_dir.to_path_buf();
    for part in &parts {
        joined.push(part);
    }

    // Containment check on resolved paths: canonicalize the deepest existing
    // ancestor so symlinks cannot smuggle the path outside the sandbox.
    let canonical_base = base_dir.canonicalize()?;
    let mut probe = joined.as_path();
    let resolved = loop {
        match probe.canonicalize() {
            Ok(resolved) => break resolved,
            Err(_) => match probe.parent() {
                Some(parent) => probe = parent,
                None => {
                    return Err(ToolError::Invalid(
                        "path escapes workspace directory".to_string(),
                    ))
                }
            },
        }
    };
    if !resolved.starts_with(&canonical_base) {
        return Err(ToolError::Invalid(
            "path escapes workspace directory".to_string(),
        ));
    }

    Ok(joined)
}

fn parse_args<'a, T: Deserialize<'a>>(arguments: &'a str) -> Result<T> {
    Ok(serde_json::from_str(arguments)?)
}

fn handle_write(base_dir: &Path, arguments: &str) -> Result<String> {
    #[derive(Deserialize)]
    struct Args {
        #[serde(default)]
        path: String,
        #[serde(default)]
        content: String,
    }
    let args: Args = parse_args(arguments)?;
    let abs = sanitize_path(base_dir, &args.path)?;
    if let Some(parent) = abs.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&abs, &args.content)?;
    Ok(json!({
        "status": "ok",
        "path": args.path,
        "bytes_written": args.content.len(),
    })
    .to_string())
}

fn handle_read(base_dir: &Path, arguments: &str) -> Result<String> {
    #[derive(Deserialize)]
    struct Args {
        #[serde(default)]
        path: String,
        #[serde(default)]
        max_lines: usize,
    }
    let mut args: Args = parse_args(arguments)?;
    if args.max_lines == 0 {
        args.max_lines = 200;
    }
    let abs = sanitize_path(base_dir, &args.path)?;
    let content = std::fs::read_to_string(&abs)?;

    let mut lines = Vec::new();
    let mut truncated = false;
    for line in content.lines() {
        if lines.len() >= args.max_lines {
            truncated = true;
            break;
        }
        lines.push(line);
    }

    Ok(json!({
        "status": "ok",
        "path": args.path,
        "content": lines.join("\n"),
        "lines": lines.len(),
        "truncated": truncated,
    })
    .to_string())
}

fn handle_list(base_dir: &Path, arguments: &str) -> Result<String> {
    #[derive(Deserialize)]
    struct Args {
        #[serde(default)]
        path: String,
    }
    let mut args: Args = parse_args(arguments)?;
    if args.path.is_empty() {
        args.path = ".".to_string();
    }
    let abs = sanitize_path(base_dir, &args.path)?;

    let mut entries = Vec::new();
    for entry in std::fs::read_dir(&abs)? {
        let entry = entry?;
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        entries.push(json!({
            "name": entry.file_name().to_string_lossy(),
            "size": size,
            "is_dir": entry.file_type().map(|t| t.is_dir()).unwrap_or(false),
        }));
    }

    Ok(json!({
        "status": "ok",
        "path": args.path,
        "entries": entries,
    })
    .to_string())
}

fn handle_append(base_dir: &Path, arguments: &str) -> Result<String> {
    #[derive(Deserialize)]
    struct Args {
        #[serde(default)]
        path: String,
        #[serde(default)]
        content: String,
    }
    let args: Args = parse_args(arguments)?;
    let abs = sanitize_path(base_dir, &args.path)?;
    if let Some(parent) = abs.parent() {
        std::fs::create_dir_all(parent)?;
    }

    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(&abs)?;
    file.write_all(args.content.as_bytes())?;

    Ok(json!({
        "status": "ok",
        "path": args.path,
        "bytes_written": args.content.len(),
    })
    .to_string())
}

fn handle_edit(base_dir: &Path, arguments: &str) -> Result<String> {
    #[derive(Deserialize)]
    struct Args {
        #[serde(default)]
        path: String,
        #[serde(default)]
        mode: String,
        #[serde(default)]
        search: String,
        #[serde(default)]
        replace: String,
        #[serde(default)]
        start_line: usize,
        #[serde(default)]
        end_line: usize,
        #[serde(default)]
        apply: bool,
        #[serde(default)]
        expected_original_sha256: String,
    }
    let mut args: Args = parse_args(arguments)?;
    let abs = sanitize_path(base_dir, &args.path)?;

    let original = std::fs::read_to_string(&abs)?;
    let original_hash = sha256_hex(&original);

    let mode = if args.mode.trim().is_empty() {
        "regex_replace".to_string()
    } else {
        args.mode.trim().to_string()
    };

    let mut match_count = 0usize;
    let edited = match mode.as_str() {
        "regex_replace" => {
            if args.search.is_empty() {
                return Err(ToolError::Invalid(
                    "search is required for regex_replace mode".to_string(),
                ));
            }
            let re = regex::Regex::new(&args.search)
                .map_err(|e| ToolError::Invalid(format!("compile regex: {e}")))?;
            match_count = re.find_iter(&original).count();
            if match_count != 1 {
                return Err(ToolError::Invalid(format!(
                    "regex must match exactly once; got {match_count} matches"
                )));
            }
            re.replace_all(&original, args.replace.as_str()).into_owned()
        }
        "line_replace" => {
            if args.start_line == 0 {
                return Err(ToolError::Invalid(
                    "start_line must be >= 1 for line_replace mode".to_string(),
                ));
            }
            if args.end_line == 0 {
                args.end_line = args.start_line;
            }
            if args.end_line < args.start_line {
                return Err(ToolError::Invalid(
                    "end_line must be >= start_line".to_string(),
                ));
            }
            let ranges = compute_line_ranges(&original);
            if ranges.is_empty() {
                return Err(ToolError::Invalid(
                    "line_replace requires a non-empty file".to_string(),
                ));
            }
            if args.end_line > ranges.len() {
                return Err(ToolError::Invalid(format!(
                    "line range {}-{} exceeds file length {}",
                    args.start_line,
                    args.end_line,
                    ranges.len()
                )));
            }
            let start_byte = ranges[args.start_line - 1].0;
            let end_byte = ranges[args.end_line - 1].1;
            format!(
                "{}{}{}",
                &original[..start_byte],
                args.replace,
                &original[end_byte..]
            )
        }
        other => {
            return Err(ToolError::Invalid(format!(
                "unknown mode {other:?}; expected regex_replace or line_replace"
            )));
        }
    };

    let changed = edited != original;
    let proposed_hash = sha256_hex(&edited);
    let mut resp = json!({
        "status": "ok",
        "path": args.path,
        "mode": mode,
        "changed": changed,
        "no_change": !changed,
        "apply_requested": args.apply,
        "applied": false,
        "bytes_before": original.len(),
        "bytes_after": edited.len(),
        "original_sha256": original_hash,
        "proposed_sha256": proposed_hash,
        "diff_preview": build_diff_preview(&original, &edited),
    });
    if mode == "regex_replace" {
        resp["match_count"] = json!(match_count);
    }

    if !args.apply || !changed {
        return Ok(resp.to_string());
    }
    if args.expected_original_sha256.is_empty() {
        return Err(ToolError::Invalid(
            "expected_original_sha256 is required when apply=true".to_string(),
        ));
    }
    if args.expected_original_sha256 != original_hash {
        return Err(ToolError::Invalid(
            "expected_original_sha256 mismatch".to_string(),
        ));
    }

    atomic_write(&abs, edited.as_bytes())?;
    resp["applied"] = json!(true);
    Ok(resp.to_string())
}

fn handle_delete(base_dir: &Path, arguments: &str) -> Result<String> {
    #[derive(Deserialize)]
    struct Args {
        #[serde(default)]
        path: String,
    }
    let args: Args = parse_args(arguments)?;
    let abs = sanitize_path(base_dir, &args.path)?;
    std::fs::remove_file(&abs)?;
    Ok(json!({
        "status": "ok",
        "path": args.path,
        "deleted": true,
    })
    .to_string())
}

fn handle_mkdir(base_dir: &Path, arguments: &str) -> Result<String> {
    #[derive(Deserialize)]
    struct Args {
        #[serde(default)]
        path: String,
    }
    let args: Args = parse_args(arguments)?;
    let abs = sanitize_path(base_dir, &args.path)?;
    std::fs::create_dir_all(&abs)?;
    Ok(json!({
        "status": "ok",
        "path": args.path,
        "created": true,
    })
    .to_string())
}

/// Byte ranges of each line, end exclusive of the next line but inclusive of
/// the newline itself.
fn compute_line_ranges(content: &str) -> Vec<(usize, usize)> {
    if content.is_empty() {
        return Vec::new();
    }
    let bytes = content.as_bytes();
    let mut ranges = Vec::new();
    let mut line_start = 0;
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'\n' {
            ranges.push((line_start, i + 1));
            line_start = i + 1;
        }
    }
    if line_start < bytes.len() {
        ranges.push((line_start, bytes.len()));
    }
    ranges
}

/// Bounded excerpt of the first differing region.
fn build_diff_preview(before: &str, after: &str) -> serde_json::Value {
    if before == after {
        return json!({
            "line_start": 0,
            "before_line_end": 0,
            "after_line_end": 0,
            "before_excerpt": "",
            "after_excerpt": "",
        });
    }

    let before_lines: Vec<&str> = before.split('\n').collect();
    let after_lines: Vec<&str> = after.split('\n').collect();

    let mut first_diff = 0;
    while first_diff < before_lines.len()
        && first_diff < after_lines.len()
        && before_lines[first_diff] == after_lines[first_diff]
    {
        first_diff += 1;
    }

    let mut before_end = before_lines.len() as i64 - 1;
    let mut after_end = after_lines.len() as i64 - 1;
    while before_end >= first_diff as i64
        && after_end >= first_diff as i64
        && before_lines[before_end as usize] == after_lines[after_end as usize]
    {
        before_end -= 1;
        after_end -= 1;
    }
    let before_end = (before_end.max(first_diff as i64)) as usize;
    let after_end = (after_end.max(first_diff as i64)) as usize;

    let before_excerpt = before_lines[first_diff..=before_end].join("\n");
    let after_excerpt = after_lines[first_diff..=after_end].join("\n");

    json!({
        "line_start": first_diff + 1,
        "before_line_end": before_end + 1,
        "after_line_end": after_end + 1,
        "before_excerpt": clip_preview(&before_excerpt, 800),
        "after_excerpt": clip_preview(&after_excerpt, 800),
    })
}

fn clip_preview(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max.saturating_sub(3);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

fn sha256_hex(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Write via a temp sibling and rename so readers never see a partial file.
/// The target's permission bits are carried onto the temp file before the
/// rename so an edit-apply does not reset them to the umask default.
fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path.parent().ok_or_else(|| {
        ToolError::Invalid("cannot edit the workspace root itself".to_string())
    })?;
    let perms = std::fs::metadata(path)?.permissions();
    let tmp = dir.join(format!(".workspace_edit_{}", Uuid::new_v4()));
    std::fs::write(&tmp, data)?;
    if let Err(e) = std::fs::set_permissions(&tmp, perms) {
        std::fs::remove_file(&tmp).ok();
        return Err(e.into());
    }
    if let Err(e) = std::fs::rename(&tmp, path) {
        std::fs::remove_file(&tmp).ok();
        return Err(e.into());
    }
    Ok(())
}
