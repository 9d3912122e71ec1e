//! Loading task definitions produced by the planning collaborator.
//!
//! Two formats are accepted:
//!
//! - Markdown task files: a `---` frontmatter block (`id`, `title`,
//!   `depends_on`, `estimated_complexity`, optional `isolation`) followed
//!   by `## Contract`, `## Dependencies (Interfaces Only)`,
//!   `## Test Specification`, `## Output Files` (`WRITE: path` lines) and
//!   `## Verification (Deterministic)` (one command per line) sections.
//! - A TOML task list: `[[task]]` tables with the `TaskDefinition` fields.
//!
//! Loading never checks the graph; that is the builder's job.

use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::core::task::{Complexity, IsolationMode, TaskDefinition, TaskId, VerificationCheck};
use crate::{clog_debug, Error, Result};

static FRONTMATTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\A\s*---[ \t]*\r?\n(.*?)\r?\n---[ \t]*(?:\r?\n|\z)").expect("frontmatter regex is valid")
});

static FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\s*:\s*(.*)$").expect("field regex is valid")
});

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^##[ \t]+(.+?)[ \t]*$").expect("heading regex is valid"));

static TITLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^#[ \t]+(?:[A-Za-z]+-\d+[ \t]*:[ \t]*)?(.+?)[ \t]*$").expect("title regex is valid")
});

static WRITE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:-\s*)?WRITE:\s*(\S+)").expect("write regex is valid")
});

const CONTRACT: &str = "contract";
const DEPENDENCIES: &str = "dependencies (interfaces only)";
const TEST_SPEC: &str = "test specification";
const OUTPUT_FILES: &str = "output files";
const VERIFICATION: &str = "verification (deterministic)";

/// Load a plan from a directory of markdown task files, a single markdown
/// task file, or a TOML task list.
pub fn load_plan(path: &Path) -> Result<Vec<TaskDefinition>> {
    clog_debug!("load_plan path={}", path.display());
    if path.is_dir() {
        return load_task_dir(path);
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => parse_task_list(&fs::read_to_string(path)?, &path.display().to_string()),
        _ => Ok(vec![load_task_file(path)?]),
    }
}

/// Every `*.md` file in `dir`, in file-name order.
pub fn load_task_dir(dir: &Path) -> Result<Vec<TaskDefinition>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().and_then(|e| e.to_str()) == Some("md"))
        .collect();
    files.sort();
    clog_debug!("Loading {} task files from {}", files.len(), dir.display());
    files.iter().map(|f| load_task_file(f)).collect()
}

pub fn load_task_file(path: &Path) -> Result<TaskDefinition> {
    let text = fs::read_to_string(path)?;
    parse_task_file(&text, &path.display().to_string())
}

/// Parse one markdown task file. `source` names the file in errors.
pub fn parse_task_file(text: &str, source: &str) -> Result<TaskDefinition> {
    let err = |message: String| Error::TaskFile {
        file: source.to_string(),
        message,
    };

    let captures = FRONTMATTER_RE
        .captures(text)
        .ok_or_else(|| err("missing frontmatter".to_string()))?;
    let fields = parse_frontmatter(&captures[1]);
    let body = &text[captures.get(0).map(|m| m.end()).unwrap_or(0)..];

    let id = fields
        .get("id")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| err("frontmatter has no id".to_string()))?;
    let title = match fields.get("title").filter(|v| !v.is_empty()) {
        Some(title) => title.clone(),
        None => {
            let fences = fenced_ranges(body);
            TITLE_RE
                .captures_iter(body)
                .find(|c| c.get(0).is_some_and(|m| !in_fence(&fences, m.start())))
                .map(|c| c[1].to_string())
                .unwrap_or_else(|| id.clone())
        }
    };

    let mut definition = TaskDefinition::new(TaskId::new(id.as_str()), &title);
    if let Some(deps) = fields.get("depends_on") {
        definition.depends_on = parse_list(deps).into_iter().map(TaskId::from).collect();
    }
    if let Some(tier) = fields.get("estimated_complexity").or_else(|| fields.get("complexity")) {
        definition.complexity = tier
            .parse::<Complexity>()
            .map_err(|e| err(e.to_string()))?;
    }
    if let Some(mode) = fields.get("isolation").filter(|v| !v.is_empty()) {
        definition.isolation = Some(mode.parse::<IsolationMode>().map_err(|e| err(e.to_string()))?);
    }

    let sections = split_sections(body);
    if let Some(contract) = sections.get(CONTRACT) {
        definition.contract = unfence(contract);
    }
    if let Some(deps) = sections.get(DEPENDENCIES) {
        definition.dependency_interfaces = unfence(deps);
    }
    if let Some(spec) = sections.get(TEST_SPEC) {
        definition.test_spec = unfence(spec);
    }
    if let Some(outputs) = sections.get(OUTPUT_FILES) {
        definition.output_files = WRITE_RE
            .captures_iter(outputs)
            .map(|c| PathBuf::from(&c[1]))
            .collect();
    }
    if let Some(checks) = sections.get(VERIFICATION) {
        definition.verification = unfence(checks)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(VerificationCheck::new)
            .collect();
    }

    clog_debug!(
        "Parsed task {} from {} ({} deps, {} checks)",
        definition.id,
        source,
        definition.depends_on.len(),
        definition.verification.len()
    );
    Ok(definition)
}

#[derive(Deserialize)]
struct TaskList {
    #[serde(default, rename = "task")]
    tasks: Vec<TaskDefinition>,
}

/// Parse a TOML task list (`[[task]]` tables).
pub fn parse_task_list(text: &str, source: &str) -> Result<Vec<TaskDefinition>> {
    let list: TaskList = toml::from_str(text).map_err(|e| Error::TaskFile {
        file: source.to_string(),
        message: e.to_string(),
    })?;
    Ok(list.tasks)
}

/// Flat `key: value` frontmatter. Quotes around values are dropped.
fn parse_frontmatter(block: &str) -> HashMap<String, String> {
    block
        .lines()
        .filter_map(|line| FIELD_RE.captures(line.trim_end()))
        .map(|c| (c[1].to_lowercase(), strip_quotes(c[2].trim()).to_string()))
        .collect()
}

/// `[T-001, "T-002"]`, `T-001, T-002` or `[]`.
fn parse_list(value: &str) -> Vec<String> {
    let inner = value.trim().trim_start_matches('[').trim_end_matches(']');
    inner
        .split(',')
        .map(|item| strip_quotes(item.trim()).to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

fn strip_quotes(value: &str) -> &str {
    let trimmed = value.trim();
    for quote in ['"', '\''] {
        if trimmed.len() >= 2 && trimmed.starts_with(quote) && trimmed.ends_with(quote) {
            return &trimmed[1..trimmed.len() - 1];
        }
    }
    trimmed
}

/// Byte ranges of ```` ``` ```` blocks. An unclosed fence runs to the end.
fn fenced_ranges(text: &str) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut open: Option<usize> = None;
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if line.trim_start().starts_with("```") {
            match open.take() {
                Some(start) => ranges.push(start..offset + line.len()),
                None => open = Some(offset),
            }
        }
        offset += line.len();
    }
    if let Some(start) = open {
        ranges.push(start..text.len());
    }
    ranges
}

fn in_fence(fences: &[Range<usize>], pos: usize) -> bool {
    fences.iter().any(|r| r.contains(&pos))
}

/// Body text of every `## ` section, keyed by lowercased heading.
/// Headings inside code fences belong to the section around them.
fn split_sections(body: &str) -> HashMap<String, String> {
    let fences = fenced_ranges(body);
    let headings: Vec<_> = HEADING_RE
        .captures_iter(body)
        .filter(|c| c.get(0).is_some_and(|m| !in_fence(&fences, m.start())))
        .collect();
    let mut sections = HashMap::new();
    for (i, caps) in headings.iter().enumerate() {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let end = headings
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(body.len());
        sections.insert(name.as_str().to_lowercase(), body[whole.end()..end].to_string());
    }
    sections
}

/// Contents of the section's code fences, or the trimmed text when there
/// are none.
fn unfence(section: &str) -> String {
    let mut fenced = Vec::new();
    let mut inside = false;
    let mut saw_fence = false;
    for line in section.lines() {
        if line.trim_start().starts_with("```") {
            inside = !inside;
            saw_fence = true;
            continue;
        }
        if inside {
            fenced.push(line);
        }
    }
    if saw_fence {
        fenced.join("\n").trim().to_string()
    } else {
        section.trim().to_string()
    }
}
