//! The key/value environment threaded through a run and substituted into
//! tool scripts and output templates as `{key}`. `{{` and `}}` produce
//! literal braces.

use std::path::PathBuf;

use anyhow::{Result, bail};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::params::toml_to_json;

/// Expansion gives up after this many passes; anything still expanding is a
/// reference cycle.
pub const MAX_EXPANSION_PASSES: usize = 10;

pub mod vars {
    pub const INPUT_FILES: &str = "input_files";
    pub const INPUT_DIR: &str = "input_dir";
    pub const OUTPUT_BASE: &str = "output.base_path";
    pub const OUTPUT_FULL: &str = "output.full_path";
    pub const OUTPUT_REPO: &str = "output.repo";
    pub const PROCESS_DIR: &str = "process_dir";
    pub const TEMP_DIR: &str = "temp_dir";
    pub const TARGET: &str = "target";
    pub const INSTRUMENT: &str = "instrument";
    pub const DATE: &str = "date";
    pub const IMAGETYP: &str = "imagetyp";
    pub const FILTER: &str = "filter";
    pub const SESSION_INDEX: &str = "session.index";
    pub const SESSION_ID: &str = "session.id";

    pub fn master(imagetyp: &str) -> String {
        format!("master.{imagetyp}")
    }

    pub fn stage_output(stage: &str) -> String {
        format!("stage.{stage}.output")
    }
}

/// Keys a stage hands back to the orchestrator.
pub type ContextPatch = Map<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessingContext {
    values: Map<String, Value>,
}

impl ProcessingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn merge(&mut self, patch: ContextPatch) {
        self.values.extend(patch);
    }

    pub fn set_paths(&mut self, key: &str, paths: &[PathBuf]) {
        let list = paths
            .iter()
            .map(|p| Value::String(p.display().to_string()))
            .collect();
        self.values.insert(key.to_string(), Value::Array(list));
    }

    pub fn input_files(&self) -> Vec<PathBuf> {
        match self.values.get(vars::INPUT_FILES) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(PathBuf::from)
                .collect(),
            Some(Value::String(single)) => vec![PathBuf::from(single)],
            _ => Vec::new(),
        }
    }

    /// Merges a stage's `context` table. String values expand against the
    /// context as it was before the table, so a key may build on its own
    /// previous value; references to siblings see the sibling's new value.
    /// References that are not known yet are kept for expansion at script
    /// time.
    pub fn apply_table(&mut self, table: &toml::Table) -> Result<()> {
        let mut pending: Vec<(&String, Value)> = table
            .iter()
            .map(|(key, value)| (key, toml_to_json(value)))
            .collect();
        while !pending.is_empty() {
            let unresolved: Vec<String> = pending.iter().map(|(key, _)| key.to_string()).collect();
            let mut waiting = Vec::new();
            for (key, value) in pending {
                let Some(raw) = value.as_str().map(str::to_string) else {
                    self.values.insert(key.clone(), value);
                    continue;
                };
                let blocked = placeholders(&raw)
                    .iter()
                    .any(|name| name != key && unresolved.contains(name));
                if blocked {
                    waiting.push((key, value));
                    continue;
                }
                let expanded = expand_with(&raw, self, false)?;
                self.values.insert(key.clone(), Value::String(expanded));
            }
            if waiting.len() == unresolved.len() {
                let names: Vec<&str> = waiting.iter().map(|(key, _)| key.as_str()).collect();
                bail!("Context variables reference each other: {}", names.join(", "));
            }
            pending = waiting;
        }
        Ok(())
    }

    /// Fully expands `template`; unknown placeholders are an error.
    pub fn expand(&self, template: &str) -> Result<String> {
        expand_with(template, self, true)
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                let text = render(item);
                if text.chars().any(char::is_whitespace) {
                    format!("\"{text}\"")
                } else {
                    text
                }
            })
            .collect::<Vec<_>>()
            .join(" "),
        Value::Object(_) => value.to_string(),
    }
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

/// One substitution pass. Returns the new text and whether anything changed.
fn expand_once(template: &str, ctx: &ProcessingContext) -> (String, bool) {
    let mut out = String::with_capacity(template.len());
    let mut changed = false;
    let mut rest = template;
    while let Some(c) = rest.chars().next() {
        if rest.starts_with("{{") || rest.starts_with("}}") {
            out.push_str(&rest[..2]);
            rest = &rest[2..];
            continue;
        }
        if c == '{'
            && let Some(end) = rest[1..].find('}')
        {
            let key = &rest[1..1 + end];
            if !key.is_empty() && key.chars().all(is_key_char) {
                match ctx.get(key) {
                    Some(value) => {
                        out.push_str(&render(value));
                        changed = true;
                    }
                    None => out.push_str(&rest[..end + 2]),
                }
                rest = &rest[end + 2..];
                continue;
            }
        }
        out.push(c);
        rest = &rest[c.len_utf8()..];
    }
    (out, changed)
}

/// Placeholders still present in `text`.
pub fn placeholders(text: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut rest = text;
    while let Some(c) = rest.chars().next() {
        if rest.starts_with("{{") || rest.starts_with("}}") {
            rest = &rest[2..];
            continue;
        }
        if c == '{'
            && let Some(end) = rest[1..].find('}')
        {
            let key = &rest[1..1 + end];
            if !key.is_empty() && key.chars().all(is_key_char) {
                found.push(key.to_string());
                rest = &rest[end + 2..];
                continue;
            }
        }
        rest = &rest[c.len_utf8()..];
    }
    found
}

fn expand_with(template: &str, ctx: &ProcessingContext, strict: bool) -> Result<String> {
    let mut current = template.to_string();
    for _ in 0..MAX_EXPANSION_PASSES {
        let (next, changed) = expand_once(&current, ctx);
        if !changed {
            if strict {
                let unknown = placeholders(&next);
                if !unknown.is_empty() {
                    bail!(
                        "Unexpanded context variable(s): {}",
                        unknown
                            .iter()
                            .map(|k| format!("{{{k}}}"))
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                }
                return Ok(next.replace("{{", "{").replace("}}", "}"));
            }
            return Ok(next);
        }
        current = next;
    }
    bail!(
        "Context variables still unexpanded after {MAX_EXPANSION_PASSES} passes (reference cycle?): {}",
        placeholders(&current).join(", ")
    )
}
