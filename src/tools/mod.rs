//! External tool invocations. Every stage names a [`Tool`] that receives the
//! stage's script and the fully populated context.

mod builtin;
mod external;
mod process;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::context::ProcessingContext;

pub use builtin::BuiltinTool;
pub use external::{GraxpertTool, ShellTool, SirilTool};
pub use process::run_command;

/// Default per-invocation limit when neither the task nor
/// `processing.tool-timeout` sets one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug)]
pub struct ToolInvocation<'a> {
    pub stage: &'a str,
    /// Unexpanded script text. Tools expand it once they have finished
    /// adjusting their own copy of the context.
    pub script: &'a str,
    pub context: &'a ProcessingContext,
    pub working_dir: &'a Path,
    pub timeout: Duration,
}

pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn run(&self, invocation: &ToolInvocation<'_>) -> Result<()>;
}

#[derive(Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Registry holding `shell`, `siril`, `graxpert` and `builtin`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        register_defaults(&mut registry);
        registry
    }

    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Tool>> {
        self.tools.get(name).cloned().ok_or_else(|| {
            anyhow!(
                "Unknown tool '{}'. Available tools: {}",
                name,
                self.known_tools().join(", ")
            )
        })
    }

    pub fn known_tools(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

pub fn register_defaults(registry: &mut ToolRegistry) {
    registry.register(ShellTool);
    registry.register(SirilTool::default());
    registry.register(GraxpertTool::default());
    registry.register(BuiltinTool);
}

/// Splits a command line on whitespace; double quotes group words.
pub fn split_words(line: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quoted = false;
    for c in line.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                in_word = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if quoted {
        return Err(anyhow!("Unterminated quote in: {line}"));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}
