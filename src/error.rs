//! Typed failure conditions that callers need to tell apart.
//!
//! Everything else travels as a plain `anyhow::Error`; these variants are
//! recovered with `downcast_ref` where the orchestrator decides between
//! skipping, degrading and failing.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessingError {
    /// Malformed document or missing required key. Aborts the whole run.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Import node '{node}' not found in {document}")]
    ImportPath { node: String, document: String },

    #[error(
        "Not enough files for stage '{stage}': need {needed}, found {}",
        candidates.len()
    )]
    NotEnoughFiles {
        stage: String,
        needed: usize,
        candidates: Vec<PathBuf>,
    },

    #[error("Stage '{stage}' will use its single input {}", file.display())]
    UseSingleFile { stage: String, file: PathBuf },

    #[error("Tool '{tool}' failed: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("Tool '{tool}' timed out after {}s", timeout.as_secs())]
    ToolTimeout { tool: String, timeout: Duration },

    #[error("No '{imagetyp}' master available for stage '{stage}'")]
    MissingMaster { stage: String, imagetyp: String },

    #[error("Stage '{stage}' did not produce its output {}", path.display())]
    MissingOutput { stage: String, path: PathBuf },
}

impl ProcessingError {
    pub fn config(message: impl Into<String>) -> Self {
        ProcessingError::Config(message.into())
    }

    pub fn is_config(&self) -> bool {
        matches!(self, ProcessingError::Config(_) | ProcessingError::ImportPath { .. })
    }

    pub fn is_tool(&self) -> bool {
        matches!(
            self,
            ProcessingError::ToolFailed { .. } | ProcessingError::ToolTimeout { .. }
        )
    }
}

/// Finds a [`ProcessingError`] anywhere in an `anyhow` chain.
pub fn find_processing_error(err: &anyhow::Error) -> Option<&ProcessingError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ProcessingError>())
}
