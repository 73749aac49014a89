//! `import` directives: `{ file?, repo?, node = "dot.path" }` on any non-root
//! table splices a deep copy of another node in place of the table.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use toml::{Table, Value};
use tracing::trace;

use crate::error::ProcessingError;

use super::{REPO_DOCUMENT, RepoLocation, lookup};

const IMPORT_KEY: &str = "import";

#[derive(Debug, Clone, PartialEq, Eq)]
struct ImportDirective {
    file: Option<String>,
    repo: Option<String>,
    node: String,
}

impl ImportDirective {
    fn parse(value: &Value, document: &str) -> Result<Self> {
        let table = value.as_table().ok_or_else(|| {
            ProcessingError::config(format!("'import' in {document} must be a table"))
        })?;
        for key in table.keys() {
            if !matches!(key.as_str(), "file" | "repo" | "node") {
                return Err(ProcessingError::config(format!(
                    "Unknown key '{key}' in import directive in {document}"
                ))
                .into());
            }
        }
        let text = |key: &str| -> Result<Option<String>> {
            match table.get(key) {
                None => Ok(None),
                Some(Value::String(s)) => Ok(Some(s.clone())),
                Some(_) => Err(ProcessingError::config(format!(
                    "Import '{key}' in {document} must be a string"
                ))
                .into()),
            }
        };
        let node = text("node")?.ok_or_else(|| {
            ProcessingError::config(format!("Import directive in {document} is missing 'node'"))
        })?;
        Ok(Self {
            file: text("file")?,
            repo: text("repo")?,
            node,
        })
    }
}

/// The document a value was read from; nested imports resolve against it.
#[derive(Debug, Clone)]
struct Origin {
    location: RepoLocation,
    file: String,
}

impl Origin {
    fn describe(&self) -> String {
        self.location.describe(&self.file)
    }

    fn sibling(&self, file: &str) -> String {
        match Path::new(&self.file).parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                format!("{}/{file}", parent.display())
            }
            _ => file.to_string(),
        }
    }
}

/// Resolves imports, caching each parsed `(repo, file)` document.
#[derive(Debug, Default)]
pub struct ImportResolver {
    documents: HashMap<(String, String), Table>,
}

impl ImportResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `file` from `location` and resolves its imports. A missing
    /// document is an empty table.
    pub fn load_document(&mut self, location: &RepoLocation, file: &str) -> Result<Table> {
        let table = self.parsed(location, file)?.cloned().unwrap_or_default();
        self.resolve_document(location, file, table)
    }

    /// Resolves every import inside an already parsed document.
    pub fn resolve_document(
        &mut self,
        location: &RepoLocation,
        file: &str,
        mut table: Table,
    ) -> Result<Table> {
        let origin = Origin {
            location: location.clone(),
            file: file.to_string(),
        };
        if table.contains_key(IMPORT_KEY) {
            return Err(ProcessingError::config(format!(
                "Import directives are not allowed at the root of {}",
                origin.describe()
            ))
            .into());
        }
        let mut active = Vec::new();
        for (_, value) in table.iter_mut() {
            self.resolve_value(value, &origin, &mut active)?;
        }
        Ok(table)
    }

    fn parsed(&mut self, location: &RepoLocation, file: &str) -> Result<Option<&Table>> {
        let key = (location.url(), file.to_string());
        if !self.documents.contains_key(&key) {
            let Some(content) = location.read_document(file)? else {
                return Ok(None);
            };
            let table: Table = toml::from_str(&content).map_err(|err| {
                ProcessingError::config(format!(
                    "Failed to parse {}: {err}",
                    location.describe(file)
                ))
            })?;
            trace!(document = %location.describe(file), "Parsed repo document");
            self.documents.insert(key.clone(), table);
        }
        Ok(self.documents.get(&key))
    }

    fn resolve_value(
        &mut self,
        value: &mut Value,
        origin: &Origin,
        active: &mut Vec<String>,
    ) -> Result<()> {
        match value {
            Value::Table(table) => {
                if let Some(directive) = table.get(IMPORT_KEY) {
                    let directive = ImportDirective::parse(directive, &origin.describe())?;
                    let (source, mut copy) = self.fetch(&directive, origin)?;
                    let marker = format!("{}#{}", source.describe(), directive.node);
                    if active.contains(&marker) {
                        return Err(ProcessingError::config(format!(
                            "Import cycle detected: {} -> {marker}",
                            active.join(" -> ")
                        ))
                        .into());
                    }
                    active.push(marker);
                    self.resolve_value(&mut copy, &source, active)?;
                    active.pop();
                    *value = copy;
                } else {
                    for (_, child) in table.iter_mut() {
                        self.resolve_value(child, origin, active)?;
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.resolve_value(item, origin, active)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Returns the source document of `directive` and a deep copy of its node.
    fn fetch(&mut self, directive: &ImportDirective, origin: &Origin) -> Result<(Origin, Value)> {
        let source = match (&directive.repo, &directive.file) {
            (Some(repo), file) => Origin {
                location: origin.location.join(repo),
                file: file.clone().unwrap_or_else(|| REPO_DOCUMENT.to_string()),
            },
            (None, Some(file)) => Origin {
                location: origin.location.clone(),
                file: origin.sibling(file),
            },
            (None, None) => origin.clone(),
        };
        let document = self
            .parsed(&source.location, &source.file)
            .with_context(|| format!("Import requested from {}", origin.describe()))?
            .ok_or_else(|| ProcessingError::NotFound(source.describe()))?;
        let node = lookup(document, &directive.node).ok_or_else(|| {
            ProcessingError::ImportPath {
                node: directive.node.clone(),
                document: source.describe(),
            }
        })?;
        Ok((source, node.clone()))
    }
}
