//! Recipe parameters: `[[parameters]]` declare a name and default,
//! `[[overrides]]` replace values. Later entries win.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::error::ProcessingError;
use crate::repo::{RepoManager, Sourced};

#[derive(Debug, Clone, Deserialize)]
pub struct ParameterDef {
    pub name: String,
    pub default: toml::Value,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OverrideDef {
    pub name: String,
    pub value: toml::Value,
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedParameters {
    values: BTreeMap<String, JsonValue>,
    declared: Vec<Sourced<ParameterDef>>,
}

impl ResolvedParameters {
    pub fn resolve(repos: &RepoManager) -> Result<Self> {
        let declared = parse_entries::<ParameterDef>(repos, "parameters")?;
        let overrides = parse_entries::<OverrideDef>(repos, "overrides")?;

        let mut values = BTreeMap::new();
        for param in &declared {
            values.insert(param.value.name.clone(), toml_to_json(&param.value.default));
        }
        for entry in overrides {
            if !values.contains_key(&entry.value.name) {
                warn!(
                    parameter = %entry.value.name,
                    repo = %entry.source.url(),
                    "Override for undeclared parameter"
                );
            }
            values.insert(entry.value.name.clone(), toml_to_json(&entry.value.value));
        }
        Ok(Self { values, declared })
    }

    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.values.get(name)
    }

    pub fn values(&self) -> &BTreeMap<String, JsonValue> {
        &self.values
    }

    pub fn declared(&self) -> &[Sourced<ParameterDef>] {
        &self.declared
    }
}

fn parse_entries<T: serde::de::DeserializeOwned>(
    repos: &RepoManager,
    section: &str,
) -> Result<Vec<Sourced<T>>> {
    repos
        .get_list(section)
        .into_iter()
        .map(|entry| -> Result<Sourced<T>> {
            let url = entry.source.url().to_string();
            let value: T = entry.value.clone().try_into().map_err(|err| {
                ProcessingError::config(format!("Invalid '{section}' entry in {url}: {err}"))
            })?;
            Ok(Sourced::new(value, entry.source))
        })
        .collect()
}

/// Converts a config value into the context's value model.
pub fn toml_to_json(value: &toml::Value) -> JsonValue {
    match value {
        toml::Value::String(s) => JsonValue::String(s.clone()),
        toml::Value::Integer(i) => JsonValue::from(*i),
        toml::Value::Float(f) => JsonValue::from(*f),
        toml::Value::Boolean(b) => JsonValue::Bool(*b),
        toml::Value::Datetime(dt) => JsonValue::String(dt.to_string()),
        toml::Value::Array(items) => JsonValue::Array(items.iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => JsonValue::Object(
            table
                .iter()
                .map(|(k, v)| (k.clone(), toml_to_json(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::Repo;

    fn repo(url: &str, doc: &str) -> Repo {
        Repo::from_table(url, toml::from_str(doc).unwrap()).unwrap()
    }

    #[test]
    fn overrides_replace_defaults_in_load_order() {
        let mut repos = RepoManager::new();
        repos.add_loaded(repo(
            "/defaults",
            r#"
            [[parameters]]
            name = "sigma"
            default = 3
            [[parameters]]
            name = "norm"
            default = "addscale"
            "#,
        ));
        repos.add_loaded(repo(
            "/user",
            r#"
            [[overrides]]
            name = "sigma"
            value = 2.5
            [[overrides]]
            name = "sigma"
            value = 4
            "#,
        ));
        let params = ResolvedParameters::resolve(&repos).unwrap();
        assert_eq!(params.get("sigma"), Some(&JsonValue::from(4)));
        assert_eq!(params.get("norm"), Some(&JsonValue::from("addscale")));
        assert_eq!(params.declared().len(), 2);
    }

    #[test]
    fn malformed_parameter_is_a_configuration_error() {
        let mut repos = RepoManager::new();
        repos.add_loaded(repo("/bad", "[[parameters]]\ndefault = 1\n"));
        let err = ResolvedParameters::resolve(&repos).unwrap_err();
        assert!(err.to_string().contains("parameters"));
    }
}
