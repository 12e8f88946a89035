//! Rule document loading.
//!
//! A rule document lists `overrides` in precedence order plus one `default`
//! rule, in YAML, JSON or INI. The YAML form:
//!
//! ```yaml
//! overrides:
//!   - operation: { method: GET, path: "/ping", ip: "*" }
//!     creditLimit: 100
//!     resetSeconds: 60
//!     actorField: ip
//!     label: ping-by-ip
//! default:
//!   creditLimit: 10
//!   resetSeconds: 60
//! ```
//!
//! In INI files every section is a rule and the section name is its
//! operation, written as whitespace separated `key=value` pairs. The section
//! named `default` is the catch-all:
//!
//! ```ini
//! [method=GET path=/ping ip=*]
//! creditLimit = 100
//! resetSeconds = 60
//! actorField = ip
//!
//! [default]
//! creditLimit = 10
//! resetSeconds = 60
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::rules::{ConfigStore, MatchPolicy, Operation, Quantity, Rule, RuleSpec};
use crate::error::{DivvyError, Result};

/// One rule as it appears in a document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDefinition {
    /// Attribute predicates. Non-string values are stringified.
    #[serde(default)]
    pub operation: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub credit_limit: Option<Quantity>,
    #[serde(default)]
    pub reset_seconds: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_field: Option<String>,
    #[serde(default)]
    pub match_policy: MatchPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl RuleDefinition {
    /// Convert to a [`RuleSpec`], stringifying non-string operation values.
    pub fn into_spec(self) -> RuleSpec {
        let operation: Operation = self
            .operation
            .into_iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, value)
            })
            .collect();

        RuleSpec {
            operation,
            credit_limit: self.credit_limit,
            reset_seconds: self.reset_seconds,
            actor_field: self.actor_field,
            match_policy: self.match_policy,
            label: self.label,
            comment: self.comment,
        }
    }
}

impl From<&Rule> for RuleDefinition {
    fn from(rule: &Rule) -> Self {
        Self {
            operation: rule
                .operation
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect(),
            credit_limit: Some(Quantity::Integer(rule.credit_limit)),
            reset_seconds: Some(Quantity::Integer(rule.reset_seconds)),
            actor_field: rule.actor_field.clone(),
            match_policy: rule.match_policy,
            label: rule.label.clone(),
            comment: rule.comment.clone(),
        }
    }
}

/// A complete rule document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleDocument {
    /// Rules in precedence order
    #[serde(default)]
    pub overrides: Vec<RuleDefinition>,
    /// The catch-all rule
    #[serde(default)]
    pub default: Option<RuleDefinition>,
}

impl RuleDocument {
    /// Load a document from a file, picking the format by extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rule document");

        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&contents),
            Some("yaml") | Some("yml") => Self::from_yaml(&contents),
            Some("ini") => Self::from_ini(&contents),
            _ => Err(DivvyError::Config(format!(
                "Unrecognized format for rule file: {}",
                path.display()
            ))),
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| DivvyError::Config(format!("Failed to parse rule document: {}", e)))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| DivvyError::Config(format!("Failed to parse rule document: {}", e)))
    }

    pub fn from_ini(text: &str) -> Result<Self> {
        let ini = ini::Ini::load_from_str(text)
            .map_err(|e| DivvyError::Config(format!("Failed to parse rule document: {}", e)))?;

        let mut document = RuleDocument::default();
        for (section, properties) in ini.iter() {
            let Some(section) = section else {
                if properties.is_empty() {
                    continue;
                }
                return Err(DivvyError::Config(
                    "Rule document has settings outside of a section".to_string(),
                ));
            };

            let mut definition = RuleDefinition {
                operation: section_operation(section)
                    .into_iter()
                    .map(|(k, v)| (k, serde_json::Value::String(v)))
                    .collect(),
                ..RuleDefinition::default()
            };

            for (key, value) in properties.iter() {
                match key {
                    "creditLimit" => definition.credit_limit = Some(Quantity::Text(value.to_string())),
                    "resetSeconds" => definition.reset_seconds = Some(Quantity::Text(value.to_string())),
                    "actorField" => definition.actor_field = Some(value.to_string()),
                    "matchPolicy" => {
                        definition.match_policy = match value {
                            "stop" => MatchPolicy::Stop,
                            "canary" => MatchPolicy::Canary,
                            other => {
                                return Err(DivvyError::Config(format!(
                                    "Invalid matchPolicy \"{}\" in section [{}]",
                                    other, section
                                )))
                            }
                        }
                    }
                    "label" => definition.label = Some(value.to_string()),
                    "comment" => definition.comment = Some(value.to_string()),
                    other => {
                        warn!(section, key = other, "Ignoring unknown rule field");
                    }
                }
            }

            if section == "default" {
                document.default = Some(definition);
            } else {
                document.overrides.push(definition);
            }
        }

        Ok(document)
    }

    /// Compile the document into a validated store.
    ///
    /// The default rule is installed last. Its `operation`, if any, is ignored.
    pub fn into_store(self) -> Result<ConfigStore> {
        let mut specs: Vec<RuleSpec> = self
            .overrides
            .into_iter()
            .map(RuleDefinition::into_spec)
            .collect();

        if let Some(default) = self.default {
            let mut spec = default.into_spec();
            spec.operation.clear();
            specs.push(spec);
        }

        let store = ConfigStore::from_specs(specs)?;
        info!(rules = store.len(), "Rule configuration loaded");
        Ok(store)
    }

    /// Render a store back into document form.
    pub fn from_store(store: &ConfigStore) -> Self {
        let mut document = RuleDocument::default();
        for rule in store.rules() {
            if rule.is_default() && rule.match_policy == MatchPolicy::Stop {
                document.default = Some(rule.into());
            } else {
                document.overrides.push(rule.into());
            }
        }
        document
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| DivvyError::Config(e.to_string()))
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| DivvyError::Config(e.to_string()))
    }
}

/// Turn an INI section name like `a=b c=d` into an operation.
///
/// `default` is the empty operation. A pair without `=` gets an empty value.
fn section_operation(section: &str) -> Operation {
    if section == "default" {
        return Operation::new();
    }
    section
        .split_whitespace()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}
