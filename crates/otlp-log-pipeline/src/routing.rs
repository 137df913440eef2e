// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Priority-ordered index routing.
//!
//! Rules are compiled and sorted once; [`Router::route`] walks them in ascending
//! priority and returns the first rule whose conditions all hold.

use std::io;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;

use crate::record::{LogRecord, Severity};

pub const DEFAULT_INDEX: &str = "tas_logs";
pub const DEFAULT_RULE_NAME: &str = "default";

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("Invalid pattern '{pattern}' for attribute '{attribute}' in routing rule '{rule}': {source}")]
    InvalidPattern {
        rule: String,
        attribute: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("Failed to read routing rules {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse routing rules {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Severity tier used by threshold conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeverityThreshold {
    Debug,
    Info,
    Warn,
    Error,
}

impl SeverityThreshold {
    pub fn severity(self) -> Severity {
        match self {
            SeverityThreshold::Debug => Severity::DEBUG,
            SeverityThreshold::Info => Severity::INFO,
            SeverityThreshold::Warn => Severity::WARN,
            SeverityThreshold::Error => Severity::ERROR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionSpec {
    Severity { min: SeverityThreshold },
    Attribute { name: String, pattern: String },
}

/// Uncompiled routing rule, as declared in code or a JSON rules file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RoutingRuleSpec {
    pub name: String,
    pub priority: i32,
    pub index: String,
    pub conditions: Vec<ConditionSpec>,
}

impl RoutingRuleSpec {
    fn new(name: &str, priority: i32, index: &str, conditions: Vec<ConditionSpec>) -> Self {
        Self {
            name: name.to_string(),
            priority,
            index: index.to_string(),
            conditions,
        }
    }
}

fn attribute_condition(name: &str, pattern: &str) -> ConditionSpec {
    ConditionSpec::Attribute {
        name: name.to_string(),
        pattern: pattern.to_string(),
    }
}

/// The rule set shipped with the receiver.
pub fn default_rules() -> Vec<RoutingRuleSpec> {
    vec![
        RoutingRuleSpec::new(
            "error-severity",
            1,
            "tas_errors",
            vec![ConditionSpec::Severity {
                min: SeverityThreshold::Error,
            }],
        ),
        RoutingRuleSpec::new(
            "security-app",
            2,
            "tas_security",
            vec![attribute_condition("cf_app_name", "^security-")],
        ),
        RoutingRuleSpec::new(
            "audit-app",
            3,
            "tas_audit",
            vec![attribute_condition("cf_app_name", "^audit-")],
        ),
        RoutingRuleSpec::new(
            "production-space",
            4,
            "tas_prod",
            vec![attribute_condition("cf_space_name", "^production$")],
        ),
    ]
}

#[derive(Debug, Clone)]
pub enum Condition {
    /// Severity at or above the threshold.
    MinSeverity(Severity),
    /// Named attribute holds a non-empty string matching the pattern.
    Attribute { name: String, pattern: Regex },
}

impl Condition {
    fn matches(&self, record: &LogRecord) -> bool {
        match self {
            Condition::MinSeverity(min) => record.severity >= *min,
            Condition::Attribute { name, pattern } => match record.string_attribute(name) {
                Some(value) if !value.is_empty() => pattern.is_match(value),
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub name: String,
    pub priority: i32,
    pub index: String,
    pub conditions: Vec<Condition>,
}

impl RoutingRule {
    fn compile(spec: RoutingRuleSpec) -> Result<Self, RoutingError> {
        let conditions = spec
            .conditions
            .into_iter()
            .map(|condition| match condition {
                ConditionSpec::Severity { min } => Ok(Condition::MinSeverity(min.severity())),
                ConditionSpec::Attribute { name, pattern } => match Regex::new(&pattern) {
                    Ok(regex) => Ok(Condition::Attribute {
                        name,
                        pattern: regex,
                    }),
                    Err(source) => Err(RoutingError::InvalidPattern {
                        rule: spec.name.clone(),
                        attribute: name,
                        pattern,
                        source,
                    }),
                },
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name: spec.name,
            priority: spec.priority,
            index: spec.index,
            conditions,
        })
    }

    fn matches(&self, record: &LogRecord) -> bool {
        self.conditions.iter().all(|c| c.matches(record))
    }
}

/// Outcome of routing one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route<'a> {
    pub index: &'a str,
    pub rule: &'a str,
}

/// Immutable after construction, safe to share across workers without locking.
#[derive(Debug, Clone)]
pub struct Router {
    rules: Vec<RoutingRule>,
    default_index: String,
}

impl Router {
    pub fn new(specs: Vec<RoutingRuleSpec>) -> Result<Self, RoutingError> {
        let mut rules = specs
            .into_iter()
            .map(RoutingRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        // stable: equal priorities keep declaration order
        rules.sort_by_key(|rule| rule.priority);

        Ok(Self {
            rules,
            default_index: DEFAULT_INDEX.to_string(),
        })
    }

    pub fn with_defaults() -> Result<Self, RoutingError> {
        Self::new(default_rules())
    }

    /// Loads a JSON array of rules.
    pub fn from_file(path: &Path) -> Result<Self, RoutingError> {
        let contents = std::fs::read_to_string(path).map_err(|source| RoutingError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let specs: Vec<RoutingRuleSpec> =
            serde_json::from_str(&contents).map_err(|source| RoutingError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::new(specs)
    }

    pub fn route(&self, record: &LogRecord) -> Route<'_> {
        self.rules
            .iter()
            .find(|rule| rule.matches(record))
            .map(|rule| Route {
                index: &rule.index,
                rule: &rule.name,
            })
            .unwrap_or(Route {
                index: &self.default_index,
                rule: DEFAULT_RULE_NAME,
            })
    }

    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }
}
