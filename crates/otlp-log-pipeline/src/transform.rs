// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Field standardization and body sanitization applied to every kept record.
//!
//! Steps run in a fixed order: rename, delete, redact, truncate. Each step that changes
//! the record appends a human readable action; when nothing changed a single
//! [`NO_TRANSFORMS`] action is returned instead.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;

use crate::record::{AttributeValue, LogRecord};

pub const REDACTION_MARKER: &str = "[PCI-REDACTED]";
pub const TRUNCATION_MARKER: &str = "...[TRUNCATED]";
pub const NO_TRANSFORMS: &str = "No transformations applied";
pub const DEFAULT_MAX_BODY_LENGTH: usize = 32 * 1024;

pub const REDACTION_ACTION_PREFIX: &str = "Redacted PCI pattern";
pub const TRUNCATION_ACTION: &str = "Truncated body to max length";

// ASCII digits and word boundaries only
const CARD_NUMBER_PATTERN: &str =
    r"(?-u:\b)[0-9]{4}[- ]?[0-9]{4}[- ]?[0-9]{4}[- ]?[0-9]{4}(?-u:\b)";
const SSN_PATTERN: &str = r"(?-u:\b)[0-9]{3}-[0-9]{2}-[0-9]{4}(?-u:\b)";

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("Invalid redaction pattern #{index} '{pattern}': {source}")]
    InvalidPattern {
        index: usize,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("Failed to read transform configuration {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse transform configuration {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Uncompiled transform settings, as read from a JSON file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransformRules {
    pub field_renames: BTreeMap<String, String>,
    pub fields_to_delete: Vec<String>,
    pub redaction_patterns: Vec<String>,
    /// 0 disables truncation.
    pub max_body_length: usize,
}

impl Default for TransformRules {
    fn default() -> Self {
        let field_renames = [
            ("application_name", "cf_app_name"),
            ("organization_name", "cf_org_name"),
            ("space_name", "cf_space_name"),
            ("instance_id", "cf_instance_id"),
            ("app_id", "cf_app_guid"),
            ("organization_id", "cf_org_guid"),
            ("space_id", "cf_space_guid"),
            ("source_type", "cf_source_type"),
            ("log_type", "cf_log_type"),
        ]
        .into_iter()
        .map(|(old, new)| (old.to_string(), new.to_string()))
        .collect();

        Self {
            field_renames,
            fields_to_delete: vec![
                "diego_cell_ip".to_string(),
                "process_id".to_string(),
                "source_id".to_string(),
            ],
            redaction_patterns: vec![CARD_NUMBER_PATTERN.to_string(), SSN_PATTERN.to_string()],
            max_body_length: DEFAULT_MAX_BODY_LENGTH,
        }
    }
}

/// Compiled transform settings, shared read-only by all workers.
#[derive(Debug, Clone)]
pub struct TransformConfig {
    renames: Vec<(String, String)>,
    deletes: Vec<String>,
    redactions: Vec<Regex>,
    max_body_length: usize,
}

impl TransformConfig {
    pub fn new(rules: TransformRules) -> Result<Self, TransformError> {
        let redactions = rules
            .redaction_patterns
            .iter()
            .enumerate()
            .map(|(i, pattern)| {
                Regex::new(pattern).map_err(|source| TransformError::InvalidPattern {
                    index: i + 1,
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            renames: rules.field_renames.into_iter().collect(),
            deletes: rules.fields_to_delete,
            redactions,
            max_body_length: rules.max_body_length,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, TransformError> {
        let contents = std::fs::read_to_string(path).map_err(|source| TransformError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let rules: TransformRules =
            serde_json::from_str(&contents).map_err(|source| TransformError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::new(rules)
    }

    pub fn max_body_length(&self) -> usize {
        self.max_body_length
    }
}

/// Applies the transform steps to `record` in place and returns the actions taken.
pub fn apply(record: &mut LogRecord, config: &TransformConfig) -> Vec<String> {
    let mut actions = Vec::new();

    for (old_key, new_key) in &config.renames {
        if rename_attribute(record, old_key, new_key) {
            actions.push(format!("Renamed: {old_key} -> {new_key}"));
        }
    }

    for key in &config.deletes {
        if delete_attribute(record, key) {
            actions.push(format!("Deleted: {key}"));
        }
    }

    for (i, pattern) in config.redactions.iter().enumerate() {
        if redact_body(record, pattern) {
            actions.push(format!("{REDACTION_ACTION_PREFIX} #{}", i + 1));
        }
    }

    if config.max_body_length > 0 && truncate_body(record, config.max_body_length) {
        actions.push(TRUNCATION_ACTION.to_string());
    }

    if actions.is_empty() {
        actions.push(NO_TRANSFORMS.to_string());
    }
    actions
}

/// Renames every attribute keyed `old_key`. Values are untouched.
fn rename_attribute(record: &mut LogRecord, old_key: &str, new_key: &str) -> bool {
    let mut renamed = false;
    for kv in record.attributes.iter_mut().filter(|kv| kv.key == old_key) {
        kv.key = new_key.to_string();
        renamed = true;
    }
    renamed
}

/// Removes the first attribute keyed `key`. Does not preserve attribute order.
fn delete_attribute(record: &mut LogRecord, key: &str) -> bool {
    match record.attributes.iter().position(|kv| kv.key == key) {
        Some(i) => {
            record.attributes.swap_remove(i);
            true
        }
        None => false,
    }
}

fn redact_body(record: &mut LogRecord, pattern: &Regex) -> bool {
    let Some(AttributeValue::String(body)) = record.body.as_mut() else {
        return false;
    };
    if body.is_empty() || !pattern.is_match(body) {
        return false;
    }
    *body = pattern.replace_all(body, REDACTION_MARKER).into_owned();
    true
}

/// Cuts the body to at most `max_len` bytes, backing off to a char boundary.
fn truncate_body(record: &mut LogRecord, max_len: usize) -> bool {
    let Some(AttributeValue::String(body)) = record.body.as_mut() else {
        return false;
    };
    if body.len() <= max_len {
        return false;
    }
    let mut cut = max_len;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    body.truncate(cut);
    body.push_str(TRUNCATION_MARKER);
    true
}
