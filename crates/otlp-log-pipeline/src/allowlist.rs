// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use crate::record::LogRecord;

/// Attribute keys carrying the application identity, standardized name first.
pub const APP_NAME_KEYS: [&str; 2] = ["cf_app_name", "application_name"];

const COMMENT_PREFIX: char = '#';

#[derive(Debug, thiserror::Error)]
pub enum AllowlistError {
    #[error("Failed to read allowlist {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Set of permitted application names. Empty means every application is allowed.
///
/// The set is replaced wholesale on reload: readers clone the current `Arc` under a
/// shared lock, and a reload only holds the exclusive lock for the pointer swap.
#[derive(Debug, Default)]
pub struct Allowlist {
    apps: RwLock<Arc<HashSet<String>>>,
}

impl Allowlist {
    pub fn new<I, S>(apps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let apps = apps
            .into_iter()
            .map(|app| app.as_ref().trim().to_lowercase())
            .filter(|app| !app.is_empty())
            .collect();
        Self {
            apps: RwLock::new(Arc::new(apps)),
        }
    }

    /// Parses the line-oriented allowlist format: one name per line, `#` comments and
    /// blank lines ignored, case folded, duplicates collapsed.
    pub fn parse(contents: &str) -> HashSet<String> {
        contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with(COMMENT_PREFIX))
            .map(str::to_lowercase)
            .collect()
    }

    /// Startup load. Failure here is fatal to the caller.
    pub fn load_from_file(path: &Path) -> Result<Self, AllowlistError> {
        let contents = std::fs::read_to_string(path).map_err(|source| AllowlistError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            apps: RwLock::new(Arc::new(Self::parse(&contents))),
        })
    }

    /// Atomically swaps in a new set.
    pub fn replace(&self, apps: HashSet<String>) {
        let apps = Arc::new(apps);
        let mut guard = self.apps.write().unwrap_or_else(PoisonError::into_inner);
        *guard = apps;
    }

    fn snapshot(&self) -> Arc<HashSet<String>> {
        Arc::clone(&self.apps.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn is_allowed(&self, record: &LogRecord) -> bool {
        let apps = self.snapshot();
        if apps.is_empty() {
            return true;
        }
        let app_name = app_name(record).unwrap_or_default();
        apps.contains(&app_name.to_lowercase())
    }

    pub fn is_app_allowed(&self, app_name: &str) -> bool {
        let apps = self.snapshot();
        apps.is_empty() || apps.contains(&app_name.to_lowercase())
    }

    /// Current identifiers, sorted.
    pub fn apps(&self) -> Vec<String> {
        let mut apps: Vec<String> = self.snapshot().iter().cloned().collect();
        apps.sort();
        apps
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

/// Application identity of a record, if any. An empty string counts as absent so the
/// fallback key is consulted.
pub fn app_name(record: &LogRecord) -> Option<&str> {
    APP_NAME_KEYS
        .iter()
        .filter_map(|key| record.string_attribute(key))
        .find(|name| !name.is_empty())
}
