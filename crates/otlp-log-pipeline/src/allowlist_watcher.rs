// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::allowlist::{Allowlist, AllowlistError};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// File identity used for change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    modified: Option<SystemTime>,
    len: u64,
}

impl Fingerprint {
    /// Stats `path` synchronously. Must be taken before the initial load.
    pub fn of(path: &Path) -> Option<Self> {
        std::fs::metadata(path).ok().map(|metadata| Self::from(&metadata))
    }
}

impl From<&std::fs::Metadata> for Fingerprint {
    fn from(metadata: &std::fs::Metadata) -> Self {
        Self {
            modified: metadata.modified().ok(),
            len: metadata.len(),
        }
    }
}

/// Polls the allowlist file and hot-swaps its contents into the live [`Allowlist`].
///
/// Reload failures are logged and leave the active set untouched.
pub struct AllowlistWatcher {
    allowlist: Arc<Allowlist>,
    path: PathBuf,
    poll_interval: Duration,
    cancel_token: CancellationToken,
    reload_tx: Option<mpsc::UnboundedSender<usize>>,
    last_seen: Option<Fingerprint>,
}

impl AllowlistWatcher {
    pub fn new(
        allowlist: Arc<Allowlist>,
        path: PathBuf,
        poll_interval: Duration,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            allowlist,
            path,
            poll_interval,
            cancel_token,
            reload_tx: None,
            last_seen: None,
        }
    }

    /// Sets the state of the file the live set was loaded from. Without a baseline the
    /// first poll reloads unconditionally.
    pub fn with_baseline(mut self, baseline: Option<Fingerprint>) -> Self {
        self.last_seen = baseline;
        self
    }

    /// Reports the identifier count after every successful reload.
    pub fn with_reload_notifier(mut self, reload_tx: mpsc::UnboundedSender<usize>) -> Self {
        self.reload_tx = Some(reload_tx);
        self
    }

    /// Runs until the cancellation token fires.
    pub async fn run(mut self) {
        debug!(
            "Watching allowlist {} every {:?}",
            self.path.display(),
            self.poll_interval
        );

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // first tick is immediate

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    debug!("Allowlist watcher stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.poll().await;
                }
            }
        }
    }

    /// Checks the file once and reloads it when it changed since the last check.
    /// Returns true when a new set was swapped in.
    pub async fn poll(&mut self) -> bool {
        let Some(current) = self.fingerprint().await else {
            return false;
        };
        if self.last_seen == Some(current) {
            return false;
        }
        self.last_seen = Some(current);

        match self.reload().await {
            Ok(count) => {
                info!("Reloaded allowlist {} ({count} apps)", self.path.display());
                if let Some(tx) = &self.reload_tx {
                    let _ = tx.send(count);
                }
                true
            }
            Err(e) => {
                warn!("Failed to reload allowlist, keeping previous entries: {e}");
                false
            }
        }
    }

    async fn fingerprint(&self) -> Option<Fingerprint> {
        match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => Some(Fingerprint::from(&metadata)),
            Err(e) => {
                debug!("Unable to stat allowlist {}: {e}", self.path.display());
                None
            }
        }
    }

    async fn reload(&self) -> Result<usize, AllowlistError> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| AllowlistError::Read {
                path: self.path.clone(),
                source,
            })?;
        let apps = Allowlist::parse(&contents);
        let count = apps.len();
        self.allowlist.replace(apps);
        Ok(count)
    }
}
