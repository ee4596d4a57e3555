//! Live configuration reload.
//!
//! Watches the config file's directory (editors often replace files rather
//! than write in place) and yields a new [`Config`] whenever the file's
//! effective contents change. Command-line overrides are re-applied to
//! every reload.

use crate::config::{Config, ConfigOverrides};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Quiet time after a file event before the file is re-read
const DEBOUNCE: Duration = Duration::from_millis(100);

pub struct ConfigWatcher {
    path: PathBuf,
    file_name: OsString,
    overrides: ConfigOverrides,
    current: Config,
    /// Channel to receive file system events
    fs_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    /// The watcher (kept alive to continue watching)
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    pub fn start(
        path: &Path,
        overrides: ConfigOverrides,
        current: Config,
    ) -> Result<Self, notify::Error> {
        let file_name = path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, fs_rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        info!("Watching {} for configuration changes", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            file_name,
            overrides,
            current,
            fs_rx,
            _watcher: watcher,
        })
    }

    /// Wait for the next effective configuration change.
    ///
    /// Invalid files are logged and skipped; the previous config stays live.
    pub async fn next_change(&mut self) -> Option<Config> {
        loop {
            match self.fs_rx.recv().await? {
                Ok(event) if self.is_relevant(&event) => {}
                Ok(_) => continue,
                Err(e) => {
                    warn!("File watcher error: {}", e);
                    continue;
                }
            }

            // Collapse the burst of events a single save produces
            tokio::time::sleep(DEBOUNCE).await;
            while self.fs_rx.try_recv().is_ok() {}

            if !self.path.exists() {
                debug!("Config file {} removed, keeping current config", self.path.display());
                continue;
            }

            match self.overrides.resolve(Some(&self.path)) {
                Ok(config) if config != self.current => {
                    info!("Configuration reloaded from {}", self.path.display());
                    self.current = config.clone();
                    return Some(config);
                }
                Ok(_) => debug!("Config file touched without changes"),
                Err(e) => warn!("Ignoring config reload: {}", e),
            }
        }
    }

    fn is_relevant(&self, event: &Event) -> bool {
        matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_)
        ) && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(self.file_name.as_os_str()))
    }
}
