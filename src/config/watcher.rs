//! Hot reload of the node map.
//!
//! The watcher re-reads the configuration file when it changes and
//! publishes the node map (node id to address) it contains. Everything
//! else in the file is fixed at startup: listener, TLS and framing
//! settings are not swapped under a running transport.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::loader::load_config;

/// Node id to address, as published on every accepted change.
pub type NodeMap = HashMap<String, SocketAddr>;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Watches a configuration file and publishes its node map.
pub struct NodeMapWatcher {
    path: PathBuf,
    last: Mutex<Option<NodeMap>>,
    update_tx: mpsc::UnboundedSender<NodeMap>,
}

impl NodeMapWatcher {
    /// Returns the watcher and the receiver node maps are published on.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<NodeMap>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.to_path_buf(),
                last: Mutex::new(None),
                update_tx,
            },
            update_rx,
        )
    }

    /// Re-read the file and publish its node map if it differs from the
    /// last one published. A file that fails to load or validate keeps the
    /// current map. Returns whether a map was published.
    pub fn reload(&self) -> bool {
        let nodes: NodeMap = match load_config(&self.path) {
            Ok(config) => config.node_addresses().into_iter().collect(),
            Err(e) => {
                tracing::error!(path = ?self.path, error = %e, "Failed to reload node map, keeping current one");
                return false;
            }
        };

        let mut last = self.last.lock();
        if last.as_ref() == Some(&nodes) {
            tracing::debug!(path = ?self.path, "Node map unchanged");
            return false;
        }
        tracing::info!(path = ?self.path, nodes = nodes.len(), "Node map reloaded");
        *last = Some(nodes.clone());
        self.update_tx.send(nodes).is_ok()
    }

    /// Start watching the file. The returned watcher must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let path = self.path.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    self.reload();
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Node map watch error"),
            },
            Config::default().with_poll_interval(POLL_INTERVAL),
        )?;

        watcher.watch(&path, RecursiveMode::NonRecursive)?;
        tracing::info!(path = ?path, "Node map watcher started");
        Ok(watcher)
    }
}

impl std::fmt::Debug for NodeMapWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeMapWatcher").field("path", &self.path).finish()
    }
}
