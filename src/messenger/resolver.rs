//! Node id → address resolution.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::TransportConfig;

/// Resolves node ids to socket addresses.
pub trait NodeResolver: Send + Sync {
    fn resolve(&self, id: &str) -> Option<SocketAddr>;
}

impl<R: NodeResolver + ?Sized> NodeResolver for Arc<R> {
    fn resolve(&self, id: &str) -> Option<SocketAddr> {
        (**self).resolve(id)
    }
}

/// A node map that can be swapped at runtime without blocking readers.
#[derive(Debug, Default)]
pub struct StaticResolver {
    nodes: ArcSwap<HashMap<String, SocketAddr>>,
}

impl StaticResolver {
    pub fn new(nodes: HashMap<String, SocketAddr>) -> Self {
        Self {
            nodes: ArcSwap::from_pointee(nodes),
        }
    }

    /// Resolver over the parsable entries of `config.nodes`.
    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(config.node_addresses().into_iter().collect())
    }

    pub fn insert(&self, id: &str, addr: SocketAddr) {
        self.nodes.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(id.to_string(), addr);
            next
        });
    }

    /// Replace the whole map, e.g. after a config reload.
    pub fn replace(&self, nodes: HashMap<String, SocketAddr>) {
        tracing::info!(nodes = nodes.len(), "Node map replaced");
        self.nodes.store(Arc::new(nodes));
    }

    pub fn len(&self) -> usize {
        self.nodes.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NodeResolver for StaticResolver {
    fn resolve(&self, id: &str) -> Option<SocketAddr> {
        self.nodes.load().get(id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn resolves_config_entries() {
        let mut config = TransportConfig::default();
        config.nodes.insert("a".into(), "127.0.0.1:24400".into());
        config.nodes.insert("broken".into(), "nowhere".into());

        let resolver = StaticResolver::from_config(&config);
        assert_eq!(resolver.resolve("a"), Some(addr(24400)));
        assert_eq!(resolver.resolve("broken"), None);
        assert_eq!(resolver.len(), 1);
    }

    #[test]
    fn insert_and_replace() {
        let resolver = Arc::new(StaticResolver::default());
        assert!(resolver.is_empty());
        resolver.insert("b", addr(1));
        assert_eq!(resolver.resolve("b"), Some(addr(1)));

        resolver.replace(HashMap::from([("c".to_string(), addr(2))]));
        assert_eq!(resolver.resolve("b"), None);
        assert_eq!(NodeResolver::resolve(&resolver, "c"), Some(addr(2)));
    }
}
