//! Node health monitoring
//!
//! Periodically probes the storage daemon on every online node and
//! keeps the latest result in a shared cache. Nodes marked offline in
//! the store are not probed and stay unhealthy in the cache.

use crate::executor::ExecutorRef;
use crate::store::Store;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Latest probe outcome per node id
#[derive(Debug, Default)]
pub struct NodeHealthCache {
    status: RwLock<HashMap<String, bool>>,
}

impl NodeHealthCache {
    pub fn new() -> Arc<NodeHealthCache> {
        Arc::new(NodeHealthCache::default())
    }

    /// `None` when the node has never been probed.
    pub fn is_healthy(&self, node_id: &str) -> Option<bool> {
        self.status.read().get(node_id).copied()
    }

    pub fn healthy_count(&self) -> usize {
        self.status.read().values().filter(|up| **up).count()
    }

    fn replace(&self, fresh: HashMap<String, bool>) {
        *self.status.write() = fresh;
    }
}

pub struct NodeHealthMonitor {
    store: Arc<Store>,
    executor: ExecutorRef,
    cache: Arc<NodeHealthCache>,
    start_delay: Duration,
    interval: Duration,
}

impl NodeHealthMonitor {
    pub fn new(
        store: Arc<Store>,
        executor: ExecutorRef,
        cache: Arc<NodeHealthCache>,
        start_delay: Duration,
        interval: Duration,
    ) -> NodeHealthMonitor {
        NodeHealthMonitor {
            store,
            executor,
            cache,
            start_delay,
            interval,
        }
    }

    /// Probe every known node once and publish the results.
    pub async fn probe_once(&self) -> crate::error::Result<()> {
        let nodes = self.store.view(|db| {
            Ok(db
                .nodes()
                .map(|n| (n.id.clone(), n.manage_hostname.clone(), n.is_online()))
                .collect::<Vec<_>>())
        })?;

        let mut fresh = HashMap::with_capacity(nodes.len());
        for (node_id, host, online) in nodes {
            let up = if online {
                match self.executor.glusterd_check(&host).await {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::warn!(node = %node_id, host = %host, error = %err, "node probe failed");
                        false
                    }
                }
            } else {
                false
            };
            fresh.insert(node_id, up);
        }
        let healthy = fresh.values().filter(|up| **up).count();
        tracing::debug!(healthy, total = fresh.len(), "node health refreshed");
        self.cache.replace(fresh);
        Ok(())
    }

    /// Run periodic probes until cancelled.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.start_delay) => {}
            }
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if let Err(err) = self.probe_once().await {
                    tracing::error!(error = %err, "node health sweep failed");
                }
            }
        })
    }
}
