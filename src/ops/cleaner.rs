//! Background operation cleanup
//!
//! Ledger entries left behind by a crash (stale) or an abandoned
//! failure (failed) are periodically reloaded and driven to a safe
//! state: remote leftovers removed first, the store reverted second.
//! One entry failing to clean never stops the sweep.

use super::tracker::{OpClass, OpTracker};
use super::{load_operation, CleanableOperation};
use crate::config::Config;
use crate::entities::{PendingOperationEntry, PendingStatus};
use crate::error::Result;
use crate::executor::ExecutorRef;
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct OperationCleaner {
    store: Arc<Store>,
    config: Arc<Config>,
    executor: ExecutorRef,
    tracker: Arc<OpTracker>,
}

impl OperationCleaner {
    pub fn new(
        store: Arc<Store>,
        config: Arc<Config>,
        executor: ExecutorRef,
        tracker: Arc<OpTracker>,
    ) -> OperationCleaner {
        OperationCleaner {
            store,
            config,
            executor,
            tracker,
        }
    }

    /// Entries eligible for cleanup: stale or failed, not currently
    /// driven, and not children (those are cleaned through their
    /// parent).
    fn cleanable_entries(&self) -> Result<Vec<PendingOperationEntry>> {
        let entries = self.store.view(|db| {
            Ok(db.pending_selection(|op| {
                matches!(op.status, PendingStatus::Stale | PendingStatus::Failed) && !op.is_child()
            }))
        })?;
        Ok(entries
            .into_iter()
            .filter(|op| !self.tracker.contains(&op.id))
            .collect())
    }

    async fn clean_one(&self, entry: &PendingOperationEntry) -> Result<()> {
        let op: Box<dyn CleanableOperation> =
            load_operation(self.store.clone(), self.config.clone(), entry)?;
        tracing::info!(op = %entry.id, label = op.label(), "cleaning operation");
        op.clean(self.executor.as_ref()).await?;
        op.clean_done()
    }

    /// One full sweep over the cleanable entries.
    pub async fn clean_all(&self) -> Result<()> {
        let entries = self.cleanable_entries()?;
        if entries.is_empty() {
            return Ok(());
        }
        tracing::info!(count = entries.len(), "starting pending operation cleanup");
        for entry in entries {
            if self.tracker.throttle_or_add(&entry.id, OpClass::Clean) {
                continue;
            }
            let result = self.clean_one(&entry).await;
            self.tracker.remove(&entry.id);
            if let Err(err) = result {
                tracing::warn!(op = %entry.id, error = %err, "cleanup failed, will retry later");
                self.store.update(|db| {
                    if let Ok(mut op) = db.pending_op(&entry.id) {
                        op.status = PendingStatus::Failed;
                        db.put_pending_op(op);
                    }
                    Ok(())
                })?;
            }
        }
        Ok(())
    }

    /// Run periodic sweeps until cancelled.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let start_delay = Duration::from_secs(self.config.cleaner_start_delay_secs);
        let interval = Duration::from_secs(self.config.cleaner_interval_secs);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(start_delay) => {}
            }
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if let Err(err) = self.clean_all().await {
                    tracing::error!(error = %err, "cleanup sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GB;
    use crate::durability::Durability;
    use crate::entities::{ClusterEntry, DeviceEntry, NodeEntry, VolumeEntry};
    use crate::executor::MockExecutor;
    use crate::ops::volume::VolumeCreateOperation;
    use crate::ops::Operation;

    fn fixture() -> (Arc<Store>, Arc<Config>) {
        let store = Store::new();
        store
            .update(|db| {
                let mut cluster = ClusterEntry::new(true, true);
                for n in 0..3 {
                    let mut node = NodeEntry::new(
                        &cluster.id,
                        n,
                        &format!("manage{n}"),
                        &format!("storage{n}"),
                    );
                    let device = DeviceEntry::new(&node.id, "/dev/sdb", 600 * GB);
                    node.device_add(&device.id);
                    db.put_device(device);
                    cluster.node_add(&node.id);
                    db.put_node(node);
                }
                db.put_cluster(cluster);
                Ok(())
            })
            .unwrap();
        (store, Arc::new(Config::default()))
    }

    fn interrupted_create(store: &Arc<Store>, config: &Arc<Config>) {
        let vol = VolumeEntry::new(
            "",
            100,
            Durability::Replicate {
                replica: 3,
                arbiter: false,
            },
        );
        let mut op = VolumeCreateOperation::new(store.clone(), config.clone(), vol);
        op.build().unwrap();
        store
            .update(|db| {
                db.mark_pending_operations_stale();
                Ok(())
            })
            .unwrap();
    }

    fn cleaner(store: &Arc<Store>, config: &Arc<Config>) -> OperationCleaner {
        OperationCleaner::new(
            store.clone(),
            config.clone(),
            MockExecutor::new(),
            Arc::new(OpTracker::new(8)),
        )
    }

    #[tokio::test]
    async fn test_sweep_reverts_interrupted_create() {
        let (store, config) = fixture();
        interrupted_create(&store, &config);

        cleaner(&store, &config).clean_all().await.unwrap();

        store
            .view(|db| {
                assert!(db.pending_op_ids().is_empty());
                assert!(db.volume_ids().is_empty());
                assert!(db.brick_ids().is_empty());
                for id in db.device_ids() {
                    assert_eq!(db.device(&id)?.used_kb, 0);
                }
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let (store, config) = fixture();
        interrupted_create(&store, &config);

        let c = cleaner(&store, &config);
        c.clean_all().await.unwrap();
        c.clean_all().await.unwrap();
        store
            .view(|db| {
                assert!(db.pending_op_ids().is_empty());
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_new_entries_are_left_alone() {
        let (store, config) = fixture();
        let vol = VolumeEntry::new("", 100, Durability::None);
        let mut op = VolumeCreateOperation::new(store.clone(), config.clone(), vol);
        op.build().unwrap();

        cleaner(&store, &config).clean_all().await.unwrap();
        store
            .view(|db| {
                assert_eq!(db.pending_op_ids().len(), 1);
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_tracked_entries_are_skipped() {
        let (store, config) = fixture();
        interrupted_create(&store, &config);
        let op_id = store.view(|db| Ok(db.pending_op_ids()[0].clone())).unwrap();

        let tracker = Arc::new(OpTracker::new(8));
        tracker.throttle_or_add(&op_id, OpClass::Normal);
        let c = OperationCleaner::new(
            store.clone(),
            config.clone(),
            MockExecutor::new(),
            tracker,
        );
        c.clean_all().await.unwrap();
        store
            .view(|db| {
                assert_eq!(db.pending_op_ids().len(), 1);
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_remote_cleanup_marks_entry_failed() {
        let (store, config) = fixture();
        interrupted_create(&store, &config);
        let op_id = store.view(|db| Ok(db.pending_op_ids()[0].clone())).unwrap();

        let executor = MockExecutor::new();
        MockExecutor::set_hook(&executor.on_brick_destroy, |host| {
            Err(crate::error::Error::Executor {
                host: host.to_string(),
                reason: "unreachable".into(),
            })
        });
        let c = OperationCleaner::new(
            store.clone(),
            config.clone(),
            executor,
            Arc::new(OpTracker::new(8)),
        );
        c.clean_all().await.unwrap();

        store
            .view(|db| {
                let op = db.pending_op(&op_id)?;
                assert_eq!(op.status, PendingStatus::Failed);
                Ok(())
            })
            .unwrap();
    }
}
