//! Holds and refreshes the leases this worker owns.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::config::Config;
use crate::error::Result;
use crate::lease::Lease;
use crate::manager::Manager;

/// Tracks the set of leases this worker believes it currently holds and
/// extends them on every tick. A lease is held if the last renew cycle saw
/// this worker as its owner.
#[derive(Clone)]
pub struct LeaseRenewer<M> {
    config: Arc<Config>,
    manager: M,
    held: Arc<RwLock<HashMap<String, Lease>>>,
}

impl<M: Manager> LeaseRenewer<M> {
    pub fn new(config: Arc<Config>, manager: M) -> LeaseRenewer<M> {
        LeaseRenewer {
            config,
            manager,
            held: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// One renew cycle: list every lease, drop held entries that were
    /// deleted or lost to another worker, and bump the counter of those
    /// still ours.
    ///
    /// A failed renew does not drop the lease from the held set; the next
    /// list reveals whether it was actually lost.
    pub async fn renew(&self) -> Result<()> {
        let leases = self.manager.list_leases().await?;

        let listed: HashSet<&str> = leases.iter().map(|l| l.key.as_str()).collect();
        {
            let mut held = self.held.write().await;
            let deprecated: Vec<String> = held
                .keys()
                .filter(|key| !listed.contains(key.as_str()))
                .cloned()
                .collect();
            if !deprecated.is_empty() {
                debug!(
                    worker = %self.config.worker_id,
                    keys = ?deprecated,
                    "lost leases deleted from the table",
                );
                for key in &deprecated {
                    held.remove(key);
                }
            }
        }

        for lease in leases {
            if lease.owner == self.config.worker_id {
                let mut working = lease;
                if let Err(err) = self.manager.renew_lease(&mut working).await {
                    debug!(
                        worker = %self.config.worker_id,
                        key = %working.key,
                        error = %err,
                        "could not renew lease",
                    );
                }
                // First sight of a lease we own; keep this copy (and its
                // concurrency token) until the lease is lost.
                self.held
                    .write()
                    .await
                    .entry(working.key.clone())
                    .or_insert(working);
            } else {
                let mut held = self.held.write().await;
                if held.remove(&lease.key).is_some() {
                    debug!(
                        worker = %self.config.worker_id,
                        key = %lease.key,
                        new_owner = %lease.owner,
                        "lost lease to another worker",
                    );
                }
            }
        }

        Ok(())
    }

    /// Value copies of the currently held leases. The counters of the
    /// returned leases do not tick.
    pub async fn held_leases(&self) -> Vec<Lease> {
        self.held.read().await.values().cloned().collect()
    }

    pub(crate) async fn held_copy(&self, key: &str) -> Option<Lease> {
        self.held.read().await.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::LeaseRenewer;
    use crate::error::Error;
    use crate::lease::Lease;
    use crate::store::StoreError;
    use crate::tests::{test_config, StubManager};

    fn owned(key: &str, owner: &str) -> Lease {
        let mut lease = Lease::new(key);
        lease.owner = owner.to_string();
        lease
    }

    fn renewer_with_list(worker: &str, list: Vec<Lease>) -> (LeaseRenewer<StubManager>, StubManager)
    {
        let mut manager = StubManager::new();
        manager.list_result = Arc::new(Mutex::new(move || Ok(list.clone())));
        manager.renew_result = Arc::new(Mutex::new(|lease: &mut Lease| {
            lease.counter += 1;
            Ok(())
        }));
        let renewer = LeaseRenewer::new(test_config(worker), manager.clone());
        (renewer, manager)
    }

    async fn seed_held(renewer: &LeaseRenewer<StubManager>, leases: &[Lease]) {
        let mut held = renewer.held.write().await;
        for lease in leases {
            held.insert(lease.key.clone(), lease.clone());
        }
    }

    #[tokio::test]
    async fn adopts_and_renews_own_leases() {
        let (renewer, manager) =
            renewer_with_list("1", vec![owned("bar", "1"), owned("baz", "1")]);

        renewer.renew().await.unwrap();

        assert_eq!(manager.call_count("list_leases"), 1);
        assert_eq!(manager.call_count("renew_lease"), 2);
        let mut keys: Vec<String> = renewer
            .held_leases()
            .await
            .into_iter()
            .map(|l| l.key)
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["bar", "baz"]);
    }

    #[tokio::test]
    async fn renews_only_own_leases() {
        let (renewer, manager) =
            renewer_with_list("1", vec![owned("foo", "2"), owned("bar", "1")]);
        seed_held(&renewer, &[owned("bar", "1")]).await;

        renewer.renew().await.unwrap();

        assert_eq!(manager.call_count("renew_lease"), 1);
        let held = renewer.held_leases().await;
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].key, "bar");
    }

    #[tokio::test]
    async fn drops_leases_deleted_from_the_table() {
        let (renewer, manager) = renewer_with_list("1", vec![]);
        seed_held(&renewer, &[owned("bar", "1"), owned("baz", "1")]).await;

        renewer.renew().await.unwrap();

        assert_eq!(manager.call_count("renew_lease"), 0);
        assert!(renewer.held_leases().await.is_empty());
    }

    #[tokio::test]
    async fn drops_leases_stolen_by_another_worker() {
        // Held A and B; the list shows B now owned by someone else. One
        // renew call for A, and B leaves the held set.
        let (renewer, manager) =
            renewer_with_list("1", vec![owned("a", "1"), owned("b", "3")]);
        seed_held(&renewer, &[owned("a", "1"), owned("b", "1")]).await;

        renewer.renew().await.unwrap();

        assert_eq!(manager.call_count("renew_lease"), 1);
        let held = renewer.held_leases().await;
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].key, "a");
    }

    #[tokio::test]
    async fn failed_renew_keeps_the_lease_held() {
        let mut manager = StubManager::new();
        manager.list_result = Arc::new(Mutex::new(|| Ok(vec![owned("bar", "1")])));
        manager.renew_result = Arc::new(Mutex::new(|_: &mut Lease| {
            Err(Error::Store(StoreError::ConditionalCheckFailed))
        }));
        let renewer = LeaseRenewer::new(test_config("1"), manager);
        seed_held(&renewer, &[owned("bar", "1")]).await;

        renewer.renew().await.unwrap();

        // Not dropped: the next list decides whether it was really lost.
        assert_eq!(renewer.held_leases().await.len(), 1);
    }

    #[tokio::test]
    async fn held_copy_preserves_the_acquisition_token() {
        let mut manager = StubManager::new();
        // Each list decodes afresh, so every returned copy carries a new
        // token, the way the real serializer behaves.
        manager.list_result = Arc::new(Mutex::new(|| Ok(vec![owned("bar", "1")])));
        manager.renew_result = Arc::new(Mutex::new(|lease: &mut Lease| {
            lease.counter += 1;
            Ok(())
        }));
        let renewer = LeaseRenewer::new(test_config("1"), manager);

        renewer.renew().await.unwrap();
        let token = renewer
            .held_copy("bar")
            .await
            .unwrap()
            .concurrency_token()
            .to_string();

        renewer.renew().await.unwrap();
        let held = renewer.held_copy("bar").await.unwrap();
        assert_eq!(held.concurrency_token(), token);
    }

    #[tokio::test]
    async fn list_failure_surfaces_and_leaves_state_alone() {
        let mut manager = StubManager::new();
        manager.list_result = Arc::new(Mutex::new(|| {
            Err(Error::Store(StoreError::Unavailable("down".to_string())))
        }));
        let renewer = LeaseRenewer::new(test_config("1"), manager);
        seed_held(&renewer, &[owned("bar", "1")]).await;

        assert!(renewer.renew().await.is_err());
        assert_eq!(renewer.held_leases().await.len(), 1);
    }
}
