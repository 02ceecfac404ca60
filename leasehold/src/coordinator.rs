//! Schedules the taker and renewer and exposes the public lease API.

use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::lease::Lease;
use crate::manager::{LeaseManager, Manager};
use crate::renewer::LeaseRenewer;
use crate::store::StoreClient;
use crate::taker::LeaseTaker;

/// Slack applied when deriving tick intervals from the failover window.
const EPSILON: Duration = Duration::from_millis(25);

/// Owns the background lease machinery for one worker.
///
/// Two independent periodic tasks run from [`start`](Coordinator::start):
/// the taker reconciles the global view and acquires or steals leases, and
/// the renewer keeps the held set alive. The renewer runs several times per
/// failover window so a healthy worker never loses a lease to expiry.
pub struct Coordinator<S: StoreClient> {
    config: Arc<Config>,
    manager: LeaseManager<S>,
    renewer: LeaseRenewer<LeaseManager<S>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl<S: StoreClient> Coordinator<S> {
    /// Build a coordinator over the given store. Fails on invalid
    /// configuration; nothing runs until [`start`](Coordinator::start).
    pub fn new(store: S, config: Config) -> Result<Coordinator<S>> {
        let config = Arc::new(config.validated()?);
        let manager = LeaseManager::new(store, config.clone());
        let renewer = LeaseRenewer::new(config.clone(), manager.clone());
        Ok(Coordinator {
            config,
            manager,
            renewer,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    /// Ensure the lease table exists, then launch the periodic tasks. Both
    /// fire immediately, then at their configured interval. Tick errors are
    /// logged and do not terminate the loops.
    pub async fn start(&mut self) -> Result<()> {
        self.manager.create_lease_table().await?;

        let taker_interval = (self.config.expire_after + EPSILON) * 2;
        let renewer_interval = self.config.expire_after / 3 - EPSILON;

        let mut taker = LeaseTaker::new(self.config.clone(), self.manager.clone());
        let worker = self.config.worker_id.clone();
        let cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut tick = interval(taker_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                select! {
                    _ = cancel.cancelled() => return,
                    _ = tick.tick() => {}
                }
                if let Err(err) = taker.take().await {
                    error!(worker = %worker, error = %err, "failed to take leases");
                }
            }
        }));

        let renewer = self.renewer.clone();
        let worker = self.config.worker_id.clone();
        let cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut tick = interval(renewer_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                select! {
                    _ = cancel.cancelled() => return,
                    _ = tick.tick() => {}
                }
                if let Err(err) = renewer.renew().await {
                    error!(worker = %worker, error = %err, "failed to renew leases");
                }
            }
        }));

        info!(
            worker = %self.config.worker_id,
            failover = ?self.config.expire_after,
            ?renewer_interval,
            ?taker_interval,
            steal_cap = self.config.max_leases_to_steal_at_one_time,
            "started lease coordinator",
        );
        Ok(())
    }

    /// Stop both periodic tasks and wait for any tick in flight to drain.
    pub async fn stop(&mut self) {
        info!(worker = %self.config.worker_id, "stopping lease coordinator");
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!(worker = %self.config.worker_id, "stopped lease coordinator");
    }

    /// Value copies of the leases this worker currently holds.
    pub async fn held_leases(&self) -> Vec<Lease> {
        self.renewer.held_leases().await
    }

    /// Create a new lease. Conditional on no lease already existing under
    /// the same key with a different owner or counter. Returns the
    /// authoritative (possibly defaulted) lease.
    pub async fn create(&self, mut lease: Lease) -> Result<Lease> {
        self.manager.create_lease(&mut lease).await?;
        Ok(lease)
    }

    /// Delete a lease. Does nothing when the lease does not exist; fails on
    /// a lease currently owned by another worker.
    pub async fn delete(&self, lease: &Lease) -> Result<()> {
        self.manager.delete_lease(lease).await
    }

    /// Guarded metadata update: refuses leases this worker does not hold,
    /// and stale copies from before a loss-and-reacquisition, before any
    /// store traffic.
    pub async fn update(&self, lease: &Lease) -> Result<Lease> {
        let held = self
            .renewer
            .held_copy(&lease.key)
            .await
            .ok_or_else(|| Error::LeaseNotHeld(lease.key.clone()))?;
        if held.concurrency_token() != lease.concurrency_token() {
            return Err(Error::TokenNotMatch(lease.key.clone()));
        }
        self.manager.update_lease(lease).await
    }

    /// Metadata update without the held-lease and token guards.
    pub async fn force_update(&self, lease: &Lease) -> Result<Lease> {
        self.manager.update_lease(lease).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::sleep;

    use super::Coordinator;
    use crate::config::Config;
    use crate::error::Error;
    use crate::lease::Lease;
    use crate::manager::{LeaseManager, Manager};
    use crate::retry;
    use crate::store::MemoryStore;
    use crate::tests::test_config;

    fn config(worker: &str) -> Config {
        let mut config = Config::new("leases");
        config.worker_id = worker.to_string();
        config.retry = retry::immediate();
        config
    }

    /// Create the table and seed leases without starting a coordinator.
    async fn seed(store: &MemoryStore, owner: &str, keys: &[&str]) {
        let mut seed_config = (*test_config("seeder")).clone();
        seed_config.lease_table = "leases".to_string();
        let manager = LeaseManager::new(store.clone(), std::sync::Arc::new(seed_config));
        manager.create_lease_table().await.unwrap();
        for key in keys {
            let mut lease = Lease::new(*key);
            lease.owner = owner.to_string();
            manager.create_lease(&mut lease).await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fails_over_leases_of_a_dead_worker() {
        let store = MemoryStore::new();
        seed(&store, "dead-worker", &["a", "b", "c"]).await;

        let mut worker = Coordinator::new(store, config("survivor")).unwrap();
        worker.start().await.unwrap();

        // Failover bound: two taker cycles plus the expiry window.
        sleep(Duration::from_secs(55)).await;

        let held = worker.held_leases().await;
        let keys: HashSet<String> = held.into_iter().map(|l| l.key).collect();
        assert_eq!(
            keys,
            HashSet::from(["a".to_string(), "b".to_string(), "c".to_string()])
        );

        worker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn renewals_keep_counters_moving() {
        let store = MemoryStore::new();
        seed(&store, "", &["a"]).await;

        let mut worker = Coordinator::new(store.clone(), config("w1")).unwrap();
        worker.start().await.unwrap();

        let probe = LeaseManager::new(
            store,
            std::sync::Arc::new(config("probe").validated().unwrap()),
        );
        sleep(Duration::from_secs(30)).await;
        let first = probe.list_leases().await.unwrap()[0].counter;
        sleep(Duration::from_secs(30)).await;
        let second = probe.list_leases().await.unwrap()[0].counter;
        // The stored heartbeat keeps climbing while the worker is healthy;
        // the held snapshot stays pinned at its acquisition counter.
        assert!(second > first);
        assert!(worker.held_leases().await[0].counter <= second);

        worker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn two_workers_split_the_leases_fairly() {
        let store = MemoryStore::new();
        seed(&store, "", &["a", "b", "c", "d"]).await;

        let mut w1 = Coordinator::new(store.clone(), config("w1")).unwrap();
        let mut w2 = Coordinator::new(store.clone(), config("w2")).unwrap();
        w1.start().await.unwrap();
        w2.start().await.unwrap();

        sleep(Duration::from_secs(120)).await;

        let held1: HashSet<String> =
            w1.held_leases().await.into_iter().map(|l| l.key).collect();
        let held2: HashSet<String> =
            w2.held_leases().await.into_iter().map(|l| l.key).collect();

        // No lease is believed held by both workers at once.
        assert!(held1.is_disjoint(&held2));
        assert_eq!(held1.len() + held2.len(), 4);
        // Fair target: within one of ceil(4/2).
        assert!(held1.len() >= 1 && held1.len() <= 3, "split {}/{}", held1.len(), held2.len());

        w1.stop().await;
        w2.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn guarded_update_checks_holding_and_token() {
        let store = MemoryStore::new();
        seed(&store, "", &["task"]).await;

        let mut worker = Coordinator::new(store.clone(), config("w1")).unwrap();
        worker.start().await.unwrap();
        sleep(Duration::from_secs(30)).await;

        let mut held = worker.held_leases().await.pop().unwrap();
        held.set("status", "done");
        let updated = worker.update(&held).await.unwrap();
        assert_eq!(updated.get("status"), Some(json!("done")));

        // A copy with a fresh token does not match the held acquisition.
        let mut stale = Lease::new("task");
        stale.set("status", "stale");
        assert!(matches!(
            worker.update(&stale).await,
            Err(Error::TokenNotMatch(_))
        ));

        // A key we do not hold is rejected before any store traffic.
        let unheld = Lease::new("unrelated");
        assert!(matches!(
            worker.update(&unheld).await,
            Err(Error::LeaseNotHeld(_))
        ));

        // force_update skips both guards.
        let updated = worker.force_update(&stale).await.unwrap();
        assert_eq!(updated.get("status"), Some(json!("stale")));

        worker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_drains_and_halts_the_loops() {
        let store = MemoryStore::new();
        seed(&store, "", &["a"]).await;

        let mut worker = Coordinator::new(store.clone(), config("w1")).unwrap();
        worker.start().await.unwrap();
        sleep(Duration::from_secs(30)).await;
        assert_eq!(worker.held_leases().await.len(), 1);

        worker.stop().await;

        // With the loops gone the stored counter freezes.
        let manager = LeaseManager::new(store, std::sync::Arc::new(config("probe").validated().unwrap()));
        let before = manager.list_leases().await.unwrap()[0].counter;
        sleep(Duration::from_secs(60)).await;
        let after = manager.list_leases().await.unwrap()[0].counter;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn invalid_config_is_terminal() {
        let store = MemoryStore::new();
        assert!(matches!(
            Coordinator::new(store, Config::new("")),
            Err(Error::InvalidConfig(_))
        ));
    }
}
