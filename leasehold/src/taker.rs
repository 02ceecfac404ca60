//! Acquires expired leases and rebalances load by stealing.

use std::collections::HashMap;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::thread_rng;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::Result;
use crate::lease::Lease;
use crate::manager::Manager;

/// Contends for leases on behalf of this worker. Keeps its own view of
/// every lease in the table: `last_renewal` here is when *this worker* last
/// saw the counter move, which is the only liveness signal between workers.
pub struct LeaseTaker<M> {
    config: Arc<Config>,
    manager: M,
    all_leases: HashMap<String, Lease>,
}

impl<M: Manager> LeaseTaker<M> {
    pub fn new(config: Arc<Config>, manager: M) -> LeaseTaker<M> {
        LeaseTaker {
            config,
            manager,
            all_leases: HashMap::new(),
        }
    }

    /// One take cycle:
    ///
    /// 1. Evict leases whose counter has not moved for the failover window.
    /// 2. Compute the fair per-worker target and how many we are short.
    /// 3. Take expired leases; failing that, consider stealing from the
    ///    most loaded worker.
    pub async fn take(&mut self) -> Result<()> {
        let list = self.manager.list_leases().await?;
        self.update_leases(list).await;

        let lease_counts = self.compute_lease_counts();
        let num_workers = lease_counts.len();
        let num_leases = self.all_leases.len();
        let target = if num_leases <= num_workers {
            1
        } else {
            num_leases.div_ceil(num_workers)
        };

        let my_count = *lease_counts
            .get(&self.config.worker_id)
            .unwrap_or(&0);
        let needed = target.saturating_sub(my_count);
        if needed == 0 {
            debug!(
                worker = %self.config.worker_id,
                held = my_count,
                target,
                "no leases needed",
            );
            return Ok(());
        }

        let mut to_take = self.expired_leases();
        let num_expired = to_take.len();
        if num_expired > 0 {
            // Shuffle so contending workers do not all chase the same keys.
            to_take.shuffle(&mut thread_rng());
            to_take.truncate(needed);
        } else {
            debug!(
                worker = %self.config.worker_id,
                needed,
                "no expired leases, considering stealing",
            );
            to_take = self.choose_leases_to_steal(&lease_counts, needed, target);
        }

        for key in &to_take {
            let Some(lease) = self.all_leases.get_mut(key) else {
                continue;
            };
            match self.manager.take_lease(lease).await {
                Ok(()) => {
                    debug!(worker = %self.config.worker_id, key = %key, "took lease");
                }
                Err(err) => {
                    debug!(
                        worker = %self.config.worker_id,
                        key = %key,
                        error = %err,
                        "could not take lease",
                    );
                }
            }
        }

        if !to_take.is_empty() {
            debug!(
                worker = %self.config.worker_id,
                total = num_leases,
                expired = num_expired,
                workers = num_workers,
                target,
                held = my_count,
                attempted = to_take.len(),
                "take cycle complete",
            );
        }

        Ok(())
    }

    /// Fold a fresh list into the tracked view. A changed counter adopts
    /// the fresh copy (whose `last_renewal` is the scan time); an unchanged
    /// counter keeps the old observation, and evicts the lease once that
    /// observation is older than the failover window.
    async fn update_leases(&mut self, list: Vec<Lease>) {
        let mut next = HashMap::with_capacity(list.len());
        for fresh in list {
            match self.all_leases.remove(&fresh.key) {
                Some(mut old) if old.counter == fresh.counter => {
                    if old.is_expired(self.config.expire_after) {
                        // Another worker may have evicted it first; condition
                        // on the owner the store shows now.
                        old.owner = fresh.owner.clone();
                        if let Err(err) = self.manager.evict_lease(&mut old).await {
                            warn!(
                                worker = %self.config.worker_id,
                                key = %old.key,
                                error = %err,
                                "failed to evict lease",
                            );
                        }
                    }
                    next.insert(old.key.clone(), old);
                }
                _ => {
                    next.insert(fresh.key.clone(), fresh);
                }
            }
        }
        self.all_leases = next;
    }

    /// Leases per active owner. Unowned leases do not count, but this
    /// worker is always represented.
    fn compute_lease_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for lease in self.all_leases.values() {
            if !lease.has_no_owner() {
                *counts.entry(lease.owner.clone()).or_insert(0) += 1;
            }
        }
        counts.entry(self.config.worker_id.clone()).or_insert(0);
        counts
    }

    /// Keys of leases available for taking as of our last scan.
    fn expired_leases(&self) -> Vec<String> {
        self.all_leases
            .values()
            .filter(|lease| lease.is_expired(self.config.expire_after) || lease.has_no_owner())
            .map(|lease| lease.key.clone())
            .collect()
    }

    /// Steal up to the configured cap from the most loaded worker:
    /// `min(needed, over-target)` leases if it is over target, or exactly
    /// one if it is at target and we are short by more than one.
    fn choose_leases_to_steal(
        &self,
        lease_counts: &HashMap<String, usize>,
        needed: usize,
        target: usize,
    ) -> Vec<String> {
        let Some((most_loaded, &count)) = lease_counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)))
        else {
            return Vec::new();
        };

        let mut num_to_steal = 0;
        if count >= target {
            num_to_steal = needed.min(count - target);
            if needed > 1 && num_to_steal == 0 {
                num_to_steal = 1;
            }
            num_to_steal = num_to_steal.min(self.config.max_leases_to_steal_at_one_time);
        }

        if num_to_steal == 0 {
            debug!(
                worker = %self.config.worker_id,
                most_loaded = %most_loaded,
                their_count = count,
                target,
                needed,
                "not stealing",
            );
            return Vec::new();
        }
        debug!(
            worker = %self.config.worker_id,
            most_loaded = %most_loaded,
            their_count = count,
            target,
            needed,
            stealing = num_to_steal,
            "stealing from most loaded worker",
        );

        let mut candidates: Vec<String> = self
            .all_leases
            .values()
            .filter(|lease| &lease.owner == most_loaded)
            .map(|lease| lease.key.clone())
            .collect();
        candidates.shuffle(&mut thread_rng());
        candidates.truncate(num_to_steal);
        candidates
    }
}
