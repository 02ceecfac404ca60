use std::time::Duration;

use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::retry::Retry;

const MIN_EXPIRE_AFTER: Duration = Duration::from_secs(10);

/// Coordinator configuration.
#[derive(Clone)]
pub struct Config {
    /// Store table used for tracking leases. Required.
    pub lease_table: String,

    /// Identity of this worker, used as the lease owner. Defaults to a
    /// random UUID.
    pub worker_id: String,

    /// Failover window: how long a lease may live without renewal before
    /// other workers regard its holder as failed. Defaults to 10s, which is
    /// also the minimum.
    pub expire_after: Duration,

    /// Max leases to steal from another worker at one time (for load
    /// balancing). A higher number converges faster, e.g. during
    /// deployments and cold starts, but churns more. Defaults to 1.
    pub max_leases_to_steal_at_one_time: usize,

    /// Read capacity the lease table is provisioned with at creation.
    /// Defaults to 10.
    pub lease_table_read_cap: u32,

    /// Write capacity the lease table is provisioned with at creation.
    /// Defaults to 10.
    pub lease_table_write_cap: u32,

    /// Retry pacing for store failures. Defaults to exponential backoff
    /// with a 1s initial interval and jitter.
    pub retry: Retry,
}

impl Config {
    pub fn new(lease_table: impl Into<String>) -> Config {
        Config {
            lease_table: lease_table.into(),
            worker_id: String::new(),
            expire_after: Duration::ZERO,
            max_leases_to_steal_at_one_time: 0,
            lease_table_read_cap: 0,
            lease_table_write_cap: 0,
            retry: Retry::default(),
        }
    }

    /// Fill defaults and validate. Failures here are terminal: the
    /// coordinator refuses to construct with a broken configuration.
    pub(crate) fn validated(mut self) -> Result<Config> {
        if self.lease_table.is_empty() {
            return Err(Error::InvalidConfig("lease_table is required".to_string()));
        }
        if self.expire_after.is_zero() {
            self.expire_after = MIN_EXPIRE_AFTER;
        }
        if self.expire_after < MIN_EXPIRE_AFTER {
            return Err(Error::InvalidConfig(format!(
                "expire_after must be at least {:?}",
                MIN_EXPIRE_AFTER
            )));
        }
        if self.max_leases_to_steal_at_one_time == 0 {
            self.max_leases_to_steal_at_one_time = 1;
        }
        if self.lease_table_read_cap == 0 {
            self.lease_table_read_cap = 10;
        }
        if self.lease_table_write_cap == 0 {
            self.lease_table_write_cap = 10;
        }
        if self.worker_id.is_empty() {
            self.worker_id = Uuid::new_v4().to_string();
            info!(worker = %self.worker_id, "no worker id configured, assigned one");
        }
        Ok(self)
    }
}
