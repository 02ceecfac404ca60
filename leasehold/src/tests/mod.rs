//! Test doubles shared across component tests.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::retry;


pub(crate) use stub_manager::StubManager;
pub(crate) use stub_store::StubStore;

pub(crate) fn test_config(worker_id: &str) -> Arc<Config> {
    Arc::new(Config {
        lease_table: "test".to_string(),
        worker_id: worker_id.to_string(),
        expire_after: Duration::from_secs(60),
        max_leases_to_steal_at_one_time: 1,
        lease_table_read_cap: 10,
        lease_table_write_cap: 10,
        retry: retry::immediate(),
    })
}
