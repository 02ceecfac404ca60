//! All store access for leases lives here.
//!
//! Every ownership transition is an optimistic conditional write: the caller
//! states what it believes the stored owner and counter are, and the store
//! rejects the write if the row moved on. Conditional failures are terminal
//! per call; transient store failures are retried under the shared backoff
//! up to a per-operation cap.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::lease::{Lease, NULL_OWNER};
use crate::serializer::{self, LEASE_COUNTER, LEASE_KEY, LEASE_OWNER};
use crate::store::{
    AttrValue, CreateTableInput, DeleteItemInput, Item, PutItemInput, StoreClient, StoreError,
    Transient, UpdateItemInput,
};

// Retry caps, counted in store calls per operation.
const MAX_SCAN_RETRIES: usize = 3;
const MAX_CREATE_RETRIES: usize = 3;
const MAX_UPDATE_RETRIES: usize = 2;
const MAX_DELETE_RETRIES: usize = 2;

/// The lease operations the renewer, taker and coordinator consume.
///
/// `renew_lease`, `take_lease`, `evict_lease` and `create_lease` mutate the
/// passed lease only after the store accepted the write; on any failure the
/// caller's copy is left exactly as it was.
pub trait Manager: Clone + Send + Sync + 'static {
    /// Create the table that stores leases. Succeeds if it already exists.
    fn create_lease_table(&self) -> impl Future<Output = Result<()>> + Send;

    /// All leases in the table. Rows that fail to decode are logged and
    /// skipped.
    fn list_leases(&self) -> impl Future<Output = Result<Vec<Lease>>> + Send;

    /// Increment the lease counter, conditional on the stored counter and
    /// owner matching the input.
    fn renew_lease(&self, lease: &mut Lease) -> impl Future<Output = Result<()>> + Send;

    /// Increment the counter and claim ownership for this worker, under the
    /// same condition as a renew.
    fn take_lease(&self, lease: &mut Lease) -> impl Future<Output = Result<()>> + Send;

    /// Release the current owner by writing the null owner, conditional on
    /// the stored owner matching the input. The counter is untouched.
    fn evict_lease(&self, lease: &mut Lease) -> impl Future<Output = Result<()>> + Send;

    /// Create a lease, conditional on no row existing with a different
    /// owner or counter. Defaults the owner to this worker and the counter
    /// to at least 1.
    fn create_lease(&self, lease: &mut Lease) -> impl Future<Output = Result<()>> + Send;

    /// Delete a lease, conditional on the row being absent or owned by the
    /// input's owner.
    fn delete_lease(&self, lease: &Lease) -> impl Future<Output = Result<()>> + Send;

    /// Patch the application metadata of a lease without touching the
    /// reserved triple. Returns the decoded new image, or the input
    /// unchanged when there is nothing to write.
    fn update_lease(&self, lease: &Lease) -> impl Future<Output = Result<Lease>> + Send;
}

#[derive(Clone)]
pub struct LeaseManager<S> {
    config: Arc<Config>,
    store: S,
}

impl<S: StoreClient> LeaseManager<S> {
    pub fn new(store: S, config: Arc<Config>) -> LeaseManager<S> {
        LeaseManager { config, store }
    }

    /// Sleep for the backoff's next interval before another attempt.
    /// Returns false when the strategy is exhausted.
    async fn backoff_delay(&self, operation: &str, attempt: usize) -> bool {
        match self.config.retry.next_delay().await {
            Some(delay) => {
                warn!(
                    worker = %self.config.worker_id,
                    attempt,
                    backoff = ?delay,
                    "failed to {}, retrying",
                    operation,
                );
                sleep(delay).await;
                true
            }
            None => false,
        }
    }

    async fn update_item_with_retry(&self, input: UpdateItemInput) -> Result<Item> {
        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            match self.store.update_item(input.clone()).await {
                Ok(item) => break Ok(item),
                Err(err) if !err.is_transient() => break Err(Error::from(err)),
                Err(err) => {
                    if attempt >= MAX_UPDATE_RETRIES
                        || !self.backoff_delay("update lease", attempt).await
                    {
                        break Err(err.into());
                    }
                }
            }
        };
        self.config.retry.reset().await;
        result
    }

    /// Write the owner and counter of `next`, conditional on the stored row
    /// still matching `prior`. Conditions are only attached for veteran
    /// leases: a zero counter or empty owner carries no expectation.
    async fn cond_update(&self, next: &Lease, prior: &Lease) -> Result<()> {
        let mut values = HashMap::from([
            (":owner".to_string(), AttrValue::S(next.owner.clone())),
            (":count".to_string(), AttrValue::N(next.counter.to_string())),
        ]);
        let mut names = HashMap::new();
        let mut clauses = Vec::new();
        if prior.counter > 0 {
            values.insert(
                ":condCounter".to_string(),
                AttrValue::N(prior.counter.to_string()),
            );
            names.insert("#counter".to_string(), LEASE_COUNTER.to_string());
            clauses.push(":condCounter = #counter");
        }
        if !prior.owner.is_empty() {
            values.insert(":condOwner".to_string(), AttrValue::S(prior.owner.clone()));
            names.insert("#owner".to_string(), LEASE_OWNER.to_string());
            clauses.push(":condOwner = #owner");
        }
        let input = UpdateItemInput {
            table_name: self.config.lease_table.clone(),
            key: key_item(&next.key),
            update_expression: format!("SET {} = :owner, {} = :count", LEASE_OWNER, LEASE_COUNTER),
            condition_expression: (!clauses.is_empty()).then(|| clauses.join(" AND ")),
            expression_attribute_names: names,
            expression_attribute_values: values,
        };
        self.update_item_with_retry(input).await.map(|_| ())
    }
}

impl<S: StoreClient> Manager for LeaseManager<S> {
    async fn create_lease_table(&self) -> Result<()> {
        let input = CreateTableInput {
            table_name: self.config.lease_table.clone(),
            hash_key: LEASE_KEY.to_string(),
            read_capacity: self.config.lease_table_read_cap,
            write_capacity: self.config.lease_table_write_cap,
        };
        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            match self.store.create_table(input.clone()).await {
                Ok(()) | Err(StoreError::ResourceInUse) => break Ok(()),
                Err(err) => {
                    if attempt >= MAX_CREATE_RETRIES
                        || !self.backoff_delay("create table", attempt).await
                    {
                        break Err(err.into());
                    }
                }
            }
        };
        self.config.retry.reset().await;
        result
    }

    async fn list_leases(&self) -> Result<Vec<Lease>> {
        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            match self.store.scan(&self.config.lease_table).await {
                Ok(items) => {
                    let mut leases = Vec::with_capacity(items.len());
                    for item in &items {
                        match serializer::decode(item) {
                            Ok(lease) => leases.push(lease),
                            Err(err) => {
                                error!(
                                    worker = %self.config.worker_id,
                                    error = %err,
                                    "skipping undecodable lease row",
                                );
                            }
                        }
                    }
                    break Ok(leases);
                }
                Err(err) => {
                    if attempt >= MAX_SCAN_RETRIES
                        || !self.backoff_delay("scan leases table", attempt).await
                    {
                        break Err(err.into());
                    }
                }
            }
        };
        self.config.retry.reset().await;
        result
    }

    async fn renew_lease(&self, lease: &mut Lease) -> Result<()> {
        let mut next = lease.clone();
        next.counter += 1;
        self.cond_update(&next, lease).await?;
        lease.counter = next.counter;
        Ok(())
    }

    async fn take_lease(&self, lease: &mut Lease) -> Result<()> {
        let mut next = lease.clone();
        next.counter += 1;
        next.owner = self.config.worker_id.clone();
        self.cond_update(&next, lease).await?;
        lease.counter = next.counter;
        lease.owner = next.owner;
        Ok(())
    }

    async fn evict_lease(&self, lease: &mut Lease) -> Result<()> {
        let mut values = HashMap::from([(
            ":owner".to_string(),
            AttrValue::S(NULL_OWNER.to_string()),
        )]);
        let mut names = HashMap::new();
        let mut condition = None;
        if !lease.owner.is_empty() {
            values.insert(":condOwner".to_string(), AttrValue::S(lease.owner.clone()));
            names.insert("#owner".to_string(), LEASE_OWNER.to_string());
            condition = Some("#owner = :condOwner".to_string());
        }
        let input = UpdateItemInput {
            table_name: self.config.lease_table.clone(),
            key: key_item(&lease.key),
            update_expression: format!("SET {} = :owner", LEASE_OWNER),
            condition_expression: condition,
            expression_attribute_names: names,
            expression_attribute_values: values,
        };
        self.update_item_with_retry(input).await?;
        lease.owner = NULL_OWNER.to_string();
        Ok(())
    }

    async fn create_lease(&self, lease: &mut Lease) -> Result<()> {
        if lease.owner.is_empty() {
            lease.owner = self.config.worker_id.clone();
        }
        if lease.counter == 0 {
            lease.counter = 1;
        }
        let input = PutItemInput {
            table_name: self.config.lease_table.clone(),
            item: serializer::encode(lease),
            condition_expression: Some(
                "attribute_not_exists(#key) OR (#counter = :condCounter AND #owner = :condOwner)"
                    .to_string(),
            ),
            expression_attribute_names: HashMap::from([
                ("#key".to_string(), LEASE_KEY.to_string()),
                ("#owner".to_string(), LEASE_OWNER.to_string()),
                ("#counter".to_string(), LEASE_COUNTER.to_string()),
            ]),
            expression_attribute_values: HashMap::from([
                (":condOwner".to_string(), AttrValue::S(lease.owner.clone())),
                (
                    ":condCounter".to_string(),
                    AttrValue::N(lease.counter.to_string()),
                ),
            ]),
        };
        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            match self.store.put_item(input.clone()).await {
                Ok(()) => break Ok(()),
                Err(err) if !err.is_transient() => break Err(Error::from(err)),
                Err(err) => {
                    if attempt >= MAX_CREATE_RETRIES
                        || !self.backoff_delay("create lease", attempt).await
                    {
                        break Err(err.into());
                    }
                }
            }
        };
        self.config.retry.reset().await;
        result
    }

    async fn delete_lease(&self, lease: &Lease) -> Result<()> {
        let input = DeleteItemInput {
            table_name: self.config.lease_table.clone(),
            key: key_item(&lease.key),
            condition_expression: Some(
                "attribute_not_exists(#key) OR #owner = :condOwner".to_string(),
            ),
            expression_attribute_names: HashMap::from([
                ("#key".to_string(), LEASE_KEY.to_string()),
                ("#owner".to_string(), LEASE_OWNER.to_string()),
            ]),
            expression_attribute_values: HashMap::from([(
                ":condOwner".to_string(),
                AttrValue::S(lease.owner.clone()),
            )]),
        };
        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            match self.store.delete_item(input.clone()).await {
                Ok(()) => break Ok(()),
                Err(err) if !err.is_transient() => break Err(Error::from(err)),
                Err(err) => {
                    if attempt >= MAX_DELETE_RETRIES
                        || !self.backoff_delay("delete lease", attempt).await
                    {
                        break Err(err.into());
                    }
                }
            }
        };
        self.config.retry.reset().await;
        result
    }

    async fn update_lease(&self, lease: &Lease) -> Result<Lease> {
        let mut set_clauses = Vec::new();
        let mut values = HashMap::new();
        if !lease.extra.is_empty() || !lease.explicit.is_empty() {
            for (name, value) in serializer::encode(lease) {
                if !serializer::is_reserved(&name) {
                    set_clauses.push(format!("{} = :{}", name, name));
                    values.insert(format!(":{}", name), value);
                }
            }
        }
        set_clauses.sort();

        let mut removals: Vec<&String> = lease
            .removed
            .iter()
            .filter(|name| !serializer::is_reserved(name))
            .collect();
        removals.sort();

        let mut expression = String::new();
        if !set_clauses.is_empty() {
            expression = format!("SET {}", set_clauses.join(", "));
        }
        if !removals.is_empty() {
            if !expression.is_empty() {
                expression.push(' ');
            }
            expression.push_str("REMOVE ");
            expression.push_str(
                &removals
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            );
        }

        // Nothing to change; skip the store round trip.
        if expression.is_empty() {
            return Ok(lease.clone());
        }
        debug!(
            worker = %self.config.worker_id,
            key = %lease.key,
            expression = %expression,
            "updating lease metadata",
        );

        let image = self
            .update_item_with_retry(UpdateItemInput {
                table_name: self.config.lease_table.clone(),
                key: key_item(&lease.key),
                update_expression: expression,
                condition_expression: None,
                expression_attribute_names: HashMap::new(),
                expression_attribute_values: values,
            })
            .await?;
        serializer::decode(&image)
    }
}

fn key_item(key: &str) -> Item {
    HashMap::from([(LEASE_KEY.to_string(), AttrValue::S(key.to_string()))])
}
