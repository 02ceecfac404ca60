//! The lease data model.
//!
//! A lease grants one worker exclusive responsibility for one unit of work
//! until it expires. Workers detect liveness through the counter: a lease
//! whose counter has not moved for longer than the failover window is up for
//! grabs. Alongside the reserved triple (key, owner, counter) a lease can
//! carry arbitrary application metadata, either generically marshalled or as
//! explicitly typed sets.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::serializer;
use crate::store::AttrValue;

/// Sentinel owner of an unowned lease, as persisted.
pub(crate) const NULL_OWNER: &str = "NULL";

/// Store-level type of an explicitly typed metadata set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetType {
    StringSet,
    NumberSet,
    BinarySet,
}

#[derive(Debug, Clone)]
pub struct Lease {
    /// Unit-of-work identifier, globally unique. The table hash key.
    pub key: String,
    /// Worker id of the current holder; empty or `"NULL"` means unowned.
    pub owner: String,
    /// Monotonically increasing heartbeat. Bumped by one on every
    /// successful renew or take.
    pub counter: u64,

    /// When this worker last observed the counter change. Local to this
    /// worker, never persisted; two workers legitimately disagree on it.
    pub(crate) last_renewal: Instant,
    /// Fencing token for guarded metadata updates. Fresh on every decode,
    /// never persisted.
    pub(crate) concurrency_token: String,

    pub(crate) extra: HashMap<String, Value>,
    pub(crate) explicit: HashMap<String, AttrValue>,
    pub(crate) removed: HashSet<String>,
}

impl Lease {
    pub fn new(key: impl Into<String>) -> Self {
        Lease {
            key: key.into(),
            owner: String::new(),
            counter: 0,
            last_renewal: Instant::now(),
            concurrency_token: new_token(),
            extra: HashMap::new(),
            explicit: HashMap::new(),
            removed: HashSet::new(),
        }
    }

    /// Attach generic metadata, persisted on the next create or update.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        self.explicit.remove(&key);
        self.removed.remove(&key);
        self.extra.insert(key, value.into());
    }

    /// Attach metadata with an explicit store set type. The payload must be
    /// an array of strings, numbers, or byte arrays matching `set_type`.
    pub fn set_as(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
        set_type: SetType,
    ) -> Result<()> {
        let attr = typed_set(value.into(), set_type)?;
        let key = key.into();
        self.extra.remove(&key);
        self.removed.remove(&key);
        self.explicit.insert(key, attr);
        Ok(())
    }

    /// The last metadata value set under `key`, or `None` after a deletion
    /// or if never set. Explicit sets render back as arrays.
    pub fn get(&self, key: &str) -> Option<Value> {
        if let Some(attr) = self.explicit.get(key) {
            return Some(serializer::from_attr(attr));
        }
        self.extra.get(key).cloned()
    }

    /// Remove a metadata field, and mark it for removal from the store on
    /// the next update.
    pub fn del(&mut self, key: &str) {
        self.extra.remove(key);
        self.explicit.remove(key);
        self.removed.insert(key.to_string());
    }

    /// True if no worker currently owns this lease.
    pub fn has_no_owner(&self) -> bool {
        self.owner.is_empty() || self.owner == NULL_OWNER
    }

    /// True if this worker has seen no counter change for longer than `ttl`.
    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.last_renewal.elapsed() > ttl
    }

    /// Per-acquisition fencing token. Changes whenever the lease is decoded
    /// from the store, so an update prepared against a lost-and-reacquired
    /// lease is rejected locally.
    pub fn concurrency_token(&self) -> &str {
        &self.concurrency_token
    }
}

pub(crate) fn new_token() -> String {
    Uuid::new_v4().to_string()
}

fn typed_set(value: Value, set_type: SetType) -> Result<AttrValue> {
    let Value::Array(items) = value else {
        return Err(Error::ValueTypeMismatch(set_type));
    };
    match set_type {
        SetType::StringSet => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => out.push(s),
                    _ => return Err(Error::ValueTypeMismatch(set_type)),
                }
            }
            Ok(AttrValue::Ss(out))
        }
        SetType::NumberSet => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Number(n) => out.push(n.to_string()),
                    _ => return Err(Error::ValueTypeMismatch(set_type)),
                }
            }
            Ok(AttrValue::Ns(out))
        }
        SetType::BinarySet => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(bytes_from(item).ok_or(Error::ValueTypeMismatch(set_type))?);
            }
            Ok(AttrValue::Bs(out))
        }
    }
}

fn bytes_from(value: Value) -> Option<Vec<u8>> {
    let Value::Array(items) = value else {
        return None;
    };
    let mut bytes = Vec::with_capacity(items.len());
    for item in items {
        let byte = item.as_u64().filter(|b| *b <= u8::MAX as u64)?;
        bytes.push(byte as u8);
    }
    Some(bytes)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::{Lease, SetType};
    use crate::error::Error;

    #[test]
    fn metadata_set_get_del() {
        let mut lease = Lease::new("foo");

        lease.set("bar", "baz");
        assert_eq!(lease.get("bar"), Some(json!("baz")));
        assert_eq!(lease.get("foo"), None);

        lease
            .set_as("bar", json!(["foo", "baz"]), SetType::StringSet)
            .unwrap();
        assert_eq!(lease.get("bar"), Some(json!(["foo", "baz"])));

        lease.del("bar");
        assert_eq!(lease.get("bar"), None);
        assert!(lease.removed.contains("bar"));

        // Setting again clears the pending removal.
        lease.set("bar", 7);
        assert!(!lease.removed.contains("bar"));
        assert_eq!(lease.get("bar"), Some(json!(7)));
    }

    #[test]
    fn set_as_rejects_mismatched_payloads() {
        let mut lease = Lease::new("foo");
        assert!(matches!(
            lease.set_as("s", json!([1, 2]), SetType::StringSet),
            Err(Error::ValueTypeMismatch(SetType::StringSet))
        ));
        assert!(matches!(
            lease.set_as("n", json!(["a"]), SetType::NumberSet),
            Err(Error::ValueTypeMismatch(SetType::NumberSet))
        ));
        assert!(matches!(
            lease.set_as("b", json!("nope"), SetType::BinarySet),
            Err(Error::ValueTypeMismatch(SetType::BinarySet))
        ));
        lease
            .set_as("b", json!([[0, 255], [1]]), SetType::BinarySet)
            .unwrap();
        assert_eq!(lease.get("b"), Some(json!([[0, 255], [1]])));
    }

    #[test]
    fn ownership_predicates() {
        let mut lease = Lease::new("foo");
        assert!(lease.has_no_owner());
        lease.owner = "NULL".to_string();
        assert!(lease.has_no_owner());
        lease.owner = "worker-1".to_string();
        assert!(!lease.has_no_owner());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_follows_last_renewal() {
        let lease = Lease::new("foo");
        assert!(!lease.is_expired(Duration::from_secs(15)));
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(lease.is_expired(Duration::from_secs(15)));
    }
}
