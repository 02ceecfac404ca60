//! Codec between in-memory leases and store items.
//!
//! The reserved triple travels under fixed attribute names; every other
//! attribute is application metadata. Set-typed attributes round-trip
//! through a lease's explicit fields, everything else through generic
//! marshalling of JSON values.

use serde_json::{Number, Value};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::lease::{new_token, Lease};
use crate::store::{AttrValue, Item};

// Table schema: the only attribute names this library owns.
pub(crate) const LEASE_KEY: &str = "leaseKey";
pub(crate) const LEASE_OWNER: &str = "leaseOwner";
pub(crate) const LEASE_COUNTER: &str = "leaseCounter";

pub(crate) fn is_reserved(name: &str) -> bool {
    name == LEASE_KEY || name == LEASE_OWNER || name == LEASE_COUNTER
}

/// Serialize a lease to a store item. Reserved names are scrubbed from the
/// metadata maps so application fields can never clobber the triple.
pub(crate) fn encode(lease: &Lease) -> Item {
    let mut item = Item::new();
    item.insert(LEASE_KEY.to_string(), AttrValue::S(lease.key.clone()));
    item.insert(LEASE_OWNER.to_string(), AttrValue::S(lease.owner.clone()));
    item.insert(
        LEASE_COUNTER.to_string(),
        AttrValue::N(lease.counter.to_string()),
    );
    for (name, value) in &lease.extra {
        if !is_reserved(name) {
            item.insert(name.clone(), to_attr(value));
        }
    }
    for (name, attr) in &lease.explicit {
        if !is_reserved(name) {
            item.insert(name.clone(), attr.clone());
        }
    }
    item
}

/// Deserialize a store item. Stamps `last_renewal` with the current time
/// and mints a fresh concurrency token, so every decode is a distinct
/// acquisition from the caller's point of view.
pub(crate) fn decode(item: &Item) -> Result<Lease> {
    let key = match item.get(LEASE_KEY) {
        Some(AttrValue::S(key)) if !key.is_empty() => key.clone(),
        _ => {
            return Err(Error::Codec(format!(
                "item is missing a string {} attribute",
                LEASE_KEY
            )))
        }
    };
    let owner = match item.get(LEASE_OWNER) {
        Some(AttrValue::S(owner)) => owner.clone(),
        _ => String::new(),
    };
    let counter = match item.get(LEASE_COUNTER) {
        Some(AttrValue::N(counter)) => counter.parse().unwrap_or(0),
        _ => 0,
    };

    let mut lease = Lease::new(key);
    lease.owner = owner;
    lease.counter = counter;
    lease.last_renewal = Instant::now();
    lease.concurrency_token = new_token();

    for (name, attr) in item {
        if is_reserved(name) {
            continue;
        }
        if attr.is_set() {
            lease.explicit.insert(name.clone(), attr.clone());
        } else {
            lease.extra.insert(name.clone(), from_attr(attr));
        }
    }
    Ok(lease)
}

/// Generic marshalling of a JSON value into a store attribute.
pub(crate) fn to_attr(value: &Value) -> AttrValue {
    match value {
        Value::Null => AttrValue::Null,
        Value::Bool(b) => AttrValue::Bool(*b),
        Value::Number(n) => AttrValue::N(n.to_string()),
        Value::String(s) => AttrValue::S(s.clone()),
        Value::Array(items) => AttrValue::L(items.iter().map(to_attr).collect()),
        Value::Object(fields) => AttrValue::M(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), to_attr(v)))
                .collect(),
        ),
    }
}

/// Generic unmarshalling. Sets render as arrays, binary as byte arrays.
pub(crate) fn from_attr(attr: &AttrValue) -> Value {
    match attr {
        AttrValue::S(s) => Value::String(s.clone()),
        AttrValue::N(n) => parse_number(n),
        AttrValue::Bool(b) => Value::Bool(*b),
        AttrValue::B(bytes) => bytes_value(bytes),
        AttrValue::Null => Value::Null,
        AttrValue::L(items) => Value::Array(items.iter().map(from_attr).collect()),
        AttrValue::M(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), from_attr(v)))
                .collect(),
        ),
        AttrValue::Ss(items) => {
            Value::Array(items.iter().cloned().map(Value::String).collect())
        }
        AttrValue::Ns(items) => Value::Array(items.iter().map(|n| parse_number(n)).collect()),
        AttrValue::Bs(items) => Value::Array(items.iter().map(|b| bytes_value(b)).collect()),
    }
}

fn parse_number(s: &str) -> Value {
    if let Ok(n) = s.parse::<i64>() {
        return Value::Number(n.into());
    }
    if let Ok(n) = s.parse::<u64>() {
        return Value::Number(n.into());
    }
    match s.parse::<f64>().ok().and_then(Number::from_f64) {
        Some(n) => Value::Number(n),
        // Not a representable number; keep the raw text rather than drop it.
        None => Value::String(s.to_string()),
    }
}

fn bytes_value(bytes: &[u8]) -> Value {
    Value::Array(bytes.iter().map(|b| Value::Number((*b).into())).collect())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::lease::SetType;
    use crate::store::AttrValue;

    #[test]
    fn round_trips_reserved_triple_and_metadata() {
        let mut lease = Lease::new("task-1");
        lease.owner = "worker-a".to_string();
        lease.counter = 42;
        lease.set("status", "running");
        lease.set("attempts", 3);
        lease.set("detail", json!({"host": "i-0abc", "ports": [80, 443]}));
        lease
            .set_as("results", json!(["200", "404"]), SetType::StringSet)
            .unwrap();

        let item = encode(&lease);
        assert_eq!(item.get(LEASE_KEY), Some(&AttrValue::S("task-1".to_string())));
        assert_eq!(
            item.get(LEASE_COUNTER),
            Some(&AttrValue::N("42".to_string()))
        );

        let decoded = decode(&item).unwrap();
        assert_eq!(decoded.key, "task-1");
        assert_eq!(decoded.owner, "worker-a");
        assert_eq!(decoded.counter, 42);
        assert_eq!(decoded.get("status"), Some(json!("running")));
        assert_eq!(decoded.get("attempts"), Some(json!(3)));
        assert_eq!(
            decoded.get("detail"),
            Some(json!({"host": "i-0abc", "ports": [80, 443]}))
        );
        // The string set survives as an explicit field, not a generic list.
        assert_eq!(decoded.get("results"), Some(json!(["200", "404"])));
        assert!(decoded.explicit.contains_key("results"));
        assert!(!decoded.extra.contains_key("results"));
    }

    #[test]
    fn reserved_names_cannot_be_overwritten_by_metadata() {
        let mut lease = Lease::new("task-1");
        lease.owner = "worker-a".to_string();
        lease.counter = 7;
        lease.set(LEASE_KEY, "evil");
        lease.set(LEASE_OWNER, "evil");
        lease
            .set_as(LEASE_COUNTER, json!(["9"]), SetType::StringSet)
            .unwrap();

        let item = encode(&lease);
        assert_eq!(item.get(LEASE_KEY), Some(&AttrValue::S("task-1".to_string())));
        assert_eq!(
            item.get(LEASE_OWNER),
            Some(&AttrValue::S("worker-a".to_string()))
        );
        assert_eq!(item.get(LEASE_COUNTER), Some(&AttrValue::N("7".to_string())));
    }

    #[test]
    fn decode_mints_a_fresh_token_each_time() {
        let item = encode(&Lease::new("task-1"));
        let first = decode(&item).unwrap();
        let second = decode(&item).unwrap();
        assert_ne!(first.concurrency_token(), second.concurrency_token());
    }

    #[test]
    fn decode_without_key_is_an_error() {
        let mut item = encode(&Lease::new("task-1"));
        item.remove(LEASE_KEY);
        assert!(matches!(decode(&item), Err(Error::Codec(_))));
    }

    #[test]
    fn missing_owner_and_counter_default() {
        let mut item = Item::new();
        item.insert(LEASE_KEY.to_string(), AttrValue::S("bare".to_string()));
        let lease = decode(&item).unwrap();
        assert!(lease.has_no_owner());
        assert_eq!(lease.counter, 0);
    }
}
