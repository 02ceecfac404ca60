//! The conditional record store the lease manager runs against.
//!
//! The store is schema-less: items are flat attribute maps keyed by the
//! lease key. Only three attributes belong to this library; everything else
//! is application metadata. Conditional puts, updates and deletes are the
//! only cross-worker synchronization primitive.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;

mod memory;

pub use memory::MemoryStore;

pub type Item = HashMap<String, AttrValue>;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A store attribute value. Scalars, documents, and the three typed-set
/// variants the metadata API distinguishes from plain lists.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    S(String),
    /// Numbers travel in decimal string form, as the store keeps them.
    N(String),
    Bool(bool),
    B(Vec<u8>),
    Null,
    L(Vec<AttrValue>),
    M(HashMap<String, AttrValue>),
    Ss(Vec<String>),
    Ns(Vec<String>),
    Bs(Vec<Vec<u8>>),
}

impl AttrValue {
    /// True for the set-typed variants, which round-trip through the
    /// explicit-field side of a lease.
    pub fn is_set(&self) -> bool {
        matches!(self, AttrValue::Ss(_) | AttrValue::Ns(_) | AttrValue::Bs(_))
    }
}

#[derive(Debug)]
pub enum StoreError {
    /// The condition expression did not hold at write time.
    ConditionalCheckFailed,
    /// The resource (table) already exists.
    ResourceInUse,
    /// Transient failure class: network errors, throttling, 5xx. Retried by
    /// the manager up to the operation cap.
    Unavailable(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::ConditionalCheckFailed => write!(f, "conditional check failed"),
            StoreError::ResourceInUse => write!(f, "resource already in use"),
            StoreError::Unavailable(reason) => write!(f, "store unavailable: {}", reason),
        }
    }
}

impl std::error::Error for StoreError {}

/// Trait for errors that may be caused by transient conditions which may
/// clear up upon retrying.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::ConditionalCheckFailed => false,
            StoreError::ResourceInUse => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateTableInput {
    pub table_name: String,
    /// Attribute name of the string hash key.
    pub hash_key: String,
    pub read_capacity: u32,
    pub write_capacity: u32,
}

#[derive(Debug, Clone)]
pub struct PutItemInput {
    pub table_name: String,
    pub item: Item,
    pub condition_expression: Option<String>,
    pub expression_attribute_names: HashMap<String, String>,
    pub expression_attribute_values: HashMap<String, AttrValue>,
}

/// Conditional attribute update. The new image of the item is returned.
#[derive(Debug, Clone)]
pub struct UpdateItemInput {
    pub table_name: String,
    pub key: Item,
    pub update_expression: String,
    pub condition_expression: Option<String>,
    pub expression_attribute_names: HashMap<String, String>,
    pub expression_attribute_values: HashMap<String, AttrValue>,
}

#[derive(Debug, Clone)]
pub struct DeleteItemInput {
    pub table_name: String,
    pub key: Item,
    pub condition_expression: Option<String>,
    pub expression_attribute_names: HashMap<String, String>,
    pub expression_attribute_values: HashMap<String, AttrValue>,
}

/// The thin set of store operations the lease manager consumes. Adapters
/// for real databases implement this; tests and the sample drivers use
/// [`MemoryStore`].
pub trait StoreClient: Clone + Send + Sync + 'static {
    /// Create the backing table. Must surface "already exists" as
    /// [`StoreError::ResourceInUse`] so callers can treat it as success.
    fn create_table(
        &self,
        input: CreateTableInput,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    /// Full scan returning every item in the table.
    fn scan(&self, table: &str) -> impl Future<Output = StoreResult<Vec<Item>>> + Send;

    /// Conditional create/replace of a whole item.
    fn put_item(&self, input: PutItemInput) -> impl Future<Output = StoreResult<()>> + Send;

    /// Conditional attribute update, returning the new item image.
    fn update_item(
        &self,
        input: UpdateItemInput,
    ) -> impl Future<Output = StoreResult<Item>> + Send;

    /// Conditional delete.
    fn delete_item(
        &self,
        input: DeleteItemInput,
    ) -> impl Future<Output = StoreResult<()>> + Send;
}
