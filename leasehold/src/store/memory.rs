//! In-memory [`StoreClient`] with serialized conditional semantics.
//!
//! One mutex guards all tables, so every conditional write observes a
//! consistent snapshot. This is the store behind the unit and end-to-end
//! tests and the example drivers; real deployments implement [`StoreClient`]
//! against an actual database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{
    AttrValue, CreateTableInput, DeleteItemInput, Item, PutItemInput, StoreClient, StoreError,
    StoreResult, UpdateItemInput,
};

#[derive(Default)]
struct Table {
    hash_key: String,
    rows: HashMap<String, Item>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<HashMap<String, Table>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreClient for MemoryStore {
    async fn create_table(&self, input: CreateTableInput) -> StoreResult<()> {
        let mut tables = self.tables.lock().unwrap();
        if tables.contains_key(&input.table_name) {
            return Err(StoreError::ResourceInUse);
        }
        tables.insert(
            input.table_name,
            Table {
                hash_key: input.hash_key,
                rows: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn scan(&self, table: &str) -> StoreResult<Vec<Item>> {
        let tables = self.tables.lock().unwrap();
        let table = tables
            .get(table)
            .ok_or_else(|| StoreError::Unavailable(format!("no such table: {}", table)))?;
        Ok(table.rows.values().cloned().collect())
    }

    async fn put_item(&self, input: PutItemInput) -> StoreResult<()> {
        let mut tables = self.tables.lock().unwrap();
        let table = tables
            .get_mut(&input.table_name)
            .ok_or_else(|| StoreError::Unavailable(format!("no such table: {}", input.table_name)))?;
        let key = key_string(&input.item, &table.hash_key)?;
        if let Some(expr) = &input.condition_expression {
            let held = eval_condition(
                expr,
                table.rows.get(&key),
                &input.expression_attribute_names,
                &input.expression_attribute_values,
            )?;
            if !held {
                return Err(StoreError::ConditionalCheckFailed);
            }
        }
        table.rows.insert(key, input.item);
        Ok(())
    }

    async fn update_item(&self, input: UpdateItemInput) -> StoreResult<Item> {
        let mut tables = self.tables.lock().unwrap();
        let table = tables
            .get_mut(&input.table_name)
            .ok_or_else(|| StoreError::Unavailable(format!("no such table: {}", input.table_name)))?;
        let hash_key = table.hash_key.clone();
        let key = key_string(&input.key, &hash_key)?;
        if let Some(expr) = &input.condition_expression {
            let held = eval_condition(
                expr,
                table.rows.get(&key),
                &input.expression_attribute_names,
                &input.expression_attribute_values,
            )?;
            if !held {
                return Err(StoreError::ConditionalCheckFailed);
            }
        }
        let mut item = match table.rows.get(&key) {
            Some(existing) => existing.clone(),
            // Upsert semantics: an update against a missing row creates it.
            None => input.key.clone(),
        };
        apply_update(
            &input.update_expression,
            &mut item,
            &input.expression_attribute_values,
        )?;
        table.rows.insert(key, item.clone());
        Ok(item)
    }

    async fn delete_item(&self, input: DeleteItemInput) -> StoreResult<()> {
        let mut tables = self.tables.lock().unwrap();
        let table = tables
            .get_mut(&input.table_name)
            .ok_or_else(|| StoreError::Unavailable(format!("no such table: {}", input.table_name)))?;
        let hash_key = table.hash_key.clone();
        let key = key_string(&input.key, &hash_key)?;
        if let Some(expr) = &input.condition_expression {
            let held = eval_condition(
                expr,
                table.rows.get(&key),
                &input.expression_attribute_names,
                &input.expression_attribute_values,
            )?;
            if !held {
                return Err(StoreError::ConditionalCheckFailed);
            }
        }
        table.rows.remove(&key);
        Ok(())
    }
}

fn key_string(item: &Item, hash_key: &str) -> StoreResult<String> {
    match item.get(hash_key) {
        Some(AttrValue::S(s)) => Ok(s.clone()),
        _ => Err(StoreError::Unavailable(format!(
            "item is missing string hash key {:?}",
            hash_key
        ))),
    }
}

/// Evaluate the condition grammar this library emits: equality between
/// `#name` / `:value` operands and `attribute_not_exists(#name)` atoms,
/// joined by `AND` / `OR`, with an optional parenthesized `AND` group.
fn eval_condition(
    expr: &str,
    item: Option<&Item>,
    names: &HashMap<String, String>,
    values: &HashMap<String, AttrValue>,
) -> StoreResult<bool> {
    for branch in expr.split(" OR ") {
        let branch = branch.trim();
        let branch = branch
            .strip_prefix('(')
            .and_then(|b| b.strip_suffix(')'))
            .unwrap_or(branch);
        let mut held = true;
        for atom in branch.split(" AND ") {
            if !eval_atom(atom.trim(), item, names, values)? {
                held = false;
                break;
            }
        }
        if held {
            return Ok(true);
        }
    }
    Ok(false)
}

fn eval_atom(
    atom: &str,
    item: Option<&Item>,
    names: &HashMap<String, String>,
    values: &HashMap<String, AttrValue>,
) -> StoreResult<bool> {
    if let Some(inner) = atom
        .strip_prefix("attribute_not_exists(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        let attr = resolve_name(inner.trim(), names)?;
        return Ok(item.map_or(true, |i| !i.contains_key(&attr)));
    }
    let (lhs, rhs) = atom
        .split_once('=')
        .ok_or_else(|| unsupported(atom))?;
    let lhs = resolve_operand(lhs.trim(), item, names, values)?;
    let rhs = resolve_operand(rhs.trim(), item, names, values)?;
    Ok(match (lhs, rhs) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    })
}

fn resolve_name(token: &str, names: &HashMap<String, String>) -> StoreResult<String> {
    if token.starts_with('#') {
        names
            .get(token)
            .cloned()
            .ok_or_else(|| unsupported(token))
    } else {
        Ok(token.to_string())
    }
}

fn resolve_operand<'a>(
    token: &str,
    item: Option<&'a Item>,
    names: &HashMap<String, String>,
    values: &'a HashMap<String, AttrValue>,
) -> StoreResult<Option<&'a AttrValue>> {
    if token.starts_with(':') {
        return values.get(token).map(Some).ok_or_else(|| unsupported(token));
    }
    let attr = resolve_name(token, names)?;
    Ok(item.and_then(|i| i.get(&attr)))
}

/// Apply a `SET a = :a, b = :b` / `REMOVE c, d` update expression.
fn apply_update(
    expr: &str,
    item: &mut Item,
    values: &HashMap<String, AttrValue>,
) -> StoreResult<()> {
    let expr = expr.trim();
    let (set_part, remove_part) = if let Some(idx) = expr.find(" REMOVE ") {
        (expr[..idx].trim(), Some(expr[idx + " REMOVE ".len()..].trim()))
    } else if let Some(rest) = expr.strip_prefix("REMOVE ") {
        ("", Some(rest.trim()))
    } else {
        (expr, None)
    };
    if let Some(assignments) = set_part.strip_prefix("SET") {
        for assignment in assignments.split(',') {
            let (name, value_ref) = assignment
                .split_once('=')
                .ok_or_else(|| unsupported(assignment))?;
            let value = values
                .get(value_ref.trim())
                .ok_or_else(|| unsupported(value_ref))?;
            item.insert(name.trim().to_string(), value.clone());
        }
    } else if !set_part.is_empty() {
        return Err(unsupported(set_part));
    }
    if let Some(removals) = remove_part {
        for name in removals.split(',') {
            item.remove(name.trim());
        }
    }
    Ok(())
}

fn unsupported(fragment: &str) -> StoreError {
    StoreError::Unavailable(format!("unsupported expression fragment: {:?}", fragment))
}
