//! Query planning and execution over the record store
//!
//! The planner inspects an unscoped predicate and picks the cheapest access
//! path the store offers:
//!
//! - **PointLookup** when every primary-key field is pinned by an `eq`
//!   in the top-level conjunction
//! - **IndexScan / Intersect** when one or more indexes are fully pinned by
//!   `eq` leaves of the conjunction
//! - **IndexScan / Union** when the root is an `or` of at most
//!   `union_breakpoint` branches and each branch pins an index (or the key)
//! - **FullScan** otherwise
//!
//! Whatever the plan, candidates are re-checked against the full predicate,
//! so a plan only narrows the scan and never changes the result.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteConnection;

use localsync_core::condition::{ComparisonOperator, Condition, GroupCondition, GroupOperator, Predicate};
use localsync_core::domain::{value, ModelDefinition, ModelInstance};
use localsync_core::ports::{Pagination, StorageResult};

use crate::{store, CacheError};

/// How index lookups of one plan are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexStrategy {
    Intersect,
    Union,
}

/// One keyed lookup; `index: None` means the primary key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexLookup {
    pub index: Option<String>,
    pub key: String,
}

/// Access path chosen for a query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryPlan {
    FullScan,
    PointLookup {
        key: String,
    },
    IndexScan {
        strategy: IndexStrategy,
        lookups: Vec<IndexLookup>,
    },
}

// ============================================================================
// Planning
// ============================================================================

/// Picks the access path for `predicate` on `def`
pub fn plan_query(
    def: &ModelDefinition,
    predicate: Option<&Predicate>,
    union_breakpoint: usize,
) -> QueryPlan {
    let Some(predicate) = predicate else {
        return QueryPlan::FullScan;
    };
    let group = effective_group(predicate.root());

    match group.operator {
        GroupOperator::And => {
            let pinned = pinned_fields(group);
            if let Some(key) = key_lookup(def, &pinned) {
                return QueryPlan::PointLookup { key };
            }
            let lookups: Vec<IndexLookup> = def
                .indexes
                .iter()
                .filter_map(|index| {
                    pin_all(&index.fields, &pinned).map(|key| IndexLookup {
                        index: Some(index.name.clone()),
                        key,
                    })
                })
                .collect();
            if lookups.is_empty() {
                QueryPlan::FullScan
            } else {
                QueryPlan::IndexScan {
                    strategy: IndexStrategy::Intersect,
                    lookups,
                }
            }
        }
        GroupOperator::Or => {
            if group.children.is_empty() || group.children.len() > union_breakpoint {
                return QueryPlan::FullScan;
            }
            let mut lookups = Vec::with_capacity(group.children.len());
            for child in group.children.iter() {
                let pinned = match child {
                    Condition::Field(f) if f.operator == ComparisonOperator::Eq => {
                        let mut pinned = HashMap::new();
                        if let Some(v) = f.operands.first() {
                            pinned.insert(f.field.as_str(), v);
                        }
                        pinned
                    }
                    Condition::Group(g)
                        if g.scope_field.is_none() && g.operator == GroupOperator::And =>
                    {
                        pinned_fields(g)
                    }
                    _ => return QueryPlan::FullScan,
                };
                match branch_lookup(def, &pinned) {
                    Some(lookup) => lookups.push(lookup),
                    None => return QueryPlan::FullScan,
                }
            }
            QueryPlan::IndexScan {
                strategy: IndexStrategy::Union,
                lookups,
            }
        }
        GroupOperator::Not => QueryPlan::FullScan,
    }
}

/// Descends through single-child `and`/`or` wrappers
fn effective_group(mut group: &GroupCondition) -> &GroupCondition {
    while group.operator != GroupOperator::Not && group.children.len() == 1 {
        match &group.children[0] {
            Condition::Group(inner)
                if inner.scope_field.is_none() && inner.operator != GroupOperator::Not =>
            {
                group = inner;
            }
            _ => break,
        }
    }
    group
}

/// Fields pinned by `eq` leaves of a conjunction, including nested `and`s
fn pinned_fields(group: &GroupCondition) -> HashMap<&str, &Value> {
    let mut pinned = HashMap::new();
    collect_pinned(group, &mut pinned);
    pinned
}

fn collect_pinned<'a>(group: &'a GroupCondition, pinned: &mut HashMap<&'a str, &'a Value>) {
    let conjunctive = group.operator == GroupOperator::And
        || (group.operator == GroupOperator::Or && group.children.len() == 1);
    if !conjunctive || group.scope_field.is_some() {
        return;
    }
    for child in group.children.iter() {
        match child {
            Condition::Field(f) if f.operator == ComparisonOperator::Eq => {
                if let Some(v) = f.operands.first() {
                    pinned.entry(f.field.as_str()).or_insert(v);
                }
            }
            Condition::Group(g) => collect_pinned(g, pinned),
            Condition::Field(_) => {}
        }
    }
}

fn pin_all(fields: &[String], pinned: &HashMap<&str, &Value>) -> Option<String> {
    let values: Option<Vec<Value>> = fields
        .iter()
        .map(|f| pinned.get(f.as_str()).map(|v| (*v).clone()))
        .collect();
    values.map(|v| value::key_string(&v))
}

fn key_lookup(def: &ModelDefinition, pinned: &HashMap<&str, &Value>) -> Option<String> {
    pin_all(&def.primary_key, pinned)
}

fn branch_lookup(def: &ModelDefinition, pinned: &HashMap<&str, &Value>) -> Option<IndexLookup> {
    if let Some(key) = key_lookup(def, pinned) {
        return Some(IndexLookup { index: None, key });
    }
    def.indexes.iter().find_map(|index| {
        pin_all(&index.fields, pinned).map(|key| IndexLookup {
            index: Some(index.name.clone()),
            key,
        })
    })
}

// ============================================================================
// Execution
// ============================================================================

/// Runs a query: plan, fetch candidates, re-filter, order and page
pub(crate) async fn run_query(
    conn: &mut SqliteConnection,
    def: &ModelDefinition,
    predicate: Option<&Predicate>,
    pagination: Option<&Pagination>,
    union_breakpoint: usize,
) -> StorageResult<Vec<ModelInstance>> {
    // Unfiltered, unsorted pages are paged by SQLite directly
    if predicate.is_none() {
        if let Some(page) = pagination {
            if let (Some(limit), true) = (page.limit, page.sort.is_empty()) {
                return Ok(store::scan_page(conn, &def.name, limit, page.offset()).await?);
            }
        }
    }

    let plan = plan_query(def, predicate, union_breakpoint);
    tracing::trace!(model = %def.name, ?plan, "Executing query plan");

    let candidates = execute_plan(conn, def, &plan).await?;

    let mut matched = Vec::with_capacity(candidates.len());
    for (_, item) in candidates {
        let keep = match predicate {
            Some(p) => p.matches_local(&item)?,
            None => true,
        };
        if keep {
            matched.push(item);
        }
    }

    Ok(match pagination {
        Some(page) => page.apply(matched),
        None => matched,
    })
}

/// Candidate records keyed (and thus ordered) by primary key
async fn execute_plan(
    conn: &mut SqliteConnection,
    def: &ModelDefinition,
    plan: &QueryPlan,
) -> Result<BTreeMap<String, ModelInstance>, CacheError> {
    let mut keyed = BTreeMap::new();
    match plan {
        QueryPlan::FullScan => {
            for item in store::scan(conn, &def.name).await? {
                insert_keyed(def, &mut keyed, item);
            }
        }
        QueryPlan::PointLookup { key } => {
            if let Some(item) = store::get_record(conn, &def.name, key).await? {
                keyed.insert(key.clone(), item);
            }
        }
        QueryPlan::IndexScan { strategy, lookups } => {
            let mut first = true;
            for lookup in lookups {
                let mut found = BTreeMap::new();
                match &lookup.index {
                    None => {
                        if let Some(item) = store::get_record(conn, &def.name, &lookup.key).await? {
                            found.insert(lookup.key.clone(), item);
                        }
                    }
                    Some(index) => {
                        for item in store::index_lookup(conn, &def.name, index, &lookup.key).await? {
                            insert_keyed(def, &mut found, item);
                        }
                    }
                }
                match strategy {
                    IndexStrategy::Union => keyed.extend(found),
                    IndexStrategy::Intersect if first => keyed = found,
                    IndexStrategy::Intersect => keyed.retain(|k, _| found.contains_key(k)),
                }
                first = false;
            }
        }
    }
    Ok(keyed)
}

fn insert_keyed(def: &ModelDefinition, keyed: &mut BTreeMap<String, ModelInstance>, item: ModelInstance) {
    match item.key_string(def) {
        Ok(key) => {
            keyed.insert(key, item);
        }
        Err(e) => tracing::warn!(model = %def.name, error = %e, "Skipping stored record without key"),
    }
}
