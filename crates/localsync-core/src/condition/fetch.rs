//! Compiling condition trees into adapter queries
//!
//! `fetch` walks an optimized tree and turns each group into one or more
//! [`IRecordReader::query`] calls:
//!
//! 1. leaves of a group are compiled into a single adapter predicate,
//! 2. unscoped sub-groups are fetched recursively,
//! 3. relation-scoped sub-groups are fetched on the related model and the
//!    results translated into foreign-key equalities on the local model,
//! 4. the per-branch sets are combined by primary key: intersection for
//!    `and`, union for `or`.
//!
//! A `not` over a leaf is handed to the adapter as is (negation already sits
//! on the leaf). A `not` over a group falls back to scanning the model and
//! filtering in memory.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use super::evaluate::{body_matches, sole_child};
use super::{ComparisonOperator, Condition, FieldCondition, GroupCondition, GroupOperator, Predicate};
use crate::domain::{value, DomainError, ModelDefinition, ModelInstance, RelationKind};
use crate::ports::{IRecordReader, StorageResult};

impl Predicate {
    /// Matching records, ordered by canonical primary key.
    ///
    /// Only optimized predicates can be fetched.
    pub async fn fetch(&self, reader: &dyn IRecordReader) -> StorageResult<Vec<ModelInstance>> {
        if !self.root.optimized {
            return Err(DomainError::InvalidPredicate(
                "fetch requires an optimized predicate".into(),
            )
            .into());
        }
        let schema = reader.schema().clone();
        let def = schema.model(&self.root.model)?;
        let items = fetch_group(&self.root, reader).await?;
        sort_by_key(items, def)
    }
}

fn fetch_group<'a>(
    group: &'a GroupCondition,
    reader: &'a dyn IRecordReader,
) -> BoxFuture<'a, StorageResult<Vec<ModelInstance>>> {
    Box::pin(async move {
        let schema = reader.schema().clone();
        let def = schema.model(&group.model)?;

        if group.operator == GroupOperator::Not {
            return match sole_child(group)? {
                Condition::Field(_) => {
                    let predicate = Predicate {
                        root: group.unscoped(),
                    };
                    reader.query(&group.model, Some(&predicate), None).await
                }
                Condition::Group(_) => {
                    let mut matched = Vec::new();
                    for item in reader.query(&group.model, None, None).await? {
                        if body_matches(group, &item, reader).await? {
                            matched.push(item);
                        }
                    }
                    Ok(matched)
                }
            };
        }

        let mut sets: Vec<Vec<ModelInstance>> = Vec::new();
        let mut leaves: Vec<Condition> = Vec::new();
        for child in group.children.iter() {
            match child {
                Condition::Field(f) => leaves.push(Condition::Field(f.clone())),
                Condition::Group(sub) => match &sub.scope_field {
                    Some(field) => {
                        let related = fetch_group_owned(sub.unscoped(), reader).await?;
                        sets.push(translate_related(def, field, related, reader).await?);
                    }
                    None => sets.push(fetch_group(sub, reader).await?),
                },
            }
        }

        if !leaves.is_empty() {
            let predicate = Predicate {
                root: GroupCondition {
                    model: group.model.clone(),
                    operator: group.operator,
                    scope_field: None,
                    children: Arc::new(leaves),
                    optimized: true,
                },
            };
            sets.push(reader.query(&group.model, Some(&predicate), None).await?);
        }

        if sets.is_empty() {
            // and() is true for every record, or() for none
            return match group.operator {
                GroupOperator::Or => Ok(Vec::new()),
                _ => reader.query(&group.model, None, None).await,
            };
        }

        combine(group.operator, sets, def)
    })
}

async fn fetch_group_owned(
    group: GroupCondition,
    reader: &dyn IRecordReader,
) -> StorageResult<Vec<ModelInstance>> {
    fetch_group(&group, reader).await
}

/// Local records whose relation `field` points at one of `related`
async fn translate_related(
    def: &ModelDefinition,
    field: &str,
    related: Vec<ModelInstance>,
    reader: &dyn IRecordReader,
) -> StorageResult<Vec<ModelInstance>> {
    if related.is_empty() {
        return Ok(Vec::new());
    }
    let rel = def
        .relationship(field)
        .ok_or_else(|| DomainError::UnknownField {
            model: def.name.clone(),
            field: field.to_string(),
        })?;
    let schema = reader.schema().clone();
    let related_def = schema.model(&rel.related_model)?;

    let mut seen = HashSet::new();
    let mut branches = Vec::new();
    for item in &related {
        let pairs: Vec<(String, Value)> = match rel.kind {
            RelationKind::BelongsTo => rel
                .target_names
                .iter()
                .cloned()
                .zip(item.key_values(related_def)?)
                .collect(),
            RelationKind::HasOne | RelationKind::HasMany => def
                .primary_key
                .iter()
                .cloned()
                .zip(rel.associated_with.iter().map(|f| item.get(f).clone()))
                .collect(),
        };
        if pairs.iter().any(|(_, v)| v.is_null()) {
            continue;
        }
        let values: Vec<Value> = pairs.iter().map(|(_, v)| v.clone()).collect();
        if !seen.insert(value::key_string(&values)) {
            continue;
        }
        branches.push(Condition::Group(GroupCondition::new(
            def.name.clone(),
            GroupOperator::And,
            pairs
                .into_iter()
                .map(|(field, v)| {
                    Condition::Field(FieldCondition {
                        field,
                        operator: ComparisonOperator::Eq,
                        operands: vec![v],
                    })
                })
                .collect(),
        )));
    }
    if branches.is_empty() {
        return Ok(Vec::new());
    }

    let predicate = Predicate {
        root: GroupCondition::new(def.name.clone(), GroupOperator::Or, branches),
    };
    reader.query(&def.name, Some(&predicate), None).await
}

fn combine(
    operator: GroupOperator,
    sets: Vec<Vec<ModelInstance>>,
    def: &ModelDefinition,
) -> StorageResult<Vec<ModelInstance>> {
    let mut sets = sets.into_iter();
    let Some(first) = sets.next() else {
        return Ok(Vec::new());
    };

    match operator {
        GroupOperator::And => {
            let mut result = first;
            for set in sets {
                let keys: HashSet<String> = set
                    .iter()
                    .map(|item| item.key_string(def))
                    .collect::<Result<_, _>>()?;
                let mut kept = Vec::with_capacity(result.len());
                for item in result {
                    if keys.contains(&item.key_string(def)?) {
                        kept.push(item);
                    }
                }
                result = kept;
            }
            Ok(result)
        }
        GroupOperator::Or | GroupOperator::Not => {
            let mut seen = HashSet::new();
            let mut result = Vec::new();
            for item in std::iter::once(first).chain(sets).flatten() {
                if seen.insert(item.key_string(def)?) {
                    result.push(item);
                }
            }
            Ok(result)
        }
    }
}

fn sort_by_key(items: Vec<ModelInstance>, def: &ModelDefinition) -> StorageResult<Vec<ModelInstance>> {
    let mut keyed: HashMap<String, ModelInstance> = HashMap::with_capacity(items.len());
    for item in items {
        keyed.insert(item.key_string(def)?, item);
    }
    let mut keys: Vec<String> = keyed.keys().cloned().collect();
    keys.sort();
    Ok(keys
        .into_iter()
        .filter_map(|k| keyed.remove(&k))
        .collect())
}
