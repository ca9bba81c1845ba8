//! In-memory evaluation of condition trees

use futures_util::future::BoxFuture;
use serde_json::Value;

use super::{ComparisonOperator, Condition, FieldCondition, GroupCondition, GroupOperator, Predicate};
use crate::domain::{value, DomainError, ModelInstance};
use crate::ports::{IRecordReader, StorageResult};

impl FieldCondition {
    /// Applies the operator to a field value (`null` when absent)
    pub fn evaluate(&self, field_value: &Value) -> bool {
        let operand = self.operands.first().unwrap_or(&Value::Null);
        match self.operator {
            ComparisonOperator::Eq => value::values_equal(field_value, operand),
            ComparisonOperator::Ne => !value::values_equal(field_value, operand),
            ComparisonOperator::Gt => value::compare_values(field_value, operand).is_gt(),
            ComparisonOperator::Ge => value::compare_values(field_value, operand).is_ge(),
            ComparisonOperator::Lt => value::compare_values(field_value, operand).is_lt(),
            ComparisonOperator::Le => value::compare_values(field_value, operand).is_le(),
            ComparisonOperator::Contains => value::contains(field_value, operand),
            ComparisonOperator::NotContains => !value::contains(field_value, operand),
            ComparisonOperator::BeginsWith => value::begins_with(field_value, operand),
            ComparisonOperator::Between => {
                let high = self.operands.get(1).unwrap_or(&Value::Null);
                value::compare_values(field_value, operand).is_ge()
                    && value::compare_values(field_value, high).is_le()
            }
        }
    }
}

impl Predicate {
    /// Synchronous match for trees without relation scopes
    pub fn matches_local(&self, item: &ModelInstance) -> Result<bool, DomainError> {
        group_matches_local(&self.root, item)
    }

    /// Full match, loading related records through `reader`
    pub async fn matches(
        &self,
        item: &ModelInstance,
        reader: &dyn IRecordReader,
    ) -> StorageResult<bool> {
        group_matches(&self.root, item, reader).await
    }
}

fn group_matches_local(group: &GroupCondition, item: &ModelInstance) -> Result<bool, DomainError> {
    if let Some(field) = &group.scope_field {
        return Err(DomainError::InvalidPredicate(format!(
            "condition on relation {} needs a record reader",
            field
        )));
    }
    let child = |c: &Condition| match c {
        Condition::Field(f) => Ok(f.evaluate(item.get(&f.field))),
        Condition::Group(g) => group_matches_local(g, item),
    };
    match group.operator {
        GroupOperator::And => {
            for c in group.children.iter() {
                if !child(c)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        GroupOperator::Or => {
            for c in group.children.iter() {
                if child(c)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        GroupOperator::Not => Ok(!child(sole_child(group)?)?),
    }
}

pub(super) fn sole_child(group: &GroupCondition) -> Result<&Condition, DomainError> {
    match group.children.as_slice() {
        [only] => Ok(only),
        _ => Err(DomainError::InvalidPredicate(format!(
            "not group must have exactly one child, found {}",
            group.children.len()
        ))),
    }
}

pub(super) fn group_matches<'a>(
    group: &'a GroupCondition,
    item: &'a ModelInstance,
    reader: &'a dyn IRecordReader,
) -> BoxFuture<'a, StorageResult<bool>> {
    Box::pin(async move {
        match &group.scope_field {
            Some(field) => {
                // HAS_MANY matches if any related record does
                for related in reader.load_related(item, field).await?.into_vec() {
                    if body_matches(group, &related, reader).await? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            None => body_matches(group, item, reader).await,
        }
    })
}

/// Evaluates the group's operator over its children, ignoring its scope
pub(super) fn body_matches<'a>(
    group: &'a GroupCondition,
    item: &'a ModelInstance,
    reader: &'a dyn IRecordReader,
) -> BoxFuture<'a, StorageResult<bool>> {
    Box::pin(async move {
        match group.operator {
            GroupOperator::And => {
                for c in group.children.iter() {
                    if !child_matches(c, item, reader).await? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            GroupOperator::Or => {
                for c in group.children.iter() {
                    if child_matches(c, item, reader).await? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            GroupOperator::Not => {
                let only = sole_child(group)?;
                Ok(!child_matches(only, item, reader).await?)
            }
        }
    })
}

async fn child_matches(
    condition: &Condition,
    item: &ModelInstance,
    reader: &dyn IRecordReader,
) -> StorageResult<bool> {
    match condition {
        Condition::Field(f) => Ok(f.evaluate(item.get(&f.field))),
        Condition::Group(g) => group_matches(g, item, reader).await,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn leaf(operator: ComparisonOperator, operands: Vec<Value>) -> FieldCondition {
        FieldCondition {
            field: "v".into(),
            operator,
            operands,
        }
    }

    fn item(v: Value) -> ModelInstance {
        ModelInstance::from_value("Post", json!({"id": "1", "v": v})).unwrap()
    }

    #[test]
    fn test_field_operators() {
        let cases = [
            (ComparisonOperator::Eq, vec![json!(3)], json!(3.0), true),
            (ComparisonOperator::Ne, vec![json!(3)], json!(null), true),
            (ComparisonOperator::Gt, vec![json!(3)], json!(4), true),
            (ComparisonOperator::Ge, vec![json!(3)], json!(3), true),
            (ComparisonOperator::Lt, vec![json!("b")], json!("a"), true),
            (ComparisonOperator::Le, vec![json!("b")], json!("c"), false),
            (ComparisonOperator::Contains, vec![json!("ell")], json!("hello"), true),
            (ComparisonOperator::NotContains, vec![json!("x")], json!(["x"]), false),
            (ComparisonOperator::BeginsWith, vec![json!("he")], json!("hello"), true),
            (ComparisonOperator::Between, vec![json!(1), json!(5)], json!(5), true),
            (ComparisonOperator::Between, vec![json!(1), json!(5)], json!(6), false),
        ];
        for (op, operands, value, expected) in cases {
            assert_eq!(
                leaf(op, operands.clone()).evaluate(&value),
                expected,
                "{op:?} {operands:?} on {value}"
            );
        }
    }

    #[test]
    fn test_empty_groups() {
        let and = Predicate::from_group(GroupCondition::new("Post", GroupOperator::And, vec![])).unwrap();
        let or = Predicate::from_group(GroupCondition::new("Post", GroupOperator::Or, vec![])).unwrap();
        assert!(and.matches_local(&item(json!(1))).unwrap());
        assert!(!or.matches_local(&item(json!(1))).unwrap());
    }

    #[test]
    fn test_scoped_group_needs_reader() {
        let mut scoped = GroupCondition::new("Comment", GroupOperator::And, vec![]);
        scoped.scope_field = Some("comments".into());
        let root = GroupCondition::new("Post", GroupOperator::And, vec![Condition::Group(scoped)]);
        let p = Predicate::from_group(root).unwrap();
        assert!(p.matches_local(&item(json!(1))).is_err());
    }
}
