//! Remote filter representation
//!
//! Trees serialize to the GraphQL filter input shape the remote service
//! understands, e.g. `{"and": [{"title": {"eq": "A"}}]}`. The same JSON is
//! stored as a mutation's condition and hashed to detect sync-expression
//! changes between runs.

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use super::{ComparisonOperator, Condition, FieldCondition, GroupCondition, GroupOperator, Predicate};

impl Predicate {
    pub fn to_filter(&self) -> Value {
        group_filter(&self.root)
    }

    /// Hex SHA-256 of the filter JSON
    pub fn filter_hash(&self) -> String {
        format!("{:x}", Sha256::digest(self.to_filter().to_string().as_bytes()))
    }
}

fn operator_key(operator: ComparisonOperator) -> &'static str {
    match operator {
        ComparisonOperator::Eq => "eq",
        ComparisonOperator::Ne => "ne",
        ComparisonOperator::Gt => "gt",
        ComparisonOperator::Ge => "ge",
        ComparisonOperator::Lt => "lt",
        ComparisonOperator::Le => "le",
        ComparisonOperator::Contains => "contains",
        ComparisonOperator::NotContains => "notContains",
        ComparisonOperator::BeginsWith => "beginsWith",
        ComparisonOperator::Between => "between",
    }
}

fn field_filter(field: &FieldCondition) -> Value {
    let operand = if field.operator == ComparisonOperator::Between {
        Value::Array(field.operands.clone())
    } else {
        field.operands.first().cloned().unwrap_or(Value::Null)
    };
    let mut inner = Map::new();
    inner.insert(operator_key(field.operator).to_string(), operand);
    let mut outer = Map::new();
    outer.insert(field.field.clone(), Value::Object(inner));
    Value::Object(outer)
}

fn condition_filter(condition: &Condition) -> Value {
    match condition {
        Condition::Field(f) => field_filter(f),
        Condition::Group(g) => group_filter(g),
    }
}

fn group_filter(group: &GroupCondition) -> Value {
    let children: Vec<Value> = group.children.iter().map(condition_filter).collect();
    let body = match group.operator {
        GroupOperator::And => json!({ "and": children }),
        GroupOperator::Or => json!({ "or": children }),
        GroupOperator::Not => json!({ "not": children.into_iter().next().unwrap_or(Value::Null) }),
    };
    match &group.scope_field {
        Some(field) => {
            let mut scoped = Map::new();
            scoped.insert(field.clone(), body);
            Value::Object(scoped)
        }
        None => body,
    }
}
