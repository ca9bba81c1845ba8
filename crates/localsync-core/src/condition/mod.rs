//! Condition engine
//!
//! A [`Predicate`] is an immutable tree of [`Condition`] nodes rooted at an
//! unscoped group. Trees are cheap to clone: children sit behind an `Arc`
//! and every transformation ([`Predicate::optimized`], [`Predicate::negated`])
//! builds a new tree.
//!
//! ## Evaluation paths
//!
//! - [`Predicate::matches_local`] - synchronous, for trees without relation scopes
//! - [`Predicate::matches`] - async, loads related records through an [`IRecordReader`]
//! - [`Predicate::fetch`] - compiles the tree into adapter queries and combines
//!   the per-branch results by primary key
//!
//! [`IRecordReader`]: crate::ports::IRecordReader

mod builder;
mod evaluate;
mod fetch;
mod filter;
mod transform;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{value, DomainError};

pub use builder::{FieldBuilder, PredicateBuilder};

// ============================================================================
// Tree nodes
// ============================================================================

/// Leaf comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ComparisonOperator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
    NotContains,
    BeginsWith,
    Between,
}

impl ComparisonOperator {
    /// Operator whose result is the exact complement, when one exists
    pub fn complement(self) -> Option<Self> {
        use ComparisonOperator::*;
        match self {
            Eq => Some(Ne),
            Ne => Some(Eq),
            Gt => Some(Le),
            Le => Some(Gt),
            Ge => Some(Lt),
            Lt => Some(Ge),
            Contains => Some(NotContains),
            NotContains => Some(Contains),
            BeginsWith | Between => None,
        }
    }

    pub fn operand_count(self) -> usize {
        if self == ComparisonOperator::Between {
            2
        } else {
            1
        }
    }
}

/// `field <operator> operands`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCondition {
    pub field: String,
    pub operator: ComparisonOperator,
    pub operands: Vec<Value>,
}

impl FieldCondition {
    fn validate(&self) -> Result<(), DomainError> {
        if self.operands.len() != self.operator.operand_count() {
            return Err(DomainError::InvalidPredicate(format!(
                "{:?} on {} takes {} operand(s)",
                self.operator,
                self.field,
                self.operator.operand_count()
            )));
        }
        if self.operator == ComparisonOperator::Between {
            check_range(&self.field, &self.operands[0], &self.operands[1])?;
        }
        Ok(())
    }
}

/// `between` bounds must be ordered, `low` not greater than `high`
pub(crate) fn check_range(field: &str, low: &Value, high: &Value) -> Result<(), DomainError> {
    if value::compare_values(low, high) == std::cmp::Ordering::Greater {
        return Err(DomainError::InvalidPredicate(format!(
            "between on {}: {} is greater than {}",
            field, low, high
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupOperator {
    And,
    Or,
    Not,
}

/// A boolean combination of child conditions
///
/// With `scope_field` set, the group is evaluated against the records the
/// relation field points at (on `model`, the related model) and is true when
/// any of them satisfies it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupCondition {
    pub model: String,
    pub operator: GroupOperator,
    #[serde(default)]
    pub scope_field: Option<String>,
    pub children: Arc<Vec<Condition>>,
    #[serde(default)]
    pub optimized: bool,
}

impl GroupCondition {
    pub fn new(model: impl Into<String>, operator: GroupOperator, children: Vec<Condition>) -> Self {
        Self {
            model: model.into(),
            operator,
            scope_field: None,
            children: Arc::new(children),
            optimized: false,
        }
    }

    /// Same group without its relation scope
    pub(crate) fn unscoped(&self) -> Self {
        Self {
            scope_field: None,
            ..self.clone()
        }
    }

    fn has_scope(&self) -> bool {
        self.scope_field.is_some()
            || self.children.iter().any(|c| match c {
                Condition::Group(g) => g.has_scope(),
                Condition::Field(_) => false,
            })
    }

    fn validate(&self) -> Result<(), DomainError> {
        if self.operator == GroupOperator::Not && self.children.len() != 1 {
            return Err(DomainError::InvalidPredicate(format!(
                "not group must have exactly one child, found {}",
                self.children.len()
            )));
        }
        for child in self.children.iter() {
            match child {
                Condition::Group(g) => g.validate()?,
                Condition::Field(f) => f.validate()?,
            }
        }
        Ok(())
    }
}

/// A node of the tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    Field(FieldCondition),
    Group(GroupCondition),
}

// ============================================================================
// Predicate
// ============================================================================

/// A complete condition tree for one model
///
/// Deserialization goes through [`Predicate::from_group`], so a stored or
/// received tree is held to the same rules as a built one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PredicateRepr")]
pub struct Predicate {
    root: GroupCondition,
}

#[derive(Deserialize)]
struct PredicateRepr {
    root: GroupCondition,
}

impl TryFrom<PredicateRepr> for Predicate {
    type Error = DomainError;

    fn try_from(repr: PredicateRepr) -> Result<Self, Self::Error> {
        Predicate::from_group(repr.root)
    }
}

impl Predicate {
    /// Wraps a root group, checking structural invariants
    pub fn from_group(root: GroupCondition) -> Result<Self, DomainError> {
        if root.scope_field.is_some() {
            return Err(DomainError::InvalidPredicate(
                "root group cannot be relation scoped".into(),
            ));
        }
        root.validate()?;
        Ok(Self { root })
    }

    /// `and` of `field eq value` pairs
    pub fn equalities(model: &str, pairs: Vec<(String, Value)>) -> Self {
        let children = pairs
            .into_iter()
            .map(|(field, value)| {
                Condition::Field(FieldCondition {
                    field,
                    operator: ComparisonOperator::Eq,
                    operands: vec![value],
                })
            })
            .collect();
        Self {
            root: GroupCondition::new(model, GroupOperator::And, children),
        }
    }

    pub fn root(&self) -> &GroupCondition {
        &self.root
    }

    pub fn model(&self) -> &str {
        &self.root.model
    }

    pub fn is_optimized(&self) -> bool {
        self.root.optimized
    }

    /// True when any group is relation scoped
    pub fn has_relation_scope(&self) -> bool {
        self.root.has_scope()
    }
}
