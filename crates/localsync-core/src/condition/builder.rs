//! Typed builder for predicate trees

use std::sync::Arc;

use serde_json::Value;

use super::{ComparisonOperator, Condition, FieldCondition, GroupCondition, GroupOperator, Predicate};
use crate::domain::{
    DomainError, ModelDefinition, Schema, DELETED_FIELD, LAST_CHANGED_AT_FIELD, VERSION_FIELD,
};

const SYNC_FIELDS: [&str; 3] = [VERSION_FIELD, LAST_CHANGED_AT_FIELD, DELETED_FIELD];

/// Collects the children of one group
///
/// ```
/// # use std::sync::Arc;
/// # use localsync_core::condition::PredicateBuilder;
/// # use localsync_core::domain::{FieldDefinition, ModelDefinition, ScalarType, Schema};
/// # fn main() -> Result<(), localsync_core::domain::DomainError> {
/// let post = ModelDefinition::builder("Post")
///     .field(FieldDefinition::scalar("id", ScalarType::Id))
///     .field(FieldDefinition::scalar("title", ScalarType::String))
///     .build();
/// let schema = Arc::new(Schema::new("user", "1", vec![post])?);
///
/// let predicate = PredicateBuilder::new(&schema, "Post")?
///     .field("title")?
///     .begins_with("Hello")
///     .or(|b| Ok(b.field("id")?.eq("1").field("id")?.eq("2")))?
///     .build();
/// assert_eq!(predicate.root().children.len(), 2);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct PredicateBuilder {
    schema: Arc<Schema>,
    def: Arc<ModelDefinition>,
    children: Vec<Condition>,
}

impl PredicateBuilder {
    pub fn new(schema: &Arc<Schema>, model: &str) -> Result<Self, DomainError> {
        let def = schema.model(model)?.clone();
        Ok(Self {
            schema: schema.clone(),
            def,
            children: Vec::new(),
        })
    }

    /// Predicate matching every record of `model`
    pub fn all(schema: &Arc<Schema>, model: &str) -> Result<Predicate, DomainError> {
        Ok(Self::new(schema, model)?.build())
    }

    /// Predicate pinning every primary-key field
    pub fn by_key(
        schema: &Arc<Schema>,
        model: &str,
        key: Vec<Value>,
    ) -> Result<Predicate, DomainError> {
        let def = schema.model(model)?;
        if key.len() != def.primary_key.len() {
            return Err(DomainError::InvalidPredicate(format!(
                "{} has {} key field(s), got {} value(s)",
                model,
                def.primary_key.len(),
                key.len()
            )));
        }
        Ok(Predicate::equalities(
            model,
            def.primary_key.iter().cloned().zip(key).collect(),
        ))
    }

    /// Accessor for a scalar field
    pub fn field(self, name: &str) -> Result<FieldBuilder, DomainError> {
        if !self.def.is_scalar_field(name) && !SYNC_FIELDS.contains(&name) {
            return Err(DomainError::UnknownField {
                model: self.def.name.clone(),
                field: name.to_string(),
            });
        }
        Ok(FieldBuilder {
            parent: self,
            field: name.to_string(),
        })
    }

    /// Nested conditions over the records a relation field points at
    pub fn related<F>(mut self, name: &str, build: F) -> Result<Self, DomainError>
    where
        F: FnOnce(PredicateBuilder) -> Result<PredicateBuilder, DomainError>,
    {
        let rel = self
            .def
            .relationship(name)
            .ok_or_else(|| DomainError::UnknownField {
                model: self.def.name.clone(),
                field: name.to_string(),
            })?;
        let nested = build(PredicateBuilder::new(&self.schema, &rel.related_model)?)?;
        let mut group = nested.into_group(GroupOperator::And);
        group.scope_field = Some(name.to_string());
        self.children.push(Condition::Group(group));
        Ok(self)
    }

    pub fn and<F>(self, build: F) -> Result<Self, DomainError>
    where
        F: FnOnce(PredicateBuilder) -> Result<PredicateBuilder, DomainError>,
    {
        self.nested(GroupOperator::And, build)
    }

    pub fn or<F>(self, build: F) -> Result<Self, DomainError>
    where
        F: FnOnce(PredicateBuilder) -> Result<PredicateBuilder, DomainError>,
    {
        self.nested(GroupOperator::Or, build)
    }

    /// Negates the conjunction of the conditions built in `build`
    pub fn not<F>(mut self, build: F) -> Result<Self, DomainError>
    where
        F: FnOnce(PredicateBuilder) -> Result<PredicateBuilder, DomainError>,
    {
        let nested = build(self.child())?;
        let mut children = nested.children;
        let inner = if children.len() == 1 {
            children.remove(0)
        } else {
            Condition::Group(GroupCondition::new(
                self.def.name.clone(),
                GroupOperator::And,
                children,
            ))
        };
        self.children.push(Condition::Group(GroupCondition::new(
            self.def.name.clone(),
            GroupOperator::Not,
            vec![inner],
        )));
        Ok(self)
    }

    /// Root `and` group of everything added so far
    pub fn build(self) -> Predicate {
        Predicate {
            root: self.into_group(GroupOperator::And),
        }
    }

    /// Root `or` group of everything added so far
    pub fn build_any(self) -> Predicate {
        Predicate {
            root: self.into_group(GroupOperator::Or),
        }
    }

    fn nested<F>(mut self, operator: GroupOperator, build: F) -> Result<Self, DomainError>
    where
        F: FnOnce(PredicateBuilder) -> Result<PredicateBuilder, DomainError>,
    {
        let nested = build(self.child())?;
        self.children
            .push(Condition::Group(nested.into_group(operator)));
        Ok(self)
    }

    fn child(&self) -> PredicateBuilder {
        PredicateBuilder {
            schema: self.schema.clone(),
            def: self.def.clone(),
            children: Vec::new(),
        }
    }

    fn into_group(self, operator: GroupOperator) -> GroupCondition {
        GroupCondition::new(self.def.name.clone(), operator, self.children)
    }

    fn push(mut self, field: String, operator: ComparisonOperator, operands: Vec<Value>) -> Self {
        self.children.push(Condition::Field(FieldCondition {
            field,
            operator,
            operands,
        }));
        self
    }
}

/// Comparison operators for one scalar field
#[derive(Debug, Clone)]
pub struct FieldBuilder {
    parent: PredicateBuilder,
    field: String,
}

impl FieldBuilder {
    fn op(self, operator: ComparisonOperator, operand: impl Into<Value>) -> PredicateBuilder {
        self.parent.push(self.field, operator, vec![operand.into()])
    }

    pub fn eq(self, operand: impl Into<Value>) -> PredicateBuilder {
        self.op(ComparisonOperator::Eq, operand)
    }

    pub fn ne(self, operand: impl Into<Value>) -> PredicateBuilder {
        self.op(ComparisonOperator::Ne, operand)
    }

    pub fn gt(self, operand: impl Into<Value>) -> PredicateBuilder {
        self.op(ComparisonOperator::Gt, operand)
    }

    pub fn ge(self, operand: impl Into<Value>) -> PredicateBuilder {
        self.op(ComparisonOperator::Ge, operand)
    }

    pub fn lt(self, operand: impl Into<Value>) -> PredicateBuilder {
        self.op(ComparisonOperator::Lt, operand)
    }

    pub fn le(self, operand: impl Into<Value>) -> PredicateBuilder {
        self.op(ComparisonOperator::Le, operand)
    }

    pub fn contains(self, operand: impl Into<Value>) -> PredicateBuilder {
        self.op(ComparisonOperator::Contains, operand)
    }

    pub fn not_contains(self, operand: impl Into<Value>) -> PredicateBuilder {
        self.op(ComparisonOperator::NotContains, operand)
    }

    pub fn begins_with(self, operand: impl Into<Value>) -> PredicateBuilder {
        self.op(ComparisonOperator::BeginsWith, operand)
    }

    /// Inclusive range; `low` must not be greater than `high`
    pub fn between(
        self,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Result<PredicateBuilder, DomainError> {
        let (low, high) = (low.into(), high.into());
        super::check_range(&self.field, &low, &high)?;
        Ok(self
            .parent
            .push(self.field, ComparisonOperator::Between, vec![low, high]))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::domain::{FieldDefinition, Relationship, ScalarType};

    fn schema() -> Arc<Schema> {
        let post = ModelDefinition::builder("Post")
            .field(FieldDefinition::scalar("id", ScalarType::Id))
            .field(FieldDefinition::scalar("title", ScalarType::String))
            .field(FieldDefinition::relation(
                "comments",
                Relationship::has_many("Comment", &["postId"]),
            ))
            .build();
        let comment = ModelDefinition::builder("Comment")
            .field(FieldDefinition::scalar("id", ScalarType::Id))
            .field(FieldDefinition::scalar("postId", ScalarType::Id))
            .field(FieldDefinition::scalar("content", ScalarType::String))
            .build();
        Arc::new(Schema::new("user", "1", vec![post, comment]).unwrap())
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let err = PredicateBuilder::new(&schema(), "Post")
            .unwrap()
            .field("rating")
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::UnknownField {
                model: "Post".into(),
                field: "rating".into()
            }
        );
    }

    #[test]
    fn test_sync_fields_are_queryable() {
        let p = PredicateBuilder::new(&schema(), "Post")
            .unwrap()
            .field("_deleted")
            .unwrap()
            .eq(true)
            .build();
        assert_eq!(p.root().children.len(), 1);
    }

    #[test]
    fn test_between_requires_ordered_operands() {
        let result = PredicateBuilder::new(&schema(), "Post")
            .unwrap()
            .field("title")
            .unwrap()
            .between("z", "a");
        assert!(matches!(result, Err(DomainError::InvalidPredicate(_))));
    }

    #[test]
    fn test_related_builds_scoped_group() {
        let p = PredicateBuilder::new(&schema(), "Post")
            .unwrap()
            .related("comments", |c| Ok(c.field("content")?.contains("rust")))
            .unwrap()
            .build();
        assert!(p.has_relation_scope());
        match &p.root().children[0] {
            Condition::Group(g) => {
                assert_eq!(g.model, "Comment");
                assert_eq!(g.scope_field.as_deref(), Some("comments"));
            }
            other => panic!("expected group, got {other:?}"),
        }
    }

    #[test]
    fn test_related_on_scalar_field_fails() {
        let result = PredicateBuilder::new(&schema(), "Post")
            .unwrap()
            .related("title", Ok);
        assert!(result.is_err());
    }

    #[test]
    fn test_not_wraps_single_child() {
        let p = PredicateBuilder::new(&schema(), "Post")
            .unwrap()
            .not(|b| Ok(b.field("title")?.eq("A")))
            .unwrap()
            .build();
        match &p.root().children[0] {
            Condition::Group(g) => {
                assert_eq!(g.operator, GroupOperator::Not);
                assert_eq!(g.children.len(), 1);
            }
            other => panic!("expected group, got {other:?}"),
        }
    }

    #[test]
    fn test_by_key_checks_arity() {
        assert!(PredicateBuilder::by_key(&schema(), "Post", vec![json!("1")]).is_ok());
        assert!(PredicateBuilder::by_key(&schema(), "Post", vec![]).is_err());
    }

    #[test]
    fn test_from_group_rejects_malformed_not() {
        let group = GroupCondition::new("Post", GroupOperator::Not, vec![]);
        assert!(Predicate::from_group(group).is_err());
    }

    fn reversed_range() -> GroupCondition {
        GroupCondition::new(
            "Post",
            GroupOperator::And,
            vec![Condition::Field(FieldCondition {
                field: "title".into(),
                operator: ComparisonOperator::Between,
                operands: vec![json!("z"), json!("a")],
            })],
        )
    }

    #[test]
    fn test_from_group_rejects_reversed_between() {
        let err = Predicate::from_group(reversed_range()).unwrap_err();
        assert!(matches!(err, DomainError::InvalidPredicate(_)));
    }

    #[test]
    fn test_deserialized_predicate_is_validated() {
        let reversed = json!({ "root": reversed_range() });
        assert!(serde_json::from_value::<Predicate>(reversed).is_err());

        let ordered = PredicateBuilder::new(&schema(), "Post")
            .unwrap()
            .field("title")
            .unwrap()
            .between("a", "z")
            .unwrap()
            .build();
        let restored: Predicate =
            serde_json::from_value(serde_json::to_value(&ordered).unwrap()).unwrap();
        assert_eq!(restored, ordered);
    }
}
