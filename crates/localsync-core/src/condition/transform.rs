//! Structural rewrites: optimization and negation
//!
//! Both rewrites return new trees; shared subtrees are cloned into the
//! result, never mutated.

use std::sync::Arc;

use super::{ComparisonOperator, Condition, FieldCondition, GroupCondition, GroupOperator, Predicate};

impl Predicate {
    /// Collapses single-child `and`/`or` groups, bottom-up.
    ///
    /// The root, relation-scoped groups and the sole child of a `not` are
    /// kept, as is any group whose only child is a `between`.
    pub fn optimized(&self) -> Predicate {
        match self.root.optimize(true) {
            Condition::Group(root) => Predicate { root },
            Condition::Field(field) => Predicate {
                root: GroupCondition {
                    optimized: true,
                    ..GroupCondition::new(self.root.model.clone(), GroupOperator::And, vec![Condition::Field(field)])
                },
            },
        }
    }

    /// Logical complement, with negation pushed down to the leaves.
    pub fn negated(&self) -> Predicate {
        let model = self.root.model.clone();
        match negate_group(&self.root, &model) {
            Condition::Group(root) => Predicate { root },
            other => Predicate {
                root: GroupCondition::new(model, GroupOperator::And, vec![other]),
            },
        }
    }
}

impl GroupCondition {
    fn optimize(&self, preserve: bool) -> Condition {
        let preserve_children = self.operator == GroupOperator::Not;
        let children: Vec<Condition> = self
            .children
            .iter()
            .map(|child| match child {
                Condition::Field(f) => Condition::Field(f.clone()),
                Condition::Group(g) => g.optimize(preserve_children),
            })
            .collect();

        let collapsible = !preserve
            && self.scope_field.is_none()
            && self.operator != GroupOperator::Not
            && children.len() == 1
            && !matches!(
                &children[0],
                Condition::Field(f) if f.operator == ComparisonOperator::Between
            );
        if collapsible {
            if let Some(only) = children.into_iter().next() {
                return only;
            }
            return Condition::Group(GroupCondition::new(
                self.model.clone(),
                self.operator,
                Vec::new(),
            ));
        }

        Condition::Group(GroupCondition {
            model: self.model.clone(),
            operator: self.operator,
            scope_field: self.scope_field.clone(),
            children: Arc::new(children),
            optimized: true,
        })
    }
}

/// Negates `group`, which is evaluated in the context of `context_model`
fn negate_group(group: &GroupCondition, context_model: &str) -> Condition {
    if group.scope_field.is_some() {
        // Existential scope: !exists(x) has no leaf-level form.
        return Condition::Group(GroupCondition::new(
            context_model,
            GroupOperator::Not,
            vec![Condition::Group(group.clone())],
        ));
    }
    match group.operator {
        GroupOperator::Not => Condition::Group(GroupCondition::new(
            group.model.clone(),
            GroupOperator::And,
            group.children.iter().cloned().collect(),
        )),
        GroupOperator::And | GroupOperator::Or => {
            let operator = if group.operator == GroupOperator::And {
                GroupOperator::Or
            } else {
                GroupOperator::And
            };
            let children = group
                .children
                .iter()
                .map(|child| negate(child, &group.model))
                .collect();
            Condition::Group(GroupCondition::new(group.model.clone(), operator, children))
        }
    }
}

fn negate(condition: &Condition, model: &str) -> Condition {
    match condition {
        Condition::Group(g) => negate_group(g, model),
        Condition::Field(f) => negate_field(f, model),
    }
}

fn negate_field(field: &FieldCondition, model: &str) -> Condition {
    if let Some(operator) = field.operator.complement() {
        return Condition::Field(FieldCondition {
            operator,
            ..field.clone()
        });
    }
    match field.operator {
        ComparisonOperator::Between => {
            let low = field.operands.first().cloned().unwrap_or_default();
            let high = field.operands.get(1).cloned().unwrap_or_default();
            Condition::Group(GroupCondition::new(
                model,
                GroupOperator::Or,
                vec![
                    Condition::Field(FieldCondition {
                        field: field.field.clone(),
                        operator: ComparisonOperator::Lt,
                        operands: vec![low],
                    }),
                    Condition::Field(FieldCondition {
                        field: field.field.clone(),
                        operator: ComparisonOperator::Gt,
                        operands: vec![high],
                    }),
                ],
            ))
        }
        // beginsWith stays behind an explicit not (scan and filter)
        _ => Condition::Group(GroupCondition::new(
            model,
            GroupOperator::Not,
            vec![Condition::Field(field.clone())],
        )),
    }
}
