//! Merge engine - collapses several models of one class into the first
//!
//! The surviving model takes over the absorbed models' relations and
//! fills its null scalar fields from them; absorbed models are deleted.
//! Conflicts that cannot be settled mechanically go to callbacks in a
//! `MergePolicy`, keyed by (model class, relation).

use crate::adapter::schema::{ModelSchema, RelationSchema};
use crate::adapter::{Adapter, Model};
use crate::relation::RelationType;
use crate::{Error, Result};
use std::collections::HashMap;

/// Two models point at different targets through an x-to-one relation
pub struct XToOneConflict<'a, M> {
    /// Surviving model
    pub model: &'a M,
    /// Model being absorbed
    pub merged_model: &'a M,
    /// Current target of the survivor
    pub child: &'a M,
    /// Target of the absorbed model
    pub merged_child: &'a M,
    pub fkey: &'a str,
    pub reverse_key: Option<&'a str>,
}

/// A moved child collides with an existing child on a unique constraint
pub struct XToManyConflict<'a, M> {
    pub model: &'a M,
    pub merged_model: &'a M,
    /// Existing child of the survivor
    pub child: &'a M,
    /// Colliding child of the absorbed model
    pub merged_child: &'a M,
    pub fkey: &'a str,
    pub reverse_key: Option<&'a str>,
    /// The violated unique constraint
    pub constraint: &'a [String],
}

pub type XToOneMerge<A> =
    Box<dyn Fn(&Merger<'_, A>, &XToOneConflict<'_, <A as Adapter>::Model>) -> Result<<A as Adapter>::Model>>;
pub type XToManyMerge<A> =
    Box<dyn Fn(&Merger<'_, A>, &XToManyConflict<'_, <A as Adapter>::Model>) -> Result<<A as Adapter>::Model>>;

/// Conflict callbacks by (model class, relation name)
pub struct MergePolicy<A: Adapter> {
    x_to_one: HashMap<(String, String), XToOneMerge<A>>,
    x_to_many: HashMap<(String, String), XToManyMerge<A>>,
}

impl<A: Adapter> Default for MergePolicy<A> {
    fn default() -> Self {
        Self {
            x_to_one: HashMap::new(),
            x_to_many: HashMap::new(),
        }
    }
}

fn key(model_cls: &str, fkey: &str) -> (String, String) {
    (model_cls.to_string(), fkey.to_string())
}

impl<A: Adapter> MergePolicy<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_x_to_one<F>(mut self, model_cls: &str, fkey: &str, callback: F) -> Self
    where
        F: Fn(&Merger<'_, A>, &XToOneConflict<'_, A::Model>) -> Result<A::Model> + 'static,
    {
        self.x_to_one.insert(key(model_cls, fkey), Box::new(callback));
        self
    }

    pub fn on_x_to_many<F>(mut self, model_cls: &str, fkey: &str, callback: F) -> Self
    where
        F: Fn(&Merger<'_, A>, &XToManyConflict<'_, A::Model>) -> Result<A::Model> + 'static,
    {
        self.x_to_many.insert(key(model_cls, fkey), Box::new(callback));
        self
    }

    /// Keep the survivor's target on x-to-one conflicts
    pub fn keep_x_to_one(self, model_cls: &str, fkey: &str) -> Self {
        self.on_x_to_one(model_cls, fkey, |_, conflict| Ok(conflict.child.clone()))
    }

    /// Merge the two targets recursively on x-to-one conflicts
    pub fn merge_x_to_one(self, model_cls: &str, fkey: &str) -> Self {
        self.on_x_to_one(model_cls, fkey, |merger, conflict| {
            let ignore: Vec<&str> = conflict.reverse_key.into_iter().collect();
            merger.merge(&[conflict.child.clone(), conflict.merged_child.clone()], &ignore)
        })
    }

    /// Merge colliding children recursively on x-to-many conflicts
    pub fn merge_x_to_many(self, model_cls: &str, fkey: &str) -> Self {
        self.on_x_to_many(model_cls, fkey, |merger, conflict| {
            let ignore: Vec<&str> = conflict.reverse_key.into_iter().collect();
            merger.merge(&[conflict.child.clone(), conflict.merged_child.clone()], &ignore)
        })
    }
}

/// Runs merges against an adapter under a policy
pub struct Merger<'a, A: Adapter> {
    adapter: &'a A,
    policy: &'a MergePolicy<A>,
}

impl<'a, A: Adapter> Merger<'a, A> {
    pub fn new(adapter: &'a A, policy: &'a MergePolicy<A>) -> Self {
        Self { adapter, policy }
    }

    pub fn adapter(&self) -> &A {
        self.adapter
    }

    /// Merge `models` into `models[0]` and return it.
    ///
    /// Relations named in `ignore_fields` are left alone on every model.
    pub fn merge(&self, models: &[A::Model], ignore_fields: &[&str]) -> Result<A::Model> {
        let Some(result) = models.first().cloned() else {
            return Err(Error::Adapter("merge needs at least one model".to_string()));
        };
        let mut others: Vec<A::Model> = Vec::new();
        for model in &models[1..] {
            if *model != result && !others.contains(model) {
                others.push(model.clone());
            }
        }
        if others.is_empty() {
            return Ok(result);
        }

        let model_cls = result.model_cls().to_string();
        let schema = self
            .adapter
            .schema(&model_cls)
            .ok_or_else(|| Error::UnknownModel(model_cls.clone()))?;
        tracing::debug!("merging {} {} models into {:?}", others.len() + 1, model_cls, result);

        for rel in schema.x_to_one_relations() {
            if !ignore_fields.contains(&rel.name.as_str()) {
                self.merge_x_to_one(&result, &others, rel)?;
            }
        }
        for rel in schema.x_to_many_relations() {
            if !ignore_fields.contains(&rel.name.as_str()) {
                self.merge_x_to_many(&result, &others, rel)?;
            }
        }
        for field in &schema.fields {
            if schema.primary_key.contains(field) || ignore_fields.contains(&field.as_str()) {
                continue;
            }
            if result.get_field(field).is_null() {
                if let Some(value) = others.iter().map(|o| o.get_field(field)).find(|v| !v.is_null()) {
                    result.set_field(field, value);
                }
            }
        }

        for other in &others {
            self.adapter.delete(other)?;
        }
        Ok(result)
    }

    fn merge_x_to_one(&self, result: &A::Model, others: &[A::Model], rel: &RelationSchema) -> Result<()> {
        let mut current = result.get_relation(&rel.name);
        for other in others {
            let Some(target) = other.get_relation(&rel.name) else {
                continue;
            };
            if current.as_ref() == Some(&target) {
                continue;
            }
            let callback = match &current {
                Some(_) => Some(self.policy.x_to_one.get(&key(result.model_cls(), &rel.name)).ok_or_else(|| {
                    Error::CannotMergeModels {
                        model_cls: result.model_cls().to_string(),
                        field: rel.name.clone(),
                    }
                })?),
                None => None,
            };
            // the target must not stay referenced by two one-to-one owners
            if rel.relation_type == RelationType::OneToOne {
                self.adapter.set_related_model(other, &rel.name, None)?;
                self.adapter.save_model(other)?;
            }
            match (current.clone(), callback) {
                (Some(child), Some(callback)) => {
                    let merged = callback(
                        self,
                        &XToOneConflict {
                            model: result,
                            merged_model: other,
                            child: &child,
                            merged_child: &target,
                            fkey: &rel.name,
                            reverse_key: rel.reverse_key.as_deref(),
                        },
                    )?;
                    if result.get_relation(&rel.name).as_ref() != Some(&merged) {
                        self.adapter.set_related_model(result, &rel.name, Some(&merged))?;
                    }
                    current = Some(merged);
                }
                _ => {
                    self.adapter.set_related_model(result, &rel.name, Some(&target))?;
                    current = Some(target);
                }
            }
        }
        Ok(())
    }

    /// Unique constraints of the child model that include the reverse key,
    /// minus the reverse key itself
    fn child_constraints(&self, rel: &RelationSchema) -> Vec<Vec<String>> {
        let (RelationType::OneToMany, Some(reverse_key)) = (rel.relation_type, rel.reverse_key.as_ref()) else {
            return Vec::new();
        };
        let Some(child_schema) = self.adapter.schema(&rel.target) else {
            return Vec::new();
        };
        child_schema
            .unique_together
            .iter()
            .filter(|c| c.contains(reverse_key))
            .map(|c| c.iter().filter(|f| *f != reverse_key).cloned().collect())
            .collect()
    }

    fn same_on(child_schema: Option<&ModelSchema>, a: &A::Model, b: &A::Model, fields: &[String]) -> bool {
        fields.iter().all(|field| {
            let is_relation = child_schema.is_some_and(|s| s.get_relation(field).is_some());
            if is_relation {
                a.get_relation(field) == b.get_relation(field)
            } else {
                a.get_field(field) == b.get_field(field)
            }
        })
    }

    fn merge_x_to_many(&self, result: &A::Model, others: &[A::Model], rel: &RelationSchema) -> Result<()> {
        let constraints = self.child_constraints(rel);
        let child_schema = self.adapter.schema(&rel.target);
        for other in others {
            for child in self.adapter.get_related_x_to_many(other, &rel.name)? {
                let existing = self.adapter.get_related_x_to_many(result, &rel.name)?;
                if existing.contains(&child) {
                    continue;
                }
                let conflict = constraints.iter().find_map(|constraint| {
                    existing
                        .iter()
                        .find(|e| Self::same_on(child_schema, e, &child, constraint))
                        .map(|e| (e.clone(), constraint))
                });
                let Some((existing_child, constraint)) = conflict else {
                    self.adapter.add_related_models(result, &rel.name, std::slice::from_ref(&child))?;
                    continue;
                };
                let callback = self
                    .policy
                    .x_to_many
                    .get(&key(result.model_cls(), &rel.name))
                    .ok_or_else(|| Error::MergeModelsNotAllowed {
                        model_cls: result.model_cls().to_string(),
                        field: rel.name.clone(),
                    })?;
                let merged = callback(
                    self,
                    &XToManyConflict {
                        model: result,
                        merged_model: other,
                        child: &existing_child,
                        merged_child: &child,
                        fkey: &rel.name,
                        reverse_key: rel.reverse_key.as_deref(),
                        constraint,
                    },
                )?;
                let merged = std::slice::from_ref(&merged);
                if self.adapter.related_x_to_many_contains(result, &rel.name, merged)?.is_empty() {
                    self.adapter.add_related_models(result, &rel.name, merged)?;
                }
            }
        }
        Ok(())
    }
}
