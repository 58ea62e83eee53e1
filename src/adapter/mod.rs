//! Storage adapters
//!
//! The persistence engine never talks to a database directly. Everything
//! goes through the `Adapter` trait, whose `Model` handles are opaque
//! row objects compared by identity.

pub mod memory;
pub mod record;
pub mod schema;

use crate::Result;
use crate::item::Item;
use crate::persist::merge::{MergePolicy, Merger};
use crate::value::Value;
use schema::ModelSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::hash::Hash;

/// Field values identifying a set of rows (all fields must be equal).
pub type Selector = BTreeMap<String, Value>;

/// Resolved foreign models per relation of an item.
pub type ForeignKeys<M> = BTreeMap<String, Vec<Option<M>>>;

/// A row handle.
///
/// Handles are cheap to clone and compare by identity: two handles are
/// equal only when they refer to the same row object in the session.
pub trait Model: Clone + Eq + Hash + Debug {
    fn model_cls(&self) -> &str;

    /// Current value of a scalar field (`Value::Null` when unset)
    fn get_field(&self, name: &str) -> Value;

    fn set_field(&self, name: &str, value: Value);

    /// Whether the attribute (scalar or relation) exists on this row
    fn has_field(&self, name: &str) -> bool;

    fn get_relation(&self, name: &str) -> Option<Self>;

    /// Raw pointer write; does not touch the other side
    fn set_relation(&self, name: &str, target: Option<&Self>);

    fn related_members(&self, name: &str) -> Vec<Self>;

    fn add_relation_members(&self, name: &str, members: &[Self]);

    fn remove_relation_members(&self, name: &str, members: &[Self]);

    fn clear_relation(&self, name: &str);
}

/// What an adapter's backend can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub composite_keys: bool,
    /// Writing one side of a relation updates the other side
    pub reverse_model_autoupdate: bool,
    /// Newly created models must be saved before x-to-many links are added
    pub save_model_before_commit: bool,
    /// Default number of items per `get` call
    pub batch_size: usize,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            composite_keys: true,
            reverse_model_autoupdate: true,
            save_model_before_commit: false,
            batch_size: 300,
        }
    }
}

/// One item's lookup request in a batched `get`.
pub struct Lookup<'a, M> {
    pub item: &'a Item,
    pub fkeys: &'a ForeignKeys<M>,
}

/// Check whether every selector field of `model` equals the selector value
pub fn matches_selector<M: Model>(model: &M, selector: &Selector) -> bool {
    selector.iter().all(|(field, value)| model.get_field(field) == *value)
}

/// Backend contract used by the persistence engine.
///
/// Methods take `&self`; models are interior-mutable handles owned by the
/// adapter's session.
pub trait Adapter {
    type Model: Model;

    fn capabilities(&self) -> Capabilities;

    fn schema(&self, model_cls: &str) -> Option<&ModelSchema>;

    /// Fetch candidate rows for a batch of items of one class.
    ///
    /// A row qualifies when it satisfies any usable getter group of any
    /// lookup. Duplicates are tolerated by the caller.
    fn get(&self, lookups: &[Lookup<'_, Self::Model>]) -> Result<Vec<Self::Model>>;

    fn create_blank_model(&self, model_cls: &str) -> Result<Self::Model>;

    fn save_model(&self, model: &Self::Model) -> Result<()>;

    fn delete(&self, model: &Self::Model) -> Result<()>;

    /// Delete rows matching any selector and no keeper; returns the count
    fn execute_delete(&self, model_cls: &str, selectors: &[Selector], keepers: &[Selector]) -> Result<usize>;

    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;

    // ========== Relation Operations ==========

    fn set_related_model(&self, model: &Self::Model, fkey: &str, target: Option<&Self::Model>) -> Result<()> {
        model.set_relation(fkey, target);
        Ok(())
    }

    fn add_related_models(&self, model: &Self::Model, fkey: &str, members: &[Self::Model]) -> Result<()> {
        model.add_relation_members(fkey, members);
        Ok(())
    }

    fn remove_related_models(&self, model: &Self::Model, fkey: &str, members: &[Self::Model]) -> Result<()> {
        model.remove_relation_members(fkey, members);
        Ok(())
    }

    fn clear_related_models(&self, model: &Self::Model, fkey: &str) -> Result<()> {
        model.clear_relation(fkey);
        Ok(())
    }

    fn related_x_to_many_exists(&self, model: &Self::Model, fkey: &str) -> Result<bool> {
        Ok(!model.related_members(fkey).is_empty())
    }

    /// The subset of `children` currently related to `model` through `fkey`
    fn related_x_to_many_contains(
        &self,
        model: &Self::Model,
        fkey: &str,
        children: &[Self::Model],
    ) -> Result<Vec<Self::Model>> {
        let members = self.get_related_x_to_many(model, fkey)?;
        Ok(children.iter().filter(|c| members.contains(c)).cloned().collect())
    }

    fn get_related_x_to_many(&self, model: &Self::Model, fkey: &str) -> Result<Vec<Self::Model>> {
        Ok(model.related_members(fkey))
    }

    /// Detach members of `parent.fkey` matching any selector and no keeper
    fn execute_unref(
        &self,
        parent: &Self::Model,
        fkey: &str,
        selectors: &[Selector],
        keepers: &[Selector],
    ) -> Result<usize> {
        let doomed: Vec<Self::Model> = self
            .get_related_x_to_many(parent, fkey)?
            .into_iter()
            .filter(|m| selectors.iter().any(|s| matches_selector(m, s)))
            .filter(|m| !keepers.iter().any(|k| matches_selector(m, k)))
            .collect();
        if !doomed.is_empty() {
            self.remove_related_models(parent, fkey, &doomed)?;
        }
        Ok(doomed.len())
    }

    fn get_primary_key_names(&self, model_cls: &str) -> Vec<String> {
        self.schema(model_cls).map(|s| s.primary_key.clone()).unwrap_or_default()
    }

    /// Collapse `models` into the first one
    fn merge_models(
        &self,
        models: &[Self::Model],
        policy: &MergePolicy<Self>,
        ignore_fields: &[&str],
    ) -> Result<Self::Model>
    where
        Self: Sized,
    {
        Merger::new(self, policy).merge(models, ignore_fields)
    }
}
