//! Model updater - writes item data onto models
//!
//! Decides whether a field may be written (rewrite policies, created vs
//! existing models), keeps one-to-one relations exclusive, propagates
//! resolved foreign models along item edges and collapses multiple
//! matches into one model.

use super::events::HookSet;
use super::keeper::{ItemTrack, ProcessKeeper, TrackId, TrackSet};
use super::merge::{MergePolicy, Merger};
use crate::adapter::{Adapter, Capabilities, Model};
use crate::item::{DeleterConfig, FieldValue, Item, ItemClass, ItemGraph, ItemId, Rewrite};
use crate::persist::deleter::ModelDeleter;
use crate::relation::RelationType;
use crate::value::{cmp_keys, Value};
use crate::{Error, Result};
use std::collections::HashSet;

/// A value about to be written to a model field
#[derive(Debug)]
pub enum SetValue<'a, M> {
    Scalar(&'a Value),
    Related(Option<&'a M>),
}

impl<M> Clone for SetValue<'_, M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M> Copy for SetValue<'_, M> {}

/// Children added to `parent.fkey` during this persist
struct UnrefEntry<M> {
    parent: M,
    fkey: String,
    config: DeleterConfig,
    children: Vec<M>,
}

pub struct ModelUpdater<'a, A: Adapter> {
    adapter: &'a A,
    policy: &'a MergePolicy<A>,
    hooks: &'a HookSet<A::Model>,
    capabilities: Capabilities,
    created: HashSet<A::Model>,
    /// (model, field) pairs known to hold no value
    no_value: HashSet<(A::Model, String)>,
    unrefs: Vec<UnrefEntry<A::Model>>,
}

impl<'a, A: Adapter> ModelUpdater<'a, A> {
    pub fn new(adapter: &'a A, policy: &'a MergePolicy<A>, hooks: &'a HookSet<A::Model>) -> Self {
        Self {
            adapter,
            policy,
            hooks,
            capabilities: adapter.capabilities(),
            created: HashSet::new(),
            no_value: HashSet::new(),
            unrefs: Vec::new(),
        }
    }

    pub fn add_created(&mut self, model: A::Model) {
        self.created.insert(model);
    }

    pub fn is_model_created(&self, model: &A::Model) -> bool {
        self.created.contains(model)
    }

    // ========== Write Permissions ==========

    fn model_had_value(&mut self, relation_type: RelationType, model: &A::Model, field: &str) -> Result<bool> {
        let cache_key = (model.clone(), field.to_string());
        if self.no_value.contains(&cache_key) {
            return Ok(false);
        }
        let had_value = if !model.has_field(field) {
            false
        } else if relation_type.is_x_to_one() {
            model.get_relation(field).is_some()
        } else {
            self.adapter.related_x_to_many_exists(model, field)?
        };
        if !had_value {
            self.no_value.insert(cache_key);
        }
        Ok(had_value)
    }

    /// Whether `field` of `model` (None: a model about to be created) may
    /// be set to `value` for `item`
    pub fn can_set_model_field(
        &mut self,
        item: &Item,
        model: Option<&A::Model>,
        field: &str,
        value: SetValue<'_, A::Model>,
    ) -> Result<bool> {
        if item.get_only_mode() {
            return Ok(false);
        }
        let class = item.class();
        let rewrite = match class.norewrite(field) {
            None | Some(Rewrite::Always) => return Ok(true),
            Some(rewrite) => rewrite,
        };
        let rewrite_none = rewrite == Rewrite::IfNull;
        let created = model.is_none_or(|m| self.is_model_created(m));

        let Some(rel) = class.get_relation(field) else {
            if created {
                return Ok(true);
            }
            let current = model.map(|m| m.get_field(field)).unwrap_or_default();
            return Ok(current.is_null() && rewrite_none);
        };

        let fmodel = match value {
            SetValue::Related(fmodel) => fmodel,
            SetValue::Scalar(_) => None,
        };
        if created && fmodel.is_none_or(|f| self.is_model_created(f)) {
            return Ok(true);
        }
        if let Some(fmodel) = fmodel {
            if rel.relation_type.is_many_to_x() && created {
                return Ok(true);
            }
            if rel.relation_type.is_x_to_many() && self.is_model_created(fmodel) {
                return Ok(true);
            }
        }
        if !rewrite_none {
            return Ok(false);
        }
        if let Some(model) = model {
            if self.model_had_value(rel.relation_type, model, field)? {
                return Ok(false);
            }
        }
        if let (Some(fmodel), Some(reverse_key)) = (fmodel, rel.reverse_key.as_deref()) {
            if self.model_had_value(rel.relation_type.reverse(), fmodel, reverse_key)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Whether a blank model may be created for the track's item
    pub fn can_create_model(&mut self, graph: &ItemGraph, track: &ItemTrack<A::Model>) -> Result<bool> {
        let item = graph.item(track.item);
        let class = item.class();
        if item.get_only_mode() || item.update_only_mode() {
            return Ok(false);
        }
        if class.creators.is_empty() {
            return Ok(true);
        }
        'groups: for group in &class.creators {
            for field in group {
                if class.is_relation(field) {
                    let Some(fmodels) = track.fkeys.get(field).filter(|f| !f.is_empty()) else {
                        continue 'groups;
                    };
                    for fmodel in fmodels {
                        if !self.can_set_model_field(item, None, field, SetValue::Related(fmodel.as_ref()))? {
                            continue 'groups;
                        }
                    }
                } else if !item.contains(field) {
                    continue 'groups;
                }
            }
            return Ok(true);
        }
        Ok(false)
    }

    // ========== Relation Writes ==========

    /// Null out one-to-one pointers that would otherwise be doubled:
    /// `model`'s old partner (when the relation has a reverse side) and any
    /// other tracked model of `class_name` already pointing at `fmodel`.
    fn clean_one_to_one(
        &self,
        keeper: &ProcessKeeper<A::Model>,
        model: &A::Model,
        fkey: &str,
        fmodel: Option<&A::Model>,
        class_name: &str,
        reverse_key: Option<&str>,
    ) -> Result<()> {
        if let (Some(related), Some(reverse_key)) = (model.get_relation(fkey), reverse_key) {
            if Some(&related) != fmodel && related.has_field(reverse_key) {
                self.adapter.set_related_model(&related, reverse_key, None)?;
                self.adapter.save_model(&related)?;
            }
        }
        let Some(fmodel) = fmodel else {
            return Ok(());
        };
        for track in keeper.tracks_of_class(class_name) {
            for other in &track.models {
                if other != model && other.get_relation(fkey).as_ref() == Some(fmodel) {
                    self.adapter.set_related_model(other, fkey, None)?;
                    self.adapter.save_model(other)?;
                }
            }
        }
        Ok(())
    }

    pub fn set_related_model(
        &mut self,
        keeper: &ProcessKeeper<A::Model>,
        item: &Item,
        model: &A::Model,
        fkey: &str,
        fmodel: Option<&A::Model>,
    ) -> Result<()> {
        if !self.can_set_model_field(item, Some(model), fkey, SetValue::Related(fmodel))? {
            return Ok(());
        }
        let class = item.class();
        let Some(rel) = class.get_relation(fkey) else {
            return Err(Error::UnknownField {
                class: class.name.clone(),
                field: fkey.to_string(),
            });
        };
        if rel.relation_type == RelationType::OneToOne && model.get_relation(fkey).as_ref() != fmodel {
            let reverse_key = rel.reverse_key.as_deref();
            self.clean_one_to_one(keeper, model, fkey, fmodel, &class.name, reverse_key)?;
            if let (Some(fmodel), Some(reverse_key)) = (fmodel, reverse_key) {
                self.clean_one_to_one(keeper, fmodel, reverse_key, Some(model), &rel.item_class, Some(fkey))?;
            }
        }
        self.adapter.set_related_model(model, fkey, fmodel)
    }

    pub fn add_related_models(
        &mut self,
        item: &Item,
        model: &A::Model,
        fkey: &str,
        fmodels: &[A::Model],
    ) -> Result<()> {
        let mut allowed = Vec::with_capacity(fmodels.len());
        for fmodel in fmodels {
            if self.can_set_model_field(item, Some(model), fkey, SetValue::Related(Some(fmodel)))? {
                allowed.push(fmodel.clone());
            }
        }
        if allowed.is_empty() {
            return Ok(());
        }
        self.adapter.add_related_models(model, fkey, &allowed)?;

        let Some(config) = item.class().unref_x_to_many.get(fkey) else {
            return Ok(());
        };
        for fmodel in &allowed {
            if self.is_model_created(fmodel) {
                self.adapter.save_model(fmodel)?;
            }
        }
        let position = self.unrefs.iter().position(|e| e.parent == *model && e.fkey == fkey);
        let entry = match position {
            Some(position) => &mut self.unrefs[position],
            None => {
                self.unrefs.push(UnrefEntry {
                    parent: model.clone(),
                    fkey: fkey.to_string(),
                    config: config.clone(),
                    children: Vec::new(),
                });
                let last = self.unrefs.len() - 1;
                &mut self.unrefs[last]
            }
        };
        for fmodel in allowed {
            if !entry.children.contains(&fmodel) {
                entry.children.push(fmodel);
            }
        }
        Ok(())
    }

    /// Empty `model.fkey`; without reverse autoupdate, tracked children
    /// have their back-pointer nulled first
    pub fn clear_related_models(
        &mut self,
        graph: &ItemGraph,
        keeper: &ProcessKeeper<A::Model>,
        item: &Item,
        model: &A::Model,
        fkey: &str,
    ) -> Result<()> {
        let rel = item.class().get_relation(fkey).ok_or_else(|| Error::UnknownField {
            class: item.class().name.clone(),
            field: fkey.to_string(),
        })?;
        if !self.capabilities.reverse_model_autoupdate && rel.relation_type == RelationType::OneToMany {
            if let Some(reverse_key) = rel.reverse_key.as_deref() {
                let members = self.adapter.get_related_x_to_many(model, fkey)?;
                let tracked: Vec<(ItemId, A::Model)> = keeper
                    .tracks_of_class(&rel.item_class)
                    .flat_map(|t| t.models.iter().map(move |m| (t.item, m.clone())))
                    .filter(|(_, m)| members.contains(m))
                    .collect();
                for (child_item, child) in tracked {
                    self.set_related_model(keeper, graph.item(child_item), &child, reverse_key, None)?;
                }
            }
        }
        self.adapter.clear_related_models(model, fkey)?;
        for entry in self.unrefs.iter_mut().filter(|e| e.parent == *model && e.fkey == fkey) {
            entry.children.clear();
        }
        Ok(())
    }

    /// Write the item's scalars and resolved relations onto `model`
    pub fn update_model_fields(
        &mut self,
        graph: &ItemGraph,
        keeper: &ProcessKeeper<A::Model>,
        track_id: TrackId,
        model: &A::Model,
    ) -> Result<()> {
        let track = keeper.get(track_id);
        let item = graph.item(track.item);
        let class = item.class();

        for (field, value) in item.data() {
            let FieldValue::Scalar(value) = value else { continue };
            if class.has_field(field) && self.can_set_model_field(item, Some(model), field, SetValue::Scalar(value))? {
                model.set_field(field, value.clone());
            }
        }
        for (fkey, fmodels) in &track.fkeys {
            let is_x_to_one = class.get_relation(fkey).is_some_and(|r| r.relation_type.is_x_to_one());
            if is_x_to_one {
                if let Some(first) = fmodels.first() {
                    self.set_related_model(keeper, item, model, fkey, first.as_ref())?;
                }
            }
        }
        if self.is_model_created(model) && self.capabilities.save_model_before_commit {
            self.adapter.save_model(model)?;
        }
        for (fkey, fmodels) in &track.fkeys {
            let is_x_to_many = class.get_relation(fkey).is_some_and(|r| r.relation_type.is_x_to_many());
            if is_x_to_many {
                let children: Vec<A::Model> = fmodels.iter().flatten().cloned().collect();
                self.add_related_models(item, model, fkey, &children)?;
            }
        }
        Ok(())
    }

    // ========== Multiple Matches ==========

    /// Merge several models matched by one item, in primary-key order
    pub fn merge_models_for_item(
        &mut self,
        graph: &ItemGraph,
        item: ItemId,
        class: &ItemClass,
        models: &[A::Model],
    ) -> Result<A::Model> {
        let pk = self.adapter.get_primary_key_names(&class.model_cls);
        let key_of = |m: &A::Model| pk.iter().map(|f| m.get_field(f)).collect::<Vec<Value>>();
        let mut sorted = models.to_vec();
        sorted.sort_by(|a, b| cmp_keys(&key_of(a), &key_of(b)));

        let hooks = self.hooks.get(&class.name);
        if let Some(hooks) = hooks {
            hooks.before_models_merge(graph, item, &sorted)?;
        }
        tracing::warn!("{} {} matched {} models, merging", class.name, item, sorted.len());
        let merged = Merger::new(self.adapter, self.policy)
            .merge(&sorted, &[])
            .map_err(|e| match e {
                Error::CannotMergeModels { .. } => Error::CannotMergeModelsForItem {
                    class: class.name.clone(),
                    item,
                    source: Box::new(e),
                },
                other => other,
            })?;
        if let Some(hooks) = hooks {
            hooks.after_models_merge(graph, item, &merged)?;
        }
        Ok(merged)
    }

    /// Collapse a track holding several models unless multi-update is on
    fn resolve_track(&mut self, graph: &ItemGraph, keeper: &mut ProcessKeeper<A::Model>, track_id: TrackId) -> Result<()> {
        let track = keeper.get(track_id);
        if track.models.len() <= 1 || track.class.allow_multi_update {
            return Ok(());
        }
        let models = track.models.clone();
        let item = track.item;
        let class = track.class.clone();

        let chosen = match self.hooks.get(&class.name) {
            Some(hooks) => hooks.resolve_model(graph, item, &models)?,
            None => None,
        };
        match chosen {
            Some(model) => {
                for dropped in models.iter().filter(|m| **m != model) {
                    keeper.replace_foreign(dropped, &model);
                }
                keeper.get_mut(track_id).models = vec![model];
            }
            None => {
                let merged = self.merge_models_for_item(graph, item, &class, &models)?;
                for absorbed in models.iter().filter(|m| **m != merged) {
                    keeper.replace_model(absorbed, &merged);
                }
                keeper.get_mut(track_id).models = vec![merged];
            }
        }
        Ok(())
    }

    // ========== Propagation ==========

    /// Attach newly resolved models to their tracks and push them along
    /// every item edge touching those tracks.
    ///
    /// Returns the tracks whose creator groups and getter groups became
    /// fully resolved as a result.
    pub fn update_relationships(
        &mut self,
        graph: &ItemGraph,
        keeper: &mut ProcessKeeper<A::Model>,
        tracks: &[TrackId],
        models: Vec<Vec<A::Model>>,
    ) -> Result<(TrackSet, TrackSet)> {
        let mut creators = TrackSet::new();
        let mut getters = TrackSet::new();

        for (&track_id, new_models) in tracks.iter().zip(models) {
            let track = keeper.get_mut(track_id);
            for model in new_models {
                track.push_model(model);
            }
            self.resolve_track(graph, keeper, track_id)?;
        }

        for &track_id in tracks {
            let item_id = keeper.get(track_id).item;
            let item = graph.item(item_id);
            for fkey in item.class().relations.keys() {
                match item.get(fkey) {
                    Some(FieldValue::Null) => {
                        self.update_fkey(graph, keeper, track_id, fkey, None, &mut creators, &mut getters)?;
                    }
                    Some(FieldValue::Single(_)) | Some(FieldValue::Bulk(_)) => {
                        for target in item.related(fkey) {
                            if let Some(foreign) = keeper.track_of(target) {
                                self.update_fkey(graph, keeper, track_id, fkey, Some(foreign), &mut creators, &mut getters)?;
                            }
                        }
                    }
                    _ => {}
                }
            }
            let referrers = keeper.referrers(item_id).to_vec();
            for (referrer, fkey) in referrers {
                self.update_fkey(graph, keeper, referrer, &fkey, Some(track_id), &mut creators, &mut getters)?;
            }
        }
        Ok((creators, getters))
    }

    #[allow(clippy::too_many_arguments)]
    fn update_fkey(
        &mut self,
        graph: &ItemGraph,
        keeper: &mut ProcessKeeper<A::Model>,
        track_id: TrackId,
        fkey: &str,
        foreign: Option<TrackId>,
        creators: &mut TrackSet,
        getters: &mut TrackSet,
    ) -> Result<()> {
        let foreign_models: Vec<Option<A::Model>> = match foreign {
            Some(foreign) => {
                let models = &keeper.get(foreign).models;
                if models.is_empty() {
                    return Ok(());
                }
                models.iter().cloned().map(Some).collect()
            }
            None => vec![None],
        };

        let track = keeper.get_mut(track_id);
        let mut appended = false;
        for fmodel in &foreign_models {
            appended |= track.push_fkey(fkey, fmodel.clone());
        }
        let class = track.class.clone();
        let item = graph.item(track.item);
        let Some(rel) = class.get_relation(fkey) else {
            return Ok(());
        };

        let track = keeper.get(track_id);
        if appended {
            let resolves = |groups: &[Vec<String>]| {
                groups
                    .iter()
                    .any(|g| g.iter().any(|f| f == fkey) && track.is_group_resolved(item, g))
            };
            if resolves(&class.creators) {
                creators.push(&class.name, track_id);
            }
            if resolves(&class.getters) {
                getters.push(&class.name, track_id);
            }
        }
        let resolved = track.fkeys.get(fkey).map_or(0, Vec::len);
        if rel.relation_type.is_x_to_one() && resolved > 1 {
            return Err(Error::MultipleModelsMatch {
                class: class.name.clone(),
                item: track.item,
                fkey: fkey.to_string(),
                count: resolved,
            });
        }

        let models = track.models.clone();
        let keeper: &ProcessKeeper<A::Model> = keeper;
        for model in &models {
            if rel.relation_type.is_x_to_one() {
                self.set_related_model(keeper, item, model, fkey, foreign_models[0].as_ref())?;
            } else {
                let children: Vec<A::Model> = foreign_models.iter().flatten().cloned().collect();
                self.add_related_models(item, model, fkey, &children)?;
            }
        }
        Ok(())
    }

    // ========== Unrefs ==========

    /// Detach stale members from every x-to-many that gained children
    pub fn execute_unrefs(&mut self) -> Result<usize> {
        let adapter = self.adapter;
        let mut removed = 0;
        for entry in &mut self.unrefs {
            let Some(first) = entry.children.first() else { continue };
            let pk = adapter.get_primary_key_names(first.model_cls());
            let mut deleter = ModelDeleter::new(first.model_cls(), &entry.config, &pk);
            for child in &entry.children {
                deleter.collect_model(child);
            }
            removed += deleter.execute_unref(adapter, &entry.parent, &entry.fkey)?;
            entry.children.clear();
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::memory::MemoryAdapter;
    use crate::adapter::record::Record;
    use crate::adapter::schema::{Catalog, ModelSchema};
    use std::rc::Rc;

    fn catalog() -> Catalog {
        Catalog::new()
            .with(
                ModelSchema::new("person")
                    .fields(&["name", "nick"])
                    .one_to_one("passport", "passport", Some("holder"), true),
            )
            .with(
                ModelSchema::new("passport")
                    .field("number")
                    .one_to_one("holder", "person", Some("passport"), false),
            )
    }

    fn person_class() -> ItemClass {
        ItemClass::new("Person", "person")
            .fields(&["name", "nick"])
            .relation("passport", RelationType::OneToOne, "Passport", Some("holder"))
    }

    fn passport_class() -> ItemClass {
        ItemClass::new("Passport", "passport")
            .field("number")
            .relation("holder", RelationType::OneToOne, "Person", Some("passport"))
    }

    struct Fixture {
        graph: ItemGraph,
        person: crate::item::ItemId,
        keeper: ProcessKeeper<Record>,
    }

    fn fixture(class: ItemClass) -> Fixture {
        let mut graph = ItemGraph::new();
        let person = graph.add(&Rc::new(class));
        graph.set(person, "name", "ann").unwrap();
        let structure = graph.flatten(&[person]);
        let keeper = ProcessKeeper::build(&graph, &structure);
        Fixture { graph, person, keeper }
    }

    #[test]
    fn test_rewrite_policies_on_existing_model() {
        let adapter = MemoryAdapter::new(catalog());
        let existing = adapter
            .insert("person", &[("name", Value::from("old")), ("nick", Value::Null)])
            .unwrap();
        let policy = MergePolicy::new();
        let hooks = HookSet::default();
        let new_value = Value::from("new");

        let cases = [
            (None, true, true),
            (Some(Rewrite::Always), true, true),
            (Some(Rewrite::IfNull), false, true),
            (Some(Rewrite::Never), false, false),
        ];
        for (rewrite, name_writable, nick_writable) in cases {
            let mut class = person_class();
            if let Some(rewrite) = rewrite {
                class = class.with_norewrite("name", rewrite).with_norewrite("nick", rewrite);
            }
            let f = fixture(class);
            let item = f.graph.item(f.person);
            let mut updater = ModelUpdater::new(&adapter, &policy, &hooks);
            let scalar = SetValue::Scalar(&new_value);
            assert_eq!(
                updater.can_set_model_field(item, Some(&existing), "name", scalar).unwrap(),
                name_writable,
                "{:?}",
                rewrite
            );
            assert_eq!(
                updater.can_set_model_field(item, Some(&existing), "nick", scalar).unwrap(),
                nick_writable,
                "{:?}",
                rewrite
            );
            // a model about to be created is always writable
            assert!(updater.can_set_model_field(item, None, "name", scalar).unwrap());
        }
    }

    #[test]
    fn test_get_only_item_never_writes() {
        let adapter = MemoryAdapter::new(catalog());
        let policy = MergePolicy::new();
        let hooks = HookSet::default();
        let mut f = fixture(person_class());
        f.graph.set_get_only_mode(f.person, true).unwrap();
        let mut updater = ModelUpdater::new(&adapter, &policy, &hooks);
        let value = Value::from("x");
        let item = f.graph.item(f.person);
        assert!(!updater.can_set_model_field(item, None, "name", SetValue::Scalar(&value)).unwrap());
        let track = f.keeper.get(f.keeper.track_of(f.person).unwrap());
        assert!(!updater.can_create_model(&f.graph, track).unwrap());
    }

    #[test]
    fn test_if_null_relation_checks_both_sides() {
        let adapter = MemoryAdapter::new(catalog());
        let policy = MergePolicy::new();
        let hooks = HookSet::default();
        let ann = adapter.insert("person", &[]).unwrap();
        let bob = adapter.insert("person", &[]).unwrap();
        let taken = adapter.insert("passport", &[]).unwrap();
        let free = adapter.insert("passport", &[]).unwrap();
        adapter.set_related_model(&bob, "passport", Some(&taken)).unwrap();

        let f = fixture(person_class().with_norewrite("passport", Rewrite::IfNull));
        let item = f.graph.item(f.person);
        let mut updater = ModelUpdater::new(&adapter, &policy, &hooks);
        assert!(updater
            .can_set_model_field(item, Some(&ann), "passport", SetValue::Related(Some(&free)))
            .unwrap());
        assert!(!updater
            .can_set_model_field(item, Some(&ann), "passport", SetValue::Related(Some(&taken)))
            .unwrap());
        assert!(!updater
            .can_set_model_field(item, Some(&bob), "passport", SetValue::Related(Some(&free)))
            .unwrap());
    }

    #[test]
    fn test_creator_groups() {
        let adapter = MemoryAdapter::new(catalog());
        let policy = MergePolicy::new();
        let hooks = HookSet::default();
        let mut updater = ModelUpdater::new(&adapter, &policy, &hooks);

        let f = fixture(person_class().creator(&["name", "passport"]).creator(&["nick"]));
        let track_id = f.keeper.track_of(f.person).unwrap();
        assert!(!updater.can_create_model(&f.graph, f.keeper.get(track_id)).unwrap());

        let mut keeper = f.keeper;
        keeper.get_mut(track_id).push_fkey("passport", Some(Record::new("passport")));
        assert!(updater.can_create_model(&f.graph, keeper.get(track_id)).unwrap());
    }

    #[test]
    fn test_set_related_model_keeps_one_to_one_exclusive() {
        let adapter = MemoryAdapter::with_capabilities(
            catalog(),
            Capabilities {
                reverse_model_autoupdate: false,
                ..Capabilities::default()
            },
        );
        let policy = MergePolicy::new();
        let hooks = HookSet::default();
        let old_holder = adapter.insert("person", &[]).unwrap();
        let passport = adapter.insert("passport", &[]).unwrap();
        old_holder.set_relation("passport", Some(&passport));
        passport.set_relation("holder", Some(&old_holder));

        let f = fixture(person_class());
        let item = f.graph.item(f.person);
        let new_holder = adapter.insert("person", &[]).unwrap();
        let mut updater = ModelUpdater::new(&adapter, &policy, &hooks);
        updater
            .set_related_model(&f.keeper, item, &new_holder, "passport", Some(&passport))
            .unwrap();

        assert_eq!(new_holder.get_relation("passport"), Some(passport.clone()));
        assert_eq!(old_holder.get_relation("passport"), None);
    }

    #[test]
    fn test_merge_order_is_primary_key_order() {
        let run = |reverse: bool| {
            let adapter = MemoryAdapter::new(catalog());
            let policy = MergePolicy::new();
            let hooks = HookSet::default();
            let m1 = adapter.insert("person", &[("name", Value::from("first"))]).unwrap();
            let m2 = adapter
                .insert("person", &[("name", Value::from("second")), ("nick", Value::from("n2"))])
                .unwrap();
            let m3 = adapter.insert("person", &[("nick", Value::from("n3"))]).unwrap();
            let mut models = vec![m1, m2, m3];
            if reverse {
                models.reverse();
            }
            let class = person_class();
            let graph = ItemGraph::new();
            let mut updater = ModelUpdater::new(&adapter, &policy, &hooks);
            let merged = updater
                .merge_models_for_item(&graph, crate::item::ItemId(0), &class, &models)
                .unwrap();
            (merged.get_field("id"), merged.get_field("name"), merged.get_field("nick"))
        };
        let forward = run(false);
        assert_eq!(forward, (Value::Int(1), Value::from("first"), Value::from("n2")));
        assert_eq!(forward, run(true));
    }
}
