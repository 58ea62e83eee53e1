//! Persist orchestration
//!
//! `Persister::persist` resolves every item reachable from the roots to
//! models in two fixed-point phases. The get phase fetches existing rows
//! for items whose getter groups are resolved, the create phase creates
//! blank models for the rest once a creator group is resolved. Resolved
//! models propagate along item edges between passes, so relations
//! converge whichever side declares them.

pub mod deleter;
pub mod events;
pub mod keeper;
pub mod matcher;
pub mod merge;
pub mod updater;


pub use events::{DropReason, ItemHooks, PersistEvent};
pub use merge::MergePolicy;

use crate::adapter::{Adapter, Lookup};
use crate::config::PersistConfig;
use crate::item::{Item, ItemClass, ItemGraph, ItemId};
use crate::relation::RelationType;
use crate::{Error, Result};
use crossbeam::channel::Receiver;
use deleter::ModelDeleter;
use events::{EventBus, HookSet};
use keeper::{ProcessKeeper, TrackId, TrackSet};
use std::collections::{BTreeMap, BTreeSet};
use updater::ModelUpdater;

/// Roots that ended up with models, in root order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Persisted<M> {
    pub items: Vec<ItemId>,
    pub models: Vec<Vec<M>>,
}

impl<M> Persisted<M> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Models of `item`, if it was persisted
    pub fn models_of(&self, item: ItemId) -> Option<&[M]> {
        self.items
            .iter()
            .position(|i| *i == item)
            .map(|idx| self.models[idx].as_slice())
    }
}

/// Persistence engine bound to one adapter
pub struct Persister<A: Adapter> {
    adapter: A,
    policy: MergePolicy<A>,
    hooks: HookSet<A::Model>,
    events: EventBus<A::Model>,
    deleters: BTreeMap<String, ModelDeleter>,
    batch_size: Option<usize>,
}

impl<A: Adapter> Persister<A> {
    pub fn new(adapter: A) -> Self {
        Self {
            adapter,
            policy: MergePolicy::new(),
            hooks: HookSet::default(),
            events: EventBus::new(),
            deleters: BTreeMap::new(),
            batch_size: None,
        }
    }

    pub fn with_config(adapter: A, config: &PersistConfig) -> Self {
        let mut persister = Self::new(adapter);
        persister.batch_size = config.batch_size;
        persister
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn set_merge_policy(&mut self, policy: MergePolicy<A>) {
        self.policy = policy;
    }

    pub fn register_hooks(&mut self, class: &str, hooks: impl ItemHooks<A::Model> + 'static) {
        self.hooks.register(class, Box::new(hooks));
    }

    pub fn subscribe(&mut self) -> Receiver<PersistEvent<A::Model>> {
        self.events.subscribe()
    }

    pub fn commit(&self) -> Result<()> {
        self.adapter.commit()
    }

    pub fn rollback(&self) -> Result<()> {
        self.adapter.rollback()
    }

    /// Merge models of one class under the configured policy
    pub fn merge_models(&self, models: &[A::Model], ignore_fields: &[&str]) -> Result<A::Model> {
        self.adapter.merge_models(models, &self.policy, ignore_fields)
    }

    /// Run the collected bulk delete of an item class
    pub fn execute_deleter(&mut self, class: &str) -> Result<usize> {
        match self.deleters.get_mut(class) {
            Some(deleter) => deleter.execute(&self.adapter),
            None => Ok(0),
        }
    }

    fn batch_size_for(&self, class: &ItemClass) -> usize {
        class
            .batch_size
            .or(self.batch_size)
            .unwrap_or_else(|| self.adapter.capabilities().batch_size)
            .max(1)
    }

    pub fn persist(&mut self, graph: &ItemGraph, root: ItemId) -> Result<Persisted<A::Model>> {
        self.persist_all(graph, &[root])
    }

    /// Resolve, write and save the items reachable from `roots`.
    ///
    /// Never commits; a failure leaves the session for the caller to roll
    /// back.
    pub fn persist_all(&mut self, graph: &ItemGraph, roots: &[ItemId]) -> Result<Persisted<A::Model>> {
        let structure = graph.flatten(roots);
        tracing::debug!("persisting {} items from {} roots", structure.len(), roots.len());
        self.events.emit(PersistEvent::BeforePersist {
            roots: roots.to_vec(),
            structure: structure.clone(),
        });

        let mut keeper = ProcessKeeper::build(graph, &structure);
        let mut updater = ModelUpdater::new(&self.adapter, &self.policy, &self.hooks);

        self.get_models(graph, &mut keeper, &mut updater)?;

        // ========== Update found models ==========
        for track_id in keeper.ids().collect::<Vec<_>>() {
            let track = keeper.get(track_id);
            let item_id = track.item;
            let models = track.models.clone();
            let item = graph.item(item_id);
            for model in &models {
                if let Some(hooks) = self.hooks.get(&item.class().name) {
                    hooks.before_model_update(graph, item_id, model)?;
                }
                for (fkey, rel) in &item.class().relations {
                    if rel.replace_x_to_many && rel.relation_type.is_x_to_many() && item.contains(fkey) {
                        self.ensure_clearable(graph, item, model, fkey)?;
                        updater.clear_related_models(graph, &keeper, item, model, fkey)?;
                    }
                }
                updater.update_model_fields(graph, &keeper, track_id, model)?;
            }
        }

        self.create_models(graph, &mut keeper, &mut updater)?;

        for track_id in keeper.ids() {
            let track = keeper.get(track_id);
            if track.has_models() {
                continue;
            }
            let item = graph.item(track.item);
            let reason = if item.get_only_mode() {
                DropReason::GetOnlyMode
            } else if item.update_only_mode() {
                DropReason::UpdateOnlyMode
            } else {
                DropReason::InsufficientData
            };
            tracing::debug!("dropped {} {}: {}", track.class.name, track.item, reason);
            self.events.emit(PersistEvent::ItemDropped {
                item: track.item,
                class: track.class.name.clone(),
                reason,
            });
        }

        // ========== Save ==========
        for track_id in keeper.ids() {
            let track = keeper.get(track_id);
            for model in &track.models {
                self.adapter.save_model(model)?;
                if let Some(config) = &track.class.deleter {
                    let deleter = self.deleters.entry(track.class.name.clone()).or_insert_with(|| {
                        let pk = self.adapter.get_primary_key_names(&track.class.model_cls);
                        ModelDeleter::new(&track.class.model_cls, config, &pk)
                    });
                    deleter.collect_model(model);
                }
            }
        }

        let unrefs = updater.execute_unrefs()?;
        if unrefs > 0 {
            tracing::debug!("unreferenced {} stale x-to-many members", unrefs);
        }
        drop(updater);

        for track_id in keeper.ids() {
            let track = keeper.get(track_id);
            if let Some(hooks) = self.hooks.get(&track.class.name) {
                for model in &track.models {
                    hooks.after_model_save(graph, track.item, model)?;
                }
            }
        }

        let mut persisted = Persisted {
            items: Vec::new(),
            models: Vec::new(),
        };
        for root in roots {
            let Some(track) = keeper.track_of(*root).map(|t| keeper.get(t)) else {
                continue;
            };
            if track.has_models() && !persisted.items.contains(root) {
                persisted.items.push(*root);
                persisted.models.push(track.models.clone());
            }
        }
        self.events.emit(PersistEvent::AfterPersist {
            roots: roots.to_vec(),
            items: persisted.items.clone(),
            models: persisted.models.clone(),
        });

        let on_persist: BTreeSet<String> = keeper
            .ids()
            .map(|t| &keeper.get(t).class)
            .filter(|c| c.deleter.as_ref().is_some_and(|d| d.execute_on_persist))
            .map(|c| c.name.clone())
            .collect();
        for class in on_persist {
            let deleted = self.execute_deleter(&class)?;
            tracing::debug!("deleter of {} removed {} rows", class, deleted);
        }

        Ok(persisted)
    }

    // ========== Fixed Points ==========

    fn get_models(
        &self,
        graph: &ItemGraph,
        keeper: &mut ProcessKeeper<A::Model>,
        updater: &mut ModelUpdater<'_, A>,
    ) -> Result<()> {
        let mut pending = keeper.all();
        let mut pass = 0;
        while !pending.is_empty(keeper) {
            pass += 1;
            let mut next = TrackSet::new();
            let mut fetched = 0;
            for (class_name, ids) in pending.groups() {
                let Some(class) = ids.first().map(|t| keeper.get(*t).class.clone()) else {
                    continue;
                };
                if class.fast_insert || class.getters.is_empty() {
                    continue;
                }
                let gettable: Vec<TrackId> = ids
                    .iter()
                    .copied()
                    .filter(|t| {
                        let track = keeper.get(*t);
                        let item = graph.item(track.item);
                        class.getters.iter().any(|g| track.is_group_resolved(item, g))
                    })
                    .collect();

                for batch in gettable.chunks(self.batch_size_for(&class)) {
                    let mut candidates = {
                        let lookups: Vec<Lookup<'_, A::Model>> = batch
                            .iter()
                            .map(|t| {
                                let track = keeper.get(*t);
                                Lookup {
                                    item: graph.item(track.item),
                                    fkeys: &track.fkeys,
                                }
                            })
                            .collect();
                        self.adapter.get(&lookups)?
                    };
                    let mut seen = std::collections::HashSet::new();
                    candidates.retain(|m| seen.insert(m.clone()));
                    tracing::trace!("{}: {} lookups, {} candidates", class_name, batch.len(), candidates.len());

                    let (tracks, models) = matcher::match_models(&self.adapter, graph, keeper, batch, &candidates)?;
                    fetched += tracks.len();
                    let (_, getters) = updater.update_relationships(graph, keeper, &tracks, models)?;
                    next.extend(&getters);
                }
            }
            tracing::debug!("get pass {}: {} items matched", pass, fetched);
            pending = next;
        }
        Ok(())
    }

    fn create_models(
        &self,
        graph: &ItemGraph,
        keeper: &mut ProcessKeeper<A::Model>,
        updater: &mut ModelUpdater<'_, A>,
    ) -> Result<()> {
        let mut pending = keeper.all();
        let mut pass = 0;
        while !pending.is_empty(keeper) {
            pass += 1;
            let mut tracks = Vec::new();
            let mut models = Vec::new();
            for (_, ids) in pending.groups() {
                for &track_id in ids {
                    let track = keeper.get(track_id);
                    if track.has_models() || !updater.can_create_model(graph, track)? {
                        continue;
                    }
                    let item_id = track.item;
                    let class = track.class.clone();
                    let model = self.adapter.create_blank_model(&class.model_cls)?;
                    updater.add_created(model.clone());
                    keeper.get_mut(track_id).push_model(model.clone());

                    if let Some(hooks) = self.hooks.get(&class.name) {
                        hooks.before_model_update(graph, item_id, &model)?;
                    }
                    updater.update_model_fields(graph, keeper, track_id, &model)?;
                    tracks.push(track_id);
                    models.push(vec![model]);
                }
            }
            tracing::debug!("create pass {}: {} models created", pass, tracks.len());
            if tracks.is_empty() {
                break;
            }
            let (creators, _) = updater.update_relationships(graph, keeper, &tracks, models)?;
            pending = creators;
        }
        Ok(())
    }

    /// Clearing a one-to-many must not orphan children whose back-pointer
    /// is required
    fn ensure_clearable(&self, graph: &ItemGraph, item: &Item, model: &A::Model, fkey: &str) -> Result<()> {
        let class = item.class();
        let Some(rel) = class.get_relation(fkey) else {
            return Ok(());
        };
        let Some(reverse_key) = rel.reverse_key.as_deref() else {
            return Ok(());
        };
        if rel.relation_type != RelationType::OneToMany {
            return Ok(());
        }
        let required_by_items = item
            .related(fkey)
            .iter()
            .any(|child| graph.item(*child).class().requires_for_create(reverse_key));
        let required_by_schema = self
            .adapter
            .schema(&class.model_cls)
            .and_then(|s| s.get_relation(fkey))
            .and_then(|r| self.adapter.schema(&r.target))
            .is_some_and(|s| s.is_required(reverse_key));
        if (required_by_items || required_by_schema) && self.adapter.related_x_to_many_exists(model, fkey)? {
            return Err(Error::CannotClearRequiredFieldInRelation {
                class: class.name.clone(),
                fkey: fkey.to_string(),
                other_class: rel.item_class.clone(),
                other_field: reverse_key.to_string(),
            });
        }
        Ok(())
    }
}
