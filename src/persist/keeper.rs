//! Process keeper - per-item resolution state for one persist call
//!
//! Every item reachable from the roots gets an `ItemTrack` holding the
//! models it resolved to and, per relation, the foreign models resolved
//! so far. Tracks live in an arena; `TrackSet`s are ordered,
//! class-grouped subsets used as work queues by the fixed-point loops.

use crate::adapter::{ForeignKeys, Model};
use crate::item::{Item, ItemClass, ItemGraph, ItemId, ItemStructure};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

/// Arena index of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub usize);

/// Resolution state of one item.
///
/// `models` and `fkeys` only grow during a persist, except when a merge
/// replaces absorbed models by the surviving one.
#[derive(Debug, Clone)]
pub struct ItemTrack<M> {
    pub item: ItemId,
    pub class: Rc<ItemClass>,
    pub models: Vec<M>,
    pub fkeys: ForeignKeys<M>,
}

impl<M: Model> ItemTrack<M> {
    fn new(item: ItemId, class: Rc<ItemClass>) -> Self {
        Self {
            item,
            class,
            models: Vec::new(),
            fkeys: ForeignKeys::new(),
        }
    }

    pub fn has_models(&self) -> bool {
        !self.models.is_empty()
    }

    /// Append unless already present; returns whether it was new
    pub fn push_model(&mut self, model: M) -> bool {
        if self.models.contains(&model) {
            return false;
        }
        self.models.push(model);
        true
    }

    /// Record a resolved foreign model (or null) for `fkey`
    pub fn push_fkey(&mut self, fkey: &str, model: Option<M>) -> bool {
        let entries = self.fkeys.entry(fkey.to_string()).or_default();
        if entries.contains(&model) {
            return false;
        }
        entries.push(model);
        true
    }

    /// Every scalar of `group` is present and every relation is resolved
    pub fn is_group_resolved(&self, item: &Item, group: &[String]) -> bool {
        group.iter().all(|field| {
            if self.class.is_relation(field) {
                item.contains(field) && self.fkeys.contains_key(field)
            } else {
                item.contains(field)
            }
        })
    }

    fn replace_model(&mut self, old: &M, new: &M) {
        if self.models.contains(old) {
            self.models.retain(|m| m != old);
            if !self.models.contains(new) {
                self.models.push(new.clone());
            }
        }
        self.replace_foreign(old, new);
    }

    fn replace_foreign(&mut self, old: &M, new: &M) {
        for entries in self.fkeys.values_mut() {
            if entries.iter().any(|e| e.as_ref() == Some(old)) {
                entries.retain(|e| e.as_ref() != Some(old));
                let new = Some(new.clone());
                if !entries.contains(&new) {
                    entries.push(new);
                }
            }
        }
    }
}

/// Ordered, class-grouped set of tracks.
#[derive(Debug, Clone, Default)]
pub struct TrackSet {
    groups: Vec<(String, Vec<TrackId>)>,
    members: HashSet<TrackId>,
}

impl TrackSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, class: &str, track: TrackId) {
        if !self.members.insert(track) {
            return;
        }
        match self.groups.iter_mut().find(|(name, _)| name == class) {
            Some((_, ids)) => ids.push(track),
            None => self.groups.push((class.to_string(), vec![track])),
        }
    }

    pub fn extend(&mut self, other: &TrackSet) {
        for (class, ids) in &other.groups {
            for id in ids {
                self.push(class, *id);
            }
        }
    }

    pub fn groups(&self) -> &[(String, Vec<TrackId>)] {
        &self.groups
    }

    pub fn contains(&self, track: TrackId) -> bool {
        self.members.contains(&track)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// True once every contained track holds at least one model
    pub fn is_empty<M: Model>(&self, keeper: &ProcessKeeper<M>) -> bool {
        self.members.iter().all(|t| keeper.get(*t).has_models())
    }
}

/// All tracks of one persist call.
pub struct ProcessKeeper<M> {
    tracks: Vec<ItemTrack<M>>,
    by_item: HashMap<ItemId, TrackId>,
    /// item -> tracks whose item data references it, with the relation
    referrers: HashMap<ItemId, Vec<(TrackId, String)>>,
    order: TrackSet,
}

impl<M: Model> ProcessKeeper<M> {
    pub fn build(graph: &ItemGraph, structure: &ItemStructure) -> Self {
        let mut keeper = Self {
            tracks: Vec::with_capacity(structure.len()),
            by_item: HashMap::new(),
            referrers: HashMap::new(),
            order: TrackSet::new(),
        };
        for (class, ids) in &structure.groups {
            for id in ids {
                let track = TrackId(keeper.tracks.len());
                let item = graph.item(*id);
                keeper.tracks.push(ItemTrack::new(*id, Rc::clone(item.class_rc())));
                keeper.by_item.insert(*id, track);
                keeper.order.push(class, track);
            }
        }
        for track in &keeper.tracks {
            let item = graph.item(track.item);
            for relation in item.class().relations.keys() {
                for target in item.related(relation) {
                    keeper
                        .referrers
                        .entry(target)
                        .or_default()
                        .push((keeper.by_item[&track.item], relation.clone()));
                }
            }
        }
        keeper
    }

    pub fn get(&self, track: TrackId) -> &ItemTrack<M> {
        &self.tracks[track.0]
    }

    pub fn get_mut(&mut self, track: TrackId) -> &mut ItemTrack<M> {
        &mut self.tracks[track.0]
    }

    pub fn track_of(&self, item: ItemId) -> Option<TrackId> {
        self.by_item.get(&item).copied()
    }

    pub fn referrers(&self, item: ItemId) -> &[(TrackId, String)] {
        self.referrers.get(&item).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every track, grouped by class in structure order
    pub fn all(&self) -> TrackSet {
        self.order.clone()
    }

    pub fn ids(&self) -> impl Iterator<Item = TrackId> + '_ {
        self.order.groups.iter().flat_map(|(_, ids)| ids.iter().copied())
    }

    pub fn tracks_of_class<'a>(&'a self, class: &'a str) -> impl Iterator<Item = &'a ItemTrack<M>> + 'a {
        self.tracks.iter().filter(move |t| t.class.name == class)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    /// True once every tracked item holds at least one model
    pub fn is_empty(&self) -> bool {
        self.tracks.iter().all(|t| t.has_models())
    }

    /// Substitute a merged-away model everywhere it is referenced
    pub fn replace_model(&mut self, old: &M, new: &M) {
        for track in &mut self.tracks {
            track.replace_model(old, new);
        }
    }

    /// Point foreign keys at `new` where they held `old`, leaving model lists alone
    pub fn replace_foreign(&mut self, old: &M, new: &M) {
        for track in &mut self.tracks {
            track.replace_foreign(old, new);
        }
    }
}
