//! In-memory adapter
//!
//! Rows live in per-model tables of `Record`s. `commit` snapshots every
//! row's state and `rollback` restores the last snapshot.

use super::record::{Record, RecordState};
use super::schema::{Catalog, ModelSchema, RelationSchema};
use super::{matches_selector, Adapter, Capabilities, Lookup, Model, Selector};
use crate::persist::matcher::{group_matches, GroupMatch};
use crate::relation::RelationType;
use crate::value::Value;
use crate::{Error, Result};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;

/// Counters of adapter calls
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterStats {
    pub gets: usize,
    pub creates: usize,
    pub saves: usize,
    pub deletes: usize,
    /// Model class of every created model, in creation order
    pub created_log: Vec<String>,
}

impl fmt::Display for AdapterStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Adapter Statistics:")?;
        writeln!(f, "  Gets:    {}", self.gets)?;
        writeln!(f, "  Creates: {}", self.creates)?;
        writeln!(f, "  Saves:   {}", self.saves)?;
        writeln!(f, "  Deletes: {}", self.deletes)?;
        Ok(())
    }
}

#[derive(Clone, Default)]
struct Snapshot {
    tables: BTreeMap<String, Vec<(Record, RecordState)>>,
    next_ids: BTreeMap<String, i64>,
}

/// Session over in-memory tables.
pub struct MemoryAdapter {
    catalog: Catalog,
    capabilities: Capabilities,
    tables: RefCell<BTreeMap<String, Vec<Record>>>,
    /// Created but never saved
    pending: RefCell<Vec<Record>>,
    next_ids: RefCell<BTreeMap<String, i64>>,
    snapshot: RefCell<Snapshot>,
    stats: RefCell<AdapterStats>,
}

impl MemoryAdapter {
    pub fn new(catalog: Catalog) -> Self {
        let capabilities = Capabilities {
            save_model_before_commit: true,
            ..Capabilities::default()
        };
        Self::with_capabilities(catalog, capabilities)
    }

    pub fn with_capabilities(catalog: Catalog, capabilities: Capabilities) -> Self {
        let tables = catalog.iter().map(|s| (s.name.clone(), Vec::new())).collect();
        Self {
            catalog,
            capabilities,
            tables: RefCell::new(tables),
            pending: RefCell::new(Vec::new()),
            next_ids: RefCell::new(BTreeMap::new()),
            snapshot: RefCell::new(Snapshot::default()),
            stats: RefCell::new(AdapterStats::default()),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn stats(&self) -> AdapterStats {
        self.stats.borrow().clone()
    }

    /// Saved rows of a model class, in insertion order
    pub fn rows(&self, model_cls: &str) -> Vec<Record> {
        self.tables.borrow().get(model_cls).cloned().unwrap_or_default()
    }

    /// First saved row whose `field` equals `value`
    pub fn find(&self, model_cls: &str, field: &str, value: impl Into<Value>) -> Option<Record> {
        let value = value.into();
        self.rows(model_cls).into_iter().find(|r| r.get_field(field) == value)
    }

    /// Create and save a row with the given scalar values
    pub fn insert(&self, model_cls: &str, values: &[(&str, Value)]) -> Result<Record> {
        let record = self.create_blank_model(model_cls)?;
        for (field, value) in values {
            record.set_field(field, value.clone());
        }
        self.save_model(&record)?;
        Ok(record)
    }

    fn require_schema(&self, model_cls: &str) -> Result<&ModelSchema> {
        self.catalog.require(model_cls)
    }

    fn relation_of(&self, model: &Record, fkey: &str) -> Result<&RelationSchema> {
        self.require_schema(model.model_cls())?
            .get_relation(fkey)
            .ok_or_else(|| Error::UnknownField {
                class: model.model_cls().to_string(),
                field: fkey.to_string(),
            })
    }

    fn blank(&self, schema: &ModelSchema) -> Record {
        let record = Record::new(&schema.name);
        for field in &schema.fields {
            record.set_field(field, Value::Null);
        }
        for rel in &schema.relations {
            record.init_relation(&rel.name, rel.relation_type.is_x_to_many());
        }
        record
    }

    fn assign_key(&self, schema: &ModelSchema, record: &Record) {
        if !schema.is_auto_increment() {
            return;
        }
        let mut next_ids = self.next_ids.borrow_mut();
        let next = next_ids.entry(schema.name.clone()).or_insert(1);
        match record.get_field("id").as_i64() {
            Some(id) => *next = (*next).max(id + 1),
            None => {
                record.set_field("id", Value::Int(*next));
                *next += 1;
            }
        }
    }

    // ========== Relation Maintenance ==========

    /// Point `model.fkey` at `target`, keeping the reverse side in step
    fn link_one(&self, model: &Record, fkey: &str, target: Option<&Record>, mirror: bool) -> Result<()> {
        let rel = self.relation_of(model, fkey)?;
        if !rel.relation_type.is_x_to_one() {
            return Err(Error::Adapter(format!("{}.{} is not an x-to-one relation", model.model_cls(), fkey)));
        }
        let old = model.get_relation(fkey);
        model.set_relation(fkey, target);

        let Some(reverse_key) = rel.reverse_key.as_deref().filter(|_| mirror) else {
            return Ok(());
        };
        if let Some(old) = old.filter(|o| Some(o) != target) {
            match rel.relation_type {
                RelationType::OneToOne => {
                    if old.get_relation(reverse_key).as_ref() == Some(model) {
                        old.set_relation(reverse_key, None);
                    }
                }
                _ => old.remove_relation_members(reverse_key, std::slice::from_ref(model)),
            }
        }
        if let Some(target) = target {
            match rel.relation_type {
                RelationType::OneToOne => {
                    if let Some(previous) = target.get_relation(reverse_key) {
                        if &previous != model && previous.get_relation(fkey).as_ref() == Some(target) {
                            previous.set_relation(fkey, None);
                        }
                    }
                    target.set_relation(reverse_key, Some(model));
                }
                _ => target.add_relation_members(reverse_key, std::slice::from_ref(model)),
            }
        }
        Ok(())
    }

    fn add_members(&self, model: &Record, fkey: &str, members: &[Record], mirror: bool) -> Result<()> {
        let rel = self.relation_of(model, fkey)?;
        match (rel.relation_type, rel.reverse_key.as_deref()) {
            (RelationType::OneToMany, Some(reverse_key)) if mirror => {
                for member in members {
                    self.link_one(member, reverse_key, Some(model), true)?;
                }
            }
            (RelationType::ManyToMany, Some(reverse_key)) if mirror => {
                model.add_relation_members(fkey, members);
                for member in members {
                    member.add_relation_members(reverse_key, std::slice::from_ref(model));
                }
            }
            _ => model.add_relation_members(fkey, members),
        }
        Ok(())
    }

    fn remove_members(&self, model: &Record, fkey: &str, members: &[Record]) -> Result<()> {
        let rel = self.relation_of(model, fkey)?;
        let mirror = self.capabilities.reverse_model_autoupdate;
        model.remove_relation_members(fkey, members);
        match (rel.relation_type, rel.reverse_key.as_deref()) {
            (RelationType::OneToMany, Some(reverse_key)) if mirror => {
                for member in members {
                    if member.get_relation(reverse_key).as_ref() == Some(model) {
                        member.set_relation(reverse_key, None);
                    }
                }
            }
            (RelationType::ManyToMany, Some(reverse_key)) if mirror => {
                for member in members {
                    member.remove_relation_members(reverse_key, std::slice::from_ref(model));
                }
            }
            _ => {}
        }
        Ok(())
    }

    // ========== Loading (used by backing stores) ==========

    /// Insert an already-persisted row without counting it as a create
    pub(crate) fn load_record(&self, model_cls: &str, values: BTreeMap<String, Value>) -> Result<Record> {
        let schema = self.require_schema(model_cls)?;
        let record = self.blank(schema);
        for (field, value) in values {
            record.set_field(&field, value);
        }
        self.assign_key(schema, &record);
        self.tables
            .borrow_mut()
            .entry(model_cls.to_string())
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    /// Link two loaded rows, mirroring onto the reverse side
    pub(crate) fn load_link(&self, model: &Record, fkey: &str, target: &Record) -> Result<()> {
        let rel = self.relation_of(model, fkey)?;
        if rel.relation_type.is_x_to_one() {
            self.link_one(model, fkey, Some(target), true)
        } else {
            self.add_members(model, fkey, std::slice::from_ref(target), true)
        }
    }

    /// Row states as of the last commit
    pub(crate) fn committed_rows(&self, model_cls: &str) -> Vec<(Record, RecordState)> {
        self.snapshot.borrow().tables.get(model_cls).cloned().unwrap_or_default()
    }

    /// Take a snapshot without touching the backing store
    pub(crate) fn mark_committed(&self) {
        let tables = self
            .tables
            .borrow()
            .iter()
            .map(|(name, rows)| (name.clone(), rows.iter().map(|r| (r.clone(), r.state())).collect()))
            .collect();
        *self.snapshot.borrow_mut() = Snapshot {
            tables,
            next_ids: self.next_ids.borrow().clone(),
        };
        self.pending.borrow_mut().clear();
    }
}

impl Adapter for MemoryAdapter {
    type Model = Record;

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn schema(&self, model_cls: &str) -> Option<&ModelSchema> {
        self.catalog.get(model_cls)
    }

    fn get(&self, lookups: &[Lookup<'_, Record>]) -> Result<Vec<Record>> {
        let Some(first) = lookups.first() else {
            return Ok(Vec::new());
        };
        self.stats.borrow_mut().gets += 1;
        let model_cls = first.item.class().model_cls.clone();

        let mut found: Vec<Record> = Vec::new();
        for row in self.rows(&model_cls) {
            'lookups: for lookup in lookups {
                for group in &lookup.item.class().getters {
                    if group_matches(self, lookup.item, lookup.fkeys, group, &row)? == GroupMatch::Matched {
                        found.push(row.clone());
                        break 'lookups;
                    }
                }
            }
        }
        tracing::trace!("get {}: {} lookups, {} rows", model_cls, lookups.len(), found.len());
        Ok(found)
    }

    fn create_blank_model(&self, model_cls: &str) -> Result<Record> {
        let schema = self.require_schema(model_cls)?;
        let record = self.blank(schema);
        self.pending.borrow_mut().push(record.clone());
        let mut stats = self.stats.borrow_mut();
        stats.creates += 1;
        stats.created_log.push(model_cls.to_string());
        Ok(record)
    }

    fn save_model(&self, model: &Record) -> Result<()> {
        let schema = self.require_schema(model.model_cls())?;
        self.stats.borrow_mut().saves += 1;

        let saved = self
            .tables
            .borrow()
            .get(model.model_cls())
            .is_some_and(|rows| rows.contains(model));
        if saved {
            return Ok(());
        }
        self.pending.borrow_mut().retain(|r| r != model);
        self.assign_key(schema, model);
        self.tables
            .borrow_mut()
            .entry(model.model_cls().to_string())
            .or_default()
            .push(model.clone());
        Ok(())
    }

    fn delete(&self, model: &Record) -> Result<()> {
        let schema = self.require_schema(model.model_cls())?;
        for rel in &schema.relations {
            if rel.relation_type.is_x_to_one() {
                self.link_one(model, &rel.name, None, self.capabilities.reverse_model_autoupdate)?;
            } else {
                let members = model.related_members(&rel.name);
                self.remove_members(model, &rel.name, &members)?;
            }
        }

        // Rows linking here without a declared reverse key
        let everyone: Vec<Record> = self
            .tables
            .borrow()
            .values()
            .flatten()
            .chain(self.pending.borrow().iter())
            .cloned()
            .collect();
        for row in everyone.iter().filter(|r| *r != model) {
            row.drop_links_to(model);
        }

        if let Some(rows) = self.tables.borrow_mut().get_mut(model.model_cls()) {
            rows.retain(|r| r != model);
        }
        self.pending.borrow_mut().retain(|r| r != model);
        self.stats.borrow_mut().deletes += 1;
        Ok(())
    }

    fn execute_delete(&self, model_cls: &str, selectors: &[Selector], keepers: &[Selector]) -> Result<usize> {
        if selectors.is_empty() {
            return Ok(0);
        }
        let doomed: Vec<Record> = self
            .rows(model_cls)
            .into_iter()
            .filter(|r| selectors.iter().any(|s| matches_selector(r, s)))
            .filter(|r| !keepers.iter().any(|k| matches_selector(r, k)))
            .collect();
        for row in &doomed {
            self.delete(row)?;
        }
        tracing::debug!("deleted {} rows from {}", doomed.len(), model_cls);
        Ok(doomed.len())
    }

    fn commit(&self) -> Result<()> {
        self.mark_committed();
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        let snapshot = self.snapshot.borrow().clone();
        let mut tables: BTreeMap<String, Vec<Record>> =
            self.catalog.iter().map(|s| (s.name.clone(), Vec::new())).collect();
        for (name, rows) in snapshot.tables {
            let restored = tables.entry(name).or_default();
            for (record, state) in rows {
                record.restore(state);
                restored.push(record);
            }
        }
        *self.tables.borrow_mut() = tables;
        *self.next_ids.borrow_mut() = snapshot.next_ids;
        self.pending.borrow_mut().clear();
        Ok(())
    }

    fn set_related_model(&self, model: &Record, fkey: &str, target: Option<&Record>) -> Result<()> {
        self.link_one(model, fkey, target, self.capabilities.reverse_model_autoupdate)
    }

    fn add_related_models(&self, model: &Record, fkey: &str, members: &[Record]) -> Result<()> {
        self.add_members(model, fkey, members, self.capabilities.reverse_model_autoupdate)
    }

    fn remove_related_models(&self, model: &Record, fkey: &str, members: &[Record]) -> Result<()> {
        self.remove_members(model, fkey, members)
    }

    fn clear_related_models(&self, model: &Record, fkey: &str) -> Result<()> {
        let members = model.related_members(fkey);
        self.remove_members(model, fkey, &members)
    }
}
