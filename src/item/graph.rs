//! Item graph - an arena of items addressed by `ItemId`
//!
//! Items reference each other through relation fields. References may
//! form cycles and may be shared, so items live in one arena and refer
//! to each other by index.

use super::ItemClass;
use crate::value::Value;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::rc::Rc;

/// Arena index of an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(pub u32);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Value stored under a field name of an item.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Scalar(Value),
    /// x-to-one relation target
    Single(ItemId),
    /// x-to-many relation members
    Bulk(Vec<ItemId>),
    /// Relation explicitly set to nothing
    Null,
}

/// A desired record.
#[derive(Debug, Clone)]
pub struct Item {
    pub id: ItemId,
    class: Rc<ItemClass>,
    data: BTreeMap<String, FieldValue>,
    get_only_mode: Option<bool>,
    update_only_mode: Option<bool>,
}

impl Item {
    pub fn class(&self) -> &ItemClass {
        &self.class
    }

    pub fn class_rc(&self) -> &Rc<ItemClass> {
        &self.class
    }

    pub fn contains(&self, field: &str) -> bool {
        self.data.contains_key(field)
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.data.get(field)
    }

    pub fn scalar(&self, field: &str) -> Option<&Value> {
        match self.data.get(field) {
            Some(FieldValue::Scalar(v)) => Some(v),
            _ => None,
        }
    }

    /// Items referenced through `field` (empty for scalars and nulls)
    pub fn related(&self, field: &str) -> Vec<ItemId> {
        match self.data.get(field) {
            Some(FieldValue::Single(id)) => vec![*id],
            Some(FieldValue::Bulk(ids)) => ids.clone(),
            _ => Vec::new(),
        }
    }

    pub fn data(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.data.iter()
    }

    pub fn get_only_mode(&self) -> bool {
        self.get_only_mode.unwrap_or(self.class.get_only_mode)
    }

    pub fn update_only_mode(&self) -> bool {
        self.update_only_mode.unwrap_or(self.class.update_only_mode)
    }

    pub(crate) fn mode_overrides(&self) -> (Option<bool>, Option<bool>) {
        (self.get_only_mode, self.update_only_mode)
    }
}

/// Items grouped by class in first-visit order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemStructure {
    pub groups: Vec<(String, Vec<ItemId>)>,
}

impl ItemStructure {
    pub fn len(&self) -> usize {
        self.groups.iter().map(|(_, ids)| ids.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// All items in group order
    pub fn items(&self) -> impl Iterator<Item = ItemId> + '_ {
        self.groups.iter().flat_map(|(_, ids)| ids.iter().copied())
    }
}

/// Arena of items.
#[derive(Debug, Clone, Default)]
pub struct ItemGraph {
    items: Vec<Item>,
}

impl ItemGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, class: &Rc<ItemClass>) -> ItemId {
        let id = ItemId(self.items.len() as u32);
        self.items.push(Item {
            id,
            class: Rc::clone(class),
            data: BTreeMap::new(),
            get_only_mode: None,
            update_only_mode: None,
        });
        id
    }

    pub fn item(&self, id: ItemId) -> &Item {
        &self.items[id.0 as usize]
    }

    pub fn get(&self, id: ItemId) -> Option<&Item> {
        self.items.get(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Item> {
        self.items.iter()
    }

    fn item_mut(&mut self, id: ItemId) -> Result<&mut Item> {
        self.items
            .get_mut(id.0 as usize)
            .ok_or_else(|| Error::InvalidConfig(format!("no item {}", id)))
    }

    /// Set a scalar field
    pub fn set(&mut self, id: ItemId, field: &str, value: impl Into<Value>) -> Result<()> {
        let item = self.item_mut(id)?;
        if !item.class.has_field(field) {
            return Err(Error::UnknownField {
                class: item.class.name.clone(),
                field: field.to_string(),
            });
        }
        item.data.insert(field.to_string(), FieldValue::Scalar(value.into()));
        Ok(())
    }

    /// Point a relation at `target`; x-to-many relations accumulate
    pub fn link(&mut self, id: ItemId, relation: &str, target: ItemId) -> Result<()> {
        let target_class = self
            .get(target)
            .map(|t| t.class.name.clone())
            .ok_or_else(|| Error::InvalidConfig(format!("no item {}", target)))?;
        let item = self.item_mut(id)?;
        let rel = item.class.get_relation(relation).ok_or_else(|| Error::UnknownField {
            class: item.class.name.clone(),
            field: relation.to_string(),
        })?;
        if rel.item_class != target_class {
            return Err(Error::InvalidConfig(format!(
                "{}.{} expects {}, got {}",
                item.class.name, relation, rel.item_class, target_class
            )));
        }
        if rel.relation_type.is_x_to_one() {
            item.data.insert(relation.to_string(), FieldValue::Single(target));
        } else {
            match item.data.get_mut(relation) {
                Some(FieldValue::Bulk(ids)) => {
                    if !ids.contains(&target) {
                        ids.push(target);
                    }
                }
                _ => {
                    item.data.insert(relation.to_string(), FieldValue::Bulk(vec![target]));
                }
            }
        }
        Ok(())
    }

    /// Set an x-to-many relation to exactly `targets` (possibly none)
    pub fn link_all(&mut self, id: ItemId, relation: &str, targets: &[ItemId]) -> Result<()> {
        let item = self.item_mut(id)?;
        item.data.insert(relation.to_string(), FieldValue::Bulk(Vec::new()));
        for target in targets {
            self.link(id, relation, *target)?;
        }
        Ok(())
    }

    /// Explicitly clear a relation
    pub fn unlink(&mut self, id: ItemId, relation: &str) -> Result<()> {
        let item = self.item_mut(id)?;
        if !item.class.is_relation(relation) {
            return Err(Error::UnknownField {
                class: item.class.name.clone(),
                field: relation.to_string(),
            });
        }
        item.data.insert(relation.to_string(), FieldValue::Null);
        Ok(())
    }

    pub fn set_get_only_mode(&mut self, id: ItemId, enabled: bool) -> Result<()> {
        self.item_mut(id)?.get_only_mode = Some(enabled);
        Ok(())
    }

    pub fn set_update_only_mode(&mut self, id: ItemId, enabled: bool) -> Result<()> {
        self.item_mut(id)?.update_only_mode = Some(enabled);
        Ok(())
    }

    /// Every item reachable from `roots`, grouped by class in
    /// breadth-first visit order; each item appears once.
    pub fn flatten(&self, roots: &[ItemId]) -> ItemStructure {
        let mut structure = ItemStructure::default();
        let mut seen: HashSet<ItemId> = HashSet::new();
        let mut queue: VecDeque<ItemId> = roots.iter().copied().collect();

        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            let Some(item) = self.get(id) else { continue };
            let class = &item.class.name;
            match structure.groups.iter_mut().find(|(name, _)| name == class) {
                Some((_, ids)) => ids.push(id),
                None => structure.groups.push((class.clone(), vec![id])),
            }
            for value in item.data.values() {
                match value {
                    FieldValue::Single(target) => queue.push_back(*target),
                    FieldValue::Bulk(targets) => queue.extend(targets.iter().copied()),
                    _ => {}
                }
            }
        }
        structure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relation::RelationType;

    fn classes() -> (Rc<ItemClass>, Rc<ItemClass>) {
        let author = ItemClass::new("Author", "author")
            .field("name")
            .relation("books", RelationType::OneToMany, "Book", Some("author"));
        let book = ItemClass::new("Book", "book")
            .field("title")
            .relation("author", RelationType::ManyToOne, "Author", Some("books"));
        (Rc::new(author), Rc::new(book))
    }

    #[test]
    fn test_set_and_link() {
        let (author, book) = classes();
        let mut graph = ItemGraph::new();
        let a = graph.add(&author);
        let b1 = graph.add(&book);
        let b2 = graph.add(&book);
        graph.set(a, "name", "ann").unwrap();
        graph.link(a, "books", b1).unwrap();
        graph.link(a, "books", b2).unwrap();
        graph.link(a, "books", b1).unwrap();
        graph.link(b1, "author", a).unwrap();

        assert_eq!(graph.item(a).related("books"), vec![b1, b2]);
        assert_eq!(graph.item(a).scalar("name"), Some(&Value::from("ann")));
        assert_eq!(graph.item(b1).related("author"), vec![a]);
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let (author, book) = classes();
        let mut graph = ItemGraph::new();
        let a = graph.add(&author);
        let b = graph.add(&book);
        assert!(graph.set(a, "title", "x").is_err());
        assert!(graph.link(a, "author", b).is_err());
        assert!(graph.link(b, "author", b).is_err());
    }

    #[test]
    fn test_flatten_handles_cycles() {
        let (author, book) = classes();
        let mut graph = ItemGraph::new();
        let a = graph.add(&author);
        let b1 = graph.add(&book);
        let b2 = graph.add(&book);
        graph.link(a, "books", b1).unwrap();
        graph.link(a, "books", b2).unwrap();
        graph.link(b1, "author", a).unwrap();
        graph.link(b2, "author", a).unwrap();

        let structure = graph.flatten(&[b1]);
        assert_eq!(structure.len(), 3);
        assert_eq!(structure.groups[0], ("Book".to_string(), vec![b1, b2]));
        assert_eq!(structure.groups[1], ("Author".to_string(), vec![a]));
    }

    #[test]
    fn test_instance_mode_override() {
        let (author, _) = classes();
        let mut graph = ItemGraph::new();
        let a = graph.add(&author);
        assert!(!graph.item(a).get_only_mode());
        graph.set_get_only_mode(a, true).unwrap();
        assert!(graph.item(a).get_only_mode());
    }
}
