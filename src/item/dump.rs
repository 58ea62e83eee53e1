//! JSON dump/load of item trees
//!
//! The root carries its class name; nested items take their class from
//! the relation. An item reached more than once gets an `"id"` on its
//! first occurrence and is written as `{"id": n}` afterwards.

use super::graph::{FieldValue, ItemGraph, ItemId};
use super::{ItemClass, Registry};
use crate::value::Value;
use crate::{Error, Result};
use serde_json::{json, Map};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

impl ItemGraph {
    /// Serialize the tree under `root`
    pub fn dump(&self, root: ItemId) -> Result<serde_json::Value> {
        let shared = self.shared_items(root);
        let mut ids = HashMap::new();
        let mut dumped = self.dump_item(root, &shared, &mut ids)?;
        if let serde_json::Value::Object(obj) = &mut dumped {
            obj.insert("class".to_string(), json!(self.item(root).class().name));
        }
        Ok(dumped)
    }

    /// Items reached more than once from `root`
    fn shared_items(&self, root: ItemId) -> HashSet<ItemId> {
        let mut counts: HashMap<ItemId, usize> = HashMap::new();
        let mut stack = vec![root];
        counts.insert(root, 1);
        while let Some(id) = stack.pop() {
            for (_, value) in self.item(id).data() {
                let targets = match value {
                    FieldValue::Single(t) => vec![*t],
                    FieldValue::Bulk(ts) => ts.clone(),
                    _ => continue,
                };
                for target in targets {
                    let count = counts.entry(target).or_insert(0);
                    *count += 1;
                    if *count == 1 {
                        stack.push(target);
                    }
                }
            }
        }
        counts.into_iter().filter(|(_, n)| *n > 1).map(|(id, _)| id).collect()
    }

    fn dump_item(
        &self,
        id: ItemId,
        shared: &HashSet<ItemId>,
        ids: &mut HashMap<ItemId, usize>,
    ) -> Result<serde_json::Value> {
        if let Some(n) = ids.get(&id) {
            return Ok(json!({ "id": n }));
        }
        let mut obj = Map::new();
        if shared.contains(&id) {
            let n = ids.len() + 1;
            ids.insert(id, n);
            obj.insert("id".to_string(), json!(n));
        }

        let item = self.item(id);
        let mut data = Map::new();
        for (field, value) in item.data() {
            let dumped = match value {
                FieldValue::Scalar(v) => serde_json::to_value(v)?,
                FieldValue::Single(target) => self.dump_item(*target, shared, ids)?,
                FieldValue::Bulk(targets) => serde_json::Value::Array(
                    targets
                        .iter()
                        .map(|t| self.dump_item(*t, shared, ids))
                        .collect::<Result<Vec<_>>>()?,
                ),
                FieldValue::Null => serde_json::Value::Null,
            };
            data.insert(field.clone(), dumped);
        }
        obj.insert("item".to_string(), serde_json::Value::Object(data));

        let (get_only, update_only) = item.mode_overrides();
        if let Some(flag) = get_only {
            obj.insert("get_only_mode".to_string(), json!(flag));
        }
        if let Some(flag) = update_only {
            obj.insert("update_only_mode".to_string(), json!(flag));
        }
        Ok(serde_json::Value::Object(obj))
    }

    /// Rebuild a dumped tree into this graph; returns the root
    pub fn load(&mut self, registry: &Registry, dumped: &serde_json::Value) -> Result<ItemId> {
        let class_name = dumped
            .get("class")
            .and_then(|c| c.as_str())
            .ok_or_else(|| Error::InvalidConfig("dumped item has no class".to_string()))?;
        let class = registry.get(class_name)?;
        let mut refs = HashMap::new();
        self.load_item(registry, &class, dumped, &mut refs)
    }

    fn load_item(
        &mut self,
        registry: &Registry,
        class: &Rc<ItemClass>,
        dumped: &serde_json::Value,
        refs: &mut HashMap<u64, ItemId>,
    ) -> Result<ItemId> {
        let ref_id = dumped.get("id").and_then(|v| v.as_u64());
        let Some(data) = dumped.get("item").and_then(|d| d.as_object()) else {
            return ref_id
                .and_then(|n| refs.get(&n).copied())
                .ok_or_else(|| Error::InvalidConfig(format!("dangling item reference: {}", dumped)));
        };

        let id = self.add(class);
        if let Some(n) = ref_id {
            refs.insert(n, id);
        }
        if let Some(flag) = dumped.get("get_only_mode").and_then(|v| v.as_bool()) {
            self.set_get_only_mode(id, flag)?;
        }
        if let Some(flag) = dumped.get("update_only_mode").and_then(|v| v.as_bool()) {
            self.set_update_only_mode(id, flag)?;
        }

        for (field, value) in data {
            let Some(rel) = class.get_relation(field) else {
                let scalar: Value = serde_json::from_value(value.clone())?;
                self.set(id, field, scalar)?;
                continue;
            };
            let target_class = registry.get(&rel.item_class)?;
            match value {
                serde_json::Value::Null => self.unlink(id, field)?,
                serde_json::Value::Array(members) => {
                    let mut targets = Vec::with_capacity(members.len());
                    for member in members {
                        targets.push(self.load_item(registry, &target_class, member, refs)?);
                    }
                    self.link_all(id, field, &targets)?;
                }
                nested => {
                    let target = self.load_item(registry, &target_class, nested, refs)?;
                    self.link(id, field, target)?;
                }
            }
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relation::RelationType;

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.register(
            ItemClass::new("Author", "author")
                .fields(&["name", "age"])
                .relation("books", RelationType::OneToMany, "Book", Some("author")),
        );
        registry.register(
            ItemClass::new("Book", "book")
                .field("title")
                .relation("author", RelationType::ManyToOne, "Author", Some("books")),
        );
        registry
    }

    #[test]
    fn test_dump_plain_tree() {
        let registry = registry();
        let mut graph = ItemGraph::new();
        let a = graph.add(&registry.get("Author").unwrap());
        let b = graph.add(&registry.get("Book").unwrap());
        graph.set(a, "name", "ann").unwrap();
        graph.set(b, "title", "t").unwrap();
        graph.link(a, "books", b).unwrap();

        let dumped = graph.dump(a).unwrap();
        assert_eq!(
            dumped,
            json!({
                "class": "Author",
                "item": {"name": "ann", "books": [{"item": {"title": "t"}}]}
            })
        );
    }

    #[test]
    fn test_cycle_roundtrip() {
        let registry = registry();
        let mut graph = ItemGraph::new();
        let a = graph.add(&registry.get("Author").unwrap());
        let b = graph.add(&registry.get("Book").unwrap());
        graph.set(a, "name", "ann").unwrap();
        graph.set(a, "age", 40).unwrap();
        graph.link(a, "books", b).unwrap();
        graph.link(b, "author", a).unwrap();
        graph.set_get_only_mode(b, true).unwrap();

        let dumped = graph.dump(a).unwrap();
        assert_eq!(dumped["id"], json!(1));
        assert_eq!(dumped["item"]["books"][0]["item"]["author"], json!({"id": 1}));

        let mut loaded = ItemGraph::new();
        let root = loaded.load(&registry, &dumped).unwrap();
        assert_eq!(loaded.len(), 2);
        let book = loaded.item(root).related("books")[0];
        assert_eq!(loaded.item(book).related("author"), vec![root]);
        assert!(loaded.item(book).get_only_mode());
        assert_eq!(loaded.item(root).scalar("age"), Some(&Value::Int(40)));
    }

    #[test]
    fn test_load_rejects_dangling_reference() {
        let registry = registry();
        let mut graph = ItemGraph::new();
        let dumped = json!({"class": "Author", "item": {"books": [{"id": 7}]}});
        assert!(graph.load(&registry, &dumped).is_err());
    }
}
