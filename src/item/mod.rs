//! Item classes - declarative descriptions of desired records
//!
//! An `ItemClass` says which model class its items persist into, which
//! field groups identify an existing row (getters), which groups suffice
//! to create one (creators), and how existing values may be overwritten.

pub mod dump;
pub mod graph;

pub use graph::{FieldValue, Item, ItemGraph, ItemId, ItemStructure};

use crate::adapter::schema::{Catalog, ModelSchema};
use crate::relation::RelationType;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

/// Overwrite policy for a field of an existing model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rewrite {
    /// Always overwrite
    Always,
    /// Only fill a field that currently has no value
    IfNull,
    /// Never overwrite an existing model
    Never,
}

impl Rewrite {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rewrite::Always => "always",
            Rewrite::IfNull => "if_null",
            Rewrite::Never => "never",
        }
    }
}

/// A relation declared on an item class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub item_class: String,
    pub relation_type: RelationType,
    #[serde(default)]
    pub reverse_key: Option<String>,
    /// Clear the existing collection before adding the item's members
    #[serde(default)]
    pub replace_x_to_many: bool,
}

/// Selector/keeper field lists for bulk deletes and unrefs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeleterConfig {
    pub selectors: Vec<String>,
    /// Defaults to the model's primary key
    #[serde(default)]
    pub keepers: Option<Vec<String>>,
    #[serde(default)]
    pub execute_on_persist: bool,
}

impl DeleterConfig {
    pub fn new(selectors: &[&str]) -> Self {
        Self {
            selectors: selectors.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn keepers(mut self, keepers: &[&str]) -> Self {
        self.keepers = Some(keepers.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn on_persist(mut self) -> Self {
        self.execute_on_persist = true;
        self
    }
}

/// Declaration of a kind of item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemClass {
    pub name: String,
    pub model_cls: String,
    #[serde(default)]
    pub fields: BTreeSet<String>,
    #[serde(default)]
    pub relations: BTreeMap<String, Relation>,
    /// Ordered groups of fields identifying an existing model
    #[serde(default)]
    pub getters: Vec<Vec<String>>,
    /// Groups of fields sufficient to create a model; empty means always
    #[serde(default)]
    pub creators: Vec<Vec<String>>,
    #[serde(default)]
    pub norewrite_fields: BTreeMap<String, Rewrite>,
    /// Policy for fields not listed in `norewrite_fields`
    #[serde(default)]
    pub norewrite_default: Option<Rewrite>,
    #[serde(default)]
    pub get_only_mode: bool,
    #[serde(default)]
    pub update_only_mode: bool,
    #[serde(default)]
    pub allow_multi_update: bool,
    /// Skip lookups entirely and always create
    #[serde(default)]
    pub fast_insert: bool,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub deleter: Option<DeleterConfig>,
    #[serde(default)]
    pub unref_x_to_many: BTreeMap<String, DeleterConfig>,
}

impl ItemClass {
    pub fn new(name: &str, model_cls: &str) -> Self {
        Self {
            name: name.to_string(),
            model_cls: model_cls.to_string(),
            fields: BTreeSet::new(),
            relations: BTreeMap::new(),
            getters: Vec::new(),
            creators: Vec::new(),
            norewrite_fields: BTreeMap::new(),
            norewrite_default: None,
            get_only_mode: false,
            update_only_mode: false,
            allow_multi_update: false,
            fast_insert: false,
            batch_size: None,
            deleter: None,
            unref_x_to_many: BTreeMap::new(),
        }
    }

    /// Mirror a model schema: scalar fields, relations (item class named
    /// after the target model), getters from unique constraints and one
    /// creator group of required fields.
    pub fn from_schema(schema: &ModelSchema) -> Self {
        let mut class = Self::new(&schema.name, &schema.name);
        for field in &schema.fields {
            if schema.is_auto_increment() && schema.primary_key.contains(field) {
                continue;
            }
            class.fields.insert(field.clone());
        }
        for rel in &schema.relations {
            class.relations.insert(
                rel.name.clone(),
                Relation {
                    item_class: rel.target.clone(),
                    relation_type: rel.relation_type,
                    reverse_key: rel.reverse_key.clone(),
                    replace_x_to_many: false,
                },
            );
        }
        class.getters = schema.unique_together.clone();
        if !schema.is_auto_increment() {
            class.getters.insert(0, schema.primary_key.clone());
        }
        if !schema.required.is_empty() {
            class.creators = vec![schema.required.clone()];
        }
        class
    }

    pub fn field(mut self, name: &str) -> Self {
        self.fields.insert(name.to_string());
        self
    }

    pub fn fields(self, names: &[&str]) -> Self {
        names.iter().fold(self, |class, name| class.field(name))
    }

    pub fn relation(mut self, name: &str, relation_type: RelationType, item_class: &str, reverse_key: Option<&str>) -> Self {
        self.relations.insert(
            name.to_string(),
            Relation {
                item_class: item_class.to_string(),
                relation_type,
                reverse_key: reverse_key.map(str::to_string),
                replace_x_to_many: false,
            },
        );
        self
    }

    pub fn replace_x_to_many(mut self, name: &str) -> Self {
        if let Some(rel) = self.relations.get_mut(name) {
            rel.replace_x_to_many = true;
        }
        self
    }

    pub fn getter(mut self, group: &[&str]) -> Self {
        self.getters.push(group.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn creator(mut self, group: &[&str]) -> Self {
        self.creators.push(group.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn with_norewrite(mut self, field: &str, rewrite: Rewrite) -> Self {
        self.norewrite_fields.insert(field.to_string(), rewrite);
        self
    }

    pub fn get_only(mut self) -> Self {
        self.get_only_mode = true;
        self
    }

    pub fn update_only(mut self) -> Self {
        self.update_only_mode = true;
        self
    }

    pub fn multi_update(mut self) -> Self {
        self.allow_multi_update = true;
        self
    }

    pub fn fast_insert(mut self) -> Self {
        self.fast_insert = true;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_deleter(mut self, deleter: DeleterConfig) -> Self {
        self.deleter = Some(deleter);
        self
    }

    pub fn unref(mut self, fkey: &str, config: DeleterConfig) -> Self {
        self.unref_x_to_many.insert(fkey.to_string(), config);
        self
    }

    pub fn get_relation(&self, name: &str) -> Option<&Relation> {
        self.relations.get(name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains(name)
    }

    pub fn is_relation(&self, name: &str) -> bool {
        self.relations.contains_key(name)
    }

    /// Effective rewrite policy; `None` means rewrite freely
    pub fn norewrite(&self, field: &str) -> Option<Rewrite> {
        self.norewrite_fields.get(field).copied().or(self.norewrite_default)
    }

    /// Whether `name` is a field of every creator group (required to create)
    pub fn requires_for_create(&self, name: &str) -> bool {
        !self.creators.is_empty() && self.creators.iter().all(|g| g.iter().any(|f| f == name))
    }
}

/// The set of item classes in use.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    classes: BTreeMap<String, Rc<ItemClass>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One item class per model, named after the model
    pub fn from_catalog(catalog: &Catalog) -> Result<Self> {
        let mut registry = Self::new();
        for schema in catalog.iter() {
            registry.register(ItemClass::from_schema(schema));
        }
        registry.validate()?;
        Ok(registry)
    }

    pub fn register(&mut self, class: ItemClass) -> Rc<ItemClass> {
        let class = Rc::new(class);
        self.classes.insert(class.name.clone(), Rc::clone(&class));
        class
    }

    pub fn get(&self, name: &str) -> Result<Rc<ItemClass>> {
        self.classes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownItemClass(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rc<ItemClass>> {
        self.classes.values()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Check cross-class references and group membership
    pub fn validate(&self) -> Result<()> {
        for class in self.classes.values() {
            for (name, rel) in &class.relations {
                let target = self.get(&rel.item_class)?;
                if let Some(reverse_key) = &rel.reverse_key {
                    let reverse = target.get_relation(reverse_key).ok_or_else(|| {
                        Error::InvalidConfig(format!(
                            "{}.{}: reverse key {}.{} is not declared",
                            class.name, name, target.name, reverse_key
                        ))
                    })?;
                    if reverse.relation_type != rel.relation_type.reverse() {
                        return Err(Error::InvalidConfig(format!(
                            "{}.{} ({}) does not mirror {}.{} ({})",
                            class.name, name, rel.relation_type, target.name, reverse_key, reverse.relation_type
                        )));
                    }
                }
            }
            for group in class.getters.iter().chain(class.creators.iter()) {
                for field in group {
                    if !class.has_field(field) && !class.is_relation(field) {
                        return Err(Error::UnknownField {
                            class: class.name.clone(),
                            field: field.clone(),
                        });
                    }
                }
            }
            for field in class.norewrite_fields.keys() {
                if !class.has_field(field) && !class.is_relation(field) {
                    return Err(Error::UnknownField {
                        class: class.name.clone(),
                        field: field.clone(),
                    });
                }
            }
            for fkey in class.unref_x_to_many.keys() {
                if !class.get_relation(fkey).is_some_and(|r| r.relation_type.is_x_to_many()) {
                    return Err(Error::InvalidConfig(format!(
                        "{}.{}: unref needs an x-to-many relation",
                        class.name, fkey
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_registry() -> Registry {
        let mut registry = Registry::new();
        registry.register(
            ItemClass::new("Author", "author")
                .fields(&["name", "email"])
                .relation("books", RelationType::OneToMany, "Book", Some("author"))
                .getter(&["email"])
                .with_norewrite("name", Rewrite::IfNull),
        );
        registry.register(
            ItemClass::new("Book", "book")
                .field("title")
                .relation("author", RelationType::ManyToOne, "Author", Some("books"))
                .getter(&["title", "author"])
                .creator(&["title", "author"]),
        );
        registry
    }

    #[test]
    fn test_registry_validate() {
        let registry = sample_registry();
        assert!(registry.validate().is_ok());
        assert!(matches!(registry.get("Nope"), Err(Error::UnknownItemClass(_))));
    }

    #[test]
    fn test_validate_rejects_unknown_getter_field() {
        let mut registry = Registry::new();
        registry.register(ItemClass::new("A", "a").field("x").getter(&["y"]));
        assert!(matches!(registry.validate(), Err(Error::UnknownField { .. })));
    }

    #[test]
    fn test_norewrite_default() {
        let mut class = ItemClass::new("A", "a").fields(&["x", "y"]).with_norewrite("x", Rewrite::Always);
        class.norewrite_default = Some(Rewrite::Never);
        assert_eq!(class.norewrite("x"), Some(Rewrite::Always));
        assert_eq!(class.norewrite("y"), Some(Rewrite::Never));
    }

    #[test]
    fn test_requires_for_create() {
        let registry = sample_registry();
        let book = registry.get("Book").unwrap();
        assert!(book.requires_for_create("author"));
        assert!(!registry.get("Author").unwrap().requires_for_create("name"));
    }

    #[test]
    fn test_from_catalog() {
        let catalog = Catalog::new()
            .with(
                ModelSchema::new("author")
                    .fields(&["name", "email"])
                    .one_to_many("books", "book", Some("author"))
                    .unique(&["email"]),
            )
            .with(
                ModelSchema::new("book")
                    .field("title")
                    .many_to_one("author", "author", Some("books"))
                    .unique(&["title", "author"])
                    .required(&["title", "author"]),
            );
        let registry = Registry::from_catalog(&catalog).unwrap();
        let author = registry.get("author").unwrap();
        assert!(!author.has_field("id"));
        assert_eq!(author.getters, vec![vec!["email".to_string()]]);
        assert!(author.creators.is_empty());
        let book = registry.get("book").unwrap();
        assert_eq!(book.creators, vec![vec!["title".to_string(), "author".to_string()]]);
        assert_eq!(book.get_relation("author").unwrap().item_class, "author");
    }

    #[test]
    fn test_class_from_toml() {
        let class: ItemClass = toml::from_str(
            r#"
            name = "Author"
            model_cls = "author"
            fields = ["name", "email"]
            getters = [["email"]]

            [relations.books]
            item_class = "Book"
            relation_type = "one_to_many"
            reverse_key = "author"
            replace_x_to_many = true

            [norewrite_fields]
            name = "never"
            "#,
        )
        .unwrap();
        assert_eq!(class.norewrite("name"), Some(Rewrite::Never));
        assert!(class.get_relation("books").unwrap().replace_x_to_many);
    }
}
