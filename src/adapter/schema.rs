//! Model schemas - what an adapter knows about its tables

use crate::relation::RelationType;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One relation attribute of a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationSchema {
    pub name: String,
    /// Target model class
    pub target: String,
    pub relation_type: RelationType,
    /// Attribute on the target pointing back here
    #[serde(default)]
    pub reverse_key: Option<String>,
    /// Column holding the target's primary key (owning x-to-one side)
    #[serde(default)]
    pub foreign_key: Option<String>,
    /// Link table for many-to-many relations
    #[serde(default)]
    pub join_table: Option<String>,
}

impl RelationSchema {
    pub fn new(name: &str, relation_type: RelationType, target: &str) -> Self {
        Self {
            name: name.to_string(),
            target: target.to_string(),
            relation_type,
            reverse_key: None,
            foreign_key: None,
            join_table: None,
        }
    }

    pub fn with_reverse(mut self, reverse_key: &str) -> Self {
        self.reverse_key = Some(reverse_key.to_string());
        self
    }
}

/// Schema of a model class (one table).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSchema {
    pub name: String,
    /// Scalar columns, primary key included
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default = "default_primary_key")]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub relations: Vec<RelationSchema>,
    /// Unique constraints; entries may name scalar fields or relations
    #[serde(default)]
    pub unique_together: Vec<Vec<String>>,
    /// Fields and relations that may not be null
    #[serde(default)]
    pub required: Vec<String>,
}

fn default_primary_key() -> Vec<String> {
    vec!["id".to_string()]
}

impl ModelSchema {
    /// New schema with an auto-increment `id` primary key
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: vec!["id".to_string()],
            primary_key: default_primary_key(),
            relations: Vec::new(),
            unique_together: Vec::new(),
            required: Vec::new(),
        }
    }

    pub fn field(mut self, name: &str) -> Self {
        if !self.fields.iter().any(|f| f == name) {
            self.fields.push(name.to_string());
        }
        self
    }

    pub fn fields(self, names: &[&str]) -> Self {
        names.iter().fold(self, |schema, name| schema.field(name))
    }

    /// Replace the primary key; key columns are added as fields
    pub fn primary_key(mut self, names: &[&str]) -> Self {
        if self.primary_key == default_primary_key() && !names.contains(&"id") {
            self.fields.retain(|f| f != "id");
        }
        self.primary_key = names.iter().map(|n| n.to_string()).collect();
        names.iter().fold(self, |schema, name| schema.field(name))
    }

    pub fn relation(mut self, relation: RelationSchema) -> Self {
        self.relations.push(relation);
        self
    }

    /// Many-to-one relation stored in a `<name>_id` column
    pub fn many_to_one(self, name: &str, target: &str, reverse_key: Option<&str>) -> Self {
        let mut rel = RelationSchema::new(name, RelationType::ManyToOne, target);
        rel.reverse_key = reverse_key.map(str::to_string);
        rel.foreign_key = Some(format!("{}_id", name));
        self.relation(rel)
    }

    pub fn one_to_many(self, name: &str, target: &str, reverse_key: Option<&str>) -> Self {
        let mut rel = RelationSchema::new(name, RelationType::OneToMany, target);
        rel.reverse_key = reverse_key.map(str::to_string);
        self.relation(rel)
    }

    /// One-to-one relation; the owning side stores the `<name>_id` column
    pub fn one_to_one(self, name: &str, target: &str, reverse_key: Option<&str>, owner: bool) -> Self {
        let mut rel = RelationSchema::new(name, RelationType::OneToOne, target);
        rel.reverse_key = reverse_key.map(str::to_string);
        if owner {
            rel.foreign_key = Some(format!("{}_id", name));
        }
        self.relation(rel)
    }

    pub fn many_to_many(self, name: &str, target: &str, reverse_key: Option<&str>, join_table: &str) -> Self {
        let mut rel = RelationSchema::new(name, RelationType::ManyToMany, target);
        rel.reverse_key = reverse_key.map(str::to_string);
        rel.join_table = Some(join_table.to_string());
        self.relation(rel)
    }

    pub fn unique(mut self, names: &[&str]) -> Self {
        self.unique_together.push(names.iter().map(|n| n.to_string()).collect());
        self
    }

    pub fn required(mut self, names: &[&str]) -> Self {
        self.required.extend(names.iter().map(|n| n.to_string()));
        self
    }

    pub fn get_relation(&self, name: &str) -> Option<&RelationSchema> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f == name)
    }

    pub fn is_required(&self, name: &str) -> bool {
        self.required.iter().any(|f| f == name)
    }

    /// Single integer `id` key filled in on first save
    pub fn is_auto_increment(&self) -> bool {
        self.primary_key.len() == 1 && self.primary_key[0] == "id"
    }

    pub fn x_to_one_relations(&self) -> impl Iterator<Item = &RelationSchema> {
        self.relations.iter().filter(|r| r.relation_type.is_x_to_one())
    }

    pub fn x_to_many_relations(&self) -> impl Iterator<Item = &RelationSchema> {
        self.relations.iter().filter(|r| r.relation_type.is_x_to_many())
    }
}

/// All model schemas known to an adapter.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    models: BTreeMap<String, ModelSchema>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, schema: ModelSchema) {
        self.models.insert(schema.name.clone(), schema);
    }

    pub fn with(mut self, schema: ModelSchema) -> Self {
        self.add(schema);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ModelSchema> {
        self.models.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&ModelSchema> {
        self.get(name).ok_or_else(|| Error::UnknownModel(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelSchema> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Check that relation targets exist and reverse keys agree on cardinality
    pub fn validate(&self) -> Result<()> {
        for schema in self.models.values() {
            if schema.primary_key.is_empty() {
                return Err(Error::InvalidConfig(format!("{} has no primary key", schema.name)));
            }
            for rel in &schema.relations {
                let target = self.get(&rel.target).ok_or_else(|| {
                    Error::InvalidConfig(format!(
                        "{}.{} targets unknown model {}",
                        schema.name, rel.name, rel.target
                    ))
                })?;
                let Some(reverse_key) = &rel.reverse_key else {
                    continue;
                };
                let reverse = target.get_relation(reverse_key).ok_or_else(|| {
                    Error::InvalidConfig(format!(
                        "{}.{} has unknown reverse key {}.{}",
                        schema.name, rel.name, rel.target, reverse_key
                    ))
                })?;
                if reverse.relation_type != rel.relation_type.reverse() || reverse.target != schema.name {
                    return Err(Error::InvalidConfig(format!(
                        "{}.{} ({}) does not mirror {}.{} ({})",
                        schema.name,
                        rel.name,
                        rel.relation_type,
                        rel.target,
                        reverse_key,
                        reverse.relation_type
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

    fn sample_catalog() -> Catalog {
        Catalog::new()
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
                    .required(&["author"]),
            )
    }

    #[test]
    fn test_builder() {
        let catalog = sample_catalog();
        let book = catalog.get("book").unwrap();
        assert!(book.is_auto_increment());
        assert!(book.is_required("author"));
        let rel = book.get_relation("author").unwrap();
        assert_eq!(rel.foreign_key.as_deref(), Some("author_id"));
        assert_eq!(book.x_to_one_relations().count(), 1);
    }

    #[test]
    fn test_composite_primary_key() {
        let schema = ModelSchema::new("pair").primary_key(&["left", "right"]);
        assert_eq!(schema.fields, vec!["left".to_string(), "right".to_string()]);
        assert!(!schema.is_auto_increment());
    }

    #[test]
    fn test_validate() {
        assert!(sample_catalog().validate().is_ok());

        let broken = Catalog::new().with(
            ModelSchema::new("book").many_to_one("author", "author", None),
        );
        assert!(broken.validate().is_err());

        let mismatched = Catalog::new()
            .with(ModelSchema::new("a").many_to_one("b", "b", Some("a")))
            .with(ModelSchema::new("b").one_to_one("a", "a", Some("b"), false));
        assert!(mismatched.validate().is_err());
    }
}
