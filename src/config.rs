use crate::adapter::schema::{Catalog, ModelSchema};
use crate::item::{ItemClass, Registry};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Declarative setup of a persister: models, item classes and batching.
///
/// ```toml
/// batch_size = 100
///
/// [[models]]
/// name = "author"
/// fields = ["name"]
/// unique_together = [["name"]]
///
/// [[items]]
/// name = "Author"
/// model_cls = "author"
/// fields = ["name"]
/// getters = [["name"]]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistConfig {
    /// Items per adapter lookup, unless an item class sets its own
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub models: Vec<ModelSchema>,
    /// Item classes; mirrored from the models when empty
    #[serde(default)]
    pub items: Vec<ItemClass>,
}

impl PersistConfig {
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: PersistConfig = toml::from_str(contents)?;
        if config.batch_size == Some(0) {
            return Err(Error::InvalidConfig("batch_size must be positive".to_string()));
        }
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    /// Validated catalog of the declared models
    pub fn catalog(&self) -> Result<Catalog> {
        let mut catalog = Catalog::new();
        for model in &self.models {
            let mut model = model.clone();
            for (idx, key) in model.primary_key.iter().enumerate() {
                if !model.fields.contains(key) {
                    model.fields.insert(idx.min(model.fields.len()), key.clone());
                }
            }
            catalog.add(model);
        }
        catalog.validate()?;
        Ok(catalog)
    }

    /// Validated registry of the declared item classes
    pub fn registry(&self) -> Result<Registry> {
        if self.items.is_empty() {
            return Registry::from_catalog(&self.catalog()?);
        }
        let mut registry = Registry::new();
        for class in &self.items {
            registry.register(class.clone());
        }
        registry.validate()?;
        Ok(registry)
    }

    pub fn item_class(&self, name: &str) -> Option<&ItemClass> {
        self.items.iter().find(|c| c.name == name)
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("rowgraph.toml")
}

pub fn load_config(path: Option<&Path>) -> Result<Option<PersistConfig>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    tracing::debug!("loading config from {}", path.display());
    PersistConfig::from_toml(&contents).map(Some)
}

pub fn write_config(path: &Path, config: &PersistConfig, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(Error::InvalidConfig(format!(
            "config already exists at {}",
            path.display()
        )));
    }

    std::fs::write(path, config.to_toml()?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relation::RelationType;

    const LIBRARY: &str = r#"
batch_size = 50

[[models]]
name = "author"
fields = ["name"]
unique_together = [["name"]]
relations = [{ name = "books", target = "book", relation_type = "one_to_many", reverse_key = "author" }]

[[models]]
name = "book"
fields = ["title"]
required = ["author"]
relations = [{ name = "author", target = "author", relation_type = "many_to_one", reverse_key = "books", foreign_key = "author_id" }]

[[items]]
name = "Author"
model_cls = "author"
fields = ["name"]
getters = [["name"]]

[items.relations.books]
item_class = "Book"
relation_type = "one_to_many"
reverse_key = "author"
replace_x_to_many = true

[[items]]
name = "Book"
model_cls = "book"
fields = ["title"]
getters = [["title", "author"]]
creators = [["title", "author"]]
norewrite_fields = { title = "if_null" }
batch_size = 10

[items.relations.author]
item_class = "Author"
relation_type = "many_to_one"
reverse_key = "books"
"#;

    #[test]
    fn test_parse_library() {
        let config = PersistConfig::from_toml(LIBRARY).unwrap();
        assert_eq!(config.batch_size, Some(50));
        assert_eq!(config.models.len(), 2);

        let catalog = config.catalog().unwrap();
        let author = catalog.get("author").unwrap();
        assert_eq!(author.fields, vec!["id".to_string(), "name".to_string()]);
        assert!(author.is_auto_increment());

        let registry = config.registry().unwrap();
        let book = registry.get("Book").unwrap();
        assert_eq!(book.batch_size, Some(10));
        assert_eq!(book.norewrite("title"), Some(crate::item::Rewrite::IfNull));
        assert!(registry.get("Author").unwrap().relations["books"].replace_x_to_many);
    }

    #[test]
    fn test_registry_mirrors_models() {
        let mut config = PersistConfig::from_toml(LIBRARY).unwrap();
        config.items.clear();
        let registry = config.registry().unwrap();
        let book = registry.get("book").unwrap();
        assert_eq!(book.creators, vec![vec!["author".to_string()]]);
        assert_eq!(book.relations["author"].relation_type, RelationType::ManyToOne);
        assert_eq!(registry.get("author").unwrap().getters, vec![vec!["name".to_string()]]);
    }

    #[test]
    fn test_bad_reverse_key_rejected() {
        let config = PersistConfig::from_toml(
            r#"
[[models]]
name = "book"
relations = [{ name = "author", target = "book", relation_type = "many_to_one", reverse_key = "missing" }]
"#,
        )
        .unwrap();
        assert!(matches!(config.catalog(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        assert!(matches!(
            PersistConfig::from_toml("batch_size = 0"),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_load_and_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rowgraph.toml");
        assert!(load_config(Some(&path)).unwrap().is_none());

        let config = PersistConfig::from_toml(LIBRARY).unwrap();
        write_config(&path, &config, false).unwrap();
        assert!(write_config(&path, &config, false).is_err());

        let loaded = load_config(Some(&path)).unwrap().unwrap();
        assert_eq!(loaded.models, config.models);
        assert_eq!(loaded.items, config.items);
    }
}
