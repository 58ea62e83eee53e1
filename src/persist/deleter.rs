//! Model deleter - collects selector/keeper tuples from persisted models
//!
//! A selector tuple marks a slice of rows as managed; a keeper tuple
//! marks one row inside it as still wanted. Executing deletes (or
//! unlinks) every managed row that no keeper protects.

use crate::adapter::{Adapter, Model, Selector};
use crate::item::DeleterConfig;
use crate::Result;

#[derive(Debug, Clone)]
pub struct ModelDeleter {
    model_cls: String,
    selector_fields: Vec<String>,
    keeper_fields: Vec<String>,
    selectors: Vec<Selector>,
    keepers: Vec<Selector>,
}

impl ModelDeleter {
    /// `primary_key` supplies the keeper fields when the config has none
    pub fn new(model_cls: &str, config: &DeleterConfig, primary_key: &[String]) -> Self {
        Self {
            model_cls: model_cls.to_string(),
            selector_fields: config.selectors.clone(),
            keeper_fields: config.keepers.clone().unwrap_or_else(|| primary_key.to_vec()),
            selectors: Vec::new(),
            keepers: Vec::new(),
        }
    }

    fn tuple<M: Model>(model: &M, fields: &[String]) -> Selector {
        fields.iter().map(|f| (f.clone(), model.get_field(f))).collect()
    }

    pub fn collect_model<M: Model>(&mut self, model: &M) {
        let selector = Self::tuple(model, &self.selector_fields);
        if !self.selectors.contains(&selector) {
            self.selectors.push(selector);
        }
        let keeper = Self::tuple(model, &self.keeper_fields);
        if !self.keepers.contains(&keeper) {
            self.keepers.push(keeper);
        }
    }

    pub fn reset(&mut self) {
        self.selectors.clear();
        self.keepers.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.selectors.is_empty()
    }

    pub fn selectors(&self) -> &[Selector] {
        &self.selectors
    }

    pub fn keepers(&self) -> &[Selector] {
        &self.keepers
    }

    /// Delete unprotected rows of the model class, then reset
    pub fn execute<A: Adapter>(&mut self, adapter: &A) -> Result<usize> {
        if self.is_empty() {
            return Ok(0);
        }
        let deleted = adapter.execute_delete(&self.model_cls, &self.selectors, &self.keepers)?;
        self.reset();
        Ok(deleted)
    }

    /// Unlink unprotected members of `parent.fkey`, then reset
    pub fn execute_unref<A: Adapter>(&mut self, adapter: &A, parent: &A::Model, fkey: &str) -> Result<usize> {
        if self.is_empty() {
            return Ok(0);
        }
        let removed = adapter.execute_unref(parent, fkey, &self.selectors, &self.keepers)?;
        self.reset();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::memory::MemoryAdapter;
    use crate::adapter::schema::{Catalog, ModelSchema};
    use crate::value::Value;

    #[test]
    fn test_collect_and_execute() {
        let adapter = MemoryAdapter::new(Catalog::new().with(ModelSchema::new("row").fields(&["batch", "name"])));
        let keep = adapter
            .insert("row", &[("batch", Value::from("b1")), ("name", Value::from("keep"))])
            .unwrap();
        adapter
            .insert("row", &[("batch", Value::from("b1")), ("name", Value::from("stale"))])
            .unwrap();
        let other = adapter
            .insert("row", &[("batch", Value::from("b2")), ("name", Value::from("other"))])
            .unwrap();

        let config = DeleterConfig::new(&["batch"]);
        let mut deleter = ModelDeleter::new("row", &config, &["id".to_string()]);
        deleter.collect_model(&keep);
        deleter.collect_model(&keep);
        assert_eq!(deleter.selectors().len(), 1);
        assert_eq!(deleter.keepers()[0]["id"], Value::Int(1));

        assert_eq!(deleter.execute(&adapter).unwrap(), 1);
        assert!(deleter.is_empty());
        assert_eq!(adapter.rows("row"), vec![keep, other]);
    }
}
