//! Table definitions derived from a model catalog
//!
//! One table per model named after it:
//! - scalar fields as columns (`id INTEGER PRIMARY KEY` for auto-increment keys)
//! - a `foreign_key` column per owning x-to-one relation
//! - `UNIQUE` constraints from `unique_together`
//! - a `(source_id, target_id)` link table per many-to-many pair

use crate::adapter::schema::{Catalog, ModelSchema, RelationSchema};
use crate::relation::RelationType;

/// Quote an identifier for SQL
pub fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Whether this side of a many-to-many relation owns the link table rows.
///
/// Exactly one side of a reciprocal pair is canonical: the one whose
/// `(model, relation)` sorts first.
pub fn is_canonical_link(model: &ModelSchema, rel: &RelationSchema) -> bool {
    match (&rel.join_table, &rel.reverse_key) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(_), Some(reverse_key)) => (model.name.as_str(), rel.name.as_str()) <= (rel.target.as_str(), reverse_key.as_str()),
    }
}

/// Column backing a field or relation name, if any
pub fn column_of<'a>(model: &'a ModelSchema, name: &'a str) -> Option<&'a str> {
    if model.has_field(name) {
        return Some(name);
    }
    model.get_relation(name).and_then(|r| r.foreign_key.as_deref())
}

fn create_table(model: &ModelSchema) -> String {
    let mut columns = Vec::new();
    for field in &model.fields {
        if model.is_auto_increment() && field == "id" {
            columns.push(format!("{} INTEGER PRIMARY KEY", quote(field)));
        } else {
            columns.push(quote(field));
        }
    }
    for rel in model.x_to_one_relations() {
        if let Some(fk) = &rel.foreign_key {
            columns.push(quote(fk));
        }
    }
    if !model.is_auto_increment() {
        let key: Vec<String> = model.primary_key.iter().map(|k| quote(k)).collect();
        columns.push(format!("PRIMARY KEY ({})", key.join(", ")));
    }
    for constraint in &model.unique_together {
        let cols: Option<Vec<String>> = constraint
            .iter()
            .map(|name| column_of(model, name).map(quote))
            .collect();
        if let Some(cols) = cols {
            columns.push(format!("UNIQUE ({})", cols.join(", ")));
        }
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        quote(&model.name),
        columns.join(",\n    ")
    )
}

fn create_link_table(join_table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    source_id NOT NULL,\n    target_id NOT NULL,\n    PRIMARY KEY (source_id, target_id)\n)",
        quote(join_table)
    )
}

/// All schema creation statements for a catalog
pub fn all_schema_statements(catalog: &Catalog) -> Vec<String> {
    let mut stmts = Vec::new();
    for model in catalog.iter() {
        stmts.push(create_table(model));
    }
    for model in catalog.iter() {
        for rel in &model.relations {
            if rel.relation_type == RelationType::ManyToMany && is_canonical_link(model, rel) {
                if let Some(join_table) = &rel.join_table {
                    stmts.push(create_link_table(join_table));
                }
            }
        }
    }
    stmts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_statements() {
        let catalog = Catalog::new()
            .with(
                ModelSchema::new("book")
                    .field("title")
                    .many_to_one("author", "author", Some("books"))
                    .many_to_many("tags", "tag", Some("books"), "book_tags")
                    .unique(&["title", "author"]),
            )
            .with(
                ModelSchema::new("tag")
                    .primary_key(&["label"])
                    .many_to_many("books", "book", Some("tags"), "book_tags"),
            );
        let stmts = all_schema_statements(&catalog);
        assert_eq!(stmts.len(), 3);
        assert!(stmts[0].contains("\"id\" INTEGER PRIMARY KEY"));
        assert!(stmts[0].contains("\"author_id\""));
        assert!(stmts[0].contains("UNIQUE (\"title\", \"author_id\")"));
        assert!(stmts[1].contains("PRIMARY KEY (\"label\")"));
        assert!(stmts[2].starts_with("CREATE TABLE IF NOT EXISTS \"book_tags\""));
    }

    #[test]
    fn test_one_canonical_side() {
        let book = ModelSchema::new("book").many_to_many("tags", "tag", Some("books"), "book_tags");
        let tag = ModelSchema::new("tag").many_to_many("books", "book", Some("tags"), "book_tags");
        assert!(is_canonical_link(&book, &book.relations[0]));
        assert!(!is_canonical_link(&tag, &tag.relations[0]));
    }
}
