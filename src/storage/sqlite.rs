//! SQLite adapter implementation
//!
//! Rows are loaded into a `MemoryAdapter` session when the database is
//! opened. Persisting works against the session; `commit` writes every
//! row changed since the last commit back in one transaction.
//!
//! The whole database is held in memory while the adapter is open, so it
//! suits stores that fit comfortably in RAM.

use super::schema::{self, is_canonical_link, quote};
use crate::adapter::memory::MemoryAdapter;
use crate::adapter::record::{Record, RecordState};
use crate::adapter::schema::{Catalog, ModelSchema, RelationSchema};
use crate::adapter::{Adapter, Capabilities, Lookup, Model, Selector};
use crate::relation::RelationType;
use crate::value::Value;
use crate::{Error, Result};
use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Bool(v) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(i64::from(*v))),
            Value::Int(v) => ToSqlOutput::Borrowed(ValueRef::Integer(*v)),
            Value::Float(v) => ToSqlOutput::Borrowed(ValueRef::Real(*v)),
            Value::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            Value::Bytes(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
        })
    }
}

impl FromSql for Value {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(v) => Value::Int(v),
            ValueRef::Real(v) => Value::Float(v),
            ValueRef::Text(v) => Value::Text(String::from_utf8_lossy(v).into_owned()),
            ValueRef::Blob(v) => Value::Bytes(v.to_vec()),
        })
    }
}

/// SQLite-backed adapter
pub struct SqliteAdapter {
    conn: Connection,
    session: MemoryAdapter,
}

impl SqliteAdapter {
    /// Open a database file (creates missing tables)
    pub fn open(path: &Path, catalog: Catalog) -> Result<Self> {
        Self::with_connection(Connection::open(path)?, catalog)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory(catalog: Catalog) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, catalog)
    }

    fn with_connection(conn: Connection, catalog: Catalog) -> Result<Self> {
        catalog.validate()?;
        check_single_keys(&catalog)?;
        let capabilities = Capabilities {
            composite_keys: false,
            reverse_model_autoupdate: true,
            save_model_before_commit: true,
            ..Capabilities::default()
        };
        let adapter = Self {
            conn,
            session: MemoryAdapter::with_capabilities(catalog, capabilities),
        };
        adapter.initialize_schema()?;
        adapter.load()?;
        Ok(adapter)
    }

    fn initialize_schema(&self) -> Result<()> {
        for stmt in schema::all_schema_statements(self.session.catalog()) {
            self.conn.execute(&stmt, [])?;
        }
        Ok(())
    }

    /// The in-memory session the adapter works on
    pub fn session(&self) -> &MemoryAdapter {
        &self.session
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // ========== Loading ==========

    fn load(&self) -> Result<()> {
        let catalog = self.session.catalog();
        let mut by_key: HashMap<(String, String), Record> = HashMap::new();
        let mut pending_links: Vec<(Record, String, String, Value)> = Vec::new();

        for model in catalog.iter() {
            let owned: Vec<&RelationSchema> = model
                .x_to_one_relations()
                .filter(|r| r.foreign_key.is_some())
                .collect();
            let mut columns: Vec<String> = model.fields.iter().map(|f| quote(f)).collect();
            columns.extend(owned.iter().filter_map(|r| r.foreign_key.as_deref()).map(quote));
            let sql = format!("SELECT {} FROM {}", columns.join(", "), quote(&model.name));

            let mut stmt = self.conn.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let mut values = BTreeMap::new();
                for (idx, field) in model.fields.iter().enumerate() {
                    values.insert(field.clone(), row.get::<_, Value>(idx)?);
                }
                let record = self.session.load_record(&model.name, values)?;
                for (offset, rel) in owned.iter().enumerate() {
                    let target_key: Value = row.get(model.fields.len() + offset)?;
                    if !target_key.is_null() {
                        pending_links.push((record.clone(), rel.name.clone(), rel.target.clone(), target_key));
                    }
                }
                if let [pk] = model.primary_key.as_slice() {
                    by_key.insert(row_key(&model.name, &record.get_field(pk)), record);
                }
            }
        }

        for (record, fkey, target, key) in pending_links {
            match by_key.get(&row_key(&target, &key)) {
                Some(target_record) => self.session.load_link(&record, &fkey, target_record)?,
                None => tracing::warn!("{}.{} points at missing {} {}", record.model_cls(), fkey, target, key),
            }
        }

        for model in catalog.iter() {
            for rel in &model.relations {
                if rel.relation_type != RelationType::ManyToMany || !is_canonical_link(model, rel) {
                    continue;
                }
                let Some(join_table) = &rel.join_table else { continue };
                let sql = format!("SELECT source_id, target_id FROM {}", quote(join_table));
                let mut stmt = self.conn.prepare(&sql)?;
                let pairs = stmt
                    .query_map([], |row| Ok((row.get::<_, Value>(0)?, row.get::<_, Value>(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                for (source, target) in pairs {
                    let source = by_key.get(&row_key(&model.name, &source));
                    let target = by_key.get(&row_key(&rel.target, &target));
                    if let (Some(source), Some(target)) = (source, target) {
                        self.session.load_link(source, &rel.name, target)?;
                    }
                }
            }
        }

        self.session.mark_committed();
        tracing::debug!("loaded {} tables from sqlite", catalog.len());
        Ok(())
    }

    // ========== Flushing ==========

    fn key_of(model: &ModelSchema, fields: &BTreeMap<String, Value>) -> Vec<Value> {
        model
            .primary_key
            .iter()
            .map(|k| fields.get(k).cloned().unwrap_or_default())
            .collect()
    }

    fn target_key(&self, target: &Record) -> Value {
        self.session
            .get_primary_key_names(target.model_cls())
            .first()
            .map(|pk| target.get_field(pk))
            .unwrap_or_default()
    }

    fn delete_row(&self, model: &ModelSchema, key: &[Value]) -> Result<()> {
        let clause: Vec<String> = model
            .primary_key
            .iter()
            .enumerate()
            .map(|(idx, k)| format!("{} = ?{}", quote(k), idx + 1))
            .collect();
        let sql = format!("DELETE FROM {} WHERE {}", quote(&model.name), clause.join(" AND "));
        self.conn.execute(&sql, params_from_iter(key.iter()))?;
        Ok(())
    }

    fn write_row(&self, model: &ModelSchema, record: &Record) -> Result<()> {
        let mut columns = Vec::new();
        let mut values = Vec::new();
        for field in &model.fields {
            columns.push(quote(field));
            values.push(record.get_field(field));
        }
        for rel in model.x_to_one_relations() {
            if let Some(fk) = &rel.foreign_key {
                columns.push(quote(fk));
                values.push(record.get_relation(&rel.name).map(|t| self.target_key(&t)).unwrap_or_default());
            }
        }
        let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            quote(&model.name),
            columns.join(", "),
            placeholders.join(", ")
        );
        self.conn.execute(&sql, params_from_iter(values.iter()))?;
        Ok(())
    }

    fn canonical_links(model: &ModelSchema) -> impl Iterator<Item = (&RelationSchema, String)> {
        model
            .relations
            .iter()
            .filter(move |rel| rel.relation_type == RelationType::ManyToMany && is_canonical_link(model, rel))
            .filter_map(|rel| rel.join_table.as_deref().map(|t| (rel, quote(t))))
    }

    fn clear_links(&self, model: &ModelSchema, source: &Value) -> Result<()> {
        for (_, table) in Self::canonical_links(model) {
            self.conn
                .execute(&format!("DELETE FROM {} WHERE source_id = ?1", table), [source])?;
        }
        Ok(())
    }

    fn write_links(&self, model: &ModelSchema, record: &Record) -> Result<usize> {
        let source = self.target_key(record);
        self.clear_links(model, &source)?;
        let mut written = 0;
        for (rel, table) in Self::canonical_links(model) {
            for member in record.related_members(&rel.name) {
                self.conn.execute(
                    &format!("INSERT OR IGNORE INTO {} (source_id, target_id) VALUES (?1, ?2)", table),
                    [&source, &self.target_key(&member)],
                )?;
                written += 1;
            }
        }
        Ok(written)
    }

    /// Write the session's changes since the last commit
    fn flush(&self) -> Result<FlushStats> {
        let tx = self.conn.unchecked_transaction()?;
        let mut stats = FlushStats::default();

        for model in self.session.catalog().iter() {
            let committed: HashMap<Record, RecordState> = self.session.committed_rows(&model.name).into_iter().collect();
            let current = self.session.rows(&model.name);

            for (record, state) in &committed {
                let key = Self::key_of(model, &state.fields);
                let removed = !current.contains(record);
                if removed || Self::key_of(model, &record.fields()) != key {
                    self.delete_row(model, &key)?;
                    if let [source] = key.as_slice() {
                        self.clear_links(model, source)?;
                    }
                    if removed {
                        stats.deleted += 1;
                    }
                }
            }

            for record in &current {
                let unchanged = committed
                    .get(record)
                    .is_some_and(|state| state.same_as(&record.state()));
                if unchanged {
                    continue;
                }
                self.write_row(model, record)?;
                stats.links += self.write_links(model, record)?;
                stats.written += 1;
            }
        }

        tx.commit()?;
        self.session.mark_committed();
        Ok(stats)
    }

    /// Row counts per model table
    pub fn stats(&self) -> Result<TableStats> {
        let mut rows = BTreeMap::new();
        for model in self.session.catalog().iter() {
            let count: i64 = self.conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", quote(&model.name)),
                [],
                |row| row.get(0),
            )?;
            rows.insert(model.name.clone(), count as usize);
        }
        Ok(TableStats { rows })
    }
}

fn row_key(model_cls: &str, key: &Value) -> (String, String) {
    (model_cls.to_string(), format!("{:?}", key))
}

/// Foreign keys hold a single primary-key value
fn check_single_keys(catalog: &Catalog) -> Result<()> {
    for model in catalog.iter() {
        for rel in &model.relations {
            let stores_key = rel.foreign_key.is_some() || rel.join_table.is_some();
            if !stores_key {
                continue;
            }
            let target = catalog.require(&rel.target)?;
            let composite = target.primary_key.len() != 1 || (rel.join_table.is_some() && model.primary_key.len() != 1);
            if composite {
                return Err(Error::InvalidConfig(format!(
                    "{}.{}: composite primary keys cannot be referenced",
                    model.name, rel.name
                )));
            }
            if rel.relation_type == RelationType::ManyToMany && rel.join_table.is_none() {
                return Err(Error::InvalidConfig(format!("{}.{}: missing join table", model.name, rel.name)));
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
struct FlushStats {
    written: usize,
    deleted: usize,
    links: usize,
}

/// Row counts of the backing database
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableStats {
    pub rows: BTreeMap<String, usize>,
}

impl std::fmt::Display for TableStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Database Statistics:")?;
        for (table, count) in &self.rows {
            writeln!(f, "  {}: {}", table, count)?;
        }
        Ok(())
    }
}

impl Adapter for SqliteAdapter {
    type Model = Record;

    fn capabilities(&self) -> Capabilities {
        self.session.capabilities()
    }

    fn schema(&self, model_cls: &str) -> Option<&ModelSchema> {
        self.session.schema(model_cls)
    }

    fn get(&self, lookups: &[Lookup<'_, Record>]) -> Result<Vec<Record>> {
        self.session.get(lookups)
    }

    fn create_blank_model(&self, model_cls: &str) -> Result<Record> {
        self.session.create_blank_model(model_cls)
    }

    fn save_model(&self, model: &Record) -> Result<()> {
        self.session.save_model(model)
    }

    fn delete(&self, model: &Record) -> Result<()> {
        self.session.delete(model)
    }

    fn execute_delete(&self, model_cls: &str, selectors: &[Selector], keepers: &[Selector]) -> Result<usize> {
        self.session.execute_delete(model_cls, selectors, keepers)
    }

    fn commit(&self) -> Result<()> {
        let stats = self.flush()?;
        tracing::debug!(
            "commit: {} rows written, {} deleted, {} links",
            stats.written,
            stats.deleted,
            stats.links
        );
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        self.session.rollback()
    }

    fn set_related_model(&self, model: &Record, fkey: &str, target: Option<&Record>) -> Result<()> {
        self.session.set_related_model(model, fkey, target)
    }

    fn add_related_models(&self, model: &Record, fkey: &str, members: &[Record]) -> Result<()> {
        self.session.add_related_models(model, fkey, members)
    }

    fn remove_related_models(&self, model: &Record, fkey: &str, members: &[Record]) -> Result<()> {
        self.session.remove_related_models(model, fkey, members)
    }

    fn clear_related_models(&self, model: &Record, fkey: &str) -> Result<()> {
        self.session.clear_related_models(model, fkey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{ItemClass, ItemGraph};
    use crate::persist::Persister;
    use std::rc::Rc;

    fn catalog() -> Catalog {
        Catalog::new()
            .with(
                ModelSchema::new("author")
                    .field("name")
                    .one_to_many("books", "book", Some("author"))
                    .unique(&["name"]),
            )
            .with(
                ModelSchema::new("book")
                    .field("title")
                    .many_to_one("author", "author", Some("books"))
                    .many_to_many("tags", "tag", Some("books"), "book_tags"),
            )
            .with(
                ModelSchema::new("tag")
                    .field("label")
                    .many_to_many("books", "book", Some("tags"), "book_tags"),
            )
    }

    fn text(s: &str) -> Value {
        Value::from(s)
    }

    #[test]
    fn test_commit_writes_rows_and_links() {
        let adapter = SqliteAdapter::open_in_memory(catalog()).unwrap();
        let author = adapter.session().insert("author", &[("name", text("Le Guin"))]).unwrap();
        let book = adapter.session().insert("book", &[("title", text("Earthsea"))]).unwrap();
        let tag = adapter.session().insert("tag", &[("label", text("fantasy"))]).unwrap();
        adapter.set_related_model(&book, "author", Some(&author)).unwrap();
        adapter.add_related_models(&book, "tags", &[tag]).unwrap();

        assert_eq!(adapter.stats().unwrap().rows["book"], 0);
        adapter.commit().unwrap();

        let stats = adapter.stats().unwrap();
        assert_eq!(stats.rows["author"], 1);
        assert_eq!(stats.rows["book"], 1);
        let author_id: i64 = adapter
            .connection()
            .query_row("SELECT author_id FROM book", [], |row| row.get(0))
            .unwrap();
        assert_eq!(author_id, 1);
        let links: i64 = adapter
            .connection()
            .query_row("SELECT COUNT(*) FROM book_tags", [], |row| row.get(0))
            .unwrap();
        assert_eq!(links, 1);
    }

    #[test]
    fn test_rollback_leaves_database_untouched() {
        let adapter = SqliteAdapter::open_in_memory(catalog()).unwrap();
        adapter.session().insert("author", &[("name", text("kept"))]).unwrap();
        adapter.commit().unwrap();
        adapter.session().insert("author", &[("name", text("discarded"))]).unwrap();
        adapter.rollback().unwrap();
        adapter.commit().unwrap();

        assert_eq!(adapter.stats().unwrap().rows["author"], 1);
        assert_eq!(adapter.session().rows("author").len(), 1);
    }

    #[test]
    fn test_delete_is_flushed() {
        let adapter = SqliteAdapter::open_in_memory(catalog()).unwrap();
        let author = adapter.session().insert("author", &[("name", text("gone"))]).unwrap();
        adapter.commit().unwrap();
        adapter.delete(&author).unwrap();
        adapter.commit().unwrap();
        assert_eq!(adapter.stats().unwrap().rows["author"], 0);
    }

    #[test]
    fn test_reopen_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.db");

        {
            let mut persister = Persister::new(SqliteAdapter::open(&path, catalog()).unwrap());
            let author = Rc::new(
                ItemClass::new("Author", "author")
                    .field("name")
                    .relation("books", RelationType::OneToMany, "Book", Some("author"))
                    .getter(&["name"]),
            );
            let book = Rc::new(
                ItemClass::new("Book", "book")
                    .field("title")
                    .relation("author", RelationType::ManyToOne, "Author", Some("books"))
                    .getter(&["title"]),
            );
            let mut graph = ItemGraph::new();
            let a = graph.add(&author);
            graph.set(a, "name", "Le Guin").unwrap();
            for title in ["Earthsea", "Lathe"] {
                let b = graph.add(&book);
                graph.set(b, "title", title).unwrap();
                graph.link(a, "books", b).unwrap();
            }
            persister.persist(&graph, a).unwrap();
            persister.commit().unwrap();
        }

        let adapter = SqliteAdapter::open(&path, catalog()).unwrap();
        let author = adapter.session().find("author", "name", "Le Guin").unwrap();
        assert_eq!(author.related_members("books").len(), 2);
        let book = adapter.session().find("book", "title", "Lathe").unwrap();
        assert_eq!(book.get_relation("author"), Some(author));

        // new rows continue the id sequence
        let next = adapter.session().insert("author", &[("name", text("Tolkien"))]).unwrap();
        assert_eq!(next.get_field("id"), Value::Int(2));
    }

    #[test]
    fn test_explicit_tables_are_used() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE author (id INTEGER PRIMARY KEY, name TEXT UNIQUE);
             CREATE TABLE book (id INTEGER PRIMARY KEY, title TEXT, author_id INTEGER REFERENCES author(id));
             CREATE TABLE tag (id INTEGER PRIMARY KEY, label TEXT);
             CREATE TABLE book_tags (source_id INTEGER, target_id INTEGER, PRIMARY KEY (source_id, target_id));
             INSERT INTO author (id, name) VALUES (7, 'Herbert');
             INSERT INTO book (id, title, author_id) VALUES (3, 'Dune', 7);
             INSERT INTO tag (id, label) VALUES (1, 'sf');
             INSERT INTO book_tags VALUES (3, 1);",
        )
        .unwrap();
        let adapter = SqliteAdapter::with_connection(conn, catalog()).unwrap();

        let book = adapter.session().find("book", "title", "Dune").unwrap();
        let author = book.get_relation("author").unwrap();
        assert_eq!(author.get_field("id"), Value::Int(7));
        let tags = book.related_members("tags");
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].related_members("books"), vec![book.clone()]);
    }

    #[test]
    fn test_composite_key_targets_rejected() {
        let catalog = Catalog::new()
            .with(ModelSchema::new("pair").primary_key(&["a", "b"]))
            .with(ModelSchema::new("ref").many_to_one("pair", "pair", None));
        assert!(matches!(
            SqliteAdapter::open_in_memory(catalog),
            Err(Error::InvalidConfig(_))
        ));
    }
}
