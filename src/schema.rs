//! Schema synthesis: create, migrate and verify tables from descriptors.

use fallible_streaming_iterator::FallibleStreamingIterator;

use crate::mapping::{Column, CreateFlags, Record};
use crate::types::Value;
use crate::{quote_identifier, Connection, Error, Result};

/// How [`create_table`](Connection::create_table) reconciled the descriptor
/// with the database.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateTableResult {
    /// The table did not exist and was created.
    Created,
    /// The table existed; missing columns (possibly none) were added.
    Migrated,
}

/// One row of `PRAGMA table_info`.
#[derive(Clone, Debug)]
pub struct ColumnInfo {
    pub cid: i64,
    pub name: String,
    pub decl_type: String,
    pub notnull: bool,
    pub default_value: Option<String>,
    pub pk: bool,
}

/// One row of `PRAGMA index_list`.
#[derive(Clone, Debug)]
pub struct IndexInfo {
    pub seq: i64,
    pub name: String,
    pub unique: bool,
    pub origin: String,
}

impl Connection {
    /// Create the table for `T`, or bring an existing one up to date by
    /// adding missing columns, then synthesize the descriptor's indexes.
    pub fn create_table<T: Record>(&self) -> Result<CreateTableResult> {
        let mapping = self.mapping::<T>();
        let table = mapping.table_name();
        let existing = self.table_info(table)?;

        let result = if existing.is_empty() {
            let decls: Vec<String> = mapping
                .columns()
                .iter()
                .map(|col| self.column_decl(col))
                .collect();

            let flags = mapping.create_flags();
            let sql = if let Some(using) = fts_module(flags) {
                format!(
                    "CREATE VIRTUAL TABLE IF NOT EXISTS {} USING {} ({})",
                    quote_identifier(table),
                    using,
                    decls.join(", ")
                )
            } else {
                let mut sql = format!(
                    "CREATE TABLE IF NOT EXISTS {} ({})",
                    quote_identifier(table),
                    decls.join(", ")
                );
                if mapping.is_without_rowid() {
                    sql.push_str(" WITHOUT ROWID");
                }
                sql
            };
            self.execute(&sql, &[])?;
            CreateTableResult::Created
        } else {
            for col in mapping.columns() {
                let present = existing
                    .iter()
                    .any(|ci| ci.name.eq_ignore_ascii_case(col.name()));
                if !present {
                    let sql = format!(
                        "ALTER TABLE {} ADD COLUMN {}",
                        quote_identifier(table),
                        self.column_decl(col)
                    );
                    self.execute(&sql, &[])?;
                }
            }
            CreateTableResult::Migrated
        };

        for index in mapping.indexes()? {
            let columns: Vec<String> = index
                .columns
                .iter()
                .map(|c| quote_identifier(c))
                .collect();
            let sql = format!(
                "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                if index.unique { "UNIQUE " } else { "" },
                quote_identifier(&index.name),
                quote_identifier(table),
                columns.join(", ")
            );
            self.execute(&sql, &[])?;
        }

        Ok(result)
    }

    /// Assert the live schema matches the descriptor: every column exists
    /// with the declared type, NOT NULL and PK shape, every descriptor index
    /// exists with its columns, and no unexpected index remains.
    pub fn verify_schema<T: Record>(&self) -> Result<()> {
        let mapping = self.mapping::<T>();
        let table = mapping.table_name();
        let live = self.table_info(table)?;
        if live.is_empty() {
            return Err(Error::SchemaMismatch(format!("table {} does not exist", table)));
        }

        for col in mapping.columns() {
            let info = live
                .iter()
                .find(|ci| ci.name.eq_ignore_ascii_case(col.name()))
                .ok_or_else(|| {
                    Error::SchemaMismatch(format!("{}.{} is missing", table, col.name()))
                })?;
            if info.pk != col.is_primary_key() {
                return Err(Error::SchemaMismatch(format!(
                    "{}.{}: primary-key flag is {}, expected {}",
                    table,
                    col.name(),
                    info.pk,
                    col.is_primary_key()
                )));
            }
            if info.notnull != !col.is_nullable() {
                return Err(Error::SchemaMismatch(format!(
                    "{}.{}: not-null flag is {}, expected {}",
                    table,
                    col.name(),
                    info.notnull,
                    !col.is_nullable()
                )));
            }
            let ctx = self.codec_ctx(col.stores_as_text());
            let expected = col.decl_type(&ctx);
            if !info.decl_type.eq_ignore_ascii_case(&expected) {
                return Err(Error::SchemaMismatch(format!(
                    "{}.{}: declared type is {}, expected {}",
                    table,
                    col.name(),
                    info.decl_type,
                    expected
                )));
            }
        }

        let expected_indexes = mapping.indexes()?;
        let live_indexes: Vec<IndexInfo> = self
            .index_list(table)?
            .into_iter()
            .filter(|idx| idx.origin != "pk")
            .collect();

        for expected in &expected_indexes {
            let found = live_indexes
                .iter()
                .find(|idx| idx.name == expected.name)
                .ok_or_else(|| {
                    Error::SchemaMismatch(format!("index {} is missing", expected.name))
                })?;
            if found.unique != expected.unique {
                return Err(Error::SchemaMismatch(format!(
                    "index {}: unique flag is {}, expected {}",
                    expected.name, found.unique, expected.unique
                )));
            }
            let live_columns = self.index_info(&expected.name)?;
            if live_columns != expected.columns {
                return Err(Error::SchemaMismatch(format!(
                    "index {}: columns are {:?}, expected {:?}",
                    expected.name, live_columns, expected.columns
                )));
            }
        }
        for live_index in &live_indexes {
            if !expected_indexes.iter().any(|e| e.name == live_index.name) {
                return Err(Error::SchemaMismatch(format!(
                    "unexpected index {}",
                    live_index.name
                )));
            }
        }
        Ok(())
    }

    /// Drop `T`'s table if it exists.
    pub fn drop_table<T: Record>(&self) -> Result<usize> {
        let mapping = self.mapping::<T>();
        self.execute(
            &format!("DROP TABLE IF EXISTS {}", quote_identifier(mapping.table_name())),
            &[],
        )
    }

    /// Create a (possibly unique) index over the given columns.
    pub fn create_index(
        &self,
        table: &str,
        index_name: &str,
        columns: &[&str],
        unique: bool,
    ) -> Result<usize> {
        let columns: Vec<String> = columns.iter().map(|c| quote_identifier(c)).collect();
        self.execute(
            &format!(
                "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                if unique { "UNIQUE " } else { "" },
                quote_identifier(index_name),
                quote_identifier(table),
                columns.join(", ")
            ),
            &[],
        )
    }

    /// `PRAGMA table_info`, one entry per column; empty when the table does
    /// not exist.
    pub fn table_info(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let sql = format!("PRAGMA table_info({})", quote_identifier(table));
        let mut stmt = self.prepare(&sql)?;
        let mut rows = stmt.query_raw(&[])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(ColumnInfo {
                cid: row.get(0)?,
                name: row.get(1)?,
                decl_type: row.get::<Option<String>>(2)?.unwrap_or_default(),
                notnull: row.get::<i64>(3)? != 0,
                default_value: row.get(4)?,
                pk: row.get::<i64>(5)? != 0,
            });
        }
        Ok(out)
    }

    /// `PRAGMA index_list`, one entry per index on the table.
    pub fn index_list(&self, table: &str) -> Result<Vec<IndexInfo>> {
        let sql = format!("PRAGMA index_list({})", quote_identifier(table));
        let mut stmt = self.prepare(&sql)?;
        let mut rows = stmt.query_raw(&[])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(IndexInfo {
                seq: row.get(0)?,
                name: row.get(1)?,
                unique: row.get::<i64>(2)? != 0,
                origin: row.get::<Option<String>>(3)?.unwrap_or_default(),
            });
        }
        Ok(out)
    }

    /// The DDL declaration of one column:
    /// `"name" <type> [primary key] [autoincrement] [not null] [collate X]
    /// [default('V')]`.
    fn column_decl<T: 'static>(&self, col: &Column<T>) -> String {
        let ctx = self.codec_ctx(col.stores_as_text());
        let mut decl = format!("{} {}", quote_identifier(col.name()), col.decl_type(&ctx));
        if col.is_primary_key() {
            decl.push_str(" primary key");
        }
        if col.is_auto_increment() {
            decl.push_str(" autoincrement");
        }
        if !col.is_nullable() {
            decl.push_str(" not null");
        }
        if let Some(collation) = col.collation_name() {
            if !collation.is_empty() {
                decl.push_str(" collate ");
                decl.push_str(collation);
            }
        }
        if let Some(literal) = col.default().and_then(default_literal) {
            decl.push_str(&format!(" default('{}')", literal));
        }
        decl
    }

    /// Column names of an index, in index order.
    pub fn index_info(&self, index_name: &str) -> Result<Vec<String>> {
        let sql = format!("PRAGMA index_info({})", quote_identifier(index_name));
        let mut stmt = self.prepare(&sql)?;
        let mut rows = stmt.query_raw(&[])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let seqno: i64 = row.get(0)?;
            let name: Option<String> = row.get(2)?;
            out.push((seqno, name.unwrap_or_default()));
        }
        out.sort_by_key(|&(seqno, _)| seqno);
        Ok(out.into_iter().map(|(_, name)| name).collect())
    }
}

fn fts_module(flags: CreateFlags) -> Option<&'static str> {
    if flags.contains(CreateFlags::FULL_TEXT_SEARCH_4) {
        Some("fts4")
    } else if flags.contains(CreateFlags::FULL_TEXT_SEARCH_3) {
        Some("fts3")
    } else {
        None
    }
}

/// Render a column default for DDL; blobs and NULL have no literal form.
fn default_literal(value: &Value) -> Option<String> {
    match *value {
        Value::Integer(i) => Some(i.to_string()),
        Value::Real(r) => Some(r.to_string()),
        Value::Text(ref s) => Some(s.replace('\'', "''")),
        Value::Null | Value::Blob(_) => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mapping::{Column, TableDescriptor};
    use crate::Connection;

    #[derive(Default)]
    struct Widget {
        id: i64,
        label: String,
        weight: f64,
    }

    impl Record for Widget {
        fn table() -> TableDescriptor<Widget> {
            TableDescriptor::builder("Widget")
                .column(
                    Column::new("Id", |w: &Widget| w.id, |w, v| w.id = v)
                        .primary_key()
                        .auto_increment(),
                )
                .column(
                    Column::new("Label", |w: &Widget| w.label.clone(), |w, v| w.label = v)
                        .max_length(64)
                        .collation("NOCASE"),
                )
                .column(Column::new("Weight", |w: &Widget| w.weight, |w, v| w.weight = v))
                .build()
        }
    }

    #[test]
    fn create_then_verify() {
        let db = Connection::open_in_memory().unwrap();
        assert_eq!(db.create_table::<Widget>().unwrap(), CreateTableResult::Created);
        db.verify_schema::<Widget>().unwrap();

        let info = db.table_info("Widget").unwrap();
        assert_eq!(info.len(), 3);
        assert!(info[0].pk);
        assert!(info.iter().all(|c| c.notnull));
        assert!(info[1].decl_type.eq_ignore_ascii_case("varchar(64)"));
    }

    #[test]
    fn create_is_idempotent() {
        let db = Connection::open_in_memory().unwrap();
        assert_eq!(db.create_table::<Widget>().unwrap(), CreateTableResult::Created);
        assert_eq!(db.create_table::<Widget>().unwrap(), CreateTableResult::Migrated);
        db.verify_schema::<Widget>().unwrap();
    }

    #[derive(Default)]
    struct Gadget {
        id: i64,
        label: Option<String>,
        weight: f64,
    }

    impl Record for Gadget {
        fn table() -> TableDescriptor<Gadget> {
            TableDescriptor::builder("Gadget")
                .column(
                    Column::new("Id", |g: &Gadget| g.id, |g, v| g.id = v)
                        .primary_key()
                        .auto_increment(),
                )
                .column(Column::new(
                    "Label",
                    |g: &Gadget| g.label.clone(),
                    |g, v| g.label = v,
                ))
                .column(
                    Column::new("Weight", |g: &Gadget| g.weight, |g, v| g.weight = v)
                        .default_value(0i64),
                )
                .build()
        }
    }

    #[test]
    fn migrate_adds_missing_columns() {
        let db = Connection::open_in_memory().unwrap();
        db.execute_batch(
            "CREATE TABLE \"Gadget\" (\"Id\" integer primary key autoincrement not null)",
        )
        .unwrap();
        assert_eq!(db.create_table::<Gadget>().unwrap(), CreateTableResult::Migrated);
        let info = db.table_info("Gadget").unwrap();
        assert_eq!(info.len(), 3);
        assert!(info.iter().any(|c| c.name == "Label"));
        assert!(info.iter().any(|c| c.name == "Weight"));
        // Pre-existing rows are untouched; new rows see the default.
        db.execute_batch("INSERT INTO \"Gadget\" (\"Label\") VALUES ('x')")
            .unwrap();
    }

    #[test]
    fn verify_reports_missing_table() {
        let db = Connection::open_in_memory().unwrap();
        assert!(matches!(
            db.verify_schema::<Widget>(),
            Err(Error::SchemaMismatch(_))
        ));
    }

    #[test]
    fn verify_reports_unexpected_index() {
        let db = Connection::open_in_memory().unwrap();
        db.create_table::<Widget>().unwrap();
        db.create_index("Widget", "IX_Widget_Weight", &["Weight"], false)
            .unwrap();
        assert!(matches!(
            db.verify_schema::<Widget>(),
            Err(Error::SchemaMismatch(_))
        ));
    }

    #[derive(Default)]
    struct Quad {
        uno: i64,
        dos: i64,
        tres: i64,
        cuatro: i64,
        cinco: i64,
        seis: i64,
    }

    impl Record for Quad {
        fn table() -> TableDescriptor<Quad> {
            TableDescriptor::builder("Quad")
                .column(Column::new("Uno", |q: &Quad| q.uno, |q, v| q.uno = v).unique_in("UX_Uno", 0))
                .column(Column::new("Dos", |q: &Quad| q.dos, |q, v| q.dos = v).unique_in("UX_Dos", 0))
                .column(Column::new("Tres", |q: &Quad| q.tres, |q, v| q.tres = v).unique_in("UX_Dos", 1))
                .column(
                    Column::new("Cuatro", |q: &Quad| q.cuatro, |q, v| q.cuatro = v)
                        .unique_in("UX_Uno_bool", 0),
                )
                .column(
                    Column::new("Cinco", |q: &Quad| q.cinco, |q, v| q.cinco = v)
                        .unique_in("UX_Dos_bool", 0),
                )
                .column(
                    Column::new("Seis", |q: &Quad| q.seis, |q, v| q.seis = v)
                        .unique_in("UX_Dos_bool", 1),
                )
                .build()
        }
    }

    #[test]
    fn unique_index_introspection() {
        let db = Connection::open_in_memory().unwrap();
        db.create_table::<Quad>().unwrap();

        let mut indexes = db.index_list("Quad").unwrap();
        indexes.retain(|i| i.origin != "pk");
        assert_eq!(indexes.len(), 4);
        assert!(indexes.iter().all(|i| i.unique));

        assert_eq!(db.index_info("UX_Uno").unwrap(), vec!["Uno".to_owned()]);
        assert_eq!(
            db.index_info("UX_Dos").unwrap(),
            vec!["Dos".to_owned(), "Tres".to_owned()]
        );
        assert_eq!(db.index_info("UX_Uno_bool").unwrap(), vec!["Cuatro".to_owned()]);
        assert_eq!(
            db.index_info("UX_Dos_bool").unwrap(),
            vec!["Cinco".to_owned(), "Seis".to_owned()]
        );

        db.verify_schema::<Quad>().unwrap();
    }
}
