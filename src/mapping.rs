//! Record descriptors: the mapping between host record types and tables.
//!
//! A [`Record`] type declares its table shape with a
//! [`TableDescriptor::builder`]: one [`Column`] per persisted field, each
//! carrying typed get/set accessors plus the column attributes (primary key,
//! auto-increment, auto-GUID, unique, index participation, collation,
//! max-length, default value, store-as-text). Built descriptors are cached
//! process-wide in a [`MappingRegistry`] keyed by the record type; the first
//! build wins any race and entries live until an explicit
//! [`clear`](MappingRegistry::clear).

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use crate::types::{ColumnValue, Type, Value, ValueContext, ValueRef};
use crate::{Error, Result};

bitflags::bitflags! {
    /// Table synthesis options, applied when the descriptor is built.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CreateFlags: u32 {
        /// Make the member named `Id` the primary key when none is declared.
        const IMPLICIT_PK = 0x01;
        /// Index every non-PK column whose name ends in `Id`.
        const IMPLICIT_INDEX = 0x02;
        /// An implicit primary key is also auto-incrementing.
        const AUTO_INC_PK = 0x04;
        /// Synthesize a virtual FTS3 table.
        const FULL_TEXT_SEARCH_3 = 0x10;
        /// Synthesize a virtual FTS4 table.
        const FULL_TEXT_SEARCH_4 = 0x20;
    }
}

/// Conflict clause applied to an `INSERT`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnConflict {
    /// Plain `INSERT`.
    Abort,
    /// `INSERT OR REPLACE`: all columns (including the PK) are written.
    Replace,
    /// `INSERT OR IGNORE`.
    Ignore,
}

/// A type persisted as a table row. The descriptor returned by
/// [`table`](Record::table) is built once and cached in the registry.
pub trait Record: Default + 'static {
    fn table() -> TableDescriptor<Self>;
}

/// Membership of a column in a (possibly multi-column) index.
#[derive(Clone, Debug)]
pub struct IndexParticipation {
    pub name: Option<String>,
    pub order: u32,
    pub unique: bool,
    pub descending: bool,
}

/// A grouped index ready for DDL synthesis: participations sharing a name,
/// ordered by their `order` field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexDescriptor {
    pub name: String,
    pub unique: bool,
    pub columns: Vec<String>,
}

type Getter<T> = Box<dyn Fn(&T, &ValueContext) -> Result<Value> + Send + Sync>;
type Setter<T> = Box<dyn Fn(&mut T, ValueRef<'_>, &ValueContext) -> Result<()> + Send + Sync>;

/// One persisted column: name, attributes, and the typed accessors that move
/// values between the record and the engine.
pub struct Column<T> {
    name: String,
    member: String,
    nullable: bool,
    is_pk: bool,
    is_auto_inc: bool,
    is_auto_guid: bool,
    store_as_text: bool,
    unique: bool,
    collation: Option<String>,
    max_length: Option<u32>,
    default_value: Option<Value>,
    indices: Vec<IndexParticipation>,
    storage: fn(&ValueContext) -> Type,
    decl: fn(&ValueContext, Option<u32>) -> String,
    get: Getter<T>,
    set: Setter<T>,
}

impl<T> fmt::Debug for Column<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Column")
            .field("name", &self.name)
            .field("member", &self.member)
            .field("pk", &self.is_pk)
            .field("auto_inc", &self.is_auto_inc)
            .field("nullable", &self.nullable)
            .finish()
    }
}

impl<T: 'static> Column<T> {
    /// Declare a column backed by the given accessors. The host type `V`
    /// decides the storage class, declared SQL type and nullability
    /// (`Option<_>` columns are nullable).
    pub fn new<V>(name: &str, get: fn(&T) -> V, set: fn(&mut T, V)) -> Column<T>
    where
        V: ColumnValue + 'static,
    {
        let column_name = name.to_owned();
        let get_fn: Getter<T> = Box::new(move |obj, ctx| get(obj).encode(ctx));
        let err_name = column_name.clone();
        let set_fn: Setter<T> = Box::new(move |obj, value, ctx| {
            if let ValueRef::Null = value {
                // A NULL read into a non-nullable member leaves the default
                // in place rather than failing the whole row.
                if !V::NULLABLE {
                    return Ok(());
                }
            }
            match V::decode(value, ctx) {
                Ok(v) => {
                    set(obj, v);
                    Ok(())
                }
                Err(source) => Err(Error::FromSqlConversion {
                    column: err_name.clone(),
                    source,
                }),
            }
        });
        Column {
            member: column_name.clone(),
            name: column_name,
            nullable: V::NULLABLE,
            is_pk: false,
            is_auto_inc: false,
            is_auto_guid: false,
            store_as_text: false,
            unique: false,
            collation: None,
            max_length: None,
            default_value: None,
            indices: Vec::new(),
            storage: <V as ColumnValue>::storage,
            decl: <V as ColumnValue>::decl_type,
            get: get_fn,
            set: set_fn,
        }
    }

    /// Record the host member name when it differs from the column name.
    pub fn member(mut self, member: &str) -> Self {
        self.member = member.to_owned();
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.is_pk = true;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.is_auto_inc = true;
        self
    }

    /// A GUID primary key that is generated on insert when still nil.
    pub fn auto_guid(mut self) -> Self {
        self.is_auto_guid = true;
        self
    }

    /// Force NOT NULL even for an `Option<_>` member.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn max_length(mut self, n: u32) -> Self {
        self.max_length = Some(n);
        self
    }

    pub fn collation(mut self, name: &str) -> Self {
        self.collation = Some(name.to_owned());
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    /// Store enum values as their variant name instead of their integer
    /// value.
    pub fn store_as_text(mut self) -> Self {
        self.store_as_text = true;
        self
    }

    /// Join an anonymous single-column index.
    pub fn indexed(self) -> Self {
        self.indexed_with(None, 0, false, false)
    }

    /// Join the named index at the given position.
    pub fn indexed_in(self, name: &str, order: u32) -> Self {
        self.indexed_with(Some(name), order, false, false)
    }

    /// Join an anonymous single-column unique index.
    pub fn unique(self) -> Self {
        self.indexed_with(None, 0, true, false)
    }

    /// Join the named unique index at the given position.
    pub fn unique_in(self, name: &str, order: u32) -> Self {
        self.indexed_with(Some(name), order, true, false)
    }

    /// Full form of index participation.
    pub fn indexed_with(
        mut self,
        name: Option<&str>,
        order: u32,
        unique: bool,
        descending: bool,
    ) -> Self {
        self.indices.push(IndexParticipation {
            name: name.map(str::to_owned),
            order,
            unique,
            descending,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn member_name(&self) -> &str {
        &self.member
    }

    pub fn is_primary_key(&self) -> bool {
        self.is_pk
    }

    pub fn is_auto_increment(&self) -> bool {
        self.is_auto_inc
    }

    pub fn is_auto_guid(&self) -> bool {
        self.is_auto_guid
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// PK, or member of at least one unique index.
    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn stores_as_text(&self) -> bool {
        self.store_as_text
    }

    pub fn collation_name(&self) -> Option<&str> {
        self.collation.as_deref()
    }

    pub fn max_string_length(&self) -> Option<u32> {
        self.max_length
    }

    pub fn default(&self) -> Option<&Value> {
        self.default_value.as_ref()
    }

    pub fn index_participations(&self) -> &[IndexParticipation] {
        &self.indices
    }

    pub fn storage(&self, ctx: &ValueContext) -> Type {
        (self.storage)(ctx)
    }

    /// Declared SQL type for synthesized DDL. AUTOINCREMENT is only legal on
    /// a column declared exactly INTEGER, so auto-increment columns always
    /// declare as such.
    pub fn decl_type(&self, ctx: &ValueContext) -> String {
        if self.is_auto_inc {
            "integer".to_owned()
        } else {
            (self.decl)(ctx, self.max_length)
        }
    }

    /// Encode the member's current value for binding.
    pub fn value_of(&self, record: &T, ctx: &ValueContext) -> Result<Value> {
        (self.get)(record, ctx)
    }

    /// Decode a stored value into the member.
    pub fn assign(&self, record: &mut T, value: ValueRef<'_>, ctx: &ValueContext) -> Result<()> {
        (self.set)(record, value, ctx)
    }
}

/// Builder for a [`TableDescriptor`].
pub struct TableBuilder<T> {
    name: String,
    without_rowid: bool,
    flags: CreateFlags,
    columns: Vec<Column<T>>,
}

impl<T: 'static> TableBuilder<T> {
    pub fn flags(mut self, flags: CreateFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn without_rowid(mut self) -> Self {
        self.without_rowid = true;
        self
    }

    pub fn column(mut self, column: Column<T>) -> Self {
        self.columns.push(column);
        self
    }

    /// Validate the shape and derive the cached lookup structures.
    ///
    /// Panics on descriptor-authoring mistakes: duplicate column names, more
    /// than one primary key, a nullable primary key, auto-increment on
    /// non-integer storage or combined with auto-GUID, and `WITHOUT ROWID`
    /// with no primary key.
    pub fn build(self) -> TableDescriptor<T> {
        let TableBuilder {
            name,
            without_rowid,
            flags,
            mut columns,
        } = self;

        let default_ctx = ValueContext::default();

        let mut seen = HashMap::new();
        for (i, col) in columns.iter().enumerate() {
            if let Some(prev) = seen.insert(col.name.to_lowercase(), i) {
                panic!(
                    "table {}: duplicate column name {} (columns {} and {})",
                    name, col.name, prev, i
                );
            }
        }

        // Implicit primary key: the member literally named "Id".
        if flags.contains(CreateFlags::IMPLICIT_PK) && !columns.iter().any(|c| c.is_pk) {
            if let Some(col) = columns
                .iter_mut()
                .find(|c| c.member.eq_ignore_ascii_case("id"))
            {
                col.is_pk = true;
                if flags.contains(CreateFlags::AUTO_INC_PK) {
                    col.is_auto_inc = true;
                }
            }
        }

        // Implicit index on foreign-key-looking members.
        if flags.contains(CreateFlags::IMPLICIT_INDEX) {
            for col in columns.iter_mut() {
                let lowered = col.member.to_lowercase();
                if !col.is_pk && col.indices.is_empty() && lowered.ends_with("id") {
                    col.indices.push(IndexParticipation {
                        name: None,
                        order: 0,
                        unique: false,
                        descending: false,
                    });
                }
            }
        }

        let mut pk = None;
        for (i, col) in columns.iter_mut().enumerate() {
            if col.is_pk {
                assert!(pk.is_none(), "table {}: more than one primary key", name);
                assert!(!col.nullable, "table {}: primary key {} is nullable", name, col.name);
                pk = Some(i);
            }
            if col.is_auto_inc {
                assert!(
                    (col.storage)(&default_ctx) == Type::Integer,
                    "table {}: auto-increment column {} must have integer storage",
                    name,
                    col.name
                );
                assert!(
                    !col.is_auto_guid,
                    "table {}: column {} cannot be both auto-increment and auto-GUID",
                    name,
                    col.name
                );
            }
            if col.is_auto_guid {
                assert!(
                    (col.storage)(&default_ctx) == Type::Text,
                    "table {}: auto-GUID column {} must have text storage",
                    name,
                    col.name
                );
            }
            col.unique = col.is_pk || col.indices.iter().any(|p| p.unique);
        }
        assert!(
            !without_rowid || pk.is_some(),
            "table {}: WITHOUT ROWID requires a primary key",
            name
        );

        let auto_inc_pk = pk.filter(|&i| columns[i].is_auto_inc);
        let auto_guid_pk = pk.filter(|&i| columns[i].is_auto_guid);

        let by_name = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.to_lowercase(), i))
            .collect();
        let by_member = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.member.clone(), i))
            .collect();

        let get_by_pk_sql = pk.map(|i| {
            format!(
                "SELECT * FROM {} WHERE {} = ?",
                crate::quote_identifier(&name),
                crate::quote_identifier(&columns[i].name)
            )
        });

        let insert_columns: Vec<usize> = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.is_auto_inc)
            .map(|(i, _)| i)
            .collect();
        let replace_columns: Vec<usize> = (0..columns.len()).collect();

        let diagnostic_columns = columns
            .iter()
            .filter(|c| !(c.is_pk && c.is_auto_inc))
            .map(|c| c.name.clone())
            .collect();

        TableDescriptor {
            name,
            without_rowid,
            flags,
            columns,
            by_name,
            by_member,
            pk,
            auto_inc_pk,
            auto_guid_pk,
            get_by_pk_sql,
            insert_columns,
            replace_columns,
            diagnostic_columns,
        }
    }
}

/// The validated mapping for one record type: ordered columns, primary-key
/// shape, grouped indexes and the cached SQL fragments the verbs use.
pub struct TableDescriptor<T> {
    name: String,
    without_rowid: bool,
    flags: CreateFlags,
    columns: Vec<Column<T>>,
    by_name: HashMap<String, usize>,
    by_member: HashMap<String, usize>,
    pk: Option<usize>,
    auto_inc_pk: Option<usize>,
    auto_guid_pk: Option<usize>,
    get_by_pk_sql: Option<String>,
    insert_columns: Vec<usize>,
    replace_columns: Vec<usize>,
    diagnostic_columns: Vec<String>,
}

impl<T: 'static> TableDescriptor<T> {
    pub fn builder(name: &str) -> TableBuilder<T> {
        TableBuilder {
            name: name.to_owned(),
            without_rowid: false,
            flags: CreateFlags::empty(),
            columns: Vec::new(),
        }
    }
}

impl<T> TableDescriptor<T> {
    pub fn table_name(&self) -> &str {
        &self.name
    }

    pub fn is_without_rowid(&self) -> bool {
        self.without_rowid
    }

    pub fn create_flags(&self) -> CreateFlags {
        self.flags
    }

    pub fn columns(&self) -> &[Column<T>] {
        &self.columns
    }

    /// Case-insensitive lookup by column name.
    pub fn column(&self, name: &str) -> Option<&Column<T>> {
        self.column_index(name).map(|i| &self.columns[i])
    }

    pub(crate) fn column_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(&name.to_lowercase()).copied()
    }

    /// Lookup by host member name.
    pub fn column_by_member(&self, member: &str) -> Option<&Column<T>> {
        self.by_member.get(member).map(|&i| &self.columns[i])
    }

    pub fn primary_key(&self) -> Option<&Column<T>> {
        self.pk.map(|i| &self.columns[i])
    }

    pub(crate) fn primary_key_index(&self) -> Option<usize> {
        self.pk
    }

    pub(crate) fn auto_inc_pk_index(&self) -> Option<usize> {
        self.auto_inc_pk
    }

    pub(crate) fn auto_guid_pk_index(&self) -> Option<usize> {
        self.auto_guid_pk
    }

    pub(crate) fn get_by_pk_sql(&self) -> Option<&str> {
        self.get_by_pk_sql.as_deref()
    }

    /// Column names offered to constraint diagnostics (the auto-increment PK
    /// is excluded).
    pub(crate) fn diagnostic_columns(&self) -> &[String] {
        &self.diagnostic_columns
    }

    pub(crate) fn insert_column_indices(&self, on_conflict: OnConflict) -> &[usize] {
        match on_conflict {
            OnConflict::Replace => &self.replace_columns,
            _ => &self.insert_columns,
        }
    }

    pub(crate) fn insert_sql(&self, on_conflict: OnConflict) -> String {
        let verb = match on_conflict {
            OnConflict::Abort => "INSERT",
            OnConflict::Replace => "INSERT OR REPLACE",
            OnConflict::Ignore => "INSERT OR IGNORE",
        };
        let cols = self.insert_column_indices(on_conflict);
        if cols.is_empty() {
            return format!(
                "{} INTO {} DEFAULT VALUES",
                verb,
                crate::quote_identifier(&self.name)
            );
        }
        let names = cols
            .iter()
            .map(|&i| crate::quote_identifier(&self.columns[i].name))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = vec!["?"; cols.len()].join(", ");
        format!(
            "{} INTO {} ({}) VALUES ({})",
            verb,
            crate::quote_identifier(&self.name),
            names,
            placeholders
        )
    }

    /// Group per-column index participations into whole indexes. Unnamed
    /// participations fall back to `{UX|IX}_<table>_<column>`; mixing unique
    /// and non-unique participations under one name fails.
    pub fn indexes(&self) -> Result<Vec<IndexDescriptor>> {
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, (bool, Vec<(u32, String)>)> = HashMap::new();
        for col in &self.columns {
            for p in &col.indices {
                let index_name = p.name.clone().unwrap_or_else(|| {
                    format!(
                        "{}_{}_{}",
                        if p.unique { "UX" } else { "IX" },
                        self.name,
                        col.name
                    )
                });
                let entry = groups.entry(index_name.clone()).or_insert_with(|| {
                    order.push(index_name.clone());
                    (p.unique, Vec::new())
                });
                if entry.0 != p.unique {
                    return Err(Error::InvalidArgument(format!(
                        "all columns in index {} must have the same unique flag",
                        index_name
                    )));
                }
                entry.1.push((p.order, col.name.clone()));
            }
        }
        Ok(order
            .into_iter()
            .map(|index_name| {
                let (unique, mut cols) = groups.remove(&index_name).unwrap();
                cols.sort_by_key(|&(order, _)| order);
                IndexDescriptor {
                    name: index_name,
                    unique,
                    columns: cols.into_iter().map(|(_, name)| name).collect(),
                }
            })
            .collect())
    }
}

impl<T> fmt::Debug for TableDescriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableDescriptor")
            .field("name", &self.name)
            .field("columns", &self.columns)
            .field("pk", &self.pk)
            .finish()
    }
}

/// Process-wide cache of built descriptors, keyed by record type.
///
/// Population is lazy; the first writer wins a racing build and entries are
/// never invalidated except by [`clear`](MappingRegistry::clear).
#[derive(Default)]
pub struct MappingRegistry {
    map: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl MappingRegistry {
    pub fn new() -> MappingRegistry {
        MappingRegistry::default()
    }

    /// The shared process-wide registry used by connections unless another
    /// one is injected through the configuration.
    pub fn global() -> &'static MappingRegistry {
        static REGISTRY: OnceLock<MappingRegistry> = OnceLock::new();
        REGISTRY.get_or_init(MappingRegistry::new)
    }

    /// Fetch (building on first use) the descriptor for `T`.
    pub fn get<T: Record>(&self) -> Arc<TableDescriptor<T>> {
        if let Some(entry) = self.map.read().unwrap().get(&TypeId::of::<T>()) {
            return entry
                .clone()
                .downcast::<TableDescriptor<T>>()
                .expect("mapping registry entry of the wrong type");
        }
        // Build outside the write lock; racing builders are resolved below.
        let built: Arc<TableDescriptor<T>> = Arc::new(T::table());
        let erased: Arc<dyn Any + Send + Sync> = built;
        let mut map = self.map.write().unwrap();
        let entry = map.entry(TypeId::of::<T>()).or_insert(erased);
        entry
            .clone()
            .downcast::<TableDescriptor<T>>()
            .expect("mapping registry entry of the wrong type")
    }

    /// Drop every cached descriptor. Test support only.
    pub fn clear(&self) {
        self.map.write().unwrap().clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Default)]
    struct Job {
        id: i64,
        customer_id: i64,
        title: String,
        notes: Option<String>,
    }

    fn job_descriptor(flags: CreateFlags) -> TableDescriptor<Job> {
        TableDescriptor::builder("Job")
            .flags(flags)
            .column(Column::new("Id", |j: &Job| j.id, |j, v| j.id = v))
            .column(Column::new(
                "CustomerId",
                |j: &Job| j.customer_id,
                |j, v| j.customer_id = v,
            ))
            .column(Column::new(
                "Title",
                |j: &Job| j.title.clone(),
                |j, v| j.title = v,
            ))
            .column(Column::new(
                "Notes",
                |j: &Job| j.notes.clone(),
                |j, v| j.notes = v,
            ))
            .build()
    }

    #[test]
    fn implicit_pk_and_index() {
        let table = job_descriptor(
            CreateFlags::IMPLICIT_PK | CreateFlags::IMPLICIT_INDEX | CreateFlags::AUTO_INC_PK,
        );
        let pk = table.primary_key().unwrap();
        assert_eq!(pk.name(), "Id");
        assert!(pk.is_auto_increment());
        assert!(table.auto_inc_pk_index().is_some());

        let indexes = table.indexes().unwrap();
        assert_eq!(indexes.len(), 1);
        assert_eq!(indexes[0].name, "IX_Job_CustomerId");
        assert!(!indexes[0].unique);
        assert_eq!(indexes[0].columns, vec!["CustomerId".to_owned()]);
    }

    #[test]
    fn no_flags_means_no_pk() {
        let table = job_descriptor(CreateFlags::empty());
        assert!(table.primary_key().is_none());
        assert!(table.get_by_pk_sql().is_none());
        assert!(table.indexes().unwrap().is_empty());
    }

    #[test]
    fn lookup_by_name_is_case_insensitive() {
        let table = job_descriptor(CreateFlags::IMPLICIT_PK);
        assert!(table.column("customerid").is_some());
        assert!(table.column("CUSTOMERID").is_some());
        assert!(table.column("nope").is_none());
        assert!(table.column_by_member("Title").is_some());
    }

    #[test]
    fn nullability_follows_option() {
        let table = job_descriptor(CreateFlags::empty());
        assert!(!table.column("Title").unwrap().is_nullable());
        assert!(table.column("Notes").unwrap().is_nullable());
    }

    #[test]
    fn insert_sql_excludes_auto_increment_pk() {
        let table = job_descriptor(CreateFlags::IMPLICIT_PK | CreateFlags::AUTO_INC_PK);
        let sql = table.insert_sql(OnConflict::Abort);
        assert_eq!(
            sql,
            "INSERT INTO \"Job\" (\"CustomerId\", \"Title\", \"Notes\") VALUES (?, ?, ?)"
        );
        let replace = table.insert_sql(OnConflict::Replace);
        assert!(replace.starts_with("INSERT OR REPLACE INTO \"Job\" (\"Id\""));
    }

    #[test]
    fn mixed_unique_flags_fail_index_grouping() {
        #[derive(Default)]
        struct Pair {
            a: i64,
            b: i64,
        }
        let table: TableDescriptor<Pair> = TableDescriptor::builder("Pair")
            .column(Column::new("A", |p: &Pair| p.a, |p, v| p.a = v).unique_in("IX_Pair", 0))
            .column(Column::new("B", |p: &Pair| p.b, |p, v| p.b = v).indexed_in("IX_Pair", 1))
            .build();
        assert!(matches!(table.indexes(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn multi_column_index_orders_participants() {
        #[derive(Default)]
        struct Pair {
            a: i64,
            b: i64,
        }
        let table: TableDescriptor<Pair> = TableDescriptor::builder("Pair")
            .column(Column::new("A", |p: &Pair| p.a, |p, v| p.a = v).unique_in("UX_Pair", 2))
            .column(Column::new("B", |p: &Pair| p.b, |p, v| p.b = v).unique_in("UX_Pair", 1))
            .build();
        let indexes = table.indexes().unwrap();
        assert_eq!(indexes[0].columns, vec!["B".to_owned(), "A".to_owned()]);
        assert!(indexes[0].unique);
        assert!(table.column("A").unwrap().is_unique());
    }

    #[test]
    #[should_panic(expected = "duplicate column name")]
    fn duplicate_names_panic() {
        let _ = TableDescriptor::<Job>::builder("Job")
            .column(Column::new("Id", |j: &Job| j.id, |j, v| j.id = v))
            .column(Column::new("id", |j: &Job| j.id, |j, v| j.id = v))
            .build();
    }

    #[test]
    #[should_panic(expected = "WITHOUT ROWID requires a primary key")]
    fn without_rowid_requires_pk() {
        let _ = TableDescriptor::<Job>::builder("Job")
            .without_rowid()
            .column(Column::new("Title", |j: &Job| j.title.clone(), |j, v| j.title = v))
            .build();
    }

    #[test]
    fn registry_caches_first_build() {
        impl Record for Job {
            fn table() -> TableDescriptor<Job> {
                job_descriptor(CreateFlags::IMPLICIT_PK | CreateFlags::AUTO_INC_PK)
            }
        }
        let registry = MappingRegistry::new();
        let a = registry.get::<Job>();
        let b = registry.get::<Job>();
        assert!(Arc::ptr_eq(&a, &b));
        registry.clear();
        let c = registry.get::<Job>();
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
