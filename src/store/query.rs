//! Typed predicates for the storage layer.
//!
//! A [`Query`] is an AND-conjunction of [`Predicate`]s over the columns of a
//! single table, with optional ordering and limit. [`Changes`] is the matching
//! set of column assignments for update-by-predicate. Both render to SQL with
//! dialect specific placeholders; values are bound separately, never inlined.

use chrono::NaiveDateTime;

/// A column of one table.
pub trait Column: Copy + std::fmt::Debug {
    /// Table the column belongs to.
    const TABLE: &'static str;

    /// Column name as it appears in SQL.
    fn name(&self) -> &'static str;
}

/// Columns of the `licenses` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseColumn {
    Id,
    OrderId,
    ProductId,
    LicenseKey,
    Hash,
    ExpiresAt,
    ValidFor,
    Source,
    Status,
    TimesActivated,
    TimesActivatedMax,
    CreatedAt,
    CreatedBy,
    UpdatedAt,
    UpdatedBy,
}

impl Column for LicenseColumn {
    const TABLE: &'static str = "licenses";

    fn name(&self) -> &'static str {
        match self {
            LicenseColumn::Id => "id",
            LicenseColumn::OrderId => "order_id",
            LicenseColumn::ProductId => "product_id",
            LicenseColumn::LicenseKey => "license_key",
            LicenseColumn::Hash => "hash",
            LicenseColumn::ExpiresAt => "expires_at",
            LicenseColumn::ValidFor => "valid_for",
            LicenseColumn::Source => "source",
            LicenseColumn::Status => "status",
            LicenseColumn::TimesActivated => "times_activated",
            LicenseColumn::TimesActivatedMax => "times_activated_max",
            LicenseColumn::CreatedAt => "created_at",
            LicenseColumn::CreatedBy => "created_by",
            LicenseColumn::UpdatedAt => "updated_at",
            LicenseColumn::UpdatedBy => "updated_by",
        }
    }
}

/// Columns of the `generators` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorColumn {
    Id,
    Name,
    Charset,
    Chunks,
    ChunkLength,
    Separator,
    Prefix,
    Suffix,
    ExpiresIn,
    TimesActivatedMax,
    CreatedAt,
    CreatedBy,
    UpdatedAt,
    UpdatedBy,
}

impl Column for GeneratorColumn {
    const TABLE: &'static str = "generators";

    fn name(&self) -> &'static str {
        match self {
            GeneratorColumn::Id => "id",
            GeneratorColumn::Name => "name",
            GeneratorColumn::Charset => "charset",
            GeneratorColumn::Chunks => "chunks",
            GeneratorColumn::ChunkLength => "chunk_length",
            GeneratorColumn::Separator => "separator",
            GeneratorColumn::Prefix => "prefix",
            GeneratorColumn::Suffix => "suffix",
            GeneratorColumn::ExpiresIn => "expires_in",
            GeneratorColumn::TimesActivatedMax => "times_activated_max",
            GeneratorColumn::CreatedAt => "created_at",
            GeneratorColumn::CreatedBy => "created_by",
            GeneratorColumn::UpdatedAt => "updated_at",
            GeneratorColumn::UpdatedBy => "updated_by",
        }
    }
}

/// Columns of the `license_meta` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaColumn {
    MetaId,
    LicenseId,
    MetaKey,
    MetaValue,
}

impl Column for MetaColumn {
    const TABLE: &'static str = "license_meta";

    fn name(&self) -> &'static str {
        match self {
            MetaColumn::MetaId => "meta_id",
            MetaColumn::LicenseId => "license_id",
            MetaColumn::MetaKey => "meta_key",
            MetaColumn::MetaValue => "meta_value",
        }
    }
}

/// A bindable value. Every variant is nullable so NULLs keep their SQL type.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Int(Option<i64>),
    Text(Option<String>),
    Timestamp(Option<NaiveDateTime>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        match self {
            SqlValue::Int(v) => v.is_none(),
            SqlValue::Text(v) => v.is_none(),
            SqlValue::Timestamp(v) => v.is_none(),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(Some(v))
    }
}

impl From<Option<i64>> for SqlValue {
    fn from(v: Option<i64>) -> Self {
        SqlValue::Int(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(Some(v.to_string()))
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(Some(v))
    }
}

impl From<Option<String>> for SqlValue {
    fn from(v: Option<String>) -> Self {
        SqlValue::Text(v)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(v: NaiveDateTime) -> Self {
        SqlValue::Timestamp(Some(v))
    }
}

impl From<Option<NaiveDateTime>> for SqlValue {
    fn from(v: Option<NaiveDateTime>) -> Self {
        SqlValue::Timestamp(v)
    }
}

/// Ordering comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparison {
    fn operator(&self) -> &'static str {
        match self {
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
        }
    }
}

/// A single filter over one column.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate<C: Column> {
    /// `column = value`; a null value renders as `IS NULL`
    Eq(C, SqlValue),
    /// `column IN (...)`; an empty set matches nothing
    In(C, Vec<SqlValue>),
    IsNull(C),
    NotNull(C),
    Compare(C, Comparison, SqlValue),
}

/// Sort direction for [`Query::order_by`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// SQL placeholder flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `?`
    Sqlite,
    /// `$1, $2, ...`
    Postgres,
}

/// SQL text plus the values to bind, in placeholder order.
#[derive(Debug, Default)]
pub struct Statement {
    pub sql: String,
    pub values: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            values: Vec::new(),
        }
    }

    pub fn push_sql(&mut self, sql: &str) {
        self.sql.push_str(sql);
    }

    /// Append a placeholder for `value`.
    pub fn push_value(&mut self, dialect: Dialect, value: SqlValue) {
        self.values.push(value);
        match dialect {
            Dialect::Sqlite => self.sql.push('?'),
            Dialect::Postgres => {
                self.sql.push('$');
                self.sql.push_str(&self.values.len().to_string());
            }
        }
    }
}

/// Conjunction of predicates over one table.
#[derive(Debug, Clone, PartialEq)]
pub struct Query<C: Column> {
    predicates: Vec<Predicate<C>>,
    order: Option<(C, Direction)>,
    limit: Option<u32>,
}

impl<C: Column> Default for Query<C> {
    fn default() -> Self {
        Self {
            predicates: Vec::new(),
            order: None,
            limit: None,
        }
    }
}

impl<C: Column> Query<C> {
    /// A query matching every row.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, predicate: Predicate<C>) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn eq(self, column: C, value: impl Into<SqlValue>) -> Self {
        self.filter(Predicate::Eq(column, value.into()))
    }

    pub fn is_in<V: Into<SqlValue>>(self, column: C, values: impl IntoIterator<Item = V>) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.filter(Predicate::In(column, values))
    }

    pub fn is_null(self, column: C) -> Self {
        self.filter(Predicate::IsNull(column))
    }

    pub fn not_null(self, column: C) -> Self {
        self.filter(Predicate::NotNull(column))
    }

    pub fn compare(self, column: C, comparison: Comparison, value: impl Into<SqlValue>) -> Self {
        self.filter(Predicate::Compare(column, comparison, value.into()))
    }

    pub fn order_by(mut self, column: C, direction: Direction) -> Self {
        self.order = Some((column, direction));
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn predicates(&self) -> &[Predicate<C>] {
        &self.predicates
    }

    /// Append ` WHERE ...` (if any predicate is present) to `stmt`.
    pub fn push_where(&self, dialect: Dialect, stmt: &mut Statement) {
        for (i, predicate) in self.predicates.iter().enumerate() {
            stmt.push_sql(if i == 0 { " WHERE " } else { " AND " });
            match predicate {
                Predicate::Eq(column, value) if value.is_null() => {
                    stmt.push_sql(column.name());
                    stmt.push_sql(" IS NULL");
                }
                Predicate::Eq(column, value) => {
                    stmt.push_sql(column.name());
                    stmt.push_sql(" = ");
                    stmt.push_value(dialect, value.clone());
                }
                Predicate::In(_, values) if values.is_empty() => {
                    stmt.push_sql("1 = 0");
                }
                Predicate::In(column, values) => {
                    stmt.push_sql(column.name());
                    stmt.push_sql(" IN (");
                    for (j, value) in values.iter().enumerate() {
                        if j > 0 {
                            stmt.push_sql(", ");
                        }
                        stmt.push_value(dialect, value.clone());
                    }
                    stmt.push_sql(")");
                }
                Predicate::IsNull(column) => {
                    stmt.push_sql(column.name());
                    stmt.push_sql(" IS NULL");
                }
                Predicate::NotNull(column) => {
                    stmt.push_sql(column.name());
                    stmt.push_sql(" IS NOT NULL");
                }
                Predicate::Compare(column, comparison, value) => {
                    stmt.push_sql(column.name());
                    stmt.push_sql(" ");
                    stmt.push_sql(comparison.operator());
                    stmt.push_sql(" ");
                    stmt.push_value(dialect, value.clone());
                }
            }
        }
    }

    /// Append ` ORDER BY ... LIMIT ...` to `stmt`.
    pub fn push_tail(&self, dialect: Dialect, stmt: &mut Statement) {
        if let Some((column, direction)) = self.order {
            stmt.push_sql(" ORDER BY ");
            stmt.push_sql(column.name());
            stmt.push_sql(match direction {
                Direction::Asc => " ASC",
                Direction::Desc => " DESC",
            });
        }
        if let Some(limit) = self.limit {
            stmt.push_sql(" LIMIT ");
            stmt.push_value(dialect, SqlValue::from(i64::from(limit)));
        }
    }

    /// `SELECT * FROM <table> WHERE ... ORDER BY ... LIMIT ...`
    pub fn to_select(&self, dialect: Dialect) -> Statement {
        let mut stmt = Statement::new(format!("SELECT * FROM {}", C::TABLE));
        self.push_where(dialect, &mut stmt);
        self.push_tail(dialect, &mut stmt);
        stmt
    }

    /// `SELECT COUNT(*) FROM <table> WHERE ...`
    pub fn to_count(&self, dialect: Dialect) -> Statement {
        let mut stmt = Statement::new(format!("SELECT COUNT(*) FROM {}", C::TABLE));
        self.push_where(dialect, &mut stmt);
        stmt
    }

    /// `DELETE FROM <table> WHERE ...`
    pub fn to_delete(&self, dialect: Dialect) -> Statement {
        let mut stmt = Statement::new(format!("DELETE FROM {}", C::TABLE));
        self.push_where(dialect, &mut stmt);
        stmt
    }
}

/// Ordered column assignments for an UPDATE.
#[derive(Debug, Clone, PartialEq)]
pub struct Changes<C: Column> {
    assignments: Vec<(C, SqlValue)>,
}

impl<C: Column> Default for Changes<C> {
    fn default() -> Self {
        Self {
            assignments: Vec::new(),
        }
    }
}

impl<C: Column> Changes<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, column: C, value: impl Into<SqlValue>) -> Self {
        self.push(column, value);
        self
    }

    pub fn push(&mut self, column: C, value: impl Into<SqlValue>) {
        self.assignments.push((column, value.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn contains(&self, column: C) -> bool
    where
        C: PartialEq,
    {
        self.assignments.iter().any(|(c, _)| *c == column)
    }

    /// `UPDATE <table> SET ... WHERE ...`
    pub fn to_update(&self, query: &Query<C>, dialect: Dialect) -> Statement {
        let mut stmt = Statement::new(format!("UPDATE {} SET ", C::TABLE));
        for (i, (column, value)) in self.assignments.iter().enumerate() {
            if i > 0 {
                stmt.push_sql(", ");
            }
            stmt.push_sql(column.name());
            stmt.push_sql(" = ");
            stmt.push_value(dialect, value.clone());
        }
        query.push_where(dialect, &mut stmt);
        stmt
    }
}
