use chrono::Utc;
use sqlx::FromRow;
use std::sync::Arc;
use tracing::{debug, error};

#[cfg(feature = "sqlite")]
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};

#[cfg(feature = "postgres")]
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};

use crate::config::{get_config, DatabaseConfig};
use crate::errors::{LicenseError, LicenseResult};
use crate::license::{License, NewLicense};
use crate::license_key::{Generator, RuleSet};
use crate::meta::LicenseMeta;

use super::query::{
    Changes, Column, Dialect, GeneratorColumn, LicenseColumn, MetaColumn, Query, SqlValue,
    Statement,
};
use super::schema;

#[cfg(not(any(feature = "sqlite", feature = "postgres")))]
compile_error!("enable at least one database backend: the `sqlite` or `postgres` feature");

/// Rows decodable from a SQLite result.
#[cfg(feature = "sqlite")]
pub trait SqliteRecord: for<'r> FromRow<'r, SqliteRow> {}
#[cfg(feature = "sqlite")]
impl<T> SqliteRecord for T where T: for<'r> FromRow<'r, SqliteRow> {}
#[cfg(not(feature = "sqlite"))]
pub trait SqliteRecord {}
#[cfg(not(feature = "sqlite"))]
impl<T> SqliteRecord for T {}

/// Rows decodable from a Postgres result.
#[cfg(feature = "postgres")]
pub trait PgRecord: for<'r> FromRow<'r, PgRow> {}
#[cfg(feature = "postgres")]
impl<T> PgRecord for T where T: for<'r> FromRow<'r, PgRow> {}
#[cfg(not(feature = "postgres"))]
pub trait PgRecord {}
#[cfg(not(feature = "postgres"))]
impl<T> PgRecord for T {}

/// Bind every [`SqlValue`] of a statement, in order, onto a sqlx query.
macro_rules! bind_values {
    ($query:expr, $values:expr) => {{
        let mut query = $query;
        for value in $values {
            query = match value {
                SqlValue::Int(v) => query.bind(*v),
                SqlValue::Text(v) => query.bind(v.as_deref()),
                SqlValue::Timestamp(v) => query.bind(*v),
            };
        }
        query
    }};
}

/// Unified database abstraction over SQLite and Postgres.
///
/// This is the license store: every operation the lifecycle needs is an
/// insert, or a find/update/delete/count driven by a typed [`Query`].
/// Available variants depend on enabled features:
/// - `sqlite` feature enables `Database::SQLite`
/// - `postgres` feature enables `Database::Postgres`
#[derive(Debug, Clone)]
pub enum Database {
    #[cfg(feature = "sqlite")]
    SQLite(SqlitePool),
    #[cfg(feature = "postgres")]
    Postgres(PgPool),
}

fn db_error(op: &'static str) -> impl Fn(sqlx::Error) -> LicenseError {
    move |e| {
        error!("{op} failed: {e}");
        LicenseError::DatabaseError(format!("{op}: {e}"))
    }
}

/// Like [`db_error`], but a unique-index violation means the key digest is taken.
fn write_error(op: &'static str) -> impl Fn(sqlx::Error) -> LicenseError {
    move |e| match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            debug!("{op} hit a unique constraint");
            LicenseError::DuplicateLicenseError
        }
        _ => db_error(op)(e),
    }
}

fn insert_statement<C: Column>(
    dialect: Dialect,
    columns: Vec<(C, SqlValue)>,
    returning: &str,
) -> Statement {
    let names: Vec<&str> = columns.iter().map(|(c, _)| c.name()).collect();
    let mut stmt = Statement::new(format!(
        "INSERT INTO {} ({}) VALUES (",
        C::TABLE,
        names.join(", ")
    ));
    for (i, (_, value)) in columns.into_iter().enumerate() {
        if i > 0 {
            stmt.push_sql(", ");
        }
        stmt.push_value(dialect, value);
    }
    stmt.push_sql(") RETURNING ");
    stmt.push_sql(returning);
    stmt
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn rule_set_columns(rule_set: &RuleSet) -> Vec<(GeneratorColumn, SqlValue)> {
    vec![
        (GeneratorColumn::Name, rule_set.name.as_str().into()),
        (GeneratorColumn::Charset, rule_set.charset.as_str().into()),
        (GeneratorColumn::Chunks, i64::from(rule_set.chunks).into()),
        (
            GeneratorColumn::ChunkLength,
            i64::from(rule_set.chunk_length).into(),
        ),
        (GeneratorColumn::Separator, non_empty(&rule_set.separator).into()),
        (GeneratorColumn::Prefix, non_empty(&rule_set.prefix).into()),
        (GeneratorColumn::Suffix, non_empty(&rule_set.suffix).into()),
        (
            GeneratorColumn::ExpiresIn,
            rule_set.expires_in.map(i64::from).into(),
        ),
        (
            GeneratorColumn::TimesActivatedMax,
            rule_set.times_activated_max.map(i64::from).into(),
        ),
    ]
}

impl Database {
    /// Initialize the database connection from the global configuration.
    ///
    /// See `crate::config` for configuration options.
    pub async fn new() -> LicenseResult<Arc<Self>> {
        let config = get_config()?;
        Self::connect(&config.database).await
    }

    /// Open a connection pool for the configured backend.
    pub async fn connect(db_config: &DatabaseConfig) -> LicenseResult<Arc<Self>> {
        match db_config.db_type.as_str() {
            #[cfg(feature = "sqlite")]
            "sqlite" => {
                let pool = SqlitePoolOptions::new()
                    .max_connections(db_config.max_connections)
                    .connect(&db_config.sqlite_url)
                    .await
                    .map_err(|e| {
                        error!("Failed to connect to SQLite: {e}");
                        LicenseError::DatabaseError(format!("failed to connect to SQLite: {e}"))
                    })?;

                Ok(Arc::new(Database::SQLite(pool)))
            }
            #[cfg(not(feature = "sqlite"))]
            "sqlite" => Err(LicenseError::ConfigError(
                "SQLite support not compiled in. Enable the 'sqlite' feature.".to_string(),
            )),
            #[cfg(feature = "postgres")]
            "postgres" => {
                let pool = PgPoolOptions::new()
                    .max_connections(db_config.max_connections)
                    .connect(&db_config.postgres_url)
                    .await
                    .map_err(|e| {
                        error!("Failed to connect to PostgreSQL: {e}");
                        LicenseError::DatabaseError(format!(
                            "failed to connect to PostgreSQL: {e}"
                        ))
                    })?;

                Ok(Arc::new(Database::Postgres(pool)))
            }
            #[cfg(not(feature = "postgres"))]
            "postgres" => Err(LicenseError::ConfigError(
                "PostgreSQL support not compiled in. Enable the 'postgres' feature.".to_string(),
            )),
            other => Err(LicenseError::ConfigError(format!(
                "unsupported database type: {other}"
            ))),
        }
    }

    /// Placeholder flavour of the active backend.
    pub fn dialect(&self) -> Dialect {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(_) => Dialect::Sqlite,
            #[cfg(feature = "postgres")]
            Database::Postgres(_) => Dialect::Postgres,
        }
    }

    pub fn db_type(&self) -> &'static str {
        match self.dialect() {
            Dialect::Sqlite => "sqlite",
            Dialect::Postgres => "postgres",
        }
    }

    /// Create the `licenses`, `generators` and `license_meta` tables if missing.
    pub async fn migrate(&self) -> LicenseResult<()> {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                for ddl in schema::SQLITE_SCHEMA {
                    sqlx::query(ddl)
                        .execute(pool)
                        .await
                        .map_err(db_error("SQLite migrate"))?;
                }
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                for ddl in schema::POSTGRES_SCHEMA {
                    sqlx::query(ddl)
                        .execute(pool)
                        .await
                        .map_err(db_error("Postgres migrate"))?;
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statement execution
    // ------------------------------------------------------------------

    async fn execute(&self, stmt: &Statement) -> Result<u64, sqlx::Error> {
        let result = match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => bind_values!(sqlx::query(&stmt.sql), &stmt.values)
                .execute(pool)
                .await?
                .rows_affected(),
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => bind_values!(sqlx::query(&stmt.sql), &stmt.values)
                .execute(pool)
                .await?
                .rows_affected(),
        };
        Ok(result)
    }

    async fn fetch_scalar(&self, stmt: &Statement) -> Result<i64, sqlx::Error> {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                bind_values!(sqlx::query_scalar::<_, i64>(&stmt.sql), &stmt.values)
                    .fetch_one(pool)
                    .await
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                bind_values!(sqlx::query_scalar::<_, i64>(&stmt.sql), &stmt.values)
                    .fetch_one(pool)
                    .await
            }
        }
    }

    async fn fetch_all<T>(&self, stmt: &Statement) -> Result<Vec<T>, sqlx::Error>
    where
        T: SqliteRecord + PgRecord + Send + Unpin,
    {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                bind_values!(sqlx::query_as::<_, T>(&stmt.sql), &stmt.values)
                    .fetch_all(pool)
                    .await
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                bind_values!(sqlx::query_as::<_, T>(&stmt.sql), &stmt.values)
                    .fetch_all(pool)
                    .await
            }
        }
    }

    async fn fetch_optional<T>(&self, stmt: &Statement) -> Result<Option<T>, sqlx::Error>
    where
        T: SqliteRecord + PgRecord + Send + Unpin,
    {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                bind_values!(sqlx::query_as::<_, T>(&stmt.sql), &stmt.values)
                    .fetch_optional(pool)
                    .await
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                bind_values!(sqlx::query_as::<_, T>(&stmt.sql), &stmt.values)
                    .fetch_optional(pool)
                    .await
            }
        }
    }

    /// Run an UPDATE built from `changes`, stamping the audit columns given.
    async fn update_where<C: Column>(
        &self,
        query: &Query<C>,
        mut changes: Changes<C>,
        audit: Option<(C, C, Option<i64>)>,
    ) -> Result<u64, sqlx::Error> {
        if changes.is_empty() {
            return Ok(0);
        }
        if let Some((updated_at, updated_by, actor)) = audit {
            changes.push(updated_at, Utc::now().naive_utc());
            changes.push(updated_by, actor);
        }
        self.execute(&changes.to_update(query, self.dialect())).await
    }

    // ------------------------------------------------------------------
    // Licenses
    // ------------------------------------------------------------------

    /// Insert a license and return its new id.
    ///
    /// Returns `DuplicateLicenseError` if the digest is already stored.
    pub async fn insert_license(
        &self,
        license: &NewLicense,
        actor: Option<i64>,
    ) -> LicenseResult<i64> {
        let columns = vec![
            (LicenseColumn::OrderId, license.order_id.into()),
            (LicenseColumn::ProductId, license.product_id.into()),
            (
                LicenseColumn::LicenseKey,
                license.key_encrypted.as_str().into(),
            ),
            (LicenseColumn::Hash, license.key_hash.as_str().into()),
            (LicenseColumn::ExpiresAt, license.expires_at.into()),
            (LicenseColumn::ValidFor, license.valid_for.into()),
            (LicenseColumn::Source, license.source.ordinal().into()),
            (LicenseColumn::Status, license.status.ordinal().into()),
            (LicenseColumn::TimesActivated, license.times_activated.into()),
            (
                LicenseColumn::TimesActivatedMax,
                license.times_activated_max.into(),
            ),
            (LicenseColumn::CreatedAt, Utc::now().naive_utc().into()),
            (LicenseColumn::CreatedBy, actor.into()),
        ];
        let stmt = insert_statement(self.dialect(), columns, "id");

        self.fetch_scalar(&stmt)
            .await
            .map_err(write_error("insert_license"))
    }

    /// First license matching `query`.
    pub async fn find_license(
        &self,
        query: &Query<LicenseColumn>,
    ) -> LicenseResult<Option<License>> {
        let stmt = query.to_select(self.dialect());
        self.fetch_optional(&stmt)
            .await
            .map_err(db_error("find_license"))
    }

    /// Fetch a license by its store id.
    ///
    /// Only used to read back rows this store just wrote.
    pub async fn find_license_by_id(&self, id: i64) -> LicenseResult<Option<License>> {
        self.find_license(&Query::new().eq(LicenseColumn::Id, id))
            .await
    }

    pub async fn find_licenses(&self, query: &Query<LicenseColumn>) -> LicenseResult<Vec<License>> {
        let stmt = query.to_select(self.dialect());
        self.fetch_all(&stmt)
            .await
            .map_err(db_error("find_licenses"))
    }

    /// Whether a license with this key digest exists.
    pub async fn license_hash_exists(&self, hash: &str) -> LicenseResult<bool> {
        let count = self
            .count_licenses(&Query::new().eq(LicenseColumn::Hash, hash))
            .await?;
        Ok(count > 0)
    }

    /// Apply `changes` to every license matching `query`.
    ///
    /// Returns the number of rows updated. `updated_at`/`updated_by` are
    /// stamped automatically.
    pub async fn update_licenses(
        &self,
        query: &Query<LicenseColumn>,
        changes: Changes<LicenseColumn>,
        actor: Option<i64>,
    ) -> LicenseResult<u64> {
        self.update_where(
            query,
            changes,
            Some((LicenseColumn::UpdatedAt, LicenseColumn::UpdatedBy, actor)),
        )
        .await
        .map_err(write_error("update_licenses"))
    }

    pub async fn delete_licenses(&self, query: &Query<LicenseColumn>) -> LicenseResult<u64> {
        let stmt = query.to_delete(self.dialect());
        self.execute(&stmt)
            .await
            .map_err(db_error("delete_licenses"))
    }

    pub async fn count_licenses(&self, query: &Query<LicenseColumn>) -> LicenseResult<i64> {
        let stmt = query.to_count(self.dialect());
        self.fetch_scalar(&stmt)
            .await
            .map_err(db_error("count_licenses"))
    }

    // ------------------------------------------------------------------
    // Generators
    // ------------------------------------------------------------------

    /// Persist a rule set and return its id.
    pub async fn insert_generator(
        &self,
        rule_set: &RuleSet,
        actor: Option<i64>,
    ) -> LicenseResult<i64> {
        rule_set.validate()?;

        let mut columns = rule_set_columns(rule_set);
        columns.push((GeneratorColumn::CreatedAt, Utc::now().naive_utc().into()));
        columns.push((GeneratorColumn::CreatedBy, actor.into()));
        let stmt = insert_statement(self.dialect(), columns, "id");

        self.fetch_scalar(&stmt)
            .await
            .map_err(db_error("insert_generator"))
    }

    pub async fn find_generator_by_id(&self, id: i64) -> LicenseResult<Option<Generator>> {
        let stmt = Query::new()
            .eq(GeneratorColumn::Id, id)
            .to_select(self.dialect());
        self.fetch_optional(&stmt)
            .await
            .map_err(db_error("find_generator_by_id"))
    }

    pub async fn find_generators(
        &self,
        query: &Query<GeneratorColumn>,
    ) -> LicenseResult<Vec<Generator>> {
        let stmt = query.to_select(self.dialect());
        self.fetch_all(&stmt)
            .await
            .map_err(db_error("find_generators"))
    }

    /// Replace the stored rule set. Returns `false` if no generator has `id`.
    pub async fn update_generator(
        &self,
        id: i64,
        rule_set: &RuleSet,
        actor: Option<i64>,
    ) -> LicenseResult<bool> {
        rule_set.validate()?;

        let mut changes = Changes::new();
        for (column, value) in rule_set_columns(rule_set) {
            changes.push(column, value);
        }
        let rows = self
            .update_where(
                &Query::new().eq(GeneratorColumn::Id, id),
                changes,
                Some((GeneratorColumn::UpdatedAt, GeneratorColumn::UpdatedBy, actor)),
            )
            .await
            .map_err(db_error("update_generator"))?;
        Ok(rows > 0)
    }

    pub async fn delete_generator(&self, id: i64) -> LicenseResult<bool> {
        let stmt = Query::new()
            .eq(GeneratorColumn::Id, id)
            .to_delete(self.dialect());
        let rows = self
            .execute(&stmt)
            .await
            .map_err(db_error("delete_generator"))?;
        Ok(rows > 0)
    }

    // ------------------------------------------------------------------
    // License meta
    // ------------------------------------------------------------------

    /// Insert one meta row and return its `meta_id`.
    pub async fn insert_meta(
        &self,
        license_id: i64,
        meta_key: &str,
        meta_value: &str,
    ) -> LicenseResult<i64> {
        let columns = vec![
            (MetaColumn::LicenseId, license_id.into()),
            (MetaColumn::MetaKey, meta_key.into()),
            (MetaColumn::MetaValue, meta_value.into()),
        ];
        let stmt = insert_statement(self.dialect(), columns, "meta_id");
        self.fetch_scalar(&stmt)
            .await
            .map_err(db_error("insert_meta"))
    }

    pub async fn find_meta(&self, query: &Query<MetaColumn>) -> LicenseResult<Vec<LicenseMeta>> {
        let stmt = query.to_select(self.dialect());
        self.fetch_all(&stmt).await.map_err(db_error("find_meta"))
    }

    /// Set `meta_value` on every row matching `query`.
    pub async fn update_meta(
        &self,
        query: &Query<MetaColumn>,
        meta_value: &str,
    ) -> LicenseResult<u64> {
        let changes = Changes::new().set(MetaColumn::MetaValue, meta_value);
        self.update_where(query, changes, None)
            .await
            .map_err(db_error("update_meta"))
    }

    pub async fn delete_meta(&self, query: &Query<MetaColumn>) -> LicenseResult<u64> {
        let stmt = query.to_delete(self.dialect());
        self.execute(&stmt).await.map_err(db_error("delete_meta"))
    }
}
