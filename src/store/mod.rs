//! License store.
//!
//! - `database` → `Database`, the SQLite/Postgres backed store
//! - `query`    → typed predicates, ordering and column assignments
//! - `schema`   → table definitions applied by `Database::migrate`

pub mod database;
pub mod query;
pub mod schema;

pub use database::Database;
pub use query::{
    Changes, Column, Comparison, Dialect, Direction, GeneratorColumn, LicenseColumn, MetaColumn,
    Predicate, Query, SqlValue, Statement,
};
