#![allow(dead_code)]

use std::sync::Arc;

use sqlx::sqlite::SqlitePoolOptions;

use keyward::errors::{LicenseError, LicenseResult};
use keyward::{Database, KeyCodec, LicenseService, MetaOverlay};

/// Helper: create an in-memory SQLite Database with all tables.
pub async fn setup_in_memory_db() -> LicenseResult<Arc<Database>> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .map_err(|e| LicenseError::DatabaseError(format!("db connect failed: {e}")))?;

    let db = Database::SQLite(pool);
    db.migrate().await?;
    Ok(Arc::new(db))
}

/// Helper: a codec with fixed test secrets.
pub fn test_codec() -> Arc<KeyCodec> {
    let codec = KeyCodec::new([7u8; 32], b"test-hash-secret").expect("valid test secrets");
    Arc::new(codec)
}

pub async fn setup_service() -> LicenseResult<(Arc<Database>, LicenseService)> {
    let db = setup_in_memory_db().await?;
    let service = LicenseService::new(db.clone(), test_codec());
    Ok((db, service))
}

pub async fn setup_meta() -> LicenseResult<(LicenseService, MetaOverlay)> {
    let db = setup_in_memory_db().await?;
    let service = LicenseService::new(db.clone(), test_codec());
    Ok((service, MetaOverlay::new(db)))
}
