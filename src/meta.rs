//! Free-form key/value metadata attached to licenses.
//!
//! Values are arbitrary JSON, stored as serialized text in `license_meta`.
//! A license may hold several rows under the same key.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use sqlx::FromRow;

use crate::errors::{LicenseError, LicenseResult};
use crate::logging::{log_license_event, LicenseEvent};
use crate::store::{Database, Direction, LicenseColumn, MetaColumn, Query};
use crate::validation::validate_not_empty;

/// One metadata row.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct LicenseMeta {
    pub meta_id: i64,
    pub license_id: i64,
    pub meta_key: String,
    pub meta_value: Option<String>,
}

impl LicenseMeta {
    /// Decoded value. Text that is not JSON comes back as a plain string.
    pub fn value(&self) -> Value {
        match &self.meta_value {
            None => Value::Null,
            Some(raw) => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone())),
        }
    }
}

fn encode(value: &Value) -> LicenseResult<String> {
    serde_json::to_string(value).map_err(|e| LicenseError::ValidationError {
        field: "meta_value".to_string(),
        message: e.to_string(),
    })
}

fn key_query(license_id: i64, meta_key: &str) -> Query<MetaColumn> {
    Query::new()
        .eq(MetaColumn::LicenseId, license_id)
        .eq(MetaColumn::MetaKey, meta_key)
}

/// Metadata operations keyed by license id.
#[derive(Debug, Clone)]
pub struct MetaOverlay {
    db: Arc<Database>,
}

impl MetaOverlay {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Attach a value under `meta_key` and return the stored row.
    ///
    /// Fails with `NotFoundError` if no license has `license_id`.
    pub async fn add_meta(
        &self,
        license_id: i64,
        meta_key: &str,
        value: &Value,
    ) -> LicenseResult<LicenseMeta> {
        validate_not_empty(meta_key, "meta_key")?;

        let exists = self
            .db
            .count_licenses(&Query::new().eq(LicenseColumn::Id, license_id))
            .await?;
        if exists == 0 {
            return Err(LicenseError::NotFoundError(format!("license {license_id}")));
        }

        let meta_id = self
            .db
            .insert_meta(license_id, meta_key, &encode(value)?)
            .await?;
        let stored = self
            .db
            .find_meta(&Query::new().eq(MetaColumn::MetaId, meta_id))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| LicenseError::NotFoundError(format!("meta row {meta_id}")))?;
        log_license_event(LicenseEvent::MetaAdded, license_id, Some(meta_key));
        Ok(stored)
    }

    /// The oldest value stored under `meta_key`, if any.
    pub async fn get_meta(&self, license_id: i64, meta_key: &str) -> LicenseResult<Option<Value>> {
        let query = key_query(license_id, meta_key)
            .order_by(MetaColumn::MetaId, Direction::Asc)
            .limit(1);
        let rows = self.db.find_meta(&query).await?;
        Ok(rows.first().map(LicenseMeta::value))
    }

    /// Every value stored under `meta_key`, oldest first.
    pub async fn get_meta_values(
        &self,
        license_id: i64,
        meta_key: &str,
    ) -> LicenseResult<Vec<Value>> {
        let query = key_query(license_id, meta_key).order_by(MetaColumn::MetaId, Direction::Asc);
        let rows = self.db.find_meta(&query).await?;
        Ok(rows.iter().map(LicenseMeta::value).collect())
    }

    /// All metadata rows of a license.
    pub async fn list_meta(&self, license_id: i64) -> LicenseResult<Vec<LicenseMeta>> {
        let query = Query::new()
            .eq(MetaColumn::LicenseId, license_id)
            .order_by(MetaColumn::MetaId, Direction::Asc);
        self.db.find_meta(&query).await
    }

    /// Overwrite values under `meta_key`.
    ///
    /// With `previous`, only rows currently holding that value are changed.
    /// Returns whether any row was updated.
    pub async fn update_meta(
        &self,
        license_id: i64,
        meta_key: &str,
        value: &Value,
        previous: Option<&Value>,
    ) -> LicenseResult<bool> {
        let mut query = key_query(license_id, meta_key);
        if let Some(previous) = previous {
            query = query.eq(MetaColumn::MetaValue, encode(previous)?);
        }

        let rows = self.db.update_meta(&query, &encode(value)?).await?;
        if rows > 0 {
            log_license_event(LicenseEvent::MetaUpdated, license_id, Some(meta_key));
        }
        Ok(rows > 0)
    }

    /// Remove values under `meta_key`, or only those equal to `value`.
    ///
    /// Returns the number of rows deleted.
    pub async fn delete_meta(
        &self,
        license_id: i64,
        meta_key: &str,
        value: Option<&Value>,
    ) -> LicenseResult<u64> {
        let mut query = key_query(license_id, meta_key);
        if let Some(value) = value {
            query = query.eq(MetaColumn::MetaValue, encode(value)?);
        }

        let rows = self.db.delete_meta(&query).await?;
        if rows > 0 {
            log_license_event(LicenseEvent::MetaDeleted, license_id, Some(meta_key));
        }
        Ok(rows)
    }

    /// Remove every metadata row of a license. Returns the number removed.
    pub async fn delete_all_meta(&self, license_id: i64) -> LicenseResult<u64> {
        let rows = self
            .db
            .delete_meta(&Query::new().eq(MetaColumn::LicenseId, license_id))
            .await?;
        if rows > 0 {
            log_license_event(LicenseEvent::MetaDeleted, license_id, Some("*"));
        }
        Ok(rows)
    }
}
