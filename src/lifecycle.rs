//! License lifecycle: create, look up, patch, delete and count activations.
//!
//! Every operation that addresses a license by its plaintext key translates it
//! to the keyed digest first; the store is never searched by plaintext or
//! ciphertext.
//!
//! Status is free-form between the five legal values. The activation counter
//! is the only enforced state machine: `times_activated` never exceeds
//! `times_activated_max` and never drops below zero. Counter writes are
//! compare-and-set on the value that was read, so two concurrent activations
//! cannot both spend the last slot.

use std::sync::Arc;

use chrono::{NaiveDateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::LifecycleConfig;
use crate::encryption::KeyCodec;
use crate::errors::{LicenseError, LicenseResult};
use crate::license::{
    License, LicenseDraft, LicenseSource, LicenseStatus, LicenseUpdate, NewLicense,
};
use crate::license_key::{KeyGenerator, RuleSet};
use crate::logging::{log_license_event, LicenseEvent};
use crate::store::{Changes, Database, LicenseColumn, Query};
use crate::validation::{parse_datetime, validate_license_key};

/// Shared settings for licenses issued in bulk (generator or import).
#[derive(Debug, Clone)]
pub struct IssueOptions {
    pub status: LicenseStatus,
    pub order_id: Option<i64>,
    pub product_id: Option<i64>,
    /// `None` keeps the rule set's value; `Some(None)` clears it
    pub valid_for: Option<Option<u32>>,
    /// `None` keeps the rule set's value; `Some(None)` clears it
    pub times_activated_max: Option<Option<u32>>,
}

impl IssueOptions {
    pub fn new(status: LicenseStatus) -> Self {
        Self {
            status,
            order_id: None,
            product_id: None,
            valid_for: None,
            times_activated_max: None,
        }
    }

    pub fn order_id(mut self, order_id: i64) -> Self {
        self.order_id = Some(order_id);
        self
    }

    pub fn product_id(mut self, product_id: i64) -> Self {
        self.product_id = Some(product_id);
        self
    }

    pub fn valid_for(mut self, days: Option<u32>) -> Self {
        self.valid_for = Some(days);
        self
    }

    pub fn times_activated_max(mut self, max: Option<u32>) -> Self {
        self.times_activated_max = Some(max);
        self
    }

    fn draft(&self, key: &str, source: LicenseSource, defaults: Option<&RuleSet>) -> LicenseDraft {
        let mut draft = LicenseDraft::new(key, self.status).source(source);
        draft.order_id = self.order_id;
        draft.product_id = self.product_id;
        draft.valid_for = self
            .valid_for
            .unwrap_or_else(|| defaults.and_then(|r| r.expires_in));
        draft.times_activated_max = self
            .times_activated_max
            .unwrap_or_else(|| defaults.and_then(|r| r.times_activated_max));
        draft
    }
}

/// Outcome of [`LicenseService::import_keys`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub added: usize,
    pub failed: usize,
    /// Store ids of the imported licenses, in input order
    pub ids: Vec<i64>,
}

fn check_ceiling(
    times_activated: Option<i64>,
    times_activated_max: Option<i64>,
) -> LicenseResult<()> {
    match (times_activated, times_activated_max) {
        (Some(current), Some(max)) if current > max => {
            Err(LicenseError::ActivationCeilingExceededError {
                times_activated: current,
                times_activated_max: max,
            })
        }
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CounterStep {
    Up,
    Down,
}

impl CounterStep {
    /// Counter value after this step, or why the step is not allowed.
    fn next(self, license: &License) -> LicenseResult<i64> {
        let current = license.activation_count();
        match self {
            CounterStep::Up => match license.times_activated_max {
                Some(max) if current >= max => Err(LicenseError::ActivationCeilingExceededError {
                    times_activated: current,
                    times_activated_max: max,
                }),
                _ => Ok(current + 1),
            },
            CounterStep::Down if current <= 0 => Err(LicenseError::NotActivatedError),
            CounterStep::Down => Ok(current - 1),
        }
    }

    fn event(self) -> LicenseEvent {
        match self {
            CounterStep::Up => LicenseEvent::Activated,
            CounterStep::Down => LicenseEvent::Deactivated,
        }
    }
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

/// License operations over a store and a key codec.
#[derive(Debug, Clone)]
pub struct LicenseService {
    db: Arc<Database>,
    codec: Arc<KeyCodec>,
    actor: Option<i64>,
    max_write_attempts: u32,
}

impl LicenseService {
    pub fn new(db: Arc<Database>, codec: Arc<KeyCodec>) -> Self {
        Self::from_config(db, codec, &LifecycleConfig::default())
    }

    pub fn from_config(db: Arc<Database>, codec: Arc<KeyCodec>, config: &LifecycleConfig) -> Self {
        Self {
            db,
            codec,
            actor: None,
            max_write_attempts: config.max_write_attempts.max(1),
        }
    }

    /// User id recorded in `created_by` / `updated_by`.
    pub fn with_actor(mut self, user_id: i64) -> Self {
        self.actor = Some(user_id);
        self
    }

    /// Compare-and-set attempts for counter writes before `ConflictError`.
    pub fn with_max_write_attempts(mut self, attempts: u32) -> Self {
        self.max_write_attempts = attempts.max(1);
        self
    }

    fn by_hash(&self, hash: &str) -> Query<LicenseColumn> {
        Query::new().eq(LicenseColumn::Hash, hash)
    }

    async fn fetch_back(&self, id: i64) -> LicenseResult<License> {
        self.db
            .find_license_by_id(id)
            .await?
            .ok_or_else(|| LicenseError::NotFoundError(format!("license {id}")))
    }

    async fn require(&self, license_key: &str) -> LicenseResult<License> {
        self.find_by_key(license_key)
            .await?
            .ok_or_else(|| LicenseError::NotFoundError("license key".to_string()))
    }

    /// Validate, encrypt, hash and persist a draft. Nothing is written if any
    /// check fails.
    async fn insert(&self, draft: &LicenseDraft) -> LicenseResult<License> {
        validate_license_key(&draft.license_key)?;

        let times_activated = draft.times_activated.map(i64::from);
        let times_activated_max = draft.times_activated_max.map(i64::from);
        check_ceiling(times_activated, times_activated_max)?;

        let explicit = draft.expires_at.as_deref().map(parse_datetime).transpose()?;
        let expires_at = LicenseDraft::resolve_expiry(explicit, draft.valid_for, now())?;

        let key_hash = self.codec.hash(&draft.license_key);
        if self.db.license_hash_exists(&key_hash).await? {
            return Err(LicenseError::DuplicateLicenseError);
        }

        let new_license = NewLicense {
            order_id: draft.order_id,
            product_id: draft.product_id,
            key_encrypted: self.codec.encrypt(&draft.license_key)?,
            key_hash,
            expires_at,
            valid_for: draft.valid_for.map(i64::from),
            source: draft.source,
            status: draft.status,
            times_activated,
            times_activated_max,
        };

        let id = self.db.insert_license(&new_license, self.actor).await?;
        self.fetch_back(id).await
    }

    /// Create a license from a plaintext key.
    pub async fn create(&self, draft: LicenseDraft) -> LicenseResult<License> {
        let license = self.insert(&draft).await?;
        log_license_event(LicenseEvent::Created, license.id, None);
        Ok(license)
    }

    pub async fn find_by_key(&self, license_key: &str) -> LicenseResult<Option<License>> {
        let hash = self.codec.hash(license_key);
        self.db.find_license(&self.by_hash(&hash)).await
    }

    pub async fn find_by_id(&self, id: i64) -> LicenseResult<Option<License>> {
        self.db.find_license_by_id(id).await
    }

    pub async fn find_all(&self, query: &Query<LicenseColumn>) -> LicenseResult<Vec<License>> {
        self.db.find_licenses(query).await
    }

    pub async fn count(&self, query: &Query<LicenseColumn>) -> LicenseResult<i64> {
        self.db.count_licenses(query).await
    }

    /// Plaintext key of a stored license.
    pub fn decrypt_key(&self, license: &License) -> LicenseResult<String> {
        self.codec.decrypt(&license.key_encrypted)
    }

    /// Apply a partial update to the license holding `license_key`.
    ///
    /// Returns `Ok(None)` if no license matches. Only fields present in
    /// `update` are written; `Some(None)` clears a column.
    pub async fn update(
        &self,
        license_key: &str,
        update: LicenseUpdate,
    ) -> LicenseResult<Option<License>> {
        let old_hash = self.codec.hash(license_key);
        let Some(existing) = self.db.find_license(&self.by_hash(&old_hash)).await? else {
            return Ok(None);
        };
        if update.is_empty() {
            return Ok(Some(existing));
        }

        let mut changes = Changes::new();

        if let Some(new_key) = &update.license_key {
            validate_license_key(new_key)?;
            let new_hash = self.codec.hash(new_key);
            if new_hash != old_hash {
                if let Some(other) = self.db.find_license(&self.by_hash(&new_hash)).await? {
                    if other.id != existing.id {
                        return Err(LicenseError::DuplicateLicenseError);
                    }
                }
                changes.push(LicenseColumn::LicenseKey, self.codec.encrypt(new_key)?);
                changes.push(LicenseColumn::Hash, new_hash);
            }
        }
        if let Some(status) = update.status {
            changes.push(LicenseColumn::Status, status.ordinal());
        }
        if let Some(order_id) = update.order_id {
            changes.push(LicenseColumn::OrderId, order_id);
        }
        if let Some(product_id) = update.product_id {
            changes.push(LicenseColumn::ProductId, product_id);
        }
        if let Some(expires_at) = &update.expires_at {
            let parsed = expires_at.as_deref().map(parse_datetime).transpose()?;
            changes.push(LicenseColumn::ExpiresAt, parsed);
        }
        if let Some(valid_for) = update.valid_for {
            changes.push(LicenseColumn::ValidFor, valid_for.map(i64::from));
        }

        let times_activated = match update.times_activated {
            Some(value) => {
                let value = value.map(i64::from);
                changes.push(LicenseColumn::TimesActivated, value);
                value
            }
            None => existing.times_activated,
        };
        let times_activated_max = match update.times_activated_max {
            Some(value) => {
                let value = value.map(i64::from);
                changes.push(LicenseColumn::TimesActivatedMax, value);
                value
            }
            None => existing.times_activated_max,
        };
        check_ceiling(times_activated, times_activated_max)?;

        // Addressed by the old hash: the row does not carry the new one yet.
        self.db
            .update_licenses(&self.by_hash(&old_hash), changes, self.actor)
            .await?;

        let license = self.fetch_back(existing.id).await?;
        log_license_event(LicenseEvent::Updated, license.id, None);
        Ok(Some(license))
    }

    /// Delete the license holding `license_key`. Returns `false` if none does.
    ///
    /// Metadata rows are left in place; see `MetaOverlay::delete_all_meta`.
    pub async fn delete(&self, license_key: &str) -> LicenseResult<bool> {
        let Some(existing) = self.find_by_key(license_key).await? else {
            return Ok(false);
        };
        let rows = self
            .db
            .delete_licenses(&self.by_hash(&existing.key_hash))
            .await?;
        if rows > 0 {
            log_license_event(LicenseEvent::Deleted, existing.id, None);
        }
        Ok(rows > 0)
    }

    /// Write `next` as the activation counter only if it still holds the value
    /// `license` was read with.
    async fn swap_counter(&self, license: &License, next: i64) -> LicenseResult<bool> {
        let query = self
            .by_hash(&license.key_hash)
            .eq(LicenseColumn::TimesActivated, license.times_activated);
        let changes = Changes::new().set(LicenseColumn::TimesActivated, next);
        let rows = self.db.update_licenses(&query, changes, self.actor).await?;
        Ok(rows == 1)
    }

    /// Record one activation.
    ///
    /// Fails with `ActivationCeilingExceededError` once the ceiling is reached.
    pub async fn activate(&self, license_key: &str) -> LicenseResult<License> {
        let read = self.require(license_key).await?;
        self.step_counter(license_key, CounterStep::Up, read).await
    }

    /// Give back one activation.
    ///
    /// Fails with `NotActivatedError` when the counter is unset or zero.
    pub async fn deactivate(&self, license_key: &str) -> LicenseResult<License> {
        let read = self.require(license_key).await?;
        self.step_counter(license_key, CounterStep::Down, read).await
    }

    /// Move the activation counter one step from the value in `read`.
    ///
    /// If the stored counter no longer matches `read`, the license is read
    /// again and re-checked, up to `max_write_attempts` writes in total.
    async fn step_counter(
        &self,
        license_key: &str,
        step: CounterStep,
        mut read: License,
    ) -> LicenseResult<License> {
        for attempt in 1..=self.max_write_attempts {
            let next = match step.next(&read) {
                Ok(next) => next,
                Err(e) => {
                    log_license_event(
                        LicenseEvent::ActivationRefused,
                        read.id,
                        Some(&e.to_string()),
                    );
                    return Err(e);
                }
            };

            if self.swap_counter(&read, next).await? {
                let license = self.fetch_back(read.id).await?;
                log_license_event(
                    step.event(),
                    license.id,
                    Some(&format!("times_activated={}", license.activation_count())),
                );
                return Ok(license);
            }

            debug!(attempt, license_id = read.id, "Activation counter moved, retrying");
            if attempt < self.max_write_attempts {
                read = self.require(license_key).await?;
            }
        }

        warn!(
            license_id = read.id,
            "Giving up on counter write after {} attempts", self.max_write_attempts
        );
        Err(LicenseError::ConflictError(format!(
            "activation counter changed concurrently {} times",
            self.max_write_attempts
        )))
    }

    /// Generate `count` keys from `rule_set` and store each as a
    /// generator-sourced license.
    ///
    /// `valid_for` and `times_activated_max` default to the rule set's
    /// `expires_in` and `times_activated_max`.
    pub async fn issue_from_generator<R: Rng + ?Sized>(
        &self,
        generator: &KeyGenerator,
        rule_set: &RuleSet,
        count: u32,
        options: IssueOptions,
        rng: &mut R,
    ) -> LicenseResult<Vec<License>> {
        let keys = generator.generate(rule_set, count, rng).await?;

        let mut licenses = Vec::with_capacity(keys.len());
        for key in &keys {
            let draft = options.draft(key, LicenseSource::Generator, Some(rule_set));
            let license = self.insert(&draft).await?;
            log_license_event(LicenseEvent::Generated, license.id, Some(&rule_set.name));
            licenses.push(license);
        }
        Ok(licenses)
    }

    /// Store plaintext keys supplied by a vendor as import-sourced licenses.
    ///
    /// Keys that are blank, malformed or already taken (in the store or
    /// earlier in the batch) are counted as failed and skipped. Store errors
    /// abort the import.
    pub async fn import_keys(
        &self,
        keys: &[String],
        options: IssueOptions,
    ) -> LicenseResult<ImportReport> {
        let mut report = ImportReport::default();

        for key in keys {
            let draft = options.draft(key.trim(), LicenseSource::Import, None);
            match self.insert(&draft).await {
                Ok(license) => {
                    log_license_event(LicenseEvent::Imported, license.id, None);
                    report.added += 1;
                    report.ids.push(license.id);
                }
                Err(e @ LicenseError::ValidationError { .. }) => {
                    log_license_event(LicenseEvent::ImportRejected, 0, Some(&e.to_string()));
                    report.failed += 1;
                }
                Err(e) if e.is_business_rule() => {
                    log_license_event(LicenseEvent::ImportRejected, 0, Some(&e.to_string()));
                    report.failed += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "sqlite")]
    async fn sqlite_service() -> LicenseService {
        use sqlx::sqlite::SqlitePoolOptions;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let db = Database::SQLite(pool);
        db.migrate().await.unwrap();
        let codec = KeyCodec::new([3u8; 32], b"lifecycle-tests").unwrap();
        LicenseService::new(Arc::new(db), Arc::new(codec))
    }

    /// Set the stored counter behind the service's back.
    #[cfg(feature = "sqlite")]
    async fn set_counter(service: &LicenseService, license: &License, value: i64) {
        let changes = Changes::new().set(LicenseColumn::TimesActivated, value);
        let rows = service
            .db
            .update_licenses(&service.by_hash(&license.key_hash), changes, None)
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn counter_steps() {
        let codec = KeyCodec::new([1u8; 32], b"s").unwrap();
        let mut license = License {
            id: 1,
            order_id: None,
            product_id: None,
            key_encrypted: codec.encrypt("K").unwrap(),
            key_hash: codec.hash("K"),
            expires_at: None,
            valid_for: None,
            source: LicenseSource::Api,
            status: LicenseStatus::Active,
            times_activated: None,
            times_activated_max: Some(1),
            created_at: now(),
            created_by: None,
            updated_at: None,
            updated_by: None,
        };

        assert_eq!(CounterStep::Up.next(&license).unwrap(), 1);
        assert!(matches!(
            CounterStep::Down.next(&license),
            Err(LicenseError::NotActivatedError)
        ));

        license.times_activated = Some(1);
        assert!(matches!(
            CounterStep::Up.next(&license),
            Err(LicenseError::ActivationCeilingExceededError { .. })
        ));
        assert_eq!(CounterStep::Down.next(&license).unwrap(), 0);
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn stale_counter_write_is_rejected() {
        let service = sqlite_service().await;
        let read = service
            .create(LicenseDraft::new("CAS-1", LicenseStatus::Active))
            .await
            .unwrap();

        set_counter(&service, &read, 4).await;

        // Written against an unset counter that is now 4
        assert!(!service.swap_counter(&read, 1).await.unwrap());
        let stored = service.find_by_key("CAS-1").await.unwrap().unwrap();
        assert_eq!(stored.times_activated, Some(4));
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn activation_retries_after_counter_moves() {
        let service = sqlite_service().await;
        let read = service
            .create(LicenseDraft::new("CAS-2", LicenseStatus::Active).times_activated(1))
            .await
            .unwrap();

        set_counter(&service, &read, 2).await;

        let license = service
            .step_counter("CAS-2", CounterStep::Up, read)
            .await
            .unwrap();
        assert_eq!(license.times_activated, Some(3), "re-read value plus one");
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn retry_revalidates_against_ceiling() {
        let service = sqlite_service().await;
        let read = service
            .create(
                LicenseDraft::new("CAS-3", LicenseStatus::Active)
                    .times_activated(1)
                    .times_activated_max(2),
            )
            .await
            .unwrap();

        // Another writer spends the last slot
        set_counter(&service, &read, 2).await;

        let result = service.step_counter("CAS-3", CounterStep::Up, read).await;
        assert!(matches!(
            result,
            Err(LicenseError::ActivationCeilingExceededError {
                times_activated: 2,
                times_activated_max: 2
            })
        ));
        let stored = service.find_by_key("CAS-3").await.unwrap().unwrap();
        assert_eq!(stored.times_activated, Some(2));
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn lost_writes_end_in_conflict() {
        let service = sqlite_service().await.with_max_write_attempts(1);
        let read = service
            .create(LicenseDraft::new("CAS-4", LicenseStatus::Active).times_activated(3))
            .await
            .unwrap();

        set_counter(&service, &read, 5).await;

        let result = service.step_counter("CAS-4", CounterStep::Down, read).await;
        assert!(matches!(result, Err(LicenseError::ConflictError(_))));
        let stored = service.find_by_key("CAS-4").await.unwrap().unwrap();
        assert_eq!(stored.times_activated, Some(5), "nothing written");
    }

    #[test]
    fn ceiling_check() {
        assert!(check_ceiling(None, Some(3)).is_ok());
        assert!(check_ceiling(Some(3), None).is_ok());
        assert!(check_ceiling(Some(3), Some(3)).is_ok());
        assert!(matches!(
            check_ceiling(Some(5), Some(3)),
            Err(LicenseError::ActivationCeilingExceededError {
                times_activated: 5,
                times_activated_max: 3
            })
        ));
    }

    #[test]
    fn issue_options_fall_back_to_rule_set() {
        let rules = RuleSet::new("r", "AB", 1, 4)
            .expires_in(30)
            .times_activated_max(2);

        let draft = IssueOptions::new(LicenseStatus::Sold).draft(
            "AAAA",
            LicenseSource::Generator,
            Some(&rules),
        );
        assert_eq!(draft.valid_for, Some(30));
        assert_eq!(draft.times_activated_max, Some(2));
        assert_eq!(draft.source, LicenseSource::Generator);

        let draft = IssueOptions::new(LicenseStatus::Sold)
            .valid_for(None)
            .times_activated_max(Some(9))
            .draft("AAAA", LicenseSource::Generator, Some(&rules));
        assert_eq!(draft.valid_for, None);
        assert_eq!(draft.times_activated_max, Some(9));
    }

    #[test]
    fn import_draft_has_no_rule_defaults() {
        let draft = IssueOptions::new(LicenseStatus::Delivered)
            .order_id(12)
            .draft("KEY", LicenseSource::Import, None);
        assert_eq!(draft.order_id, Some(12));
        assert_eq!(draft.status, LicenseStatus::Delivered);
        assert_eq!(draft.valid_for, None);
    }
}
