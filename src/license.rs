//! License records, their status/source enums, and the input types used to
//! create and patch them.
//!
//! A stored [`License`] never carries its plaintext key: `key_encrypted` can be
//! decrypted for redisplay and `key_hash` is the only value ever queried.

use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDateTime, TimeDelta};
use serde::{Deserialize, Deserializer, Serialize};
use sqlx::FromRow;

use crate::errors::LicenseError;

/// Commercial state of a license.
///
/// The storefront assigns these freely; no transition graph is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", try_from = "String")]
pub enum LicenseStatus {
    Sold = 1,
    Delivered = 2,
    Active = 3,
    Inactive = 4,
    Used = 5,
}

impl LicenseStatus {
    pub const ALL: [LicenseStatus; 5] = [
        LicenseStatus::Sold,
        LicenseStatus::Delivered,
        LicenseStatus::Active,
        LicenseStatus::Inactive,
        LicenseStatus::Used,
    ];

    /// Stored ordinal (1-5).
    pub fn ordinal(self) -> i64 {
        self as i64
    }

    /// Human readable label.
    pub fn label(self) -> &'static str {
        match self {
            LicenseStatus::Sold => "Sold",
            LicenseStatus::Delivered => "Delivered",
            LicenseStatus::Active => "Active",
            LicenseStatus::Inactive => "Inactive",
            LicenseStatus::Used => "Used",
        }
    }

    /// Label for a raw stored ordinal; anything outside 1-5 is "Unknown".
    pub fn label_for(ordinal: i64) -> &'static str {
        LicenseStatus::try_from(ordinal)
            .map(LicenseStatus::label)
            .unwrap_or("Unknown")
    }
}

impl TryFrom<i64> for LicenseStatus {
    type Error = LicenseError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        LicenseStatus::ALL
            .into_iter()
            .find(|s| s.ordinal() == value)
            .ok_or_else(|| LicenseError::InvalidStatusError(value.to_string()))
    }
}

impl FromStr for LicenseStatus {
    type Err = LicenseError;

    /// Accepts a label in any case (`"active"`, `"ACTIVE"`) or an ordinal (`"3"`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(ordinal) = trimmed.parse::<i64>() {
            return LicenseStatus::try_from(ordinal);
        }
        LicenseStatus::ALL
            .into_iter()
            .find(|status| status.label().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| LicenseError::InvalidStatusError(s.to_string()))
    }
}

impl TryFrom<String> for LicenseStatus {
    type Error = LicenseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for LicenseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How a license entered the system. Set once, never changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LicenseSource {
    Generator = 1,
    Import = 2,
    Api = 3,
}

impl LicenseSource {
    pub fn ordinal(self) -> i64 {
        self as i64
    }
}

impl TryFrom<i64> for LicenseSource {
    type Error = LicenseError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(LicenseSource::Generator),
            2 => Ok(LicenseSource::Import),
            3 => Ok(LicenseSource::Api),
            other => Err(LicenseError::ValidationError {
                field: "source".to_string(),
                message: format!("unknown license source {other}"),
            }),
        }
    }
}

/// A license row as persisted in the `licenses` table.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct License {
    pub id: i64,
    pub order_id: Option<i64>,
    pub product_id: Option<i64>,
    /// Base64 AES-GCM ciphertext of the plaintext key
    #[sqlx(rename = "license_key")]
    pub key_encrypted: String,
    /// HMAC digest of the plaintext key; unique
    #[sqlx(rename = "hash")]
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub expires_at: Option<NaiveDateTime>,
    pub valid_for: Option<i64>,
    #[sqlx(try_from = "i64")]
    pub source: LicenseSource,
    #[sqlx(try_from = "i64")]
    pub status: LicenseStatus,
    pub times_activated: Option<i64>,
    pub times_activated_max: Option<i64>,
    pub created_at: NaiveDateTime,
    pub created_by: Option<i64>,
    pub updated_at: Option<NaiveDateTime>,
    pub updated_by: Option<i64>,
}

impl License {
    /// Activation counter with unset treated as zero.
    pub fn activation_count(&self) -> i64 {
        self.times_activated.unwrap_or(0)
    }

    /// Activations left before the ceiling; `None` means unlimited.
    pub fn remaining_activations(&self) -> Option<i64> {
        self.times_activated_max
            .map(|max| (max - self.activation_count()).max(0))
    }

    pub fn is_expired(&self, now: NaiveDateTime) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

/// Storage-ready license values, produced by the lifecycle service after
/// validation, encryption and hashing.
#[derive(Debug, Clone)]
pub struct NewLicense {
    pub order_id: Option<i64>,
    pub product_id: Option<i64>,
    pub key_encrypted: String,
    pub key_hash: String,
    pub expires_at: Option<NaiveDateTime>,
    pub valid_for: Option<i64>,
    pub source: LicenseSource,
    pub status: LicenseStatus,
    pub times_activated: Option<i64>,
    pub times_activated_max: Option<i64>,
}

/// Input for creating a license from a plaintext key.
#[derive(Debug, Clone, Deserialize)]
pub struct LicenseDraft {
    pub license_key: String,
    pub status: LicenseStatus,
    #[serde(default = "default_source")]
    pub source: LicenseSource,
    #[serde(default)]
    pub order_id: Option<i64>,
    #[serde(default)]
    pub product_id: Option<i64>,
    /// Absolute expiry; must parse as a date-time
    #[serde(default)]
    pub expires_at: Option<String>,
    /// Days until expiry, applied at issuance when `expires_at` is absent
    #[serde(default)]
    pub valid_for: Option<u32>,
    #[serde(default)]
    pub times_activated: Option<u32>,
    #[serde(default)]
    pub times_activated_max: Option<u32>,
}

fn default_source() -> LicenseSource {
    LicenseSource::Api
}

impl LicenseDraft {
    pub fn new(license_key: impl Into<String>, status: LicenseStatus) -> Self {
        Self {
            license_key: license_key.into(),
            status,
            source: LicenseSource::Api,
            order_id: None,
            product_id: None,
            expires_at: None,
            valid_for: None,
            times_activated: None,
            times_activated_max: None,
        }
    }

    pub fn source(mut self, source: LicenseSource) -> Self {
        self.source = source;
        self
    }

    pub fn order_id(mut self, order_id: i64) -> Self {
        self.order_id = Some(order_id);
        self
    }

    pub fn product_id(mut self, product_id: i64) -> Self {
        self.product_id = Some(product_id);
        self
    }

    pub fn expires_at(mut self, expires_at: impl Into<String>) -> Self {
        self.expires_at = Some(expires_at.into());
        self
    }

    pub fn valid_for(mut self, days: u32) -> Self {
        self.valid_for = Some(days);
        self
    }

    pub fn times_activated(mut self, count: u32) -> Self {
        self.times_activated = Some(count);
        self
    }

    pub fn times_activated_max(mut self, max: u32) -> Self {
        self.times_activated_max = Some(max);
        self
    }

    /// Resolve the expiry to persist: an explicit `expires_at` wins, otherwise
    /// `valid_for` days from `now`.
    ///
    /// Fails with `InvalidDateError` if the computed date is out of range.
    pub(crate) fn resolve_expiry(
        explicit: Option<NaiveDateTime>,
        valid_for: Option<u32>,
        now: NaiveDateTime,
    ) -> Result<Option<NaiveDateTime>, LicenseError> {
        if explicit.is_some() {
            return Ok(explicit);
        }
        let Some(days) = valid_for else {
            return Ok(None);
        };
        TimeDelta::try_days(i64::from(days))
            .and_then(|delta| now.checked_add_signed(delta))
            .map(Some)
            .ok_or_else(|| {
                LicenseError::InvalidDateError(format!(
                    "valid_for of {days} days is past the latest representable date"
                ))
            })
    }
}

/// Partial update of a license.
///
/// For nullable fields the outer `Option` is presence and the inner one the
/// value: `None` leaves the column untouched, `Some(None)` clears it.
/// Deserializing keeps that distinction (`{"order_id": null}` clears).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct LicenseUpdate {
    #[serde(alias = "licenseKey")]
    pub license_key: Option<String>,
    pub status: Option<LicenseStatus>,
    #[serde(deserialize_with = "deserialize_some")]
    pub order_id: Option<Option<i64>>,
    #[serde(deserialize_with = "deserialize_some")]
    pub product_id: Option<Option<i64>>,
    #[serde(deserialize_with = "deserialize_some")]
    pub expires_at: Option<Option<String>>,
    #[serde(deserialize_with = "deserialize_some")]
    pub valid_for: Option<Option<u32>>,
    #[serde(deserialize_with = "deserialize_some")]
    pub times_activated: Option<Option<u32>>,
    #[serde(deserialize_with = "deserialize_some")]
    pub times_activated_max: Option<Option<u32>>,
}

/// Maps a present field (including `null`) to `Some`, so absence stays `None`.
fn deserialize_some<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl LicenseUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn license_key(mut self, key: impl Into<String>) -> Self {
        self.license_key = Some(key.into());
        self
    }

    pub fn status(mut self, status: LicenseStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn order_id(mut self, order_id: Option<i64>) -> Self {
        self.order_id = Some(order_id);
        self
    }

    pub fn product_id(mut self, product_id: Option<i64>) -> Self {
        self.product_id = Some(product_id);
        self
    }

    pub fn expires_at(mut self, expires_at: Option<String>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn valid_for(mut self, days: Option<u32>) -> Self {
        self.valid_for = Some(days);
        self
    }

    pub fn times_activated(mut self, count: Option<u32>) -> Self {
        self.times_activated = Some(count);
        self
    }

    pub fn times_activated_max(mut self, max: Option<u32>) -> Self {
        self.times_activated_max = Some(max);
        self
    }
}
