//! License key generation from declarative rule sets.
//!
//! A [`RuleSet`] describes the shape of a key: which characters may appear,
//! how many chunks of what length, the separator between chunks and an
//! optional prefix/suffix. Keys are built by sampling uniformly (with
//! replacement) from the charset:
//!
//! ```text
//! prefix + CHUNK + separator + CHUNK + ... + CHUNK + suffix
//! ```
//!
//! Prefix and suffix are glued on as-is; if a separator is wanted between
//! them and the body it has to be part of the prefix/suffix string.
//!
//! # Example
//!
//! ```rust
//! use keyward::license_key::{synthesize_key, RuleSet};
//! use rand::{rngs::StdRng, SeedableRng};
//!
//! let rules = RuleSet::new("default", "ABCDEFGH0123456789", 4, 4).separator("-");
//! let mut rng = StdRng::seed_from_u64(7);
//! let key = synthesize_key(&rules, &mut rng).unwrap();
//! assert_eq!(key.chars().count(), 19);
//! assert!(rules.matches(&key).unwrap());
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDateTime;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::{debug, info, warn};

use crate::config::GeneratorConfig;
use crate::encryption::KeyCodec;
use crate::errors::{LicenseError, LicenseResult};
use crate::store::Database;
use crate::validation::{validate_not_empty, MAX_LICENSE_KEY_LENGTH};

/// Declarative recipe for license keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    pub name: String,
    /// Permissible characters; order and duplicates are irrelevant
    pub charset: String,
    /// Number of chunks in the body
    pub chunks: u32,
    /// Characters per chunk
    pub chunk_length: u32,
    /// Placed between chunks; empty means none
    #[serde(default)]
    pub separator: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
    /// Propagated to issued licenses as `valid_for` (days)
    #[serde(default)]
    pub expires_in: Option<u32>,
    /// Propagated to issued licenses
    #[serde(default)]
    pub times_activated_max: Option<u32>,
}

impl RuleSet {
    pub fn new(
        name: impl Into<String>,
        charset: impl Into<String>,
        chunks: u32,
        chunk_length: u32,
    ) -> Self {
        Self {
            name: name.into(),
            charset: charset.into(),
            chunks,
            chunk_length,
            separator: String::new(),
            prefix: String::new(),
            suffix: String::new(),
            expires_in: None,
            times_activated_max: None,
        }
    }

    pub fn separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn expires_in(mut self, days: u32) -> Self {
        self.expires_in = Some(days);
        self
    }

    pub fn times_activated_max(mut self, max: u32) -> Self {
        self.times_activated_max = Some(max);
        self
    }

    /// Check the rule set can produce keys at all.
    pub fn validate(&self) -> LicenseResult<()> {
        validate_not_empty(&self.name, "name")?;
        if self.charset.is_empty() {
            return Err(LicenseError::InvalidRuleSetError(
                "charset cannot be empty".to_string(),
            ));
        }
        if self.chunks == 0 {
            return Err(LicenseError::InvalidRuleSetError(
                "chunks must be greater than 0".to_string(),
            ));
        }
        if self.chunk_length == 0 {
            return Err(LicenseError::InvalidRuleSetError(
                "chunk_length must be greater than 0".to_string(),
            ));
        }
        let key_length = self.key_length();
        if key_length > MAX_LICENSE_KEY_LENGTH {
            return Err(LicenseError::InvalidRuleSetError(format!(
                "keys would be {key_length} characters, longer than {MAX_LICENSE_KEY_LENGTH}"
            )));
        }
        Ok(())
    }

    /// Distinct charset characters in first-seen order.
    pub fn alphabet(&self) -> Vec<char> {
        let mut seen = HashSet::new();
        self.charset.chars().filter(|c| seen.insert(*c)).collect()
    }

    /// Length in characters of every key this rule set produces.
    pub fn key_length(&self) -> usize {
        let chunks = self.chunks as usize;
        chunks
            .saturating_mul(self.chunk_length as usize)
            .saturating_add(chunks.saturating_sub(1).saturating_mul(self.separator.chars().count()))
            .saturating_add(self.prefix.chars().count())
            .saturating_add(self.suffix.chars().count())
    }

    /// Number of distinct keys, saturating at `u128::MAX`.
    pub fn keyspace_size(&self) -> u128 {
        let symbols = self.alphabet().len() as u128;
        let positions = self.chunks.saturating_mul(self.chunk_length);
        symbols.checked_pow(positions).unwrap_or(u128::MAX)
    }

    /// Regex matching exactly the keys this rule set can produce.
    pub fn pattern(&self) -> LicenseResult<Regex> {
        self.validate()?;

        let class: String = self
            .alphabet()
            .iter()
            .map(|c| regex::escape(&c.to_string()))
            .collect();
        let chunk = format!("[{class}]{{{}}}", self.chunk_length);
        let separator = regex::escape(&self.separator);

        let mut pattern = format!("^{}{chunk}", regex::escape(&self.prefix));
        if self.chunks > 1 {
            pattern.push_str(&format!("(?:{separator}{chunk}){{{}}}", self.chunks - 1));
        }
        pattern.push_str(&regex::escape(&self.suffix));
        pattern.push('$');

        Regex::new(&pattern)
            .map_err(|e| LicenseError::InvalidRuleSetError(format!("unusable rule set: {e}")))
    }

    /// Whether `key` has the shape this rule set produces.
    pub fn matches(&self, key: &str) -> LicenseResult<bool> {
        Ok(self.pattern()?.is_match(key))
    }
}

/// A rule set persisted in the `generators` table.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Generator {
    pub id: i64,
    pub name: String,
    pub charset: String,
    pub chunks: i64,
    pub chunk_length: i64,
    pub separator: Option<String>,
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    pub expires_in: Option<i64>,
    pub times_activated_max: Option<i64>,
    pub created_at: NaiveDateTime,
    pub created_by: Option<i64>,
    pub updated_at: Option<NaiveDateTime>,
    pub updated_by: Option<i64>,
}

fn to_u32(value: i64, field: &str) -> LicenseResult<u32> {
    u32::try_from(value)
        .map_err(|_| LicenseError::InvalidRuleSetError(format!("{field} out of range: {value}")))
}

impl Generator {
    /// The stored rule set, validated.
    pub fn rule_set(&self) -> LicenseResult<RuleSet> {
        let rule_set = RuleSet {
            name: self.name.clone(),
            charset: self.charset.clone(),
            chunks: to_u32(self.chunks, "chunks")?,
            chunk_length: to_u32(self.chunk_length, "chunk_length")?,
            separator: self.separator.clone().unwrap_or_default(),
            prefix: self.prefix.clone().unwrap_or_default(),
            suffix: self.suffix.clone().unwrap_or_default(),
            expires_in: self
                .expires_in
                .map(|v| to_u32(v, "expires_in"))
                .transpose()?,
            times_activated_max: self
                .times_activated_max
                .map(|v| to_u32(v, "times_activated_max"))
                .transpose()?,
        };
        rule_set.validate()?;
        Ok(rule_set)
    }
}

/// Build one key from a rule set. Does not check uniqueness.
pub fn synthesize_key<R: Rng + ?Sized>(rule_set: &RuleSet, rng: &mut R) -> LicenseResult<String> {
    rule_set.validate()?;
    let alphabet = rule_set.alphabet();
    Ok(build_key(rule_set, &alphabet, rng))
}

fn build_key<R: Rng + ?Sized>(rule_set: &RuleSet, alphabet: &[char], rng: &mut R) -> String {
    let mut key = String::with_capacity(rule_set.key_length());
    key.push_str(&rule_set.prefix);
    for chunk in 0..rule_set.chunks {
        if chunk > 0 {
            key.push_str(&rule_set.separator);
        }
        for _ in 0..rule_set.chunk_length {
            key.push(alphabet[rng.random_range(0..alphabet.len())]);
        }
    }
    key.push_str(&rule_set.suffix);
    key
}

/// Produces batches of keys that are unique within the batch and unused in
/// the license store.
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    db: Arc<Database>,
    codec: Arc<KeyCodec>,
    max_retries: u32,
    max_batch: u32,
}

impl KeyGenerator {
    pub fn new(db: Arc<Database>, codec: Arc<KeyCodec>) -> Self {
        Self::from_config(db, codec, &GeneratorConfig::default())
    }

    pub fn from_config(db: Arc<Database>, codec: Arc<KeyCodec>, config: &GeneratorConfig) -> Self {
        Self {
            db,
            codec,
            max_retries: config.max_retries.max(1),
            max_batch: config.max_batch,
        }
    }

    /// Re-rolls allowed per key before giving up.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Generate `count` plaintext keys.
    ///
    /// Every candidate is checked against the batch so far and against the
    /// store (by digest). A colliding candidate is re-rolled up to
    /// `max_retries` times; past that the call fails with
    /// `ExhaustedKeyspaceError`. A `count` of zero returns an empty batch.
    pub async fn generate<R: Rng + ?Sized>(
        &self,
        rule_set: &RuleSet,
        count: u32,
        rng: &mut R,
    ) -> LicenseResult<Vec<String>> {
        rule_set.validate()?;

        if count == 0 {
            return Ok(Vec::new());
        }
        if count > self.max_batch {
            return Err(LicenseError::ValidationError {
                field: "count".to_string(),
                message: format!("must not exceed {}", self.max_batch),
            });
        }
        if u128::from(count) > rule_set.keyspace_size() {
            warn!(
                generator = %rule_set.name,
                count,
                "Requested more keys than the rule set can produce"
            );
            return Err(LicenseError::ExhaustedKeyspaceError { attempts: 0 });
        }

        let alphabet = rule_set.alphabet();
        let mut batch: HashSet<String> = HashSet::with_capacity(count as usize);
        let mut keys = Vec::with_capacity(count as usize);

        while keys.len() < count as usize {
            let key = self.next_unique(rule_set, &alphabet, &batch, rng).await?;
            batch.insert(key.clone());
            keys.push(key);
        }

        info!(generator = %rule_set.name, count, "Generated license keys");
        Ok(keys)
    }

    async fn next_unique<R: Rng + ?Sized>(
        &self,
        rule_set: &RuleSet,
        alphabet: &[char],
        batch: &HashSet<String>,
        rng: &mut R,
    ) -> LicenseResult<String> {
        for attempt in 1..=self.max_retries {
            let candidate = build_key(rule_set, alphabet, rng);
            if batch.contains(&candidate) {
                debug!(attempt, "Candidate repeats a key in this batch, re-rolling");
                continue;
            }
            if self
                .db
                .license_hash_exists(&self.codec.hash(&candidate))
                .await?
            {
                debug!(attempt, "Candidate already stored, re-rolling");
                continue;
            }
            return Ok(candidate);
        }

        warn!(
            generator = %rule_set.name,
            attempts = self.max_retries,
            "Could not find an unused license key"
        );
        Err(LicenseError::ExhaustedKeyspaceError {
            attempts: self.max_retries,
        })
    }
}
