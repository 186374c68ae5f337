//! Table definitions applied by [`Database::migrate`](super::Database::migrate).
//!
//! Plaintext keys are never stored: `license_key` holds ciphertext and `hash`
//! the lookup digest. `status` and `source` are stored as ordinals.

#[cfg(feature = "sqlite")]
pub const SQLITE_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS licenses (
        id                  INTEGER PRIMARY KEY AUTOINCREMENT,
        order_id            INTEGER,
        product_id          INTEGER,
        license_key         TEXT NOT NULL,
        hash                TEXT NOT NULL,
        expires_at          TEXT,
        valid_for           INTEGER,
        source              INTEGER NOT NULL,
        status              INTEGER NOT NULL,
        times_activated     INTEGER,
        times_activated_max INTEGER,
        created_at          TEXT NOT NULL,
        created_by          INTEGER,
        updated_at          TEXT,
        updated_by          INTEGER
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS licenses_hash_idx ON licenses (hash)",
    r#"
    CREATE TABLE IF NOT EXISTS generators (
        id                  INTEGER PRIMARY KEY AUTOINCREMENT,
        name                TEXT NOT NULL,
        charset             TEXT NOT NULL,
        chunks              INTEGER NOT NULL,
        chunk_length        INTEGER NOT NULL,
        separator           TEXT,
        prefix              TEXT,
        suffix              TEXT,
        expires_in          INTEGER,
        times_activated_max INTEGER,
        created_at          TEXT NOT NULL,
        created_by          INTEGER,
        updated_at          TEXT,
        updated_by          INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS license_meta (
        meta_id     INTEGER PRIMARY KEY AUTOINCREMENT,
        license_id  INTEGER NOT NULL,
        meta_key    TEXT NOT NULL,
        meta_value  TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS license_meta_license_idx ON license_meta (license_id, meta_key)",
];

#[cfg(feature = "postgres")]
pub const POSTGRES_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS licenses (
        id                  BIGSERIAL PRIMARY KEY,
        order_id            BIGINT,
        product_id          BIGINT,
        license_key         TEXT NOT NULL,
        hash                TEXT NOT NULL,
        expires_at          TIMESTAMP,
        valid_for           BIGINT,
        source              BIGINT NOT NULL,
        status              BIGINT NOT NULL,
        times_activated     BIGINT,
        times_activated_max BIGINT,
        created_at          TIMESTAMP NOT NULL,
        created_by          BIGINT,
        updated_at          TIMESTAMP,
        updated_by          BIGINT
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS licenses_hash_idx ON licenses (hash)",
    r#"
    CREATE TABLE IF NOT EXISTS generators (
        id                  BIGSERIAL PRIMARY KEY,
        name                TEXT NOT NULL,
        charset             TEXT NOT NULL,
        chunks              BIGINT NOT NULL,
        chunk_length        BIGINT NOT NULL,
        separator           TEXT,
        prefix              TEXT,
        suffix              TEXT,
        expires_in          BIGINT,
        times_activated_max BIGINT,
        created_at          TIMESTAMP NOT NULL,
        created_by          BIGINT,
        updated_at          TIMESTAMP,
        updated_by          BIGINT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS license_meta (
        meta_id     BIGSERIAL PRIMARY KEY,
        license_id  BIGINT NOT NULL,
        meta_key    TEXT NOT NULL,
        meta_value  TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS license_meta_license_idx ON license_meta (license_id, meta_key)",
];
