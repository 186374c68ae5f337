//! Keyward - license key generation and lifecycle management
//!
//! Keys are synthesized from declarative rule sets, stored encrypted for
//! redisplay and addressed only through a keyed digest, and governed by an
//! activation counter that never exceeds its ceiling.
//!
//! # Features
//!
//! - `sqlite` - SQLite database backend. Enabled by default.
//! - `postgres` - PostgreSQL database backend.
//!
//! # Example
//!
//! ```toml
//! # Use defaults (sqlite)
//! keyward = "0.1"
//!
//! # PostgreSQL only
//! keyward = { version = "0.1", default-features = false, features = ["postgres"] }
//! ```

pub mod config;
pub mod encryption;
pub mod errors;
pub mod license;
pub mod license_key;
pub mod lifecycle;
pub mod logging;
pub mod meta;
pub mod store;
pub mod validation;

pub use encryption::KeyCodec;
pub use errors::{LicenseError, LicenseResult};
pub use license::{License, LicenseDraft, LicenseSource, LicenseStatus, LicenseUpdate};
pub use license_key::{synthesize_key, Generator, KeyGenerator, RuleSet};
pub use lifecycle::{ImportReport, IssueOptions, LicenseService};
pub use meta::{LicenseMeta, MetaOverlay};
pub use store::Database;
