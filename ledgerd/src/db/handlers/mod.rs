//! Repository implementations for database access.
//!
//! This module provides repository structs for each major entity in the
//! system. Repositories wrap a SQLx connection or transaction, provide
//! strongly-typed operations, and return domain models from
//! [`crate::db::models`]. Full CRUD surfaces implement the [`Repository`]
//! trait; narrower ones (like the append-only [`Ledger`]) expose just the
//! operations that exist.
//!
//! # Available Repositories
//!
//! - [`Users`]: User account management and authentication
//! - [`Ledger`]: Append-only credit entries and balance queries
//! - [`Plans`]: Billing plan rows keyed by provider subscription
//! - [`Referrals`]: Single-use referral code lifecycle
//! - [`Jobs`]: Staging job records and status transitions
//! - [`BillingEvents`]: Webhook delivery dedup log
//!
//! # Common Pattern
//!
//! All repositories follow this usage pattern:
//!
//! ```ignore
//! use ledgerd::db::handlers::{UserFilter, Users, Repository};
//!
//! async fn example(pool: &sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
//!     // Start a transaction
//!     let mut tx = pool.begin().await?;
//!
//!     // Create repository from transaction
//!     let mut repo = Users::new(&mut tx);
//!
//!     // Perform operations
//!     let users = repo.list(&UserFilter::new(0, 50)).await?;
//!
//!     // Commit or rollback
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```
//!
//! Repositories built on the same transaction compose: a handler can claim
//! a referral code and append its grant inside one `tx` so both commit or
//! neither does.

pub mod billing_events;
pub mod jobs;
pub mod ledger;
pub mod plans;
pub mod referrals;
pub mod repository;
pub mod users;

pub use billing_events::BillingEvents;
pub use jobs::{JobFilter, Jobs};
pub use ledger::{EntryFilter, Ledger, LedgerError};
pub use plans::Plans;
pub use referrals::Referrals;
pub use repository::Repository;
pub use users::{UserFilter, Users};
