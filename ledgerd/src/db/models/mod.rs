//! Database record models matching table schemas.
//!
//! This module contains struct definitions that directly correspond to database
//! table rows. These models are used by repositories to return query results
//! and accept insertion/update data.
//!
//! # Design Principles
//!
//! - **Schema Mapping**: Each model struct matches a database table schema
//! - **Separation**: Database models are distinct from API models to allow
//!   independent evolution of storage and API representations
//! - **Type Safety**: UUID type aliases from [`crate::types`] for IDs
//!
//! # Model Categories
//!
//! - [`users`]: User accounts, roles, and profiles
//! - [`ledger`]: Append-only credit ledger entries and idempotency keys
//! - [`plans`]: Subscription plan rows mirroring the billing provider
//! - [`referrals`]: Single-use promotional referral codes
//! - [`jobs`]: Staging job lifecycle and credit cost
//! - [`billing_events`]: Inbound webhook event dedup records
//!
//! # Conversion to API Models
//!
//! Database models implement `From` conversions to API models where the
//! entity is exposed over HTTP:
//!
//! ```ignore
//! let api_entry = EntryResponse::from(db_entry);
//! ```

pub mod billing_events;
pub mod jobs;
pub mod ledger;
pub mod plans;
pub mod referrals;
pub mod users;
