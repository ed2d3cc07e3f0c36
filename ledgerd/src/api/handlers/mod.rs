//! HTTP request handlers for all API endpoints.
//!
//! Axum route handlers organized by resource. Each handler validates the
//! request, checks permissions, drives the database repositories (and the
//! ledger), and shapes the response.
//!
//! # Handler Modules
//!
//! - [`auth`]: Registration, login/logout, session introspection, password changes
//! - [`billing`]: Checkout/portal redirects and plan listing
//! - [`credits`]: Balance, entry history, admin grant/removal
//! - [`jobs`]: Staging job creation, listing, and status transitions
//! - [`reconciliation`]: Admin access to the consistency sweep
//! - [`referrals`]: Personal referral info and special-code management
//! - [`users`]: User CRUD and profile management
//! - [`webhooks`]: Signed billing event intake
//!
//! # Authentication
//!
//! Most handlers require an authenticated caller via session cookie or
//! trusted proxy header; [`crate::auth::current_user`] provides the
//! extractor. Permission checks use [`crate::auth::permissions`].
//!
//! # Error Handling
//!
//! Handlers return [`crate::errors::Error`], which converts to the right
//! HTTP status and a JSON error body.

pub mod auth;
pub mod billing;
pub mod credits;
pub mod jobs;
pub mod reconciliation;
pub mod referrals;
pub mod users;
pub mod webhooks;
