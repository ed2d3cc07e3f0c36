//! API request and response data models.
//!
//! This module contains the data structures used for HTTP request deserialization
//! and response serialization. These models define the public API contract.
//!
//! # Design Principles
//!
//! - **Separation of Concerns**: API models are distinct from database models,
//!   allowing independent evolution of API and storage representations
//! - **Validation**: Models use serde for deserialization and validation
//! - **OpenAPI**: All models are annotated with `utoipa` for automatic API docs
//! - **Type Safety**: Strong typing with newtype wrappers for IDs
//!
//! # Model Categories
//!
//! ## Resource Models
//!
//! - [`users`]: User profiles, roles, and creation/update requests
//! - [`credits`]: Balance and ledger entry views, admin adjustments
//! - [`billing`]: Checkout, portal, and plan payloads
//! - [`referrals`]: Marketing code creation and redemption
//! - [`jobs`]: Staging job creation, listing, and transitions
//!
//! ## Authentication Models
//!
//! - [`auth`]: Login, registration, and password management payloads
//!
//! # Example
//!
//! ```ignore
//! use ledgerd::api::models::users::{UserCreate, UserResponse};
//!
//! // Deserialize from JSON
//! let create_req: UserCreate = serde_json::from_str(json_str)?;
//!
//! // Serialize to JSON
//! let response = UserResponse { /* ... */ };
//! let json = serde_json::to_string(&response)?;
//! ```

pub mod auth;
pub mod billing;
pub mod credits;
pub mod jobs;
pub mod pagination;
pub mod referrals;
pub mod users;
