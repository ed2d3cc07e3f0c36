//! Authentication and authorization system.
//!
//! # Authentication Methods
//!
//! Two methods are supported, tried in order until one succeeds:
//!
//! ## 1. Native sessions
//!
//! Browser-based authentication using secure HTTP-only cookies:
//! - Users register and log in via `/auth/*` with email/password
//! - Passwords hashed with Argon2id ([`password`])
//! - A signed JWT carrying the user's identity and role snapshot is set as
//!   the session cookie ([`session`])
//!
//! ## 2. Trusted proxy headers
//!
//! For deployments behind an authenticating reverse proxy (SSO):
//! - The proxy injects the verified identity as request headers
//! - Unknown users can be provisioned on first sight when enabled
//!
//! # Authorization
//!
//! Access control is role-based. Handlers declare the permission they need
//! through the [`permissions::RequiresPermission`] extractor, which combines
//! authentication and the permission check in one step:
//!
//! ```ignore
//! async fn grant_credits(
//!     State(state): State<AppState>,
//!     _perm: RequiresPermission<resource::Credits, operation::CreateAll>,
//! ) -> Result<Json<EntryResponse>> { ... }
//! ```
//!
//! # Modules
//!
//! - [`current_user`]: Extractor resolving the authenticated user
//! - [`password`]: Password hashing and verification using Argon2
//! - [`permissions`]: Role-based permission checking
//! - [`session`]: JWT session token creation and verification

pub mod current_user;
pub mod password;
pub mod permissions;
pub mod session;
