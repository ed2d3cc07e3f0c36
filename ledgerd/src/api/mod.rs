//! API layer for HTTP request handling and data models.
//!
//! This module contains the REST API implementation, organized into:
//!
//! - **[`handlers`]**: Axum route handlers for all API endpoints
//! - **[`models`]**: Request/response data structures for API communication
//!
//! # API Structure
//!
//! - **Authentication** (`/auth/*`): Registration, login, session, password management
//! - **Users** (`/api/v1/users/*`): User management, per-user credit surface
//! - **Credits** (`/api/v1/credits/*`, `/api/v1/users/current/credits`): Balances and entry history
//! - **Billing** (`/api/v1/billing/*`): Checkout/portal redirects and plans
//! - **Referrals** (`/api/v1/referrals/*`): Personal referral info and special codes
//! - **Jobs** (`/api/v1/jobs/*`): Staging job lifecycle
//! - **Admin** (`/api/v1/admin/*`): Reconciliation reports and manual sweeps
//! - **Webhooks** (`/webhooks/billing`): Signed billing event intake (no session auth)
//!
//! # OpenAPI Documentation
//!
//! All endpoints carry `utoipa` annotations; the rendered documentation is
//! served at `/docs` and the raw document at `/api-docs/openapi.json`.

pub mod handlers;
pub mod models;
