//! OpenAPI documentation configuration.
//!
//! One document covers both surfaces: the session endpoints mounted at
//! `/auth/*` and the authenticated API nested under `/api/v1`. The billing
//! webhook is deliberately undocumented here; it is called by the provider,
//! not by clients.

use utoipa::{
    Modify, OpenApi,
    openapi::security::{ApiKey, ApiKeyValue, SecurityScheme},
};

use crate::api;
use crate::db::models::{jobs::JobStatus, ledger::EntryReason, plans::PlanStatus};
use crate::reconciliation::{NegativeBalanceFinding, ReconciliationReport};

/// Security schemes accepted by the authenticated API.
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.security_schemes.insert(
                "CookieAuth".to_string(),
                SecurityScheme::ApiKey(ApiKey::Cookie(ApiKeyValue::with_description(
                    "ledgerd_session",
                    "Session cookie set by login and registration. The name is configurable; \
                     this is the default.",
                ))),
            );
            components.security_schemes.insert(
                "ProxyHeader".to_string(),
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::with_description(
                    "X-Forwarded-User",
                    "Verified user email injected by a trusted authenticating reverse proxy.",
                ))),
            );
        }
    }
}

/// Endpoints nested under `/api/v1`.
#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::users::list_users,
        api::handlers::users::create_user,
        api::handlers::users::get_user,
        api::handlers::users::update_user,
        api::handlers::users::delete_user,
        api::handlers::credits::get_own_balance,
        api::handlers::credits::list_own_entries,
        api::handlers::credits::create_adjustment,
        api::handlers::credits::get_user_balance,
        api::handlers::credits::list_user_entries,
        api::handlers::credits::list_all_entries,
        api::handlers::billing::create_checkout,
        api::handlers::billing::process_checkout,
        api::handlers::billing::create_portal,
        api::handlers::billing::get_own_plan,
        api::handlers::referrals::redeem_code,
        api::handlers::referrals::create_code,
        api::handlers::referrals::list_codes,
        api::handlers::jobs::create_job,
        api::handlers::jobs::list_jobs,
        api::handlers::jobs::get_job,
        api::handlers::jobs::transition_job,
        api::handlers::reconciliation::get_last_report,
        api::handlers::reconciliation::run_reconciliation,
    ),
    components(
        schemas(
            api::models::users::Role,
            api::models::users::UserCreate,
            api::models::users::UserUpdate,
            api::models::users::UserResponse,
            api::models::credits::AdminCreditRequest,
            api::models::credits::EntryResponse,
            api::models::credits::BalanceResponse,
            api::models::billing::CheckoutResponse,
            api::models::billing::ProcessCheckoutResponse,
            api::models::billing::PortalResponse,
            api::models::billing::PlanResponse,
            api::models::referrals::ReferralCodeCreateRequest,
            api::models::referrals::RedeemRequest,
            api::models::referrals::ReferralCodeResponse,
            api::models::referrals::RedeemResponse,
            api::models::jobs::JobCreateRequest,
            api::models::jobs::JobTransitionRequest,
            api::models::jobs::JobResponse,
            api::models::pagination::PaginatedResponse<api::models::users::UserResponse>,
            api::models::pagination::PaginatedResponse<api::models::credits::EntryResponse>,
            api::models::pagination::PaginatedResponse<api::models::jobs::JobResponse>,
            EntryReason,
            JobStatus,
            PlanStatus,
            ReconciliationReport,
            NegativeBalanceFinding,
        )
    ),
)]
struct V1Api;

#[derive(OpenApi)]
#[openapi(
    modifiers(&SecurityAddon),
    paths(
        api::handlers::auth::get_registration_info,
        api::handlers::auth::register,
        api::handlers::auth::get_login_info,
        api::handlers::auth::login,
        api::handlers::auth::logout,
        api::handlers::auth::me,
        api::handlers::auth::change_password,
    ),
    nest(
        (path = "/api/v1", api = V1Api)
    ),
    components(
        schemas(
            api::models::auth::RegistrationInfo,
            api::models::auth::LoginInfo,
            api::models::auth::RegisterRequest,
            api::models::auth::LoginRequest,
            api::models::auth::ChangePasswordRequest,
            api::models::auth::AuthResponse,
            api::models::auth::AuthSuccessResponse,
        )
    ),
    tags(
        (name = "auth", description = "Registration, login, and session management. Session state \
            is a signed HTTP-only cookie; deployments behind an authenticating proxy can skip \
            these endpoints entirely."),
        (name = "users", description = "User accounts and roles. Collection operations are \
            admin-only; single-user reads serve self-service too."),
        (name = "credits", description = "The credit ledger: balances, entry history, and audited \
            admin corrections. Balances are always the sum of non-expired entries."),
        (name = "billing", description = "Subscription and checkout redirects against the \
            configured billing provider. Plan state itself is driven by webhooks."),
        (name = "referrals", description = "Personal referral codes (redeemed at registration) \
            and single-use marketing codes."),
        (name = "jobs", description = "Staging jobs: the unit of work that spends credits. \
            Failed jobs are refunded automatically."),
        (name = "admin", description = "Operational surface: reconciliation reports and manual \
            sweeps."),
    ),
    info(
        title = "Ledgerd API",
        version = "0.4.0",
        description = "Credit ledger and billing control plane for the staging platform.

## Authentication

Requests are authenticated either by the session cookie issued at login/registration or, behind \
an authenticating reverse proxy, by the verified identity header the proxy injects.

## Errors

Errors are JSON bodies of the form `{\"error\": \"human-readable message\"}` with a matching \
HTTP status. `402` means insufficient credits; `409` means the operation conflicts with current \
state (already redeemed, already applied, concurrent update).",
    ),
)]
pub struct ApiDoc;
