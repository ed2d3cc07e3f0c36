//! # ledgerd: Credit Ledger and Billing Control Plane
//!
//! `ledgerd` is the backend for a staging platform's credit economy. It owns the
//! append-only credit ledger, subscription plan state driven by billing-provider
//! webhooks, referral codes, and the staging jobs that spend credits, and exposes
//! all of it through a RESTful API for dashboards and admin tooling.
//!
//! ## Overview
//!
//! Platforms that sell usage by credit face the same bookkeeping problems:
//! grants must never be applied twice when a webhook is retried, spends must not
//! race each other past a zero balance, promotional credits need expiry, and
//! every correction has to leave an audit trail. `ledgerd` solves these with one
//! structural decision: a user's balance is never a stored number. It is always
//! the sum of that user's non-expired ledger entries, and the ledger only ever
//! grows.
//!
//! ### What It Does
//!
//! Every credit movement is an immutable ledger entry tagged with a reason
//! (trial grant, plan renewal, job usage, admin correction, ...) and a unique
//! `source_id` derived from the event that caused it. Replayed webhooks and
//! retried requests collide on that `source_id` and become no-ops. Debits take a
//! row-level lock on the user and re-check the live balance inside the same
//! transaction, so concurrent spends cannot overdraw. Subscription lifecycle
//! events arrive on a signed webhook and translate into plan rows plus
//! period-keyed grant entries; registration hands out an expiring trial grant
//! and pays referral rewards; staging jobs debit on creation and refund
//! automatically on failure.
//!
//! ## Architecture
//!
//! The application is built on [Axum](https://github.com/tokio-rs/axum) for the
//! HTTP layer and uses PostgreSQL for all persistence.
//!
//! ### Request Flow
//!
//! Requests to `/api/v1/*` pass through extractor-based authentication: a
//! signed session cookie (for browser clients) or a trusted proxy header (for
//! SSO deployments), tried in that order. Handlers enforce role-based
//! permissions, distinguishing `*-All` operations (any user's resources) from
//! `*-Own` (the caller's). Handlers talk to the database through repository
//! types that take a `&mut PgConnection`, so a handler can compose several
//! repositories inside one transaction.
//!
//! The billing webhook at `/webhooks/billing` is the exception: it carries no
//! session, authenticating instead with a Standard-Webhooks HMAC signature
//! checked against the configured secret before any event is processed.
//!
//! ### Core Components
//!
//! The **API layer** ([`api`]) exposes session endpoints at `/auth/*` and the
//! authenticated management surface under `/api/v1/*`: users, credits, billing,
//! referrals, jobs, and the admin reconciliation endpoints.
//!
//! The **ledger** ([`db::handlers::Ledger`]) is the only writer of credit
//! entries. Its `append` takes the user-row lock, enforces the balance floor
//! for debits, and converts `source_id` collisions into typed
//! "already applied" errors that callers can treat as success.
//!
//! The **billing integration** ([`billing`]) abstracts the payment provider
//! behind a trait: checkout and portal sessions go out through it, and
//! subscription events come back in through the signed webhook.
//!
//! **Background services** run alongside the HTTP server: a periodic
//! reconciliation sweep ([`reconciliation`]) that repairs missed renewals and
//! stranded referral grants, flips lapsed plans to past-due, and reports
//! anomalies it will not touch (negative balances, stale jobs) for operators.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use ledgerd::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Parse CLI arguments and load configuration
//!     let args = ledgerd::config::Args::parse();
//!     let config = Config::load(&args)?;
//!
//!     // Initialize telemetry (structured logging and optional OpenTelemetry)
//!     ledgerd::telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     // Create and start the application
//!     let app = Application::new(config).await?;
//!
//!     // Run with graceful shutdown on Ctrl+C
//!     app.serve(async {
//!         tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
//!     }).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Database Setup
//!
//! The application requires a PostgreSQL database and automatically runs
//! migrations on startup:
//!
//! ```no_run
//! # use sqlx::PgPool;
//! # async fn example(pool: PgPool) -> Result<(), sqlx::Error> {
//! // Run migrations
//! ledgerd::migrator().run(&pool).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.
pub mod api;
pub mod auth;
pub mod billing;
pub mod config;
pub mod db;
pub mod errors;
mod openapi;
pub mod reconciliation;
pub mod telemetry;
mod types;
use crate::config::CorsOrigin;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use crate::{
    api::models::users::Role,
    auth::password,
    billing::BillingProvider,
    db::handlers::{Repository, Users},
    db::models::users::UserCreateDBRequest,
    errors::Error,
    openapi::ApiDoc,
};
use axum::http::HeaderValue;
use axum::{
    Json, Router, http,
    routing::{delete, get, patch, post},
};
use bon::Builder;
pub use config::Config;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, info, instrument};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

pub use types::{BillingEventId, EntryId, JobId, PlanId, ReferralCodeId, UserId};

/// Application state shared across all request handlers.
///
/// # Fields
///
/// - `db`: PostgreSQL connection pool
/// - `config`: Application configuration loaded from environment/files
/// - `billing`: Billing provider client, `None` when billing is not configured
///
/// # Example
///
/// ```ignore
/// let state = AppState::builder()
///     .db(pool)
///     .config(config)
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub db: PgPool,
    pub config: Config,
    pub billing: Option<Arc<dyn BillingProvider>>,
}

/// Get the ledgerd database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Create the initial admin user if it doesn't exist.
///
/// This function is idempotent - it will create a new admin user if one doesn't
/// exist, or update the password if the user already exists. It runs during
/// application startup so there is always an admin account available.
///
/// # Arguments
///
/// - `email`: Email address for the admin user (also used as username)
/// - `password`: Optional password. If `None`, the user will have no password set
/// - `db`: PostgreSQL connection pool
///
/// # Returns
///
/// Returns the user ID of the created or existing admin user.
#[instrument(skip_all)]
pub async fn create_initial_admin_user(email: &str, password: Option<&str>, db: &PgPool) -> Result<UserId, Error> {
    let password_hash = match password {
        Some(pwd) => Some(password::hash_password(pwd, password::Argon2Params::default())?),
        None => None,
    };

    let mut tx = db.begin().await.map_err(|e| Error::Database(e.into()))?;
    let mut user_repo = Users::new(&mut tx);

    if let Some(existing_user) = user_repo.get_user_by_email(email).await? {
        // User exists - update password if provided
        if let Some(password_hash) = password_hash {
            sqlx::query("UPDATE users SET password_hash = $1, updated_at = NOW() WHERE email = $2")
                .bind(&password_hash)
                .bind(email)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::Database(e.into()))?;
        }
        tx.commit().await.map_err(|e| Error::Database(e.into()))?;
        return Ok(existing_user.id);
    }

    let user_create = UserCreateDBRequest {
        username: email.to_string(),
        email: email.to_string(),
        display_name: None,
        avatar_url: None,
        is_admin: true,
        roles: vec![Role::PlatformManager],
        auth_source: "system".to_string(),
        password_hash,
    };

    let created_user = user_repo.create(&user_create).await?;

    tx.commit().await.map_err(|e| Error::Database(e.into()))?;
    Ok(created_user.id)
}

/// Connect to the database, run migrations, and ensure the admin user exists.
async fn setup_database(config: &Config) -> anyhow::Result<PgPool> {
    let database_url = config.database_url().ok_or_else(|| {
        anyhow::anyhow!("No database URL configured. Set DATABASE_URL or database.url in the config file.")
    })?;

    let pool_settings = &config.database.pool;
    let mut options = sqlx::postgres::PgPoolOptions::new()
        .max_connections(pool_settings.max_connections)
        .min_connections(pool_settings.min_connections)
        .acquire_timeout(std::time::Duration::from_secs(pool_settings.acquire_timeout_secs));
    if pool_settings.idle_timeout_secs > 0 {
        options = options.idle_timeout(std::time::Duration::from_secs(pool_settings.idle_timeout_secs));
    }
    if pool_settings.max_lifetime_secs > 0 {
        options = options.max_lifetime(std::time::Duration::from_secs(pool_settings.max_lifetime_secs));
    }

    let pool = options.connect(database_url).await?;
    migrator().run(&pool).await?;

    create_initial_admin_user(&config.admin_email, config.admin_password.as_deref(), &pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create initial admin user: {}", e))?;

    Ok(pool)
}

/// Create CORS layer from configuration
fn create_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let mut origins = Vec::new();
    for origin in &config.auth.security.cors.allowed_origins {
        let header_value = match origin {
            CorsOrigin::Wildcard => "*".parse::<HeaderValue>()?,
            CorsOrigin::Url(url) => url.as_str().parse::<HeaderValue>()?,
        };
        origins.push(header_value);
    }

    let mut cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_credentials(config.auth.security.cors.allow_credentials)
        .expose_headers(vec![http::header::LOCATION]);

    if let Some(max_age) = config.auth.security.cors.max_age {
        cors = cors.max_age(std::time::Duration::from_secs(max_age));
    }

    Ok(cors)
}

/// Build the main application router with all endpoints and middleware.
///
/// This function constructs the complete Axum router with:
/// - Authentication routes (registration, login, session introspection)
/// - API routes for users, credits, billing, referrals, and jobs
/// - The admin reconciliation surface
/// - The billing webhook endpoint
/// - OpenAPI docs at `/docs` and the raw document at `/api-docs/openapi.json`
/// - CORS configuration
/// - Tracing middleware
///
/// # Errors
///
/// Returns an error if CORS configuration is invalid.
#[instrument(skip_all)]
pub fn build_router(state: AppState) -> anyhow::Result<Router> {
    // Authentication routes (at root level, can be masked when deployed behind an SSO proxy)
    let auth_routes = Router::new()
        .route(
            "/auth/register",
            get(api::handlers::auth::get_registration_info).post(api::handlers::auth::register),
        )
        .route(
            "/auth/login",
            get(api::handlers::auth::get_login_info).post(api::handlers::auth::login),
        )
        .route("/auth/logout", post(api::handlers::auth::logout))
        .route("/auth/me", get(api::handlers::auth::me))
        .route("/auth/password-change", post(api::handlers::auth::change_password))
        .with_state(state.clone());

    // API routes
    let api_routes = Router::new()
        // User management (admin only for collection operations)
        .route("/users", get(api::handlers::users::list_users))
        .route("/users", post(api::handlers::users::create_user))
        .route("/users/{user_id}", get(api::handlers::users::get_user))
        .route("/users/{user_id}", patch(api::handlers::users::update_user))
        .route("/users/{user_id}", delete(api::handlers::users::delete_user))
        // Current-user credit surface ("current" wins over the {user_id} capture)
        .route("/users/current/credits/balance", get(api::handlers::credits::get_own_balance))
        .route("/users/current/credits/entries", get(api::handlers::credits::list_own_entries))
        .route("/users/current/plan", get(api::handlers::billing::get_own_plan))
        // Admin credit surface
        .route("/users/{user_id}/credits", post(api::handlers::credits::create_adjustment))
        .route("/users/{user_id}/credits/balance", get(api::handlers::credits::get_user_balance))
        .route("/users/{user_id}/credits/entries", get(api::handlers::credits::list_user_entries))
        .route("/credits/entries", get(api::handlers::credits::list_all_entries))
        // Billing provider redirects
        .route("/billing/checkout", post(api::handlers::billing::create_checkout))
        .route(
            "/billing/checkout/{session_id}/process",
            post(api::handlers::billing::process_checkout),
        )
        .route("/billing/portal", post(api::handlers::billing::create_portal))
        // Referral codes
        .route("/referrals", get(api::handlers::referrals::list_codes))
        .route("/referrals", post(api::handlers::referrals::create_code))
        .route("/referrals/redeem", post(api::handlers::referrals::redeem_code))
        // Staging jobs
        .route("/jobs", get(api::handlers::jobs::list_jobs))
        .route("/jobs", post(api::handlers::jobs::create_job))
        .route("/jobs/{job_id}", get(api::handlers::jobs::get_job))
        .route("/jobs/{job_id}/transition", post(api::handlers::jobs::transition_job))
        // Reconciliation admin surface
        .route(
            "/admin/reconciliation/last",
            get(api::handlers::reconciliation::get_last_report),
        )
        .route(
            "/admin/reconciliation/run",
            post(api::handlers::reconciliation::run_reconciliation),
        )
        .with_state(state.clone());

    let router = Router::new()
        .route("/healthz", get(|| async { "OK" }))
        // Webhook routes (external services, not part of client API docs)
        .route("/webhooks/billing", post(api::handlers::webhooks::ingest_billing_event))
        .route("/api-docs/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .with_state(state.clone())
        .merge(auth_routes)
        .nest("/api/v1", api_routes)
        .merge(Scalar::with_url("/docs", ApiDoc::openapi()));

    // Create CORS layer from config
    let cors_layer = create_cors_layer(&state.config)?;
    let router = router.layer(cors_layer);

    // Add tracing layer
    let router = router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    Ok(router)
}

/// Container for background services and their lifecycle management.
///
/// Currently this holds the periodic reconciliation sweep. The struct provides
/// a [`shutdown`](BackgroundServices::shutdown) method to gracefully stop all
/// background tasks; when dropped, the `drop_guard` cancels the shutdown token
/// so tasks stop even if `shutdown` was never called.
pub struct BackgroundServices {
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
    shutdown_token: tokio_util::sync::CancellationToken,
    // Pub so that we can disarm it if we want to
    pub drop_guard: Option<tokio_util::sync::DropGuard>,
}

impl BackgroundServices {
    /// Gracefully shutdown all background tasks
    pub async fn shutdown(self) {
        // Signal all background tasks to shutdown
        self.shutdown_token.cancel();

        // Wait for all background tasks to complete
        for handle in self.background_tasks {
            let _ = handle.await;
        }
    }
}

/// Spawn background tasks (reconciliation sweep) per configuration.
fn setup_background_services(pool: PgPool, config: Config, shutdown_token: tokio_util::sync::CancellationToken) -> BackgroundServices {
    let drop_guard = shutdown_token.clone().drop_guard();
    let mut background_tasks = Vec::new();

    if config.reconciliation.enabled {
        let handle = tokio::spawn(reconciliation::run_reconciliation_loop(
            pool,
            config,
            shutdown_token.clone(),
        ));
        background_tasks.push(handle);
    } else {
        info!("Reconciliation sweep disabled by configuration");
    }

    BackgroundServices {
        background_tasks,
        shutdown_token,
        drop_guard: Some(drop_guard),
    }
}

/// Main application struct that owns all resources and lifecycle.
///
/// # Lifecycle
///
/// 1. **Create**: [`Application::new`] connects to the database, runs
///    migrations, ensures the admin user, and starts background services
/// 2. **Serve**: [`Application::serve`] binds to a TCP port and starts handling
///    requests
/// 3. **Shutdown**: when the shutdown signal resolves, background services are
///    stopped and connections drained
pub struct Application {
    router: Router,
    config: Config,
    pool: PgPool,
    bg_services: BackgroundServices,
}

impl Application {
    /// Create a new application instance with all resources initialized
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        Self::new_with_pool(config, None).await
    }

    /// Create an application on an existing pool (tests hand in a pre-migrated
    /// pool here); `None` connects and migrates per configuration.
    pub async fn new_with_pool(config: Config, pool: Option<PgPool>) -> anyhow::Result<Self> {
        debug!("Starting ledgerd with configuration: {:#?}", config);

        let pool = match pool {
            Some(pool) => pool,
            None => setup_database(&config).await?,
        };

        // Create a shutdown token for coordinating graceful shutdown of background tasks
        let shutdown_token = tokio_util::sync::CancellationToken::new();
        let bg_services = setup_background_services(pool.clone(), config.clone(), shutdown_token.clone());

        let billing = config
            .billing
            .clone()
            .map(|provider_config| billing::create_provider(provider_config, &config.credits));

        let app_state = AppState::builder()
            .db(pool.clone())
            .config(config.clone())
            .maybe_billing(billing)
            .build();

        let router = build_router(app_state)?;

        Ok(Self {
            router,
            config,
            pool,
            bg_services,
        })
    }

    /// Convert application into a test server (for tests)
    #[cfg(any(test, feature = "test-utils"))]
    pub fn into_test_server(self) -> (axum_test::TestServer, BackgroundServices) {
        let server = axum_test::TestServer::new(self.router).expect("Failed to create test server");
        (server, self.bg_services)
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "Ledger listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        // Run the server with graceful shutdown
        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        // Shutdown background services and wait for tasks to complete
        self.bg_services.shutdown().await;

        // Close database connections
        info!("Closing database connections...");
        self.pool.close().await;

        // Shutdown telemetry
        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::create_initial_admin_user;
    use crate::api::models::auth::AuthResponse;
    use crate::api::models::users::UserResponse;
    use crate::test_utils::create_test_app;
    use serde_json::json;
    use sqlx::PgPool;

    #[sqlx::test]
    #[test_log::test]
    async fn test_healthz(pool: PgPool) {
        let (server, _bg_services) = create_test_app(pool).await;

        let response = server.get("/healthz").await;
        response.assert_status_ok();
        response.assert_text("OK");
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_register_login_me_flow(pool: PgPool) {
        let (server, _bg_services) = create_test_app(pool).await;

        let register = server
            .post("/auth/register")
            .json(&json!({
                "username": "flow_user",
                "email": "flow@example.com",
                "password": "correct-horse-battery",
                "display_name": "Flow User",
                "referral_code": null,
            }))
            .await;
        register.assert_status(axum::http::StatusCode::CREATED);
        let registered: AuthResponse = register.json();

        let login = server
            .post("/auth/login")
            .json(&json!({
                "email": "flow@example.com",
                "password": "correct-horse-battery",
            }))
            .await;
        login.assert_status_ok();
        let set_cookie = login.headers().get("set-cookie").unwrap().to_str().unwrap();
        let cookie = set_cookie.split(';').next().unwrap().to_string();
        assert!(cookie.starts_with("ledgerd_session="));

        let me = server.get("/auth/me").add_header("cookie", cookie).await;
        me.assert_status_ok();
        let current: UserResponse = me.json();
        assert_eq!(current.id, registered.user.id);
        assert_eq!(current.email, "flow@example.com");
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_docs_and_openapi_served(pool: PgPool) {
        let (server, _bg_services) = create_test_app(pool).await;

        let docs = server.get("/docs").await;
        docs.assert_status_ok();

        let raw = server.get("/api-docs/openapi.json").await;
        raw.assert_status_ok();
        let document: serde_json::Value = raw.json();
        assert!(document["paths"]["/api/v1/users"].is_object());
        assert!(document["paths"]["/auth/login"].is_object());
        // Webhook endpoint stays out of the client docs
        assert!(document["paths"]["/webhooks/billing"].is_null());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_initial_admin_user_is_idempotent(pool: PgPool) {
        let first = create_initial_admin_user("root@example.com", Some("first-password"), &pool)
            .await
            .unwrap();
        let second = create_initial_admin_user("root@example.com", Some("rotated-password"), &pool)
            .await
            .unwrap();
        assert_eq!(first, second);

        let mut conn = pool.acquire().await.unwrap();
        let mut users = crate::db::handlers::Users::new(&mut conn);
        let admin = users.get_user_by_email("root@example.com").await.unwrap().unwrap();
        assert!(admin.is_admin);

        // Password was rotated on the second call
        let hash = admin.password_hash.unwrap();
        assert!(crate::auth::password::verify_password("rotated-password", &hash).unwrap());
        assert!(!crate::auth::password::verify_password("first-password", &hash).unwrap());
    }
}
