//! HTTP handlers for native (email + password) authentication.
//!
//! Registration is where accounts meet the ledger: the user row, the trial
//! grant, and any referral reward are written in one transaction, so a
//! rejected referral code fails the whole signup rather than leaving an
//! account with missing credits.

use axum::{Json, extract::State};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgConnection;

use crate::{
    AppState,
    api::models::{
        auth::{
            AuthResponse, AuthSuccessResponse, ChangePasswordRequest, LoginInfo, LoginRequest, LoginResponse,
            LogoutResponse, RegisterRequest, RegisterResponse, RegistrationInfo,
        },
        users::{CurrentUser, Role, UserResponse},
    },
    auth::{password, session},
    config::Config,
    db::{
        handlers::{Ledger, Referrals, Repository, Users},
        models::{ledger::EntryCreateDBRequest, users::{UserCreateDBRequest, UserDBResponse}},
    },
    errors::{Error, Result},
};

/// Get registration availability
#[utoipa::path(
    get,
    path = "/auth/register",
    tag = "authentication",
    summary = "Registration info",
    responses(
        (status = 200, description = "Registration availability", body = RegistrationInfo),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_registration_info(State(state): State<AppState>) -> Result<Json<RegistrationInfo>> {
    let enabled = state.config.auth.native.enabled && state.config.auth.native.allow_registration;
    Ok(Json(RegistrationInfo {
        enabled,
        message: if enabled {
            "Registration is enabled".to_string()
        } else {
            "Registration is disabled".to_string()
        },
    }))
}

/// Register a new user account
#[utoipa::path(
    post,
    path = "/auth/register",
    tag = "authentication",
    summary = "Register",
    description = "Creates an account, grants trial credits, and applies an optional referral code. \
                   A personal code rewards its owner; a special code pays the new account; an invalid \
                   code fails the registration.",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "User registered", body = AuthResponse),
        (status = 400, description = "Registration disabled, weak password, or invalid referral code"),
        (status = 409, description = "Username or email already taken"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn register(State(state): State<AppState>, Json(request): Json<RegisterRequest>) -> Result<RegisterResponse> {
    if !state.config.auth.native.enabled {
        return Err(Error::BadRequest {
            message: "Native authentication is disabled".to_string(),
        });
    }
    if !state.config.auth.native.allow_registration {
        return Err(Error::BadRequest {
            message: "User registration is disabled".to_string(),
        });
    }

    let password_config = &state.config.auth.native.password;
    if request.password.len() < password_config.min_length {
        return Err(Error::BadRequest {
            message: format!("Password must be at least {} characters", password_config.min_length),
        });
    }
    if request.password.len() > password_config.max_length {
        return Err(Error::BadRequest {
            message: format!("Password must be no more than {} characters", password_config.max_length),
        });
    }

    // Hash on a blocking thread; argon2 at production cost would stall the runtime
    let params = password::Argon2Params::from(password_config);
    let raw_password = request.password.clone();
    let password_hash = tokio::task::spawn_blocking(move || password::hash_password(&raw_password, params))
        .await
        .map_err(|e| Error::Internal {
            operation: format!("spawn password hashing task: {e}"),
        })??;

    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;

    let mut users = Users::new(&mut tx);
    if users.get_user_by_email(&request.email).await?.is_some() {
        return Err(Error::BadRequest {
            message: "An account with this email address already exists".to_string(),
        });
    }

    let created = users
        .create(&UserCreateDBRequest {
            username: request.username,
            email: request.email,
            display_name: request.display_name,
            avatar_url: None,
            is_admin: false,
            roles: vec![Role::StandardUser],
            auth_source: "native".to_string(),
            password_hash: Some(password_hash),
        })
        .await?;

    let trial = &state.config.credits.trial_grant;
    if trial.amount > Decimal::ZERO {
        let expires_at = expiry_from(trial.expires_after);
        Ledger::new(&mut tx)
            .append(&EntryCreateDBRequest::trial_grant(created.id, trial.amount, expires_at))
            .await?;
    }

    if let Some(code) = request.referral_code.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        apply_signup_referral(&mut tx, &state.config, &created, code).await?;
    }

    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    tracing::info!(user_id = %created.id, "Registered new user");

    let current_user = CurrentUser::from(created.clone());
    let token = session::create_session_token(&current_user, &state.config)?;
    let cookie = create_session_cookie(&token, &state.config);

    Ok(RegisterResponse {
        auth_response: AuthResponse {
            user: UserResponse::from(created),
            message: "Registration successful".to_string(),
        },
        cookie,
    })
}

/// Resolve a signup referral code inside the registration transaction.
///
/// A personal code rewards its owner; a special code pays the new account
/// and is consumed. Anything else (unknown, already redeemed, expired)
/// fails the registration so the user can correct the code.
async fn apply_signup_referral(conn: &mut PgConnection, config: &Config, new_user: &UserDBResponse, code: &str) -> Result<()> {
    let expires_at = expiry_from(config.credits.referral.expires_after);

    if let Some(referrer) = Users::new(&mut *conn).get_user_by_referral_code(code).await? {
        let reward = config.credits.referral.reward_amount;
        if reward > Decimal::ZERO {
            Ledger::new(&mut *conn)
                .append(&EntryCreateDBRequest::referral_signup_reward(referrer.id, new_user.id, reward, expires_at))
                .await?;
        }
        tracing::info!(referrer_id = %referrer.id, "Applied personal referral code at signup");
        return Ok(());
    }

    let Some(claimed) = Referrals::new(&mut *conn).claim(code, new_user.id).await? else {
        return Err(Error::BadRequest {
            message: "Invalid referral code".to_string(),
        });
    };

    Ledger::new(&mut *conn)
        .append(&EntryCreateDBRequest::special_code_grant(
            new_user.id,
            &claimed.code,
            claimed.credit_amount,
            expires_at,
        ))
        .await?;
    tracing::info!("Applied special referral code at signup");
    Ok(())
}

/// Absolute expiry for a grant from a configured retention window
fn expiry_from(window: Option<std::time::Duration>) -> Option<DateTime<Utc>> {
    window.and_then(|d| chrono::Duration::from_std(d).ok()).map(|d| Utc::now() + d)
}

/// Get login availability
#[utoipa::path(
    get,
    path = "/auth/login",
    tag = "authentication",
    summary = "Login info",
    responses(
        (status = 200, description = "Login availability", body = LoginInfo),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_login_info(State(state): State<AppState>) -> Result<Json<LoginInfo>> {
    Ok(Json(LoginInfo {
        enabled: state.config.auth.native.enabled,
        message: if state.config.auth.native.enabled {
            "Native login is enabled".to_string()
        } else {
            "Native login is disabled".to_string()
        },
    }))
}

/// Login with email and password
#[utoipa::path(
    post,
    path = "/auth/login",
    tag = "authentication",
    summary = "Login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = AuthResponse),
        (status = 401, description = "Invalid credentials"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn login(State(state): State<AppState>, Json(request): Json<LoginRequest>) -> Result<LoginResponse> {
    if !state.config.auth.native.enabled {
        return Err(Error::BadRequest {
            message: "Native authentication is disabled".to_string(),
        });
    }

    let mut pool_conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut users = Users::new(&mut pool_conn);

    // All failure paths share one message; no probing which emails exist
    let user = users
        .get_user_by_email(&request.email)
        .await?
        .ok_or_else(|| Error::Unauthenticated {
            message: Some("Invalid email or password".to_string()),
        })?;

    let password_hash = user.password_hash.clone().ok_or_else(|| Error::Unauthenticated {
        message: Some("Invalid email or password".to_string()),
    })?;

    let raw_password = request.password.clone();
    let is_valid = tokio::task::spawn_blocking(move || password::verify_password(&raw_password, &password_hash))
        .await
        .map_err(|e| Error::Internal {
            operation: format!("spawn password verification task: {e}"),
        })??;

    if !is_valid {
        return Err(Error::Unauthenticated {
            message: Some("Invalid email or password".to_string()),
        });
    }

    users.set_last_login(user.id).await?;

    let current_user = CurrentUser::from(user.clone());
    let token = session::create_session_token(&current_user, &state.config)?;
    let cookie = create_session_cookie(&token, &state.config);

    Ok(LoginResponse {
        auth_response: AuthResponse {
            user: UserResponse::from(user),
            message: "Login successful".to_string(),
        },
        cookie,
    })
}

/// Logout (clear session)
#[utoipa::path(
    post,
    path = "/auth/logout",
    tag = "authentication",
    summary = "Logout",
    responses(
        (status = 200, description = "Session cleared", body = AuthSuccessResponse),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn logout(State(state): State<AppState>) -> Result<LogoutResponse> {
    // An expired cookie overwrites the session in the browser
    let cookie = format!(
        "{}=; Path=/; HttpOnly; Secure; SameSite=Strict; Max-Age=0",
        state.config.auth.native.session.cookie_name
    );

    Ok(LogoutResponse {
        auth_response: AuthSuccessResponse {
            message: "Logout successful".to_string(),
        },
        cookie,
    })
}

/// Get the authenticated user
#[utoipa::path(
    get,
    path = "/auth/me",
    tag = "authentication",
    summary = "Current user",
    description = "A fresh read of the authenticated user, including the personal referral code.",
    responses(
        (status = 200, description = "Current user", body = UserResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(
        ("CookieAuth" = []),
        ("ProxyHeader" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn me(State(state): State<AppState>, current_user: CurrentUser) -> Result<Json<UserResponse>> {
    let mut pool_conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut users = Users::new(&mut pool_conn);

    // The session is a snapshot; read the row so roles and profile are current
    let user = users.get_by_id(current_user.id).await?.ok_or(Error::Unauthenticated {
        message: Some("User no longer exists".to_string()),
    })?;

    Ok(Json(UserResponse::from(user)))
}

/// Change password for the authenticated user
#[utoipa::path(
    post,
    path = "/auth/password-change",
    tag = "authentication",
    summary = "Change password",
    request_body = ChangePasswordRequest,
    responses(
        (status = 200, description = "Password changed", body = AuthSuccessResponse),
        (status = 400, description = "Invalid request"),
        (status = 401, description = "Current password is incorrect"),
    ),
    security(
        ("CookieAuth" = []),
        ("ProxyHeader" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn change_password(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Json(request): Json<ChangePasswordRequest>,
) -> Result<Json<AuthSuccessResponse>> {
    if !state.config.auth.native.enabled {
        return Err(Error::BadRequest {
            message: "Native authentication is disabled".to_string(),
        });
    }

    let password_config = &state.config.auth.native.password;
    if request.new_password.len() < password_config.min_length {
        return Err(Error::BadRequest {
            message: format!("Password must be at least {} characters", password_config.min_length),
        });
    }
    if request.new_password.len() > password_config.max_length {
        return Err(Error::BadRequest {
            message: format!("Password must be no more than {} characters", password_config.max_length),
        });
    }

    let mut pool_conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut users = Users::new(&mut pool_conn);

    let user = users.get_by_id(current_user.id).await?.ok_or(Error::Unauthenticated {
        message: Some("User no longer exists".to_string()),
    })?;

    // Proxy-provisioned accounts have no password to change
    let password_hash = user.password_hash.clone().ok_or_else(|| Error::BadRequest {
        message: "This account does not use password authentication".to_string(),
    })?;

    let current_password = request.current_password.clone();
    let is_valid = tokio::task::spawn_blocking(move || password::verify_password(&current_password, &password_hash))
        .await
        .map_err(|e| Error::Internal {
            operation: format!("spawn password verification task: {e}"),
        })??;

    if !is_valid {
        return Err(Error::Unauthenticated {
            message: Some("Current password is incorrect".to_string()),
        });
    }

    let params = password::Argon2Params::from(password_config);
    let new_password = request.new_password.clone();
    let new_password_hash = tokio::task::spawn_blocking(move || password::hash_password(&new_password, params))
        .await
        .map_err(|e| Error::Internal {
            operation: format!("spawn password hashing task: {e}"),
        })??;

    users
        .update(
            current_user.id,
            &crate::db::models::users::UserUpdateDBRequest {
                password_hash: Some(new_password_hash),
                ..Default::default()
            },
        )
        .await?;

    Ok(Json(AuthSuccessResponse {
        message: "Password changed successfully".to_string(),
    }))
}

/// Session cookie with the attributes configured for this deployment
fn create_session_cookie(token: &str, config: &Config) -> String {
    let session_config = &config.auth.native.session;
    let max_age = config.auth.security.jwt_expiry.as_secs();

    format!(
        "{}={}; Path=/; HttpOnly; Secure={}; SameSite={}; Max-Age={}",
        session_config.cookie_name, token, session_config.cookie_secure, session_config.cookie_same_site, max_age
    )
}
