use crate::{
    AppState,
    api::models::users::CurrentUser,
    auth::session,
    db::{errors::DbError, handlers::Users},
    errors::{Error, Result},
};
use axum::{extract::FromRequestParts, http::request::Parts};
use sqlx::PgPool;
use tracing::{debug, instrument, trace};

/// Extract user from JWT session cookie if present and valid
/// Returns:
/// - None: No session cookie present
/// - Some(Ok(user)): Valid JWT found and verified
/// - Some(Err(error)): Cookie header present but malformed
#[instrument(skip(parts, config))]
fn try_jwt_session_auth(parts: &Parts, config: &crate::config::Config) -> Option<Result<CurrentUser>> {
    let cookie_header = parts.headers.get(axum::http::header::COOKIE)?;

    let cookie_str = match cookie_header.to_str() {
        Ok(s) => s,
        Err(e) => {
            return Some(Err(Error::BadRequest {
                message: format!("Invalid cookie header: {e}"),
            }));
        }
    };
    let cookie_name = &config.auth.native.session.cookie_name;

    for cookie in cookie_str.split(';') {
        let cookie = cookie.trim();
        if let Some((name, value)) = cookie.split_once('=') {
            if name == cookie_name {
                match session::verify_session_token(value, config) {
                    Ok(user) => return Some(Ok(user)),
                    Err(_) => {
                        // Expired or invalid tokens are expected; treat them
                        // the same as no cookie and let other methods run
                        continue;
                    }
                }
            }
        }
    }
    None
}

/// Extract user from trusted proxy headers if present.
///
/// The deployment's reverse proxy is expected to have verified the identity
/// already, so the headers are taken at face value. The email header wins
/// when both are set; otherwise the user header value is used as the email.
///
/// Returns:
/// - None: No identity header present
/// - Some(Ok(user)): User found (or provisioned, when enabled)
/// - Some(Err(error)): Header present but lookup/provisioning failed
#[instrument(skip(parts, config, db))]
async fn try_proxy_header_auth(
    parts: &Parts,
    config: &crate::config::Config,
    db: &PgPool,
) -> Option<Result<CurrentUser>> {
    let proxy = &config.auth.proxy_header;

    let identity = parts.headers.get(&proxy.header_name).and_then(|h| h.to_str().ok())?;
    let email = parts
        .headers
        .get(&proxy.email_header_name)
        .and_then(|h| h.to_str().ok())
        .unwrap_or(identity);

    let mut conn = match db.acquire().await {
        Ok(conn) => conn,
        Err(e) => return Some(Err(DbError::from(e).into())),
    };
    let mut users = Users::new(&mut conn);

    let user = if proxy.auto_create_users {
        match users.find_or_provision(email, "proxy-header", &config.auth.default_user_roles).await {
            Ok(user) => user,
            Err(e) => return Some(Err(Error::Database(e))),
        }
    } else {
        match users.get_user_by_email(email).await {
            Ok(Some(user)) => user,
            Ok(None) => return None,
            Err(e) => return Some(Err(Error::Database(e))),
        }
    };

    Some(Ok(CurrentUser {
        id: user.id,
        username: user.username,
        email: user.email,
        is_admin: user.is_admin,
        roles: user.roles,
        display_name: user.display_name,
        avatar_url: user.avatar_url,
    }))
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = Error;

    #[instrument(skip(parts, state))]
    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        // Each enabled method returns Option<Result<CurrentUser>>:
        // - None means no credentials of that kind were present
        // - Some(Ok(user)) means successful authentication
        // - Some(Err(error)) means credentials were present but invalid
        //
        // The first success wins. A request only fails once every enabled
        // method has either declined or failed, so a valid session cookie
        // still authenticates when a stale proxy header is also present.

        let mut auth_errors = Vec::new();

        if state.config.auth.native.enabled {
            match try_jwt_session_auth(parts, &state.config) {
                Some(Ok(user)) => {
                    debug!("Found JWT session authenticated user: {}", user.id);
                    return Ok(user);
                }
                Some(Err(e)) => {
                    trace!("JWT session authentication failed: {:?}", e);
                    auth_errors.push(("JWT session", e));
                }
                None => {
                    trace!("No JWT session authentication attempted");
                }
            }
        }

        if state.config.auth.proxy_header.enabled {
            match try_proxy_header_auth(parts, &state.config, &state.db).await {
                Some(Ok(user)) => {
                    debug!("Found proxy header authenticated user: {}", user.id);
                    return Ok(user);
                }
                Some(Err(e)) => {
                    trace!("Proxy header authentication failed: {:?}", e);
                    auth_errors.push(("Proxy header", e));
                }
                None => {
                    trace!("No proxy header authentication attempted");
                }
            }
        }

        if !auth_errors.is_empty() {
            trace!("All authentication attempts failed ({}): {:?}", auth_errors.len(), auth_errors);
        }
        Err(Error::Unauthenticated { message: None })
    }
}
