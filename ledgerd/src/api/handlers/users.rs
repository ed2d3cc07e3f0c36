//! HTTP handlers for user management.
//!
//! Collection operations (list, create, delete) are admin surfaces; the
//! single-user endpoints serve both self-service and admin reads, scoped by
//! the caller's permissions. `include=credits` folds the ledger balance into
//! the response so admin tooling doesn't need a second round trip per user.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};

use crate::{
    AppState,
    api::models::{
        pagination::PaginatedResponse,
        users::{CurrentUser, GetUserQuery, ListUsersQuery, UserCreate, UserResponse, UserUpdate},
    },
    auth::permissions::{self, RequiresPermission, operation, resource},
    db::{
        handlers::{Ledger, Repository, UserFilter, Users},
        models::users::{UserCreateDBRequest, UserUpdateDBRequest},
    },
    errors::{Error, Result},
    types::{Operation, Permission, Resource, UserId},
};

/// True when the comma-separated `include` list asks for credit balances
fn includes_credits(include: &Option<String>) -> bool {
    include
        .as_deref()
        .is_some_and(|list| list.split(',').any(|part| part.trim() == "credits"))
}

/// List users
#[utoipa::path(
    get,
    path = "/users",
    tag = "users",
    summary = "List users",
    description = "All user accounts, newest first. `include=credits` adds each user's current balance.",
    params(ListUsersQuery),
    responses(
        (status = 200, description = "Paginated users", body = PaginatedResponse<UserResponse>),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden - requires Users ReadAll"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("CookieAuth" = []),
        ("ProxyHeader" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn list_users(
    State(state): State<AppState>,
    Query(query): Query<ListUsersQuery>,
    _perm: RequiresPermission<resource::Users, operation::ReadAll>,
) -> Result<Json<PaginatedResponse<UserResponse>>> {
    let (skip, limit) = query.pagination.params();

    let mut pool_conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut users = Users::new(&mut pool_conn);

    let rows = users.list(&UserFilter::new(skip, limit)).await?;
    let total_count = users.count().await?;

    let data = if includes_credits(&query.include) {
        let mut ledger = Ledger::new(&mut pool_conn);
        let mut enriched = Vec::with_capacity(rows.len());
        for row in rows {
            let balance = ledger.balance(row.id).await?;
            enriched.push(UserResponse::from(row).with_credit_balance(balance));
        }
        enriched
    } else {
        rows.into_iter().map(UserResponse::from).collect()
    };

    Ok(Json(PaginatedResponse::new(data, total_count, skip, limit)))
}

/// Create a user
#[utoipa::path(
    post,
    path = "/users",
    tag = "users",
    summary = "Create a user",
    description = "Creates an account without a password (for externally authenticated users). \
                   Admin-created accounts can carry extra roles.",
    request_body = UserCreate,
    responses(
        (status = 201, description = "User created", body = UserResponse),
        (status = 400, description = "Bad request"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden - requires Users CreateAll"),
        (status = 409, description = "Username or email already taken"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("CookieAuth" = []),
        ("ProxyHeader" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn create_user(
    State(state): State<AppState>,
    _perm: RequiresPermission<resource::Users, operation::CreateAll>,
    Json(data): Json<UserCreate>,
) -> Result<(StatusCode, Json<UserResponse>)> {
    if data.username.trim().is_empty() || data.email.trim().is_empty() {
        return Err(Error::BadRequest {
            message: "Username and email must not be empty".to_string(),
        });
    }

    let mut pool_conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut users = Users::new(&mut pool_conn);

    let created = users.create(&UserCreateDBRequest::from(data)).await?;

    tracing::info!(user_id = %created.id, "Created user");

    Ok((StatusCode::CREATED, Json(UserResponse::from(created))))
}

/// Get a user
#[utoipa::path(
    get,
    path = "/users/{user_id}",
    tag = "users",
    summary = "Get a user",
    description = "A single user. Callers without Users ReadAll can only access their own account.",
    params(
        ("user_id" = Uuid, Path, description = "User ID"),
        GetUserQuery,
    ),
    responses(
        (status = 200, description = "User details", body = UserResponse),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "User not found"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("CookieAuth" = []),
        ("ProxyHeader" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    Query(query): Query<GetUserQuery>,
    current_user: CurrentUser,
) -> Result<Json<UserResponse>> {
    if user_id != current_user.id && !permissions::has_permission(&current_user, Resource::Users, Operation::ReadAll) {
        // Return 404 to avoid leaking existence
        return Err(Error::NotFound {
            resource: "User".to_string(),
            id: user_id.to_string(),
        });
    }

    let mut pool_conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut users = Users::new(&mut pool_conn);

    let user = users.get_by_id(user_id).await?.ok_or_else(|| Error::NotFound {
        resource: "User".to_string(),
        id: user_id.to_string(),
    })?;

    let response = if includes_credits(&query.include) {
        let balance = Ledger::new(&mut pool_conn).balance(user.id).await?;
        UserResponse::from(user).with_credit_balance(balance)
    } else {
        UserResponse::from(user)
    };

    Ok(Json(response))
}

/// Update a user
#[utoipa::path(
    patch,
    path = "/users/{user_id}",
    tag = "users",
    summary = "Update a user",
    description = "Users can update their own profile fields; changing roles requires Users UpdateAll.",
    params(
        ("user_id" = Uuid, Path, description = "User ID"),
    ),
    request_body = UserUpdate,
    responses(
        (status = 200, description = "User updated", body = UserResponse),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden - role changes require Users UpdateAll"),
        (status = 404, description = "User not found"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("CookieAuth" = []),
        ("ProxyHeader" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn update_user(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    current_user: CurrentUser,
    Json(data): Json<UserUpdate>,
) -> Result<Json<UserResponse>> {
    let can_update_all = permissions::has_permission(&current_user, Resource::Users, Operation::UpdateAll);

    if user_id != current_user.id && !can_update_all {
        if permissions::has_permission(&current_user, Resource::Users, Operation::ReadAll) {
            // They can see the user but not change them
            return Err(Error::InsufficientPermissions {
                required: Permission::Allow(Resource::Users, Operation::UpdateAll),
                action: Operation::UpdateAll,
                resource: format!("{:?}", Resource::Users),
            });
        }
        // Return 404 to avoid leaking existence
        return Err(Error::NotFound {
            resource: "User".to_string(),
            id: user_id.to_string(),
        });
    }

    // Self-service updates stop at profile fields
    if data.roles.is_some() && !can_update_all {
        return Err(Error::InsufficientPermissions {
            required: Permission::Allow(Resource::Users, Operation::UpdateAll),
            action: Operation::UpdateAll,
            resource: format!("{:?}", Resource::Users),
        });
    }

    let mut pool_conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut users = Users::new(&mut pool_conn);

    let updated = users.update(user_id, &UserUpdateDBRequest::new(data)).await?;

    Ok(Json(UserResponse::from(updated)))
}

/// Delete a user
#[utoipa::path(
    delete,
    path = "/users/{user_id}",
    tag = "users",
    summary = "Delete a user",
    params(
        ("user_id" = Uuid, Path, description = "User ID"),
    ),
    responses(
        (status = 204, description = "User deleted"),
        (status = 400, description = "Bad request - cannot delete yourself"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden - requires Users DeleteAll"),
        (status = 404, description = "User not found"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("CookieAuth" = []),
        ("ProxyHeader" = [])
    )
)]
#[tracing::instrument(skip_all, fields(user_id = %user_id))]
pub async fn delete_user(
    State(state): State<AppState>,
    _perm: RequiresPermission<resource::Users, operation::DeleteAll>,
    current_user: CurrentUser,
    Path(user_id): Path<UserId>,
) -> Result<StatusCode> {
    if user_id == current_user.id {
        return Err(Error::BadRequest {
            message: "You cannot delete your own account".to_string(),
        });
    }

    let mut pool_conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut users = Users::new(&mut pool_conn);

    let deleted = users.delete(user_id).await?;
    if !deleted {
        return Err(Error::NotFound {
            resource: "User".to_string(),
            id: user_id.to_string(),
        });
    }

    tracing::info!("Deleted user");

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::users::Role;
    use crate::db::models::ledger::EntryCreateDBRequest;
    use crate::test_utils::{add_auth_headers, create_test_admin_user, create_test_app, create_test_user};
    use rust_decimal::Decimal;
    use serde_json::json;
    use sqlx::PgPool;
    use uuid::Uuid;

    async fn grant(pool: &PgPool, user_id: UserId, amount: i64) {
        let mut conn = pool.acquire().await.unwrap();
        Ledger::new(&mut conn)
            .append(&EntryCreateDBRequest::admin_grant(
                user_id,
                user_id,
                Decimal::new(amount, 0),
                Some("seed".to_string()),
            ))
            .await
            .unwrap();
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_list_users_scoped_to_read_all(pool: PgPool) {
        let (app, _bg_services) = create_test_app(pool.clone()).await;
        let user = create_test_user(&pool, Role::StandardUser).await;
        let viewer = create_test_user(&pool, Role::SupportViewer).await;

        let headers = add_auth_headers(&user);
        let response = app.get("/api/v1/users").add_header(&headers[0].0, &headers[0].1).await;
        response.assert_status_forbidden();

        let headers = add_auth_headers(&viewer);
        let response = app.get("/api/v1/users").add_header(&headers[0].0, &headers[0].1).await;
        response.assert_status_ok();
        let page: PaginatedResponse<UserResponse> = response.json();
        assert!(page.total_count >= 2);
        // Balances are not included unless asked for
        assert!(page.data.iter().all(|u| u.credit_balance.is_none()));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_list_users_includes_balances_on_request(pool: PgPool) {
        let (app, _bg_services) = create_test_app(pool.clone()).await;
        let user = create_test_user(&pool, Role::StandardUser).await;
        let admin = create_test_admin_user(&pool).await;
        grant(&pool, user.id, 30).await;

        let headers = add_auth_headers(&admin);
        let response = app
            .get("/api/v1/users?include=credits&limit=100")
            .add_header(&headers[0].0, &headers[0].1)
            .await;
        response.assert_status_ok();
        let page: PaginatedResponse<UserResponse> = response.json();

        let row = page.data.iter().find(|u| u.id == user.id).unwrap();
        assert_eq!(row.credit_balance, Some(Decimal::new(30, 0)));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_create_user_requires_create_all(pool: PgPool) {
        let (app, _bg_services) = create_test_app(pool.clone()).await;
        let manager = create_test_user(&pool, Role::BillingManager).await;
        let admin = create_test_admin_user(&pool).await;

        // BillingManager can read users but not mint them
        let headers = add_auth_headers(&manager);
        let body = json!({
            "username": "provisioned",
            "email": "provisioned@example.com",
            "display_name": null,
            "avatar_url": null,
            "roles": ["StandardUser"],
        });
        let response = app
            .post("/api/v1/users")
            .add_header(&headers[0].0, &headers[0].1)
            .json(&body)
            .await;
        response.assert_status_forbidden();

        let headers = add_auth_headers(&admin);
        let response = app
            .post("/api/v1/users")
            .add_header(&headers[0].0, &headers[0].1)
            .json(&body)
            .await;
        response.assert_status(StatusCode::CREATED);
        let created: UserResponse = response.json();
        assert_eq!(created.email, "provisioned@example.com");
        assert!(!created.referral_code.is_empty());

        // Same email again conflicts
        let response = app
            .post("/api/v1/users")
            .add_header(&headers[0].0, &headers[0].1)
            .json(&json!({
                "username": "provisioned2",
                "email": "provisioned@example.com",
                "display_name": null,
                "avatar_url": null,
                "roles": ["StandardUser"],
            }))
            .await;
        response.assert_status_conflict();
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_get_user_scoping(pool: PgPool) {
        let (app, _bg_services) = create_test_app(pool.clone()).await;
        let alice = create_test_user(&pool, Role::StandardUser).await;
        let bob = create_test_user(&pool, Role::StandardUser).await;
        let admin = create_test_admin_user(&pool).await;
        grant(&pool, bob.id, 12).await;

        // Own account works without any Users permission
        let headers = add_auth_headers(&alice);
        let response = app
            .get(&format!("/api/v1/users/{}", alice.id))
            .add_header(&headers[0].0, &headers[0].1)
            .await;
        response.assert_status_ok();

        // Someone else's account does not exist as far as alice knows
        let response = app
            .get(&format!("/api/v1/users/{}", bob.id))
            .add_header(&headers[0].0, &headers[0].1)
            .await;
        response.assert_status_not_found();

        let headers = add_auth_headers(&admin);
        let response = app
            .get(&format!("/api/v1/users/{}?include=credits", bob.id))
            .add_header(&headers[0].0, &headers[0].1)
            .await;
        response.assert_status_ok();
        assert_eq!(response.json::<UserResponse>().credit_balance, Some(Decimal::new(12, 0)));

        let response = app
            .get(&format!("/api/v1/users/{}", Uuid::new_v4()))
            .add_header(&headers[0].0, &headers[0].1)
            .await;
        response.assert_status_not_found();
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_update_user_profile_and_roles(pool: PgPool) {
        let (app, _bg_services) = create_test_app(pool.clone()).await;
        let alice = create_test_user(&pool, Role::StandardUser).await;
        let bob = create_test_user(&pool, Role::StandardUser).await;
        let admin = create_test_admin_user(&pool).await;

        // Own profile fields are fine
        let headers = add_auth_headers(&alice);
        let response = app
            .patch(&format!("/api/v1/users/{}", alice.id))
            .add_header(&headers[0].0, &headers[0].1)
            .json(&json!({"display_name": "Alice Prime"}))
            .await;
        response.assert_status_ok();
        assert_eq!(response.json::<UserResponse>().display_name.as_deref(), Some("Alice Prime"));

        // Roles are not self-service
        let response = app
            .patch(&format!("/api/v1/users/{}", alice.id))
            .add_header(&headers[0].0, &headers[0].1)
            .json(&json!({"roles": ["BillingManager"]}))
            .await;
        response.assert_status_forbidden();

        // Other accounts are invisible
        let response = app
            .patch(&format!("/api/v1/users/{}", bob.id))
            .add_header(&headers[0].0, &headers[0].1)
            .json(&json!({"display_name": "Bobby"}))
            .await;
        response.assert_status_not_found();

        // Admins can grant roles; StandardUser sticks
        let headers = add_auth_headers(&admin);
        let response = app
            .patch(&format!("/api/v1/users/{}", alice.id))
            .add_header(&headers[0].0, &headers[0].1)
            .json(&json!({"roles": ["BillingManager"]}))
            .await;
        response.assert_status_ok();
        let updated: UserResponse = response.json();
        assert!(updated.roles.contains(&Role::BillingManager));
        assert!(updated.roles.contains(&Role::StandardUser));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_delete_user(pool: PgPool) {
        let (app, _bg_services) = create_test_app(pool.clone()).await;
        let user = create_test_user(&pool, Role::StandardUser).await;
        let victim = create_test_user(&pool, Role::StandardUser).await;
        let admin = create_test_admin_user(&pool).await;

        let headers = add_auth_headers(&user);
        let response = app
            .delete(&format!("/api/v1/users/{}", victim.id))
            .add_header(&headers[0].0, &headers[0].1)
            .await;
        response.assert_status_forbidden();

        let headers = add_auth_headers(&admin);
        let response = app
            .delete(&format!("/api/v1/users/{}", victim.id))
            .add_header(&headers[0].0, &headers[0].1)
            .await;
        response.assert_status(StatusCode::NO_CONTENT);

        let mut conn = pool.acquire().await.unwrap();
        assert!(Users::new(&mut conn).get_by_id(victim.id).await.unwrap().is_none());

        // Gone is gone
        let response = app
            .delete(&format!("/api/v1/users/{}", victim.id))
            .add_header(&headers[0].0, &headers[0].1)
            .await;
        response.assert_status_not_found();

        // Not yourself
        let response = app
            .delete(&format!("/api/v1/users/{}", admin.id))
            .add_header(&headers[0].0, &headers[0].1)
            .await;
        response.assert_status_bad_request();
    }
}
