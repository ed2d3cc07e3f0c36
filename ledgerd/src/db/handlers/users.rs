//! Database repository for users.

use crate::types::{UserId, abbrev_uuid};
use crate::{
    api::models::users::Role,
    db::{
        errors::{DbError, Result},
        handlers::repository::Repository,
        models::users::{UserCreateDBRequest, UserDBResponse, UserUpdateDBRequest},
    },
};
use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use sqlx::{Connection, FromRow, PgConnection};
use tracing::instrument;
use uuid::Uuid;

/// Length of the shareable per-user referral code
const REFERRAL_CODE_LEN: usize = 12;

/// Attempts before giving up on a referral-code collision
const REFERRAL_CODE_ATTEMPTS: usize = 3;

/// Filter for listing users
#[derive(Debug, Clone)]
pub struct UserFilter {
    pub skip: i64,
    pub limit: i64,
}

impl UserFilter {
    pub fn new(skip: i64, limit: i64) -> Self {
        Self { skip, limit }
    }
}

// Database entity model
#[derive(Debug, Clone, FromRow)]
struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub auth_source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
    pub is_admin: bool,
    pub password_hash: Option<String>,
    pub referral_code: String,
}

pub struct Users<'c> {
    db: &'c mut PgConnection,
}

impl From<(Vec<Role>, User)> for UserDBResponse {
    fn from((roles, user): (Vec<Role>, User)) -> Self {
        Self {
            id: user.id,
            username: user.username,
            email: user.email,
            display_name: user.display_name,
            avatar_url: user.avatar_url,
            created_at: user.created_at,
            updated_at: user.updated_at,
            last_login: user.last_login,
            auth_source: user.auth_source,
            is_admin: user.is_admin,
            roles,
            password_hash: user.password_hash,
            referral_code: user.referral_code,
        }
    }
}

/// Generate a shareable referral code (URL-safe alphanumeric)
pub fn generate_referral_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(REFERRAL_CODE_LEN)
        .map(char::from)
        .collect()
}

#[async_trait::async_trait]
impl<'c> Repository for Users<'c> {
    type CreateRequest = UserCreateDBRequest;
    type UpdateRequest = UserUpdateDBRequest;
    type Response = UserDBResponse;
    type Id = UserId;
    type Filter = UserFilter;

    #[instrument(skip(self, request), fields(username = %request.username), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        // Always generate a new ID for users
        let user_id = Uuid::new_v4();

        let mut tx = self.db.begin().await?;

        // Insert the user, regenerating the referral code on collision. The
        // ON CONFLICT arbiter only swallows referral-code clashes; duplicate
        // emails and usernames still surface as unique violations.
        let mut user: Option<User> = None;
        for _ in 0..REFERRAL_CODE_ATTEMPTS {
            let referral_code = generate_referral_code();
            let inserted = sqlx::query_as::<_, User>(
                r#"
                INSERT INTO users (id, username, email, display_name, avatar_url, auth_source, is_admin, password_hash, referral_code)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (referral_code) DO NOTHING
                RETURNING *
                "#,
            )
            .bind(user_id)
            .bind(&request.username)
            .bind(&request.email)
            .bind(&request.display_name)
            .bind(&request.avatar_url)
            .bind(&request.auth_source)
            .bind(request.is_admin)
            .bind(&request.password_hash)
            .bind(&referral_code)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(inserted) = inserted {
                user = Some(inserted);
                break;
            }
        }
        let user = user.ok_or_else(|| DbError::Other(anyhow::anyhow!("could not allocate a unique referral code")))?;

        // Insert roles
        for role in &request.roles {
            sqlx::query("INSERT INTO user_roles (user_id, role) VALUES ($1, $2)")
                .bind(user_id)
                .bind(role)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        Ok(UserDBResponse::from((request.roles.clone(), user)))
    }

    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&id)), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1 AND id != '00000000-0000-0000-0000-000000000000'")
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;

        if let Some(user) = user {
            let roles = self.roles_for(user.id).await?;
            Ok(Some(UserDBResponse::from((roles, user))))
        } else {
            Ok(None)
        }
    }

    #[instrument(skip(self, filter), fields(limit = filter.limit, skip = filter.skip), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let users = sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE id != '00000000-0000-0000-0000-000000000000' ORDER BY created_at DESC LIMIT $1 OFFSET $2",
        )
        .bind(filter.limit)
        .bind(filter.skip)
        .fetch_all(&mut *self.db)
        .await?;

        let mut result = Vec::new();
        for user in users {
            let roles = self.roles_for(user.id).await?;
            result.push(UserDBResponse::from((roles, user)));
        }
        Ok(result)
    }

    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&id)), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1 AND id != '00000000-0000-0000-0000-000000000000'")
            .bind(id)
            .execute(&mut *self.db)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, request), fields(user_id = %abbrev_uuid(&id)), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        // This update can touch two tables, so it needs its own transaction
        let user;
        {
            let mut tx = self.db.begin().await?;

            user = sqlx::query_as::<_, User>(
                r#"
                UPDATE users SET
                    display_name = COALESCE($2, display_name),
                    avatar_url = COALESCE($3, avatar_url),
                    password_hash = COALESCE($4, password_hash),
                    last_login = COALESCE($5, last_login),
                    updated_at = NOW()
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(&request.display_name)
            .bind(&request.avatar_url)
            .bind(&request.password_hash)
            .bind(request.last_login)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(DbError::NotFound)?;

            if let Some(roles) = &request.roles {
                // Everyone keeps StandardUser; role updates cannot strip it
                let mut updated_roles = roles.clone();
                if !updated_roles.contains(&Role::StandardUser) {
                    updated_roles.push(Role::StandardUser);
                }

                sqlx::query("DELETE FROM user_roles WHERE user_id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;

                for role in &updated_roles {
                    sqlx::query("INSERT INTO user_roles (user_id, role) VALUES ($1, $2)")
                        .bind(id)
                        .bind(role)
                        .execute(&mut *tx)
                        .await?;
                }
            }
            tx.commit().await?;
        }

        let roles = self.roles_for(id).await?;
        Ok(UserDBResponse::from((roles, user)))
    }
}

impl<'c> Users<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    async fn roles_for(&mut self, user_id: UserId) -> Result<Vec<Role>> {
        let roles = sqlx::query_scalar::<_, Role>("SELECT role FROM user_roles WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(&mut *self.db)
            .await?;
        Ok(roles)
    }

    #[instrument(skip(self, email), err)]
    pub async fn get_user_by_email(&mut self, email: &str) -> Result<Option<UserDBResponse>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = $1 AND id != '00000000-0000-0000-0000-000000000000'")
            .bind(email)
            .fetch_optional(&mut *self.db)
            .await?;

        if let Some(user) = user {
            let roles = self.roles_for(user.id).await?;
            Ok(Some(UserDBResponse::from((roles, user))))
        } else {
            Ok(None)
        }
    }

    /// Look up the owner of a personal referral code
    #[instrument(skip(self, code), err)]
    pub async fn get_user_by_referral_code(&mut self, code: &str) -> Result<Option<UserDBResponse>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE referral_code = $1 AND id != '00000000-0000-0000-0000-000000000000'",
        )
        .bind(code)
        .fetch_optional(&mut *self.db)
        .await?;

        if let Some(user) = user {
            let roles = self.roles_for(user.id).await?;
            Ok(Some(UserDBResponse::from((roles, user))))
        } else {
            Ok(None)
        }
    }

    /// Fetch a user by email, provisioning one on first sight.
    ///
    /// Used by header-based auth where an upstream proxy has already verified
    /// the identity. The email doubles as the username so provisioning cannot
    /// collide on the username constraint. Two concurrent first requests can
    /// race on the insert; the loser re-reads the winner's row.
    #[instrument(skip(self, email, default_roles), fields(auth_source = %auth_source), err)]
    pub async fn find_or_provision(&mut self, email: &str, auth_source: &str, default_roles: &[Role]) -> Result<UserDBResponse> {
        if let Some(user) = self.get_user_by_email(email).await? {
            return Ok(user);
        }

        let request = UserCreateDBRequest {
            username: email.to_string(),
            email: email.to_string(),
            display_name: None,
            avatar_url: None,
            is_admin: false,
            roles: default_roles.to_vec(),
            auth_source: auth_source.to_string(),
            password_hash: None,
        };

        match self.create(&request).await {
            Ok(user) => Ok(user),
            Err(e) if e.is_unique_violation_on("users_email_key") => {
                self.get_user_by_email(email).await?.ok_or(DbError::NotFound)
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&id)), err)]
    pub async fn set_last_login(&mut self, id: UserId) -> Result<()> {
        sqlx::query("UPDATE users SET last_login = NOW() WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn count(&mut self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM users WHERE id != '00000000-0000-0000-0000-000000000000'",
        )
        .fetch_one(&mut *self.db)
        .await?;
        Ok(count)
    }
}
