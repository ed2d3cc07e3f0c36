//! Test utilities for integration testing (available with `test-utils` feature).

use crate::api::models::users::{Role, UserResponse};
use crate::config::{
    BillingConfig, DummyBillingConfig, JobPricingConfig, NativeAuthConfig, PasswordConfig, ProxyHeaderAuthConfig,
    ReconciliationConfig,
};
use crate::db::handlers::{Repository, Users};
use crate::db::models::users::UserCreateDBRequest;
use axum_test::TestServer;
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

pub async fn create_test_app(pool: PgPool) -> (TestServer, crate::BackgroundServices) {
    create_test_app_with_config(pool, create_test_config()).await
}

pub async fn create_test_app_with_config(pool: PgPool, config: crate::config::Config) -> (TestServer, crate::BackgroundServices) {
    let app = crate::Application::new_with_pool(config, Some(pool))
        .await
        .expect("Failed to create application");

    app.into_test_server()
}

pub fn create_test_config() -> crate::config::Config {
    crate::config::Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        admin_email: "admin@test.com".to_string(),
        admin_password: None,
        secret_key: Some("test-secret-key-for-testing-only".to_string()),
        auth: crate::config::AuthConfig {
            native: NativeAuthConfig {
                enabled: true,
                allow_registration: true,
                password: PasswordConfig {
                    // Weak parameters so hashing doesn't dominate test time
                    argon2_memory_kib: 128,
                    argon2_iterations: 1,
                    argon2_parallelism: 1,
                    ..Default::default()
                },
                ..Default::default()
            },
            proxy_header: ProxyHeaderAuthConfig {
                enabled: true,
                ..Default::default()
            },
            ..Default::default()
        },
        billing: Some(BillingConfig::Dummy(DummyBillingConfig {
            webhook_secret: crate::billing::TEST_WEBHOOK_SECRET.to_string(),
            checkout_amount: Decimal::new(50, 0),
            timestamp_tolerance: std::time::Duration::from_secs(300),
            portal_url: None,
        })),
        credits: crate::config::CreditsConfig {
            plan_catalog: std::collections::HashMap::from([
                ("starter".to_string(), Decimal::new(100, 0)),
                ("pro".to_string(), Decimal::new(300, 0)),
            ]),
            jobs: JobPricingConfig {
                kinds: std::collections::HashMap::from([("staging".to_string(), Decimal::new(5, 0))]),
                ..Default::default()
            },
            ..Default::default()
        },
        reconciliation: ReconciliationConfig {
            // Sweeps run on demand in tests; the loop would race assertions
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub async fn create_test_user(pool: &PgPool, role: Role) -> UserResponse {
    let mut conn = pool.acquire().await.expect("Failed to acquire connection");
    let mut users_repo = Users::new(&mut conn);
    let user_id = Uuid::new_v4();
    let username = format!("testuser_{}", user_id.simple());
    let email = format!("{username}@example.com");

    let user_create = UserCreateDBRequest {
        username: username.clone(),
        email,
        display_name: Some("Test User".to_string()),
        avatar_url: None,
        is_admin: false,
        roles: vec![role],
        auth_source: "test".to_string(),
        password_hash: None,
    };

    let user = users_repo.create(&user_create).await.expect("Failed to create test user");
    UserResponse::from(user)
}

pub async fn create_test_admin_user(pool: &PgPool) -> UserResponse {
    let mut conn = pool.acquire().await.expect("Failed to acquire connection");
    let mut users_repo = Users::new(&mut conn);
    let user_id = Uuid::new_v4();
    let username = format!("testadmin_{}", user_id.simple());
    let email = format!("{username}@example.com");

    let user_create = UserCreateDBRequest {
        username: username.clone(),
        email,
        display_name: Some("Test Admin User".to_string()),
        avatar_url: None,
        is_admin: true,
        roles: vec![Role::PlatformManager],
        auth_source: "test".to_string(),
        password_hash: None,
    };

    let user = users_repo.create(&user_create).await.expect("Failed to create test admin user");
    UserResponse::from(user)
}

/// Headers that authenticate `user` through the proxy-header path.
pub fn add_auth_headers(user: &UserResponse) -> Vec<(String, String)> {
    let config = ProxyHeaderAuthConfig::default();
    vec![(config.header_name, user.email.clone())]
}
