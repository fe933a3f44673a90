//! 仓库层集成测试（Postgres）
//!
//! 需要可用的测试数据库：
//! TEST_DATABASE_URL=postgresql://... cargo test -- --ignored

use chrono::{Duration, Utc};
use exam_auth::{
    auth::registry::{RefreshTokenStore, TokenRegistry},
    config::SessionPolicy,
    models::{
        auth::{NewRefreshToken, RotateOutcome},
        user::NewUser,
    },
    repository::{AuthRepository, StoreError, UserRepository, UserStore},
};
use serial_test::serial;
use sqlx::PgPool;
use uuid::Uuid;

mod common;
use common::{create_test_config, setup_test_db};

async fn create_user(pool: &PgPool, username: &str) -> Uuid {
    UserRepository::new(pool.clone())
        .create(NewUser {
            username: username.to_string(),
            email: format!("{}@example.com", username),
            password_hash: "$argon2id$placeholder".to_string(),
            is_active: true,
            is_superuser: false,
        })
        .await
        .expect("Failed to create user")
        .id
}

fn new_token(user_id: Uuid, ttl: Duration) -> NewRefreshToken {
    let jti = Uuid::new_v4().simple().to_string();
    NewRefreshToken {
        token_hash: AuthRepository::hash_token(&jti),
        jti,
        user_id,
        expires_at: Utc::now() + ttl,
    }
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_user_repository_create_and_find() {
    let pool = setup_test_db(&create_test_config()).await;
    let repo = UserRepository::new(pool.clone());

    let id = create_user(&pool, "alice").await;

    let by_name = repo.find_by_username("alice").await.unwrap().unwrap();
    assert_eq!(by_name.id, id);
    assert!(by_name.is_active);

    let by_id = repo.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(by_id.email, "alice@example.com");

    assert!(repo.find_by_username("nobody").await.unwrap().is_none());
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_user_repository_duplicate_is_conflict() {
    let pool = setup_test_db(&create_test_config()).await;
    create_user(&pool, "alice").await;

    let result = UserRepository::new(pool)
        .create(NewUser {
            username: "alice".to_string(),
            email: "other@example.com".to_string(),
            password_hash: "x".to_string(),
            is_active: false,
            is_superuser: false,
        })
        .await;

    match result {
        Err(StoreError::Conflict(message)) => {
            assert_eq!(message, "Username or email already exists")
        }
        other => panic!("expected conflict, got {:?}", other.map(|u| u.id)),
    }
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_user_repository_status_and_password() {
    let pool = setup_test_db(&create_test_config()).await;
    let repo = UserRepository::new(pool.clone());
    let id = create_user(&pool, "alice").await;

    assert!(repo.set_active(id, false).await.unwrap());
    assert!(!repo.find_by_id(id).await.unwrap().unwrap().is_active);
    assert!(!repo.set_active(Uuid::new_v4(), true).await.unwrap());

    assert!(repo.update_password(id, "new-hash").await.unwrap());
    let user = repo.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(user.password_hash, "new-hash");
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_single_session_register_supersedes() {
    let pool = setup_test_db(&create_test_config()).await;
    let user_id = create_user(&pool, "alice").await;
    let repo = AuthRepository::new(pool, SessionPolicy::Single);

    let first = new_token(user_id, Duration::days(7));
    let second = new_token(user_id, Duration::days(7));

    assert!(repo.register(&first).await.unwrap().is_empty());
    assert_eq!(repo.register(&second).await.unwrap(), vec![first.jti.clone()]);

    assert!(!repo.is_active(&first.jti).await.unwrap());
    assert!(repo.is_active(&second.jti).await.unwrap());
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_rotate_is_single_use() {
    let pool = setup_test_db(&create_test_config()).await;
    let user_id = create_user(&pool, "alice").await;
    let repo = AuthRepository::new(pool, SessionPolicy::Multi);

    let original = new_token(user_id, Duration::days(7));
    repo.register(&original).await.unwrap();

    let first = new_token(user_id, Duration::days(7));
    let second = new_token(user_id, Duration::days(7));

    let outcome = repo
        .rotate(&original.jti, &original.token_hash, &first)
        .await
        .unwrap();
    assert_eq!(outcome, RotateOutcome::Rotated);

    let outcome = repo
        .rotate(&original.jti, &original.token_hash, &second)
        .await
        .unwrap();
    assert_eq!(outcome, RotateOutcome::NotActive);

    let record = repo.find(&original.jti).await.unwrap().unwrap();
    assert!(record.is_revoked);
    assert!(record.revoked_at.is_some());
    assert_eq!(record.replaced_by.as_deref(), Some(first.jti.as_str()));
    assert!(repo.find(&second.jti).await.unwrap().is_none());
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_revoke_all_and_purge() {
    let pool = setup_test_db(&create_test_config()).await;
    let user_id = create_user(&pool, "alice").await;
    let repo = AuthRepository::new(pool, SessionPolicy::Multi);

    repo.register(&new_token(user_id, Duration::days(7))).await.unwrap();
    repo.register(&new_token(user_id, Duration::days(7))).await.unwrap();
    repo.register(&new_token(user_id, Duration::seconds(-10))).await.unwrap();

    // 已过期但未撤销的记录同样被标记
    assert_eq!(repo.revoke_all_for_user(user_id).await.unwrap().len(), 3);
    assert!(repo.revoke_all_for_user(user_id).await.unwrap().is_empty());

    assert_eq!(repo.purge_expired().await.unwrap(), 1);
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_user_delete_cascades_tokens() {
    let pool = setup_test_db(&create_test_config()).await;
    let user_id = create_user(&pool, "alice").await;
    let tokens = AuthRepository::new(pool.clone(), SessionPolicy::Multi);

    let token = new_token(user_id, Duration::days(7));
    tokens.register(&token).await.unwrap();

    assert!(UserRepository::new(pool).delete(user_id).await.unwrap());
    assert!(tokens.find(&token.jti).await.unwrap().is_none());
}
