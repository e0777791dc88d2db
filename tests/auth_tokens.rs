//! Token lifecycle against the in-memory auth store: login, refresh
//! rotation, revocation, and scope checks.

use std::sync::Arc;
use tablerag::auth::store::{AuthStore, MemoryAuthStore, UserRecord};
use tablerag::auth::{AuthService, hash_password};
use tablerag::config::Config;
use tablerag::error::TableRagError;

fn test_config() -> Config {
    let toml_str = r#"
        [service]
        bind = "127.0.0.1:12321"
        meta_base_url = "http://127.0.0.1:12321/api/v1"
        prompt_dir = "prompts"
        session_dir = "sessions"

        [graph]
        url = "ws://127.0.0.1:8000"
        ns = "tablerag"
        db = "meta"

        [llm]
        embed_model = "embedder"
        extend_model = "extender"
        filter_model = "filterer"
        embed_retries = 1
        embed_dimensions = 1024

        [llm.models.embedder]
        base_url = "http://127.0.0.1:9000/v1"
        model = "bge-large-zh-v1.5"

        [llm.models.extender]
        base_url = "http://127.0.0.1:9001/v1"
        model = "qwen-plus"

        [llm.models.filterer]
        base_url = "http://127.0.0.1:9001/v1"
        model = "qwen-plus"

        [auth]
        algorithm = "HS256"
        access_ttl_minutes = 30
        refresh_ttl_days = 7
        utc_offset_hours = 8

        [auth.database]
        db_type = "mysql"
        host = "127.0.0.1"
        port = 3306
        user = "auth"
        password = "auth"
        database = "auth"

        [pipeline]
        max_tb_num = 5
        max_col_per_tb = 8
        state_backend = "file"
    "#;
    let mut config: Config = toml::from_str(toml_str).unwrap();
    config.runtime.secret_key = "test-secret-key".to_string();
    config
}

async fn service_with_user(scopes: &[&str]) -> (AuthService, Arc<MemoryAuthStore>) {
    let store = Arc::new(MemoryAuthStore::default());
    store.users.lock().await.insert(
        "alice".to_string(),
        UserRecord {
            name: "alice".to_string(),
            hashed_password: hash_password("correct horse").unwrap(),
            active: true,
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
        },
    );
    let service = AuthService::new(store.clone() as Arc<dyn AuthStore>, &test_config()).unwrap();
    (service, store)
}

#[tokio::test]
async fn login_returns_bearer_pair() {
    let (service, _) = service_with_user(&["get_table"]).await;
    let pair = service.login("alice", "correct horse", "127.0.0.1").await.unwrap();
    assert_eq!(pair.token_type, "bearer");
    assert!(!pair.access_token.is_empty());
    assert!(!pair.refresh_token.is_empty());
    // Access token carries the user's scopes
    service.authorize(&pair.access_token, &["get_table"]).unwrap();
}

#[tokio::test]
async fn login_rejects_wrong_password_and_unknown_user() {
    let (service, _) = service_with_user(&[]).await;
    let err = service.login("alice", "wrong", "127.0.0.1").await.unwrap_err();
    assert!(matches!(err, TableRagError::Unauthorized { .. }));
    let err = service.login("nobody", "whatever", "127.0.0.1").await.unwrap_err();
    assert!(matches!(err, TableRagError::Unauthorized { .. }));
}

#[tokio::test]
async fn login_rejects_inactive_user() {
    let (service, store) = service_with_user(&[]).await;
    store.users.lock().await.get_mut("alice").unwrap().active = false;
    let err = service
        .login("alice", "correct horse", "127.0.0.1")
        .await
        .unwrap_err();
    assert!(matches!(err, TableRagError::Forbidden { .. }));
}

#[tokio::test]
async fn refresh_rotates_and_revokes_the_old_token() {
    let (service, _) = service_with_user(&["get_table", "retrieve_column"]).await;
    let pair0 = service.login("alice", "correct horse", "127.0.0.1").await.unwrap();

    let pair1 = service
        .refresh(&pair0.refresh_token, vec![], "127.0.0.1")
        .await
        .unwrap();
    assert_ne!(pair0.refresh_token, pair1.refresh_token);

    // The old refresh token is revoked: a second use fails with 401
    let err = service
        .refresh(&pair0.refresh_token, vec![], "127.0.0.1")
        .await
        .unwrap_err();
    assert!(matches!(err, TableRagError::Unauthorized { .. }));

    // The rotated token still works
    service
        .refresh(&pair1.refresh_token, vec![], "127.0.0.1")
        .await
        .unwrap();
}

#[tokio::test]
async fn refresh_rejects_scope_supersets() {
    let (service, _) = service_with_user(&["get_table"]).await;
    let pair = service.login("alice", "correct horse", "127.0.0.1").await.unwrap();
    let err = service
        .refresh(
            &pair.refresh_token,
            vec!["get_table".into(), "clear_metadata".into()],
            "127.0.0.1",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TableRagError::Forbidden { .. }));
}

#[tokio::test]
async fn refresh_narrows_access_scopes_to_the_request() {
    let (service, _) = service_with_user(&["get_table", "retrieve_column"]).await;
    let pair = service.login("alice", "correct horse", "127.0.0.1").await.unwrap();
    let narrowed = service
        .refresh(&pair.refresh_token, vec!["get_table".into()], "127.0.0.1")
        .await
        .unwrap();
    service.authorize(&narrowed.access_token, &["get_table"]).unwrap();
    let err = service
        .authorize(&narrowed.access_token, &["retrieve_column"])
        .unwrap_err();
    assert!(matches!(err, TableRagError::Forbidden { .. }));
    // But the rotated refresh token keeps the full scope set
    let restored = service
        .refresh(
            &narrowed.refresh_token,
            vec!["retrieve_column".into()],
            "127.0.0.1",
        )
        .await
        .unwrap();
    service
        .authorize(&restored.access_token, &["retrieve_column"])
        .unwrap();
}

#[tokio::test]
async fn logout_revokes_the_refresh_token() {
    let (service, _) = service_with_user(&["get_table"]).await;
    let pair = service.login("alice", "correct horse", "127.0.0.1").await.unwrap();
    service.logout(&pair.refresh_token, "127.0.0.1").await.unwrap();
    let err = service
        .refresh(&pair.refresh_token, vec![], "127.0.0.1")
        .await
        .unwrap_err();
    assert!(matches!(err, TableRagError::Unauthorized { .. }));
}

#[tokio::test]
async fn authorize_reports_the_required_scope_challenge() {
    let (service, _) = service_with_user(&["get_table"]).await;
    let pair = service.login("alice", "correct horse", "127.0.0.1").await.unwrap();
    let err = service
        .authorize(&pair.access_token, &["clear_metadata"])
        .unwrap_err();
    match err {
        TableRagError::Forbidden { challenge, .. } => {
            assert_eq!(challenge, "Bearer scope=\"clear_metadata\"");
        }
        other => panic!("expected Forbidden, got {other:?}"),
    }
}

#[tokio::test]
async fn garbage_tokens_are_unauthorized() {
    let (service, _) = service_with_user(&[]).await;
    assert!(matches!(
        service.authorize("not-a-token", &[]),
        Err(TableRagError::Unauthorized { .. })
    ));
    assert!(matches!(
        service.refresh("not-a-token", vec![], "127.0.0.1").await,
        Err(TableRagError::Unauthorized { .. })
    ));
}
