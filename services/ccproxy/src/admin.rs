//! Admin API for account management.
//!
//! Runs on a separate listener port (default 9090), never exposed to the
//! same surface the proxy serves `/v1/messages` on.
//!
//! Endpoints:
//! - GET    /admin/accounts              — list accounts with status
//! - POST   /admin/accounts/init-oauth    — start PKCE flow, return auth URL
//! - POST   /admin/accounts/complete-oauth — exchange code, add account
//! - DELETE /admin/accounts/{id}          — remove an account
//! - GET    /admin/health                 — refresh-credential health report

use std::sync::Arc;

use account_store::{Account, AccountStore, Credential, Policy, RateLimit, Usage};
use anthropic_auth::OAuthSessionStore;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use common::time::now_ms;
use serde::Deserialize;
use token_manager::HealthMonitor;
use tracing::{info, warn};

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    store: AccountStore,
    oauth_sessions: Arc<OAuthSessionStore>,
    health_monitor: Arc<HealthMonitor>,
    http_client: reqwest::Client,
}

impl AdminState {
    pub fn new(store: AccountStore, health_monitor: Arc<HealthMonitor>, http_client: reqwest::Client) -> Self {
        Self {
            store,
            oauth_sessions: Arc::new(OAuthSessionStore::new()),
            health_monitor,
            http_client,
        }
    }
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/accounts", get(list_accounts))
        .route("/admin/accounts/init-oauth", post(init_oauth))
        .route("/admin/accounts/complete-oauth", post(complete_oauth))
        .route("/admin/accounts/{id}", delete(delete_account))
        .route("/admin/health", get(health_report))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> impl IntoResponse {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// GET /admin/accounts — never serializes `Credential`; only id, name,
/// provider, and the usage/rate-limit/policy summaries.
async fn list_accounts(State(state): State<AdminState>) -> impl IntoResponse {
    let accounts = match state.store.list_all().await {
        Ok(accounts) => accounts,
        Err(err) => {
            warn!(error = %common::redact::redact_error(&err), "failed to list accounts");
            return json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": "failed to list accounts" }),
            );
        }
    };

    let summaries: Vec<_> = accounts.iter().map(account_summary).collect();
    json_response(StatusCode::OK, serde_json::json!({ "accounts": summaries }))
}

fn account_summary(account: &Account) -> serde_json::Value {
    serde_json::json!({
        "id": account.id,
        "name": account.name,
        "provider": account.provider,
        "is_api_key": account.credential.is_api_key(),
        "paused": account.policy.paused,
        "auto_refresh_enabled": account.policy.auto_refresh_enabled,
        "priority": account.policy.priority,
        "request_count": account.usage.request_count,
        "rate_limited_until_ms": account.rate_limit.limited_until_ms,
        "tier": account.rate_limit.status_label,
    })
}

#[derive(Deserialize)]
struct InitOAuthRequest {
    account_name: String,
    #[serde(default = "default_mode")]
    mode: String,
}

fn default_mode() -> String {
    "max".to_string()
}

/// POST /admin/accounts/init-oauth — begin a PKCE flow and return its URL.
async fn init_oauth(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<InitOAuthRequest>,
) -> impl IntoResponse {
    let authorization_url = state.oauth_sessions.begin(&body.account_name, &body.mode);
    info!(account_name = body.account_name, "oauth flow initiated");

    json_response(
        StatusCode::OK,
        serde_json::json!({
            "authorization_url": authorization_url,
            "instructions": "Open the URL in a browser, authorize, then submit the callback's code and state to complete-oauth",
        }),
    )
}

#[derive(Deserialize)]
struct CompleteOAuthRequest {
    state: String,
    code: String,
}

/// POST /admin/accounts/complete-oauth — exchange the authorization code for
/// tokens and persist the account.
async fn complete_oauth(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<CompleteOAuthRequest>,
) -> impl IntoResponse {
    let session = match state.oauth_sessions.take(&body.state) {
        Ok(session) => session,
        Err(err) => {
            warn!(error = %common::redact::redact_error(&err), "oauth state validation failed");
            return json_response(
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": err.to_string() }),
            );
        }
    };

    // The callback's `code` parameter sometimes carries the state appended
    // after a `#`; the real authorization code is always the first segment.
    let authorization_code = body.code.split('#').next().unwrap_or(&body.code);

    let token_response =
        match anthropic_auth::exchange_code(&state.http_client, authorization_code, session.code_verifier.expose()).await {
            Ok(response) => response,
            Err(err) => {
                warn!(account_name = session.account_name, error = %common::redact::redact_error(&err), "token exchange failed");
                return json_response(
                    StatusCode::BAD_GATEWAY,
                    serde_json::json!({ "error": format!("token exchange failed: {err}") }),
                );
            }
        };

    let now = now_ms();
    let account = Account {
        id: uuid::Uuid::new_v4().to_string(),
        name: session.account_name.clone(),
        provider: "anthropic".to_string(),
        credential: Credential::OAuth {
            refresh_token: token_response.refresh_token,
            access_token: Some(token_response.access_token),
            expires_at_ms: Some(now + token_response.expires_in * 1000),
        },
        created_at_ms: Some(now),
        usage: Usage::default(),
        rate_limit: RateLimit::default(),
        policy: Policy::default(),
    };

    if let Err(err) = state.store.insert_account(&account).await {
        warn!(account_id = account.id, error = %common::redact::redact_error(&err), "failed to persist account");
        return json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": format!("failed to store account: {err}") }),
        );
    }

    info!(account_id = account.id, account_name = account.name, "account added");
    json_response(
        StatusCode::OK,
        serde_json::json!({ "account_id": account.id, "status": "added" }),
    )
}

/// DELETE /admin/accounts/{id} — idempotent: deleting a nonexistent account
/// still returns 200.
async fn delete_account(State(state): State<AdminState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.store.remove_account(&id).await {
        Ok(_) => {
            info!(account_id = id, "account removed");
            json_response(
                StatusCode::OK,
                serde_json::json!({ "account_id": id, "status": "removed" }),
            )
        }
        Err(err) => {
            warn!(account_id = id, error = %common::redact::redact_error(&err), "account removal failed");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": err.to_string() }),
            )
        }
    }
}

/// GET /admin/health — the most recent refresh-credential health report.
async fn health_report(State(state): State<AdminState>) -> impl IntoResponse {
    match state.health_monitor.last_report().await {
        Some(report) => json_response(StatusCode::OK, serde_json::to_value(report).unwrap_or_default()),
        None => json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({ "error": "health report not yet computed" }),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_state() -> AdminState {
        let store = AccountStore::connect_in_memory().await.unwrap();
        let health_monitor = HealthMonitor::new(store.clone(), token_manager::HealthThresholds::default());
        AdminState::new(store, health_monitor, reqwest::Client::new())
    }

    #[tokio::test]
    async fn list_accounts_empty_store() {
        let state = test_state().await;
        let app = build_admin_router(state);

        let response = app
            .oneshot(Request::builder().uri("/admin/accounts").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["accounts"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn list_accounts_never_exposes_credential() {
        let state = test_state().await;
        let account = Account {
            id: "acct-1".into(),
            name: "acct-1".into(),
            provider: "anthropic".into(),
            credential: Credential::OAuth {
                refresh_token: "rt-secret".into(),
                access_token: Some("at-secret".into()),
                expires_at_ms: Some(now_ms() + 1_000_000),
            },
            created_at_ms: Some(now_ms()),
            usage: Usage::default(),
            rate_limit: RateLimit::default(),
            policy: Policy::default(),
        };
        state.store.insert_account(&account).await.unwrap();
        let app = build_admin_router(state);

        let response = app
            .oneshot(Request::builder().uri("/admin/accounts").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(!text.contains("rt-secret"));
        assert!(!text.contains("at-secret"));
    }

    #[tokio::test]
    async fn init_oauth_returns_authorization_url() {
        let state = test_state().await;
        let app = build_admin_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/accounts/init-oauth")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::json!({ "account_name": "acct-1" }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["authorization_url"].as_str().unwrap().contains("state="));
    }

    #[tokio::test]
    async fn complete_oauth_without_init_returns_400() {
        let state = test_state().await;
        let app = build_admin_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/accounts/complete-oauth")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({ "state": "bogus", "code": "fake-code" }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_nonexistent_account_succeeds() {
        let state = test_state().await;
        let app = build_admin_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/admin/accounts/does-not-exist")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn delete_account_removes_it() {
        let state = test_state().await;
        let account = Account {
            id: "delete-me".into(),
            name: "delete-me".into(),
            provider: "anthropic".into(),
            credential: Credential::ApiKey { secret: "sk-1".into() },
            created_at_ms: Some(now_ms()),
            usage: Usage::default(),
            rate_limit: RateLimit::default(),
            policy: Policy::default(),
        };
        state.store.insert_account(&account).await.unwrap();
        let app = build_admin_router(state.clone());

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/admin/accounts/delete-me")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.store.find_by_id("delete-me").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn health_report_available_after_refresh() {
        let state = test_state().await;
        state.health_monitor.refresh().await;
        let app = build_admin_router(state);

        let response = app
            .oneshot(Request::builder().uri("/admin/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
