//! HTTP / WebSocket の入り口
//!
//! `GET /` はNIP-11ドキュメントを返すか、リレープロトコルへアップグレードする。
//! `OPTIONS /` はCORSのプリフライトに答え、`GET /status` は稼働状況を返す。

pub mod client_ip;
pub mod error;
pub mod heartbeat;
pub mod socket;
pub mod status_auth;

use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::header::HOST;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{middleware, Json, Router};
use tracing::warn;

use crate::application::{
    wants_relay_info, ConnectHandler, DisconnectHandler, MessageHandler, Nip11Handler, RelayContext,
    RelayStatus, StatusHandler,
};
use crate::infrastructure::subscription_registry::DEFAULT_DELIVERED_CAPACITY;
use crate::infrastructure::{
    ConnectionRegistry, EngineConfig, EventStore, ModerationQueue, PluginChain, ReputationService,
    SubscriptionRegistry, TaskPipeline, TenantResolver,
};

pub use client_ip::ClientIp;
pub use error::ApiError;
pub use heartbeat::spawn_heartbeat;
pub use status_auth::{status_auth_middleware, StatusAuth};

pub const PLAIN_TEXT_GREETING: &str = "Please use a Nostr client to connect.";

/// 全リクエストで共有するサービス
#[derive(Clone)]
pub struct AppState {
    pub connect: Arc<ConnectHandler>,
    pub disconnect: Arc<DisconnectHandler>,
    pub messages: Arc<MessageHandler<ConnectionRegistry>>,
    pub status: Arc<StatusHandler>,
    pub connections: ConnectionRegistry,
    pub pipeline: Arc<TaskPipeline>,
}

impl AppState {
    /// ストア、タスクパイプライン、各ハンドラーを組み立てる。tokioランタイム内で呼ぶこと
    pub fn new(
        config: &EngineConfig,
        tenants: Arc<dyn TenantResolver>,
        reputation: Arc<dyn ReputationService>,
        moderation: Arc<dyn ModerationQueue>,
        plugins: PluginChain,
    ) -> Self {
        let store = Arc::new(EventStore::new(config.store));
        let pipeline = Arc::new(TaskPipeline::new(store, config.pipeline));
        let subscriptions = Arc::new(SubscriptionRegistry::new(DEFAULT_DELIVERED_CAPACITY));
        let connections = ConnectionRegistry::new();

        let context = RelayContext::new(
            pipeline.clone(),
            subscriptions.clone(),
            reputation.clone(),
            moderation,
            Arc::new(plugins),
            config,
        );

        Self {
            connect: Arc::new(ConnectHandler::new(tenants, reputation, connections.clone())),
            disconnect: Arc::new(DisconnectHandler::new(connections.clone(), subscriptions)),
            messages: Arc::new(MessageHandler::new(context, connections.clone())),
            status: Arc::new(StatusHandler::new(connections.clone(), pipeline.clone())),
            connections,
            pipeline,
        }
    }
}

pub fn router(state: AppState, status_token: Option<String>) -> Router {
    let status_routes = Router::new()
        .route("/status", get(status))
        .route_layer(middleware::from_fn_with_state(
            StatusAuth::new(status_token),
            status_auth_middleware,
        ));

    Router::new()
        .route("/", get(root).options(preflight))
        .merge(status_routes)
        .with_state(state)
}

async fn root(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let host = headers.get(HOST).and_then(|h| h.to_str().ok());

    match upgrade {
        Ok(ws) => match state.connect.admit(host, ip).await {
            Ok(tenant) => ws.on_upgrade(move |upgraded| socket::serve(state, tenant, ip, upgraded)),
            Err(err) => {
                warn!(ip = %ip, host = host.unwrap_or_default(), error = %err, "upgrade refused");
                ApiError::from(err).into_response()
            }
        },
        Err(_) if wants_relay_info(&headers) => match state.connect.resolve_tenant(host).await {
            Ok(tenant) => Nip11Handler::new(&tenant).handle(),
            Err(err) => ApiError::from(err).into_response(),
        },
        Err(_) => PLAIN_TEXT_GREETING.into_response(),
    }
}

async fn preflight() -> Response {
    Nip11Handler::handle_options()
}

async fn status(State(state): State<AppState>) -> Json<RelayStatus> {
    Json(state.status.status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::nip11_handler::NOSTR_JSON;
    use crate::domain::LimitationConfig;
    use crate::infrastructure::{NoopModeration, RelayInfoConfig, StaticReputation, StaticTenantResolver};
    use axum::body::{to_bytes, Body};
    use axum::http::header::{ACCEPT, ACCESS_CONTROL_ALLOW_ORIGIN, AUTHORIZATION, CONTENT_TYPE};
    use axum::http::{Method, Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    fn app(status_token: Option<&str>) -> Router {
        let resolver = StaticTenantResolver::new(
            vec!["relay.example.com".to_string()],
            LimitationConfig::default(),
            RelayInfoConfig {
                name: Some("Example".to_string()),
                ..Default::default()
            },
        );
        let state = AppState::new(
            &EngineConfig::default(),
            Arc::new(resolver),
            Arc::new(StaticReputation::default()),
            Arc::new(NoopModeration),
            PluginChain::new(),
        );
        router(state, status_token.map(str::to_string))
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
    }

    // ==================== NIP-11 テスト ====================

    #[tokio::test]
    async fn test_relay_info_document() {
        let request = Request::builder()
            .uri("/")
            .header(HOST, "relay.example.com")
            .header(ACCEPT, NOSTR_JSON)
            .body(Body::empty())
            .unwrap();

        let response = app(None).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], NOSTR_JSON);
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        let json: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(json["name"], "Example");
        assert!(json["limitation"].is_object());
    }

    #[tokio::test]
    async fn test_relay_info_for_unknown_host_is_forbidden() {
        let request = Request::builder()
            .uri("/")
            .header(HOST, "other.example.com")
            .header(ACCEPT, NOSTR_JSON)
            .body(Body::empty())
            .unwrap();

        let response = app(None).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let json: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(json["error"], "forbidden");
    }

    #[tokio::test]
    async fn test_preflight() {
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/")
            .body(Body::empty())
            .unwrap();

        let response = app(None).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }

    #[tokio::test]
    async fn test_plain_get_greets() {
        let request = Request::builder()
            .uri("/")
            .header(HOST, "relay.example.com")
            .body(Body::empty())
            .unwrap();

        let response = app(None).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, PLAIN_TEXT_GREETING.as_bytes());
    }

    // ==================== /status テスト ====================

    #[tokio::test]
    async fn test_status_document() {
        let request = Request::builder().uri("/status").body(Body::empty()).unwrap();

        let response = app(None).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(json["websocketConnections"], 0);
        assert_eq!(json["queueLength"], 0);
    }

    #[tokio::test]
    async fn test_status_requires_configured_token() {
        let denied = Request::builder().uri("/status").body(Body::empty()).unwrap();
        let response = app(Some("secret")).oneshot(denied).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let allowed = Request::builder()
            .uri("/status")
            .header(AUTHORIZATION, "Bearer secret")
            .body(Body::empty())
            .unwrap();
        let response = app(Some("secret")).oneshot(allowed).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
