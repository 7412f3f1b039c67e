/// 接続の受け入れと初期化
///
/// WebSocketアップグレード前にテナントとIPレピュテーションを確認し、
/// アップグレード直後に接続状態とNIP-42チャレンジを用意する
use std::net::IpAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::domain::RelayMessage;
use crate::infrastructure::connection_registry::next_connection_id;
use crate::infrastructure::tenant_config::normalize_host;
use crate::infrastructure::{
    ConnectionRegistry, ConnectionState, Outbound, ReputationService, Tenant, TenantResolver,
};

/// プロトコル状態を作る前にHTTP 403で返す拒否理由
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectHandlerError {
    #[error("missing Host header")]
    MissingHost,

    #[error("unknown relay host: {0}")]
    UnknownHost(String),

    #[error("relay is disabled for {0}")]
    RelayDisabled(String),

    #[error("{0}")]
    Banned(String),
}

pub struct ConnectHandler {
    tenants: Arc<dyn TenantResolver>,
    reputation: Arc<dyn ReputationService>,
    connections: ConnectionRegistry,
}

impl ConnectHandler {
    pub fn new(
        tenants: Arc<dyn TenantResolver>,
        reputation: Arc<dyn ReputationService>,
        connections: ConnectionRegistry,
    ) -> Self {
        Self {
            tenants,
            reputation,
            connections,
        }
    }

    /// `host` を担当するテナントを解決する。無効化されたテナントは拒否
    pub async fn resolve_tenant(&self, host: Option<&str>) -> Result<Tenant, ConnectHandlerError> {
        let host = host
            .map(normalize_host)
            .filter(|h| !h.is_empty())
            .ok_or(ConnectHandlerError::MissingHost)?;

        let tenant = self
            .tenants
            .resolve(&host)
            .await
            .ok_or_else(|| ConnectHandlerError::UnknownHost(host.clone()))?;

        if !tenant.relay_enabled {
            return Err(ConnectHandlerError::RelayDisabled(tenant.id));
        }
        Ok(tenant)
    }

    /// アップグレード要求に対するテナントとIPレピュテーションの確認
    pub async fn admit(&self, host: Option<&str>, ip: IpAddr) -> Result<Tenant, ConnectHandlerError> {
        let tenant = self.resolve_tenant(host).await?;

        let reputation = self.reputation.is_allowed(ip, &tenant.id).await;
        if reputation.banned {
            let comments = reputation.comments.join(", ");
            debug!(ip = %ip, tenant = %tenant.id, reason = %comments, "upgrade refused");
            return Err(ConnectHandlerError::Banned(comments));
        }
        Ok(tenant)
    }

    /// アップグレード済みソケットを登録し、最初のフレームとして
    /// AUTHチャレンジを積む
    pub fn open(
        &self,
        tenant: Tenant,
        ip: IpAddr,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Arc<ConnectionState> {
        let state = Arc::new(ConnectionState::new(next_connection_id(), tenant, ip, outbound));
        self.connections.register(state.clone());

        let challenge = RelayMessage::auth_challenge(&state.challenge).to_json();
        let _ = state.push(Outbound::Text(challenge));

        info!(
            connection_id = %state.connection_id,
            tenant = %state.tenant.id,
            ip = %ip,
            "connection opened"
        );
        state
    }
}
