/// REQ / COUNT / CLOSE ハンドラー
///
/// サブスクリプションを登録し、保存済みイベントに続けてEOSEを送る。
/// NIP-45 のCOUNTにも応答する
use nostr::Filter;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::application::context::RelayContext;
use crate::domain::event_kind::PRIVATE_MESSAGE_KINDS;
use crate::domain::relay_message::error_prefix;
use crate::domain::{FilterEvaluator, FilterValidationError, LimitationConfig, RelayMessage};
use crate::infrastructure::{ConnectionState, WebSocketSender};

const PRIVATE_MESSAGES_NEED_AUTH: &str = "must authenticate to request private messages";

/// REQ / COUNT を拒否した理由。CLOSED応答は送信済み
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SubscriptionHandlerError {
    #[error("subscription id too long")]
    SubscriptionIdTooLong,

    #[error("no filters provided")]
    NoFilters,

    #[error("too many filters")]
    TooManyFilters,

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("authentication required")]
    AuthRequired,

    #[error("subscription limit reached")]
    SubscriptionLimit,

    #[error("query failed: {0}")]
    QueryFailed(String),
}

impl From<FilterValidationError> for SubscriptionHandlerError {
    fn from(err: FilterValidationError) -> Self {
        SubscriptionHandlerError::InvalidFilter(err.to_string())
    }
}

impl SubscriptionHandlerError {
    fn closed_message(&self, subscription_id: &str) -> RelayMessage {
        match self {
            SubscriptionHandlerError::SubscriptionIdTooLong
            | SubscriptionHandlerError::NoFilters
            | SubscriptionHandlerError::TooManyFilters => {
                RelayMessage::closed_unsupported(subscription_id, &self.to_string())
            }
            SubscriptionHandlerError::InvalidFilter(_) => {
                RelayMessage::closed_invalid(subscription_id, &self.to_string())
            }
            SubscriptionHandlerError::AuthRequired => RelayMessage::closed_with(
                subscription_id,
                error_prefix::AUTH_REQUIRED,
                PRIVATE_MESSAGES_NEED_AUTH,
            ),
            SubscriptionHandlerError::SubscriptionLimit | SubscriptionHandlerError::QueryFailed(_) => {
                RelayMessage::closed_error(subscription_id, &self.to_string())
            }
        }
    }
}

pub struct SubscriptionHandler<WS>
where
    WS: WebSocketSender,
{
    context: RelayContext,
    ws_sender: WS,
}

impl<WS> SubscriptionHandler<WS>
where
    WS: WebSocketSender,
{
    pub fn new(context: RelayContext, ws_sender: WS) -> Self {
        Self { context, ws_sender }
    }

    /// REQメッセージを処理
    ///
    /// # 処理フロー
    /// 1. subscription_id、フィルター数、フィルター内容の検証
    /// 2. テナントが認証必須なら、未認証の読み手にはDMのkindを拒否
    /// 3. 接続ごとのサブスクリプション上限 (同じIDの置き換えは数えない)
    /// 4. 登録後、REQタイムアウト内で新しい順にバックログを走査
    /// 5. 未配信のIDだけEVENTとして送り、最後にEOSE
    ///
    /// 走査がタイムアウトしてもEOSEで締め、リアルタイム配信は続ける
    pub async fn handle_req(
        &self,
        subscription_id: String,
        filter_values: Vec<Value>,
        connection: &ConnectionState,
    ) -> Result<(), SubscriptionHandlerError> {
        let connection_id = connection.connection_id.as_str();
        let tenant_id = connection.tenant.id.as_str();
        let limitation = connection.tenant.limitation.as_ref();

        let filters = self.prepare(&subscription_id, &filter_values, connection).await?;

        let subscriptions = &self.context.subscriptions;
        if !subscriptions.contains(connection_id, &subscription_id)
            && subscriptions.count(connection_id) >= limitation.max_subscriptions as usize
        {
            return Err(self
                .refuse(connection_id, &subscription_id, SubscriptionHandlerError::SubscriptionLimit)
                .await);
        }

        subscriptions.register(connection_id, tenant_id, &subscription_id, filters.clone());

        let store = self.context.pipeline.store();
        if store.can_discard_early(&filters) {
            trace!(connection_id, subscription_id = %subscription_id, "no possible backlog");
            self.send(connection_id, RelayMessage::eose(&subscription_id)).await;
            return Ok(());
        }

        let scan = self
            .context
            .pipeline
            .scan(filters, tenant_id, limitation.max_limit as usize);
        let events = match tokio::time::timeout(self.context.req_timeout, scan).await {
            Ok(Ok(events)) => events,
            Ok(Err(err)) => {
                error!(connection_id, subscription_id = %subscription_id, error = %err, "backlog scan failed");
                subscriptions.unregister(connection_id, &subscription_id);
                return Err(self
                    .refuse(
                        connection_id,
                        &subscription_id,
                        SubscriptionHandlerError::QueryFailed(err.to_string()),
                    )
                    .await);
            }
            Err(_) => {
                warn!(
                    connection_id,
                    subscription_id = %subscription_id,
                    timeout_ms = self.context.req_timeout.as_millis() as u64,
                    "backlog scan timed out"
                );
                Vec::new()
            }
        };

        let mut delivered = 0usize;
        for event in &events {
            if !subscriptions.claim_delivery(connection_id, &subscription_id, event.id) {
                // 途中でCLOSEされたか、リアルタイム配信で送信済み
                if !subscriptions.contains(connection_id, &subscription_id) {
                    debug!(connection_id, subscription_id = %subscription_id, "subscription closed during backlog");
                    return Ok(());
                }
                continue;
            }
            self.send(connection_id, RelayMessage::event(&subscription_id, event)).await;
            delivered += 1;
        }

        if subscriptions.contains(connection_id, &subscription_id) {
            self.send(connection_id, RelayMessage::eose(&subscription_id)).await;
        }
        debug!(
            connection_id,
            subscription_id = %subscription_id,
            matched = events.len(),
            delivered,
            "backlog sent"
        );
        Ok(())
    }

    /// COUNTメッセージを処理 (NIP-45)。登録は行わない
    pub async fn handle_count(
        &self,
        subscription_id: String,
        filter_values: Vec<Value>,
        connection: &ConnectionState,
    ) -> Result<(), SubscriptionHandlerError> {
        let connection_id = connection.connection_id.as_str();
        let filters = self.prepare(&subscription_id, &filter_values, connection).await?;

        let count = self.context.pipeline.count(filters, &connection.tenant.id);
        match tokio::time::timeout(self.context.req_timeout, count).await {
            Ok(Ok(count)) => {
                self.send(connection_id, RelayMessage::count(&subscription_id, count)).await;
                Ok(())
            }
            Ok(Err(err)) => {
                error!(connection_id, subscription_id = %subscription_id, error = %err, "count failed");
                Err(self
                    .refuse(
                        connection_id,
                        &subscription_id,
                        SubscriptionHandlerError::QueryFailed(err.to_string()),
                    )
                    .await)
            }
            Err(_) => Err(self
                .refuse(
                    connection_id,
                    &subscription_id,
                    SubscriptionHandlerError::QueryFailed("timed out".to_string()),
                )
                .await),
        }
    }

    /// CLOSEメッセージを処理。冪等で、常に空のCLOSEDを返す
    pub async fn handle_close(&self, subscription_id: String, connection: &ConnectionState) {
        let connection_id = connection.connection_id.as_str();
        let existed = self.context.subscriptions.unregister(connection_id, &subscription_id);
        debug!(connection_id, subscription_id = %subscription_id, existed, "subscription closed");
        self.send(connection_id, RelayMessage::closed(&subscription_id)).await;
    }

    /// REQとCOUNTに共通の検証。拒否時はCLOSED (必要ならAUTHも) を送る
    async fn prepare(
        &self,
        subscription_id: &str,
        filter_values: &[Value],
        connection: &ConnectionState,
    ) -> Result<Vec<Filter>, SubscriptionHandlerError> {
        let connection_id = connection.connection_id.as_str();
        let limitation = connection.tenant.limitation.as_ref();

        let checked = Self::validate(subscription_id, filter_values, limitation).and_then(|filters| {
            let wants_private = filters
                .iter()
                .any(|filter| FilterEvaluator::requests_any_kind(filter, &PRIVATE_MESSAGE_KINDS));
            if limitation.auth_required && wants_private && !connection.is_authenticated() {
                return Err(SubscriptionHandlerError::AuthRequired);
            }
            Ok(filters)
        });

        match checked {
            Ok(filters) => Ok(filters),
            Err(err) => {
                let auth_required = err == SubscriptionHandlerError::AuthRequired;
                let err = self.refuse(connection_id, subscription_id, err).await;
                if auth_required {
                    self.send(connection_id, RelayMessage::auth_challenge(&connection.challenge))
                        .await;
                }
                Err(err)
            }
        }
    }

    fn validate(
        subscription_id: &str,
        filter_values: &[Value],
        limitation: &LimitationConfig,
    ) -> Result<Vec<Filter>, SubscriptionHandlerError> {
        if subscription_id.chars().count() > limitation.max_subid_length as usize {
            return Err(SubscriptionHandlerError::SubscriptionIdTooLong);
        }
        if filter_values.is_empty() {
            return Err(SubscriptionHandlerError::NoFilters);
        }
        if filter_values.len() > limitation.max_filters as usize {
            return Err(SubscriptionHandlerError::TooManyFilters);
        }

        let mut filters = Vec::with_capacity(filter_values.len());
        for value in filter_values {
            let filter: Filter = serde_json::from_value(value.clone())
                .map_err(|e| SubscriptionHandlerError::InvalidFilter(e.to_string()))?;
            FilterEvaluator::validate_filter(&filter)?;
            filters.push(filter);
        }
        Ok(filters)
    }

    async fn refuse(
        &self,
        connection_id: &str,
        subscription_id: &str,
        err: SubscriptionHandlerError,
    ) -> SubscriptionHandlerError {
        debug!(connection_id, subscription_id, error = %err, "subscription refused");
        self.send(connection_id, err.closed_message(subscription_id)).await;
        err
    }

    async fn send(&self, connection_id: &str, message: RelayMessage) {
        if let Err(err) = self.ws_sender.send(connection_id, &message.to_json()).await {
            trace!(connection_id, error = %err, "reply dropped");
        }
    }
}
