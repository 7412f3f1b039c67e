/// AUTHハンドラー (NIP-42)
///
/// 成功時は接続を認証済みにするだけで何も送らない。失敗はNOTICEで通知する
use nostr::Timestamp;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::application::context::RelayContext;
use crate::domain::{AuthError, AuthValidator, EventValidator, RelayMessage};
use crate::infrastructure::{ConnectionState, WebSocketSender};

pub struct AuthHandler<WS>
where
    WS: WebSocketSender,
{
    context: RelayContext,
    ws_sender: WS,
}

impl<WS> AuthHandler<WS>
where
    WS: WebSocketSender,
{
    pub fn new(context: RelayContext, ws_sender: WS) -> Self {
        Self { context, ws_sender }
    }

    pub async fn handle(&self, auth_json: Value, connection: &ConnectionState) -> Result<(), AuthError> {
        let connection_id = connection.connection_id.as_str();

        let result = self.authenticate(auth_json, connection).await;
        match &result {
            Ok(pubkey) => {
                connection.authenticate(*pubkey);
                info!(connection_id, pubkey = %pubkey, "connection authenticated");
            }
            Err(err) => {
                debug!(connection_id, error = %err, "AUTH refused");
                let notice = RelayMessage::notice_error(&err.to_string());
                let _ = self.ws_sender.send(connection_id, &notice.to_json()).await;
            }
        }
        result.map(|_| ())
    }

    async fn authenticate(
        &self,
        auth_json: Value,
        connection: &ConnectionState,
    ) -> Result<nostr::PublicKey, AuthError> {
        let event = EventValidator::parse(&auth_json)?;
        AuthValidator::check_claims(
            &event,
            &connection.challenge,
            &connection.tenant.id,
            Timestamp::now().as_secs(),
        )?;

        let pubkey = event.pubkey;
        let verify = self.context.pipeline.verify(event);
        match tokio::time::timeout(self.context.auth_timeout, verify).await {
            Ok(Ok(verified)) => verified.map(|()| pubkey).map_err(AuthError::from),
            Ok(Err(err)) => {
                warn!(connection_id = %connection.connection_id, error = %err, "AUTH verification unavailable");
                Err(AuthError::Unverified)
            }
            Err(_) => {
                warn!(connection_id = %connection.connection_id, "AUTH verification timed out");
                Err(AuthError::Unverified)
            }
        }
    }
}
