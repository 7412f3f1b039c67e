/// 受信フレームのディスパッチャー
///
/// フレームごとにサイズ、レピュテーション、キュー深さを確認してからパースし、
/// EVENT / REQ・COUNT・CLOSE / AUTH の各ハンドラーへ振り分ける。
/// 不正なフレームにはNOTICEを返し、接続は維持する
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::application::context::RelayContext;
use crate::application::{
    AuthHandler, ClientMessage, EventHandler, MessageParser, ParseError, SubscriptionHandler,
};
use crate::domain::RelayMessage;
use crate::infrastructure::websocket_sender::{CLOSE_MESSAGE_TOO_BIG, CLOSE_POLICY_VIOLATION};
use crate::infrastructure::{ConnectionState, WebSocketSender};

/// 接続を閉じる条件。NOTICEとクローズフレームは送信キューに積み済み
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageHandlerError {
    #[error("message too large: {size} > {limit}")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("banned: {0}")]
    Banned(String),

    #[error("relay queue limit reached: {0}")]
    QueueLimit(usize),
}

pub struct MessageHandler<WS>
where
    WS: WebSocketSender + Clone,
{
    context: RelayContext,
    event_handler: EventHandler<WS>,
    subscription_handler: SubscriptionHandler<WS>,
    auth_handler: AuthHandler<WS>,
    ws_sender: WS,
}

impl<WS> MessageHandler<WS>
where
    WS: WebSocketSender + Clone,
{
    pub fn new(context: RelayContext, ws_sender: WS) -> Self {
        Self {
            event_handler: EventHandler::new(context.clone(), ws_sender.clone()),
            subscription_handler: SubscriptionHandler::new(context.clone(), ws_sender.clone()),
            auth_handler: AuthHandler::new(context.clone(), ws_sender.clone()),
            context,
            ws_sender,
        }
    }

    pub fn context(&self) -> &RelayContext {
        &self.context
    }

    /// `connection` から届いたテキストフレームを1つ処理する
    pub async fn handle(&self, text: &str, connection: &ConnectionState) -> Result<(), MessageHandlerError> {
        let connection_id = connection.connection_id.as_str();

        let limit = connection.tenant.limitation.max_message_length as usize;
        if text.len() > limit {
            return Err(self
                .reject(
                    connection_id,
                    RelayMessage::notice_error("message too large"),
                    CLOSE_MESSAGE_TOO_BIG,
                    MessageHandlerError::MessageTooLarge {
                        size: text.len(),
                        limit,
                    },
                )
                .await);
        }

        let reputation = self.context.reputation.check_message(connection.ip).await;
        if reputation.banned {
            let comments = reputation.comments.join(", ");
            return Err(self
                .reject(
                    connection_id,
                    RelayMessage::notice(comments.clone()),
                    CLOSE_POLICY_VIOLATION,
                    MessageHandlerError::Banned(comments),
                )
                .await);
        }

        let queue_length = self.context.pipeline.queue_length();
        if queue_length > self.context.max_queue_length {
            return Err(self
                .reject(
                    connection_id,
                    RelayMessage::notice_error("relay queue limit reached"),
                    CLOSE_MESSAGE_TOO_BIG,
                    MessageHandlerError::QueueLimit(queue_length),
                )
                .await);
        }

        let message = match MessageParser::parse(text) {
            Ok(message) => message,
            Err(err) => {
                debug!(connection_id, error = %err, "unparsable frame");
                self.send(connection_id, Self::parse_error_notice(&err)).await;
                return Ok(());
            }
        };
        trace!(connection_id, kind = message.kind(), "frame received");

        match message {
            ClientMessage::Event(event_json) => {
                let reply = self.event_handler.handle(event_json, connection).await;
                self.send(connection_id, reply).await;
            }
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                // 拒否時のCLOSEDは送信済み
                let _ = self
                    .subscription_handler
                    .handle_req(subscription_id, filters, connection)
                    .await;
            }
            ClientMessage::Count {
                subscription_id,
                filters,
            } => {
                let _ = self
                    .subscription_handler
                    .handle_count(subscription_id, filters, connection)
                    .await;
            }
            ClientMessage::Close { subscription_id } => {
                self.subscription_handler
                    .handle_close(subscription_id, connection)
                    .await;
            }
            ClientMessage::Auth(auth_json) => {
                let _ = self.auth_handler.handle(auth_json, connection).await;
            }
        }

        Ok(())
    }

    fn parse_error_notice(err: &ParseError) -> RelayMessage {
        match err {
            ParseError::UnknownMessageType(_) => RelayMessage::notice_error("unknown command"),
            ParseError::InvalidSubscriptionId => RelayMessage::notice_error("invalid subscription ID"),
            _ => RelayMessage::notice("invalid: malformed note"),
        }
    }

    async fn reject(
        &self,
        connection_id: &str,
        notice: RelayMessage,
        code: u16,
        err: MessageHandlerError,
    ) -> MessageHandlerError {
        warn!(connection_id, error = %err, code, "closing connection");
        self.send(connection_id, notice).await;
        let _ = self.ws_sender.close(connection_id, code, &err.to_string()).await;
        err
    }

    async fn send(&self, connection_id: &str, message: RelayMessage) {
        if let Err(err) = self.ws_sender.send(connection_id, &message.to_json()).await {
            trace!(connection_id, error = %err, "reply dropped");
        }
    }
}
