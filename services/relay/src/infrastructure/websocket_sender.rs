/// WebSocketの送信フレーム
///
/// ソケットごとに順序付きの送信チャネルを1本持ち、単一の書き込みタスクが
/// 流す。ハンドラーからは [`WebSocketSender`] だけが見える
use async_trait::async_trait;
use thiserror::Error;

/// クローズコード: ポリシー違反
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// クローズコード: メッセージが大きすぎる
pub const CLOSE_MESSAGE_TOO_BIG: u16 = 1009;
/// クローズコード: 離脱 (ハートビートのタイムアウト、シャットダウン)
pub const CLOSE_GOING_AWAY: u16 = 1001;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SendError {
    /// 不明な接続、または書き込みタスクが停止済み
    #[error("Connection is gone")]
    ConnectionGone,

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// 書き込みタスクに渡すフレーム
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Ping,
    Close { code: u16, reason: String },
}

#[async_trait]
pub trait WebSocketSender: Send + Sync {
    /// テキストフレームを積む。同じ接続のフレームは順序を保つ
    async fn send(&self, connection_id: &str, message: &str) -> Result<(), SendError>;

    /// クローズフレームを積み、接続を止める
    async fn close(&self, connection_id: &str, code: u16, reason: &str) -> Result<(), SendError>;

    async fn broadcast(
        &self,
        connection_ids: &[String],
        message: &str,
    ) -> Vec<(String, Result<(), SendError>)> {
        let mut results = Vec::with_capacity(connection_ids.len());
        for connection_id in connection_ids {
            let result = self.send(connection_id, message).await;
            results.push((connection_id.clone(), result));
        }
        results
    }
}
