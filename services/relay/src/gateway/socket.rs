//! アップグレード済みのWebSocket1本分の処理
//!
//! 書き込みタスクが送信チャネルを順に流し、受信ループはクライアントが去るか
//! 接続が終了させられるまでテキストフレームをメッセージハンドラーへ渡す。

use std::net::IpAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::AppState;
use crate::domain::RelayMessage;
use crate::infrastructure::{Outbound, Tenant, WebSocketSender};

pub async fn serve(state: AppState, tenant: Tenant, ip: IpAddr, socket: WebSocket) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let connection = state.connect.open(tenant, ip, tx);
    let connection_id = connection.connection_id.clone();

    let writer = tokio::spawn(write_frames(sink, rx, connection_id.clone()));

    loop {
        let frame = tokio::select! {
            _ = connection.terminated() => break,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                if state.messages.handle(text.as_str(), &connection).await.is_err() {
                    break;
                }
            }
            Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => {
                    if state.messages.handle(text, &connection).await.is_err() {
                        break;
                    }
                }
                Err(_) => {
                    let notice = RelayMessage::notice("invalid: malformed note").to_json();
                    let _ = state.connections.send(&connection_id, &notice).await;
                }
            },
            Some(Ok(Message::Pong(_))) => connection.mark_alive(),
            // Pingへの応答はプロトコル層が返す
            Some(Ok(Message::Ping(_))) => {}
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(err)) => {
                debug!(connection_id = %connection_id, error = %err, "socket read failed");
                break;
            }
        }
    }

    state.disconnect.handle(&connection_id);
    // 最後の送信側が消えると書き込みタスクは止まる
    drop(connection);
    let _ = writer.await;
}

async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    connection_id: String,
) {
    while let Some(frame) = rx.recv().await {
        let (message, last) = match frame {
            Outbound::Text(text) => (Message::Text(text.into()), false),
            Outbound::Ping => (Message::Ping(Bytes::new()), false),
            Outbound::Close { code, reason } => (
                Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })),
                true,
            ),
        };
        if let Err(err) = sink.send(message).await {
            trace!(connection_id = %connection_id, error = %err, "socket write failed");
            return;
        }
        if last {
            break;
        }
    }
    let _ = sink.close().await;
}
