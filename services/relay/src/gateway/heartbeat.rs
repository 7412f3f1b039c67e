//! 生存確認
//!
//! 周期ごとに全ソケットへPingを送る。前回のPingに応答しなかったソケットには
//! NOTICEを送り、1001で閉じる。

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::domain::RelayMessage;
use crate::infrastructure::websocket_sender::CLOSE_GOING_AWAY;
use crate::infrastructure::{ConnectionRegistry, Outbound};

/// 1回分の確認。切断した接続数を返す
pub fn sweep(connections: &ConnectionRegistry) -> usize {
    let mut terminated = 0;
    for state in connections.snapshot() {
        if state.take_alive() {
            let _ = state.push(Outbound::Ping);
            continue;
        }
        debug!(connection_id = %state.connection_id, "heartbeat missed");
        let _ = state.push(Outbound::Text(
            RelayMessage::notice_error("heartbeat timeout").to_json(),
        ));
        state.terminate(CLOSE_GOING_AWAY, "heartbeat timeout");
        terminated += 1;
    }
    terminated
}

pub fn spawn_heartbeat(connections: ConnectionRegistry, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // 最初のtickは即座に完了する
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let terminated = sweep(&connections);
            if terminated > 0 {
                info!(terminated, open = connections.len(), "stale connections closed");
            }
        }
    })
}
