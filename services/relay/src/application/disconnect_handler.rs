/// ソケット切断時の後片付け
///
/// 接続のサブスクリプションと接続レコードをすべて削除する。
/// 冪等: 二度目の呼び出しでは何も消さない
use std::sync::Arc;

use tracing::info;

use crate::infrastructure::{ConnectionRegistry, SubscriptionRegistry};

pub struct DisconnectHandler {
    connections: ConnectionRegistry,
    subscriptions: Arc<SubscriptionRegistry>,
}

impl DisconnectHandler {
    pub fn new(connections: ConnectionRegistry, subscriptions: Arc<SubscriptionRegistry>) -> Self {
        Self {
            connections,
            subscriptions,
        }
    }

    /// 削除したサブスクリプション数を返す
    pub fn handle(&self, connection_id: &str) -> usize {
        let removed = self.subscriptions.unregister_connection(connection_id);
        if let Some(state) = self.connections.remove(connection_id) {
            info!(
                connection_id,
                tenant = %state.tenant.id,
                subscriptions = removed,
                "connection closed"
            );
        }
        removed
    }
}
