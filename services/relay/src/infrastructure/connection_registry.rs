/// 接続中のWebSocketの一覧
///
/// 接続ごとにテナント、クライアントIP、NIP-42チャレンジ、生存フラグ、
/// 認証済みpubkey、送信チャネルを保持する
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use nostr::{PublicKey, SecretKey, Timestamp};
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use super::tenant_config::Tenant;
use super::websocket_sender::{Outbound, SendError, WebSocketSender};

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// プロセス内で一意な接続ID
pub fn next_connection_id() -> String {
    format!("conn-{}", NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
}

/// 32バイトの乱数を16進エンコードしたもの
pub fn generate_challenge() -> String {
    SecretKey::generate().to_secret_hex()
}

pub struct ConnectionState {
    pub connection_id: String,
    pub tenant: Tenant,
    pub ip: IpAddr,
    pub challenge: String,
    pub connected_at: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
    alive: AtomicBool,
    authenticated: Mutex<Option<PublicKey>>,
    terminated: AtomicBool,
    closed: Notify,
}

impl ConnectionState {
    pub fn new(
        connection_id: String,
        tenant: Tenant,
        ip: IpAddr,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            connection_id,
            tenant,
            ip,
            challenge: generate_challenge(),
            connected_at: Timestamp::now().as_secs(),
            outbound,
            alive: AtomicBool::new(true),
            authenticated: Mutex::new(None),
            terminated: AtomicBool::new(false),
            closed: Notify::new(),
        }
    }

    pub fn push(&self, frame: Outbound) -> Result<(), SendError> {
        if self.is_terminated() {
            return Err(SendError::ConnectionGone);
        }
        self.outbound.send(frame).map_err(|_| SendError::ConnectionGone)
    }

    /// Pongを受信した
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    /// 生存フラグを下ろし、直前の値を返す
    pub fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::SeqCst)
    }

    pub fn authenticate(&self, pubkey: PublicKey) {
        *self.authenticated.lock().unwrap_or_else(PoisonError::into_inner) = Some(pubkey);
    }

    pub fn authenticated_pubkey(&self) -> Option<PublicKey> {
        *self.authenticated.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated_pubkey().is_some()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// クローズフレームを積み、受信ループを起こす
    pub fn terminate(&self, code: u16, reason: &str) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.outbound.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
        self.closed.notify_waiters();
    }

    /// [`ConnectionState::terminate`] が呼ばれると完了する
    pub async fn terminated(&self) {
        loop {
            let notified = self.closed.notified();
            if self.is_terminated() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<String, Arc<ConnectionState>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, state: Arc<ConnectionState>) {
        debug!(connection_id = %state.connection_id, tenant = %state.tenant.id, "connection registered");
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(state.connection_id.clone(), state);
    }

    pub fn remove(&self, connection_id: &str) -> Option<Arc<ConnectionState>> {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(connection_id)
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<ConnectionState>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(connection_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Arc<ConnectionState>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl WebSocketSender for ConnectionRegistry {
    async fn send(&self, connection_id: &str, message: &str) -> Result<(), SendError> {
        let state = self.get(connection_id).ok_or(SendError::ConnectionGone)?;
        state.push(Outbound::Text(message.to_string()))
    }

    async fn close(&self, connection_id: &str, code: u16, reason: &str) -> Result<(), SendError> {
        let state = self.get(connection_id).ok_or(SendError::ConnectionGone)?;
        state.terminate(code, reason);
        Ok(())
    }
}
