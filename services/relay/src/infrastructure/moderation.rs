// 受け入れたイベントを外部のモデレーション処理へ渡す

use nostr::Event;
use tracing::trace;

/// 投げっぱなし。実装は呼び出し元をブロックしてはならない
pub trait ModerationQueue: Send + Sync {
    fn enqueue(&self, event: &Event, tenant_id: &str);
}

/// モデレーション無効
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopModeration;

impl ModerationQueue for NoopModeration {
    fn enqueue(&self, event: &Event, tenant_id: &str) {
        trace!(event_id = %event.id, tenant = tenant_id, "moderation disabled, event not queued");
    }
}
