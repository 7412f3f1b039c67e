/// EVENTハンドラー
///
/// 受信イベントを検証し、リレーのポリシーとNIP-09削除を適用したうえで
/// ストアに挿入してサブスクリプションへ配信し、OKを返す。
/// OKは永続化の完了を待たずに送る
use nostr::{Event, Timestamp};
use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

use crate::application::context::RelayContext;
use crate::application::deletion_handler::DeletionHandler;
use crate::domain::event_kind::{is_protected_event, DELETION_KIND};
use crate::domain::relay_message::error_prefix;
use crate::domain::{EventValidator, PolicyError, RelayMessage};
use crate::infrastructure::event_store::InsertOutcome;
use crate::infrastructure::task_pipeline::Job;
use crate::infrastructure::{ConnectionState, WebSocketSender};

pub struct EventHandler<WS>
where
    WS: WebSocketSender,
{
    context: RelayContext,
    deletion_handler: DeletionHandler,
    ws_sender: WS,
}

impl<WS> EventHandler<WS>
where
    WS: WebSocketSender,
{
    pub fn new(context: RelayContext, ws_sender: WS) -> Self {
        let deletion_handler = DeletionHandler::new(context.pipeline.clone());
        Self {
            context,
            deletion_handler,
            ws_sender,
        }
    }

    /// EVENTフレームを1つ処理し、OK応答を返す
    ///
    /// # 処理フロー
    /// 1. 構造の検証、続いて軽量プールでIDハッシュと署名を検証
    /// 2. テナントの制限、NIP-40 有効期限、NIP-13 PoW
    /// 3. BANされた作者、書き込み認証、NIP-70、プラグインフック
    /// 4. kind 5 は [`DeletionHandler`] に回す
    /// 5. 挿入、配信、永続化ジョブ、モデレーション
    pub async fn handle(&self, event_json: Value, connection: &ConnectionState) -> RelayMessage {
        let connection_id = connection.connection_id.as_str();
        // パース前でも応答に使えるようにIDだけ先に取り出す
        let event_id = event_json
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        trace!(connection_id, event_id = %event_id, "EVENT received");

        let event = match EventValidator::parse(&event_json) {
            Ok(event) => event,
            Err(err) => {
                debug!(connection_id, event_id = %event_id, error = %err, "malformed event");
                return RelayMessage::ok_validation_error(&event_id, &err);
            }
        };

        match self.context.pipeline.verify(event.clone()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(connection_id, event_id = %event_id, error = %err, "event verification failed");
                return RelayMessage::ok_validation_error(&event_id, &err);
            }
            Err(err) => {
                error!(connection_id, event_id = %event_id, error = %err, "event verification unavailable");
                return RelayMessage::ok_error(&event_id, error_prefix::ERROR, "could not verify event");
            }
        }

        let limitation = connection.tenant.limitation.as_ref();
        let now = Timestamp::now().as_secs();
        let checks = EventValidator::validate_limitation(&event, limitation, now)
            .and_then(|()| EventValidator::validate_expiration(&event, now).map(|_| ()))
            .and_then(|()| EventValidator::validate_pow(&event, limitation.min_pow_difficulty));
        if let Err(err) = checks {
            debug!(connection_id, event_id = %event_id, error = %err, "event rejected by limitation");
            return RelayMessage::ok_validation_error(&event_id, &err);
        }

        if let Err(err) = self.check_policy(&event, connection).await {
            debug!(connection_id, event_id = %event_id, error = %err, "event rejected by policy");
            if err == PolicyError::AuthRequired {
                let challenge = RelayMessage::auth_challenge(&connection.challenge);
                let _ = self.ws_sender.send(connection_id, &challenge.to_json()).await;
            }
            return RelayMessage::ok_policy_error(&event_id, &err);
        }

        if event.kind.as_u16() == DELETION_KIND {
            return self.handle_deletion(&event, connection).await;
        }

        self.accept(&event, connection).await
    }

    async fn check_policy(&self, event: &Event, connection: &ConnectionState) -> Result<(), PolicyError> {
        if self.context.reputation.is_pubkey_banned(&event.pubkey).await {
            return Err(PolicyError::BannedPubkey);
        }

        let authenticated = connection.authenticated_pubkey();
        if connection.tenant.limitation.writes_need_auth() && authenticated.is_none() {
            return Err(PolicyError::AuthRequired);
        }

        if is_protected_event(event) {
            match authenticated {
                None => return Err(PolicyError::AuthRequired),
                Some(pubkey) if pubkey != event.pubkey => return Err(PolicyError::ProtectedEvent),
                Some(_) => {}
            }
        }

        self.context.plugins.evaluate(event, &connection.tenant.id)
    }

    async fn accept(&self, event: &Event, connection: &ConnectionState) -> RelayMessage {
        let tenant_id = connection.tenant.id.as_str();
        let event_id = event.id.to_hex();
        let outcome = self.context.pipeline.store().insert(event, tenant_id);
        debug!(event_id = %event_id, tenant = tenant_id, outcome = ?outcome, "event inserted");

        match outcome {
            InsertOutcome::Stored => {
                self.context.pipeline.enqueue(Job::Store { id: event.id });
                self.broadcast_to_subscribers(event, tenant_id).await;
                self.context.moderation.enqueue(event, tenant_id);
                RelayMessage::ok_success(&event_id)
            }
            InsertOutcome::Replaced { superseded } => {
                self.context.pipeline.enqueue(Job::Update {
                    superseded,
                    replacement: event.id,
                });
                self.broadcast_to_subscribers(event, tenant_id).await;
                self.context.moderation.enqueue(event, tenant_id);
                RelayMessage::ok_success(&event_id)
            }
            InsertOutcome::Ephemeral => {
                self.broadcast_to_subscribers(event, tenant_id).await;
                RelayMessage::ok_ephemeral(&event_id)
            }
            InsertOutcome::Duplicate => RelayMessage::ok_duplicate(&event_id),
            InsertOutcome::Stale { existing } => {
                debug!(event_id = %event_id, existing = %existing, "older replaceable version ignored");
                RelayMessage::ok_stale_replaceable(&event_id)
            }
        }
    }

    /// NIP-09: 対象に墓標を立て、削除リクエスト自体を保存して配信する
    async fn handle_deletion(&self, event: &Event, connection: &ConnectionState) -> RelayMessage {
        let tenant_id = connection.tenant.id.as_str();
        let event_id = event.id.to_hex();

        if self.context.pipeline.store().contains(&event.id) {
            return RelayMessage::ok_duplicate(&event_id);
        }

        match self.deletion_handler.process_deletion(event, tenant_id) {
            Ok(result) => {
                info!(
                    connection_id = %connection.connection_id,
                    event_id = %event_id,
                    deleted = result.deleted.len(),
                    rejected = result.rejected,
                    "deletion request applied"
                );
                if self.context.pipeline.store().insert(event, tenant_id) == InsertOutcome::Stored {
                    self.context.pipeline.enqueue(Job::Store { id: event.id });
                }
                self.broadcast_to_subscribers(event, tenant_id).await;
                RelayMessage::ok_deleted(&event_id)
            }
            Err(err) => {
                debug!(event_id = %event_id, error = %err, "deletion request refused");
                RelayMessage::ok_error(&event_id, error_prefix::INVALID, &err.to_string())
            }
        }
    }

    /// テナント内でマッチする全サブスクリプションへイベントを送信
    async fn broadcast_to_subscribers(&self, event: &Event, tenant_id: &str) {
        let matched = self.context.subscriptions.on_new_event(event, tenant_id);
        if matched.is_empty() {
            trace!(event_id = %event.id, "no matching subscriptions");
            return;
        }

        for subscription in matched {
            let message = RelayMessage::event(&subscription.subscription_id, event).to_json();
            if let Err(err) = self.ws_sender.send(&subscription.connection_id, &message).await {
                warn!(
                    event_id = %event.id,
                    connection_id = %subscription.connection_id,
                    subscription_id = %subscription.subscription_id,
                    error = %err,
                    "fan-out send failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::context::tests::{context, context_with};
    use crate::domain::LimitationConfig;
    use crate::infrastructure::connection_registry::tests::connection;
    use crate::infrastructure::plugins::BlockedKindsHook;
    use crate::infrastructure::websocket_sender::tests::MockWebSocketSender;
    use crate::infrastructure::{PluginChain, StaticReputation};
    use nostr::{EventBuilder, Filter, Keys, Kind, Tag};
    use std::collections::HashSet;

    const TENANT: &str = "relay.example.com";

    // ==================== ヘルパー関数 ====================

    fn ok_parts(message: &RelayMessage) -> (bool, String) {
        match message {
            RelayMessage::Ok {
                accepted, message, ..
            } => (*accepted, message.clone()),
            other => panic!("expected OK, got {:?}", other),
        }
    }

    fn to_json(event: &Event) -> Value {
        serde_json::to_value(event).unwrap()
    }

    fn note(keys: &Keys, content: &str) -> Event {
        EventBuilder::text_note(content).sign_with_keys(keys).unwrap()
    }

    fn handler() -> (EventHandler<MockWebSocketSender>, RelayContext, MockWebSocketSender) {
        let (context, _) = context();
        let sender = MockWebSocketSender::new();
        (EventHandler::new(context.clone(), sender.clone()), context, sender)
    }

    // ==================== 受け入れ テスト ====================

    #[tokio::test]
    async fn test_valid_event_is_stored_and_acknowledged() {
        let (context, moderation) = context();
        let handler = EventHandler::new(context.clone(), MockWebSocketSender::new());
        let (conn, _rx) = connection("conn-1", LimitationConfig::default());
        let event = note(&Keys::generate(), "hello");

        let reply = handler.handle(to_json(&event), &conn).await;

        assert_eq!(ok_parts(&reply), (true, String::new()));
        assert_eq!(context.pipeline.store().get(&event.id), Some(event.clone()));
        assert_eq!(
            moderation.queued.lock().unwrap().as_slice(),
            &[(event.id, TENANT.to_string())]
        );
    }

    #[tokio::test]
    async fn test_duplicate_event_is_acknowledged_once_indexed() {
        let (handler, context, _) = handler();
        let (conn, _rx) = connection("conn-1", LimitationConfig::default());
        let event = note(&Keys::generate(), "twice");

        let first = handler.handle(to_json(&event), &conn).await;
        let second = handler.handle(to_json(&event), &conn).await;

        assert!(ok_parts(&first).0);
        assert_eq!(
            ok_parts(&second),
            (true, "duplicate: already have this event".to_string())
        );
        assert_eq!(context.pipeline.store().stats().indexed, 1);
    }

    // ==================== 検証 テスト ====================

    #[tokio::test]
    async fn test_tampered_event_is_rejected() {
        let (handler, context, _) = handler();
        let (conn, _rx) = connection("conn-1", LimitationConfig::default());
        let event = note(&Keys::generate(), "original");
        let mut json = to_json(&event);
        json["content"] = Value::from("changed");

        let (accepted, message) = ok_parts(&handler.handle(json, &conn).await);

        assert!(!accepted);
        assert_eq!(message, "invalid: event id does not match");
        assert_eq!(context.pipeline.store().stats().indexed, 0);
    }

    #[tokio::test]
    async fn test_malformed_event_is_rejected() {
        let (handler, _, _) = handler();
        let (conn, _rx) = connection("conn-1", LimitationConfig::default());

        let (accepted, message) = ok_parts(&handler.handle(serde_json::json!({"id": "abc"}), &conn).await);

        assert!(!accepted);
        assert!(message.starts_with("invalid:"), "{message}");
    }

    #[tokio::test]
    async fn test_limitation_violations() {
        let (handler, _, _) = handler();
        let limitation = LimitationConfig {
            max_event_tags: 1,
            max_content_length: 5,
            ..Default::default()
        };
        let (conn, _rx) = connection("conn-1", limitation);
        let keys = Keys::generate();

        let tagged = EventBuilder::text_note("x")
            .tags(vec![Tag::hashtag("a"), Tag::hashtag("b")])
            .sign_with_keys(&keys)
            .unwrap();
        assert_eq!(
            ok_parts(&handler.handle(to_json(&tagged), &conn).await),
            (false, "blocked: too many tags".to_string())
        );

        let long = note(&keys, "too long");
        assert_eq!(
            ok_parts(&handler.handle(to_json(&long), &conn).await),
            (false, "blocked: event content too large".to_string())
        );
    }

    #[tokio::test]
    async fn test_expired_event_is_rejected() {
        let (handler, _, _) = handler();
        let (conn, _rx) = connection("conn-1", LimitationConfig::default());
        let expired = EventBuilder::text_note("old news")
            .tags(vec![Tag::expiration(Timestamp::from(1_000))])
            .sign_with_keys(&Keys::generate())
            .unwrap();

        assert_eq!(
            ok_parts(&handler.handle(to_json(&expired), &conn).await),
            (false, "invalid: event has expired".to_string())
        );
    }

    #[tokio::test]
    async fn test_proof_of_work() {
        let (handler, _, _) = handler();
        let keys = Keys::generate();

        let (strict, _rx) = connection(
            "conn-1",
            LimitationConfig {
                min_pow_difficulty: 40,
                ..Default::default()
            },
        );
        let (accepted, message) = ok_parts(&handler.handle(to_json(&note(&keys, "cheap")), &strict).await);
        assert!(!accepted);
        assert!(message.starts_with("pow: difficulty"), "{message}");

        let (moderate, _rx2) = connection(
            "conn-2",
            LimitationConfig {
                min_pow_difficulty: 8,
                ..Default::default()
            },
        );
        let mined = EventBuilder::text_note("mined").pow(8).sign_with_keys(&keys).unwrap();
        assert!(ok_parts(&handler.handle(to_json(&mined), &moderate).await).0);
    }

    // ==================== ポリシー テスト ====================

    #[tokio::test]
    async fn test_restricted_writes_require_auth() {
        let (handler, context, sender) = handler();
        let (conn, _rx) = connection(
            "conn-1",
            LimitationConfig {
                restricted_writes: true,
                ..Default::default()
            },
        );
        let keys = Keys::generate();
        let event = note(&keys, "let me in");

        let reply = handler.handle(to_json(&event), &conn).await;
        assert_eq!(
            ok_parts(&reply),
            (false, "auth-required: you must authenticate first".to_string())
        );
        let sent = sender.get_sent_json("conn-1");
        assert_eq!(sent, vec![serde_json::json!(["AUTH", conn.challenge])]);
        assert!(context.pipeline.store().get(&event.id).is_none());

        conn.authenticate(keys.public_key());
        assert!(ok_parts(&handler.handle(to_json(&event), &conn).await).0);
    }

    #[tokio::test]
    async fn test_protected_event_needs_its_author() {
        let (handler, _, _) = handler();
        let (conn, _rx) = connection("conn-1", LimitationConfig::default());
        let author = Keys::generate();
        let protected = EventBuilder::text_note("members only")
            .tags(vec![Tag::parse(["-"]).unwrap()])
            .sign_with_keys(&author)
            .unwrap();

        let (accepted, message) = ok_parts(&handler.handle(to_json(&protected), &conn).await);
        assert!(!accepted);
        assert!(message.starts_with("auth-required:"));

        conn.authenticate(Keys::generate().public_key());
        assert_eq!(
            ok_parts(&handler.handle(to_json(&protected), &conn).await),
            (
                false,
                "auth-required: this event may only be published by its author".to_string()
            )
        );

        conn.authenticate(author.public_key());
        assert!(ok_parts(&handler.handle(to_json(&protected), &conn).await).0);
    }

    #[tokio::test]
    async fn test_banned_pubkey() {
        let banned = Keys::generate();
        let reputation = StaticReputation::new(HashSet::new(), HashSet::from([banned.public_key()]), 0);
        let (context, _) = context_with(reputation, PluginChain::new());
        let handler = EventHandler::new(context, MockWebSocketSender::new());
        let (conn, _rx) = connection("conn-1", LimitationConfig::default());

        assert_eq!(
            ok_parts(&handler.handle(to_json(&note(&banned, "spam")), &conn).await),
            (false, "blocked: banned pubkey".to_string())
        );
    }

    #[tokio::test]
    async fn test_plugin_deny() {
        let mut plugins = PluginChain::new();
        plugins.register(Box::new(BlockedKindsHook::new(HashSet::from([1]))));
        let (context, _) = context_with(StaticReputation::default(), plugins);
        let handler = EventHandler::new(context, MockWebSocketSender::new());
        let (conn, _rx) = connection("conn-1", LimitationConfig::default());

        assert_eq!(
            ok_parts(&handler.handle(to_json(&note(&Keys::generate(), "no")), &conn).await),
            (false, "blocked: can't accept event".to_string())
        );
    }

    // ==================== kind別 テスト ====================

    #[tokio::test]
    async fn test_ephemeral_event_is_delivered_but_not_stored() {
        let (handler, context, sender) = handler();
        let (conn, _rx) = connection("conn-1", LimitationConfig::default());
        context
            .subscriptions
            .register("conn-2", TENANT, "live", vec![Filter::new().kind(Kind::from(20001))]);
        let ephemeral = EventBuilder::new(Kind::from(20001), "blink")
            .sign_with_keys(&Keys::generate())
            .unwrap();

        let reply = handler.handle(to_json(&ephemeral), &conn).await;

        assert_eq!(
            ok_parts(&reply),
            (true, "ephemeral: accepted but not stored".to_string())
        );
        assert_eq!(sender.get_sent_json("conn-2")[0][0], "EVENT");
        assert!(context.pipeline.store().get(&ephemeral.id).is_none());
    }

    #[tokio::test]
    async fn test_replaceable_supersession() {
        let (handler, context, _) = handler();
        let (conn, _rx) = connection("conn-1", LimitationConfig::default());
        let keys = Keys::generate();
        let now = Timestamp::now().as_secs();
        let metadata = |name: &str, created_at: u64| {
            EventBuilder::new(Kind::Metadata, name)
                .custom_created_at(Timestamp::from(created_at))
                .sign_with_keys(&keys)
                .unwrap()
        };
        let older = metadata("old", now - 100);
        let newer = metadata("new", now);

        assert!(ok_parts(&handler.handle(to_json(&older), &conn).await).0);
        assert!(ok_parts(&handler.handle(to_json(&newer), &conn).await).0);

        let store = context.pipeline.store();
        assert!(store.get(&older.id).is_none());
        assert_eq!(store.get(&newer.id), Some(newer));

        let stale = metadata("stale", now - 50);
        assert_eq!(
            ok_parts(&handler.handle(to_json(&stale), &conn).await),
            (true, "duplicate: have a newer version of this event".to_string())
        );
    }

    #[tokio::test]
    async fn test_deletion_request() {
        let (handler, context, _) = handler();
        let (conn, _rx) = connection("conn-1", LimitationConfig::default());
        let author = Keys::generate();
        let target = note(&author, "regret");
        handler.handle(to_json(&target), &conn).await;

        let empty = EventBuilder::new(Kind::EventDeletion, "").sign_with_keys(&author).unwrap();
        assert_eq!(
            ok_parts(&handler.handle(to_json(&empty), &conn).await),
            (false, "invalid: missing required tags".to_string())
        );

        let foreign = EventBuilder::new(Kind::EventDeletion, "")
            .tags(vec![Tag::event(target.id)])
            .sign_with_keys(&Keys::generate())
            .unwrap();
        assert_eq!(
            ok_parts(&handler.handle(to_json(&foreign), &conn).await),
            (false, "invalid: no events found for deletion".to_string())
        );

        let request = EventBuilder::new(Kind::EventDeletion, "")
            .tags(vec![Tag::event(target.id)])
            .sign_with_keys(&author)
            .unwrap();
        assert_eq!(
            ok_parts(&handler.handle(to_json(&request), &conn).await),
            (true, "deleted: events successfully deleted".to_string())
        );
        let store = context.pipeline.store();
        assert!(store.get(&target.id).is_none());
        assert!(store.get(&request.id).is_some());
    }

    // ==================== 配信 テスト ====================

    #[tokio::test]
    async fn test_fan_out_respects_tenant_and_filters() {
        let (handler, context, sender) = handler();
        let (conn, _rx) = connection("conn-1", LimitationConfig::default());
        let subscriptions = &context.subscriptions;
        subscriptions.register("conn-2", TENANT, "notes", vec![Filter::new().kind(Kind::TextNote)]);
        subscriptions.register("conn-3", TENANT, "meta", vec![Filter::new().kind(Kind::Metadata)]);
        subscriptions.register(
            "conn-4",
            "other.example.com",
            "notes",
            vec![Filter::new().kind(Kind::TextNote)],
        );

        let event = note(&Keys::generate(), "fan-out");
        handler.handle(to_json(&event), &conn).await;

        let delivered = sender.get_sent_json("conn-2");
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0][1], "notes");
        assert_eq!(delivered[0][2]["id"], event.id.to_hex());
        assert!(sender.get_sent_messages("conn-3").is_empty());
        assert!(sender.get_sent_messages("conn-4").is_empty());
    }
}
