/// プロトコルハンドラーが共有するサービス群
use std::sync::Arc;
use std::time::Duration;

use crate::infrastructure::{
    EngineConfig, ModerationQueue, PluginChain, ReputationService, SubscriptionRegistry, TaskPipeline,
};

#[derive(Clone)]
pub struct RelayContext {
    pub pipeline: Arc<TaskPipeline>,
    pub subscriptions: Arc<SubscriptionRegistry>,
    pub reputation: Arc<dyn ReputationService>,
    pub moderation: Arc<dyn ModerationQueue>,
    pub plugins: Arc<PluginChain>,
    /// REQ一回あたりのバックログ走査の上限
    pub req_timeout: Duration,
    pub auth_timeout: Duration,
    /// 永続化キューがこの深さを超えたら受信フレームを拒否する
    pub max_queue_length: usize,
}

impl RelayContext {
    pub fn new(
        pipeline: Arc<TaskPipeline>,
        subscriptions: Arc<SubscriptionRegistry>,
        reputation: Arc<dyn ReputationService>,
        moderation: Arc<dyn ModerationQueue>,
        plugins: Arc<PluginChain>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            pipeline,
            subscriptions,
            reputation,
            moderation,
            plugins,
            req_timeout: config.req_timeout,
            auth_timeout: config.auth_timeout,
            max_queue_length: config.max_queue_length,
        }
    }
}
