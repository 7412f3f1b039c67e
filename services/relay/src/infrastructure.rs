// Infrastructure layer modules
pub mod config;
pub mod connection_registry;
pub mod event_store;
pub mod logging;
pub mod moderation;
pub mod plugins;
pub mod relay_info_config;
pub mod reputation;
pub mod subscription_registry;
pub mod task_pipeline;
pub mod tenant_config;
pub mod websocket_sender;

// Re-exports
pub use config::EngineConfig;
pub use connection_registry::{ConnectionRegistry, ConnectionState};
pub use event_store::{DeleteReport, EventStore, InsertOutcome, StoreConfig, StoreStats};
pub use logging::{init_logging, LogFormat};
pub use moderation::{ModerationQueue, NoopModeration};
pub use plugins::{AllowedPubkeysHook, BlockedKindsHook, HookDecision, PluginChain, PreAcceptHook};
pub use relay_info_config::RelayInfoConfig;
pub use reputation::{Reputation, ReputationService, StaticReputation};
pub use subscription_registry::{MatchedSubscription, SubscriptionRegistry};
pub use task_pipeline::{Job, PipelineConfig, TaskPipeline, WorkerError};
pub use tenant_config::{StaticTenantResolver, Tenant, TenantConfigError, TenantResolver};
pub use websocket_sender::{Outbound, SendError, WebSocketSender};
