// アプリケーション層モジュール
pub mod auth_handler;
pub mod connect_handler;
pub mod context;
pub mod deletion_handler;
pub mod disconnect_handler;
pub mod event_handler;
pub mod message_handler;
pub mod message_parser;
pub mod nip11_handler;
pub mod status_handler;
pub mod subscription_handler;

// 再エクスポート
pub use auth_handler::AuthHandler;
pub use connect_handler::{ConnectHandler, ConnectHandlerError};
pub use context::RelayContext;
pub use deletion_handler::{DeletionError, DeletionHandler, DeletionResult};
pub use disconnect_handler::DisconnectHandler;
pub use event_handler::EventHandler;
pub use message_handler::{MessageHandler, MessageHandlerError};
pub use message_parser::{ClientMessage, MessageParser, ParseError};
pub use nip11_handler::{wants_relay_info, Nip11Handler};
pub use status_handler::{RelayStatus, StatusHandler};
pub use subscription_handler::{SubscriptionHandler, SubscriptionHandlerError};
