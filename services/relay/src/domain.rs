// Domain layer modules
pub mod auth_validator;
pub mod deletion_target;
pub mod deletion_validator;
pub mod event_kind;
pub mod event_validator;
pub mod filter_evaluator;
pub mod limitation_config;
pub mod policy_error;
pub mod relay_info;
pub mod relay_message;

// Re-exports
pub use auth_validator::{AuthError, AuthValidator};
pub use deletion_target::{DeletionTarget, DeletionTargetKind};
pub use deletion_validator::{DeletionRejection, DeletionValidator};
pub use event_kind::{EventKind, ReplaceableKey};
pub use event_validator::{EventValidator, ValidationError};
pub use filter_evaluator::{FilterEvaluator, FilterValidationError, IndexedFields};
pub use limitation_config::LimitationConfig;
pub use policy_error::PolicyError;
pub use relay_info::{RelayInfoDocument, RelayLimitation};
pub use relay_message::RelayMessage;
