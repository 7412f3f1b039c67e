// パイプラインのジョブと実行結果

use std::any::Any;

use nostr::{Event, EventId, Filter};
use thiserror::Error;

use crate::domain::{EventValidator, ValidationError};
use crate::infrastructure::event_store::{EventStore, StorageError};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorkerError {
    #[error("job panicked: {0}")]
    Panicked(String),

    #[error("{0} pool is closed")]
    PoolClosed(&'static str),

    #[error("durability queue is closed")]
    QueueClosed,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("job returned an unexpected output")]
    UnexpectedOutput,
}

/// 永続化キューまたはワーカープールで実行する作業単位
///
/// ジョブはデータだけを持ち、実行はすべて [`Job::execute`] が行う
#[derive(Debug, Clone)]
pub enum Job {
    /// 保留中のイベントをアクティブチャンクへ書き込む
    Store { id: EventId },
    /// 置き換えられたイベントを削除し、新しいイベントを書き込む
    Update {
        superseded: EventId,
        replacement: EventId,
    },
    /// 墓標を適用する
    Delete { ids: Vec<EventId> },
    ScanFilters {
        tenant_id: String,
        filters: Vec<Filter>,
        max_limit: usize,
    },
    CountFilters {
        tenant_id: String,
        filters: Vec<Filter>,
    },
    /// IDハッシュと署名の検証
    VerifyEvent { event: Box<Event> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutput {
    Applied(usize),
    Events(Vec<Event>),
    Count(usize),
    Verified(Result<(), ValidationError>),
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::Store { .. } => "store",
            Job::Update { .. } => "update",
            Job::Delete { .. } => "delete",
            Job::ScanFilters { .. } => "scan_filters",
            Job::CountFilters { .. } => "count_filters",
            Job::VerifyEvent { .. } => "verify_event",
        }
    }

    /// どの永続化コンシューマーで実行するかを決めるID
    pub fn routing_id(&self) -> Option<&EventId> {
        match self {
            Job::Store { id } => Some(id),
            Job::Update { superseded, .. } => Some(superseded),
            Job::Delete { ids } => ids.first(),
            Job::VerifyEvent { event } => Some(&event.id),
            Job::ScanFilters { .. } | Job::CountFilters { .. } => None,
        }
    }

    pub fn execute(self, store: &EventStore) -> Result<JobOutput, WorkerError> {
        match self {
            Job::Store { id } => {
                let committed = store.commit(&id)?;
                Ok(JobOutput::Applied(usize::from(committed)))
            }
            Job::Update {
                superseded,
                replacement,
            } => {
                let removed = store.apply_deletes(&[superseded]);
                let committed = store.commit(&replacement)?;
                Ok(JobOutput::Applied(removed + usize::from(committed)))
            }
            Job::Delete { ids } => Ok(JobOutput::Applied(store.apply_deletes(&ids))),
            Job::ScanFilters {
                tenant_id,
                filters,
                max_limit,
            } => Ok(JobOutput::Events(store.match_filters(
                &filters, &tenant_id, max_limit,
            ))),
            Job::CountFilters { tenant_id, filters } => {
                Ok(JobOutput::Count(store.count_filters(&filters, &tenant_id)))
            }
            Job::VerifyEvent { event } => Ok(JobOutput::Verified(EventValidator::verify(&event))),
        }
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventBuilder, Keys, Kind, Timestamp};

    const TENANT: &str = "relay.example.com";

    fn note(keys: &Keys, created_at: u64) -> Event {
        EventBuilder::text_note("job")
            .custom_created_at(Timestamp::from(created_at))
            .sign_with_keys(keys)
            .unwrap()
    }

    #[test]
    fn test_store_job_commits_pending_event() {
        let store = EventStore::default();
        let event = note(&Keys::generate(), 1_000);
        store.insert(&event, TENANT);

        let output = Job::Store { id: event.id }.execute(&store).unwrap();
        assert_eq!(output, JobOutput::Applied(1));
        assert_eq!(store.pending_len(), 0);
    }

    #[test]
    fn test_update_job_drops_superseded() {
        let store = EventStore::default();
        let keys = Keys::generate();
        let old = EventBuilder::new(Kind::Metadata, "{}")
            .custom_created_at(Timestamp::from(100))
            .sign_with_keys(&keys)
            .unwrap();
        let new = EventBuilder::new(Kind::Metadata, "{\"name\":\"x\"}")
            .custom_created_at(Timestamp::from(200))
            .sign_with_keys(&keys)
            .unwrap();
        store.insert(&old, TENANT);
        store.insert(&new, TENANT);

        let output = Job::Update {
            superseded: old.id,
            replacement: new.id,
        }
        .execute(&store)
        .unwrap();
        assert_eq!(output, JobOutput::Applied(2));
        assert!(store.index_entry(&old.id).is_none());
        assert!(store.index_entry(&new.id).unwrap().processed);
    }

    #[test]
    fn test_scan_and_count_jobs() {
        let store = EventStore::default();
        let keys = Keys::generate();
        store.insert(&note(&keys, 1_000), TENANT);
        store.insert(&note(&keys, 1_001), TENANT);
        let filters = vec![Filter::new().kind(Kind::TextNote)];

        match (Job::ScanFilters {
            tenant_id: TENANT.to_string(),
            filters: filters.clone(),
            max_limit: 1,
        })
        .execute(&store)
        .unwrap()
        {
            JobOutput::Events(events) => assert_eq!(events.len(), 1),
            other => panic!("unexpected {:?}", other),
        }

        let count = Job::CountFilters {
            tenant_id: TENANT.to_string(),
            filters,
        }
        .execute(&store)
        .unwrap();
        assert_eq!(count, JobOutput::Count(2));
    }

    #[test]
    fn test_verify_job() {
        let event = note(&Keys::generate(), 1_000);
        let output = Job::VerifyEvent {
            event: Box::new(event),
        }
        .execute(&EventStore::default())
        .unwrap();
        assert_eq!(output, JobOutput::Verified(Ok(())));
    }

    #[test]
    fn test_routing_id() {
        let event = note(&Keys::generate(), 1_000);
        assert_eq!(Job::Store { id: event.id }.routing_id(), Some(&event.id));
        assert_eq!(Job::Delete { ids: vec![] }.routing_id(), None);

        let replacement = note(&Keys::generate(), 2_000);
        let update = Job::Update {
            superseded: event.id,
            replacement: replacement.id,
        };
        assert_eq!(update.routing_id(), Some(&event.id));
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new("bang".to_string())), "bang");
        assert_eq!(panic_message(Box::new(42u8)), "unknown panic payload");
    }
}
