use super::model::GroupLockEntry;
use super::store::update_shared_document;
use super::StatePaths;
use crate::shared::now_secs;
use std::time::Duration;

pub const DEFAULT_GROUP_LOCK_TTL: Duration = Duration::from_secs(600);

/// Cross-instance lease on a shared conversation. This is a lease, not a
/// hard lock: once the TTL elapses any instance may re-acquire, including
/// the original holder. A crashed holder therefore recovers automatically
/// at the cost of a possible overlap with a legitimately long task.
pub fn acquire_group_lock(
    paths: &StatePaths,
    mutex_stale: Duration,
    ttl: Duration,
    conversation_id: &str,
    owner: &str,
) -> bool {
    update_shared_document(paths, mutex_stale, |doc| {
        let now = now_secs();
        if let Some(entry) = doc.locks.get(conversation_id) {
            if now - entry.timestamp < ttl.as_secs() as i64 {
                return false;
            }
        }
        doc.locks.insert(
            conversation_id.to_string(),
            GroupLockEntry {
                timestamp: now,
                owner: owner.to_string(),
            },
        );
        true
    })
}

pub fn release_group_lock(paths: &StatePaths, mutex_stale: Duration, conversation_id: &str) {
    update_shared_document(paths, mutex_stale, |doc| {
        doc.locks.remove(conversation_id);
    });
}
