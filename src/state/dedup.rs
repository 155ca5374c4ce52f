use super::model::ClaimEntry;
use super::store::update_shared_document;
use super::StatePaths;
use crate::shared::now_secs;
use std::time::Duration;

pub const CLAIM_RETENTION: Duration = Duration::from_secs(3600);

/// Claims an inbound message id for this instance. Exactly one of N
/// concurrent claims for the same id succeeds; the rest must skip the
/// message. Entries older than the retention window are purged on every
/// claim, so the table stays bounded by recent traffic.
pub fn claim_message(
    paths: &StatePaths,
    mutex_stale: Duration,
    message_id: &str,
    owner: &str,
) -> bool {
    update_shared_document(paths, mutex_stale, |doc| {
        let now = now_secs();
        let horizon = CLAIM_RETENTION.as_secs() as i64;
        doc.claimed_messages
            .retain(|_, entry| now - entry.timestamp < horizon);

        if doc.claimed_messages.contains_key(message_id) {
            return false;
        }
        doc.claimed_messages.insert(
            message_id.to_string(),
            ClaimEntry {
                owner: owner.to_string(),
                timestamp: now,
            },
        );
        true
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::store::{load_shared_document, update_shared_document};
    use tempfile::tempdir;

    const STALE: Duration = Duration::from_secs(5);

    #[test]
    fn first_claim_wins_and_repeat_claims_lose() {
        let dir = tempdir().expect("tempdir");
        let paths = StatePaths::new(dir.path().join(".corral"));

        assert!(claim_message(&paths, STALE, "msg-1", "instance-a"));
        assert!(!claim_message(&paths, STALE, "msg-1", "instance-b"));
        assert!(!claim_message(&paths, STALE, "msg-1", "instance-a"));
        assert!(claim_message(&paths, STALE, "msg-2", "instance-b"));
    }

    #[test]
    fn claims_older_than_retention_are_purged() {
        let dir = tempdir().expect("tempdir");
        let paths = StatePaths::new(dir.path().join(".corral"));

        update_shared_document(&paths, STALE, |doc| {
            doc.claimed_messages.insert(
                "old-msg".to_string(),
                ClaimEntry {
                    owner: "instance-a".to_string(),
                    timestamp: now_secs() - 2 * 3600,
                },
            );
        });

        assert!(claim_message(&paths, STALE, "old-msg", "instance-b"));
        let doc = load_shared_document(&paths);
        assert_eq!(doc.claimed_messages.len(), 1);
        assert_eq!(
            doc.claimed_messages.get("old-msg").map(|e| e.owner.as_str()),
            Some("instance-b")
        );
    }
}
