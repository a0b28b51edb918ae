//! Detach watcher: reconciles a record when the backend drops its session.

use super::record::SessionRecord;
use super::types::Notice;
use crate::backend::DetachReason;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Install the detach callback on the record's backend session.
///
/// The callback holds only a weak reference; the record owns the backend
/// session, which owns the callback.
pub(crate) fn install(record: &Arc<SessionRecord>) {
    let weak: Weak<SessionRecord> = Arc::downgrade(record);
    record
        .backend_session()
        .on_detached(Arc::new(move |reason: DetachReason| {
            match weak.upgrade() {
                Some(record) => on_detached(&record, reason),
                None => debug!(%reason, "Detach event for a dropped session"),
            }
        }));
}

fn on_detached(record: &SessionRecord, reason: DetachReason) {
    let reason = reason.to_string();
    match record.mark_detached(reason.clone()) {
        Some(scripts) => {
            info!(
                session_id = %record.id(),
                pid = record.pid(),
                reason = %reason,
                scripts = scripts.len(),
                "Session detached by backend"
            );
            record.messages().push_notice(Notice::Detached { reason });
            // Script handles died with the backend session; just release them.
            drop(scripts);
        }
        None => {
            debug!(session_id = %record.id(), reason = %reason, "Session already detached");
        }
    }
}
