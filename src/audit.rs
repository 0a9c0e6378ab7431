//! Audit recorder: best-effort, append-only trail of every
//! state-changing action.
//!
//! Policy: an audit write failure must never block or reverse the
//! primary operation. Availability of the clinical workflow wins over
//! audit completeness, so persistence failures are logged and swallowed
//! here instead of being propagated. Callers invoke [`record`] exactly
//! once, strictly after the primary write has committed.

use chrono::Utc;
use log::warn;
use serde_json::Value;

use crate::authorization::ClientMeta;
use crate::db::Database;
use crate::models::{ActionKind, AuditLogEntry, AuditLogId, EntityName, UserId};

/// Appends one entry to the audit trail.
///
/// `actor` is None for anonymous events (failed logins). `old_values`
/// must carry the pre-image for updates and deletes; it stays None for
/// creates and authentication events.
#[allow(clippy::too_many_arguments)]
pub fn record(
    db: &mut Database,
    actor: Option<UserId>,
    action: ActionKind,
    entity: Option<EntityName>,
    record_id: Option<String>,
    old_values: Option<Value>,
    new_values: Option<Value>,
    client: &ClientMeta,
) {
    db.append_audit(AuditLogEntry {
        id: AuditLogId::new(),
        user_id: actor,
        action,
        table_name: entity,
        record_id,
        old_values,
        new_values,
        ip_address: client.ip_address.clone(),
        user_agent: client.user_agent.clone(),
        created_at: Utc::now(),
    });

    // Swallowed on purpose; see the module policy above.
    if let Err(error) = db.save() {
        warn!("audit entry for {action} not persisted: {error}");
    }
}
