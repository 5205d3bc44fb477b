//! BookQL Policy - stateless allow/deny predicates over request identities.
//!
//! Every predicate fails closed for anonymous identities. The one deliberate
//! asymmetry: order and user records are visible to staff and admins, cart
//! records are visible to their owner only. Folding [`can_access_cart`] into
//! the elevated-access predicates would grant staff visibility into other
//! users' carts, so the two stay separate.

#![deny(unsafe_code)]

use bookql_types::{Identity, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

/// Owner access with staff/admin elevation.
pub fn can_access_user(identity: &Identity, target_user_id: &str) -> bool {
    if !identity.authenticated {
        return false;
    }
    if identity.role >= Role::Staff {
        return true;
    }
    identity.subject_id == target_user_id
}

/// Owner access with staff/admin elevation, applied to an order's owner.
pub fn can_access_order(identity: &Identity, order_user_id: &str) -> bool {
    can_access_user(identity, order_user_id)
}

/// Owner-only access. No role escalation: a staff or admin identity cannot
/// read another user's cart.
pub fn can_access_cart(identity: &Identity, cart_user_id: &str) -> bool {
    if !identity.authenticated {
        return false;
    }
    identity.subject_id == cart_user_id
}

/// Catalog mutations are staff work.
pub fn can_manage_catalog(identity: &Identity) -> bool {
    identity.authenticated && identity.role >= Role::Staff
}

/// Admin surface: role must be exactly admin.
pub fn can_access_admin(identity: &Identity) -> bool {
    identity.role == Role::Admin
}

/// Internal surface: staff and above.
pub fn can_access_internal(identity: &Identity) -> bool {
    identity.role >= Role::Staff
}

/// Role floor check for arbitrary operations.
pub fn has_role(identity: &Identity, required: Role) -> bool {
    if !identity.authenticated {
        return false;
    }
    identity.role >= required
}

/// One recorded access decision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub email: String,
    pub role_id: i64,
    pub operation: String,
    pub allowed: bool,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(identity: &Identity, operation: &str, allowed: bool) -> Self {
        Self {
            email: identity.email.clone(),
            role_id: identity.role.as_id(),
            operation: operation.to_string(),
            allowed,
            at: Utc::now(),
        }
    }
}

/// Append-only audit collaborator. The sink is the only resource shared
/// across requests, so implementations must tolerate concurrent appends.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

/// Production sink: one structured log line per decision.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: AuditEntry) {
        tracing::info!(
            target: "bookql::audit",
            email = %entry.email,
            role = entry.role_id,
            operation = %entry.operation,
            allowed = entry.allowed,
            "access decision"
        );
    }
}

/// In-memory sink for tests and embedders that inspect decisions.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: AuditEntry) {
        // A panic elsewhere must not stop the audit trail; recover the data.
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }
}
