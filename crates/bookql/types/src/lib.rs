//! BookQL Types - shared data model for the query gateway core.
//!
//! Everything a request passes between layers lives here: the ordered role
//! hierarchy, the per-request identity, verified token claims, the parsed
//! operation tree, and the uniform result envelope every dispatch returns.

#![deny(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Ordered privilege level.
///
/// Access checks compare roles through the derived total order
/// (`User < Staff < Admin`), never through name equality.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Role {
    #[default]
    User = 0,
    Staff = 1,
    Admin = 2,
}

impl Role {
    /// Map the numeric role id carried in verified claims onto the hierarchy.
    /// Unrecognized ids fall back to the lowest privilege.
    pub fn from_id(id: i64) -> Self {
        match id {
            1 => Role::Staff,
            2 => Role::Admin,
            _ => Role::User,
        }
    }

    pub fn as_id(self) -> i64 {
        self as i64
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Staff => "staff",
            Role::Admin => "admin",
        }
    }

    /// Parse a role name; anything unrecognized is the lowest privilege.
    pub fn from_name(name: &str) -> Self {
        match name {
            "admin" => Role::Admin,
            "staff" => Role::Staff,
            _ => Role::User,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The requester profile attached to exactly one request.
///
/// Built fresh per request by the claim extractor and discarded after
/// dispatch. An anonymous identity carries the lowest privilege and fails
/// every access predicate closed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Identity {
    pub subject_id: String,
    pub email: String,
    pub role: Role,
    pub authenticated: bool,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl Identity {
    /// The fail-closed default for requests without a verifiable token.
    pub fn anonymous() -> Self {
        Self {
            subject_id: String::new(),
            email: String::new(),
            role: Role::User,
            authenticated: false,
            ip: None,
            user_agent: None,
        }
    }
}

/// Claims returned by the token-verification collaborator.
///
/// This core never inspects signatures itself; it only maps verified claims
/// onto an [`Identity`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claims {
    pub subject_id: String,
    pub email: String,
    pub role_name: String,
    pub role_id: i64,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Operation kind of a parsed request; doubles as the dispatch namespace.
///
/// Query, mutation, and subscription registrations live in independent
/// namespaces keyed by this tag.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    #[default]
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural representation of one operation's text.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationTree {
    pub kind: OperationKind,
    pub name: Option<String>,
    pub fields: Vec<Field>,
}

/// One selected field: name, optional alias, argument snapshot, and nested
/// selections. Argument keys are unique within the field; the map is treated
/// as an immutable per-request snapshot once parsed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub alias: Option<String>,
    pub arguments: BTreeMap<String, String>,
    pub sub_fields: Vec<Field>,
}

/// Uniform success/error wrapper returned by every dispatch.
///
/// Callers have exactly one decoding path: check `success`, then read either
/// `data` or `error`/`errors`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub errors: Vec<String>,
}

impl ResultEnvelope {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            errors: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            success: false,
            data: None,
            error: Some(message.clone()),
            errors: vec![message],
        }
    }
}
