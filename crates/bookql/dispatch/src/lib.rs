//! BookQL Dispatch - binds operation names to handlers and gates every
//! invocation behind the policy check sequence.
//!
//! The check order is fixed and short-circuits: authentication, then role,
//! then ownership. A request that fails authentication reports
//! "Authentication required" even when it would also fail the later checks;
//! reordering would leak which checks exist to unauthenticated callers.
//!
//! The registry is built once at startup and is read-only afterwards, so
//! lookups need no synchronization. Handler faults are caught at this
//! boundary and become error envelopes; they never crash the dispatcher.

#![deny(unsafe_code)]

use bookql_identity::{ClaimExtractor, TokenVerifier};
use bookql_parser::{error_payload, parse_query, validate};
use bookql_policy::{AuditEntry, AuditSink};
use bookql_types::{Identity, OperationKind, ResultEnvelope, Role};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Argument keys that may carry a resource owner id, highest priority first.
/// The order is load-bearing: `userId` wins over `id` when both are present.
const OWNERSHIP_ARG_KEYS: [&str; 4] = ["userId", "id", "orderId", "cartId"];

/// Everything a handler receives for one invocation. The argument map is a
/// per-request snapshot; handlers never see another handler's mutations.
#[derive(Clone, Debug)]
pub struct ResolverParams {
    pub arguments: BTreeMap<String, String>,
    pub identity: Identity,
    pub query: String,
    pub operation_name: String,
}

/// A business handler. Domain validation and I/O live behind this boundary;
/// a returned error is a fault and gets wrapped, never propagated.
pub type HandlerFn =
    Box<dyn Fn(&ResolverParams) -> Result<ResultEnvelope, anyhow::Error> + Send + Sync>;

/// One operation registration: the handler plus its policy flags.
pub struct Registration {
    handler: HandlerFn,
    require_auth: bool,
    required_role: Role,
    require_ownership: bool,
}

impl Registration {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&ResolverParams) -> Result<ResultEnvelope, anyhow::Error> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            require_auth: false,
            required_role: Role::User,
            require_ownership: false,
        }
    }

    pub fn require_auth(mut self) -> Self {
        self.require_auth = true;
        self
    }

    pub fn required_role(mut self, role: Role) -> Self {
        self.required_role = role;
        self
    }

    pub fn require_ownership(mut self) -> Self {
        self.require_ownership = true;
        self
    }
}

/// Registration-time errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{kind} field already registered: {name}")]
    Duplicate { kind: OperationKind, name: String },
}

/// Accumulates registrations during startup; [`RegistryBuilder::build`]
/// freezes them for the process lifetime.
#[derive(Default)]
pub struct RegistryBuilder {
    namespaces: HashMap<OperationKind, HashMap<String, Registration>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation. Each name may be registered once per
    /// namespace; query, mutation, and subscription names are independent.
    pub fn register(
        &mut self,
        kind: OperationKind,
        name: &str,
        registration: Registration,
    ) -> Result<(), RegistryError> {
        let namespace = self.namespaces.entry(kind).or_default();
        if namespace.contains_key(name) {
            return Err(RegistryError::Duplicate {
                kind,
                name: name.to_string(),
            });
        }
        namespace.insert(name.to_string(), registration);
        Ok(())
    }

    pub fn build(self) -> Registry {
        Registry {
            namespaces: self.namespaces,
        }
    }
}

/// Immutable name-to-handler mapping, one table per namespace.
pub struct Registry {
    namespaces: HashMap<OperationKind, HashMap<String, Registration>>,
}

impl Registry {
    pub fn lookup(&self, kind: OperationKind, name: &str) -> Option<&Registration> {
        self.namespaces.get(&kind)?.get(name)
    }
}

/// Executes the check sequence and invokes handlers.
pub struct Dispatcher {
    registry: Registry,
    audit: Arc<dyn AuditSink>,
}

impl Dispatcher {
    pub fn new(registry: Registry, audit: Arc<dyn AuditSink>) -> Self {
        Self { registry, audit }
    }

    /// Dispatch one field under the given namespace.
    ///
    /// Every outcome is a [`ResultEnvelope`] and every allow/deny decision is
    /// audited; lookup misses are reported without an audit entry since no
    /// policy was evaluated.
    pub fn dispatch(
        &self,
        kind: OperationKind,
        field_name: &str,
        params: &ResolverParams,
    ) -> ResultEnvelope {
        let Some(registration) = self.registry.lookup(kind, field_name) else {
            tracing::debug!(%kind, field = field_name, "no handler registered");
            return ResultEnvelope::error(format!("Unknown {kind} field: {field_name}"));
        };

        let identity = &params.identity;

        if registration.require_auth && !identity.authenticated {
            tracing::debug!(%kind, field = field_name, "denied at auth check");
            self.record(identity, field_name, false);
            return ResultEnvelope::error("Authentication required");
        }

        if registration.required_role > Role::User && identity.role < registration.required_role {
            tracing::debug!(
                %kind,
                field = field_name,
                required = %registration.required_role,
                actual = %identity.role,
                "denied at role check"
            );
            self.record(identity, field_name, false);
            return ResultEnvelope::error("Insufficient permissions");
        }

        if registration.require_ownership && !ownership_allows(identity, &params.arguments) {
            tracing::debug!(%kind, field = field_name, "denied at ownership check");
            self.record(identity, field_name, false);
            return ResultEnvelope::error("Authorization failed");
        }

        self.record(identity, field_name, true);
        tracing::debug!(%kind, field = field_name, "checks passed, invoking handler");

        match (registration.handler)(params) {
            Ok(envelope) => envelope,
            Err(fault) => {
                tracing::debug!(%kind, field = field_name, error = %fault, "handler fault");
                ResultEnvelope::error(format!("Resolver error: {fault}"))
            }
        }
    }

    fn record(&self, identity: &Identity, operation: &str, allowed: bool) {
        self.audit.record(AuditEntry::new(identity, operation, allowed));
    }
}

/// Ownership check: find the first resource-id argument in priority order.
/// No id argument means nothing to compare, so the check passes vacuously.
fn ownership_allows(identity: &Identity, arguments: &BTreeMap<String, String>) -> bool {
    let Some(target) = OWNERSHIP_ARG_KEYS.iter().find_map(|key| arguments.get(*key)) else {
        return true;
    };
    identity.subject_id == *target || identity.role >= Role::Staff
}

/// The full request pipeline: token to identity, text to tree, tree to
/// dispatched field. One addressed field is served per request.
pub struct Executor<V> {
    extractor: ClaimExtractor<V>,
    dispatcher: Dispatcher,
}

impl<V: TokenVerifier> Executor<V> {
    pub fn new(extractor: ClaimExtractor<V>, dispatcher: Dispatcher) -> Self {
        Self {
            extractor,
            dispatcher,
        }
    }

    /// Execute a raw request: possibly empty bearer token plus query text.
    pub fn execute(&self, query: &str, token: &str) -> ResultEnvelope {
        let identity = self.extractor.extract(token);
        self.execute_as(query, identity)
    }

    /// Execute with an identity the caller already extracted.
    pub fn execute_as(&self, query: &str, identity: Identity) -> ResultEnvelope {
        let tree = parse_query(query);
        tracing::debug!(kind = %tree.kind, fields = tree.fields.len(), "parsed request");

        if !validate(&tree) {
            let mut envelope = ResultEnvelope::error("Invalid query format");
            envelope.errors = vec![error_payload("Invalid query format", &[1]).to_string()];
            return envelope;
        }

        let field = &tree.fields[0];
        let params = ResolverParams {
            arguments: field.arguments.clone(),
            identity,
            query: query.to_string(),
            operation_name: field.name.clone(),
        };
        self.dispatcher.dispatch(tree.kind, &field.name, &params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bookql_identity::VerifyError;
    use bookql_policy::MemoryAuditSink;
    use bookql_types::Claims;
    use serde_json::json;

    fn identity(subject_id: &str, role: Role) -> Identity {
        Identity {
            subject_id: subject_id.to_string(),
            email: format!("{subject_id}@example.com"),
            role,
            authenticated: true,
            ip: None,
            user_agent: None,
        }
    }

    fn params(identity: Identity, arguments: &[(&str, &str)]) -> ResolverParams {
        ResolverParams {
            arguments: arguments
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            identity,
            query: String::new(),
            operation_name: String::new(),
        }
    }

    fn echo_handler(params: &ResolverParams) -> Result<ResultEnvelope, anyhow::Error> {
        Ok(ResultEnvelope::ok(json!({
            "subject": params.identity.subject_id,
        })))
    }

    fn dispatcher_with(
        registrations: Vec<(OperationKind, &str, Registration)>,
    ) -> (Dispatcher, Arc<MemoryAuditSink>) {
        let mut builder = RegistryBuilder::new();
        for (kind, name, registration) in registrations {
            builder.register(kind, name, registration).unwrap();
        }
        let audit = Arc::new(MemoryAuditSink::new());
        (
            Dispatcher::new(builder.build(), audit.clone() as Arc<dyn AuditSink>),
            audit,
        )
    }

    #[test]
    fn unknown_field_returns_not_found_envelope() {
        let (dispatcher, audit) = dispatcher_with(vec![]);
        let result = dispatcher.dispatch(
            OperationKind::Query,
            "nothing",
            &params(Identity::anonymous(), &[]),
        );
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Unknown query field: nothing"));
        assert!(audit.entries().is_empty());
    }

    #[test]
    fn namespaces_are_independent() {
        let (dispatcher, _audit) = dispatcher_with(vec![(
            OperationKind::Mutation,
            "createOrder",
            Registration::new(echo_handler),
        )]);
        let result = dispatcher.dispatch(
            OperationKind::Query,
            "createOrder",
            &params(identity("1", Role::User), &[]),
        );
        assert_eq!(
            result.error.as_deref(),
            Some("Unknown query field: createOrder")
        );
    }

    #[test]
    fn auth_check_fires_before_role_check() {
        let (dispatcher, audit) = dispatcher_with(vec![(
            OperationKind::Query,
            "orders",
            Registration::new(echo_handler)
                .require_auth()
                .required_role(Role::Staff),
        )]);

        // Anonymous fails both checks but must see the auth message.
        let result = dispatcher.dispatch(
            OperationKind::Query,
            "orders",
            &params(Identity::anonymous(), &[]),
        );
        assert_eq!(result.error.as_deref(), Some("Authentication required"));

        let entries = audit.entries();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].allowed);
        assert_eq!(entries[0].operation, "orders");
    }

    #[test]
    fn role_check_denies_below_the_floor() {
        let (dispatcher, _audit) = dispatcher_with(vec![(
            OperationKind::Query,
            "orders",
            Registration::new(echo_handler)
                .require_auth()
                .required_role(Role::Staff),
        )]);

        let denied = dispatcher.dispatch(
            OperationKind::Query,
            "orders",
            &params(identity("1", Role::User), &[]),
        );
        assert_eq!(denied.error.as_deref(), Some("Insufficient permissions"));

        let allowed = dispatcher.dispatch(
            OperationKind::Query,
            "orders",
            &params(identity("1", Role::Admin), &[]),
        );
        assert!(allowed.success);
    }

    #[test]
    fn ownership_passes_for_the_owner_and_for_staff() {
        let (dispatcher, _audit) = dispatcher_with(vec![(
            OperationKind::Query,
            "order",
            Registration::new(echo_handler)
                .require_auth()
                .require_ownership(),
        )]);

        let owner = dispatcher.dispatch(
            OperationKind::Query,
            "order",
            &params(identity("42", Role::User), &[("id", "42")]),
        );
        assert!(owner.success);

        let other = dispatcher.dispatch(
            OperationKind::Query,
            "order",
            &params(identity("7", Role::User), &[("id", "42")]),
        );
        assert_eq!(other.error.as_deref(), Some("Authorization failed"));

        let staff = dispatcher.dispatch(
            OperationKind::Query,
            "order",
            &params(identity("7", Role::Staff), &[("id", "42")]),
        );
        assert!(staff.success);
    }

    #[test]
    fn ownership_without_an_id_argument_passes_vacuously() {
        let (dispatcher, _audit) = dispatcher_with(vec![(
            OperationKind::Query,
            "myOrders",
            Registration::new(echo_handler)
                .require_auth()
                .require_ownership(),
        )]);

        let result = dispatcher.dispatch(
            OperationKind::Query,
            "myOrders",
            &params(identity("42", Role::User), &[("limit", "10")]),
        );
        assert!(result.success);
    }

    #[test]
    fn ownership_key_priority_prefers_user_id() {
        let (dispatcher, _audit) = dispatcher_with(vec![(
            OperationKind::Query,
            "order",
            Registration::new(echo_handler)
                .require_auth()
                .require_ownership(),
        )]);

        // Subject matches `id` but not `userId`; `userId` takes priority.
        let result = dispatcher.dispatch(
            OperationKind::Query,
            "order",
            &params(identity("42", Role::User), &[("userId", "7"), ("id", "42")]),
        );
        assert_eq!(result.error.as_deref(), Some("Authorization failed"));
    }

    #[test]
    fn handler_fault_becomes_an_error_envelope() {
        let (dispatcher, audit) = dispatcher_with(vec![(
            OperationKind::Query,
            "flaky",
            Registration::new(|_: &ResolverParams| Err(anyhow::anyhow!("backend unavailable"))),
        )]);

        let result = dispatcher.dispatch(
            OperationKind::Query,
            "flaky",
            &params(identity("1", Role::User), &[]),
        );
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("Resolver error: backend unavailable")
        );
        // The decision itself was an allow; the fault came after the gate.
        assert!(audit.entries()[0].allowed);

        // The dispatcher stays alive for the next request.
        let again = dispatcher.dispatch(
            OperationKind::Query,
            "flaky",
            &params(identity("1", Role::User), &[]),
        );
        assert!(!again.success);
    }

    #[test]
    fn duplicate_registration_is_rejected_per_namespace() {
        let mut builder = RegistryBuilder::new();
        builder
            .register(OperationKind::Query, "me", Registration::new(echo_handler))
            .unwrap();

        let duplicate =
            builder.register(OperationKind::Query, "me", Registration::new(echo_handler));
        assert!(matches!(
            duplicate,
            Err(RegistryError::Duplicate { kind: OperationKind::Query, ref name }) if name == "me"
        ));

        // Same name under another namespace is fine.
        builder
            .register(
                OperationKind::Mutation,
                "me",
                Registration::new(echo_handler),
            )
            .unwrap();
    }

    #[test]
    fn allow_decisions_are_audited_with_identity_details() {
        let (dispatcher, audit) = dispatcher_with(vec![(
            OperationKind::Query,
            "me",
            Registration::new(echo_handler).require_auth(),
        )]);

        let result = dispatcher.dispatch(
            OperationKind::Query,
            "me",
            &params(identity("42", Role::Staff), &[]),
        );
        assert!(result.success);

        let entries = audit.entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].allowed);
        assert_eq!(entries[0].email, "42@example.com");
        assert_eq!(entries[0].role_id, 1);
        assert_eq!(entries[0].operation, "me");
    }

    // End-to-end pipeline tests.

    struct StaticVerifier {
        claims: Option<Claims>,
    }

    impl TokenVerifier for StaticVerifier {
        fn verify(&self, _token: &str) -> Result<Claims, VerifyError> {
            self.claims.clone().ok_or(VerifyError::SignatureInvalid)
        }
    }

    fn executor_with(
        claims: Option<Claims>,
        registrations: Vec<(OperationKind, &str, Registration)>,
    ) -> (Executor<StaticVerifier>, Arc<MemoryAuditSink>) {
        let (dispatcher, audit) = dispatcher_with(registrations);
        (
            Executor::new(ClaimExtractor::new(StaticVerifier { claims }), dispatcher),
            audit,
        )
    }

    fn user_claims(subject_id: &str) -> Claims {
        Claims {
            subject_id: subject_id.to_string(),
            email: format!("{subject_id}@example.com"),
            role_name: "user".to_string(),
            role_id: 0,
            issued_at: chrono::Utc::now(),
            expires_at: chrono::Utc::now() + chrono::Duration::hours(24),
        }
    }

    #[test]
    fn end_to_end_unauthenticated_me_is_denied() {
        let (executor, _audit) = executor_with(
            None,
            vec![(
                OperationKind::Query,
                "me",
                Registration::new(echo_handler).require_auth(),
            )],
        );

        let result = executor.execute("{ me { id, email } }", "");
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Authentication required"));
    }

    #[test]
    fn end_to_end_owner_reaches_the_handler() {
        let (executor, audit) = executor_with(
            Some(user_claims("42")),
            vec![(
                OperationKind::Query,
                "order",
                Registration::new(echo_handler)
                    .require_auth()
                    .require_ownership(),
            )],
        );

        let result = executor.execute(r#"{ order(id: "42") { status } }"#, "token");
        assert!(result.success);
        assert_eq!(result.data.unwrap()["subject"], "42");
        assert!(audit.entries()[0].allowed);
    }

    #[test]
    fn end_to_end_invalid_query_is_rejected_uniformly() {
        let (executor, audit) = executor_with(Some(user_claims("42")), vec![]);

        let result = executor.execute("definitely not a query", "token");
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Invalid query format"));
        assert!(result.errors[0].contains("\"errors\""));
        // Nothing was dispatched, so nothing was audited.
        assert!(audit.entries().is_empty());
    }

    #[test]
    fn end_to_end_unterminated_arguments_never_reach_ownership_handlers() {
        let (executor, audit) = executor_with(
            Some(user_claims("7")),
            vec![(
                OperationKind::Query,
                "order",
                Registration::new(echo_handler)
                    .require_auth()
                    .require_ownership(),
            )],
        );

        // The argument list never closes, so the resource id is unknowable.
        // The request must be rejected outright, not dispatched with an empty
        // argument snapshot that would pass the ownership check vacuously.
        let result = executor.execute(r#"{ order(id: "42" }"#, "token");
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Invalid query format"));
        assert!(audit.entries().is_empty());
    }

    #[test]
    fn end_to_end_mutation_namespace_is_used() {
        let (executor, _audit) = executor_with(
            Some(user_claims("42")),
            vec![(
                OperationKind::Mutation,
                "createOrder",
                Registration::new(echo_handler).require_auth(),
            )],
        );

        let ok = executor.execute(r#"mutation { createOrder(userId: "42") }"#, "token");
        assert!(ok.success);

        let wrong_namespace = executor.execute(r#"{ createOrder(userId: "42") }"#, "token");
        assert_eq!(
            wrong_namespace.error.as_deref(),
            Some("Unknown query field: createOrder")
        );
    }
}
