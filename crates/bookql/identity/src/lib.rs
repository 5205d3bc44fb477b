//! BookQL Identity - builds the per-request [`Identity`] from a bearer token.
//!
//! Cryptographic verification is delegated to a [`TokenVerifier`]
//! collaborator. Every failure mode of that collaborator collapses to an
//! anonymous identity: verification problems degrade, they never propagate
//! as faults to callers.

#![deny(unsafe_code)]

use bookql_types::{Claims, Identity, Role};
use thiserror::Error;

/// Why a token failed verification.
///
/// The extractor treats all variants identically; the taxonomy exists so
/// verifier implementations can report precisely and logs stay useful.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("malformed token")]
    Malformed,

    #[error("token expired")]
    Expired,

    #[error("token signature invalid")]
    SignatureInvalid,

    #[error("verifier failure: {0}")]
    Verifier(String),
}

/// Token-verification collaborator.
///
/// Implementations own signing and signature checks; this core only consumes
/// the verified [`Claims`].
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Claims, VerifyError>;
}

/// Turns bearer tokens into request identities.
pub struct ClaimExtractor<V> {
    verifier: V,
}

impl<V: TokenVerifier> ClaimExtractor<V> {
    pub fn new(verifier: V) -> Self {
        Self { verifier }
    }

    /// Extract an identity from a possibly empty bearer token.
    pub fn extract(&self, token: &str) -> Identity {
        self.extract_with_origin(token, None, None)
    }

    /// Extract an identity and attach transport origin metadata.
    pub fn extract_with_origin(
        &self,
        token: &str,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Identity {
        let mut identity = if token.is_empty() {
            Identity::anonymous()
        } else {
            match self.verifier.verify(token) {
                Ok(claims) => Identity {
                    subject_id: claims.subject_id,
                    email: claims.email,
                    role: Role::from_id(claims.role_id),
                    authenticated: true,
                    ip: None,
                    user_agent: None,
                },
                Err(err) => {
                    tracing::debug!(error = %err, "token verification failed, treating request as anonymous");
                    Identity::anonymous()
                }
            }
        };

        identity.ip = ip.map(str::to_string);
        identity.user_agent = user_agent.map(str::to_string);
        identity
    }
}
