//! Authentication gate for FleetHub.
//!
//! Every connection passes through the gate before it is admitted. The default
//! policy admits everyone and only records whether a credential was supplied;
//! stricter policies reject missing or invalid tokens. Token validation itself
//! is delegated to a [`TokenValidator`], normally backed by an external
//! identity service.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Authentication errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No token was supplied but the policy requires one.
    #[error("Authentication token required")]
    MissingToken,

    /// The validator rejected the token.
    #[error("Invalid authentication token")]
    InvalidToken,

    /// Signature validation is configured but no validator is installed.
    #[error("No token validator configured")]
    ValidatorMissing,

    /// The validator could not reach a decision.
    #[error("Token validation failed: {0}")]
    Validator(String),
}

/// Admission policy applied to new connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthPolicy {
    /// Admit every connection.
    #[default]
    Permissive,
    /// Reject connections that present no token.
    RejectMissingToken,
    /// Require a token accepted by the configured validator.
    ValidateSignature,
}

impl fmt::Display for AuthPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthPolicy::Permissive => "permissive",
            AuthPolicy::RejectMissingToken => "reject_missing_token",
            AuthPolicy::ValidateSignature => "validate_signature",
        };
        f.write_str(name)
    }
}

/// Credentials presented during the transport handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Handshake {
    /// Opaque bearer token, if any.
    pub token: Option<String>,
}

impl Handshake {
    /// Create a handshake, treating an empty token as absent.
    #[must_use]
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()),
        }
    }

    /// Extract the token from an `Authorization` header value.
    ///
    /// Only the `Bearer` scheme is recognised.
    #[must_use]
    pub fn from_authorization(header: &str) -> Self {
        let token = header
            .split_once(' ')
            .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
            .map(|(_, token)| token.trim().to_string());
        Self::new(token)
    }
}

/// Result of a successful admission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Admission {
    /// Whether the handshake carried a token.
    pub token_present: bool,
    /// Subject reported by the validator, if one ran.
    pub subject: Option<String>,
}

/// Validates bearer tokens.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Check a token.
    ///
    /// Returns the token's subject, if the validator knows one.
    async fn validate(&self, token: &str) -> Result<Option<String>, AuthError>;
}

/// A validator that accepts a fixed set of shared tokens.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenValidator {
    tokens: HashSet<String>,
}

impl StaticTokenValidator {
    /// Create a validator accepting the given tokens.
    #[must_use]
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }
}

#[async_trait]
impl TokenValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> Result<Option<String>, AuthError> {
        if self.tokens.contains(token) {
            Ok(None)
        } else {
            Err(AuthError::InvalidToken)
        }
    }
}

/// The gate every connection passes before admission.
#[derive(Clone, Default)]
pub struct AuthGate {
    policy: AuthPolicy,
    validator: Option<Arc<dyn TokenValidator>>,
}

impl AuthGate {
    /// Create a gate with the given policy and no validator.
    #[must_use]
    pub fn new(policy: AuthPolicy) -> Self {
        Self {
            policy,
            validator: None,
        }
    }

    /// Install a token validator.
    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn TokenValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Get the active policy.
    #[must_use]
    pub fn policy(&self) -> AuthPolicy {
        self.policy
    }

    /// Decide whether a connection may proceed.
    ///
    /// The token value itself is never logged.
    ///
    /// # Errors
    ///
    /// Returns an error if the policy rejects the handshake.
    pub async fn admit(&self, handshake: &Handshake) -> Result<Admission, AuthError> {
        let token = handshake.token.as_deref();
        let token_present = token.is_some();

        match (self.policy, token) {
            (AuthPolicy::Permissive, _) => {
                if token_present {
                    debug!("Handshake token received");
                } else {
                    debug!("No handshake token provided");
                }
                Ok(Admission {
                    token_present,
                    subject: None,
                })
            }
            (AuthPolicy::RejectMissingToken, None) | (AuthPolicy::ValidateSignature, None) => {
                warn!(policy = %self.policy, "Rejected connection without token");
                Err(AuthError::MissingToken)
            }
            (AuthPolicy::RejectMissingToken, Some(_)) => {
                debug!("Handshake token received");
                Ok(Admission {
                    token_present,
                    subject: None,
                })
            }
            (AuthPolicy::ValidateSignature, Some(token)) => {
                let validator = self.validator.as_ref().ok_or(AuthError::ValidatorMissing)?;
                match validator.validate(token).await {
                    Ok(subject) => {
                        debug!(subject = ?subject, "Handshake token validated");
                        Ok(Admission {
                            token_present,
                            subject,
                        })
                    }
                    Err(e) => {
                        warn!(error = %e, "Rejected connection with invalid token");
                        Err(e)
                    }
                }
            }
        }
    }
}

impl fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthGate")
            .field("policy", &self.policy)
            .field("has_validator", &self.validator.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_token(token: &str) -> Handshake {
        Handshake::new(Some(token.to_string()))
    }

    #[tokio::test]
    async fn test_permissive_admits_everyone() {
        let gate = AuthGate::default();
        assert_eq!(gate.policy(), AuthPolicy::Permissive);

        let admission = gate.admit(&Handshake::default()).await.unwrap();
        assert!(!admission.token_present);

        let admission = gate.admit(&with_token("abc")).await.unwrap();
        assert!(admission.token_present);
    }

    #[tokio::test]
    async fn test_reject_missing_token() {
        let gate = AuthGate::new(AuthPolicy::RejectMissingToken);

        assert_eq!(
            gate.admit(&Handshake::default()).await,
            Err(AuthError::MissingToken)
        );
        // Empty tokens count as missing.
        assert_eq!(
            gate.admit(&Handshake::new(Some(String::new()))).await,
            Err(AuthError::MissingToken)
        );
        assert!(gate.admit(&with_token("anything")).await.is_ok());
    }

    #[tokio::test]
    async fn test_validate_signature() {
        let validator = StaticTokenValidator::new(["s3cret".to_string()]);
        let gate = AuthGate::new(AuthPolicy::ValidateSignature).with_validator(Arc::new(validator));

        assert!(gate.admit(&with_token("s3cret")).await.is_ok());
        assert_eq!(
            gate.admit(&with_token("guess")).await,
            Err(AuthError::InvalidToken)
        );
        assert_eq!(
            gate.admit(&Handshake::default()).await,
            Err(AuthError::MissingToken)
        );
    }

    #[tokio::test]
    async fn test_validate_signature_without_validator() {
        let gate = AuthGate::new(AuthPolicy::ValidateSignature);
        assert_eq!(
            gate.admit(&with_token("s3cret")).await,
            Err(AuthError::ValidatorMissing)
        );
    }

    #[test]
    fn test_bearer_header_parsing() {
        assert_eq!(
            Handshake::from_authorization("Bearer abc.def").token.as_deref(),
            Some("abc.def")
        );
        assert_eq!(
            Handshake::from_authorization("bearer xyz").token.as_deref(),
            Some("xyz")
        );
        assert!(Handshake::from_authorization("Basic dXNlcjpwdw==").token.is_none());
        assert!(Handshake::from_authorization("Bearer ").token.is_none());
    }

    #[test]
    fn test_policy_names() {
        let policy: AuthPolicy = serde_json::from_str("\"reject_missing_token\"").unwrap();
        assert_eq!(policy, AuthPolicy::RejectMissingToken);
        assert_eq!(AuthPolicy::ValidateSignature.to_string(), "validate_signature");
    }
}
