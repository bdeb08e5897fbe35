//! Connection Validation
//!
//! Turns a connection request's identity payload into an `Identity`, or a
//! rejection reason. Tokens are JWTs issued by an external provider; the
//! host only validates them.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::gate::ConnectionRequest;

/// Payload key carrying the display name.
pub const NAME_KEY: &str = "name";
/// Payload key carrying the JWT.
pub const TOKEN_KEY: &str = "token";

const MAX_NAME_LEN: usize = 32;

/// Who a validated connection belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable subject (token `sub`, or the name for open validation).
    pub subject: String,
    /// Name shown to the opponent.
    pub display_name: String,
}

/// Validation errors. The display string is the rejection reason.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No authentication configured on the host.
    #[error("authentication not configured")]
    NotConfigured,
    /// Payload entry missing or empty.
    #[error("missing {0}")]
    MissingField(&'static str),
    /// Display name too long or unprintable.
    #[error("invalid display name")]
    InvalidName,
    /// Token format is invalid.
    #[error("invalid token format")]
    InvalidFormat,
    /// Token signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token has expired.
    #[error("token expired")]
    Expired,
    /// Issuer claim doesn't match.
    #[error("invalid issuer")]
    InvalidIssuer,
    /// Audience claim doesn't match.
    #[error("invalid audience")]
    InvalidAudience,
    /// Identity is not on the allocated roster.
    #[error("{0} is not on the roster for this session")]
    NotOnRoster(String),
    /// Other JWT decoding error.
    #[error("decode error: {0}")]
    Decode(String),
}

/// External validator collaborator consulted by the gate.
pub trait ConnectionValidator: Send + Sync {
    /// Accept the request with an identity, or reject with a reason.
    fn validate(&self, request: &ConnectionRequest) -> Result<Identity, AuthError>;
}

fn checked_name(raw: &str) -> Result<String, AuthError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(AuthError::MissingField(NAME_KEY));
    }
    if name.chars().count() > MAX_NAME_LEN || name.chars().any(char::is_control) {
        return Err(AuthError::InvalidName);
    }
    Ok(name.to_string())
}

/// Accepts anyone who brings a sensible display name.
#[derive(Debug, Clone, Default)]
pub struct OpenValidator;

impl ConnectionValidator for OpenValidator {
    fn validate(&self, request: &ConnectionRequest) -> Result<Identity, AuthError> {
        let raw = request
            .payload
            .get(NAME_KEY)
            .ok_or(AuthError::MissingField(NAME_KEY))?;
        let name = checked_name(raw)?;
        Ok(Identity {
            subject: name.clone(),
            display_name: name,
        })
    }
}

/// JWT validation settings.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Expected issuer claim ("iss"). If None, any issuer accepted.
    pub issuer: Option<String>,
    /// Expected audience claim ("aud"). If None, any audience accepted.
    pub audience: Option<String>,
    /// RS256 public key in PEM format.
    pub public_key_pem: Option<String>,
    /// HS256 secret.
    pub secret: Option<String>,
    /// Skip expiry validation (testing only).
    pub skip_expiry: bool,
}

impl AuthConfig {
    /// Read `AUTH_*` variables.
    pub fn from_env() -> Self {
        Self {
            issuer: std::env::var("AUTH_ISSUER").ok(),
            audience: std::env::var("AUTH_AUDIENCE").ok(),
            public_key_pem: std::env::var("AUTH_PUBLIC_KEY_PEM").ok(),
            secret: std::env::var("AUTH_SECRET").ok(),
            skip_expiry: std::env::var("AUTH_SKIP_EXPIRY")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }

    /// Is a key or secret present.
    pub fn is_configured(&self) -> bool {
        self.public_key_pem.is_some() || self.secret.is_some()
    }
}

/// Claims expected from the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject, the provider's user id.
    pub sub: String,
    /// Optional display name claim.
    #[serde(default)]
    pub name: Option<String>,
    /// Expiry (Unix seconds).
    #[serde(default)]
    pub exp: u64,
    /// Issued at.
    #[serde(default)]
    pub iat: u64,
    /// Issuer.
    #[serde(default)]
    pub iss: Option<String>,
    /// Audience.
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
}

/// Validate a JWT and extract its claims.
pub fn validate_token(token: &str, config: &AuthConfig) -> Result<TokenClaims, AuthError> {
    let (key, algorithm) = match (&config.public_key_pem, &config.secret) {
        (Some(pem), _) => (
            DecodingKey::from_rsa_pem(pem.as_bytes())
                .map_err(|e| AuthError::Decode(format!("invalid public key: {}", e)))?,
            Algorithm::RS256,
        ),
        (None, Some(secret)) => (DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256),
        (None, None) => return Err(AuthError::NotConfigured),
    };

    let mut validation = Validation::new(algorithm);
    validation.required_spec_claims = HashSet::new();
    if let Some(ref issuer) = config.issuer {
        validation.set_issuer(&[issuer]);
    }
    match config.audience {
        Some(ref audience) => validation.set_audience(&[audience]),
        None => validation.validate_aud = false,
    }
    if config.skip_expiry {
        validation.validate_exp = false;
    }

    let data: TokenData<TokenClaims> = decode(token, &key, &validation).map_err(map_jwt_error)?;
    let claims = data.claims;

    if claims.sub.is_empty() {
        return Err(AuthError::MissingField("sub"));
    }
    if !config.skip_expiry && claims.exp > 0 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if now > claims.exp {
            return Err(AuthError::Expired);
        }
    }
    Ok(claims)
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
        ErrorKind::InvalidAudience => AuthError::InvalidAudience,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) => AuthError::InvalidFormat,
        _ => AuthError::Decode(err.to_string()),
    }
}

/// Requires a valid JWT in the `token` payload entry.
#[derive(Debug, Clone)]
pub struct TokenValidator {
    config: AuthConfig,
}

impl TokenValidator {
    /// Validate against `config`.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }
}

impl ConnectionValidator for TokenValidator {
    fn validate(&self, request: &ConnectionRequest) -> Result<Identity, AuthError> {
        let token = request
            .payload
            .get(TOKEN_KEY)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingField(TOKEN_KEY))?;
        let claims = validate_token(token, &self.config)?;

        // Payload name wins over the claim so players can pick a nickname.
        let display = request
            .payload
            .get(NAME_KEY)
            .or(claims.name.as_ref())
            .map(String::as_str)
            .unwrap_or(claims.sub.as_str());
        Ok(Identity {
            display_name: checked_name(display)?,
            subject: claims.sub,
        })
    }
}

/// Only admits subjects on the allocated roster. An empty roster admits
/// anyone the inner validator accepts.
pub struct RosterValidator {
    inner: Arc<dyn ConnectionValidator>,
    roster: RwLock<BTreeSet<String>>,
}

impl RosterValidator {
    /// Wrap `inner` with an (initially empty) roster check.
    pub fn new(inner: Arc<dyn ConnectionValidator>) -> Self {
        Self {
            inner,
            roster: RwLock::new(BTreeSet::new()),
        }
    }

    /// Replace the allowed subjects.
    pub fn set_roster(&self, subjects: impl IntoIterator<Item = String>) {
        *self.roster.write().unwrap_or_else(PoisonError::into_inner) = subjects.into_iter().collect();
    }
}

impl ConnectionValidator for RosterValidator {
    fn validate(&self, request: &ConnectionRequest) -> Result<Identity, AuthError> {
        let identity = self.inner.validate(request)?;
        let roster = self.roster.read().unwrap_or_else(PoisonError::into_inner);
        if !roster.is_empty() && !roster.contains(&identity.subject) {
            return Err(AuthError::NotOnRoster(identity.subject));
        }
        Ok(identity)
    }
}
