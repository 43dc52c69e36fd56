//! JWT bearer authentication and scope authorization

use gateway_core::{AuthConfig, Route};
use hyper::header::HeaderValue;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing or malformed Authorization header")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("missing required scope: {0}")]
    InsufficientScope(String),
}

impl AuthError {
    /// Label for `gateway_auth_failures_total`
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "missing_token",
            AuthError::InvalidToken(_) => "invalid_token",
            AuthError::InsufficientScope(_) => "insufficient_scope",
        }
    }
}

/// `aud` may be a single string or a list
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Default for Audience {
    fn default() -> Self {
        Audience::Many(Vec::new())
    }
}

/// Registered claims the gateway reads
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub sub: String,
    #[serde(default)]
    pub iss: String,
    #[serde(default)]
    pub aud: Audience,
    pub exp: u64,
    /// Space-delimited scope list
    #[serde(default)]
    pub scope: String,
}

impl Claims {
    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.scope.split_whitespace()
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes().any(|s| s == scope)
    }
}

/// HS256 token validator bound to one issuer and audience
pub struct Authenticator {
    enabled: bool,
    key: DecodingKey,
    validation: Validation,
    global_scopes: Vec<String>,
}

impl Authenticator {
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.set_audience(&[config.audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);

        Self {
            enabled: config.enabled,
            key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
            global_scopes: config.scopes.clone(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Authenticate a request for `route`.
    ///
    /// Returns `Ok(None)` when the route does not need a token.
    pub fn authenticate(
        &self,
        route: &Route,
        authorization: Option<&HeaderValue>,
    ) -> Result<Option<Claims>, AuthError> {
        if !self.enabled || !route.auth_required {
            return Ok(None);
        }

        let token = bearer_token(authorization).ok_or(AuthError::MissingToken)?;
        let claims = self.verify(token)?;

        let missing = self
            .global_scopes
            .iter()
            .chain(route.required_scopes.iter())
            .find(|required| !claims.has_scope(required));
        if let Some(scope) = missing {
            return Err(AuthError::InsufficientScope(scope.clone()));
        }

        debug!("Authenticated subject {:?} for {}", claims.sub, route.path_prefix);
        Ok(Some(claims))
    }

    /// Check signature, algorithm, issuer, audience and expiry
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| AuthError::InvalidToken(describe(e.kind())))
    }
}

/// Extract the token from `Authorization: Bearer <token>`
fn bearer_token(header: Option<&HeaderValue>) -> Option<&str> {
    let value = header?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn describe(kind: &ErrorKind) -> String {
    match kind {
        ErrorKind::ExpiredSignature => "token has expired".to_string(),
        ErrorKind::ImmatureSignature => "token is not valid yet".to_string(),
        ErrorKind::InvalidSignature => "signature is invalid".to_string(),
        ErrorKind::InvalidAlgorithm => "signing method is not allowed".to_string(),
        ErrorKind::InvalidIssuer => "issuer is invalid".to_string(),
        ErrorKind::InvalidAudience => "audience is invalid".to_string(),
        ErrorKind::MissingRequiredClaim(claim) => format!("missing required claim: {}", claim),
        _ => "token is malformed".to_string(),
    }
}
