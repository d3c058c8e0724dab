//! Identity resolution for metered calls.
//!
//! Upstream authenticators either place a verified user id on the request
//! or forward a signed bearer token that is re-verified here. The plan
//! carried in a token is a hint for downstream code only; admission always
//! re-reads the plan registry.

use crate::clock::Clock;
use crate::error::MeterError;
use crate::model::{PlanName, UserId};
use async_trait::async_trait;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// What the caller presented.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credential {
    /// Already authenticated upstream.
    Verified(UserId),
    /// `Authorization: Bearer <token>`.
    Bearer(String),
    Anonymous,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub user: UserId,
    pub plan_hint: Option<PlanName>,
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, credential: &Credential) -> Result<Identity, MeterError>;
}

/// Accepts only identities verified upstream.
#[derive(Clone, Copy, Debug, Default)]
pub struct TrustedIdentity;

#[async_trait]
impl IdentityResolver for TrustedIdentity {
    async fn resolve(&self, credential: &Credential) -> Result<Identity, MeterError> {
        match credential {
            Credential::Verified(user) => Ok(Identity { user: user.clone(), plan_hint: None }),
            Credential::Bearer(_) => {
                Err(MeterError::Unauthorized("bearer tokens not accepted".into()))
            }
            Credential::Anonymous => Err(MeterError::Unauthorized("missing credentials".into())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    pub iat: u64,
    pub exp: u64,
}

/// HS256 bearer tokens.
pub struct JwtIdentity {
    encoding: EncodingKey,
    decoding: DecodingKey,
    clock: Arc<dyn Clock>,
    leeway_secs: u64,
}

impl std::fmt::Debug for JwtIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtIdentity")
            .field("leeway_secs", &self.leeway_secs)
            .finish_non_exhaustive()
    }
}

impl JwtIdentity {
    pub fn new(secret: &[u8], clock: Arc<dyn Clock>) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            clock,
            leeway_secs: 30,
        }
    }

    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway_secs = leeway.as_secs();
        self
    }

    fn now_secs(&self) -> u64 {
        self.clock.now_millis() / 1_000
    }

    /// Mint a token for `user` valid for `ttl`.
    pub fn issue(
        &self,
        user: &UserId,
        plan: Option<&PlanName>,
        ttl: Duration,
    ) -> Result<String, MeterError> {
        let iat = self.now_secs();
        let claims = Claims {
            sub: user.to_string(),
            plan: plan.map(|p| p.to_string()),
            iat,
            exp: iat.saturating_add(ttl.as_secs()),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| MeterError::Internal(format!("token signing failed: {e}")))
    }

    /// Check signature and expiry.
    pub fn verify(&self, token: &str) -> Result<Claims, MeterError> {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked against the injected clock below.
        validation.validate_exp = false;
        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|e| {
            debug!(target: "metered::envelope", error = %e, "bearer token rejected");
            MeterError::Unauthorized("invalid token".into())
        })?;
        let claims = data.claims;
        if claims.exp.saturating_add(self.leeway_secs) < self.now_secs() {
            return Err(MeterError::Unauthorized("token expired".into()));
        }
        if claims.sub.trim().is_empty() {
            return Err(MeterError::Unauthorized("token has no subject".into()));
        }
        Ok(claims)
    }
}

#[async_trait]
impl IdentityResolver for JwtIdentity {
    async fn resolve(&self, credential: &Credential) -> Result<Identity, MeterError> {
        match credential {
            Credential::Verified(user) => Ok(Identity { user: user.clone(), plan_hint: None }),
            Credential::Bearer(token) => {
                let claims = self.verify(token)?;
                Ok(Identity {
                    user: UserId::new(claims.sub),
                    plan_hint: claims.plan.map(PlanName::new),
                })
            }
            Credential::Anonymous => Err(MeterError::Unauthorized("missing credentials".into())),
        }
    }
}
