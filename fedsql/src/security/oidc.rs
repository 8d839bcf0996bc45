//! Bearer token validation.
//!
//! Dev mode (no JWKS endpoint configured): tokens are looked up in a static
//! map so the gateway and its tests run without an identity provider.
//!
//! Production mode: tokens are RS256/ES256 JWTs validated against the
//! provider's JWKS document, which is cached in-memory for an hour to avoid
//! hammering the IdP. A `kid` miss refreshes the document once before
//! giving up.

use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::warn;

use crate::errors::{Error, Result};
use crate::tenant::models::{SecurityContext, TenantConfig};

const JWKS_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Claims extracted from a validated JWT.
#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: String,
    #[serde(default)]
    email: String,
    #[serde(default = "default_role")]
    role: String,
    #[serde(default)]
    team_id: String,
    #[serde(default)]
    pii_access: bool,
}

fn default_role() -> String {
    "viewer".to_string()
}

pub struct OidcValidator {
    jwks_url: String,
    audience: String,
    http: reqwest::Client,
    jwks: RwLock<Option<(JwkSet, Instant)>>,
}

impl OidcValidator {
    pub fn new(jwks_url: impl Into<String>, audience: impl Into<String>) -> Self {
        let jwks_url = jwks_url.into();
        if jwks_url.is_empty() {
            warn!(
                "Token validation running in DEV MODE - JWKS_URL not set, using the static \
                 token map. Do NOT use this in production."
            );
        }
        Self {
            jwks_url,
            audience: audience.into(),
            http: reqwest::Client::new(),
            jwks: RwLock::new(None),
        }
    }

    fn dev_mode(&self) -> bool {
        self.jwks_url.is_empty()
    }

    /// Validate a bearer token and build the request's security context.
    pub async fn validate(
        &self,
        token: &str,
        tenant_cfg: Arc<TenantConfig>,
    ) -> Result<SecurityContext> {
        if self.dev_mode() {
            return Self::validate_dev(token, tenant_cfg);
        }
        self.validate_jwt(token, tenant_cfg).await
    }

    /// Static token map for local development and the test suite.
    fn validate_dev(token: &str, tenant_cfg: Arc<TenantConfig>) -> Result<SecurityContext> {
        let (user_id, email, role, team_id, pii_access) = match token {
            "token_dev" => ("u1", "dev@company.com", "developer", "mobile", true),
            "token_qa" => ("u2", "qa@company.com", "qa", "mobile", false),
            "token_web_dev" => ("u3", "webdev@company.com", "developer", "web", true),
            _ => {
                return Err(Error::AuthInvalid {
                    message: "Invalid token".to_string(),
                });
            }
        };
        Ok(SecurityContext {
            user_id: user_id.to_string(),
            email: email.to_string(),
            role: role.to_string(),
            team_id: team_id.to_string(),
            pii_access,
            tenant_id: tenant_cfg.tenant_id.clone(),
            tenant_cfg,
        })
    }

    async fn validate_jwt(
        &self,
        token: &str,
        tenant_cfg: Arc<TenantConfig>,
    ) -> Result<SecurityContext> {
        let header = decode_header(token).map_err(|e| Error::AuthInvalid {
            message: format!("Token validation failed: {e}"),
        })?;
        let kid = header.kid.ok_or_else(|| Error::AuthInvalid {
            message: "Token has no key id".to_string(),
        })?;

        let jwk = match self.find_key(&kid, false).await? {
            Some(jwk) => jwk,
            // kid miss: refresh the JWKS once and retry before rejecting
            None => self
                .find_key(&kid, true)
                .await?
                .ok_or_else(|| Error::AuthInvalid {
                    message: "Token signing key not found".to_string(),
                })?,
        };

        let algorithm = match &jwk.algorithm {
            AlgorithmParameters::RSA(_) => Algorithm::RS256,
            AlgorithmParameters::EllipticCurve(_) => Algorithm::ES256,
            _ => {
                return Err(Error::AuthInvalid {
                    message: "Unsupported signing key type".to_string(),
                });
            }
        };
        let key = DecodingKey::from_jwk(&jwk).map_err(|e| Error::AuthInvalid {
            message: format!("Token validation failed: {e}"),
        })?;

        let mut validation = Validation::new(algorithm);
        validation.set_audience(&[&self.audience]);

        let data = decode::<Claims>(token, &key, &validation).map_err(|e| Error::AuthInvalid {
            message: format!("Token validation failed: {e}"),
        })?;
        let claims = data.claims;

        Ok(SecurityContext {
            user_id: claims.sub,
            email: claims.email,
            role: claims.role,
            team_id: claims.team_id,
            pii_access: claims.pii_access,
            tenant_id: tenant_cfg.tenant_id.clone(),
            tenant_cfg,
        })
    }

    /// Look up a signing key by `kid`, optionally forcing a JWKS refresh.
    async fn find_key(&self, kid: &str, force_refresh: bool) -> Result<Option<Jwk>> {
        if !force_refresh {
            let cached = self.jwks.read().await;
            if let Some((jwks, fetched_at)) = cached.as_ref() {
                if fetched_at.elapsed() < JWKS_CACHE_TTL {
                    return Ok(find_in_set(jwks, kid));
                }
            }
        }

        let jwks: JwkSet = self
            .http
            .get(&self.jwks_url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| Error::AuthInvalid {
                message: format!("JWKS fetch failed: {e}"),
            })?
            .json()
            .await
            .map_err(|e| Error::AuthInvalid {
                message: format!("JWKS decode failed: {e}"),
            })?;

        let key = find_in_set(&jwks, kid);
        *self.jwks.write().await = Some((jwks, Instant::now()));
        Ok(key)
    }
}

fn find_in_set(jwks: &JwkSet, kid: &str) -> Option<Jwk> {
    jwks.keys
        .iter()
        .find(|k| k.common.key_id.as_deref() == Some(kid))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::demo_tenant;

    #[tokio::test]
    async fn dev_tokens_resolve_to_contexts() {
        let validator = OidcValidator::new("", "fedsql-dev");
        let tenant = Arc::new(demo_tenant("test"));

        let ctx = validator
            .validate("token_dev", tenant.clone())
            .await
            .expect("token_dev is valid");
        assert_eq!(ctx.team_id, "mobile");
        assert!(ctx.pii_access);

        let ctx = validator
            .validate("token_qa", tenant.clone())
            .await
            .expect("token_qa is valid");
        assert_eq!(ctx.role, "qa");
        assert!(!ctx.pii_access);

        let ctx = validator
            .validate("token_web_dev", tenant)
            .await
            .expect("token_web_dev is valid");
        assert_eq!(ctx.team_id, "web");
    }

    #[tokio::test]
    async fn unknown_dev_token_is_rejected() {
        let validator = OidcValidator::new("", "fedsql-dev");
        let tenant = Arc::new(demo_tenant("test"));
        let err = validator
            .validate("token_intruder", tenant)
            .await
            .expect_err("unknown token must fail");
        assert!(matches!(err, Error::AuthInvalid { .. }));
    }
}
