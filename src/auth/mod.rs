//! Signed bearer tokens for the Clair indexer.
//!
//! Clair authenticates service-to-service calls with HS256 JWTs signed by a
//! pre-shared key. Minting a token per request is wasteful, so
//! [`TokenCache`] keeps one and re-signs it only once it gets within the
//! leeway window of its expiry.

use crate::{Error, Result};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Issuer Clair expects for tokens minted on Quay's behalf.
pub const DEFAULT_ISSUER: &str = "quay";

/// Token lifetime and refresh window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPolicy {
    /// `iss` claim.
    pub issuer: String,
    /// Time from signing to `exp`.
    pub lifetime: Duration,
    /// Tokens this close to expiry are re-signed. Also back-dates `nbf` to
    /// tolerate clock skew.
    pub leeway: Duration,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            issuer: DEFAULT_ISSUER.to_string(),
            lifetime: Duration::from_secs(15 * 60),
            leeway: Duration::from_secs(60),
        }
    }
}

/// JWT claims minted for the indexer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    /// Issuer.
    pub iss: String,
    /// Issued at (Unix seconds).
    pub iat: u64,
    /// Not before (Unix seconds).
    pub nbf: u64,
    /// Expiry (Unix seconds).
    pub exp: u64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: u64,
}

impl CachedToken {
    const fn fresh_at(&self, now: u64, leeway: Duration) -> bool {
        self.expires_at.saturating_sub(now) > leeway.as_secs()
    }
}

/// Single-slot cache of the current indexer token.
pub struct TokenCache {
    key: EncodingKey,
    policy: TokenPolicy,
    slot: RwLock<Option<CachedToken>>,
}

impl fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCache")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl TokenCache {
    /// Creates a cache signing with the HS256 key `psk`.
    #[must_use]
    pub fn new(psk: &[u8], policy: TokenPolicy) -> Self {
        Self {
            key: EncodingKey::from_secret(psk),
            policy,
            slot: RwLock::new(None),
        }
    }

    /// Returns a token valid at the current time.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn get(&self) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.get_or_refresh(now)
    }

    /// Returns the cached token, or signs and caches a new one if the cached
    /// token expires within the leeway of `now` (Unix seconds).
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails or the lock is poisoned.
    pub fn get_or_refresh(&self, now: u64) -> Result<String> {
        {
            let slot = self.slot.read().map_err(poisoned)?;
            if let Some(cached) = slot.as_ref()
                && cached.fresh_at(now, self.policy.leeway)
            {
                return Ok(cached.token.clone());
            }
        }

        let mut slot = self.slot.write().map_err(poisoned)?;
        // Another caller may have refreshed while this one waited.
        if let Some(cached) = slot.as_ref()
            && cached.fresh_at(now, self.policy.leeway)
        {
            return Ok(cached.token.clone());
        }
        let claims = self.claims(now);
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.key)
            .map_err(|e| Error::operation("jwt_sign", e))?;
        tracing::debug!(expires_at = claims.exp, "signed new indexer token");
        *slot = Some(CachedToken {
            token: token.clone(),
            expires_at: claims.exp,
        });
        Ok(token)
    }

    fn claims(&self, now: u64) -> Claims {
        Claims {
            iss: self.policy.issuer.clone(),
            iat: now,
            nbf: now.saturating_sub(self.policy.leeway.as_secs()),
            exp: now + self.policy.lifetime.as_secs(),
        }
    }
}

#[allow(clippy::needless_pass_by_value)]
fn poisoned<T>(e: std::sync::PoisonError<T>) -> Error {
    Error::operation("token_cache_lock", e.to_string())
}
