//! Caller authentication.
//!
//! Vendor submissions can be required to carry an HMAC-SHA256 signature over
//! `"{timestamp}.{body}"` and to come from an allowlisted network. Lead
//! read-back can be gated by an HS256 bearer token. Each check is off until
//! its setting is configured.

use axum::http::{header, HeaderMap};
use hmac::{Hmac, Mac};
use ipnet::IpNet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::net::IpAddr;

use crate::config::Config;
use crate::errors::AppError;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-vendor-signature";
pub const TIMESTAMP_HEADER: &str = "x-vendor-timestamp";

fn unauthorized(msg: &str) -> AppError {
    AppError::Unauthorized(msg.to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Hex signature a vendor sends for `body` at unix `timestamp`.
pub fn sign(secret: &[u8], timestamp: i64, body: &[u8]) -> Result<String, AppError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|_| AppError::InternalError("invalid HMAC key".to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Source checks for inbound vendor submissions.
#[derive(Clone)]
pub struct VendorAuth {
    hmac_secret: Option<Vec<u8>>,
    max_age_secs: u64,
    allowlist: Vec<IpNet>,
}

impl VendorAuth {
    pub fn new(hmac_secret: Option<String>, max_age_secs: u64, allowlist: Vec<IpNet>) -> Self {
        Self {
            hmac_secret: hmac_secret.map(String::into_bytes),
            max_age_secs,
            allowlist,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.vendor_hmac_secret.clone(),
            config.signature_max_age_secs,
            config.ip_allowlist.clone(),
        )
    }

    /// Loopback is always admitted; an empty allowlist admits every address.
    pub fn check_ip(&self, ip: IpAddr) -> Result<(), AppError> {
        if self.allowlist.is_empty() || ip.is_loopback() {
            return Ok(());
        }

        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            other => other,
        };
        if self.allowlist.iter().any(|net| net.contains(&ip)) {
            return Ok(());
        }

        tracing::warn!("IP not in allowlist: {}", ip);
        Err(AppError::Forbidden("IP not in allowlist".to_string()))
    }

    pub fn verify_signature(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), AppError> {
        self.verify_signature_at(headers, body, chrono::Utc::now().timestamp())
    }

    /// Checks `X-Vendor-Signature` against the body and rejects timestamps
    /// more than `max_age_secs` away from `now` in either direction.
    pub fn verify_signature_at(
        &self,
        headers: &HeaderMap,
        body: &[u8],
        now: i64,
    ) -> Result<(), AppError> {
        let Some(secret) = &self.hmac_secret else {
            return Ok(());
        };

        let signature =
            header_str(headers, SIGNATURE_HEADER).ok_or_else(|| unauthorized("Missing signature"))?;
        let raw_timestamp =
            header_str(headers, TIMESTAMP_HEADER).ok_or_else(|| unauthorized("Missing timestamp"))?;
        let timestamp: i64 = raw_timestamp
            .parse()
            .map_err(|_| unauthorized("Invalid timestamp format"))?;

        let provided = hex::decode(signature.strip_prefix("sha256=").unwrap_or(signature))
            .map_err(|_| unauthorized("Invalid signature"))?;

        let mut mac = HmacSha256::new_from_slice(secret)
            .map_err(|_| AppError::InternalError("invalid HMAC key".to_string()))?;
        mac.update(raw_timestamp.as_bytes());
        mac.update(b".");
        mac.update(body);
        mac.verify_slice(&provided)
            .map_err(|_| unauthorized("Invalid signature"))?;

        if now.abs_diff(timestamp) > self.max_age_secs {
            return Err(unauthorized("Expired timestamp"));
        }

        Ok(())
    }
}

/// Claims carried by internal bearer tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalClaims {
    pub sub: String,
    pub exp: usize,
}

/// Bearer-token check for the lead read endpoint.
#[derive(Clone)]
pub struct ReadAuth {
    key: Option<DecodingKey>,
    validation: Validation,
}

impl ReadAuth {
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            key: secret.map(|s| DecodingKey::from_secret(s.as_bytes())),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.internal_jwt_secret.as_deref())
    }

    /// Returns the token's claims, or `None` when no secret is configured.
    pub fn verify(&self, headers: &HeaderMap) -> Result<Option<InternalClaims>, AppError> {
        let Some(key) = &self.key else {
            return Ok(None);
        };

        let raw = header_str(headers, header::AUTHORIZATION.as_str())
            .ok_or_else(|| unauthorized("Missing bearer token"))?;
        let token = raw.strip_prefix("Bearer ").unwrap_or(raw).trim();

        let data = jsonwebtoken::decode::<InternalClaims>(token, key, &self.validation)
            .map_err(|e| {
                tracing::debug!("JWT validation error: {}", e);
                unauthorized("Invalid token")
            })?;
        if data.claims.sub.trim().is_empty() {
            return Err(unauthorized("Invalid token: missing subject"));
        }

        Ok(Some(data.claims))
    }
}
