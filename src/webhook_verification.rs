//! # Webhook Signature Verification
//!
//! HMAC-SHA256 verification of webhook bodies against a provider-declared
//! signature header. Digests are compared in constant time to avoid leaking
//! the secret through timing.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::headers::RequestHeaders;
use crate::providers::ProviderConfig;

type HmacSha256 = Hmac<Sha256>;

/// Reasons a signature check did not pass
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("Webhook secret not configured for provider: {provider}")]
    NotConfigured { provider: String },

    #[error("Missing required signature header: {header}")]
    MissingSignature { header: String },

    #[error("Signature verification failed")]
    VerificationFailed,
}

/// Result type for webhook verification
pub type VerificationResult<T> = Result<T, VerificationError>;

/// Extract the candidate signature token from a signature header value.
///
/// Structured headers such as `t=1700000000,v1=<hex>` yield the `v1` segment;
/// prefixed values such as `sha256=<hex>` yield everything after the first `=`;
/// anything else is used verbatim.
pub fn extract_signature(header_value: &str) -> &str {
    if header_value.contains("v1=") {
        let versioned = header_value
            .split(',')
            .map(str::trim)
            .find_map(|segment| segment.strip_prefix("v1="));
        if let Some(token) = versioned {
            return token;
        }
    }

    match header_value.split_once('=') {
        Some((_, token)) => token,
        None => header_value,
    }
}

/// Compute the lowercase hex HMAC-SHA256 of `body` keyed with `secret`
pub fn compute_signature(secret: &[u8], body: &[u8]) -> VerificationResult<String> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|_| VerificationError::VerificationFailed)?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Compare two byte strings without short-circuiting on the first mismatch.
///
/// Only the length is allowed to leak; equal-length inputs are always
/// processed in full.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    expected.ct_eq(provided).into()
}

/// Check the signature of a raw webhook body for the given provider.
///
/// The digest is always computed over the bytes exactly as received.
pub fn check_signature(
    body: &[u8],
    provider: &ProviderConfig,
    headers: &RequestHeaders,
) -> VerificationResult<()> {
    let secret = provider
        .secret
        .as_deref()
        .filter(|secret| !secret.is_empty())
        .ok_or_else(|| VerificationError::NotConfigured {
            provider: provider.id.clone(),
        })?;

    let header_value = headers
        .get(&provider.signature_header)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| VerificationError::MissingSignature {
            header: provider.signature_header.clone(),
        })?;

    let provided = extract_signature(header_value);
    let expected = compute_signature(secret.as_bytes(), body)?;

    if constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        Ok(())
    } else {
        Err(VerificationError::VerificationFailed)
    }
}

/// Verify a webhook signature; any missing input or mismatch yields `false`
pub fn verify_signature(body: &[u8], provider: &ProviderConfig, headers: &RequestHeaders) -> bool {
    match check_signature(body, provider, headers) {
        Ok(()) => true,
        Err(reason) => {
            debug!(
                provider = %provider.id,
                body_size = body.len(),
                reason = %reason,
                "Webhook signature rejected"
            );
            false
        }
    }
}
