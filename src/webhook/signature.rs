use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha512};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header missing")]
    MissingHeader,

    #[error("unrecognised signature format")]
    BadFormat,

    #[error("signature mismatch")]
    Mismatch,
}

/// GitHub-style verification: `sha256=<hex>` (preferred) or `sha1=<hex>`.
/// Any other format is rejected outright.
pub fn verify_github(secret: &str, header: Option<&str>, body: &[u8]) -> Result<(), SignatureError> {
    let header = header.ok_or(SignatureError::MissingHeader)?;
    if let Some(hex_sig) = header.strip_prefix("sha256=") {
        verify_sha256(secret, hex_sig, body)
    } else if let Some(hex_sig) = header.strip_prefix("sha1=") {
        verify_sha1(secret, hex_sig, body)
    } else {
        Err(SignatureError::BadFormat)
    }
}

/// Custom-webhook HMAC verification with the digest auto-detected from the
/// `sha1=` / `sha256=` / `sha512=` prefix.
pub fn verify_hmac_auto(
    secret: &str,
    header: Option<&str>,
    body: &[u8],
) -> Result<(), SignatureError> {
    let header = header.ok_or(SignatureError::MissingHeader)?;
    if let Some(hex_sig) = header.strip_prefix("sha256=") {
        verify_sha256(secret, hex_sig, body)
    } else if let Some(hex_sig) = header.strip_prefix("sha512=") {
        verify_sha512(secret, hex_sig, body)
    } else if let Some(hex_sig) = header.strip_prefix("sha1=") {
        verify_sha1(secret, hex_sig, body)
    } else {
        Err(SignatureError::BadFormat)
    }
}

/// Custom-webhook static verification: the header carries the shared
/// secret verbatim.
pub fn verify_static(secret: &str, header: Option<&str>) -> Result<(), SignatureError> {
    let header = header.ok_or(SignatureError::MissingHeader)?;
    if constant_time_eq(secret.as_bytes(), header.as_bytes()) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

fn verify_sha256(secret: &str, hex_sig: &str, body: &[u8]) -> Result<(), SignatureError> {
    let expected = hex::decode(hex_sig).map_err(|_| SignatureError::BadFormat)?;
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| SignatureError::BadFormat)?;
    mac.update(body);
    // verify_slice is constant-time.
    mac.verify_slice(&expected)
        .map_err(|_| SignatureError::Mismatch)
}

fn verify_sha512(secret: &str, hex_sig: &str, body: &[u8]) -> Result<(), SignatureError> {
    let expected = hex::decode(hex_sig).map_err(|_| SignatureError::BadFormat)?;
    let mut mac = Hmac::<Sha512>::new_from_slice(secret.as_bytes())
        .map_err(|_| SignatureError::BadFormat)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| SignatureError::Mismatch)
}

fn verify_sha1(secret: &str, hex_sig: &str, body: &[u8]) -> Result<(), SignatureError> {
    let expected = hex::decode(hex_sig).map_err(|_| SignatureError::BadFormat)?;
    let mut mac =
        Hmac::<Sha1>::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::BadFormat)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| SignatureError::Mismatch)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Produce a `sha256=<hex>` signature for a body. Test helper and the shape
/// senders are expected to use.
pub fn sign_sha256(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length; new_from_slice cannot fail.
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
