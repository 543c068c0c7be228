use std::sync::OnceLock;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

const SCHEME: &str = "pbkdf2-sha256";
pub const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

/// Hashes `password` with a fresh random salt.
///
/// The encoded form is `pbkdf2-sha256$<iterations>$<salt>$<hash>` with
/// unpadded standard base64 for the binary parts.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    hash_with(password, &salt, PBKDF2_ITERATIONS)
}

fn hash_with(password: &str, salt: &[u8], iterations: u32) -> String {
    let mut derived = [0u8; HASH_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut derived);
    format!(
        "{SCHEME}${iterations}${}${}",
        STANDARD_NO_PAD.encode(salt),
        STANDARD_NO_PAD.encode(derived)
    )
}

/// Fixed hash at full cost. Logins for unknown emails verify against it so
/// they take as long as a wrong password on a real account.
pub fn dummy_hash() -> &'static str {
    static DUMMY: OnceLock<String> = OnceLock::new();
    DUMMY.get_or_init(|| {
        hash_with("stockflow-unknown-account", b"dummy-salt-00000", PBKDF2_ITERATIONS)
    })
}

/// Low-cost hash for fixtures.
#[cfg(test)]
pub(crate) fn hash_for_tests(password: &str) -> String {
    hash_with(password, b"fixture-salt-000", 1_000)
}

/// Checks `password` against an encoded hash in constant time.
pub fn verify_password(password: &str, encoded: &str) -> Result<bool, PasswordHashError> {
    let mut parts = encoded.split('$');
    let (Some(scheme), Some(iterations), Some(salt), Some(hash), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return Err(PasswordHashError::Malformed);
    };
    if scheme != SCHEME {
        return Err(PasswordHashError::UnsupportedScheme(scheme.to_string()));
    }
    let iterations: u32 = iterations
        .parse()
        .map_err(|_| PasswordHashError::Malformed)?;
    if iterations == 0 {
        return Err(PasswordHashError::Malformed);
    }
    let salt = STANDARD_NO_PAD
        .decode(salt)
        .map_err(|_| PasswordHashError::Malformed)?;
    let expected = STANDARD_NO_PAD
        .decode(hash)
        .map_err(|_| PasswordHashError::Malformed)?;
    if expected.is_empty() {
        return Err(PasswordHashError::Malformed);
    }

    let mut derived = vec![0u8; expected.len()];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, iterations, &mut derived);
    Ok(derived.ct_eq(&expected).into())
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PasswordHashError {
    #[error("stored password hash is malformed")]
    Malformed,
    #[error("unsupported password hash scheme {0}")]
    UnsupportedScheme(String),
}
