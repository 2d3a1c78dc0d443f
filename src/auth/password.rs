use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rand::{rngs::OsRng, RngCore};
use tracing::{error, warn};

/// Longest password accepted for hashing, in bytes.
pub const MAX_PASSWORD_BYTES: usize = 1024;

/// Random bytes in a verification code (hex encoded, so 64 characters).
const VERIFICATION_CODE_BYTES: usize = 32;

pub fn hash_password(plain: &str) -> anyhow::Result<String> {
    anyhow::ensure!(
        plain.len() <= MAX_PASSWORD_BYTES,
        "password exceeds {MAX_PASSWORD_BYTES} bytes"
    );
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(plain.as_bytes(), &salt)
        .map_err(|e| {
            error!(error = %e, "argon2 hash_password error");
            anyhow::anyhow!(e.to_string())
        })?
        .to_string();
    Ok(hash)
}

/// Checks `plain` against a stored PHC hash. A malformed hash counts as a
/// mismatch.
pub fn verify_password(plain: &str, hash: &str) -> bool {
    let parsed = match PasswordHash::new(hash) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "stored password hash is malformed");
            return false;
        }
    };
    Argon2::default()
        .verify_password(plain.as_bytes(), &parsed)
        .is_ok()
}

pub fn generate_verification_code() -> String {
    let mut bytes = [0u8; VERIFICATION_CODE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
