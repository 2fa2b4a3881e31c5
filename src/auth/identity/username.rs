//! Username and credential helpers.

use anyhow::{Result, anyhow};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
};
use rand::{RngCore, rngs::OsRng};
use regex::Regex;

const MAX_USERNAME_LEN: usize = 255;

/// Turn an externally asserted name (login, email, NameID) into a valid
/// local username.
///
/// Keeps `[A-Za-z0-9-.]`, maps everything else to `-`, takes the local part
/// of email addresses, and collapses repeated or leading/trailing
/// separators.
///
/// # Errors
/// Returns an error if nothing usable is left.
pub fn normalize_username(name: &str) -> Result<String> {
    let local = name.split_once('@').map_or(name, |(local, _)| local);
    let mapped: String = local
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();

    let separators = Regex::new(r"[-.]{2,}").map_err(|err| anyhow!(err))?;
    let collapsed = separators.replace_all(&mapped, |caps: &regex::Captures<'_>| {
        caps[0].chars().next().map(String::from).unwrap_or_default()
    });
    let trimmed = collapsed.trim_matches(|c| c == '-' || c == '.');

    if trimmed.is_empty() {
        return Err(anyhow!("username is empty after normalization"));
    }
    Ok(trimmed.chars().take(MAX_USERNAME_LEN).collect())
}

/// Normalize an email for lookup and uniqueness checks.
pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Argon2 PHC string for `password`.
///
/// # Errors
/// Returns an error if the salt cannot be generated or hashing fails.
pub fn hash_password(password: &str) -> Result<String> {
    let mut salt_bytes = [0u8; 16];
    OsRng
        .try_fill_bytes(&mut salt_bytes)
        .map_err(|err| anyhow!("failed to generate password salt: {err}"))?;
    let salt = SaltString::encode_b64(&salt_bytes).map_err(|err| anyhow!(err.to_string()))?;
    let phc = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow!(err.to_string()))?
        .to_string();
    Ok(phc)
}

pub(crate) fn verify_password(hash: &str, password: &str) -> bool {
    PasswordHash::new(hash).is_ok_and(|parsed| {
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_username_cases() -> Result<()> {
        assert_eq!(normalize_username("alice")?, "alice");
        assert_eq!(normalize_username("alice@example.com")?, "alice");
        assert_eq!(normalize_username("Alice Smith")?, "Alice-Smith");
        assert_eq!(normalize_username("a..b--c")?, "a.b-c");
        assert_eq!(normalize_username("-_weird_.")?, "weird");
        assert_eq!(normalize_username("DOMAIN\\bob")?, "DOMAIN-bob");
        assert!(normalize_username("@example.com").is_err());
        assert!(normalize_username("___").is_err());
        Ok(())
    }

    #[test]
    fn normalize_username_is_stable() -> Result<()> {
        for input in ["alice", "Alice Smith", "a..b--c", "x@y.z"] {
            let once = normalize_username(input)?;
            assert_eq!(normalize_username(&once)?, once);
        }
        Ok(())
    }

    #[test]
    fn email_helpers() {
        assert_eq!(normalize_email(" Alice@Example.COM "), "alice@example.com");
    }

    #[test]
    fn password_hash_round_trip() -> Result<()> {
        let hash = hash_password("correct horse")?;
        assert!(verify_password(&hash, "correct horse"));
        assert!(!verify_password(&hash, "wrong horse"));
        assert!(!verify_password("not-a-phc-string", "correct horse"));
        Ok(())
    }
}
