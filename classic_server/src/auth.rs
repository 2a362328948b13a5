//! Name verification.
//!
//! A fresh salt is generated on every server start. A client proves its name
//! by presenting `hex(md5(salt ++ name))` as the verification key.

use std::fmt;

use md5::{Digest, Md5};
use rand::{distributions::Alphanumeric, Rng};

/// Length of a generated salt.
pub const SALT_LEN: usize = 16;

/// Per-run random string mixed into verification digests.
#[derive(Clone, PartialEq, Eq)]
pub struct Salt(String);

impl Salt {
    /// A random salt of [`SALT_LEN`] characters from `[0-9A-Za-z]`.
    pub fn generate() -> Self {
        let salt = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SALT_LEN)
            .map(char::from)
            .collect();
        Salt(salt)
    }

    pub fn from_string(salt: impl Into<String>) -> Self {
        Salt(salt.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercase hex MD5 of the salt followed by `name`.
    pub fn expected_key(&self, name: &str) -> String {
        let mut hasher = Md5::new();
        hasher.update(self.0.as_bytes());
        hasher.update(name.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Compares `key` against the expected digest, ignoring hex case.
    pub fn verify(&self, name: &str, key: &str) -> bool {
        self.expected_key(name).eq_ignore_ascii_case(key)
    }
}

// Keeps the salt out of logs.
impl fmt::Debug for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Salt(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_salt_is_alphanumeric() {
        let salt = Salt::generate();
        assert_eq!(salt.as_str().len(), SALT_LEN);
        assert!(salt.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(Salt::generate(), salt);
    }

    #[test]
    fn expected_key_is_md5_of_salt_and_name() {
        let salt = Salt::from_string("abc123");
        let expected = format!("{:x}", Md5::digest(b"abc123Steve"));
        assert_eq!(salt.expected_key("Steve"), expected);
        assert_eq!(expected.len(), 32);
        assert!(expected.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn verify_ignores_hex_case_only() {
        let salt = Salt::from_string("abc123");
        let key = salt.expected_key("Steve");
        assert!(salt.verify("Steve", &key));
        assert!(salt.verify("Steve", &key.to_uppercase()));
        assert!(!salt.verify("Steve", ""));
        assert!(!salt.verify("Steve", &key[1..]));
        assert!(!salt.verify("steve", &key));
    }
}
