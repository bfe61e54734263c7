//! Task bearer tokens.
//!
//! A token is 20 random bytes in lowercase hex. Only a salted SHA-256 hash
//! and the last eight characters are stored; the plaintext is handed out
//! once, when the task is created.

use gantry_core::task::Task;
use rand::RngCore;
use sha2::{Digest, Sha256};

pub const TOKEN_LEN: usize = 40;
const SALT_BYTES: usize = 10;

/// A freshly generated token with its stored material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub salt: String,
    pub hash: String,
    pub last_eight: String,
}

impl IssuedToken {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut token = [0u8; TOKEN_LEN / 2];
        rng.fill_bytes(&mut token);
        let mut salt = [0u8; SALT_BYTES];
        rng.fill_bytes(&mut salt);

        let token = hex::encode(token);
        let salt = hex::encode(salt);
        Self {
            hash: hash_token(&token, &salt),
            last_eight: last_eight(&token).to_string(),
            token,
            salt,
        }
    }

    /// Store the token material on `task`.
    pub fn apply(self, task: &mut Task) {
        task.token_hash = self.hash;
        task.token_salt = self.salt;
        task.token_last_eight = self.last_eight;
        task.token = Some(self.token);
    }
}

pub fn hash_token(token: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Whether `token` has the shape of an issued token.
pub fn is_well_formed(token: &str) -> bool {
    token.len() == TOKEN_LEN
        && token
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

pub fn last_eight(token: &str) -> &str {
    &token[token.len().saturating_sub(8)..]
}

/// Whether `token` hashes to the hash stored on `task`, compared in
/// constant time.
pub fn verify(token: &str, task: &Task) -> bool {
    let computed = hash_token(token, &task.token_salt);
    constant_time_eq(computed.as_bytes(), task.token_hash.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_token_verifies() {
        let issued = IssuedToken::generate();
        assert!(is_well_formed(&issued.token));
        assert_eq!(issued.last_eight, &issued.token[32..]);

        let token = issued.token.clone();
        let mut task = Task::default();
        issued.apply(&mut task);
        assert!(verify(&token, &task));

        let mut other = token.into_bytes();
        other[0] = if other[0] == b'0' { b'1' } else { b'0' };
        assert!(!verify(&String::from_utf8(other).unwrap(), &task));
    }

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(IssuedToken::generate().token, IssuedToken::generate().token);
    }

    #[test]
    fn test_well_formed() {
        assert!(is_well_formed(&"a".repeat(40)));
        assert!(!is_well_formed(&"a".repeat(39)));
        assert!(!is_well_formed(&"A".repeat(40)));
        assert!(!is_well_formed(&"g".repeat(40)));
    }
}
