//! Connection token generation.
//!
//! Tokens are minted fresh for every server start, live only in memory, and
//! travel exclusively through the `CONNECT` response. Nothing ever writes a
//! token to disk; a restart regenerates it, so a persisted copy would go
//! stale immediately.

use anyhow::Result;
use rand::RngCore;

/// Source of connection tokens. The trait seam exists so tests can plug in
/// deterministic sequences or forced failures.
pub trait TokenGenerator: Send + Sync {
    fn generate(&self) -> Result<String>;
}

/// OS-entropy-backed generator: 32 random bytes, lowercase hex, 64 chars.
pub struct RandomTokenGenerator;

impl TokenGenerator for RandomTokenGenerator {
    fn generate(&self) -> Result<String> {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Ok(hex::encode(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_64_lowercase_hex_chars() {
        let token = RandomTokenGenerator.generate().unwrap();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn tokens_do_not_repeat() {
        let a = RandomTokenGenerator.generate().unwrap();
        let b = RandomTokenGenerator.generate().unwrap();
        assert_ne!(a, b);
    }
}
