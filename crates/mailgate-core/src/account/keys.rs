//! Key material derivation.
//!
//! The mailbox password never leaves the login call: it is hashed with the
//! account salt into the mailbox secret, and gateway passwords for key slots
//! are derived from that secret under the main key.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

/// Name of the key slot created on first login.
pub const DEFAULT_KEY_SLOT: &str = "";

/// Hashes a mailbox password with the account salt.
#[must_use]
pub fn mailbox_secret(salt: &str, mailbox_password: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(mailbox_password);
    hasher.finalize().to_vec()
}

/// Derives the gateway password of a key slot.
#[must_use]
pub fn slot_password(secret: &[u8], main_key: &str, slot: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(main_key.as_bytes());
    hasher.update([0]);
    hasher.update(slot.as_bytes());
    hasher.update([0]);
    hasher.update(secret);
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Digest under which a slot password is persisted.
#[must_use]
pub fn password_digest(password: &str) -> String {
    Sha256::digest(password.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_mailbox_secret_depends_on_salt() {
        let a = mailbox_secret("salt-a", b"pass");
        let b = mailbox_secret("salt-b", b"pass");
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert_eq!(a, mailbox_secret("salt-a", b"pass"));
    }

    #[test]
    fn test_slot_password_is_per_slot() {
        let secret = mailbox_secret("salt", b"pass");
        let default = slot_password(&secret, "main", DEFAULT_KEY_SLOT);
        let laptop = slot_password(&secret, "main", "laptop");
        assert!(!default.is_empty());
        assert_ne!(default, laptop);
        assert_ne!(default, slot_password(&secret, "other-main", DEFAULT_KEY_SLOT));
    }

    #[test]
    fn test_password_digest_is_hex() {
        let digest = password_digest("hunter2");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
