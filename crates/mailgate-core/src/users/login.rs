//! Backend login name decoding.
//!
//! Mail clients log in with `address` or `address:slot`, where `slot`
//! names the key slot whose password is presented. The address part is
//! case-insensitive and is always returned lowercased.

use crate::account::DEFAULT_KEY_SLOT;

/// Separator between address and key slot.
const SLOT_SEPARATOR: char = ':';

/// Splits a login name into lowercased address and key slot.
#[must_use]
pub fn decode_login(username: &str) -> (String, String) {
    let username = username.trim();
    match username.rsplit_once(SLOT_SEPARATOR) {
        Some((address, slot)) => (address.to_lowercase(), slot.to_string()),
        None => (username.to_lowercase(), DEFAULT_KEY_SLOT.to_string()),
    }
}

/// Builds the login name for an address and key slot.
#[must_use]
pub fn encode_login(address: &str, slot: &str) -> String {
    if slot.is_empty() {
        address.to_string()
    } else {
        format!("{address}{SLOT_SEPARATOR}{slot}")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_plain_address_uses_default_slot() {
        assert_eq!(
            decode_login("Alice@Example.COM"),
            ("alice@example.com".to_string(), String::new())
        );
    }

    #[test]
    fn test_address_with_slot() {
        assert_eq!(
            decode_login("alice@example.com:laptop"),
            ("alice@example.com".to_string(), "laptop".to_string())
        );
    }

    #[test]
    fn test_slot_keeps_case() {
        let (_, slot) = decode_login("alice@example.com:Phone");
        assert_eq!(slot, "Phone");
    }

    #[test]
    fn test_surrounding_whitespace_is_ignored() {
        assert_eq!(decode_login("  bob@example.com ").0, "bob@example.com");
    }

    proptest! {
        #[test]
        fn prop_decode_is_case_insensitive(
            local in "[A-Za-z0-9._]{1,16}",
            domain in "[A-Za-z]{1,10}\\.[a-z]{2,3}",
        ) {
            let address = format!("{local}@{domain}");
            prop_assert_eq!(decode_login(&address), decode_login(&address.to_uppercase()));
        }

        #[test]
        fn prop_encode_decode_roundtrip(local in "[a-z0-9._]{1,16}", slot in "[A-Za-z0-9-]{0,12}") {
            let address = format!("{local}@example.com");
            let (decoded, decoded_slot) = decode_login(&encode_login(&address, &slot));
            prop_assert_eq!(decoded, address);
            prop_assert_eq!(decoded_slot, slot);
        }
    }
}
