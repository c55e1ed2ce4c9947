//! Subdomain naming rules
//!
//! A subdomain is a single DNS label of 3 to 63 lowercase characters from
//! `[a-z0-9-]`. Both ends validate with the same rule so a client can reject
//! a bad `--subdomain` before dialing.

use rand::Rng;

const RANDOM_LEN: usize = 7;
const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Check a requested subdomain against `^[a-z0-9-]{3,63}$`.
pub fn is_valid_subdomain(label: &str) -> bool {
    if label.len() < 3 || label.len() > 63 {
        return false;
    }

    label
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// Synthesize a random 7-character base-36 label.
pub fn random_subdomain() -> String {
    let mut rng = rand::thread_rng();
    (0..RANDOM_LEN)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_subdomains() {
        assert!(is_valid_subdomain("abc"));
        assert!(is_valid_subdomain("my-app-2"));
        assert!(is_valid_subdomain("000"));
        assert!(is_valid_subdomain(&"a".repeat(63)));
    }

    #[test]
    fn test_invalid_subdomains() {
        assert!(!is_valid_subdomain(""));
        assert!(!is_valid_subdomain("ab"));
        assert!(!is_valid_subdomain(&"a".repeat(64)));
        assert!(!is_valid_subdomain("MyApp"));
        assert!(!is_valid_subdomain("my_app"));
        assert!(!is_valid_subdomain("my.app"));
        assert!(!is_valid_subdomain("app!"));
    }

    #[test]
    fn test_random_subdomain_shape() {
        for _ in 0..50 {
            let label = random_subdomain();
            assert_eq!(label.len(), 7);
            assert!(is_valid_subdomain(&label));
        }
    }
}
