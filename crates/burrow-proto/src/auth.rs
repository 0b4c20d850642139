use md5::{Digest, Md5};
use subtle::ConstantTimeEq;

/// Digest used for login privilege keys and visitor sign keys:
/// `md5_hex(token + timestamp)`.
pub fn auth_key(token: &str, timestamp: i64) -> String {
    let mut hasher = Md5::new();
    hasher.update(token.as_bytes());
    hasher.update(timestamp.to_string().as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Constant-time string comparison for credential checks.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Maximum allowed skew between a message timestamp and server time.
pub const AUTH_TIMESTAMP_SKEW_SECS: i64 = 15 * 60;

pub fn timestamp_in_range(timestamp: i64, now: i64) -> bool {
    (now - timestamp).abs() <= AUTH_TIMESTAMP_SKEW_SECS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_key_is_stable() {
        let a = auth_key("secret", 1700000000);
        let b = auth_key("secret", 1700000000);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_auth_key_varies_with_inputs() {
        assert_ne!(auth_key("secret", 1), auth_key("secret", 2));
        assert_ne!(auth_key("a", 1), auth_key("b", 1));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
    }

    #[test]
    fn test_timestamp_skew() {
        assert!(timestamp_in_range(1000, 1000 + AUTH_TIMESTAMP_SKEW_SECS));
        assert!(!timestamp_in_range(1000, 1001 + AUTH_TIMESTAMP_SKEW_SECS));
        assert!(timestamp_in_range(1000 + AUTH_TIMESTAMP_SKEW_SECS, 1000));
    }
}
