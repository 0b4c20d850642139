use rand::Rng;

/// Random 16-hex-char identifier for run IDs, session IDs, and transaction
/// IDs.
pub fn rand_id() -> String {
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap())
        .collect()
}

/// Parse a bandwidth spec like "1MB" or "512KB" into bytes per second.
pub fn parse_bandwidth(spec: &str) -> Option<u64> {
    let spec = spec.trim();
    if spec.is_empty() {
        return None;
    }
    let (num, unit) = spec.split_at(spec.len().saturating_sub(2));
    let num: u64 = num.trim().parse().ok()?;
    match unit {
        "MB" => Some(num * 1024 * 1024),
        "KB" => Some(num * 1024),
        _ => None,
    }
}

/// Strip the port from "host:port"; plain hosts pass through.
pub fn host_from_addr(addr: &str) -> &str {
    match addr.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => addr,
    }
}

pub fn unix_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rand_id_shape() {
        let id = rand_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(rand_id(), rand_id());
    }

    #[test]
    fn test_parse_bandwidth() {
        assert_eq!(parse_bandwidth("1MB"), Some(1024 * 1024));
        assert_eq!(parse_bandwidth("512KB"), Some(512 * 1024));
        assert_eq!(parse_bandwidth(""), None);
        assert_eq!(parse_bandwidth("12GB"), None);
        assert_eq!(parse_bandwidth("MB"), None);
    }

    #[test]
    fn test_host_from_addr() {
        assert_eq!(host_from_addr("a.example.com:443"), "a.example.com");
        assert_eq!(host_from_addr("a.example.com"), "a.example.com");
        assert_eq!(host_from_addr("[::1]:80"), "[::1]");
    }
}
