//! Topic URIs carried on every bus message.

pub const TAXI_CALL_PROCESS: &str = "TaxiCall/Process";
pub const USER_NOTIFICATION: &str = "TaxiCallNotification/User";
pub const DRIVER_NOTIFICATION: &str = "TaxiCallNotification/Driver";
pub const SETTLEMENT_REQUEST: &str = "Settlement/Request";

/// Prefixes the outbox publisher forwards by default.
pub const DEFAULT_PREFIXES: [&str; 3] = ["TaxiCall", "TaxiCallNotification", "Settlement"];

/// Returns true when `topic` falls under `prefix`, either exactly or as a path segment.
pub fn matches_prefix(topic: &str, prefix: &str) -> bool {
    match topic.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_matching() {
        assert!(matches_prefix(TAXI_CALL_PROCESS, "TaxiCall"));
        assert!(matches_prefix(TAXI_CALL_PROCESS, "TaxiCall/"));
        assert!(matches_prefix(TAXI_CALL_PROCESS, TAXI_CALL_PROCESS));
        // "TaxiCall" must not swallow the notification topics
        assert!(!matches_prefix(USER_NOTIFICATION, "TaxiCall"));
        assert!(matches_prefix(USER_NOTIFICATION, "TaxiCallNotification"));
        assert!(!matches_prefix(SETTLEMENT_REQUEST, "TaxiCall"));
    }
}
