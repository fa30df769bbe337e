use serde::{Deserialize, Serialize};

/// A cached value with the metadata that decides its validity.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    pub key: String,
    pub data: V,
    /// Epoch milliseconds at which the value was produced.
    pub timestamp: u64,
    pub ttl_ms: u64,
    pub version: Option<String>,
}

impl<V> CacheEntry<V> {
    /// Valid iff `now - timestamp < ttl_ms`. Timestamps from the future count as fresh.
    pub fn is_valid(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.timestamp) < self.ttl_ms
    }

    /// Remaining lifetime in milliseconds, zero once expired.
    pub fn remaining_ttl_ms(&self, now_ms: u64) -> u64 {
        self.ttl_ms.saturating_sub(now_ms.saturating_sub(self.timestamp))
    }
}

/// Persisted shape of an entry in the durable tier: `{data, timestamp, version?}`.
///
/// TTL is not stored; it comes from the reading cache's configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub data: serde_json::Value,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(timestamp: u64, ttl_ms: u64) -> CacheEntry<&'static str> {
        CacheEntry { key: "k".into(), data: "v", timestamp, ttl_ms, version: None }
    }

    #[test]
    fn validity_boundary_is_exclusive() {
        let e = entry(1_000, 500);
        assert!(e.is_valid(1_000));
        assert!(e.is_valid(1_499));
        assert!(!e.is_valid(1_500));
        assert_eq!(e.remaining_ttl_ms(1_200), 300);
        assert_eq!(e.remaining_ttl_ms(9_000), 0);
    }

    #[test]
    fn future_timestamps_are_fresh() {
        assert!(entry(5_000, 10).is_valid(1_000));
    }

    #[test]
    fn stored_record_omits_missing_version() {
        let record = StoredRecord { data: serde_json::json!({"id": 1}), timestamp: 42, version: None };
        let text = serde_json::to_string(&record).unwrap();
        assert_eq!(text, r#"{"data":{"id":1},"timestamp":42}"#);

        let parsed: StoredRecord =
            serde_json::from_str(r#"{"data":[1,2],"timestamp":7,"version":"v2"}"#).unwrap();
        assert_eq!(parsed.version.as_deref(), Some("v2"));
    }
}
