//! Bucket key generation.

use super::rules::Operation;

/// Default namespace for bucket keys in the counter store.
pub const DEFAULT_KEY_PREFIX: &str = "divvy";

/// A key that uniquely identifies a credit bucket.
///
/// The key is composed of the matched rule's operation (sorted by attribute
/// name), the actor, and the rule's limit and interval. Changing either the
/// limit or the interval therefore starts a fresh bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    /// Serialized `key=value` pairs of the rule operation
    pub operation: String,
    /// The actor the quota is partitioned by
    pub actor: String,
    pub credit_limit: i64,
    pub reset_seconds: i64,
}

impl BucketKey {
    /// Create a bucket key for a rule operation and actor.
    pub fn new(rule_operation: &Operation, actor: &str, credit_limit: i64, reset_seconds: i64) -> Self {
        // BTreeMap iteration is already sorted by key.
        let pairs: Vec<String> = rule_operation
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        Self {
            operation: pairs.join(" "),
            actor: actor.to_string(),
            credit_limit,
            reset_seconds,
        }
    }

    /// Convert the bucket key to its counter store representation.
    pub fn to_store_key(&self, prefix: &str) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            prefix, self.operation, self.actor, self.credit_limit, self.reset_seconds
        )
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_store_key(DEFAULT_KEY_PREFIX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(pairs: &[(&str, &str)]) -> Operation {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_bucket_key_sorted_pairs() {
        let key = BucketKey::new(&op(&[("path", "/ping"), ("method", "GET")]), "1.2.3.4", 100, 60);
        assert_eq!(key.to_string(), "divvy:method=GET path=/ping:1.2.3.4:100:60");
    }

    #[test]
    fn test_bucket_key_deterministic() {
        let a = BucketKey::new(&op(&[("a", "1"), ("b", "2")]), "actor", 10, 60);
        let b = BucketKey::new(&op(&[("b", "2"), ("a", "1")]), "actor", 10, 60);
        assert_eq!(a, b);
        assert_eq!(a.to_store_key("x"), b.to_store_key("x"));
    }

    #[test]
    fn test_bucket_key_changes_with_limits() {
        let operation = op(&[("a", "1")]);
        let base = BucketKey::new(&operation, "", 10, 60);
        assert_ne!(base, BucketKey::new(&operation, "", 11, 60));
        assert_ne!(base, BucketKey::new(&operation, "", 10, 61));
        assert_ne!(base, BucketKey::new(&operation, "other", 10, 60));
    }

    #[test]
    fn test_default_rule_key() {
        let key = BucketKey::new(&Operation::new(), "", 1, 60);
        assert_eq!(key.to_store_key("divvy"), "divvy:::1:60");
    }
}
