//! Deterministic cache keys
//!
//! Keys have the shape `<family>:<identifier>:<shape>`, so every entry derived
//! from one identifier shares the prefix returned by [`key_prefix`].

/// Key for one cached view of an identifier
pub fn cache_key(family: &str, id: &str, shape: &str) -> String {
    format!("{family}:{id}:{shape}")
}

/// Prefix shared by every key of `id` in `family`
pub fn key_prefix(family: &str, id: &str) -> String {
    format!("{family}:{id}:")
}

/// Prefix shared by every key in `family`
pub fn family_prefix(family: &str) -> String {
    format!("{family}:")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_starts_with_its_prefixes() {
        let key = cache_key("model", "42", "record");
        assert_eq!(key, "model:42:record");
        assert!(key.starts_with(&key_prefix("model", "42")));
        assert!(key.starts_with(&family_prefix("model")));
    }

    #[test]
    fn test_prefix_does_not_match_longer_ids() {
        let key = cache_key("model", "421", "record");
        assert!(!key.starts_with(&key_prefix("model", "42")));
    }
}
