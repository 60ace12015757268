//! Stable 16-hex-character fingerprints used for `promptId` and the
//! sub-RLM cache key, grounded on the sha256 cache-key pattern used
//! elsewhere in this codebase for prompt-cache keys.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Fingerprint an arbitrary string (e.g. the prompt body) to a stable
/// 16-hex-char id.
pub fn fingerprint_str(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    let digest = hasher.finalize();
    format!("{:x}", digest)[..16].to_string()
}

/// Fingerprint a JSON-serializable value (used for the sub-call cache key,
/// which hashes `{promptId, query, subPrompt, options}`).
pub fn fingerprint_json<T: Serialize>(value: &T) -> String {
    let encoded = serde_json::to_string(value).unwrap_or_default();
    fingerprint_str(&encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic_and_16_hex() {
        let a = fingerprint_str("hello world");
        let b = fingerprint_str("hello world");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_differs_on_input() {
        assert_ne!(fingerprint_str("a"), fingerprint_str("b"));
    }

    #[test]
    fn fingerprint_json_matches_manual_encode() {
        #[derive(Serialize)]
        struct Key<'a> {
            prompt_id: &'a str,
            query: &'a str,
        }
        let k = Key {
            prompt_id: "abc123",
            query: "sum: {{item}}",
        };
        let fp = fingerprint_json(&k);
        assert_eq!(fp.len(), 16);
    }
}
