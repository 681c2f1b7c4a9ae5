//! Shared-key fingerprints.
//!
//! Both ends of a link log the fingerprint of the key they loaded. Operators
//! compare them out-of-band to confirm the producer and consumer agree on the
//! secret without the secret itself ever appearing in a log.

use sha2::{Digest, Sha256};

/// Compute the fingerprint of raw key material.
pub fn compute_fingerprint(key: &[u8]) -> Fingerprint {
    // SHA-256( "CAMLINK-KEY-FINGERPRINT-v1" || len(key) || key )
    let mut hasher = Sha256::new();
    hasher.update(b"CAMLINK-KEY-FINGERPRINT-v1");
    hasher.update((key.len() as u32).to_le_bytes());
    hasher.update(key);

    Fingerprint {
        hash: hasher.finalize().into(),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fingerprint {
    hash: [u8; 32],
}

impl Fingerprint {
    /// Eight groups of four hex digits, e.g. `3fa1-09bc-...`
    pub fn grouped(&self) -> String {
        self.hash[..16]
            .chunks(2)
            .map(hex::encode)
            .collect::<Vec<String>>()
            .join("-")
    }

    /// First three groups, for compact log lines
    pub fn short(&self) -> String {
        self.grouped()
            .split('-')
            .take(3)
            .collect::<Vec<&str>>()
            .join("-")
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.grouped())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_deterministic() {
        let key = [7u8; 32];
        assert_eq!(compute_fingerprint(&key), compute_fingerprint(&key));
    }

    #[test]
    fn test_fingerprint_differs_per_key() {
        assert_ne!(
            compute_fingerprint(&[1u8; 32]).grouped(),
            compute_fingerprint(&[2u8; 32]).grouped()
        );
    }

    #[test]
    fn test_grouped_format() {
        let fp = compute_fingerprint(b"0123456789abcdef0123456789abcdef");
        let grouped = fp.grouped();
        let groups: Vec<&str> = grouped.split('-').collect();
        assert_eq!(groups.len(), 8);
        for g in &groups {
            assert_eq!(g.len(), 4);
            assert!(g.chars().all(|c| c.is_ascii_hexdigit()));
        }
        assert_eq!(fp.short(), groups[..3].join("-"));
        assert_eq!(fp.to_string(), grouped);
    }
}
