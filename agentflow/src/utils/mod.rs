//! Utility helpers for timestamps, identifiers and content hashing.

pub mod hashing;
pub mod timestamps;

pub use hashing::{content_hash, sha256_hex};
pub use timestamps::{age_of, format_timestamp, iso_timestamp, millis_between, now_utc, Timestamp};

use uuid::Uuid;

/// Generates a time-ordered identifier for runs, snapshots and effects.
#[must_use]
pub fn generate_id() -> Uuid {
    Uuid::now_v7()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_is_v7() {
        assert_eq!(generate_id().get_version_num(), 7);
    }

    #[test]
    fn test_generate_id_is_ordered() {
        let a = generate_id();
        let b = generate_id();
        assert!(a < b);
    }
}
