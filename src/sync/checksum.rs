//! State checksum.
//!
//! `hex(SHA-256(canonical)[..8])` where `canonical` is the compact JSON object
//! `{"fighter1Points":N,"fighter2Points":N,"status":"..."}` with sorted keys.
//! Lock state and metadata are not covered. Any implementation hashing the same
//! bytes produces the same 16 hex characters.

use sha2::{Digest, Sha256};

use super::fight::FightStatus;

/// Bytes of the digest kept in the checksum.
pub const CHECKSUM_BYTES: usize = 8;

/// Canonical serialization of the compared fields.
pub fn canonical(fighter1_points: u32, fighter2_points: u32, status: FightStatus) -> String {
    // serde_json maps keep keys sorted, and insertion order is sorted too
    serde_json::json!({
        "fighter1Points": fighter1_points,
        "fighter2Points": fighter2_points,
        "status": status.as_str(),
    })
    .to_string()
}

pub fn checksum(fighter1_points: u32, fighter2_points: u32, status: FightStatus) -> String {
    let digest = Sha256::digest(canonical(fighter1_points, fighter2_points, status).as_bytes());
    hex::encode(&digest[..CHECKSUM_BYTES])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_form() {
        assert_eq!(
            canonical(3, 1, FightStatus::Running),
            r#"{"fighter1Points":3,"fighter2Points":1,"status":"running"}"#
        );
    }

    #[test]
    fn test_pinned_vectors() {
        assert_eq!(checksum(0, 0, FightStatus::Ready), "e0b65b559fe030f7");
        assert_eq!(checksum(3, 1, FightStatus::Running), "7d5c3b788e079faf");
    }

    #[test]
    fn test_sensitive_to_every_field() {
        let base = checksum(3, 1, FightStatus::Running);
        assert_ne!(base, checksum(1, 3, FightStatus::Running));
        assert_ne!(base, checksum(3, 1, FightStatus::Paused));
        assert_eq!(base.len(), CHECKSUM_BYTES * 2);
    }
}
