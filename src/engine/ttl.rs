//! CELLAR - Time-To-Live (TTL) Support
//! Absolute expiry timestamps (Unix seconds) are what the engine stores;
//! relative TTLs only exist at the facade boundary, derived at read time.
//!
//! An entry with `expires_at = E` stays visible through second `E` and
//! disappears once the clock passes it, so a read during second `E`
//! reports the `-1` boundary TTL.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::{EXPIRING_TTL, NO_TTL};

/// Current wall-clock time in seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Absolute expiry for a relative TTL; `0` when the TTL does not expire.
pub fn expires_at(ttl_seconds: i32, now: u64) -> u64 {
    if ttl_seconds > 0 {
        now + ttl_seconds as u64
    } else {
        0
    }
}

/// Derive the three-state TTL from an absolute expiry.
///
/// `0` when there is no expiry, otherwise the seconds left, with an exact
/// zero coerced to `-1` so that "expires now" never reads as "no expiry".
pub fn derive_ttl(expires_at: u64, now: u64) -> i32 {
    if expires_at == 0 {
        return NO_TTL;
    }
    let remaining = expires_at as i64 - now as i64;
    if remaining == 0 {
        EXPIRING_TTL
    } else {
        remaining.clamp(i32::MIN as i64, i32::MAX as i64) as i32
    }
}

/// Check whether an entry with the given expiry is past its lifetime.
pub fn is_expired(expires_at: u64, now: u64) -> bool {
    expires_at != 0 && now > expires_at
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_ttl_never_expires() {
        assert_eq!(expires_at(0, 1_000), 0);
        assert_eq!(expires_at(-5, 1_000), 0);
        assert!(!is_expired(0, u64::MAX));
        assert_eq!(derive_ttl(0, 1_000), NO_TTL);
    }

    #[test]
    fn test_remaining_seconds() {
        let e = expires_at(5, 1_000);
        assert_eq!(e, 1_005);
        assert_eq!(derive_ttl(e, 1_000), 5);
        assert_eq!(derive_ttl(e, 1_004), 1);
    }

    #[test]
    fn test_boundary_second_reports_minus_one() {
        assert_eq!(derive_ttl(1_005, 1_005), EXPIRING_TTL);
        assert!(!is_expired(1_005, 1_005));
    }

    #[test]
    fn test_past_expiry() {
        assert!(is_expired(1_005, 1_006));
        assert_eq!(derive_ttl(1_005, 1_006), -1);
        assert_eq!(derive_ttl(1_005, 1_010), -5);
    }

    #[test]
    fn test_now_is_sane() {
        // 2020-01-01
        assert!(now_secs() > 1_577_836_800);
    }
}
