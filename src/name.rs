//! 14-hex-digit element names: 8 hex digits of seconds-since-epoch, 5 hex
//! digits of microseconds, 1 hex digit derived from the PID.

use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;

/// `[0-9a-f]{14}` — an element's leaf name.
pub const ELEMENT_NAME_LEN: usize = 14;
/// `[0-9a-f]{8}` — a bucket's name.
pub const BUCKET_NAME_LEN: usize = 8;

fn element_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9a-f]{14}$").unwrap())
}

fn bucket_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9a-f]{8}$").unwrap())
}

pub fn is_element_name(s: &str) -> bool {
    element_name_regex().is_match(s)
}

pub fn is_bucket_name(s: &str) -> bool {
    bucket_name_regex().is_match(s)
}

/// Produce a new candidate element name from the current wall clock and
/// this process's pid. Two calls within the same microsecond by the same
/// process can collide; callers treat that as a retryable race, never an
/// error.
pub fn generate() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let seconds = now.as_secs() as u32;
    let micros = now.subsec_micros() & 0xFFFFF; // 20 bits -> 5 hex digits
    let pid_digit = (std::process::id() % 16) as u8;
    format!("{:08x}{:05x}{:01x}", seconds, micros, pid_digit)
}

/// Parse the 8-hex bucket name back into an ordinal, used by the normal
/// queue to compute "the next bucket after the highest one".
pub fn bucket_ordinal(name: &str) -> Option<u32> {
    if !is_bucket_name(name) {
        return None;
    }
    u32::from_str_radix(name, 16).ok()
}

pub fn bucket_name(ordinal: u32) -> String {
    format!("{:08x}", ordinal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_names_are_well_formed() {
        let name = generate();
        assert_eq!(ELEMENT_NAME_LEN, name.len());
        assert!(is_element_name(&name));
    }

    #[test]
    fn names_are_monotonic_across_calls() {
        let mut prev = generate();
        for _ in 0..100 {
            let next = generate();
            assert!(next >= prev, "{} should be >= {}", next, prev);
            prev = next;
        }
    }

    #[test]
    fn bucket_name_roundtrip() {
        assert_eq!("00000000", bucket_name(0));
        assert_eq!("0000000c", bucket_name(12));
        assert_eq!(Some(12), bucket_ordinal("0000000c"));
        assert_eq!(None, bucket_ordinal("not-hex!"));
        assert_eq!(None, bucket_ordinal("0000000"));
    }

    #[test]
    fn rejects_malformed_names() {
        assert!(!is_element_name("short"));
        assert!(!is_element_name("0123456789abcZ"));
        assert!(!is_bucket_name("0123456g"));
    }
}
