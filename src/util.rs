//! Small shared helpers: timestamps, clamping, character-safe truncation,
//! and the SHA-1 digests used for claim keys and trace hashes.

use sha1::{Digest, Sha1};

/// Local wall-clock timestamp in the format used across all tables.
pub fn now_iso() -> String {
    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Compact timestamp for artifact filenames (no separators).
pub fn now_compact() -> String {
    chrono::Local::now().format("%Y%m%dT%H%M%S").to_string()
}

/// Milliseconds since the Unix epoch, used in contract ids.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Seconds since the Unix epoch.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

pub fn clamp(value: f64, lo: f64, hi: f64) -> f64 {
    value.max(lo).min(hi)
}

pub fn clamp01(value: f64) -> f64 {
    clamp(value, 0.0, 1.0)
}

/// Truncate to at most `max_chars` characters. Content is frequently CJK, so
/// truncation must never cut inside a multi-byte character.
pub fn clip(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Owned variant of [`clip`] with single-line whitespace folding.
pub fn clip_line(text: &str, max_chars: usize) -> String {
    let folded = text.replace('\n', " ");
    clip(folded.trim(), max_chars).to_string()
}

/// Full SHA-1 hex digest.
pub fn sha1_hex(input: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// First 16 hex chars of the SHA-1 digest, used for tool-call arg hashes and
/// result digests in exec traces.
pub fn sha1_hex16(input: &str) -> String {
    sha1_hex(input)[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_respects_char_boundaries() {
        let text = "并发风险上升需要回落策略";
        let clipped = clip(text, 4);
        assert_eq!(clipped, "并发风险");
    }

    #[test]
    fn test_clip_short_input_unchanged() {
        assert_eq!(clip("abc", 10), "abc");
    }

    #[test]
    fn test_sha1_hex16_length() {
        let digest = sha1_hex16("some tool args");
        assert_eq!(digest.len(), 16);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_sha1_is_deterministic() {
        assert_eq!(sha1_hex("claim"), sha1_hex("claim"));
        assert_ne!(sha1_hex("claim"), sha1_hex("claim2"));
    }

    #[test]
    fn test_clamp01_bounds() {
        assert_eq!(clamp01(-0.5), 0.0);
        assert_eq!(clamp01(1.5), 1.0);
        assert_eq!(clamp01(0.42), 0.42);
    }
}
