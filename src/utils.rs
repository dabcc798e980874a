//! Small shared helpers

use chrono::{DateTime, Utc};

/// Parse a persisted RFC 3339 timestamp attribute
///
/// Returns `None` for anything unparseable - stale or hand-edited attributes
/// must never fail a read-only query.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Format a byte count for human-readable display
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp() {
        let parsed = parse_timestamp("2026-08-07T12:00:00+00:00").unwrap();
        assert!(parsed.to_rfc3339().starts_with("2026-08-07T12:00:00"));
        // offsets normalize to UTC
        let offset = parse_timestamp("2026-08-07T14:00:00+02:00").unwrap();
        assert_eq!(offset, parsed);
        assert!(parse_timestamp("not a time").is_none());
        assert!(parse_timestamp("").is_none());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }
}
