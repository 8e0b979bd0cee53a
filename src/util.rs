use chrono::Utc;

/// Ticks between 0001-01-01 and the Unix epoch, in 100ns units.
const EPOCH_TICKS: i64 = 621_355_968_000_000_000;

/// Monotonically distinct query value used to defeat intermediate caches.
#[must_use]
pub fn cache_buster() -> i64 {
    let now = Utc::now();
    let micros = now.timestamp_micros();
    EPOCH_TICKS + micros * 10
}

/// Append the `t=<ticks>` cache-busting parameter to a URL.
#[must_use]
pub fn cache_busted_url(url: &str, ticks: i64) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}t={ticks}")
}

/// Render a human-friendly transfer speed string.
#[must_use]
pub fn format_speed(bytes_per_sec: f32) -> String {
    const KIB: f32 = 1024.0;
    const MIB: f32 = KIB * 1024.0;

    if bytes_per_sec < KIB {
        format!("{bytes_per_sec:.0} B/s")
    } else if bytes_per_sec < MIB {
        format!("{:.1} KB/s", bytes_per_sec / KIB)
    } else {
        format!("{:.1} MB/s", bytes_per_sec / MIB)
    }
}

/// Treat whitespace-only overrides as absent.
#[must_use]
pub fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_speed_human_readable() {
        assert_eq!(format_speed(512.0), "512 B/s");
        assert_eq!(format_speed(2_048.0), "2.0 KB/s");
        assert_eq!(format_speed(5_242_880.0), "5.0 MB/s");
    }

    #[test]
    fn appends_cache_buster_with_correct_separator() {
        assert_eq!(
            cache_busted_url("https://a/b.png", 42),
            "https://a/b.png?t=42"
        );
        assert_eq!(
            cache_busted_url("https://a/b.png?x=1", 42),
            "https://a/b.png?x=1&t=42"
        );
    }

    #[test]
    fn cache_buster_is_past_epoch_ticks() {
        assert!(cache_buster() > EPOCH_TICKS);
    }

    #[test]
    fn blank_overrides_are_absent() {
        assert_eq!(non_blank(None), None);
        assert_eq!(non_blank(Some("   ")), None);
        assert_eq!(non_blank(Some(" C:\\game ")), Some("C:\\game"));
    }
}
