pub fn build_host() -> &'static str {
    option_env!("CPUCAP_BUILD_HOST").unwrap_or("unknown")
}

pub fn build_time_raw() -> &'static str {
    option_env!("CPUCAP_BUILD_TIME").unwrap_or("unknown")
}

pub fn build_time_pretty() -> String {
    format_build_time_pretty(build_time_raw())
}

pub fn format_build_time_pretty(raw: &str) -> String {
    let raw = raw.trim();
    if let Some(epoch) = raw.strip_prefix("epoch:") {
        if let Ok(secs) = epoch.trim().parse::<i64>() {
            // Render in UTC, stable across environments.
            if let Some(dt) = chrono::DateTime::<chrono::Utc>::from_timestamp(secs, 0) {
                return dt.format("%Y-%m-%d %H:%M:%S").to_string();
            }
        }
        return raw.to_string();
    }

    // Common case: RFC3339 "YYYY-MM-DDTHH:MM:SSZ" -> "YYYY-MM-DD HH:MM:SS" (UTC)
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return dt
            .with_timezone(&chrono::Utc)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
    }

    // Best-effort fallback.
    raw.replace('T', " ").trim_end_matches('Z').to_string()
}

pub fn banner() -> String {
    format!(
        "cpucap {} (built on {} at {})",
        env!("CARGO_PKG_VERSION"),
        build_host(),
        build_time_pretty()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pretty_time_strips_rfc3339_markers() {
        assert_eq!(
            format_build_time_pretty("2026-05-01T12:00:00Z"),
            "2026-05-01 12:00:00"
        );
    }

    #[test]
    fn pretty_time_renders_epoch_as_utc() {
        assert_eq!(
            format_build_time_pretty("epoch:1700000000"),
            "2023-11-14 22:13:20"
        );
    }

    #[test]
    fn unparseable_epoch_passes_through() {
        assert_eq!(format_build_time_pretty("epoch:soon"), "epoch:soon");
    }

    #[test]
    fn banner_names_the_tool() {
        assert!(banner().starts_with("cpucap "));
    }
}
