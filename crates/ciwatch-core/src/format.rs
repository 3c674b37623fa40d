use chrono::{DateTime, TimeZone};

const IEC_UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

pub fn format_duration(start: i64, end: Option<i64>, server_now: i64) -> String {
    let elapsed = end.unwrap_or(server_now) - start;
    if elapsed > 3600 {
        format!(
            "{} hours, {} minutes",
            elapsed / 3600,
            (elapsed % 3600) / 60
        )
    } else if elapsed > 60 {
        format!("{} minutes, {} seconds", elapsed / 60, elapsed % 60)
    } else {
        format!("{elapsed} seconds")
    }
}

pub fn iec_file_size(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < IEC_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", IEC_UNITS[unit])
}

/// `H:MM on Ddd D. Mon YYYY` in the given zone.
pub fn format_date<Tz: TimeZone>(unix: i64, zone: &Tz) -> Option<String>
where
    Tz::Offset: std::fmt::Display,
{
    let at: DateTime<Tz> = zone.timestamp_opt(unix, 0).single()?;
    Some(at.format("%-H:%M on %a %-d. %b %Y").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn durations_pick_the_coarsest_unit() {
        assert_eq!(format_duration(0, Some(45), 0), "45 seconds");
        assert_eq!(format_duration(0, Some(125), 0), "2 minutes, 5 seconds");
        assert_eq!(format_duration(0, Some(7_380), 0), "2 hours, 3 minutes");
        assert_eq!(format_duration(100, None, 160), "60 seconds");
    }

    #[test]
    fn file_sizes_use_binary_prefixes() {
        assert_eq!(iec_file_size(0), "0.0 B");
        assert_eq!(iec_file_size(512), "512.0 B");
        assert_eq!(iec_file_size(1_536), "1.5 KiB");
        assert_eq!(iec_file_size(3 * 1024 * 1024), "3.0 MiB");
    }

    #[test]
    fn dates_render_in_short_form() {
        let rendered = format_date(1_700_000_000, &Utc).expect("valid timestamp");
        assert_eq!(rendered, "22:13 on Tue 14. Nov 2023");
    }
}
