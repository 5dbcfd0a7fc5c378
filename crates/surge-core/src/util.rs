use std::time::Duration;

use anyhow::{anyhow, Result};

/// Parse a duration argument: an integer or decimal with an optional
/// `h`/`m`/`s`/`ms` unit; a bare number means seconds.
pub fn parse_duration_unit(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (num, mult) = if let Some(v) = s.strip_suffix("ms") {
        (v, 0.001)
    } else if let Some(v) = s.strip_suffix('h') {
        (v, 3600.0)
    } else if let Some(v) = s.strip_suffix('m') {
        (v, 60.0)
    } else if let Some(v) = s.strip_suffix('s') {
        (v, 1.0)
    } else {
        (s, 1.0)
    };

    let value: f64 = num
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid duration: {s}"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(anyhow!("invalid duration: {s}"));
    }
    Ok(Duration::from_secs_f64(value * mult))
}

/// Parse a size argument: an integer with an optional `K`/`M`/`G` unit
/// (powers of 1024).
pub fn parse_size_unit(s: &str) -> Result<u64> {
    let s = s.trim();
    let (num, mult) = match s.as_bytes().last() {
        Some(b'K') | Some(b'k') => (&s[..s.len() - 1], 1u64 << 10),
        Some(b'M') | Some(b'm') => (&s[..s.len() - 1], 1u64 << 20),
        Some(b'G') | Some(b'g') => (&s[..s.len() - 1], 1u64 << 30),
        _ => (s, 1),
    };
    let value: u64 = num
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid size: {s}"))?;
    value
        .checked_mul(mult)
        .ok_or_else(|| anyhow!("size too large: {s}"))
}

/// Humanized duration from seconds: `123us`, `4.56ms`, `1.23s`.
pub fn format_duration_secs(secs: f64) -> String {
    if secs < 0.001 {
        format!("{:.0}us", secs * 1_000_000.0)
    } else if secs < 1.0 {
        format!("{:.2}ms", secs * 1000.0)
    } else {
        format!("{:.2}s", secs)
    }
}

pub fn format_duration(d: Duration) -> String {
    format_duration_secs(d.as_secs_f64())
}

/// Humanized count with K/M/G suffixes (powers of 1024), wrk style.
pub fn format_unit(n: f64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    if n < KB {
        format!("{:.2}", n)
    } else if n < MB {
        format!("{:.2}K", n / KB)
    } else if n < GB {
        format!("{:.2}M", n / MB)
    } else {
        format!("{:.2}G", n / GB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_units() {
        assert_eq!(parse_duration_unit("10").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration_unit("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(
            parse_duration_unit("500ms").unwrap(),
            Duration::from_millis(500)
        );
        assert_eq!(parse_duration_unit("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration_unit("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(
            parse_duration_unit("0.5s").unwrap(),
            Duration::from_millis(500)
        );
        assert!(parse_duration_unit("abc").is_err());
        assert!(parse_duration_unit("-1s").is_err());
    }

    #[test]
    fn size_units() {
        assert_eq!(parse_size_unit("4096").unwrap(), 4096);
        assert_eq!(parse_size_unit("4K").unwrap(), 4096);
        assert_eq!(parse_size_unit("16M").unwrap(), 16 << 20);
        assert_eq!(parse_size_unit("1G").unwrap(), 1 << 30);
        assert!(parse_size_unit("1T").is_err());
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration_secs(0.000123), "123us");
        assert_eq!(format_duration_secs(0.00456), "4.56ms");
        assert_eq!(format_duration_secs(1.5), "1.50s");
    }

    #[test]
    fn unit_formatting() {
        assert_eq!(format_unit(512.0), "512.00");
        assert_eq!(format_unit(2048.0), "2.00K");
        assert_eq!(format_unit(3.0 * 1024.0 * 1024.0), "3.00M");
    }
}
