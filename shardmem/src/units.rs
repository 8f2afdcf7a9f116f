//! Human-readable byte sizes for the command line.

use crate::errors::{Result, ShardMemError};

/// Checked in order, so the bare `B` suffix must stay last
const SUFFIXES: &[(&str, u64)] = &[
    ("GIB", 1 << 30),
    ("MIB", 1 << 20),
    ("KIB", 1 << 10),
    ("GB", 1_000_000_000),
    ("MB", 1_000_000),
    ("KB", 1_000),
    ("B", 1),
];

/// Parse a size such as `4096`, `64KiB`, `1.5GB` or `16 MiB` into bytes.
///
/// Fractional values must resolve to a whole number of bytes, since
/// allocation sizes and record widths are exact.
pub fn parse_memory_string(s: &str) -> Result<u64> {
    let upper = s.trim().to_uppercase();
    let invalid = || {
        ShardMemError::InvalidInput(format!(
            "Invalid size '{}'. Use a format like '4096', '64KiB', '512MB' or '2GiB'",
            s
        ))
    };

    let (number, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, mult)| upper.strip_suffix(suffix).map(|n| (n.trim(), *mult)))
        .unwrap_or((upper.as_str(), 1));

    if number.is_empty() {
        return Err(invalid());
    }

    match number.split_once('.') {
        None => number
            .parse::<u64>()
            .ok()
            .and_then(|n| n.checked_mul(multiplier))
            .ok_or_else(invalid),
        Some((whole, frac)) => {
            let whole: u64 = if whole.is_empty() {
                0
            } else {
                whole.parse().map_err(|_| invalid())?
            };
            if frac.is_empty() || frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            let scale = 10u64.pow(frac.len() as u32);
            let frac: u64 = frac.parse().map_err(|_| invalid())?;

            let frac_bytes = (frac as u128 * multiplier as u128) / scale as u128;
            if (frac as u128 * multiplier as u128) % scale as u128 != 0 {
                return Err(ShardMemError::InvalidInput(format!(
                    "Size '{}' is not a whole number of bytes",
                    s
                )));
            }

            whole
                .checked_mul(multiplier)
                .and_then(|w| w.checked_add(frac_bytes as u64))
                .ok_or_else(invalid)
        }
    }
}

/// Format bytes as human-readable string (binary units)
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= 1 << 30 {
        format!("{:.1} GiB", bytes as f64 / (1u64 << 30) as f64)
    } else if bytes >= 1 << 20 {
        format!("{:.1} MiB", bytes as f64 / (1u64 << 20) as f64)
    } else if bytes >= 1 << 10 {
        format!("{:.1} KiB", bytes as f64 / (1u64 << 10) as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_bytes() {
        assert_eq!(parse_memory_string("4096").unwrap(), 4096);
        assert_eq!(parse_memory_string(" 12 B ").unwrap(), 12);
    }

    #[test]
    fn test_parse_binary_units() {
        assert_eq!(parse_memory_string("64KiB").unwrap(), 65_536);
        assert_eq!(parse_memory_string("16 MiB").unwrap(), 16 * 1_048_576);
        assert_eq!(parse_memory_string("2gib").unwrap(), 2 * 1_073_741_824);
    }

    #[test]
    fn test_parse_decimal_units() {
        assert_eq!(parse_memory_string("512MB").unwrap(), 512_000_000);
        assert_eq!(parse_memory_string("1.5GB").unwrap(), 1_500_000_000);
        assert_eq!(parse_memory_string("3KB").unwrap(), 3_000);
    }

    #[test]
    fn test_parse_rejects_fractional_bytes() {
        assert!(parse_memory_string("1.5").is_err());
        assert!(parse_memory_string("0.1KiB").is_err());
        assert_eq!(parse_memory_string("0.5KiB").unwrap(), 512);
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse_memory_string("").is_err());
        assert!(parse_memory_string("GB").is_err());
        assert!(parse_memory_string("lots").is_err());
        assert!(parse_memory_string("-5MB").is_err());
        assert!(parse_memory_string("99999999999GiB").is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 bytes");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(16 * 1_048_576), "16.0 MiB");
        assert_eq!(format_bytes(3 * 1_073_741_824), "3.0 GiB");
    }
}
