//! Human-readable RAM/VRAM size suffix grammar: decimal (k/m/g/t = 10^3..10^12)
//! or binary (Ki/Mi/Gi = 2^10..2^30); suffixless is bytes.

use crate::error::{OrchestratorError, Result};

/// Parse a size string like "4Gi", "512M", or "1048576" into a byte count.
pub fn parse_size(raw: &str) -> Result<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(OrchestratorError::Config("empty size value".into()));
    }

    if let Some((number, multiplier)) = split_suffix(raw, 2) {
        return scale(number, multiplier, raw);
    }
    if let Some((number, multiplier)) = split_suffix(raw, 1) {
        return scale(number, multiplier, raw);
    }

    raw.parse::<u64>()
        .map_err(|_| OrchestratorError::Config(format!("invalid size value: {raw}")))
}

fn split_suffix(raw: &str, suffix_len: usize) -> Option<(&str, f64)> {
    if raw.len() <= suffix_len {
        return None;
    }
    let split_at = raw.len() - suffix_len;
    let suffix = &raw[split_at..];
    let multiplier = match suffix {
        "k" | "K" => 1_000.0,
        "m" | "M" => 1_000_000.0,
        "g" | "G" => 1_000_000_000.0,
        "t" | "T" => 1_000_000_000_000.0,
        "Ki" => (1u64 << 10) as f64,
        "Mi" => (1u64 << 20) as f64,
        "Gi" => (1u64 << 30) as f64,
        _ => return None,
    };
    Some((&raw[..split_at], multiplier))
}

fn scale(number: &str, multiplier: f64, original: &str) -> Result<u64> {
    let value: f64 = number
        .parse()
        .map_err(|_| OrchestratorError::Config(format!("invalid size value: {original}")))?;
    Ok((value * multiplier) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_binary_suffix() {
        assert_eq!(parse_size("4Gi").unwrap(), 4 * (1u64 << 30));
    }

    #[test]
    fn parses_decimal_suffix() {
        assert_eq!(parse_size("4G").unwrap(), 4 * 1_000_000_000);
    }

    #[test]
    fn parses_bare_number() {
        assert_eq!(parse_size("512").unwrap(), 512);
    }

    #[test]
    fn parses_kibi_mebi() {
        assert_eq!(parse_size("512Ki").unwrap(), 512 * (1u64 << 10));
        assert_eq!(parse_size("2Mi").unwrap(), 2 * (1u64 << 20));
    }

    #[test]
    fn rejects_empty_and_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("not-a-size").is_err());
    }
}
