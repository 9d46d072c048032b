use rand_core::{OsRng, RngCore};

use crate::error::ScratchError;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Parse a human-readable size string into bytes.
///
/// Accepts formats like `"20G"`, `"512M"`, `"100K"`, `"1073741824"`.
/// Uses binary units (1G = 1024³ = 1,073,741,824 bytes).
pub fn parse_size(s: &str) -> Result<u64, ScratchError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ScratchError::Validation {
            message: "size cannot be empty".into(),
        });
    }

    // Split into numeric part and suffix
    let (num_str, suffix) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(i) => (&s[..i], s[i..].to_ascii_uppercase()),
        None => (s, String::new()),
    };

    let num: u64 = num_str.parse().map_err(|_| ScratchError::Validation {
        message: format!("invalid size number: '{num_str}'"),
    })?;

    let multiplier: u64 = match suffix.as_str() {
        "" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => MIB,
        "G" | "GB" => GIB,
        "T" | "TB" => 1024 * GIB,
        _ => {
            return Err(ScratchError::Validation {
                message: format!("unknown size suffix: '{suffix}' (use G, M, K, or T)"),
            });
        }
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| ScratchError::Validation {
            message: format!("size overflows: '{s}'"),
        })
}

/// Memory flag value in MiB. A bare number is already MiB (`--ram 2048`).
pub fn parse_mib(s: &str) -> Result<u64, ScratchError> {
    if s.trim().chars().all(|c| c.is_ascii_digit()) {
        return parse_size(s);
    }
    Ok(parse_size(s)? / MIB)
}

/// Disk flag value in GiB. A bare number is already GiB (`--disk 8`).
pub fn parse_gib(s: &str) -> Result<u64, ScratchError> {
    if s.trim().chars().all(|c| c.is_ascii_digit()) {
        return parse_size(s);
    }
    Ok(parse_size(s)? / GIB)
}

/// VM names double as bundle directory names, so keep them path-safe.
pub fn validate_vm_name(name: &str) -> Result<(), ScratchError> {
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if !valid {
        return Err(ScratchError::Validation {
            message: format!("VM name must match [a-zA-Z0-9][a-zA-Z0-9._-]* (got '{name}')"),
        });
    }
    Ok(())
}

/// Random locally administered unicast MAC, e.g. `52:9f:03:7a:c1:0e`.
pub fn random_mac() -> String {
    let mut bytes = [0u8; 6];
    OsRng.fill_bytes(&mut bytes);
    format_mac(bytes)
}

fn format_mac(mut bytes: [u8; 6]) -> String {
    // clear multicast bit, set locally-administered bit
    bytes[0] = (bytes[0] & 0xfe) | 0x02;
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Normalize a MAC address to lowercase, zero-padded octets.
/// `2:a:3f:0:1:ff` (as printed by macOS `arp`) → `02:0a:3f:00:01:ff`.
pub fn normalize_mac(mac: &str) -> Option<String> {
    let octets: Vec<u8> = mac
        .split([':', '-'])
        .map(|part| u8::from_str_radix(part, 16).ok())
        .collect::<Option<_>>()?;
    if octets.len() != 6 {
        return None;
    }
    Some(
        octets
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":"),
    )
}

/// Single-quote a string for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_gibibytes() {
        assert_eq!(parse_size("20G").unwrap(), 20 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("1GB").unwrap(), 1024 * 1024 * 1024);
    }

    #[test]
    fn parse_size_mebibytes() {
        assert_eq!(parse_size("512M").unwrap(), 512 * 1024 * 1024);
    }

    #[test]
    fn parse_size_rejects_empty() {
        assert!(parse_size("").is_err());
    }

    #[test]
    fn parse_size_rejects_bad_suffix() {
        assert!(parse_size("10X").is_err());
    }

    #[test]
    fn bare_numbers_keep_their_flag_unit() {
        assert_eq!(parse_mib("2048").unwrap(), 2048);
        assert_eq!(parse_mib("4G").unwrap(), 4096);
        assert_eq!(parse_gib("8").unwrap(), 8);
        assert_eq!(parse_gib("16G").unwrap(), 16);
    }

    #[test]
    fn vm_names() {
        assert!(validate_vm_name("alpine-template").is_ok());
        assert!(validate_vm_name("ci_run.3").is_ok());
        assert!(validate_vm_name("").is_err());
        assert!(validate_vm_name("-leading").is_err());
        assert!(validate_vm_name("has space").is_err());
        assert!(validate_vm_name("../escape").is_err());
    }

    #[test]
    fn mac_is_local_unicast() {
        let mac = format_mac([0xff, 0, 0, 0, 0, 1]);
        assert_eq!(mac, "fe:00:00:00:00:01");
        let first = u8::from_str_radix(&random_mac()[..2], 16).unwrap();
        assert_eq!(first & 0x01, 0);
        assert_eq!(first & 0x02, 0x02);
    }

    #[test]
    fn mac_normalization() {
        assert_eq!(
            normalize_mac("2:a:3f:0:1:FF").as_deref(),
            Some("02:0a:3f:00:01:ff")
        );
        assert_eq!(normalize_mac("incomplete"), None);
        assert_eq!(normalize_mac("1:2:3"), None);
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
