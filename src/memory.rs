//! Byte size parsing and formatting for segment sizing.
//!
//! Accepts human-readable sizes such as "16M", "1.5G" or "65536b" so the
//! segment size can be given on the command line or in the environment.

use std::fmt;
use std::str::FromStr;

/// Size in bytes with parsing and formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemorySize(u64);

impl MemorySize {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create from kibibytes (KiB).
    pub const fn from_kib(kib: u64) -> Self {
        Self(kib * 1024)
    }

    /// Create from mebibytes (MiB).
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * 1024 * 1024)
    }

    /// Get the raw byte count.
    pub const fn as_bytes(&self) -> u64 {
        self.0
    }

    /// Get the size in mebibytes (MiB), truncated.
    pub const fn as_mib(&self) -> u64 {
        self.0 / (1024 * 1024)
    }

    /// Byte count as `usize`, or `None` if it does not fit the address space.
    pub fn to_usize(self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }
}

impl Default for MemorySize {
    fn default() -> Self {
        DEFAULT_SEGMENT_SIZE
    }
}

/// Errors that can occur when parsing a size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// Invalid format in size string.
    InvalidFormat(String),
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFormat(msg) => write!(f, "invalid size: {}", msg),
        }
    }
}

impl std::error::Error for MemoryError {}

impl FromStr for MemorySize {
    type Err = MemoryError;

    /// Parse a human-readable size string.
    ///
    /// Supported formats:
    /// - Plain number: treated as MiB (e.g., "16" = 16 MiB)
    /// - With suffix: "65536b", "512K", "16M", "16MB", "16MiB", "1G"
    /// - Case insensitive
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(MemoryError::InvalidFormat("empty string".into()));
        }

        let num_end = s
            .chars()
            .position(|c| !c.is_ascii_digit() && c != '.')
            .unwrap_or(s.len());

        if num_end == 0 {
            return Err(MemoryError::InvalidFormat(format!(
                "no numeric value in '{}'",
                s
            )));
        }

        let num_str = &s[..num_end];
        let suffix = s[num_end..].trim().to_lowercase();

        let value: f64 = num_str
            .parse()
            .map_err(|_| MemoryError::InvalidFormat(format!("invalid number: '{}'", num_str)))?;

        let multiplier: u64 = match suffix.as_str() {
            "" => 1024 * 1024,
            "b" => 1,
            "k" | "kb" | "kib" => 1024,
            "m" | "mb" | "mib" => 1024 * 1024,
            "g" | "gb" | "gib" => 1024 * 1024 * 1024,
            _ => {
                return Err(MemoryError::InvalidFormat(format!(
                    "unknown suffix: '{}'",
                    suffix
                )));
            }
        };

        Ok(MemorySize((value * multiplier as f64) as u64))
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MIB: u64 = 1024 * 1024;

        if self.0 >= MIB && self.0 % MIB == 0 {
            write!(f, "{} MiB", self.as_mib())
        } else if self.0 >= MIB {
            write!(f, "{:.1} MiB", self.0 as f64 / MIB as f64)
        } else if self.0 >= 1024 && self.0 % 1024 == 0 {
            write!(f, "{} KiB", self.0 / 1024)
        } else {
            write!(f, "{} bytes", self.0)
        }
    }
}

/// Default shared memory segment size (16 MiB).
pub const DEFAULT_SEGMENT_SIZE: MemorySize = MemorySize::from_mib(16);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_number_as_mib() {
        assert_eq!(MemorySize::from_str("16").unwrap().as_mib(), 16);
    }

    #[test]
    fn test_parse_with_suffix() {
        assert_eq!(MemorySize::from_str("16M").unwrap().as_mib(), 16);
        assert_eq!(MemorySize::from_str("16MiB").unwrap().as_mib(), 16);
        assert_eq!(MemorySize::from_str("1g").unwrap().as_mib(), 1024);
        assert_eq!(MemorySize::from_str("512K").unwrap().as_bytes(), 512 * 1024);
        assert_eq!(MemorySize::from_str("65536b").unwrap().as_bytes(), 65536);
    }

    #[test]
    fn test_parse_fractional() {
        assert_eq!(MemorySize::from_str("1.5M").unwrap().as_bytes(), 1536 * 1024);
    }

    #[test]
    fn test_parse_errors() {
        assert!(MemorySize::from_str("").is_err());
        assert!(MemorySize::from_str("abc").is_err());
        assert!(MemorySize::from_str("16X").is_err());
        assert!(MemorySize::from_str("-5M").is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(MemorySize::from_mib(16).to_string(), "16 MiB");
        assert_eq!(MemorySize::from_kib(1536).to_string(), "1.5 MiB");
        assert_eq!(MemorySize::from_kib(64).to_string(), "64 KiB");
        assert_eq!(MemorySize::from_bytes(100).to_string(), "100 bytes");
    }

    #[test]
    fn test_default() {
        assert_eq!(MemorySize::default().as_mib(), 16);
    }
}
