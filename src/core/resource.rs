//! Resource management - Container limits and size formatting

use serde::{Deserialize, Serialize};

pub const KIB: u64 = 1024;
pub const MIB: u64 = KIB * 1024;
pub const GIB: u64 = MIB * 1024;
pub const TIB: u64 = GIB * 1024;

/// Resource limits applied to the managed container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in the runtime's notation (e.g. "2g", "512m")
    pub memory: String,
    /// CPU limit as a fractional core count (e.g. "2", "1.5")
    pub cpus: String,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory: "2g".to_string(),
            cpus: "2".to_string(),
        }
    }
}

impl ResourceLimits {
    /// Create limits with a memory cap
    pub fn with_memory_limit(mut self, memory: impl Into<String>) -> Self {
        self.memory = memory.into();
        self
    }

    /// Create limits with a CPU cap
    pub fn with_cpu_limit(mut self, cpus: impl Into<String>) -> Self {
        self.cpus = cpus.into();
        self
    }

    /// Memory limit in bytes, if it parses
    pub fn memory_bytes(&self) -> Option<u64> {
        parse_size(&self.memory)
    }

    /// Check that both limits are well-formed
    pub fn is_valid(&self) -> bool {
        self.memory_bytes().is_some_and(|b| b > 0)
            && self.cpus.parse::<f64>().is_ok_and(|c| c > 0.0)
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= TIB {
        format!("{:.2} TB", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.2} GB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KB", bytes as f64 / KIB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Bytes expressed as fractional gigabytes
pub fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / GIB as f64
}

/// Parse a size as printed by container runtimes ("100MiB", "1.5GB", "2g", "512kB").
///
/// Decimal and binary suffixes are both treated as binary multiples, which is
/// what `docker stats` and `--memory` actually mean.
pub fn parse_size(input: &str) -> Option<u64> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number.parse().ok()?;

    let multiplier = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => KIB,
        "m" | "mb" | "mib" => MIB,
        "g" | "gb" | "gib" => GIB,
        "t" | "tb" | "tib" => TIB,
        _ => return None,
    };

    Some((value * multiplier as f64) as u64)
}

/// Parse a percentage string such as "12.5%"
pub fn parse_percent(input: &str) -> Option<f64> {
    input.trim().trim_end_matches('%').trim().parse().ok()
}
