//! Resource ceilings for interpreter processes
//!
//! The ceiling is applied by the launching shell (`ulimit -v`) before the
//! interpreter image replaces it, so it covers the interpreter and anything
//! it forks.

use serde::{Deserialize, Serialize};

/// Default virtual-memory ceiling (100 MiB)
pub const DEFAULT_MEMORY_BYTES: u64 = 100 * 1024 * 1024;

/// Resource limits for one interpreter process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Virtual memory ceiling in bytes (default: 100MiB)
    pub memory_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: DEFAULT_MEMORY_BYTES,
        }
    }
}

impl ResourceLimits {
    /// Create resource limits with custom memory (saturating)
    #[must_use]
    pub fn with_memory_mb(mut self, mb: u64) -> Self {
        self.memory_bytes = mb.saturating_mul(1024 * 1024);
        self
    }

    /// Memory ceiling in KiB, the unit `ulimit -v` expects.
    ///
    /// Rounds down, but never below 1.
    #[must_use]
    pub fn memory_kib(&self) -> u64 {
        (self.memory_bytes / 1024).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.memory_bytes, 100 * 1024 * 1024);
        assert_eq!(limits.memory_kib(), 102_400);
    }

    #[test]
    fn test_custom_memory() {
        let limits = ResourceLimits::default().with_memory_mb(256);
        assert_eq!(limits.memory_bytes, 256 * 1024 * 1024);
        assert_eq!(limits.memory_kib(), 262_144);
    }

    #[test]
    fn test_huge_memory_saturates() {
        let limits = ResourceLimits::default().with_memory_mb(u64::MAX);
        assert_eq!(limits.memory_bytes, u64::MAX);
        assert_eq!(limits.memory_kib(), u64::MAX / 1024);
    }

    #[test]
    fn test_tiny_memory_rounds_to_one_kib() {
        let limits = ResourceLimits { memory_bytes: 10 };
        assert_eq!(limits.memory_kib(), 1);
    }
}
