//! Cache configuration and TTL policy.

use std::time::Duration;

const DEFAULT_TTL_SECS: u64 = 30 * 60;
const DEFAULT_MAX_TTL_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_PURGE_INTERVAL_SECS: u64 = 60;

/// Runtime cache policy derived from `[cache]` settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// TTL applied when a subsystem write asks for zero.
    pub default_ttl: Duration,
    /// Upper bound for any subsystem write.
    pub max_ttl: Duration,
    /// How often the worker sweeps expired entries out of durable engines.
    pub purge_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            max_ttl: Duration::from_secs(DEFAULT_MAX_TTL_SECS),
            purge_interval: Duration::from_secs(DEFAULT_PURGE_INTERVAL_SECS),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            default_ttl: Duration::from_secs(u64::from(settings.default_ttl_secs.get())),
            max_ttl: Duration::from_secs(u64::from(settings.max_ttl_secs.get())),
            purge_interval: Duration::from_secs(u64::from(settings.purge_interval_secs.get())),
        }
    }
}

impl CacheConfig {
    /// Resolve the TTL for a subsystem write.
    ///
    /// Zero means "use `fallback`" rather than "never expire"; the result is
    /// always finite and never above `max_ttl`.
    pub fn resolve_ttl(&self, requested: Duration, fallback: Duration) -> Duration {
        let ttl = if requested.is_zero() {
            fallback
        } else {
            requested
        };
        let ttl = if ttl.is_zero() { self.default_ttl } else { ttl };
        ttl.min(self.max_ttl)
    }

    /// [`resolve_ttl`](Self::resolve_ttl) with the cache-wide default.
    pub fn entry_ttl(&self, requested: Duration) -> Duration {
        self.resolve_ttl(requested, self.default_ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CacheConfig {
        CacheConfig {
            default_ttl: Duration::from_secs(60),
            max_ttl: Duration::from_secs(3600),
            purge_interval: Duration::from_secs(5),
        }
    }

    #[test]
    fn zero_ttl_uses_fallback_then_default() {
        let cfg = config();
        assert_eq!(
            cfg.resolve_ttl(Duration::ZERO, Duration::from_secs(120)),
            Duration::from_secs(120)
        );
        assert_eq!(
            cfg.resolve_ttl(Duration::ZERO, Duration::ZERO),
            Duration::from_secs(60)
        );
        assert_eq!(cfg.entry_ttl(Duration::ZERO), Duration::from_secs(60));
    }

    #[test]
    fn ttl_is_clamped_to_ceiling() {
        let cfg = config();
        assert_eq!(
            cfg.entry_ttl(Duration::from_secs(86_400)),
            Duration::from_secs(3600)
        );
        assert_eq!(cfg.entry_ttl(Duration::from_secs(5)), Duration::from_secs(5));
    }
}
