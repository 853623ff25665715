//! Configuration (C8, ambient addition).
//!
//! The original consumes a global `option_get`/`option_is_enabled` store (explicitly out of
//! scope, §6). Here it is an explicit value passed into [`crate::Allocator::new`] — no ambient
//! singleton, per the Design Notes' preference for an explicit initialisation contract.

use std::env;

/// Diagnostic verbosity, mirroring the original's `verbose` / `warning` / `error` levels.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// Only hard errors are logged.
    Error,
    /// Errors and recoverable anomalies (double-free, bogus memid) are logged.
    Warning,
    /// Everything above, plus routine trace of claims, frees and purges.
    Verbose,
}

/// The four recognised options from §6, plus a verbosity knob for the diagnostic sink.
#[derive(Copy, Clone, Debug)]
pub struct ArenaOptions {
    /// Bytes to eagerly reserve into a fresh arena when no existing arena can satisfy a
    /// request. `0` disables eager reservation.
    pub arena_reserve: usize,
    /// Delay, in milliseconds, before a scheduled purge becomes eligible for the sweep.
    /// `0` means "purge immediately, never schedule".
    pub arena_purge_delay_ms: i64,
    /// If set, purges decommit (`OsMemory::decommit`) rather than reset
    /// (`OsMemory::reset`).
    pub reset_decommits: bool,
    /// If set, `alloc` never falls back to a direct OS allocation; it returns `None`
    /// instead once no arena can satisfy the request.
    pub limit_os_alloc: bool,
    pub verbosity: Verbosity,
}

impl Default for ArenaOptions {
    fn default() -> Self {
        ArenaOptions {
            arena_reserve: 1024 * 1024 * 1024, // 1 GiB, matching the original's default
            arena_purge_delay_ms: 10_000,
            reset_decommits: false,
            limit_os_alloc: false,
            verbosity: Verbosity::Warning,
        }
    }
}

impl ArenaOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `MIARENA_ARENA_RESERVE`, `MIARENA_PURGE_DELAY_MS`, `MIARENA_RESET_DECOMMITS`,
    /// `MIARENA_LIMIT_OS_ALLOC` and `MIARENA_VERBOSITY` from the process environment,
    /// falling back to [`ArenaOptions::default`] for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        ArenaOptions {
            arena_reserve: env_usize("MIARENA_ARENA_RESERVE", defaults.arena_reserve),
            arena_purge_delay_ms: env_i64("MIARENA_PURGE_DELAY_MS", defaults.arena_purge_delay_ms),
            reset_decommits: env_bool("MIARENA_RESET_DECOMMITS", defaults.reset_decommits),
            limit_os_alloc: env_bool("MIARENA_LIMIT_OS_ALLOC", defaults.limit_os_alloc),
            verbosity: match env::var("MIARENA_VERBOSITY").as_deref() {
                Ok("error") => Verbosity::Error,
                Ok("verbose") => Verbosity::Verbose,
                Ok("warning") => Verbosity::Warning,
                _ => defaults.verbosity,
            },
        }
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_i64(name: &str, default: i64) -> i64 {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name).as_deref() {
        Ok("1") | Ok("true") => true,
        Ok("0") | Ok("false") => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let opts = ArenaOptions::default();
        assert!(opts.arena_reserve > 0);
        assert!(opts.arena_purge_delay_ms > 0);
        assert!(!opts.reset_decommits);
        assert!(!opts.limit_os_alloc);
    }

    #[test]
    fn env_fallback_to_default_when_unset() {
        env::remove_var("MIARENA_ARENA_RESERVE_TEST_UNUSED");
        assert_eq!(env_usize("MIARENA_ARENA_RESERVE_TEST_UNUSED", 42), 42);
    }
}
