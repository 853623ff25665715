//! Errors & diagnostics (C9, ambient addition).
//!
//! Per §7, almost nothing in this subsystem is fatal. Conditions that the original surfaces
//! through `errno` become [`ArenaError`] variants returned from a `Result`; conditions the
//! original logs and silently drops (double-free, bogus memid) are logged through the `log`
//! facade at the call site and never become an `Err` here — wrapping them in a `Result` would
//! change their observable behaviour.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArenaError {
    #[error("arena registry is full ({max} arenas already published)")]
    RegistryFull { max: usize },

    #[error("OS memory reservation of {requested} bytes failed")]
    OsReservationFailed { requested: usize },

    #[error("huge page reservation failed: got {reserved} of {requested} requested pages")]
    HugePageReservationFailed { requested: usize, reserved: usize },

    #[error("region of {size} bytes is smaller than one arena block ({min} bytes)")]
    RegionTooSmall { size: usize, min: usize },
}
