//! Project constants.
//!
//! Names follow the `CONFIG_*`/`OSP_*` constants the underlying OpenSync
//! platform layer exposes, so a reader who knows the platform can match a
//! constant here to its origin at a glance.

use std::time::Duration;

// ---- Thermal Control Loop (C5) ----

/// Sampling period of the thermal control loop.
pub const CONFIG_PM_TM_PERIOD_INTERVAL: Duration = Duration::from_secs(5);

/// Number of per-source temperature measurements kept for the moving
/// average.
pub const OSP_TM_TEMP_AVG_CNT: usize = 5;

/// Hysteresis applied to the *next* state's threshold when deciding
/// whether to rise, and subtracted from the *current* state's threshold
/// when deciding whether to fall.
pub const CONFIG_PM_TM_TEMPERATURE_HYSTERESIS: i32 = 5;

/// Tolerance, in RPM, before a fan reading is considered a failure.
pub const CONFIG_PM_TM_FAN_RPM_TOLERANCE: i32 = 200;

/// Number of consecutive failed fan readings before asserting `HWERROR`.
pub const CONFIG_PM_TM_FAN_ERROR_PERIOD_TOLERANCE: u32 = 3;

/// Number of consecutive critical-temperature periods before a reboot is
/// issued.
pub const CONFIG_PM_TM_CRITICAL_TEMPERATURE_PERIOD_TOLERANCE: u32 = 3;

// ---- Latency Observation Pipeline (C6) ----

/// Maximum number of hosts drained to the report callback per invocation.
pub const LOP_REPORT_CHUNK_SIZE: usize = 64;

// ---- MAP-T/MAP-E Derivation (C4) ----

/// Default `psid_offset` when a rule leaves it unset.
pub const MAP_DEFAULT_PSID_OFFSET: u8 = 6;

/// Maximum EA-bits length.
pub const MAP_MAX_EA_LEN: u8 = 48;

/// Maximum PSID length.
pub const MAP_MAX_PSID_LEN: u8 = 16;

/// Octet offset of the embedded IPv4 address inside the MAP IPv6 address,
/// RFC 7597/7599 non-legacy encoding.
pub const MAP_V4OFFSET: usize = 10;

/// Octet offset used instead when `legacy_draft3` is set.
pub const MAP_V4OFFSET_LEGACY_DRAFT3: usize = 9;

/// Hard cap on the number of port sets derived for a single MAP object.
pub const MAP_MAX_PORT_SETS: usize = 256;

// ---- Watchdog proxy ----

/// How often the watchdog proxy pings `/dev/watchdog` in steady state.
pub const WATCHDOG_PING_INTERVAL: Duration = Duration::from_secs(5);

/// Kernel watchdog timeout set at startup, before any deadline is missed.
pub const WATCHDOG_INITIAL_TIMEOUT_SECS: u32 = 30;

/// Kernel watchdog timeout set once an external-ping deadline is missed.
pub const WATCHDOG_REDUCED_TIMEOUT_SECS: u32 = 3;

/// How long the very first external-ping deadline is armed for at
/// startup, before any external ping or tick has ever re-armed it.
pub const WATCHDOG_EXTERNAL_PING_INITIAL_DEADLINE: Duration = Duration::from_secs(80);

/// How long an external ping or steady-state tick extends the deadline
/// by, in "auto" mode, once the initial deadline has been superseded.
pub const WATCHDOG_EXTERNAL_PING_DEADLINE: Duration = Duration::from_secs(60);
