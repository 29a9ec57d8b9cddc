//! Conditional logging macros that check a module-level `ENABLE_LOGS` flag.
//!
//! Usage:
//! ```ignore
//! // In your module, define the flag first:
//! const ENABLE_LOGS: bool = true;
//!
//! // Then use the macros (they're exported at the crate root):
//! use crate::{log_info, log_warn, log_error, log_sampled};
//!
//! log_info!("This will log if ENABLE_LOGS is true");
//! log_sampled!(0.1, "Roughly one in ten of these reaches the log");
//! ```

/// Conditional info logging, gated on the calling module's `ENABLE_LOGS`.
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*);
        }
    };
}

/// Conditional warn logging, gated on the calling module's `ENABLE_LOGS`.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!($($arg)*);
        }
    };
}

/// Conditional error logging, gated on the calling module's `ENABLE_LOGS`.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!($($arg)*);
        }
    };
}

/// Warn for only a random fraction of calls.
///
/// Polling loops fail on every tick while a backend is down; sampling keeps the
/// log readable. Everything that is not sampled still goes out at debug level.
#[macro_export]
macro_rules! log_sampled {
    ($rate:expr, $($arg:tt)*) => {
        if ENABLE_LOGS {
            if $crate::utils::logging::should_sample($rate) {
                log::warn!($($arg)*);
            } else {
                log::debug!($($arg)*);
            }
        }
    };
}

/// Returns true for roughly `rate` of all calls. Rates outside `0.0..=1.0` are clamped.
pub fn should_sample(rate: f64) -> bool {
    let rate = rate.clamp(0.0, 1.0);
    if rate >= 1.0 {
        return true;
    }
    if rate <= 0.0 {
        return false;
    }
    rand::random::<f64>() < rate
}

/// Logger bootstrap used by the binary.
///
/// Reads `RUST_LOG`; `VIDWATCH_DEBUG=1|true` raises the default filter to debug.
pub fn init_logging() {
    let debug_mode = std::env::var("VIDWATCH_DEBUG")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let default_level = if debug_mode {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    let _ = env_logger::Builder::new()
        .filter_level(default_level)
        .parse_default_env()
        .try_init();
}
