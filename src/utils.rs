//! Provider defaults, read from the environment.

use std::{env, time::Duration};

use tracing::warn;

/// Read a number of seconds from the environment
fn seconds_from_env(variable: &str) -> Option<f64> {
    let value = env::var(variable).ok()?;
    match value.trim().parse::<f64>() {
        Ok(seconds) if seconds.is_finite() && seconds >= 0.0 => Some(seconds),
        _ => {
            warn!("Ignoring invalid {variable}='{value}'");
            None
        }
    }
}

/// Get the number of worker threads, either from environment or default 2
pub fn get_default_worker_threads() -> usize {
    env::var("PVSUPPORT_WORKER_THREADS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(2usize)
        .min(64usize)
}

/// Whether providers run every operation inline. Set `PVSUPPORT_SYNCHRONOUS=yes`
pub fn get_default_synchronous() -> bool {
    env::var("PVSUPPORT_SYNCHRONOUS")
        .map(|v| v.eq_ignore_ascii_case("yes"))
        .unwrap_or(false)
}

/// Delay between attempts to activate notifications, default 0.1 seconds
pub fn get_default_retry_delay() -> Duration {
    Duration::from_secs_f64(
        seconds_from_env("PVSUPPORT_RETRY_DELAY")
            .unwrap_or(0.1)
            .max(0.001),
    )
}

/// Poll period for poll-only variables, default 1 second.
///
/// Setting `PVSUPPORT_POLL_PERIOD=0` disables polling, so that poll-only variables
/// cannot be subscribed to.
pub fn get_default_poll_period() -> Option<Duration> {
    match seconds_from_env("PVSUPPORT_POLL_PERIOD") {
        Some(seconds) if seconds == 0.0 => None,
        Some(seconds) => Some(Duration::from_secs_f64(seconds.max(0.01))),
        None => Some(Duration::from_secs(1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_values_fall_back() {
        // Only variables no other test touches are set here
        unsafe {
            env::set_var("PVSUPPORT_TEST_SECONDS", "-3");
        }
        assert_eq!(seconds_from_env("PVSUPPORT_TEST_SECONDS"), None);
        unsafe {
            env::set_var("PVSUPPORT_TEST_SECONDS", " 0.25 ");
        }
        assert_eq!(seconds_from_env("PVSUPPORT_TEST_SECONDS"), Some(0.25));
        assert_eq!(seconds_from_env("PVSUPPORT_TEST_UNSET"), None);
    }
}
