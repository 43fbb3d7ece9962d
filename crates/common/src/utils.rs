//! Utility functions for the Sync Orchestrator

use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::types::ResourceKind;

/// Formats a byte size into a human-readable string
///
/// # Examples
///
/// ```
/// use common::utils::format_bytes;
///
/// assert_eq!(format_bytes(1024), "1.0 KiB");
/// assert_eq!(format_bytes(1048576), "1.0 MiB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f64 = bytes as f64;
    let base = 1024_f64;
    let exponent = (bytes_f64.ln() / base.ln()).floor() as usize;
    let exponent = exponent.min(UNITS.len() - 1);

    let value = bytes_f64 / base.powi(exponent as i32);
    format!("{:.1} {}", value, UNITS[exponent])
}

/// Formats an amount of a resource kind for log output
pub fn format_amount(kind: &ResourceKind, amount: u64) -> String {
    match kind {
        ResourceKind::MemoryBytes => format_bytes(amount),
        ResourceKind::DeviceTime => format!("{}ms", amount),
        _ => amount.to_string(),
    }
}

/// Formats a duration into a human-readable string
///
/// # Examples
///
/// ```
/// use common::utils::format_duration;
/// use std::time::Duration;
///
/// assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();

    if total_secs == 0 {
        let millis = duration.subsec_millis();
        if millis == 0 {
            return format!("{}µs", duration.subsec_micros());
        }
        return format!("{}ms", millis);
    }

    let hours = total_secs / (60 * 60);
    let minutes = (total_secs % (60 * 60)) / 60;
    let seconds = total_secs % 60;

    let mut result = String::new();

    if hours > 0 {
        result.push_str(&format!("{}h ", hours));
    }

    if minutes > 0 || !result.is_empty() {
        result.push_str(&format!("{}m ", minutes));
    }

    result.push_str(&format!("{}s", seconds));

    result
}

/// Executes a future with a timeout attributed to a named step
///
/// Elapsed time is reported as [`Error::StepTimeout`] naming the step, so a
/// timeout is always attributable to the step that exceeded it.
pub async fn execute_with_timeout<T, F>(future: F, duration: Duration, step_name: &str) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::StepTimeout {
            step: step_name.to_string(),
            timeout_ms: duration.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h 0m 0s");
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(&ResourceKind::MemoryBytes, 2048), "2.0 KiB");
        assert_eq!(format_amount(&ResourceKind::ModelSlot, 2), "2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_with_timeout_names_step() {
        let result: Result<()> = execute_with_timeout(
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            Duration::from_millis(100),
            "memory.reserve",
        )
        .await;

        match result {
            Err(Error::StepTimeout { step, timeout_ms }) => {
                assert_eq!(step, "memory.reserve");
                assert_eq!(timeout_ms, 100);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
