//! Shared helpers.

use chrono::{DateTime, NaiveDate, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Install a ctrl-c handler and return the cooperative termination flag.
/// Long passes poll the flag between records, finish the record in flight,
/// flush state and exit non-zero.
pub fn termination_flag() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&flag);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Termination requested; finishing current record");
            handler_flag.store(true, Ordering::Relaxed);
        }
    });
    flag
}

/// Parse a CLI date argument: RFC 3339 or a plain `YYYY-MM-DD` day.
pub fn parse_date_arg(value: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        let midnight = date.and_hms_opt(0, 0, 0).unwrap();
        return Ok(DateTime::from_naive_utc_and_offset(midnight, Utc));
    }
    anyhow::bail!("cannot parse date '{value}' (expected YYYY-MM-DD or RFC 3339)")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_date_arg() {
        assert_eq!(
            parse_date_arg("2024-03-01").unwrap().timestamp(),
            1709251200
        );
        assert_eq!(
            parse_date_arg("2024-03-01T12:00:00+02:00").unwrap().timestamp(),
            1709287200
        );
        assert!(parse_date_arg("yesterday").is_err());
    }
}
