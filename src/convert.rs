use chrono::{DateTime, SecondsFormat, Utc};
use std::time::{Duration, SystemTime};

/// Format a duration the way the ingestion service expects: `d.hh:mm:ss.ffffff`.
pub(crate) fn duration_to_string(duration: Duration) -> String {
    let micros = duration.as_micros();
    let s = micros / 1_000_000 % 60;
    let m = micros / 1_000_000 / 60 % 60;
    let h = micros / 1_000_000 / 60 / 60 % 24;
    let d = micros / 1_000_000 / 60 / 60 / 24;
    let micros_remaining = micros % 1_000_000;
    format!(
        "{}.{:0>2}:{:0>2}:{:0>2}.{:0>6}",
        d, h, m, s, micros_remaining
    )
}

pub(crate) fn time_to_string(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Duration::from_micros(123456789123), "1.10:17:36.789123" ; "all")]
    #[test_case(Duration::from_micros(123), "0.00:00:00.000123" ; "micros only")]
    #[test_case(Duration::from_secs(5), "0.00:00:05.000000" ; "seconds only")]
    fn duration(duration: Duration, expected: &'static str) {
        assert_eq!(expected.to_string(), duration_to_string(duration));
    }

    #[test]
    fn time() {
        let time = SystemTime::UNIX_EPOCH + Duration::from_millis(1_600_000_000_123);
        assert_eq!("2020-09-13T12:26:40.123Z", time_to_string(time));
    }
}
