//! Finding the first window in which both the main thread and the network are quiet.
//!
//! All times are milliseconds relative to the same origin. A quiet window must
//! last at least [`REQUIRED_QUIET_WINDOW_MS`] and end after the reference
//! timestamp plus that window.

use crate::driver::NetworkRecord;
use crate::errors::QuietPeriodError;
use serde::{Deserialize, Serialize};

pub const REQUIRED_QUIET_WINDOW_MS: f64 = 5000.0;

/// Requests that may stay in flight while the network still counts as quiet.
pub const ALLOWED_CONCURRENT_REQUESTS: usize = 2;

/// A span of time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeInterval {
    pub start: f64,
    pub end: f64,
}

impl TimeInterval {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Timing of one network request, as far as quiet detection cares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestTiming {
    pub start: f64,
    /// `None` while the request never finished.
    pub end: Option<f64>,
    pub method: String,
    pub status_code: Option<u16>,
    pub failed: bool,
}

impl RequestTiming {
    /// Timing of `record`, shifted so `origin_ms` becomes zero.
    pub fn from_record(record: &NetworkRecord, origin_ms: f64) -> Self {
        Self {
            start: record.start_time_ms - origin_ms,
            end: record
                .end_time_ms
                .filter(|_| record.finished)
                .map(|end| end - origin_ms),
            method: record.request_method.clone(),
            status_code: record.status_code,
            failed: record.failed,
        }
    }

    /// Whether the request counts towards network activity.
    ///
    /// Unfinished, failed, non-GET, and server-error requests are ignored.
    fn counts(&self) -> bool {
        self.end.is_some()
            && !self.failed
            && self.method == "GET"
            && self.status_code.is_none_or(|status| status < 500)
    }
}

/// The first CPU and network quiet periods that overlap long enough.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuietPeriods {
    pub cpu: TimeInterval,
    pub network: TimeInterval,
}

impl QuietPeriods {
    /// The first moment at which both the CPU and the network were quiet.
    pub fn quiet_start(&self) -> f64 {
        self.cpu.start.max(self.network.start)
    }
}

/// Periods where at most `allowed_concurrent` counted requests were in flight.
pub fn network_quiet_periods(
    requests: &[RequestTiming],
    trace_end: f64,
    allowed_concurrent: usize,
) -> Vec<TimeInterval> {
    let mut boundaries: Vec<(f64, bool)> = requests
        .iter()
        .filter(|r| r.counts())
        .flat_map(|r| [(r.start, true), (r.end.unwrap_or(r.start), false)])
        .collect();
    boundaries.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut in_flight = 0usize;
    let mut quiet_start = 0.0;
    let mut periods = Vec::new();
    for (time, is_start) in boundaries {
        if is_start {
            if in_flight == allowed_concurrent {
                periods.push(TimeInterval::new(quiet_start, time));
            }
            in_flight += 1;
        } else {
            in_flight = in_flight.saturating_sub(1);
            if in_flight == allowed_concurrent {
                quiet_start = time;
            }
        }
    }

    if in_flight <= allowed_concurrent {
        periods.push(TimeInterval::new(quiet_start, trace_end));
    }
    periods
}

/// Gaps between busy intervals, from zero to `trace_end`.
///
/// `busy` must be sorted by start time.
pub fn cpu_quiet_periods(busy: &[TimeInterval], trace_end: f64) -> Vec<TimeInterval> {
    let (Some(first), Some(last)) = (busy.first(), busy.last()) else {
        return vec![TimeInterval::new(0.0, trace_end)];
    };

    let mut periods = vec![TimeInterval::new(0.0, first.start)];
    periods.extend(
        busy.windows(2)
            .map(|pair| TimeInterval::new(pair[0].end, pair[1].start)),
    );
    periods.push(TimeInterval::new(last.end, trace_end));
    periods
}

/// Find the earliest overlapping CPU and network quiet window after `reference`.
///
/// Fails with `NoQuietPeriod` when neither resource has a long enough quiet
/// window, and otherwise names the resource that never went quiet in time.
pub fn find_overlapping_quiet_periods(
    cpu_busy: &[TimeInterval],
    requests: &[RequestTiming],
    reference: f64,
    trace_end: f64,
) -> Result<QuietPeriods, QuietPeriodError> {
    let long_enough = |period: &TimeInterval| {
        period.end > reference + REQUIRED_QUIET_WINDOW_MS
            && period.duration() >= REQUIRED_QUIET_WINDOW_MS
    };

    let mut busy = cpu_busy.to_vec();
    busy.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut cpu_candidates = cpu_quiet_periods(&busy, trace_end)
        .into_iter()
        .filter(long_enough)
        .peekable();
    let mut network_candidates =
        network_quiet_periods(requests, trace_end, ALLOWED_CONCURRENT_REQUESTS)
            .into_iter()
            .filter(long_enough)
            .peekable();

    if cpu_candidates.peek().is_none() && network_candidates.peek().is_none() {
        return Err(QuietPeriodError::NoQuietPeriod);
    }

    let mut cpu = cpu_candidates.next();
    let mut network = network_candidates.next();
    while let (Some(cpu_period), Some(network_period)) = (cpu, network) {
        if cpu_period.start >= network_period.start {
            if network_period.end >= cpu_period.start + REQUIRED_QUIET_WINDOW_MS {
                return Ok(QuietPeriods {
                    cpu: cpu_period,
                    network: network_period,
                });
            }
            network = network_candidates.next();
        } else {
            if cpu_period.end >= network_period.start + REQUIRED_QUIET_WINDOW_MS {
                return Ok(QuietPeriods {
                    cpu: cpu_period,
                    network: network_period,
                });
            }
            cpu = cpu_candidates.next();
        }
    }

    Err(if cpu.is_some() {
        QuietPeriodError::NoNetworkIdlePeriod
    } else {
        QuietPeriodError::NoCpuIdlePeriod
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(start: f64, end: f64) -> RequestTiming {
        RequestTiming {
            start,
            end: Some(end),
            method: "GET".into(),
            status_code: Some(200),
            failed: false,
        }
    }

    #[test]
    fn test_network_idle_but_cpu_busy() {
        let result = find_overlapping_quiet_periods(
            &[TimeInterval::new(3000.0, 8000.0)],
            &[get(0.0, 1900.0)],
            2500.0,
            10_000.0,
        );
        assert_eq!(result, Err(QuietPeriodError::NoCpuIdlePeriod));
    }

    #[test]
    fn test_cpu_idle_but_network_busy() {
        let requests: Vec<_> = (0..3).map(|_| get(0.0, 9500.0)).collect();
        let result = find_overlapping_quiet_periods(&[], &requests, 1000.0, 10_000.0);
        assert_eq!(result, Err(QuietPeriodError::NoNetworkIdlePeriod));
    }

    #[test]
    fn test_nothing_quiet() {
        let requests: Vec<_> = (0..3).map(|_| get(0.0, 9500.0)).collect();
        let result = find_overlapping_quiet_periods(
            &[TimeInterval::new(1000.0, 9000.0)],
            &requests,
            1000.0,
            10_000.0,
        );
        assert_eq!(result, Err(QuietPeriodError::NoQuietPeriod));
        assert_eq!(QuietPeriodError::NoQuietPeriod.code(), "NO_QUIET_PERIOD");
    }

    #[test]
    fn test_finds_first_overlap_after_reference() {
        let cpu = [
            TimeInterval::new(1000.0, 2000.0),
            TimeInterval::new(4000.0, 4500.0),
        ];
        let requests = [get(0.0, 3000.0), get(100.0, 3500.0), get(200.0, 5000.0)];
        let periods = find_overlapping_quiet_periods(&cpu, &requests, 1500.0, 20_000.0).unwrap();

        assert_eq!(periods.cpu, TimeInterval::new(4500.0, 20_000.0));
        assert_eq!(periods.network, TimeInterval::new(3000.0, 20_000.0));
        assert_eq!(periods.quiet_start(), 4500.0);
    }

    #[test]
    fn test_ignored_requests_do_not_count() {
        let mut post = get(0.0, 9000.0);
        post.method = "POST".into();
        let mut failed = get(0.0, 9000.0);
        failed.failed = true;
        let mut server_error = get(0.0, 9000.0);
        server_error.status_code = Some(503);
        let unfinished = RequestTiming {
            end: None,
            ..get(0.0, 0.0)
        };

        let periods = network_quiet_periods(
            &[post, failed, server_error, unfinished],
            10_000.0,
            0,
        );
        assert_eq!(periods, vec![TimeInterval::new(0.0, 10_000.0)]);
    }

    #[test]
    fn test_client_error_responses_still_count() {
        let mut not_found = get(1000.0, 9000.0);
        not_found.status_code = Some(404);

        let periods = network_quiet_periods(&[not_found], 10_000.0, 0);
        assert_eq!(
            periods,
            vec![
                TimeInterval::new(0.0, 1000.0),
                TimeInterval::new(9000.0, 10_000.0)
            ]
        );
    }

    #[test]
    fn test_network_quiet_allows_two_in_flight() {
        let requests = [get(0.0, 1000.0), get(0.0, 2000.0), get(500.0, 1500.0)];
        let periods = network_quiet_periods(&requests, 5000.0, 2);
        assert_eq!(
            periods,
            vec![
                TimeInterval::new(0.0, 500.0),
                TimeInterval::new(1000.0, 5000.0)
            ]
        );
    }

    #[test]
    fn test_cpu_quiet_periods_fill_gaps() {
        assert_eq!(
            cpu_quiet_periods(&[], 100.0),
            vec![TimeInterval::new(0.0, 100.0)]
        );
        assert_eq!(
            cpu_quiet_periods(
                &[TimeInterval::new(10.0, 20.0), TimeInterval::new(50.0, 60.0)],
                100.0
            ),
            vec![
                TimeInterval::new(0.0, 10.0),
                TimeInterval::new(20.0, 50.0),
                TimeInterval::new(60.0, 100.0)
            ]
        );
    }

    #[test]
    fn test_request_timing_from_record() {
        let record = NetworkRecord {
            request_id: "1".into(),
            url: "https://a.test/".into(),
            document_url: "https://a.test/".into(),
            frame_id: None,
            request_method: "GET".into(),
            resource_type: Some("Document".into()),
            status_code: Some(200),
            mime_type: Some("text/html".into()),
            failed: false,
            error_text: None,
            start_time_ms: 1500.0,
            end_time_ms: Some(2500.0),
            finished: true,
            redirect_source: None,
        };
        let timing = RequestTiming::from_record(&record, 1000.0);
        assert_eq!(timing.start, 500.0);
        assert_eq!(timing.end, Some(1500.0));
    }
}
