//! Aggregate statistics over a job's retained history.

use std::time::Duration;

use serde::Serialize;

use crate::{invocation::InvocationRecord, status::InvocationStatus};

/// Run counts and elapsed-time distribution for one job.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobStats {
    pub name: String,
    pub runs_total: usize,
    pub runs_successful: usize,
    pub runs_errored: usize,
    pub runs_cancelled: usize,
    /// Successful runs over total runs, `0.0` with no history.
    pub success_rate: f64,
    pub output_bytes: usize,
    pub elapsed_min_ms: u64,
    pub elapsed_max_ms: u64,
    pub elapsed_p50_ms: u64,
    pub elapsed_p95_ms: u64,
}

impl JobStats {
    #[must_use]
    pub fn from_records(name: impl Into<String>, records: &[InvocationRecord]) -> Self {
        let mut stats = Self {
            name: name.into(),
            runs_total: records.len(),
            ..Default::default()
        };

        let mut elapsed = Vec::with_capacity(records.len());
        for record in records {
            match record.status {
                InvocationStatus::Success => stats.runs_successful += 1,
                InvocationStatus::Errored => stats.runs_errored += 1,
                InvocationStatus::Cancelled => stats.runs_cancelled += 1,
                InvocationStatus::Idle | InvocationStatus::Running => {},
            }
            stats.output_bytes += record.output.bytes_len();
            if record.complete.is_some() {
                elapsed.push(record.elapsed());
            }
        }

        if stats.runs_total > 0 {
            stats.success_rate = stats.runs_successful as f64 / stats.runs_total as f64;
        }

        elapsed.sort_unstable();
        stats.elapsed_min_ms = millis(elapsed.first().copied());
        stats.elapsed_max_ms = millis(elapsed.last().copied());
        stats.elapsed_p50_ms = millis(percentile(&elapsed, 50));
        stats.elapsed_p95_ms = millis(percentile(&elapsed, 95));
        stats
    }
}

/// Nearest-rank percentile of an ascending slice.
fn percentile(sorted: &[Duration], pct: usize) -> Option<Duration> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (pct * sorted.len()).div_ceil(100).max(1);
    sorted.get(rank - 1).copied()
}

fn millis(d: Option<Duration>) -> u64 {
    d.map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{output::OutputBuffer, parameters::Parameters},
        chrono::{TimeDelta, Utc},
        rstest::rstest,
    };

    fn run(status: InvocationStatus, elapsed_ms: i64) -> InvocationRecord {
        let started = Utc::now() - TimeDelta::seconds(60);
        let output = OutputBuffer::new();
        output.write(b"12345");
        InvocationRecord {
            id: uuid::Uuid::new_v4().to_string(),
            job_name: "job".into(),
            started,
            complete: Some(started + TimeDelta::milliseconds(elapsed_ms)),
            status,
            error: None,
            parameters: Parameters::new(),
            output,
        }
    }

    #[rstest]
    #[case(50, Some(50))]
    #[case(95, Some(95))]
    #[case(100, Some(100))]
    #[case(1, Some(1))]
    fn percentile_nearest_rank(#[case] pct: usize, #[case] expected_ms: Option<u64>) {
        let sorted: Vec<_> = (1..=100).map(Duration::from_millis).collect();
        assert_eq!(
            percentile(&sorted, pct),
            expected_ms.map(Duration::from_millis)
        );
    }

    #[test]
    fn counts_and_rates() {
        let records = vec![
            run(InvocationStatus::Success, 100),
            run(InvocationStatus::Success, 300),
            run(InvocationStatus::Errored, 200),
            run(InvocationStatus::Cancelled, 400),
        ];
        let stats = JobStats::from_records("job", &records);
        assert_eq!(stats.runs_total, 4);
        assert_eq!(stats.runs_successful, 2);
        assert_eq!(stats.runs_errored, 1);
        assert_eq!(stats.runs_cancelled, 1);
        assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.output_bytes, 20);
        assert_eq!(stats.elapsed_min_ms, 100);
        assert_eq!(stats.elapsed_max_ms, 400);
        assert_eq!(stats.elapsed_p50_ms, 200);
        assert_eq!(stats.elapsed_p95_ms, 400);
    }

    #[test]
    fn empty_history() {
        let stats = JobStats::from_records("job", &[]);
        assert_eq!(stats.runs_total, 0);
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.elapsed_p95_ms, 0);
    }
}
