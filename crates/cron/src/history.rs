//! Invocation history persistence and retention.

use std::{collections::HashSet, time::Duration};

use {
    async_trait::async_trait,
    chrono::{DateTime, TimeDelta, Utc},
};

use crate::{Result, invocation::InvocationRecord};

/// Default number of records kept per job.
pub const DEFAULT_MAX_COUNT: usize = 256;

/// Retention settings for one job's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryPolicy {
    /// Keep no history at all.
    pub disabled: bool,
    /// Keep history in memory only, never in the durable store.
    pub persistence_disabled: bool,
    /// Most-recent records kept; `0` keeps any number.
    pub max_count: usize,
    /// Oldest record age kept; zero keeps any age.
    pub max_age: Duration,
}

impl Default for HistoryPolicy {
    fn default() -> Self {
        Self {
            disabled: false,
            persistence_disabled: false,
            max_count: DEFAULT_MAX_COUNT,
            max_age: Duration::ZERO,
        }
    }
}

/// Storage for terminal invocation records, grouped by job name.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append a record for `record.job_name`.
    async fn add(&self, record: &InvocationRecord) -> Result<()>;

    /// Every retained record for a job, oldest first.
    async fn get(&self, job_name: &str) -> Result<Vec<InvocationRecord>>;

    /// One record, or [`crate::Error::InvocationNotFound`].
    async fn get_by_id(&self, job_name: &str, id: &str) -> Result<InvocationRecord>;

    /// Apply retention and return how many records were removed.
    ///
    /// A record survives only if it passes every active filter: with
    /// `max_count > 0`, it must be among the `max_count` most recently
    /// started; with a non-zero `max_age`, it must have started no more than
    /// `max_age` ago.
    async fn cull(&self, job_name: &str, max_count: usize, max_age: Duration) -> Result<usize>;

    /// Load a job's records at startup.
    async fn restore(&self, job_name: &str) -> Result<Vec<InvocationRecord>> {
        self.get(job_name).await
    }
}

/// Ids of the records that survive retention at `now`.
pub(crate) fn retained_ids(
    records: &[InvocationRecord],
    max_count: usize,
    max_age: Duration,
    now: DateTime<Utc>,
) -> HashSet<String> {
    let mut order: Vec<usize> = (0..records.len()).collect();
    // Newest first; among equal start times the later insertion ranks first.
    order.sort_by(|&a, &b| records[b].started.cmp(&records[a].started).then(b.cmp(&a)));
    if max_count > 0 {
        order.truncate(max_count);
    }

    let cutoff = age_cutoff(max_age, now);
    order
        .into_iter()
        .map(|i| &records[i])
        .filter(|r| cutoff.is_none_or(|cutoff| r.started >= cutoff))
        .map(|r| r.id.clone())
        .collect()
}

/// Oldest start time that still passes the age filter.
pub(crate) fn age_cutoff(max_age: Duration, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if max_age.is_zero() {
        return None;
    }
    let age = TimeDelta::from_std(max_age).unwrap_or(TimeDelta::MAX);
    Some(now.checked_sub_signed(age).unwrap_or(DateTime::<Utc>::MIN_UTC))
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by the store tests.

    use {
        super::*,
        crate::{output::OutputBuffer, parameters::Parameters, status::InvocationStatus},
    };

    pub(crate) fn record(job: &str, id: &str, age: Duration, now: DateTime<Utc>) -> InvocationRecord {
        let started = now - TimeDelta::from_std(age).unwrap_or_default();
        InvocationRecord {
            id: id.to_string(),
            job_name: job.to_string(),
            started,
            complete: Some(started + TimeDelta::milliseconds(5)),
            status: InvocationStatus::Success,
            error: None,
            parameters: Parameters::new(),
            output: OutputBuffer::new(),
        }
    }

    /// Six records aged 1000/1000/250/250/100/100 ms, oldest first.
    pub(crate) fn six_records(job: &str, now: DateTime<Utc>) -> Vec<InvocationRecord> {
        [1000, 1000, 250, 250, 100, 100]
            .into_iter()
            .enumerate()
            .map(|(i, ms)| record(job, &format!("r{i}"), Duration::from_millis(ms), now))
            .collect()
    }

    pub(crate) fn ids(records: &[InvocationRecord]) -> Vec<String> {
        let mut ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use {
        super::{testing::six_records, *},
        rstest::rstest,
    };

    #[rstest]
    #[case(2, 125, &["r4", "r5"])]
    #[case(0, 125, &["r4", "r5"])]
    #[case(3, 0, &["r3", "r4", "r5"])]
    #[case(0, 300, &["r2", "r3", "r4", "r5"])]
    #[case(1, 300, &["r5"])]
    #[case(0, 0, &["r0", "r1", "r2", "r3", "r4", "r5"])]
    fn retention_is_the_and_of_both_filters(
        #[case] max_count: usize,
        #[case] max_age_ms: u64,
        #[case] expected: &[&str],
    ) {
        let now = Utc::now();
        let records = six_records("job", now);
        let mut kept: Vec<String> =
            retained_ids(&records, max_count, Duration::from_millis(max_age_ms), now)
                .into_iter()
                .collect();
        kept.sort();
        assert_eq!(kept, expected);
    }
}
