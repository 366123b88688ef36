//! In-memory history store.

use std::{collections::HashMap, sync::Mutex, time::Duration};

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
};

use crate::{
    Error, Result,
    history::{HistoryStore, retained_ids},
    invocation::InvocationRecord,
};

/// One job's records in insertion order, plus an id index.
///
/// The only way to change the records is through methods that keep the
/// index in step.
#[derive(Debug, Default, Clone)]
pub struct JobHistory {
    records: Vec<InvocationRecord>,
    index: HashMap<String, usize>,
}

impl JobHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. A record with an id already present replaces it.
    pub fn add(&mut self, record: InvocationRecord) {
        if let Some(&pos) = self.index.get(&record.id) {
            self.records[pos] = record;
            return;
        }
        self.index.insert(record.id.clone(), self.records.len());
        self.records.push(record);
    }

    #[must_use]
    pub fn records(&self) -> &[InvocationRecord] {
        &self.records
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&InvocationRecord> {
        self.index.get(id).map(|&pos| &self.records[pos])
    }

    /// The most recently added record.
    #[must_use]
    pub fn latest(&self) -> Option<&InvocationRecord> {
        self.records.last()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Apply retention at `now`; returns how many records were removed.
    pub fn cull(&mut self, max_count: usize, max_age: Duration, now: DateTime<Utc>) -> usize {
        let keep = retained_ids(&self.records, max_count, max_age, now);
        let before = self.records.len();
        self.records.retain(|r| keep.contains(&r.id));
        let removed = before - self.records.len();
        if removed > 0 {
            self.reindex();
        }
        removed
    }

    fn reindex(&mut self) {
        self.index = self
            .records
            .iter()
            .enumerate()
            .map(|(pos, r)| (r.id.clone(), pos))
            .collect();
    }
}

impl FromIterator<InvocationRecord> for JobHistory {
    fn from_iter<I: IntoIterator<Item = InvocationRecord>>(iter: I) -> Self {
        let mut history = Self::new();
        for record in iter {
            history.add(record);
        }
        history
    }
}

/// History held in process memory, keyed by job name.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    jobs: Mutex<HashMap<String, JobHistory>>,
}

impl MemoryHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: InvocationRecord) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.entry(record.job_name.clone()).or_default().add(record);
    }

    /// Replace a job's history wholesale (used when restoring).
    pub fn replace(&self, job_name: &str, records: Vec<InvocationRecord>) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.insert(job_name.to_string(), records.into_iter().collect());
    }

    #[must_use]
    pub fn records(&self, job_name: &str) -> Vec<InvocationRecord> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.get(job_name)
            .map(|h| h.records().to_vec())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn record(&self, job_name: &str, id: &str) -> Option<InvocationRecord> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.get(job_name).and_then(|h| h.get(id)).cloned()
    }

    #[must_use]
    pub fn latest(&self, job_name: &str) -> Option<InvocationRecord> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.get(job_name).and_then(|h| h.latest()).cloned()
    }

    #[must_use]
    pub fn len(&self, job_name: &str) -> usize {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.get(job_name).map_or(0, JobHistory::len)
    }

    pub fn cull_at(
        &self,
        job_name: &str,
        max_count: usize,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> usize {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.get_mut(job_name)
            .map_or(0, |h| h.cull(max_count, max_age, now))
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn add(&self, record: &InvocationRecord) -> Result<()> {
        self.push(record.clone());
        Ok(())
    }

    async fn get(&self, job_name: &str) -> Result<Vec<InvocationRecord>> {
        Ok(self.records(job_name))
    }

    async fn get_by_id(&self, job_name: &str, id: &str) -> Result<InvocationRecord> {
        self.record(job_name, id)
            .ok_or_else(|| Error::invocation_not_found(job_name, id))
    }

    async fn cull(&self, job_name: &str, max_count: usize, max_age: Duration) -> Result<usize> {
        Ok(self.cull_at(job_name, max_count, max_age, Utc::now()))
    }
}
