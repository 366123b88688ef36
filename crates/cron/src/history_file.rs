//! JSON file-backed history store with atomic writes.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    tokio::{fs, sync::Mutex},
    tracing::debug,
};

use crate::{
    Error, Result,
    history::{HistoryStore, retained_ids},
    invocation::InvocationRecord,
};

/// One `<dir>/<slug>.json` file per job slug, holding records oldest first.
/// Jobs whose names share a slug share the file.
pub struct FileHistory {
    dir: PathBuf,
    // Serializes read-modify-write cycles across jobs.
    write_lock: Mutex<()>,
}

impl FileHistory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, job_name: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", jobkit_common::slugify(job_name)))
    }

    /// Every record in the job's file. Slugs can collide, so the file may
    /// hold other jobs' records too.
    async fn load_file(&self, job_name: &str) -> Result<Vec<InvocationRecord>> {
        let path = self.path(job_name);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&data)?)
    }

    async fn load(&self, job_name: &str) -> Result<Vec<InvocationRecord>> {
        let mut records = self.load_file(job_name).await?;
        records.retain(|r| r.job_name == job_name);
        Ok(records)
    }

    /// Apply retention as of `now`.
    pub async fn cull_at(
        &self,
        job_name: &str,
        max_count: usize,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let (mine, mut records): (Vec<_>, Vec<_>) = self
            .load_file(job_name)
            .await?
            .into_iter()
            .partition(|r| r.job_name == job_name);
        let keep = retained_ids(&mine, max_count, max_age, now);
        let removed = mine.iter().filter(|r| !keep.contains(&r.id)).count();
        if removed > 0 {
            records.extend(mine.into_iter().filter(|r| keep.contains(&r.id)));
            self.save(job_name, &records).await?;
        }
        Ok(removed)
    }

    /// Write to a temp file, then rename over the target.
    async fn save(&self, job_name: &str, records: &[InvocationRecord]) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path(job_name);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(records)?;
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;
        debug!(job = job_name, path = %path.display(), count = records.len(), "saved history");
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for FileHistory {
    async fn add(&self, record: &InvocationRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.load_file(&record.job_name).await?;
        records.retain(|r| !(r.job_name == record.job_name && r.id == record.id));
        records.push(record.clone());
        self.save(&record.job_name, &records).await
    }

    async fn get(&self, job_name: &str) -> Result<Vec<InvocationRecord>> {
        self.load(job_name).await
    }

    async fn get_by_id(&self, job_name: &str, id: &str) -> Result<InvocationRecord> {
        self.load(job_name)
            .await?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::invocation_not_found(job_name, id))
    }

    async fn cull(&self, job_name: &str, max_count: usize, max_age: Duration) -> Result<usize> {
        self.cull_at(job_name, max_count, max_age, Utc::now()).await
    }
}
