use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::job::{Job, JobStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Queue file I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Queue file {path} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize queue: {0}")]
    Encode(#[from] serde_json::Error),
}

/// JSON file holding the full job list
#[derive(Debug, Clone)]
pub struct QueueStore {
    path: PathBuf,
}

impl QueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the queue for a fresh process
    ///
    /// A missing file is an empty queue. Completed jobs and jobs whose
    /// source file is gone are dropped; jobs left `processing` by a crash go
    /// back to `pending` with their retry count.
    pub fn load(&self) -> Result<Vec<Job>, StoreError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let jobs: Vec<Job> = serde_json::from_str(&text).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        Ok(recover_jobs(jobs))
    }

    /// Rewrite the whole queue (temp file + rename)
    pub fn save(&self, jobs: &[Job]) -> Result<(), StoreError> {
        let io_error = |source: std::io::Error| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error)?;
        }

        let json = serde_json::to_vec_pretty(jobs)?;
        let mut tmp_name = self.path.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let mut file = fs::File::create(&tmp_path).map_err(io_error)?;
        file.write_all(&json).map_err(io_error)?;
        file.sync_all().map_err(io_error)?;
        drop(file);

        fs::rename(&tmp_path, &self.path).map_err(io_error)
    }
}

fn recover_jobs(jobs: Vec<Job>) -> Vec<Job> {
    let total = jobs.len();
    let mut demoted = 0;

    let kept: Vec<Job> = jobs
        .into_iter()
        .filter(|job| job.status != JobStatus::Completed)
        .filter(|job| {
            let exists = job.source_path.exists();
            if !exists {
                tracing::info!(job_id = %job.id, source = %job.source_path.display(), "Dropping job with missing source");
            }
            exists
        })
        .map(|mut job| {
            if job.status == JobStatus::Processing {
                job.status = JobStatus::Pending;
                demoted += 1;
            }
            job
        })
        .collect();

    tracing::info!(
        loaded = kept.len(),
        dropped = total - kept.len(),
        recovered = demoted,
        "Loaded job queue"
    );
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with_status(dir: &Path, name: &str, status: JobStatus, retries: u32) -> Job {
        let source = dir.join(format!("{}.jpg", name));
        fs::write(&source, b"jpeg").unwrap();
        let mut job = Job::new(source, dir.join("out"), "20250101-001", name);
        job.status = status;
        job.retries = retries;
        job
    }

    #[test]
    fn test_missing_file_is_empty_queue() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::new(dir.path().join("queue.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_round_trip_preserves_order_and_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::new(dir.path().join("state").join("queue.json"));
        let jobs = vec![
            job_with_status(dir.path(), "b", JobStatus::Pending, 0),
            job_with_status(dir.path(), "a", JobStatus::Failed, 3),
        ];
        store.save(&jobs).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, jobs);
    }

    #[test]
    fn test_reload_rules() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::new(dir.path().join("queue.json"));

        let crashed = job_with_status(dir.path(), "crashed", JobStatus::Processing, 2);
        let done = job_with_status(dir.path(), "done", JobStatus::Completed, 0);
        let gone = job_with_status(dir.path(), "gone", JobStatus::Pending, 0);
        fs::remove_file(&gone.source_path).unwrap();
        store.save(&[crashed.clone(), done, gone]).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, crashed.id);
        assert_eq!(loaded[0].status, JobStatus::Pending);
        assert_eq!(loaded[0].retries, 2);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(QueueStore::new(path).load(), Err(StoreError::Corrupt { .. })));
    }
}
