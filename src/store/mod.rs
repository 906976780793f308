//! Learning data store
//!
//! Append-only JSONL persistence for dual-architecture learning samples.
//! One active file per calendar month; on rollover the previous month is
//! gzip-archived and the plain file removed. Samples are never mutated in
//! place, only archived or deleted by retention.
//!
//! ```text
//! data/learning/
//! ├── risk_control_learning_2026-08.jsonl      (active month)
//! ├── risk_control_learning_2026-07.jsonl.gz
//! └── risk_control_learning_2026-06.jsonl.gz
//! ```

use chrono::{DateTime, Duration, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::models::LearningDataPoint;

const FILE_PREFIX: &str = "risk_control_learning_";
const PLAIN_SUFFIX: &str = ".jsonl";
const GZ_SUFFIX: &str = ".jsonl.gz";

/// Default sample retention
pub const DEFAULT_RETENTION_DAYS: i64 = 365;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("retention_days must be > 0, got {0}")]
    InvalidRetention(i64),
    #[error("cannot create data directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

struct WriterState {
    /// Month (YYYY-MM) of the file currently being appended to
    current_month: Option<String>,
}

/// Directory-owned JSONL store with monthly rotation
pub struct LearningDataStore {
    data_dir: PathBuf,
    retention_days: i64,
    writer: Mutex<WriterState>,
    total_saved: AtomicU64,
    total_loaded: AtomicU64,
    total_archived: AtomicU64,
    total_deleted: AtomicU64,
    corrupt_lines: AtomicU64,
}

impl LearningDataStore {
    pub fn new(data_dir: impl Into<PathBuf>, retention_days: i64) -> Result<Self, StoreError> {
        if retention_days <= 0 {
            return Err(StoreError::InvalidRetention(retention_days));
        }
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir).map_err(|source| StoreError::CreateDir {
            path: data_dir.clone(),
            source,
        })?;

        info!(dir = %data_dir.display(), retention_days, "learning data store ready");
        Ok(Self {
            data_dir,
            retention_days,
            writer: Mutex::new(WriterState {
                current_month: None,
            }),
            total_saved: AtomicU64::new(0),
            total_loaded: AtomicU64::new(0),
            total_archived: AtomicU64::new(0),
            total_deleted: AtomicU64::new(0),
            corrupt_lines: AtomicU64::new(0),
        })
    }

    /// Append one sample to the current month's file
    ///
    /// Rolls the previous month into a gzip archive when the month changed
    /// since the last save. Returns whether the append fully succeeded; I/O
    /// errors are logged and swallowed.
    pub fn save_data_point(&self, point: &LearningDataPoint) -> bool {
        self.save_data_point_at(point, Utc::now())
    }

    /// [`save_data_point`](Self::save_data_point) with an explicit clock
    pub fn save_data_point_at(&self, point: &LearningDataPoint, now: DateTime<Utc>) -> bool {
        let month = now.format("%Y-%m").to_string();
        let path = self.month_path(&month);

        // Single writer: the append and any rotation happen under one lock.
        let mut writer = self.writer.lock();
        if let Some(previous) = writer.current_month.as_ref() {
            if *previous != month {
                let previous_path = self.month_path(previous);
                self.archive_file(&previous_path);
            }
        }
        writer.current_month = Some(month);

        let line = match serde_json::to_string(point) {
            Ok(line) => line,
            Err(err) => {
                error!(error = %err, "learning sample not serializable");
                return false;
            }
        };

        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| {
                file.write_all(line.as_bytes())?;
                file.write_all(b"\n")
            });

        match result {
            Ok(()) => {
                self.total_saved.fetch_add(1, Ordering::Relaxed);
                debug!(file = %path.display(), "learning sample appended");
                true
            }
            Err(err) => {
                error!(file = %path.display(), error = %err, "learning sample append failed");
                false
            }
        }
    }

    /// Load samples from every file in the inclusive YYYY-MM range
    ///
    /// Plain files are read directly, archives through a gzip reader.
    /// Corrupt lines are skipped. `max_samples` stops the scan early.
    pub fn load_historical_data(
        &self,
        start_month: Option<&str>,
        end_month: Option<&str>,
        max_samples: Option<usize>,
    ) -> Vec<LearningDataPoint> {
        let start = start_month.map(truncate_month);
        let end = end_month.map(truncate_month);

        let mut files = self.data_files();
        files.retain(|(_, month)| {
            start.as_deref().map(|s| month.as_str() >= s).unwrap_or(true)
                && end.as_deref().map(|e| month.as_str() <= e).unwrap_or(true)
        });
        files.sort_by(|a, b| a.0.cmp(&b.0));

        let mut samples = Vec::new();
        'files: for (path, _) in &files {
            let lines: Box<dyn Iterator<Item = std::io::Result<String>>> =
                match File::open(path) {
                    Ok(file) if is_gz(path) => {
                        Box::new(BufReader::new(GzDecoder::new(file)).lines())
                    }
                    Ok(file) => Box::new(BufReader::new(file).lines()),
                    Err(err) => {
                        warn!(file = %path.display(), error = %err, "data file unreadable, skipped");
                        continue;
                    }
                };

            for line in lines {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(file = %path.display(), error = %err, "read error, rest of file skipped");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<LearningDataPoint>(&line) {
                    Ok(point) => samples.push(point),
                    Err(err) => {
                        self.corrupt_lines.fetch_add(1, Ordering::Relaxed);
                        warn!(file = %path.display(), error = %err, "corrupt learning record skipped");
                    }
                }
                if max_samples.map(|cap| samples.len() >= cap).unwrap_or(false) {
                    break 'files;
                }
            }
        }

        self.total_loaded
            .fetch_add(samples.len() as u64, Ordering::Relaxed);
        info!(
            samples = samples.len(),
            files = files.len(),
            "historical learning data loaded"
        );
        samples
    }

    /// Compress `path` to `<path>.gz` and remove the original
    ///
    /// A missing input returns false without error.
    pub fn archive_file(&self, path: &Path) -> bool {
        if !path.exists() {
            return false;
        }

        let archived_path = PathBuf::from(format!("{}.gz", path.display()));
        let result = (|| -> std::io::Result<()> {
            let mut input = BufReader::new(File::open(path)?);
            let output = File::create(&archived_path)?;
            let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::default());
            std::io::copy(&mut input, &mut encoder)?;
            encoder.finish()?.flush()?;
            std::fs::remove_file(path)
        })();

        match result {
            Ok(()) => {
                self.total_archived.fetch_add(1, Ordering::Relaxed);
                info!(
                    from = %path.display(),
                    to = %archived_path.display(),
                    "learning file archived"
                );
                true
            }
            Err(err) => {
                error!(file = %path.display(), error = %err, "archive failed");
                false
            }
        }
    }

    /// Delete files whose month is older than the retention window
    pub fn cleanup_old_data(&self) -> usize {
        self.cleanup_old_data_at(Utc::now())
    }

    /// [`cleanup_old_data`](Self::cleanup_old_data) with an explicit clock
    pub fn cleanup_old_data_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = (now - Duration::days(self.retention_days))
            .format("%Y-%m")
            .to_string();

        let mut deleted = 0;
        for (path, month) in self.data_files() {
            if month < cutoff {
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        deleted += 1;
                        self.total_deleted.fetch_add(1, Ordering::Relaxed);
                        info!(file = %path.display(), %month, "expired learning file deleted");
                    }
                    Err(err) => {
                        warn!(file = %path.display(), error = %err, "expired file not deleted");
                    }
                }
            }
        }

        info!(deleted, %cutoff, "retention cleanup finished");
        deleted
    }

    pub fn get_statistics(&self) -> StoreStats {
        let files = self.data_files();
        let mut total_size_bytes = 0u64;
        let mut compressed_count = 0usize;
        for (path, _) in &files {
            if let Ok(meta) = std::fs::metadata(path) {
                total_size_bytes += meta.len();
            }
            if is_gz(path) {
                compressed_count += 1;
            }
        }

        StoreStats {
            total_saved: self.total_saved.load(Ordering::Relaxed),
            total_loaded: self.total_loaded.load(Ordering::Relaxed),
            total_archived: self.total_archived.load(Ordering::Relaxed),
            total_deleted: self.total_deleted.load(Ordering::Relaxed),
            corrupt_lines: self.corrupt_lines.load(Ordering::Relaxed),
            file_count: files.len(),
            compressed_count,
            total_size_bytes,
            data_dir: self.data_dir.display().to_string(),
            retention_days: self.retention_days,
        }
    }

    fn month_path(&self, month: &str) -> PathBuf {
        self.data_dir
            .join(format!("{FILE_PREFIX}{month}{PLAIN_SUFFIX}"))
    }

    /// All data files with their YYYY-MM month keys
    fn data_files(&self) -> Vec<(PathBuf, String)> {
        let Ok(entries) = std::fs::read_dir(&self.data_dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                let name = path.file_name()?.to_str()?;
                let month = extract_month(name)?;
                Some((path.clone(), month))
            })
            .collect()
    }
}

fn is_gz(path: &Path) -> bool {
    path.extension().map(|ext| ext == "gz").unwrap_or(false)
}

fn truncate_month(date: &str) -> String {
    date.chars().take(7).collect()
}

/// `risk_control_learning_YYYY-MM.jsonl[.gz]` -> `YYYY-MM`
fn extract_month(filename: &str) -> Option<String> {
    let rest = filename.strip_prefix(FILE_PREFIX)?;
    let month = rest
        .strip_suffix(GZ_SUFFIX)
        .or_else(|| rest.strip_suffix(PLAIN_SUFFIX))?;
    let bytes = month.as_bytes();
    let valid = month.len() == 7
        && bytes[4] == b'-'
        && month
            .chars()
            .enumerate()
            .all(|(i, c)| i == 4 || c.is_ascii_digit());
    valid.then(|| month.to_string())
}

/// Point-in-time store statistics
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total_saved: u64,
    pub total_loaded: u64,
    pub total_archived: u64,
    pub total_deleted: u64,
    pub corrupt_lines: u64,
    pub file_count: usize,
    pub compressed_count: usize,
    pub total_size_bytes: u64,
    pub data_dir: String,
    pub retention_days: i64,
}
