//! Recorded run summaries
//!
//! Every batch command leaves its [`RunSummary`] under
//! `<state_dir>/runs/<run_id>.json`. Run ids are ULIDs, so file names sort
//! by start time and retention can drop the oldest by name alone.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::RunSummary;

const RUNS_DIR: &str = "runs";
const TEMP_PREFIX: &str = ".tmp-";

/// Summaries read back from disk
#[derive(Debug, Default)]
pub struct HistoryLoad {
    /// Oldest first
    pub summaries: Vec<RunSummary>,
    /// Files that could not be read or parsed, with the reason
    pub skipped: Vec<String>,
}

/// Directory of recorded run summaries
#[derive(Debug, Clone)]
pub struct RunHistory {
    dir: PathBuf,
}

impl RunHistory {
    /// History under `state_dir`; nothing is created until the first record.
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join(RUNS_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `summary`, replacing any earlier record of the same run.
    pub fn record(&self, summary: &RunSummary) -> io::Result<PathBuf> {
        if summary.run_id.is_empty()
            || summary.run_id.starts_with('.')
            || summary.run_id.contains(['/', '\\'])
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unusable run id: {:?}", summary.run_id),
            ));
        }
        fs::create_dir_all(&self.dir)?;

        let json = summary
            .to_json()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let path = self.dir.join(format!("{}.json", summary.run_id));
        let temp = self.dir.join(format!("{}{}.json", TEMP_PREFIX, summary.run_id));
        fs::write(&temp, json)?;
        if let Err(e) = fs::rename(&temp, &path) {
            let _ = fs::remove_file(&temp);
            return Err(e);
        }
        debug!(path = %path.display(), "recorded run summary");
        Ok(path)
    }

    /// Read every recorded summary. A missing directory is an empty history.
    pub fn load(&self) -> io::Result<HistoryLoad> {
        let mut load = HistoryLoad::default();
        for path in self.entries()? {
            match fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|text| RunSummary::from_json(&text).map_err(|e| e.to_string()))
            {
                Ok(summary) => load.summaries.push(summary),
                Err(reason) => {
                    warn!(path = %path.display(), %reason, "skipping unreadable run summary");
                    load.skipped.push(format!("{}: {}", path.display(), reason));
                }
            }
        }
        load.summaries
            .sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.run_id.cmp(&b.run_id)));
        Ok(load)
    }

    /// Keep the newest `keep` records and delete the rest. Zero keeps all.
    pub fn retain_last(&self, keep: usize) -> io::Result<usize> {
        if keep == 0 {
            return Ok(0);
        }
        let entries = self.entries()?;
        let excess = entries.len().saturating_sub(keep);
        let mut removed = 0;
        for path in entries.into_iter().take(excess) {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to drop old run summary"),
            }
        }
        if removed > 0 {
            debug!(removed, keep, "trimmed run history");
        }
        Ok(removed)
    }

    /// Record files sorted by name, oldest first
    fn entries(&self) -> io::Result<Vec<PathBuf>> {
        let read = match fs::read_dir(&self.dir) {
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut paths = Vec::new();
        for entry in read {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            if entry.file_type()?.is_file() {
                paths.push(entry.path());
            }
        }
        paths.sort();
        Ok(paths)
    }
}
