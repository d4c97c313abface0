//! Bounded generation history, persisted as a JSON array.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{LumenError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    pub params: HistoryParams,
}

/// Request-level parameters; per-image seeds are not recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryParams {
    pub model: String,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub guidance_scale: f64,
    pub seed: i64,
    pub num_images: usize,
    pub enhance_prompt: bool,
}

#[derive(Debug)]
pub struct HistoryLog {
    path: Option<PathBuf>,
    limit: usize,
    entries: Mutex<Vec<HistoryEntry>>,
}

impl HistoryLog {
    /// Opens (or starts) the history file at `path`, keeping at most `limit` entries.
    pub fn open(path: impl Into<PathBuf>, limit: usize) -> Result<Self> {
        let path = path.into();
        let mut entries: Vec<HistoryEntry> = match std::fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str(&json)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(LumenError::persist(&path, e)),
        };
        truncate_front(&mut entries, limit);
        Ok(Self {
            path: Some(path),
            limit,
            entries: Mutex::new(entries),
        })
    }

    pub fn in_memory(limit: usize) -> Self {
        Self {
            path: None,
            limit,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn append(&self, entry: HistoryEntry) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push(entry);
        truncate_front(&mut entries, self.limit);
        self.persist(&entries)
    }

    /// Oldest first.
    pub fn list(&self) -> Vec<HistoryEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn clear(&self) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.clear();
        self.persist(&entries)
    }

    fn persist(&self, entries: &[HistoryEntry]) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        write_json(path, entries)
    }
}

fn truncate_front<T>(entries: &mut Vec<T>, limit: usize) {
    if entries.len() > limit {
        let excess = entries.len() - limit;
        entries.drain(..excess);
    }
}

pub(crate) fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| LumenError::persist(parent, e))?;
    }
    std::fs::write(path, json).map_err(|e| LumenError::persist(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: usize) -> HistoryEntry {
        HistoryEntry {
            timestamp: Utc::now(),
            prompt: format!("prompt {n}"),
            negative_prompt: None,
            params: HistoryParams {
                model: "m".to_string(),
                width: 512,
                height: 512,
                steps: 4,
                guidance_scale: 0.0,
                seed: n as i64,
                num_images: 1,
                enhance_prompt: false,
            },
        }
    }

    #[test]
    fn retention_keeps_most_recent_hundred_oldest_first() {
        let log = HistoryLog::in_memory(100);
        for n in 0..150 {
            log.append(entry(n)).unwrap();
        }
        let entries = log.list();
        assert_eq!(entries.len(), 100);
        assert_eq!(entries.first().unwrap().prompt, "prompt 50");
        assert_eq!(entries.last().unwrap().prompt, "prompt 149");
    }

    #[test]
    fn entries_survive_reopen_and_clear_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        {
            let log = HistoryLog::open(&path, 10).unwrap();
            log.append(entry(1)).unwrap();
            log.append(entry(2)).unwrap();
        }
        let log = HistoryLog::open(&path, 10).unwrap();
        let prompts: Vec<String> = log.list().into_iter().map(|e| e.prompt).collect();
        assert_eq!(prompts, vec!["prompt 1", "prompt 2"]);

        log.clear().unwrap();
        assert!(HistoryLog::open(&path, 10).unwrap().list().is_empty());
    }

    #[test]
    fn reopening_with_smaller_limit_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let log = HistoryLog::open(&path, 10).unwrap();
        for n in 0..5 {
            log.append(entry(n)).unwrap();
        }
        let reopened = HistoryLog::open(&path, 2).unwrap();
        let seeds: Vec<i64> = reopened.list().iter().map(|e| e.params.seed).collect();
        assert_eq!(seeds, vec![3, 4]);
    }
}
