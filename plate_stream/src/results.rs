use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::warn;

use crate::plate_detection::PlateResult;

/// Placeholder reported by `/results` while no plate is published.
pub const NO_DETECTION: &str = "No plate detected yet";

/// Plain-text record of the latest plate: empty, or one JSON string and a newline.
#[derive(Debug, Clone)]
pub struct ResultRecord {
    path: PathBuf,
}

impl ResultRecord {
    /// Creates the parent directory and truncates the record.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let record = Self { path };
        record.write(None)?;
        Ok(record)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrites the record with `plate`, or empties it.
    pub fn write(&self, plate: Option<&PlateResult>) -> io::Result<()> {
        let contents = match plate {
            Some(plate) => format!("{}\n", serde_json::to_string(plate)?),
            None => String::new(),
        };
        fs::write(&self.path, contents)
    }

    pub fn read(&self) -> io::Result<Option<PlateResult>> {
        let contents = fs::read_to_string(&self.path)?;
        let line = match contents.lines().last() {
            Some(line) if !line.trim().is_empty() => line,
            _ => return Ok(None),
        };
        let text: String = serde_json::from_str(line)?;
        Ok(PlateResult::parse(&text))
    }
}

/// Single-slot store for the most recent validated plate.
#[derive(Debug, Default)]
pub struct ResultStore {
    latest: Option<PlateResult>,
    record: Option<ResultRecord>,
}

impl ResultStore {
    pub fn new(record: Option<ResultRecord>) -> Self {
        Self {
            latest: None,
            record,
        }
    }

    pub fn latest(&self) -> Option<&PlateResult> {
        self.latest.as_ref()
    }

    /// Replaces the slot; the record file is rewritten only when the value changes.
    pub fn publish(&mut self, plate: Option<PlateResult>) {
        if self.latest == plate {
            return;
        }
        self.latest = plate;
        self.persist();
    }

    pub fn clear(&mut self) {
        self.latest = None;
        self.persist();
    }

    /// The `/results` payload: always exactly one element.
    pub fn snapshot(&self) -> Vec<String> {
        vec![match &self.latest {
            Some(plate) => plate.to_string(),
            None => NO_DETECTION.to_string(),
        }]
    }

    fn persist(&self) {
        if let Some(record) = &self.record {
            if let Err(e) = record.write(self.latest.as_ref()) {
                warn!("Cannot write {}: {}", record.path().display(), e);
            }
        }
    }
}
