//! Durable VPC record storage
//!
//! The store is the single source of truth for what should exist in the
//! kernel. One JSON document per VPC, keyed by name. Puts are atomic per
//! key (write to a temp file, then rename) so a crash never leaves a
//! half-written record.

use crate::error::{Error, Result};
use crate::model::Vpc;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Keyed store of VPC records
pub trait VpcStore {
    /// Fetch a record by VPC name
    fn get(&self, name: &str) -> Result<Option<Vpc>>;

    /// Persist a record, overwriting any existing one for the same name
    fn put(&self, vpc: &Vpc) -> Result<()>;

    /// Remove a record; removing an absent record is not an error
    fn remove(&self, name: &str) -> Result<()>;

    /// All persisted records
    fn list(&self) -> Result<Vec<Vpc>>;
}

/// Directory-backed store: `<dir>/<name>.json` per VPC
#[derive(Debug)]
pub struct DirStore {
    dir: PathBuf,
}

impl DirStore {
    /// Open a store, creating the directory on first use
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    fn read_record(&self, path: &Path) -> Result<Vpc> {
        let content = fs::read_to_string(path).map_err(|e| Error::StoreRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_str(&content).map_err(|e| Error::StoreParse {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

impl VpcStore for DirStore {
    fn get(&self, name: &str) -> Result<Option<Vpc>> {
        let path = self.record_path(name);
        if !path.exists() {
            return Ok(None);
        }
        self.read_record(&path).map(Some)
    }

    fn put(&self, vpc: &Vpc) -> Result<()> {
        let path = self.record_path(&vpc.name);
        let tmp = self.dir.join(format!("{}.json.tmp", vpc.name));

        let content = serde_json::to_string_pretty(vpc).map_err(|e| Error::StoreParse {
            path: path.clone(),
            source: e,
        })?;

        fs::write(&tmp, content).map_err(|e| Error::StoreWrite {
            path: tmp.clone(),
            source: e,
        })?;
        fs::rename(&tmp, &path).map_err(|e| Error::StoreWrite { path, source: e })
    }

    fn remove(&self, name: &str) -> Result<()> {
        let path = self.record_path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::StoreWrite { path, source: e }),
        }
    }

    fn list(&self) -> Result<Vec<Vpc>> {
        let mut vpcs = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            // A corrupt record should not hide the healthy ones
            match self.read_record(&path) {
                Ok(vpc) => vpcs.push(vpc),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable record"),
            }
        }
        vpcs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(vpcs)
    }
}
