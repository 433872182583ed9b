use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecord {
    pub uuid: uuid::Uuid,
    pub portdir: String,
    pub version: String,
    pub status: BuildStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

pub struct BuildDatabase {
    db: sled::Db,
    builds: sled::Tree,
    packages: sled::Tree,
    crc_index: sled::Tree,
}

impl BuildDatabase {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)?;
        set_restrictive_permissions(path);
        let builds = db.open_tree("builds")?;
        let packages = db.open_tree("packages")?;
        let crc_index = db.open_tree("crc_index")?;
        Ok(BuildDatabase {
            db,
            builds,
            packages,
            crc_index,
        })
    }

    pub fn open_temporary() -> Result<(Self, tempfile::TempDir)> {
        let dir = tempfile::tempdir().map_err(|e| OrchestratorError::DatabaseError(sled::Error::Io(e)))?;
        let db = Self::open(dir.path())?;
        Ok((db, dir))
    }

    pub fn start_build(&self, port_id: &str, version: &str) -> Result<uuid::Uuid> {
        let id = uuid::Uuid::new_v4();
        let record = BuildRecord {
            uuid: id,
            portdir: port_id.to_string(),
            version: version.to_string(),
            status: BuildStatus::Running,
            start_time: Utc::now(),
            end_time: None,
        };
        let bytes = serde_json::to_vec(&record)?;
        self.builds.insert(id.as_bytes(), bytes)?;
        Ok(id)
    }

    pub fn load_build(&self, id: uuid::Uuid) -> Result<Option<BuildRecord>> {
        match self.builds.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn complete_success(
        &self,
        id: uuid::Uuid,
        port_id: &str,
        version: &str,
        crc: u32,
    ) -> Result<()> {
        let mut record = self
            .load_build(id)?
            .ok_or_else(|| OrchestratorError::RecordError(format!("no build record for {id}")))?;
        record.status = BuildStatus::Success;
        record.end_time = Some(Utc::now());
        let record_bytes = serde_json::to_vec(&record)?;

        let package_key = format!("{port_id}@{version}");
        let crc_bytes = crc.to_le_bytes();
        let uuid_bytes = id.as_bytes().to_vec();

        let trees: [&sled::Tree; 3] = [&self.builds, &self.crc_index, &self.packages];
        trees
            .transaction(|trees| {
                trees[0].insert(id.as_bytes(), record_bytes.clone())?;
                trees[1].insert(port_id.as_bytes(), &crc_bytes)?;
                trees[2].insert(package_key.as_bytes(), uuid_bytes.clone())?;
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(transaction_err)?;

        Ok(())
    }

    pub fn complete_failure(&self, id: uuid::Uuid) -> Result<()> {
        let mut record = self
            .load_build(id)?
            .ok_or_else(|| OrchestratorError::RecordError(format!("no build record for {id}")))?;
        record.status = BuildStatus::Failed;
        record.end_time = Some(Utc::now());
        let bytes = serde_json::to_vec(&record)?;
        self.builds.insert(id.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn get_crc(&self, port_id: &str) -> Result<Option<u32>> {
        match self.crc_index.get(port_id.as_bytes())? {
            Some(bytes) if bytes.len() == 4 => {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(&bytes);
                Ok(Some(u32::from_le_bytes(buf)))
            }
            Some(_) => Err(OrchestratorError::CRCError(format!(
                "malformed crc_index entry for {port_id}"
            ))),
            None => Ok(None),
        }
    }

    pub fn update_crc(&self, port_id: &str, crc: u32) -> Result<()> {
        self.crc_index.insert(port_id.as_bytes(), &crc.to_le_bytes())?;
        Ok(())
    }

    pub fn needs_build(&self, port_id: &str, current_crc: u32) -> Result<bool> {
        match self.get_crc(port_id)? {
            None => Ok(true),
            Some(stored) => Ok(stored != current_crc),
        }
    }

    pub fn latest_successful_build(&self, port_id: &str, version: &str) -> Result<Option<uuid::Uuid>> {
        let key = format!("{port_id}@{version}");
        match self.packages.get(key.as_bytes())? {
            Some(bytes) if bytes.len() == 16 => {
                Ok(Some(uuid::Uuid::from_slice(&bytes).map_err(|e| {
                    OrchestratorError::PackageIndexError(e.to_string())
                })?))
            }
            Some(_) => Err(OrchestratorError::PackageIndexError(format!(
                "malformed packages entry for {key}"
            ))),
            None => Ok(None),
        }
    }

    pub fn close(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn transaction_err(err: TransactionError<()>) -> OrchestratorError {
    match err {
        TransactionError::Abort(()) => OrchestratorError::RecordError("transaction aborted".to_string()),
        TransactionError::Storage(e) => OrchestratorError::DatabaseError(e),
    }
}

#[cfg(unix)]
fn set_restrictive_permissions(path: &Path) {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = fs::metadata(path) {
        let mut perms = metadata.permissions();
        perms.set_mode(0o700);
        let _ = fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn set_restrictive_permissions(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_build_record() {
        let (db, _tmp) = BuildDatabase::open_temporary().unwrap();
        let id = db.start_build("devel/foo", "1.0").unwrap();
        let loaded = db.load_build(id).unwrap().unwrap();
        assert_eq!(loaded.uuid, id);
        assert_eq!(loaded.status, BuildStatus::Running);
    }

    #[test]
    fn successful_build_updates_all_three_partitions() {
        let (db, _tmp) = BuildDatabase::open_temporary().unwrap();
        let id = db.start_build("devel/foo", "1.0").unwrap();
        db.complete_success(id, "devel/foo", "1.0", 0xDEADBEEF).unwrap();

        let record = db.load_build(id).unwrap().unwrap();
        assert_eq!(record.status, BuildStatus::Success);
        assert_eq!(db.get_crc("devel/foo").unwrap(), Some(0xDEADBEEF));
        assert_eq!(db.latest_successful_build("devel/foo", "1.0").unwrap(), Some(id));
    }

    #[test]
    fn failed_build_leaves_crc_and_packages_untouched() {
        let (db, _tmp) = BuildDatabase::open_temporary().unwrap();
        let id = db.start_build("devel/q", "2.0").unwrap();
        db.complete_failure(id).unwrap();

        let record = db.load_build(id).unwrap().unwrap();
        assert_eq!(record.status, BuildStatus::Failed);
        assert_eq!(db.get_crc("devel/q").unwrap(), None);
        assert_eq!(db.latest_successful_build("devel/q", "2.0").unwrap(), None);
        assert!(db.needs_build("devel/q", 123).unwrap());
    }

    #[test]
    fn needs_build_is_true_until_crc_matches() {
        let (db, _tmp) = BuildDatabase::open_temporary().unwrap();
        assert!(db.needs_build("devel/foo", 42).unwrap());
        db.update_crc("devel/foo", 42).unwrap();
        assert!(!db.needs_build("devel/foo", 42).unwrap());
        assert!(db.needs_build("devel/foo", 43).unwrap());
    }

    #[test]
    fn close_is_idempotent() {
        let (db, _tmp) = BuildDatabase::open_temporary().unwrap();
        db.close().unwrap();
        db.close().unwrap();
    }
}
