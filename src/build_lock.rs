use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

const SESSION_FILE_NAME: &str = ".portkiln-session.lock";
const SESSION_STATE_NAME: &str = ".portkiln-session.json";

#[derive(Debug, Serialize, Deserialize)]
struct ActiveSessionState {
    pid: u32,
    host: String,
    started_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum SessionAcquireOutcome {
    Owner(BuildSessionGuard),
    HeldBy { pid: u32, host: String, started_at: DateTime<Utc> },
}

pub struct BuildSessionGuard {
    lock_file: File,
    state_path: PathBuf,
}

impl BuildSessionGuard {
    pub fn acquire(build_base: &Path) -> std::io::Result<SessionAcquireOutcome> {
        fs::create_dir_all(build_base)?;
        let lock_path = build_base.join(SESSION_FILE_NAME);
        let state_path = build_base.join(SESSION_STATE_NAME);

        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;

        match lock_file.try_lock_exclusive() {
            Ok(()) => {
                let guard = BuildSessionGuard {
                    lock_file,
                    state_path: state_path.clone(),
                };
                guard.write_state()?;
                Ok(SessionAcquireOutcome::Owner(guard))
            }
            Err(_) => {
                let held_by = load_state(&state_path).unwrap_or(ActiveSessionState {
                    pid: 0,
                    host: "unknown".to_string(),
                    started_at: Utc::now(),
                });
                Ok(SessionAcquireOutcome::HeldBy {
                    pid: held_by.pid,
                    host: held_by.host,
                    started_at: held_by.started_at,
                })
            }
        }
    }

    fn write_state(&self) -> std::io::Result<()> {
        let state = ActiveSessionState {
            pid: std::process::id(),
            host: current_host_name(),
            started_at: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&state)?;
        let tmp_path = self.state_path.with_extension("json.tmp");
        fs::write(&tmp_path, bytes)?;
        fs::rename(&tmp_path, &self.state_path)
    }
}

impl Drop for BuildSessionGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.lock_file);
        let _ = fs::remove_file(&self.state_path);
    }
}

pub fn current_host_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

fn load_state(path: &Path) -> std::io::Result<ActiveSessionState> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(std::io::Error::from)
}
