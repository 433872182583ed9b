use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub build_base: PathBuf,
    pub ports_root: PathBuf,
    pub packages_path: PathBuf,
    pub distfiles_path: PathBuf,
    pub options_path: PathBuf,
    pub system_root: PathBuf,
    pub ccache_path: Option<PathBuf>,
    pub max_workers: usize,
    pub max_jobs_per_worker: usize,
    pub use_usr_src: bool,
    pub use_ccache: bool,
    pub force_rebuild: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            build_base: PathBuf::from("/tmp/portkiln/build_base"),
            ports_root: PathBuf::from("/usr/ports"),
            packages_path: PathBuf::from("/tmp/portkiln/packages"),
            distfiles_path: PathBuf::from("/tmp/portkiln/distfiles"),
            options_path: PathBuf::from("/tmp/portkiln/options"),
            system_root: PathBuf::from("/"),
            ccache_path: None,
            max_workers: 1,
            max_jobs_per_worker: 1,
            use_usr_src: false,
            use_ccache: false,
            force_rebuild: false,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_workers == 0 {
            return Err("max_workers must be >= 1".to_string());
        }
        if self.max_jobs_per_worker == 0 {
            return Err("max_jobs_per_worker must be >= 1".to_string());
        }
        Ok(())
    }
}
