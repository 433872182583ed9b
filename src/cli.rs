use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "portkiln",
    version,
    about = "Parallel, incremental package-build orchestrator for a ports tree"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Resolve, order, and build the requested ports and their dependencies.
    Build(BuildArgs),
    /// Resolve and order the requested ports without building anything.
    Plan(BuildArgs),
}

#[derive(Debug, clap::Args)]
pub struct BuildArgs {
    /// One or more "category/name[@flavor]" port specs.
    #[arg(required = true)]
    pub packages: Vec<String>,

    #[arg(long)]
    pub build_base: Option<PathBuf>,

    #[arg(long)]
    pub ports_root: Option<PathBuf>,

    #[arg(long)]
    pub packages_path: Option<PathBuf>,

    #[arg(long)]
    pub distfiles_path: Option<PathBuf>,

    #[arg(long)]
    pub options_path: Option<PathBuf>,

    #[arg(long)]
    pub system_root: Option<PathBuf>,

    #[arg(long)]
    pub ccache_path: Option<PathBuf>,

    #[arg(long, default_value_t = default_worker_count())]
    pub max_workers: usize,

    #[arg(long, default_value_t = 1)]
    pub max_jobs_per_worker: usize,

    #[arg(long)]
    pub use_usr_src: bool,

    #[arg(long)]
    pub use_ccache: bool,

    #[arg(long)]
    pub force_rebuild: bool,

    /// Use the plain-directory mock environment instead of a real chroot
    /// sandbox. Intended for CI and local experimentation.
    #[arg(long)]
    pub mock_environment: bool,

    /// Database file under `build_base` (defaults to `portkiln.db`).
    #[arg(long)]
    pub db_path: Option<PathBuf>,
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

impl BuildArgs {
    pub fn effective_config(&self) -> portkiln::OrchestratorConfig {
        let mut config = portkiln::OrchestratorConfig::default();
        if let Some(v) = &self.build_base {
            config.build_base = v.clone();
        }
        if let Some(v) = &self.ports_root {
            config.ports_root = v.clone();
        }
        if let Some(v) = &self.packages_path {
            config.packages_path = v.clone();
        }
        if let Some(v) = &self.distfiles_path {
            config.distfiles_path = v.clone();
        }
        if let Some(v) = &self.options_path {
            config.options_path = v.clone();
        }
        if let Some(v) = &self.system_root {
            config.system_root = v.clone();
        }
        config.ccache_path = self.ccache_path.clone();
        config.max_workers = self.max_workers.max(1);
        config.max_jobs_per_worker = self.max_jobs_per_worker.max(1);
        config.use_usr_src = self.use_usr_src;
        config.use_ccache = self.use_ccache;
        config.force_rebuild = self.force_rebuild;
        config
    }

    pub fn effective_db_path(&self, config: &portkiln::OrchestratorConfig) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| config.build_base.join("portkiln.db"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_requires_at_least_one_package() {
        let result = Cli::try_parse_from(["portkiln", "build"]);
        assert!(result.is_err());
    }

    #[test]
    fn build_accepts_multiple_positional_packages() {
        let cli = Cli::try_parse_from(["portkiln", "build", "devel/foo", "devel/bar"]).unwrap();
        match cli.command {
            Command::Build(args) => assert_eq!(args.packages, vec!["devel/foo", "devel/bar"]),
            _ => panic!("expected Build"),
        }
    }

    #[test]
    fn max_workers_defaults_to_host_parallelism() {
        let cli = Cli::try_parse_from(["portkiln", "build", "devel/foo"]).unwrap();
        match cli.command {
            Command::Build(args) => assert!(args.max_workers >= 1),
            _ => panic!("expected Build"),
        }
    }

    #[test]
    fn overrides_are_threaded_into_the_config() {
        let cli = Cli::try_parse_from([
            "portkiln",
            "build",
            "devel/foo",
            "--build-base",
            "/tmp/custom-base",
            "--max-workers",
            "3",
            "--force-rebuild",
        ])
        .unwrap();
        match cli.command {
            Command::Build(args) => {
                let config = args.effective_config();
                assert_eq!(config.build_base, PathBuf::from("/tmp/custom-base"));
                assert_eq!(config.max_workers, 3);
                assert!(config.force_rebuild);
            }
            _ => panic!("expected Build"),
        }
    }
}
