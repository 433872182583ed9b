use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};

pub struct ExecRequest<'a> {
    pub program: &'a str,
    pub args: &'a [String],
    pub env_overrides: &'a [(String, String)],
    pub working_dir: &'a str,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub duration: Duration,
}

pub trait Environment: Send + Sync {
    fn setup(&mut self) -> Result<()>;

    fn execute(&self, request: ExecRequest, cancel: &CancellationToken) -> Result<ExecOutcome>;

    fn cleanup(&mut self) -> Result<()>;

    fn base_dir(&self) -> &Path;
}

#[derive(Clone, Default)]
pub struct CancellationToken {
    flag: std::sync::Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

struct MountRecord {
    target: PathBuf,
}

pub struct BsdChrootEnvironment {
    worker_id: u32,
    base_dir: PathBuf,
    config: OrchestratorConfig,
    mounts: Vec<MountRecord>,
    failed_mount_count: usize,
    cleaned_up: bool,
}

const READ_ONLY_SYSTEM_DIRS: &[&str] = &[
    "bin",
    "sbin",
    "lib",
    "libexec",
    "usr/bin",
    "usr/include",
    "usr/lib",
    "usr/libdata",
    "usr/libexec",
    "usr/sbin",
    "usr/share",
    "usr/games",
];

const CLEANUP_MAX_RETRIES: u32 = 10;
const CLEANUP_RETRY_DELAY: Duration = Duration::from_secs(5);

impl BsdChrootEnvironment {
    pub fn new(worker_id: u32, config: OrchestratorConfig) -> Self {
        let base_dir = config.build_base.join(format!("SL{worker_id:02}"));
        BsdChrootEnvironment {
            worker_id,
            base_dir,
            config,
            mounts: Vec::new(),
            failed_mount_count: 0,
            cleaned_up: false,
        }
    }

    fn nullfs_mount(&mut self, source: &Path, target_rel: &str, readonly: bool) {
        let target = self.base_dir.join(target_rel);
        if std::fs::create_dir_all(&target).is_err() {
            self.failed_mount_count += 1;
            return;
        }
        match mount_nullfs(source, &target, readonly) {
            Ok(()) => self.mounts.push(MountRecord { target }),
            Err(e) => {
                warn!(source = %source.display(), target = %target.display(), error = %e, "nullfs mount failed");
                self.failed_mount_count += 1;
            }
        }
    }

    fn tmpfs_mount(&mut self, target_rel: &str) {
        let target = self.base_dir.join(target_rel);
        if std::fs::create_dir_all(&target).is_err() {
            self.failed_mount_count += 1;
            return;
        }
        match mount_tmpfs(&target) {
            Ok(()) => self.mounts.push(MountRecord { target }),
            Err(e) => {
                warn!(target = %target.display(), error = %e, "tmpfs mount failed");
                self.failed_mount_count += 1;
            }
        }
    }
}

impl Environment for BsdChrootEnvironment {
    fn setup(&mut self) -> Result<()> {
        info!(worker_id = self.worker_id, base = %self.base_dir.display(), "environment setup starting");

        // 1. root tmpfs over the base directory.
        std::fs::create_dir_all(&self.base_dir)
            .map_err(|_| OrchestratorError::SetupFailed { failed_mounts: 1 })?;
        self.tmpfs_mount(".");

        // 2. /boot tmpfs, /dev devfs, /proc procfs.
        self.tmpfs_mount("boot");
        {
            let dev = self.base_dir.join("dev");
            let _ = std::fs::create_dir_all(&dev);
            match mount_devfs(&dev) {
                Ok(()) => self.mounts.push(MountRecord { target: dev }),
                Err(_) => self.failed_mount_count += 1,
            }
        }
        {
            let proc = self.base_dir.join("proc");
            let _ = std::fs::create_dir_all(&proc);
            match mount_procfs(&proc) {
                Ok(()) => self.mounts.push(MountRecord { target: proc }),
                Err(_) => self.failed_mount_count += 1,
            }
        }

        // 3. read-only nullfs of host system directories.
        for rel in READ_ONLY_SYSTEM_DIRS {
            let source = self.config.system_root.join(rel);
            self.nullfs_mount(&source, rel, true);
        }

        // 4. optional /usr/src.
        if self.config.use_usr_src {
            let source = self.config.system_root.join("usr/src");
            self.nullfs_mount(&source, "usr/src", true);
        }

        // 5. ports tree, read-only, at /xports.
        self.nullfs_mount(&self.config.ports_root.clone(), "xports", true);

        // 6. read-write shared dirs: options, packages, distfiles.
        self.nullfs_mount(&self.config.options_path.clone(), "options", false);
        self.nullfs_mount(&self.config.packages_path.clone(), "packages", false);
        self.nullfs_mount(&self.config.distfiles_path.clone(), "distfiles", false);

        // 7. /construction and /usr/local tmpfs.
        self.tmpfs_mount("construction");
        self.tmpfs_mount("usr/local");

        // 8. optional ccache.
        if self.config.use_ccache {
            if let Some(ccache) = self.config.ccache_path.clone() {
                self.nullfs_mount(&ccache, "ccache", false);
            }
        }

        // 9. template tree copy (bin/sh, etc), best-effort, no mount to record.
        // left to the caller's template provisioning step; not part of the
        // mount inventory that Cleanup must reverse.

        if self.failed_mount_count > 0 {
            return Err(OrchestratorError::SetupFailed {
                failed_mounts: self.failed_mount_count,
            });
        }
        Ok(())
    }

    fn execute(&self, request: ExecRequest, cancel: &CancellationToken) -> Result<ExecOutcome> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;
        use std::os::unix::process::CommandExt;

        let mut cmd = Command::new(request.program);
        cmd.args(request.args);
        for (k, v) in request.env_overrides {
            cmd.env(k, v);
        }
        cmd.env("PORTKILN_WORKDIR", request.working_dir);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // New process group so cancellation can kill the command and every
        // descendant it spawned with a single signal to -pgid.
        cmd.process_group(0);

        // `chroot(2)` into the assembled sandbox before exec.
        let root = CString::new(self.base_dir.as_os_str().as_bytes())
            .map_err(|e| OrchestratorError::ExecutionFailed(e.to_string()))?;
        let working_dir = CString::new(request.working_dir)
            .unwrap_or_else(|_| CString::new("/").unwrap());
        unsafe {
            cmd.pre_exec(move || {
                if libc::chroot(root.as_ptr()) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::chdir(working_dir.as_ptr()) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| OrchestratorError::ExecutionFailed(e.to_string()))?;
        let pid = Pid::from_raw(child.id() as i32);

        let poll_interval = Duration::from_millis(100);
        loop {
            if let Some(status) = child
                .try_wait()
                .map_err(|e| OrchestratorError::ExecutionFailed(e.to_string()))?
            {
                return Ok(ExecOutcome {
                    exit_code: status.code().unwrap_or(-1),
                    duration: start.elapsed(),
                });
            }

            let timed_out = request.timeout.map(|t| start.elapsed() >= t).unwrap_or(false);
            if cancel.is_cancelled() || timed_out {
                kill_process_group(pid);
                let _ = child.wait();
                return Ok(ExecOutcome {
                    exit_code: -1,
                    duration: start.elapsed(),
                });
            }

            std::thread::sleep(poll_interval);
        }
    }

    fn cleanup(&mut self) -> Result<()> {
        if self.cleaned_up {
            return Ok(());
        }
        let mut failures = 0usize;
        for record in self.mounts.iter().rev() {
            if !unmount_with_retry(&record.target) {
                failures += 1;
            }
        }
        if std::fs::remove_dir_all(&self.base_dir).is_err() {
            failures += 1;
        }
        self.cleaned_up = true;
        if failures > 0 {
            return Err(OrchestratorError::CleanupFailed(format!(
                "{failures} mount(s)/directory removal failed during cleanup"
            )));
        }
        Ok(())
    }

    fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

fn kill_process_group(pid: Pid) {
    let pgid = Pid::from_raw(-pid.as_raw());
    let _ = signal::kill(pgid, Signal::SIGTERM);
    std::thread::sleep(Duration::from_millis(500));
    let _ = signal::kill(pgid, Signal::SIGKILL);
}

fn unmount_with_retry(target: &Path) -> bool {
    for attempt in 0..CLEANUP_MAX_RETRIES {
        match unmount(target) {
            Ok(()) => return true,
            Err(e) if is_device_busy(&e) => {
                warn!(target = %target.display(), attempt, "unmount busy, retrying");
                std::thread::sleep(CLEANUP_RETRY_DELAY);
            }
            Err(_) => return false,
        }
    }
    false
}

fn is_device_busy(err: &nix::Error) -> bool {
    matches!(err, nix::Error::EBUSY)
}

#[cfg(target_os = "freebsd")]
fn mount_nullfs(source: &Path, target: &Path, readonly: bool) -> nix::Result<()> {
    use nix::mount::{mount, MntFlags};
    let flags = if readonly { MntFlags::MNT_RDONLY } else { MntFlags::empty() };
    mount(Some(source), target, Some("nullfs"), flags, None::<&str>)
}

#[cfg(target_os = "freebsd")]
fn mount_tmpfs(target: &Path) -> nix::Result<()> {
    use nix::mount::{mount, MntFlags};
    mount(None::<&Path>, target, Some("tmpfs"), MntFlags::empty(), None::<&str>)
}

#[cfg(target_os = "freebsd")]
fn mount_devfs(target: &Path) -> nix::Result<()> {
    use nix::mount::{mount, MntFlags};
    mount(None::<&Path>, target, Some("devfs"), MntFlags::empty(), None::<&str>)
}

#[cfg(target_os = "freebsd")]
fn mount_procfs(target: &Path) -> nix::Result<()> {
    use nix::mount::{mount, MntFlags};
    mount(None::<&Path>, target, Some("procfs"), MntFlags::MNT_RDONLY, None::<&str>)
}

#[cfg(target_os = "freebsd")]
fn unmount(target: &Path) -> nix::Result<()> {
    nix::mount::unmount(target, nix::mount::MntFlags::empty())
}

#[cfg(all(unix, not(target_os = "freebsd")))]
fn mount_nullfs(source: &Path, target: &Path, readonly: bool) -> nix::Result<()> {
    use nix::mount::{mount, MsFlags};
    let mut flags = MsFlags::MS_BIND;
    if readonly {
        flags |= MsFlags::MS_RDONLY;
    }
    mount(Some(source), target, None::<&str>, flags, None::<&str>)
}

#[cfg(all(unix, not(target_os = "freebsd")))]
fn mount_tmpfs(target: &Path) -> nix::Result<()> {
    use nix::mount::{mount, MsFlags};
    mount(None::<&Path>, target, Some("tmpfs"), MsFlags::empty(), None::<&str>)
}

#[cfg(all(unix, not(target_os = "freebsd")))]
fn mount_devfs(target: &Path) -> nix::Result<()> {
    use nix::mount::{mount, MsFlags};
    mount(Some(Path::new("/dev")), target, None::<&str>, MsFlags::MS_BIND, None::<&str>)
}

#[cfg(all(unix, not(target_os = "freebsd")))]
fn mount_procfs(target: &Path) -> nix::Result<()> {
    use nix::mount::{mount, MsFlags};
    mount(None::<&Path>, target, Some("proc"), MsFlags::MS_RDONLY, None::<&str>)
}

#[cfg(all(unix, not(target_os = "freebsd")))]
fn unmount(target: &Path) -> nix::Result<()> {
    nix::mount::umount(target)
}

pub struct MockEnvironment {
    base_dir: PathBuf,
    set_up: bool,
    cleaned_up: bool,
}

impl MockEnvironment {
    pub fn new(base_dir: PathBuf) -> Self {
        MockEnvironment {
            base_dir,
            set_up: false,
            cleaned_up: false,
        }
    }
}

impl Environment for MockEnvironment {
    fn setup(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.base_dir)
            .map_err(|_| OrchestratorError::SetupFailed { failed_mounts: 1 })?;
        self.set_up = true;
        Ok(())
    }

    fn execute(&self, request: ExecRequest, cancel: &CancellationToken) -> Result<ExecOutcome> {
        let start = Instant::now();
        if cancel.is_cancelled() {
            return Ok(ExecOutcome {
                exit_code: -1,
                duration: start.elapsed(),
            });
        }
        let status = Command::new(request.program)
            .args(request.args)
            .current_dir(&self.base_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| OrchestratorError::ExecutionFailed(e.to_string()))?;
        Ok(ExecOutcome {
            exit_code: status.code().unwrap_or(-1),
            duration: start.elapsed(),
        })
    }

    fn cleanup(&mut self) -> Result<()> {
        if self.cleaned_up {
            return Ok(());
        }
        if self.set_up {
            let _ = std::fs::remove_dir_all(&self.base_dir);
        }
        self.cleaned_up = true;
        Ok(())
    }

    fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_environment_setup_and_cleanup_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("SL00");
        let mut env = MockEnvironment::new(base.clone());
        env.setup().unwrap();
        assert!(base.is_dir());
        env.cleanup().unwrap();
        assert!(!base.is_dir());
    }

    #[test]
    fn mock_environment_cleanup_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("SL00");
        let mut env = MockEnvironment::new(base);
        env.setup().unwrap();
        env.cleanup().unwrap();
        env.cleanup().unwrap();
    }

    #[test]
    fn mock_environment_executes_a_command() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("SL00");
        let mut env = MockEnvironment::new(base);
        env.setup().unwrap();
        let cancel = CancellationToken::new();
        let outcome = env
            .execute(
                ExecRequest {
                    program: "true",
                    args: &[],
                    env_overrides: &[],
                    working_dir: "/",
                    timeout: None,
                },
                &cancel,
            )
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        env.cleanup().unwrap();
    }
}
