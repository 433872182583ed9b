use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::db::BuildDatabase;
use crate::environment::{CancellationToken, Environment, ExecRequest, ExecOutcome};
use crate::error::{OrchestratorError, Result};
use crate::fingerprint;
use crate::model::PackageFlags;
use crate::registry::{BuildStateRegistry, PackageRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success,
    Failed { exit_code: i32 },
}

pub trait PhaseExecutor: Send + Sync {
    fn execute(&self, env: &dyn Environment, cancel: &CancellationToken, port_id: &str) -> Result<ExecutionOutcome>;
}

pub struct NoopPhaseExecutor;

impl PhaseExecutor for NoopPhaseExecutor {
    fn execute(&self, _env: &dyn Environment, _cancel: &CancellationToken, _port_id: &str) -> Result<ExecutionOutcome> {
        Ok(ExecutionOutcome::Success)
    }
}

pub struct CommandPhaseExecutor {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
}

impl PhaseExecutor for CommandPhaseExecutor {
    fn execute(&self, env: &dyn Environment, cancel: &CancellationToken, _port_id: &str) -> Result<ExecutionOutcome> {
        let request = ExecRequest {
            program: &self.program,
            args: &self.args,
            env_overrides: &[],
            working_dir: "/construction",
            timeout: self.timeout,
        };
        let outcome: ExecOutcome = env.execute(request, cancel)?;
        if outcome.exit_code == 0 {
            Ok(ExecutionOutcome::Success)
        } else {
            Ok(ExecutionOutcome::Failed {
                exit_code: outcome.exit_code,
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildEvent {
    pub timestamp: chrono::DateTime<Utc>,
    pub kind: BuildEventKind,
    pub port_id: String,
    pub worker_id: Option<u32>,
    pub payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildEventKind {
    Queued,
    Started,
    PhaseStarted,
    PhaseCompleted,
    PackageSuccess,
    PackageFailed,
    PackageSkipped,
    WorkerIdle,
}

impl fmt::Display for BuildEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildEventKind::Queued => "queued",
            BuildEventKind::Started => "started",
            BuildEventKind::PhaseStarted => "phase_started",
            BuildEventKind::PhaseCompleted => "phase_completed",
            BuildEventKind::PackageSuccess => "package_success",
            BuildEventKind::PackageFailed => "package_failed",
            BuildEventKind::PackageSkipped => "package_skipped",
            BuildEventKind::WorkerIdle => "worker_idle",
        };
        f.write_str(s)
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: BuildEvent);
}

pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: BuildEvent) {
        info!(
            phase = %event.kind,
            port_id = %event.port_id,
            worker_id = event.worker_id.unwrap_or(u32::MAX),
            payload = %event.payload,
            "build event"
        );
    }
}

fn emit(sink: &dyn EventSink, kind: BuildEventKind, port_id: &str, worker_id: Option<u32>, payload: impl Into<String>) {
    sink.emit(BuildEvent {
        timestamp: Utc::now(),
        kind,
        port_id: port_id.to_string(),
        worker_id,
        payload: payload.into(),
    });
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub pre_skipped: usize,
    pub ignored: usize,
    pub elapsed: Duration,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "build total={} success={} failed={} skipped={} pre-skipped={} ignored={} elapsed={:.1}s",
            self.total,
            self.success,
            self.failed,
            self.skipped,
            self.pre_skipped,
            self.ignored,
            self.elapsed.as_secs_f64()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    Success,
    Failed,
    Skipped,
    Ignored,
}

struct DispatchState {
    ready: VecDeque<String>,
    pending_deps: HashMap<String, usize>,
    dependents: HashMap<String, Vec<String>>,
    terminal: HashMap<String, Terminal>,
    remaining: usize,
    pre_skipped: usize,
}

pub struct Scheduler<'a> {
    pub config: &'a OrchestratorConfig,
    pub ports_root: &'a Path,
    pub packages: &'a PackageRegistry,
    pub build_states: &'a BuildStateRegistry,
    pub db: &'a BuildDatabase,
    pub executor: Arc<dyn PhaseExecutor>,
    pub event_sink: Arc<dyn EventSink>,
    pub cancel: CancellationToken,
}

impl<'a> Scheduler<'a> {
    pub fn run(
        &self,
        ordered: &[String],
        environment_factory: impl Fn(u32) -> Box<dyn Environment> + Send + Sync + 'static,
    ) -> Result<RunSummary> {
        let start = Instant::now();

        if ordered.is_empty() {
            return Err(OrchestratorError::NoValidPorts);
        }

        // Bootstrap discipline: a PKG_PKG package must succeed before any
        // other worker accepts ordinary work.
        if let Some(bootstrap_id) = ordered.iter().find(|id| {
            self.build_states
                .get(id)
                .map(|s| s.test_flags(PackageFlags::PKG_PKG))
                .unwrap_or(false)
        }) {
            let mut env = environment_factory(0);
            if let Err(e) = env.setup() {
                warn!(error = %e, "bootstrap environment setup failed; aborting run");
                let _ = env.cleanup();
                return Err(OrchestratorError::ExecutionFailed(format!(
                    "bootstrap package {bootstrap_id}: environment setup failed: {e}"
                )));
            }
            let outcome = self.build_one(bootstrap_id, 0, env.as_ref());
            let _ = env.cleanup();
            match outcome {
                Ok((Terminal::Success, _)) | Ok((Terminal::Ignored, _)) => {}
                _ => {
                    return Err(OrchestratorError::ExecutionFailed(format!(
                        "bootstrap package {bootstrap_id} failed; aborting run"
                    )));
                }
            }
        }

        let mut pending_deps = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        let ordered_set: HashSet<&str> = ordered.iter().map(|s| s.as_str()).collect();

        for id in ordered {
            let pkg = self.packages.find(id);
            let dep_count = pkg
                .as_ref()
                .map(|p| p.depends_on().into_iter().filter(|e| ordered_set.contains(e.port_id.as_str())).count())
                .unwrap_or(0);
            pending_deps.insert(id.clone(), dep_count);
            if let Some(pkg) = pkg {
                for edge in pkg.depends_on() {
                    if ordered_set.contains(edge.port_id.as_str()) {
                        dependents.entry(edge.port_id.clone()).or_default().push(id.clone());
                    }
                }
            }
        }

        let ready: VecDeque<String> = ordered
            .iter()
            .filter(|id| pending_deps.get(*id).copied().unwrap_or(0) == 0)
            .cloned()
            .collect();

        let state = Mutex::new(DispatchState {
            ready,
            pending_deps,
            dependents,
            terminal: HashMap::new(),
            remaining: ordered.len(),
            pre_skipped: 0,
        });
        let condvar = Condvar::new();
        let shared = Arc::new((state, condvar));

        let worker_count = self.config.max_workers.max(1);
        let jobs_per_worker = self.config.max_jobs_per_worker.max(1);
        std::thread::scope(|scope| {
            for worker_id in 0..worker_count {
                let shared = Arc::clone(&shared);
                let factory = &environment_factory;
                scope.spawn(move || {
                    let mut env = factory(worker_id as u32);
                    if let Err(e) = env.setup() {
                        warn!(worker_id, error = %e, "environment setup failed; worker exiting");
                        let _ = env.cleanup();
                        return;
                    }

                    // All job slots of one worker share its single sandbox
                    // (spec §4.6/§9: "one long-lived environment per
                    // worker", concurrency within it is the
                    // `max_jobs_per_worker` knob), so `execute` is invoked
                    // through a shared reference from each slot's thread.
                    let env: Arc<dyn Environment> = Arc::from(env);
                    std::thread::scope(|job_scope| {
                        for job_id in 0..jobs_per_worker {
                            let env = Arc::clone(&env);
                            let shared = &shared;
                            job_scope.spawn(move || {
                                self.worker_loop(worker_id as u32, job_id, env.as_ref(), shared);
                            });
                        }
                    });

                    let mut env = env;
                    match Arc::get_mut(&mut env) {
                        Some(env) => {
                            let _ = env.cleanup();
                        }
                        None => {
                            warn!(worker_id, "environment still referenced after all job slots finished; skipping cleanup");
                        }
                    }
                });
            }
        });

        let (mutex, _) = &*shared;
        let final_state = mutex.lock().expect("dispatch state lock poisoned");
        let mut summary = RunSummary {
            total: ordered.len(),
            elapsed: start.elapsed(),
            pre_skipped: final_state.pre_skipped,
            ..Default::default()
        };
        for terminal in final_state.terminal.values() {
            match terminal {
                Terminal::Success => summary.success += 1,
                Terminal::Failed => summary.failed += 1,
                Terminal::Skipped => summary.skipped += 1,
                Terminal::Ignored => summary.ignored += 1,
            }
        }
        Ok(summary)
    }

    fn worker_loop(
        &self,
        worker_id: u32,
        job_id: usize,
        env: &dyn Environment,
        shared: &Arc<(Mutex<DispatchState>, Condvar)>,
    ) {
        let (mutex, condvar) = &**shared;
        loop {
            if self.cancel.is_cancelled() {
                let mut state = mutex.lock().expect("dispatch state lock poisoned");
                self.drain_cancelled(&mut state);
                condvar.notify_all();
                return;
            }

            let next = {
                let mut state = mutex.lock().expect("dispatch state lock poisoned");
                loop {
                    if let Some(id) = state.ready.pop_front() {
                        break Some(id);
                    }
                    if state.remaining == 0 {
                        break None;
                    }
                    emit(self.event_sink.as_ref(), BuildEventKind::WorkerIdle, "", Some(worker_id), format!("job {job_id} idle"));
                    let (guard, timeout) = condvar
                        .wait_timeout(state, Duration::from_millis(200))
                        .expect("dispatch state lock poisoned");
                    state = guard;
                    if timeout.timed_out() && state.remaining == 0 {
                        break None;
                    }
                }
            };

            let Some(port_id) = next else {
                return;
            };

            let already_terminal = mutex
                .lock()
                .expect("dispatch state lock poisoned")
                .terminal
                .contains_key(&port_id);
            if already_terminal {
                continue;
            }

            emit(self.event_sink.as_ref(), BuildEventKind::Started, &port_id, Some(worker_id), format!("job {job_id}"));
            let (terminal, pre_skipped) = self.build_one(&port_id, worker_id, env).unwrap_or_else(|e| {
                warn!(port_id = %port_id, error = %e, "package build failed with an error");
                (Terminal::Failed, false)
            });

            let mut state = mutex.lock().expect("dispatch state lock poisoned");
            if pre_skipped {
                state.pre_skipped += 1;
            }
            self.settle(&mut state, &port_id, terminal);
            condvar.notify_all();
        }
    }

    fn settle(&self, state: &mut DispatchState, port_id: &str, terminal: Terminal) {
        if state.terminal.contains_key(port_id) {
            return;
        }
        state.terminal.insert(port_id.to_string(), terminal);
        state.remaining = state.remaining.saturating_sub(1);

        let kind = match terminal {
            Terminal::Success => BuildEventKind::PackageSuccess,
            Terminal::Failed => BuildEventKind::PackageFailed,
            Terminal::Skipped => BuildEventKind::PackageSkipped,
            Terminal::Ignored => BuildEventKind::PackageSkipped,
        };
        emit(self.event_sink.as_ref(), kind, port_id, None, "");

        if terminal == Terminal::Failed {
            self.cascade_skip(state, port_id);
            return;
        }

        if let Some(deps) = state.dependents.get(port_id).cloned() {
            for dependent in deps {
                if state.terminal.contains_key(&dependent) {
                    continue;
                }
                let count = state.pending_deps.entry(dependent.clone()).or_insert(0);
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.ready.push_back(dependent);
                }
            }
        }
    }

    fn cascade_skip(&self, state: &mut DispatchState, failed_port_id: &str) {
        let mut queue = VecDeque::new();
        queue.push_back(failed_port_id.to_string());
        let mut visited = HashSet::new();

        while let Some(id) = queue.pop_front() {
            let Some(deps) = state.dependents.get(&id).cloned() else {
                continue;
            };
            for dependent in deps {
                if !visited.insert(dependent.clone()) {
                    continue;
                }
                if state.terminal.contains_key(&dependent) {
                    continue;
                }
                state.terminal.insert(dependent.clone(), Terminal::Skipped);
                state.remaining = state.remaining.saturating_sub(1);
                emit(self.event_sink.as_ref(), BuildEventKind::PackageSkipped, &dependent, None, "dependency failed");
                if let Some(bs) = self.build_states.get(&dependent) {
                    bs.add_flags(PackageFlags::SKIPPED);
                }
                queue.push_back(dependent);
            }
        }
    }

    fn drain_cancelled(&self, state: &mut DispatchState) {
        let pending: Vec<String> = state.ready.drain(..).collect();
        for id in pending {
            if !state.terminal.contains_key(&id) {
                state.terminal.insert(id.clone(), Terminal::Skipped);
                state.remaining = state.remaining.saturating_sub(1);
            }
        }
    }

    fn build_one(&self, port_id: &str, worker_id: u32, env: &dyn Environment) -> Result<(Terminal, bool)> {
        let build_state = self.build_states.get_or_create(port_id);
        let pkg = self
            .packages
            .find(port_id)
            .ok_or_else(|| OrchestratorError::PortNotFound { port_id: port_id.to_string() })?;

        if build_state.test_flags(PackageFlags::NOT_FOUND | PackageFlags::CORRUPT) {
            build_state.add_flags(PackageFlags::FAILED);
            return Ok((Terminal::Failed, false));
        }

        if build_state.test_flags(PackageFlags::IGNORED) {
            return Ok((Terminal::Ignored, false));
        }

        if pkg.pkg_filename.is_empty() {
            build_state.add_flags(PackageFlags::META | PackageFlags::SUCCESS);
            return Ok((Terminal::Success, false));
        }

        let (category, name) = pkg
            .port_id
            .split_once('/')
            .map(|(c, rest)| (c, rest.split('@').next().unwrap_or(rest)))
            .unwrap_or(("", ""));
        let port_dir = self.ports_root.join(category).join(name);
        let crc = fingerprint::fingerprint(&port_dir)?;

        let needs_build = self.config.force_rebuild || self.db.needs_build(port_id, crc)?;
        if !needs_build {
            build_state.add_flags(PackageFlags::SUCCESS | PackageFlags::PACKAGED);
            return Ok((Terminal::Success, true));
        }

        build_state.add_flags(PackageFlags::RUNNING);
        let build_uuid = self.db.start_build(port_id, &pkg.version)?;
        build_state.set_build_uuid(build_uuid);

        emit(self.event_sink.as_ref(), BuildEventKind::PhaseStarted, port_id, Some(worker_id), "");
        let outcome = self.executor.execute(env, &self.cancel, port_id);
        emit(self.event_sink.as_ref(), BuildEventKind::PhaseCompleted, port_id, Some(worker_id), "");

        build_state.clear_flags(PackageFlags::RUNNING);

        match outcome {
            Ok(ExecutionOutcome::Success) => {
                self.db.complete_success(build_uuid, port_id, &pkg.version, crc)?;
                build_state.add_flags(PackageFlags::SUCCESS | PackageFlags::PACKAGED);
                Ok((Terminal::Success, false))
            }
            Ok(ExecutionOutcome::Failed { exit_code }) => {
                warn!(port_id, exit_code, "phase exited non-zero");
                self.db.complete_failure(build_uuid)?;
                build_state.add_flags(PackageFlags::FAILED);
                Ok((Terminal::Failed, false))
            }
            Err(e) => {
                warn!(port_id, error = %e, "phase execution error");
                self.db.complete_failure(build_uuid)?;
                build_state.add_flags(PackageFlags::FAILED);
                Ok((Terminal::Failed, false))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use crate::config::OrchestratorConfig;
    use crate::db::BuildDatabase;
    use crate::environment::MockEnvironment;
    use crate::registry::{BuildStateRegistry, PackageRegistry};
    use crate::resolver::{self, RootSpec};
    use crate::topo;

    fn write_port(root: &Path, id: &str, build_deps: &str) {
        let (category, name) = id.split_once('/').unwrap();
        let dir = root.join(category).join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("Makefile"), format!("VERSION=1.0\nBUILD_DEPENDS={build_deps}\n")).unwrap();
    }

    struct Harness {
        _ports_tmp: tempfile::TempDir,
        _db_tmp: tempfile::TempDir,
        _base_tmp: tempfile::TempDir,
        config: OrchestratorConfig,
        packages: PackageRegistry,
        build_states: BuildStateRegistry,
        db: BuildDatabase,
    }

    fn build_harness(ports: &[(&str, &str)]) -> Harness {
        let ports_tmp = tempfile::tempdir().unwrap();
        for (id, deps) in ports {
            write_port(ports_tmp.path(), id, deps);
        }
        let db_tmp = tempfile::tempdir().unwrap();
        let db = BuildDatabase::open(&db_tmp.path().join("db")).unwrap();
        let base_tmp = tempfile::tempdir().unwrap();

        let mut config = OrchestratorConfig::default();
        config.ports_root = ports_tmp.path().to_path_buf();
        config.build_base = base_tmp.path().to_path_buf();
        config.max_workers = 2;

        Harness {
            _ports_tmp: ports_tmp,
            _db_tmp: db_tmp,
            _base_tmp: base_tmp,
            config,
            packages: PackageRegistry::new(),
            build_states: BuildStateRegistry::new(),
            db,
        }
    }

    fn run_once(h: &Harness, root: &str) -> RunSummary {
        let spec = resolver::parse_root_spec(root).unwrap();
        resolver::resolve(&[spec], &h.config.ports_root, h.config.max_workers, &h.packages, &h.build_states);
        let ordered = topo::order(&h.packages.all());

        let scheduler = Scheduler {
            config: &h.config,
            ports_root: &h.config.ports_root,
            packages: &h.packages,
            build_states: &h.build_states,
            db: &h.db,
            executor: Arc::new(NoopPhaseExecutor),
            event_sink: Arc::new(TracingEventSink),
            cancel: CancellationToken::new(),
        };

        let base = h.config.build_base.clone();
        scheduler
            .run(&ordered, move |worker_id| -> Box<dyn Environment> {
                Box::new(MockEnvironment::new(base.join(format!("SL{worker_id:02}"))))
            })
            .unwrap()
    }

    #[test]
    fn first_run_builds_everything_second_run_is_all_pre_skipped() {
        let h = build_harness(&[("devel/a", "b:/devel/b"), ("devel/b", "")]);

        let first = run_once(&h, "devel/a");
        assert_eq!(first.total, 2);
        assert_eq!(first.success, 2);
        assert_eq!(first.pre_skipped, 0);

        // Re-resolve: build states persist across "runs" here in the same
        // process, so reset them to simulate a fresh invocation (P6).
        h.build_states.reset_all();
        let second = run_once(&h, "devel/a");
        assert_eq!(second.total, 2);
        assert_eq!(second.success, 2);
        assert_eq!(second.pre_skipped, 2, "unchanged ports must be pre-skipped (P6)");
    }

    #[test]
    fn modifying_a_file_forces_a_rebuild() {
        let h = build_harness(&[("devel/p", "")]);
        let first = run_once(&h, "devel/p");
        assert_eq!(first.success, 1);

        h.build_states.reset_all();
        fs::write(
            h.config.ports_root.join("devel").join("p").join("Makefile"),
            "VERSION=1.1\n",
        )
        .unwrap();
        let second = run_once(&h, "devel/p");
        assert_eq!(second.success, 1);
        assert_eq!(second.pre_skipped, 0, "changed content must trigger a rebuild (S4)");
    }

    #[test]
    fn failed_package_skips_its_dependents() {
        struct AlwaysFail;
        impl PhaseExecutor for AlwaysFail {
            fn execute(&self, _env: &dyn Environment, _cancel: &CancellationToken, port_id: &str) -> Result<ExecutionOutcome> {
                if port_id == "devel/q" {
                    Ok(ExecutionOutcome::Failed { exit_code: 1 })
                } else {
                    Ok(ExecutionOutcome::Success)
                }
            }
        }

        let h = build_harness(&[("devel/p", "q:/devel/q"), ("devel/q", "")]);
        let spec = resolver::parse_root_spec("devel/p").unwrap();
        resolver::resolve(&[spec], &h.config.ports_root, h.config.max_workers, &h.packages, &h.build_states);
        let ordered = topo::order(&h.packages.all());

        let scheduler = Scheduler {
            config: &h.config,
            ports_root: &h.config.ports_root,
            packages: &h.packages,
            build_states: &h.build_states,
            db: &h.db,
            executor: Arc::new(AlwaysFail),
            event_sink: Arc::new(TracingEventSink),
            cancel: CancellationToken::new(),
        };
        let base = h.config.build_base.clone();
        let summary = scheduler
            .run(&ordered, move |worker_id| -> Box<dyn Environment> {
                Box::new(MockEnvironment::new(base.join(format!("SL{worker_id:02}"))))
            })
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.success, 0);

        // S5: the failed build must leave crc_index/packages untouched.
        assert_eq!(h.db.get_crc("devel/q").unwrap(), None);
        assert!(h.db.needs_build("devel/q", 0).unwrap());
    }

    #[test]
    fn multiple_job_slots_share_one_worker_environment() {
        // Ten independent leaf ports, one worker, four concurrent job
        // slots: every port must still build exactly once even though
        // several job slots hit the same sandbox at once.
        let ports: Vec<(&str, &str)> = (0..10)
            .map(|i| (Box::leak(format!("devel/leaf{i}").into_boxed_str()) as &str, ""))
            .collect();
        let h = build_harness(&ports);

        let root_specs: Vec<_> = ports
            .iter()
            .map(|(id, _)| resolver::parse_root_spec(id).unwrap())
            .collect();
        resolver::resolve(&root_specs, &h.config.ports_root, h.config.max_workers, &h.packages, &h.build_states);
        let ordered = topo::order(&h.packages.all());

        let mut config = h.config.clone();
        config.max_workers = 1;
        config.max_jobs_per_worker = 4;

        let scheduler = Scheduler {
            config: &config,
            ports_root: &config.ports_root,
            packages: &h.packages,
            build_states: &h.build_states,
            db: &h.db,
            executor: Arc::new(NoopPhaseExecutor),
            event_sink: Arc::new(TracingEventSink),
            cancel: CancellationToken::new(),
        };
        let base = config.build_base.clone();
        let summary = scheduler
            .run(&ordered, move |worker_id| -> Box<dyn Environment> {
                Box::new(MockEnvironment::new(base.join(format!("SL{worker_id:02}"))))
            })
            .unwrap();

        assert_eq!(summary.total, 10);
        assert_eq!(summary.success, 10);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.skipped, 0);
    }
}
