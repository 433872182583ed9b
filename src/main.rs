mod cli;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use portkiln::build_lock::{BuildSessionGuard, SessionAcquireOutcome};
use portkiln::db::BuildDatabase;
use portkiln::environment::{BsdChrootEnvironment, CancellationToken, Environment, MockEnvironment};
use portkiln::registry::{BuildStateRegistry, PackageRegistry};
use portkiln::resolver::{self, RootSpec};
use portkiln::scheduler::{NoopPhaseExecutor, Scheduler, TracingEventSink};
use portkiln::topo;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = cli::Cli::parse();

    let result = match cli.command {
        cli::Command::Build(args) => run(args, true),
        cli::Command::Plan(args) => run(args, false),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("portkiln: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: cli::BuildArgs, execute: bool) -> Result<()> {
    let config = args.effective_config();
    config
        .validate()
        .map_err(portkiln::OrchestratorError::ValidationError)?;

    let session = match BuildSessionGuard::acquire(&config.build_base)
        .context("failed to acquire build_base session lock")?
    {
        SessionAcquireOutcome::Owner(guard) => guard,
        SessionAcquireOutcome::HeldBy { pid, host, started_at } => {
            anyhow::bail!(
                "build_base {:?} is already in use by pid {pid} on {host} (since {started_at})",
                config.build_base
            );
        }
    };

    let root_specs: Vec<RootSpec> = args
        .packages
        .iter()
        .map(|s| {
            resolver::parse_root_spec(s).ok_or_else(|| portkiln::OrchestratorError::InvalidSpec { spec: s.clone() })
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if root_specs.is_empty() {
        return Err(portkiln::OrchestratorError::NoValidPorts.into());
    }

    let packages = PackageRegistry::new();
    let build_states = BuildStateRegistry::new();
    resolver::resolve(&root_specs, &config.ports_root, config.max_workers, &packages, &build_states);

    if packages.is_empty() {
        return Err(portkiln::OrchestratorError::NoValidPorts.into());
    }

    let all_packages = packages.all();
    let ordered = topo::order_strict(&all_packages).map_err(|e| {
        anyhow::Error::new(portkiln::OrchestratorError::CycleDetected {
            total: e.total,
            ordered: e.ordered,
        })
    })?;

    if !execute {
        println!("plan: {} port(s), build order:", ordered.len());
        for id in &ordered {
            println!("  {id}");
        }
        drop(session);
        return Ok(());
    }

    let db_path = args.effective_db_path(&config);
    let db = BuildDatabase::open(&db_path).context("failed to open build database")?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel()).context("failed to install SIGINT handler")?;
    }

    let scheduler = Scheduler {
        config: &config,
        ports_root: &config.ports_root,
        packages: &packages,
        build_states: &build_states,
        db: &db,
        executor: Arc::new(NoopPhaseExecutor),
        event_sink: Arc::new(TracingEventSink),
        cancel,
    };

    let mock_environment = args.mock_environment;
    let build_base = config.build_base.clone();
    let config_for_env = config.clone();
    let summary = scheduler.run(&ordered, move |worker_id| -> Box<dyn Environment> {
        if mock_environment {
            Box::new(MockEnvironment::new(build_base.join(format!("SL{worker_id:02}"))))
        } else {
            Box::new(BsdChrootEnvironment::new(worker_id, config_for_env.clone()))
        }
    })?;

    println!("{summary}");
    db.close().context("failed to flush build database")?;
    drop(session);
    Ok(())
}
