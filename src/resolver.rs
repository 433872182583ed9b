use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::depparser::parse_dependency_string;
use crate::metadata;
use crate::model::{DepKind, Package, PackageFlags};
use crate::registry::{BuildStateRegistry, PackageRegistry};

#[derive(Debug, Clone)]
pub struct RootSpec {
    pub category: String,
    pub name: String,
    pub flavor: String,
}

impl RootSpec {
    pub fn port_id(&self) -> String {
        crate::model::canonical_port_id(&self.category, &self.name, &self.flavor)
    }
}

pub fn parse_root_spec(spec: &str) -> Option<RootSpec> {
    let (rest, flavor) = match spec.split_once('@') {
        Some((r, f)) => (r, f),
        None => (spec, ""),
    };
    let (category, name) = rest.split_once('/')?;
    if category.is_empty() || name.is_empty() || name.contains('/') {
        return None;
    }
    Some(RootSpec {
        category: category.to_string(),
        name: name.to_string(),
        flavor: flavor.to_string(),
    })
}

pub struct ResolveOutcome {
    pub roots: Vec<String>,
}

pub fn resolve(
    root_specs: &[RootSpec],
    ports_root: &Path,
    worker_count: usize,
    packages: &PackageRegistry,
    build_states: &BuildStateRegistry,
) -> ResolveOutcome {
    let mut seen: HashSet<String> = HashSet::new();
    let mut frontier: VecDeque<RootSpec> = VecDeque::new();
    let mut roots = Vec::new();

    for spec in root_specs {
        let port_id = spec.port_id();
        if seen.insert(port_id.clone()) {
            frontier.push_back(spec.clone());
        }
        roots.push(port_id);
    }

    // Pass 1: BFS, batch-fetching metadata for each round's frontier on a
    // worker pool sized from configuration.
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(worker_count.max(1))
        .build()
        .expect("failed to build resolver worker pool");

    while !frontier.is_empty() {
        let batch: Vec<RootSpec> = frontier.drain(..).collect();

        let fetched: Vec<(RootSpec, crate::error::Result<metadata::RawMetadata>)> = pool.install(|| {
            batch
                .into_par_iter()
                .map(|spec| {
                    let result = metadata::query(ports_root, &spec.category, &spec.name, &spec.flavor);
                    (spec, result)
                })
                .collect()
        });

        let mut next_round: Vec<String> = Vec::new();

        for (spec, result) in fetched {
            let port_id = spec.port_id();
            let pkg = match result {
                Ok(raw) => {
                    let ignore_reason = raw.ignore_reason.clone();
                    let pkg = Package::new(&spec.category, &spec.name, &spec.flavor);
                    let pkg = apply_raw_metadata(pkg, raw);
                    let pkg = packages.insert_or_get(&port_id, move || pkg);
                    if !ignore_reason.is_empty() {
                        let state = build_states.get_or_create(&port_id);
                        state.add_flags(PackageFlags::IGNORED | PackageFlags::NO_BUILD_IGNORE);
                        state.set_ignore_reason(&ignore_reason);
                    }
                    pkg
                }
                Err(crate::error::OrchestratorError::PortNotFound { .. }) => {
                    debug!(port_id = %port_id, "metadata query: port not found");
                    let pkg = Package::new(&spec.category, &spec.name, &spec.flavor);
                    let pkg = packages.insert_or_get(&port_id, move || pkg);
                    build_states.get_or_create(&port_id).add_flags(PackageFlags::NOT_FOUND);
                    pkg
                }
                Err(err) => {
                    warn!(port_id = %port_id, error = %err, "metadata query failed");
                    let pkg = Package::new(&spec.category, &spec.name, &spec.flavor);
                    let pkg = packages.insert_or_get(&port_id, move || pkg);
                    build_states.get_or_create(&port_id).add_flags(PackageFlags::CORRUPT);
                    pkg
                }
            };

            build_states.get_or_create(&port_id);

            for kind in DepKind::ALL {
                let raw_dep_string = pkg.raw_deps(kind).to_string();
                if raw_dep_string.is_empty() {
                    continue;
                }
                for dep in parse_dependency_string(&raw_dep_string, ports_root.to_string_lossy().as_ref()) {
                    if seen.insert(dep.port_id.clone()) {
                        next_round.push(dep.port_id.clone());
                        frontier.push_back(RootSpec {
                            category: dep.category,
                            name: dep.name,
                            flavor: dep.flavor,
                        });
                    }
                }
            }
        }
    }

    // Pass 2: edge wiring.
    for pkg in packages.all() {
        for kind in DepKind::ALL {
            let raw_dep_string = pkg.raw_deps(kind).to_string();
            if raw_dep_string.is_empty() {
                continue;
            }
            for dep in parse_dependency_string(&raw_dep_string, ports_root.to_string_lossy().as_ref()) {
                if let Some(target) = packages.find(&dep.port_id) {
                    if pkg.add_depends_on(&dep.port_id, kind) {
                        target.add_dependent(&pkg.port_id, kind);
                    }
                } else {
                    debug!(
                        source = %pkg.port_id,
                        target = %dep.port_id,
                        "dependency target never registered; skipping edge"
                    );
                }
            }
        }
    }

    // Post-processing: memoised max_depth.
    let all: Vec<Arc<Package>> = packages.all();
    let mut memo: HashMap<String, u64> = HashMap::new();
    for pkg in &all {
        compute_max_depth(&pkg.port_id, packages, &mut memo, &mut HashSet::new());
    }
    for pkg in &all {
        if let Some(depth) = memo.get(&pkg.port_id) {
            pkg.set_max_depth(*depth);
        }
    }

    if let Some(pkgtool) = packages.find("ports-mgmt/pkg") {
        build_states.get_or_create(&pkgtool.port_id).add_flags(PackageFlags::PKG_PKG);
    }

    ResolveOutcome { roots }
}

fn apply_raw_metadata(mut pkg: Package, raw: metadata::RawMetadata) -> Package {
    pkg.version = raw.version;
    pkg.pkg_filename = raw.pkgfile;
    pkg.raw_fetch_deps = raw.fetch_deps;
    pkg.raw_extract_deps = raw.extract_deps;
    pkg.raw_patch_deps = raw.patch_deps;
    pkg.raw_build_deps = raw.build_deps;
    pkg.raw_lib_deps = raw.lib_deps;
    pkg.raw_run_deps = raw.run_deps;
    pkg
}

fn compute_max_depth(
    port_id: &str,
    packages: &PackageRegistry,
    memo: &mut HashMap<String, u64>,
    visiting: &mut HashSet<String>,
) -> u64 {
    if let Some(depth) = memo.get(port_id) {
        return *depth;
    }
    if !visiting.insert(port_id.to_string()) {
        return 0;
    }
    let Some(pkg) = packages.find(port_id) else {
        visiting.remove(port_id);
        return 0;
    };
    let dependents = pkg.dependents();
    let depth = if dependents.is_empty() {
        0
    } else {
        1 + dependents
            .iter()
            .map(|e| compute_max_depth(&e.port_id, packages, memo, visiting))
            .max()
            .unwrap_or(0)
    };
    visiting.remove(port_id);
    memo.insert(port_id.to_string(), depth);
    depth
}
