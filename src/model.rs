use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DepKind {
    Fetch = 1,
    Extract = 2,
    Patch = 3,
    Build = 4,
    Lib = 5,
    Run = 6,
}

impl DepKind {
    pub const ALL: [DepKind; 6] = [
        DepKind::Fetch,
        DepKind::Extract,
        DepKind::Patch,
        DepKind::Build,
        DepKind::Lib,
        DepKind::Run,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $repr:ty {
            $(const $flag:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name(pub $repr);

        impl $name {
            $(pub const $flag: $name = $name($value);)*

            pub const NONE: $name = $name(0);

            pub fn contains(self, other: $name) -> bool {
                (self.0 & other.0) == other.0
            }

            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: $name) {
                self.0 &= !other.0;
            }

            pub fn intersects(self, other: $name) -> bool {
                (self.0 & other.0) != 0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }
    };
}

bitflags_like! {
    pub struct PackageFlags: u32 {
        const MANUAL_SEL       = 1 << 0;
        const META             = 1 << 1;
        const IGNORED          = 1 << 2;
        const NO_BUILD_IGNORE  = 1 << 3;
        const NOT_FOUND        = 1 << 4;
        const CORRUPT          = 1 << 5;
        const SUCCESS          = 1 << 6;
        const FAILED           = 1 << 7;
        const SKIPPED          = 1 << 8;
        const RUNNING          = 1 << 9;
        const PACKAGED         = 1 << 10;
        const PKG_PKG          = 1 << 11;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Edge {
    pub port_id: String,
    pub kind: DepKind,
}

#[derive(Debug)]
pub struct Package {
    pub port_id: String,
    pub category: String,
    pub name: String,
    pub flavor: String,
    pub version: String,
    pub pkg_filename: String,

    pub raw_fetch_deps: String,
    pub raw_extract_deps: String,
    pub raw_patch_deps: String,
    pub raw_build_deps: String,
    pub raw_lib_deps: String,
    pub raw_run_deps: String,

    depends_on: RwLock<Vec<Edge>>,
    dependents: RwLock<Vec<Edge>>,

    dependent_count: AtomicU32,
    max_depth: AtomicU64,
    max_depth_computed: std::sync::atomic::AtomicBool,
}

impl Package {
    pub fn new(category: &str, name: &str, flavor: &str) -> Self {
        let port_id = canonical_port_id(category, name, flavor);
        Package {
            port_id,
            category: category.to_string(),
            name: name.to_string(),
            flavor: flavor.to_string(),
            version: String::new(),
            pkg_filename: String::new(),
            raw_fetch_deps: String::new(),
            raw_extract_deps: String::new(),
            raw_patch_deps: String::new(),
            raw_build_deps: String::new(),
            raw_lib_deps: String::new(),
            raw_run_deps: String::new(),
            depends_on: RwLock::new(Vec::new()),
            dependents: RwLock::new(Vec::new()),
            dependent_count: AtomicU32::new(0),
            max_depth: AtomicU64::new(0),
            max_depth_computed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn raw_deps(&self, kind: DepKind) -> &str {
        match kind {
            DepKind::Fetch => &self.raw_fetch_deps,
            DepKind::Extract => &self.raw_extract_deps,
            DepKind::Patch => &self.raw_patch_deps,
            DepKind::Build => &self.raw_build_deps,
            DepKind::Lib => &self.raw_lib_deps,
            DepKind::Run => &self.raw_run_deps,
        }
    }

    pub fn add_depends_on(&self, target: &str, kind: DepKind) -> bool {
        let mut edges = self.depends_on.write().expect("depends_on lock poisoned");
        if edges.iter().any(|e| e.port_id == target && e.kind == kind) {
            return false;
        }
        edges.push(Edge {
            port_id: target.to_string(),
            kind,
        });
        true
    }

    pub fn add_dependent(&self, source: &str, kind: DepKind) -> bool {
        let mut edges = self.dependents.write().expect("dependents lock poisoned");
        if edges.iter().any(|e| e.port_id == source && e.kind == kind) {
            return false;
        }
        edges.push(Edge {
            port_id: source.to_string(),
            kind,
        });
        self.dependent_count.fetch_add(1, Ordering::SeqCst);
        true
    }

    pub fn depends_on(&self) -> Vec<Edge> {
        self.depends_on.read().expect("depends_on lock poisoned").clone()
    }

    pub fn dependents(&self) -> Vec<Edge> {
        self.dependents.read().expect("dependents lock poisoned").clone()
    }

    pub fn dependent_count(&self) -> u32 {
        self.dependent_count.load(Ordering::SeqCst)
    }

    pub fn max_depth(&self) -> u64 {
        self.max_depth.load(Ordering::SeqCst)
    }

    pub fn set_max_depth(&self, depth: u64) {
        self.max_depth.store(depth, Ordering::SeqCst);
        self.max_depth_computed.store(true, Ordering::SeqCst);
    }

    pub fn max_depth_computed(&self) -> bool {
        self.max_depth_computed.load(Ordering::SeqCst)
    }
}

pub fn canonical_port_id(category: &str, name: &str, flavor: &str) -> String {
    if flavor.is_empty() {
        format!("{category}/{name}")
    } else {
        format!("{category}/{name}@{flavor}")
    }
}

pub fn synthetic_pkg_filename(name: &str, version: &str) -> String {
    format!("{name}-{version}.pkg")
}

#[derive(Debug, Default)]
pub struct BuildState {
    pub flags: Mutex<PackageFlags>,
    pub ignore_reason: Mutex<String>,
    pub last_phase: Mutex<String>,
    pub build_uuid: Mutex<Option<uuid::Uuid>>,
}

impl BuildState {
    pub fn new() -> Self {
        BuildState::default()
    }

    pub fn flags(&self) -> PackageFlags {
        *self.flags.lock().expect("flags lock poisoned")
    }

    pub fn add_flags(&self, flags: PackageFlags) {
        self.flags.lock().expect("flags lock poisoned").insert(flags);
    }

    pub fn clear_flags(&self, flags: PackageFlags) {
        self.flags.lock().expect("flags lock poisoned").remove(flags);
    }

    pub fn test_flags(&self, flags: PackageFlags) -> bool {
        self.flags().intersects(flags)
    }

    pub fn set_ignore_reason(&self, reason: &str) {
        *self.ignore_reason.lock().expect("ignore_reason lock poisoned") = reason.to_string();
    }

    pub fn ignore_reason(&self) -> String {
        self.ignore_reason.lock().expect("ignore_reason lock poisoned").clone()
    }

    pub fn set_last_phase(&self, phase: &str) {
        *self.last_phase.lock().expect("last_phase lock poisoned") = phase.to_string();
    }

    pub fn last_phase(&self) -> String {
        self.last_phase.lock().expect("last_phase lock poisoned").clone()
    }

    pub fn set_build_uuid(&self, id: uuid::Uuid) {
        *self.build_uuid.lock().expect("build_uuid lock poisoned") = Some(id);
    }

    pub fn build_uuid(&self) -> Option<uuid::Uuid> {
        *self.build_uuid.lock().expect("build_uuid lock poisoned")
    }

    pub fn reset(&self) {
        *self.flags.lock().expect("flags lock poisoned") = PackageFlags::NONE;
        self.ignore_reason.lock().expect("ignore_reason lock poisoned").clear();
        self.last_phase.lock().expect("last_phase lock poisoned").clear();
        *self.build_uuid.lock().expect("build_uuid lock poisoned") = None;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDependency {
    pub category: String,
    pub name: String,
    pub flavor: String,
    pub port_id: String,
}

