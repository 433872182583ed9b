use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::model::{BuildState, Package};

#[derive(Default)]
pub struct PackageRegistry {
    packages: RwLock<HashMap<String, Arc<Package>>>,
}

impl PackageRegistry {
    pub fn new() -> Self {
        PackageRegistry::default()
    }

    pub fn insert_or_get(&self, port_id: &str, make: impl FnOnce() -> Package) -> Arc<Package> {
        if let Some(existing) = self.find(port_id) {
            return existing;
        }
        let mut packages = self.packages.write().expect("package registry lock poisoned");
        // Re-check under the write lock: another thread may have won the race.
        if let Some(existing) = packages.get(port_id) {
            return Arc::clone(existing);
        }
        let pkg = Arc::new(make());
        packages.insert(port_id.to_string(), Arc::clone(&pkg));
        pkg
    }

    pub fn find(&self, port_id: &str) -> Option<Arc<Package>> {
        self.packages
            .read()
            .expect("package registry lock poisoned")
            .get(port_id)
            .cloned()
    }

    pub fn contains(&self, port_id: &str) -> bool {
        self.packages.read().expect("package registry lock poisoned").contains_key(port_id)
    }

    pub fn all(&self) -> Vec<Arc<Package>> {
        self.packages
            .read()
            .expect("package registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.packages.read().expect("package registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct BuildStateRegistry {
    states: RwLock<HashMap<String, Arc<BuildState>>>,
}

impl BuildStateRegistry {
    pub fn new() -> Self {
        BuildStateRegistry::default()
    }

    pub fn get_or_create(&self, port_id: &str) -> Arc<BuildState> {
        if let Some(existing) = self.get(port_id) {
            return existing;
        }
        let mut states = self.states.write().expect("build state registry lock poisoned");
        if let Some(existing) = states.get(port_id) {
            return Arc::clone(existing);
        }
        let state = Arc::new(BuildState::new());
        states.insert(port_id.to_string(), Arc::clone(&state));
        state
    }

    pub fn get(&self, port_id: &str) -> Option<Arc<BuildState>> {
        self.states
            .read()
            .expect("build state registry lock poisoned")
            .get(port_id)
            .cloned()
    }

    pub fn reset(&self, port_id: &str) {
        if let Some(state) = self.get(port_id) {
            state.reset();
        }
    }

    pub fn reset_all(&self) {
        let states = self.states.read().expect("build state registry lock poisoned");
        for state in states.values() {
            state.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PackageFlags;

    #[test]
    fn insert_or_get_returns_same_instance_on_duplicate() {
        let registry = PackageRegistry::new();
        let first = registry.insert_or_get("devel/foo", || Package::new("devel", "foo", ""));
        let second = registry.insert_or_get("devel/foo", || panic!("must not rebuild"));
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn build_state_is_independent_per_package() {
        let registry = BuildStateRegistry::new();
        let a = registry.get_or_create("devel/a");
        let b = registry.get_or_create("devel/b");
        a.add_flags(PackageFlags::RUNNING);
        assert!(a.test_flags(PackageFlags::RUNNING));
        assert!(!b.test_flags(PackageFlags::RUNNING));
    }

    #[test]
    fn reset_clears_flags_and_uuid() {
        let registry = BuildStateRegistry::new();
        let state = registry.get_or_create("devel/a");
        state.add_flags(PackageFlags::SUCCESS);
        state.set_build_uuid(uuid::Uuid::new_v4());
        registry.reset("devel/a");
        assert_eq!(state.flags(), PackageFlags::NONE);
        assert!(state.build_uuid().is_none());
    }
}
