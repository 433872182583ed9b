use std::fs;
use std::path::Path;

use crate::error::{OrchestratorError, Result};
use crate::model::synthetic_pkg_filename;

#[derive(Debug, Clone, Default)]
pub struct RawMetadata {
    pub pkg_name: String,
    pub version: String,
    pub pkgfile: String,
    pub fetch_deps: String,
    pub extract_deps: String,
    pub patch_deps: String,
    pub build_deps: String,
    pub lib_deps: String,
    pub run_deps: String,
    pub ignore_reason: String,
}

const MAKEFILE_VARS: &str = "Makefile";

pub fn query(ports_root: &Path, category: &str, name: &str, _flavor: &str) -> Result<RawMetadata> {
    let port_dir = ports_root.join(category).join(name);
    if !port_dir.is_dir() {
        return Err(OrchestratorError::PortNotFound {
            port_id: crate::model::canonical_port_id(category, name, _flavor),
        });
    }

    let makefile_path = port_dir.join(MAKEFILE_VARS);
    let contents = match fs::read_to_string(&makefile_path) {
        Ok(c) => c,
        Err(_) => {
            // No parsable description at all: corrupt, but still a real
            // directory, so the caller still gets a Package back (flagged).
            return Ok(RawMetadata {
                pkg_name: name.to_string(),
                version: String::new(),
                pkgfile: String::new(),
                ignore_reason: String::new(),
                ..Default::default()
            });
        }
    };

    let vars = parse_var_assignments(&contents);

    let version = vars.get("VERSION").cloned().unwrap_or_default();
    let pkg_name = vars.get("PKGNAME").cloned().unwrap_or_else(|| name.to_string());
    // An explicit `PKGFILE=` line (even blank) marks a meta port: no
    // artefact, dependencies only. Absence of the key means "derive it".
    let pkgfile = match vars.get("PKGFILE") {
        Some(explicit) => explicit.clone(),
        None if version.is_empty() => String::new(),
        None => synthetic_pkg_filename(&pkg_name, &version),
    };

    Ok(RawMetadata {
        pkg_name,
        version,
        pkgfile,
        fetch_deps: vars.get("FETCH_DEPENDS").cloned().unwrap_or_default(),
        extract_deps: vars.get("EXTRACT_DEPENDS").cloned().unwrap_or_default(),
        patch_deps: vars.get("PATCH_DEPENDS").cloned().unwrap_or_default(),
        build_deps: vars.get("BUILD_DEPENDS").cloned().unwrap_or_default(),
        lib_deps: vars.get("LIB_DEPENDS").cloned().unwrap_or_default(),
        run_deps: vars.get("RUN_DEPENDS").cloned().unwrap_or_default(),
        ignore_reason: vars.get("IGNORE").cloned().unwrap_or_default(),
    })
}

fn parse_var_assignments(contents: &str) -> std::collections::HashMap<String, String> {
    let mut vars = std::collections::HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        vars.insert(key.trim().to_string(), value.trim().to_string());
    }
    vars
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_port(root: &Path, category: &str, name: &str, makefile: &str) {
        let dir = root.join(category).join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("Makefile"), makefile).unwrap();
    }

    #[test]
    fn queries_basic_fields() {
        let tmp = tempdir().unwrap();
        write_port(
            tmp.path(),
            "devel",
            "foo",
            "VERSION=1.2.3\nBUILD_DEPENDS=bar:/usr/ports/devel/bar\n",
        );
        let meta = query(tmp.path(), "devel", "foo", "").unwrap();
        assert_eq!(meta.version, "1.2.3");
        assert_eq!(meta.pkgfile, "foo-1.2.3.pkg");
        assert_eq!(meta.build_deps, "bar:/usr/ports/devel/bar");
    }

    #[test]
    fn missing_directory_is_not_found() {
        let tmp = tempdir().unwrap();
        let err = query(tmp.path(), "devel", "missing", "").unwrap_err();
        assert!(matches!(err, OrchestratorError::PortNotFound { .. }));
    }

    #[test]
    fn ignore_reason_is_surfaced() {
        let tmp = tempdir().unwrap();
        write_port(
            tmp.path(),
            "devel",
            "broken",
            "VERSION=1.0\nIGNORE=does not build on this architecture\n",
        );
        let meta = query(tmp.path(), "devel", "broken", "").unwrap();
        assert_eq!(meta.ignore_reason, "does not build on this architecture");
    }

    #[test]
    fn pkgfile_is_synthesized_when_absent() {
        let tmp = tempdir().unwrap();
        write_port(tmp.path(), "devel", "regular", "VERSION=1.0\n");
        let meta = query(tmp.path(), "devel", "regular", "").unwrap();
        assert_eq!(meta.pkgfile, "regular-1.0.pkg");
    }

    #[test]
    fn explicit_blank_pkgfile_marks_meta_port() {
        let tmp = tempdir().unwrap();
        write_port(tmp.path(), "devel", "metagroup", "VERSION=1.0\nPKGFILE=\n");
        let meta = query(tmp.path(), "devel", "metagroup", "").unwrap();
        assert!(meta.pkgfile.is_empty());
    }
}
