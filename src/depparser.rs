use crate::model::ParsedDependency;

pub fn parse_dependency_string(raw: &str, ports_root: &str) -> Vec<ParsedDependency> {
    let mut out: Vec<ParsedDependency> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for entry in raw.split_whitespace() {
        let Some(parsed) = parse_one_entry(entry, ports_root) else {
            continue;
        };
        if seen.insert(parsed.port_id.clone()) {
            out.push(parsed);
        }
    }

    out
}

fn parse_one_entry(entry: &str, ports_root: &str) -> Option<ParsedDependency> {
    let (lhs, origin) = entry.split_once(':')?;

    if lhs.starts_with("/nonexistent") {
        return None;
    }

    let mut origin = origin;
    if !ports_root.is_empty() {
        if let Some(stripped) = origin.strip_prefix(ports_root) {
            origin = stripped;
        }
    }
    origin = origin.trim_start_matches('/');

    // Strip a trailing ":tag" suffix by truncating at the last colon.
    let origin = match origin.rfind(':') {
        Some(idx) => &origin[..idx],
        None => origin,
    };

    let mut parts = origin.splitn(2, '/');
    let category = parts.next()?;
    let rest = parts.next()?;
    if category.is_empty() || rest.is_empty() {
        return None;
    }
    // rest must not contain another '/', category/name[@flavor] only.
    if rest.contains('/') {
        return None;
    }

    let (name, flavor) = match rest.split_once('@') {
        Some((n, f)) => (n, f),
        None => (rest, ""),
    };
    if name.is_empty() {
        return None;
    }

    let port_id = crate::model::canonical_port_id(category, name, flavor);
    Some(ParsedDependency {
        category: category.to_string(),
        name: name.to_string(),
        flavor: flavor.to_string(),
        port_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_entries() {
        let deps = parse_dependency_string(
            "pkgconfig:/usr/ports/devel/pkgconf zlib:/usr/ports/archivers/zlib",
            "/usr/ports",
        );
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[0].port_id, "devel/pkgconf");
        assert_eq!(deps[1].port_id, "archivers/zlib");
    }

    #[test]
    fn drops_nonexistent_entries() {
        let deps = parse_dependency_string("foo:/nonexistent/devel/foo", "/usr/ports");
        assert!(deps.is_empty());
    }

    #[test]
    fn strips_trailing_tag_suffix() {
        let deps =
            parse_dependency_string("bash:/usr/ports/shells/bash:tag1", "/usr/ports");
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].port_id, "shells/bash");
    }

    #[test]
    fn parses_flavor_suffix() {
        let deps = parse_dependency_string(
            "py-foo:/usr/ports/devel/py-foo@py311",
            "/usr/ports",
        );
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].category, "devel");
        assert_eq!(deps[0].name, "py-foo");
        assert_eq!(deps[0].flavor, "py311");
        assert_eq!(deps[0].port_id, "devel/py-foo@py311");
    }

    #[test]
    fn deduplicates_preserving_order() {
        let deps = parse_dependency_string(
            "a:/usr/ports/devel/a b:/usr/ports/devel/a c:/usr/ports/devel/b",
            "/usr/ports",
        );
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[0].port_id, "devel/a");
        assert_eq!(deps[1].port_id, "devel/b");
    }

    #[test]
    fn skips_malformed_entries() {
        let deps = parse_dependency_string("noorigin justtext", "/usr/ports");
        assert!(deps.is_empty());
    }
}
