use std::collections::HashMap;
use std::sync::Arc;

use crate::model::Package;

#[derive(Debug, Clone)]
pub struct CycleError {
    pub total: usize,
    pub ordered: usize,
}

pub fn order(packages: &[Arc<Package>]) -> Vec<String> {
    order_inner(packages)
}

pub fn order_strict(packages: &[Arc<Package>]) -> Result<Vec<String>, CycleError> {
    let ordered = order_inner(packages);
    if ordered.len() < packages.len() {
        Err(CycleError {
            total: packages.len(),
            ordered: ordered.len(),
        })
    } else {
        Ok(ordered)
    }
}

fn order_inner(packages: &[Arc<Package>]) -> Vec<String> {
    let by_id: HashMap<&str, &Arc<Package>> =
        packages.iter().map(|p| (p.port_id.as_str(), p)).collect();

    let mut in_degree: HashMap<String, usize> = HashMap::new();
    for pkg in packages {
        in_degree.insert(pkg.port_id.clone(), pkg.depends_on().len());
    }

    let mut ready: Vec<String> = packages
        .iter()
        .filter(|p| in_degree.get(&p.port_id).copied().unwrap_or(0) == 0)
        .map(|p| p.port_id.clone())
        .collect();
    sort_ready(&mut ready, &by_id);

    let mut output = Vec::with_capacity(packages.len());

    while let Some(next_id) = ready.pop() {
        // `pop` takes the last element; keep the vector sorted ascending by
        // (fanout asc, depth asc, id desc) so the last element is the
        // highest-priority one per the contract below.
        output.push(next_id.clone());

        let Some(pkg) = by_id.get(next_id.as_str()) else {
            continue;
        };

        let mut newly_ready = Vec::new();
        for edge in pkg.dependents() {
            if let Some(count) = in_degree.get_mut(&edge.port_id) {
                *count -= 1;
                if *count == 0 {
                    newly_ready.push(edge.port_id.clone());
                }
            }
        }

        ready.extend(newly_ready);
        sort_ready(&mut ready, &by_id);
    }

    output
}

fn sort_ready(ready: &mut [String], by_id: &HashMap<&str, &Arc<Package>>) {
    ready.sort_by(|a, b| {
        let pa = by_id.get(a.as_str());
        let pb = by_id.get(b.as_str());
        let fanout_a = pa.map(|p| p.dependent_count()).unwrap_or(0);
        let fanout_b = pb.map(|p| p.dependent_count()).unwrap_or(0);
        let depth_a = pa.map(|p| p.max_depth()).unwrap_or(0);
        let depth_b = pb.map(|p| p.max_depth()).unwrap_or(0);
        fanout_a
            .cmp(&fanout_b)
            .then(depth_a.cmp(&depth_b))
            .then(b.cmp(a))
    });
}
