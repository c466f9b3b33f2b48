//! Deterministic dependency ordering of manifest entries.

use std::collections::{BTreeSet, HashMap};

use super::FileManifestEntry;

/// Kahn's algorithm over `depends_on`, ties broken by declaration order.
///
/// Dependencies on paths outside the manifest are ignored. When a cycle is
/// detected the entries are returned in declaration order instead.
pub fn topological_sort(entries: &[FileManifestEntry]) -> Vec<FileManifestEntry> {
    let index: HashMap<&str, usize> = entries
        .iter()
        .enumerate()
        .map(|(i, e)| (e.path.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; entries.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); entries.len()];
    for (i, entry) in entries.iter().enumerate() {
        let mut deps = BTreeSet::new();
        for dep in &entry.depends_on {
            if let Some(&j) = index.get(dep.as_str())
                && j != i
            {
                deps.insert(j);
            }
        }
        in_degree[i] = deps.len();
        for j in deps {
            dependents[j].push(i);
        }
    }

    // Ready set keyed by declaration index keeps the output deterministic.
    let mut ready: BTreeSet<usize> = (0..entries.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(entries.len());
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &k in &dependents[i] {
            in_degree[k] -= 1;
            if in_degree[k] == 0 {
                ready.insert(k);
            }
        }
    }

    if order.len() != entries.len() {
        tracing::warn!(
            entries = entries.len(),
            sorted = order.len(),
            "dependency cycle in manifest, using declaration order"
        );
        return entries.to_vec();
    }
    order.into_iter().map(|i| entries[i].clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::FileAction;

    fn entry(path: &str, deps: &[&str]) -> FileManifestEntry {
        FileManifestEntry::new(path, FileAction::Create, "")
            .unwrap()
            .with_depends_on(deps)
    }

    fn paths(entries: &[FileManifestEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.path.as_str()).collect()
    }

    #[test]
    fn test_simple_chain() {
        let manifest: Vec<FileManifestEntry> = serde_json::from_str(
            r#"[{"path":"a.py","action":"create","depends_on":[]},
                {"path":"b.py","action":"create","depends_on":["a.py"]}]"#,
        )
        .unwrap();
        assert_eq!(paths(&topological_sort(&manifest)), vec!["a.py", "b.py"]);
    }

    #[test]
    fn test_dependency_declared_later_moves_first() {
        let manifest = vec![
            entry("app/main.py", &["app/config.py", "app/db.py"]),
            entry("app/db.py", &["app/config.py"]),
            entry("app/config.py", &[]),
        ];
        assert_eq!(
            paths(&topological_sort(&manifest)),
            vec!["app/config.py", "app/db.py", "app/main.py"]
        );
    }

    #[test]
    fn test_independent_entries_keep_declaration_order() {
        let manifest = vec![entry("z.py", &[]), entry("a.py", &[]), entry("m.py", &[])];
        assert_eq!(paths(&topological_sort(&manifest)), vec!["z.py", "a.py", "m.py"]);
    }

    #[test]
    fn test_unknown_dependencies_ignored() {
        let manifest = vec![entry("b.py", &["requirements.txt"]), entry("a.py", &[])];
        assert_eq!(paths(&topological_sort(&manifest)), vec!["b.py", "a.py"]);
    }

    #[test]
    fn test_cycle_falls_back_to_declaration_order() {
        let manifest = vec![
            entry("a.py", &["c.py"]),
            entry("b.py", &["a.py"]),
            entry("c.py", &["b.py"]),
            entry("d.py", &[]),
        ];
        let sorted = topological_sort(&manifest);
        assert_eq!(sorted.len(), manifest.len());
        assert_eq!(paths(&sorted), vec!["a.py", "b.py", "c.py", "d.py"]);
    }

    #[test]
    fn test_sorted_output_respects_every_dependency() {
        let manifest = vec![
            entry("e.py", &["d.py", "b.py"]),
            entry("d.py", &["c.py"]),
            entry("c.py", &["a.py"]),
            entry("b.py", &["a.py"]),
            entry("a.py", &[]),
        ];
        let sorted = topological_sort(&manifest);
        let position: HashMap<&str, usize> = sorted
            .iter()
            .enumerate()
            .map(|(i, e)| (e.path.as_str(), i))
            .collect();
        for e in &sorted {
            for dep in &e.depends_on {
                assert!(position[dep.as_str()] < position[e.path.as_str()]);
            }
        }
    }
}
