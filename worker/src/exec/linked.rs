use std::collections::HashSet;

use farmhand_castore::{DirectoriesIndex, Digest};
use regex::Regex;

/// Compiles link patterns so they only match whole relative paths.
pub fn compile_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<Regex>, regex::Error> {
    patterns
        .iter()
        .map(|pattern| Regex::new(&format!("^(?:{})$", pattern.as_ref())))
        .collect()
}

/// Walks the tree below `root` depth first and collects the relative paths
/// of all directories matching one of `patterns`.
/// Empty directories are reported but not descended into.
pub fn linked_directories(
    index: &DirectoriesIndex,
    root: &Digest,
    patterns: &[Regex],
) -> HashSet<String> {
    let mut linked = HashSet::new();
    if patterns.is_empty() {
        return linked;
    }

    let mut stack: Vec<(String, &Digest)> = vec![(String::new(), root)];
    while let Some((path, digest)) = stack.pop() {
        let Some(directory) = index.get(digest) else {
            continue;
        };

        for (name, digest) in directory.directories() {
            let child = if path.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", path, name)
            };

            if patterns.iter().any(|pattern| pattern.is_match(&child)) {
                linked.insert(child.clone());
            }

            if !digest.is_empty() {
                stack.push((child, digest));
            }
        }
    }

    linked
}
