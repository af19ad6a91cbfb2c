//! Directed graph of observed path transitions
//!
//! Vertices are normalized request paths; each edge carries the number of
//! times a session jumped from the source path to the destination path.
//! The jump score of a transition is the edge count before the increment,
//! so a never-seen transition scores zero.

use std::collections::HashMap;

/// Weighted directed graph of navigation transitions.
pub struct PathGraph {
    adjacency: HashMap<String, HashMap<String, u64>>,
}

impl PathGraph {
    pub fn new() -> Self {
        Self {
            adjacency: HashMap::new(),
        }
    }

    /// Record a transition from `source` to `dest` and return the edge
    /// count as it was before this jump.
    pub fn add_jump(&mut self, source: &str, dest: &str) -> u64 {
        let source = normalize_path(source);
        let dest = normalize_path(dest);

        let count = self
            .adjacency
            .entry(source)
            .or_default()
            .entry(dest)
            .or_insert(0);
        *count += 1;

        *count - 1
    }

    /// All destinations reachable from `source` with their jump counts.
    pub fn destinations(&self, source: &str) -> HashMap<String, u64> {
        let source = normalize_path(source);
        self.adjacency.get(&source).cloned().unwrap_or_default()
    }

    /// Every unique path appearing in the graph, as source or destination.
    pub fn all_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = Vec::new();
        for (source, dests) in &self.adjacency {
            if !paths.contains(source) {
                paths.push(source.clone());
            }
            for dest in dests.keys() {
                if !paths.contains(dest) {
                    paths.push(dest.clone());
                }
            }
        }
        paths
    }
}

impl Default for PathGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Lowercase and ensure a leading slash. The empty path stays empty: it is
/// the entry vertex for sessions arriving with no known previous page.
fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }

    let lowered = path.to_lowercase();
    if lowered.starts_with('/') {
        lowered
    } else {
        format!("/{lowered}")
    }
}
