//! Longest-prefix path trie used by the router
//!
//! Paths are split on `/` into segments; each trie edge is one segment.
//! A node may carry a value and a terminal flag. Lookup walks the request
//! path and returns the value of the deepest terminal node passed on the
//! way down, stopping at the first unmatched segment.

use std::collections::HashMap;

struct TrieNode<T> {
    children: HashMap<String, TrieNode<T>>,
    is_terminal: bool,
    path: String,
    value: Option<T>,
}

impl<T> TrieNode<T> {
    fn new() -> Self {
        Self {
            children: HashMap::new(),
            is_terminal: false,
            path: String::new(),
            value: None,
        }
    }
}

/// A segment trie mapping path prefixes to values.
pub struct Trie<T> {
    root: TrieNode<T>,
}

impl<T> Trie<T> {
    pub fn new() -> Self {
        Self {
            root: TrieNode::new(),
        }
    }

    /// Insert a value under the given path.
    ///
    /// Inserting `"/"` places the value on the root node itself.
    pub fn insert(&mut self, path: &str, value: T) {
        if path == "/" {
            self.root.path = path.to_string();
            self.root.value = Some(value);
            self.root.is_terminal = true;
            return;
        }

        let mut node = &mut self.root;
        for part in split_segments(path) {
            node = node
                .children
                .entry(part.to_string())
                .or_insert_with(TrieNode::new);
        }

        node.is_terminal = true;
        node.path = path.to_string();
        node.value = Some(value);
    }

    /// Find the value registered under the longest prefix of `path`.
    ///
    /// Returns the matched prefix and its value, or `None` when no terminal
    /// node lies on the descent.
    pub fn search(&self, path: &str) -> Option<(&str, &T)> {
        let mut node = &self.root;
        let mut last_match = if node.is_terminal {
            node.value.as_ref().map(|v| (node.path.as_str(), v))
        } else {
            None
        };

        for part in split_segments(path) {
            match node.children.get(part) {
                Some(child) => {
                    node = child;
                    if node.is_terminal {
                        last_match = node.value.as_ref().map(|v| (node.path.as_str(), v));
                    }
                }
                None => break,
            }
        }

        last_match
    }
}

impl<T> Default for Trie<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn split_segments(path: &str) -> impl Iterator<Item = &str> {
    path.trim_matches('/').split('/').filter(|s| !s.is_empty())
}
