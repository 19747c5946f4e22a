//! Topic-filter trie.
//!
//! Filters are stored one level per node, so matching a published topic
//! walks at most `levels * wildcard-branches` nodes instead of scanning
//! every subscription. Values hang off the node of their filter's last
//! level.

use crate::topic::{Level, Topic};
use crate::types::HashMap;

#[derive(Debug, Clone)]
pub struct TopicTree<V> {
    root: Node<V>,
}

#[derive(Debug, Clone)]
struct Node<V> {
    values: Vec<V>,
    branches: HashMap<Level, Node<V>>,
}

impl<V> Default for Node<V> {
    fn default() -> Self {
        Self { values: Vec::new(), branches: HashMap::default() }
    }
}

impl<V> Default for TopicTree<V> {
    fn default() -> Self {
        Self { root: Node::default() }
    }
}

impl<V> TopicTree<V>
where
    V: Eq + Clone,
{
    pub fn insert(&mut self, topic_filter: &Topic, value: V) {
        let mut node = &mut self.root;
        for level in topic_filter.levels() {
            node = node.branches.entry(level.clone()).or_default();
        }
        if !node.values.contains(&value) {
            node.values.push(value);
        }
    }

    /// Removes one value from the filter's node, pruning branches left
    /// empty. Returns false when the pair was not present.
    pub fn remove(&mut self, topic_filter: &Topic, value: &V) -> bool {
        Self::_remove(&mut self.root, topic_filter.levels(), value)
    }

    fn _remove(node: &mut Node<V>, levels: &[Level], value: &V) -> bool {
        match levels.split_first() {
            None => {
                if let Some(pos) = node.values.iter().position(|v| v == value) {
                    node.values.remove(pos);
                    true
                } else {
                    false
                }
            }
            Some((first, rest)) => {
                if let Some(child) = node.branches.get_mut(first) {
                    let removed = Self::_remove(child, rest, value);
                    if child.values.is_empty() && child.branches.is_empty() {
                        node.branches.remove(first);
                    }
                    removed
                } else {
                    false
                }
            }
        }
    }

    /// All (filter, value) pairs whose filter matches the concrete `topic`.
    pub fn matches(&self, topic: &Topic) -> Vec<(Topic, V)> {
        let mut out = Vec::new();
        let mut path = Vec::new();
        Self::_matches(&self.root, topic.levels(), &mut path, true, &mut out);
        out
    }

    pub fn is_match(&self, topic: &Topic) -> bool {
        !self.matches(topic).is_empty()
    }

    fn _matches(node: &Node<V>, levels: &[Level], path: &mut Vec<Level>, top: bool, out: &mut Vec<(Topic, V)>) {
        // `#` matches its parent as well as every descendant; a top-level
        // wildcard never matches `$` topics.
        if let Some(child) = node.branches.get(&Level::MultiWildcard) {
            let metadata = top && matches!(levels.first(), Some(l) if l.is_metadata());
            if !metadata {
                path.push(Level::MultiWildcard);
                for v in &child.values {
                    out.push((Topic(path.clone()), v.clone()));
                }
                path.pop();
            }
        }
        match levels.split_first() {
            None => {
                for v in &node.values {
                    out.push((Topic(path.clone()), v.clone()));
                }
            }
            Some((first, rest)) => {
                if let Some(child) = node.branches.get(&Level::SingleWildcard) {
                    if !(top && first.is_metadata()) {
                        path.push(Level::SingleWildcard);
                        Self::_matches(child, rest, path, false, out);
                        path.pop();
                    }
                }
                if let Some(child) = node.branches.get(first) {
                    path.push(first.clone());
                    Self::_matches(child, rest, path, false, out);
                    path.pop();
                }
            }
        }
    }

    /// Total number of stored values.
    pub fn values_size(&self) -> usize {
        fn count<V>(node: &Node<V>) -> usize {
            node.values.len() + node.branches.values().map(count).sum::<usize>()
        }
        count(&self.root)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn tree(filters: &[(&str, &str)]) -> TopicTree<String> {
        let mut t = TopicTree::default();
        for (f, v) in filters {
            t.insert(&Topic::from_str(f).unwrap(), v.to_string());
        }
        t
    }

    fn match_values(t: &TopicTree<String>, topic: &str) -> Vec<String> {
        let mut vs = t
            .matches(&Topic::from_str(topic).unwrap())
            .into_iter()
            .map(|(_, v)| v)
            .collect::<Vec<_>>();
        vs.sort();
        vs
    }

    #[test]
    fn test_insert_match() {
        let t = tree(&[
            ("a/b/c", "exact"),
            ("a/+/c", "plus"),
            ("a/#", "hash"),
            ("a/b", "parent"),
        ]);
        assert_eq!(match_values(&t, "a/b/c"), vec!["exact", "hash", "plus"]);
        assert_eq!(match_values(&t, "a/b/x/c"), vec!["hash"]);
        assert_eq!(match_values(&t, "a/b"), vec!["hash", "parent"]);
        assert_eq!(match_values(&t, "a"), vec!["hash"]);
        assert!(match_values(&t, "b/c").is_empty());
    }

    #[test]
    fn test_matched_filter_paths() {
        let t = tree(&[("sensors/+/temp", "s1")]);
        let matched = t.matches(&Topic::from_str("sensors/room1/temp").unwrap());
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].0.to_string(), "sensors/+/temp");
    }

    #[test]
    fn test_metadata_topics() {
        let t = tree(&[("#", "all"), ("+/broker", "plus"), ("$SYS/#", "sys")]);
        assert_eq!(match_values(&t, "$SYS/broker"), vec!["sys"]);
        assert_eq!(match_values(&t, "app/broker"), vec!["all", "plus"]);
    }

    #[test]
    fn test_remove_prunes() {
        let mut t = tree(&[("a/b/c", "v1"), ("a/b/c", "v2"), ("a/b", "v3")]);
        let f = Topic::from_str("a/b/c").unwrap();
        assert!(t.remove(&f, &"v1".to_string()));
        assert!(!t.remove(&f, &"v1".to_string()));
        assert_eq!(match_values(&t, "a/b/c"), vec!["v2"]);
        assert!(t.remove(&f, &"v2".to_string()));
        assert_eq!(t.values_size(), 1);
        assert_eq!(match_values(&t, "a/b"), vec!["v3"]);
    }

    #[test]
    fn test_duplicate_insert() {
        let mut t = TopicTree::default();
        let f = Topic::from_str("x/y").unwrap();
        t.insert(&f, 1u32);
        t.insert(&f, 1u32);
        assert_eq!(t.values_size(), 1);
    }
}
