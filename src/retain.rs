//! Retained message store.
//!
//! One message is kept per topic; a subscriber receives the retained
//! messages of every topic its new filter matches. Publishing an empty
//! payload with the retain flag clears the topic.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::topic::{Level, Topic};
use crate::types::{HashMap, Retain, TopicFilter, TopicName};
use crate::utils::Counter;
use crate::Result;

#[async_trait]
pub trait RetainStorage: Sync + Send {
    /// Stores `retain` as the topic's retained message. An empty payload
    /// removes it instead.
    async fn set(&self, topic: &TopicName, retain: Retain) -> Result<()>;

    /// Retained messages of all topics matching `topic_filter`.
    async fn get(&self, topic_filter: &TopicFilter) -> Result<Vec<(TopicName, Retain)>>;

    async fn count(&self) -> isize;
}

pub struct DefaultRetainStorage {
    messages: Arc<RwLock<RetainTree<Retain>>>,
    retaineds_count: Counter,
}

impl Default for DefaultRetainStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultRetainStorage {
    pub fn new() -> Self {
        Self { messages: Arc::new(RwLock::new(RetainTree::default())), retaineds_count: Counter::new() }
    }
}

#[async_trait]
impl RetainStorage for DefaultRetainStorage {
    async fn set(&self, topic: &TopicName, retain: Retain) -> Result<()> {
        let topic = Topic::from_str(topic)?;
        let mut messages = self.messages.write().await;
        if retain.publish.payload.is_empty() {
            if messages.remove(&topic).is_some() {
                self.retaineds_count.dec();
            }
        } else if messages.insert(&topic, retain).is_none() {
            self.retaineds_count.inc();
        }
        Ok(())
    }

    async fn get(&self, topic_filter: &TopicFilter) -> Result<Vec<(TopicName, Retain)>> {
        let filter = Topic::from_str(topic_filter)?;
        let messages = self.messages.read().await;
        Ok(messages
            .matches(&filter)
            .into_iter()
            .map(|(topic, retain)| (TopicName::from(topic.to_string()), retain))
            .collect())
    }

    async fn count(&self) -> isize {
        self.retaineds_count.count()
    }
}

/// Tree of concrete topics, one optional value per node, queried by filter.
#[derive(Debug, Clone)]
pub struct RetainTree<V> {
    root: RetainNode<V>,
}

#[derive(Debug, Clone)]
struct RetainNode<V> {
    value: Option<V>,
    branches: HashMap<Level, RetainNode<V>>,
}

impl<V> Default for RetainNode<V> {
    fn default() -> Self {
        Self { value: None, branches: HashMap::default() }
    }
}

impl<V> Default for RetainTree<V> {
    fn default() -> Self {
        Self { root: RetainNode::default() }
    }
}

impl<V> RetainTree<V>
where
    V: Clone,
{
    /// Returns the replaced value, if the topic already carried one.
    pub fn insert(&mut self, topic: &Topic, value: V) -> Option<V> {
        let mut node = &mut self.root;
        for level in topic.levels() {
            node = node.branches.entry(level.clone()).or_default();
        }
        node.value.replace(value)
    }

    pub fn remove(&mut self, topic: &Topic) -> Option<V> {
        Self::_remove(&mut self.root, topic.levels())
    }

    fn _remove(node: &mut RetainNode<V>, levels: &[Level]) -> Option<V> {
        match levels.split_first() {
            None => node.value.take(),
            Some((first, rest)) => {
                let child = node.branches.get_mut(first)?;
                let removed = Self::_remove(child, rest);
                if child.value.is_none() && child.branches.is_empty() {
                    node.branches.remove(first);
                }
                removed
            }
        }
    }

    /// All (topic, value) pairs whose topic matches the filter.
    pub fn matches(&self, topic_filter: &Topic) -> Vec<(Topic, V)> {
        let mut out = Vec::new();
        let mut path = Vec::new();
        Self::_matches(&self.root, topic_filter.levels(), &mut path, true, &mut out);
        out
    }

    fn _matches(
        node: &RetainNode<V>,
        filter: &[Level],
        path: &mut Vec<Level>,
        top: bool,
        out: &mut Vec<(Topic, V)>,
    ) {
        match filter.split_first() {
            None => {
                if let Some(v) = &node.value {
                    out.push((Topic(path.clone()), v.clone()));
                }
            }
            Some((Level::MultiWildcard, _)) => Self::_collect(node, path, top, out),
            Some((Level::SingleWildcard, rest)) => {
                for (level, child) in node.branches.iter() {
                    if top && level.is_metadata() {
                        continue;
                    }
                    path.push(level.clone());
                    Self::_matches(child, rest, path, false, out);
                    path.pop();
                }
            }
            Some((first, rest)) => {
                // An explicit `$` level matches, only wildcards are barred.
                if let Some(child) = node.branches.get(first) {
                    path.push(first.clone());
                    Self::_matches(child, rest, path, false, out);
                    path.pop();
                }
            }
        }
    }

    /// `#` matches this node and everything below it.
    fn _collect(node: &RetainNode<V>, path: &mut Vec<Level>, top: bool, out: &mut Vec<(Topic, V)>) {
        if let Some(v) = &node.value {
            out.push((Topic(path.clone()), v.clone()));
        }
        for (level, child) in node.branches.iter() {
            if top && level.is_metadata() {
                continue;
            }
            path.push(level.clone());
            Self::_collect(child, path, false, out);
            path.pop();
        }
    }
}
