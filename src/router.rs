//! Subscription registry: which client subscribed to which filter at
//! which granted QoS.

use std::str::FromStr;
use std::sync::Arc;

use itertools::Itertools;
use tokio::sync::RwLock;

use crate::topic::Topic;
use crate::trie::TopicTree;
use crate::types::{ClientId, DashMap, HashMap, Id, QoS, TopicFilter, TopicName};
use crate::utils::Counter;
use crate::Result;

/// In-memory subscription router.
///
/// The trie answers "which filters match this topic", the relations table
/// answers "who subscribed to this filter"; both are updated together.
#[derive(Clone)]
pub struct DefaultRouter {
    topics: Arc<RwLock<TopicTree<()>>>,
    relations: Arc<DashMap<TopicFilter, HashMap<ClientId, (Id, QoS)>>>,
    topics_count: Counter,
    relations_count: Counter,
}

impl Default for DefaultRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultRouter {
    pub fn new() -> Self {
        Self {
            topics: Arc::new(RwLock::new(TopicTree::default())),
            relations: Arc::new(DashMap::default()),
            topics_count: Counter::new(),
            relations_count: Counter::new(),
        }
    }

    /// Registers a subscription, replacing any previous grant the same
    /// client held on this filter.
    pub async fn add(&self, topic_filter: &str, id: Id, qos: QoS) -> Result<()> {
        let topic = Topic::from_str(topic_filter)?;
        // Filter liveness is decided and the trie updated under one trie
        // write lock, here and in `remove`, so the two structures cannot
        // diverge. Relations guards are scoped: never held across an await.
        let mut topics = self.topics.write().await;
        let (new_filter, replaced) = {
            let mut entry = self.relations.entry(TopicFilter::from(topic_filter.to_owned())).or_default();
            let new_filter = entry.is_empty();
            let old = entry.insert(id.client_id.clone(), (id, qos));
            (new_filter, old.is_some())
        };
        if new_filter {
            topics.insert(&topic, ());
            self.topics_count.inc();
        }
        if !replaced {
            self.relations_count.inc();
        }
        Ok(())
    }

    /// Removes one client's subscription. A mismatched `Id` is left alone:
    /// it belongs to a newer session of the same client id.
    ///
    /// Returns false when there was nothing to remove.
    pub async fn remove(&self, topic_filter: &str, id: &Id) -> Result<bool> {
        let topic = Topic::from_str(topic_filter)?;
        // Same lock discipline as `add`.
        let mut topics = self.topics.write().await;
        let mut removed = false;
        let mut relations_empty = false;
        if let Some(mut entry) = self.relations.get_mut(topic_filter) {
            let client_id: &str = &id.client_id;
            let same_session = matches!(entry.get(client_id), Some((stored, _)) if stored == id);
            if same_session {
                entry.remove(client_id);
                self.relations_count.dec();
                removed = true;
                relations_empty = entry.is_empty();
            }
        }
        if relations_empty && self.relations.remove_if(topic_filter, |_, v| v.is_empty()).is_some() {
            topics.remove(&topic, &());
            self.topics_count.dec();
        }
        Ok(removed)
    }

    /// Removes every subscription held by `id`, with the same stale-session
    /// guard as [`remove`](Self::remove).
    pub async fn remove_client(&self, id: &Id) -> Result<()> {
        let client_id: &str = &id.client_id;
        let filters = self
            .relations
            .iter()
            .filter(|entry| matches!(entry.value().get(client_id), Some((stored, _)) if stored == id))
            .map(|entry| entry.key().clone())
            .collect_vec();
        for topic_filter in filters {
            self.remove(&topic_filter, id).await?;
        }
        Ok(())
    }

    /// All subscribers whose filters match `topic`. A client holding
    /// several overlapping filters appears once, at the highest granted
    /// QoS among them.
    pub async fn matches(&self, topic: &TopicName) -> Result<Vec<(TopicFilter, Id, QoS)>> {
        let topic = Topic::from_str(topic)?;
        let mut subs: HashMap<ClientId, (TopicFilter, Id, QoS)> = HashMap::default();
        let filters = {
            let topics = self.topics.read().await;
            topics.matches(&topic).into_iter().map(|(f, _)| f).collect_vec()
        };
        for filter in filters {
            let filter = TopicFilter::from(filter.to_string());
            if let Some(entry) = self.relations.get(&filter) {
                for (client_id, (id, qos)) in entry.iter() {
                    subs.entry(client_id.clone())
                        .and_modify(|(f, _, granted)| {
                            if *qos > *granted {
                                *granted = *qos;
                                *f = filter.clone();
                            }
                        })
                        .or_insert_with(|| (filter.clone(), id.clone(), *qos));
                }
            }
        }
        Ok(subs.into_values().collect_vec())
    }

    #[inline]
    pub fn relations_count(&self) -> isize {
        self.relations_count.count()
    }

    #[inline]
    pub fn topics_count(&self) -> isize {
        self.topics_count.count()
    }
}
