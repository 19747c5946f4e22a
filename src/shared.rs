//! Connected-session registry and local fan-out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex, OwnedMutexGuard};

use crate::context::ServerContext;
use crate::hook::Hook as _;
use crate::packet::Publish;
use crate::session::Session;
use crate::types::{ClientId, DashMap, Id, Message, Reason, Tx};
use crate::{MqttError, Result};

pub struct EntryItem {
    pub session: Session,
    pub tx: Tx,
}

/// One entry per live connection, keyed by client id.
#[derive(Clone)]
pub struct DefaultShared {
    /// Serializes handshakes racing on the same client id.
    lockers: Arc<DashMap<ClientId, Arc<Mutex<()>>>>,
    peers: Arc<DashMap<ClientId, EntryItem>>,
}

impl Default for DefaultShared {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultShared {
    pub fn new() -> Self {
        Self { lockers: Arc::new(DashMap::default()), peers: Arc::new(DashMap::default()) }
    }

    /// Claims the per-client handshake lock without waiting. A second
    /// CONNECT racing the first is refused rather than queued.
    pub fn try_lock(&self, client_id: &ClientId) -> Result<OwnedMutexGuard<()>, MqttError> {
        let locker = self
            .lockers
            .entry(client_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        locker.try_lock_owned().map_err(|_| MqttError::ServiceUnavailable)
    }

    /// Evicts the live session of `client_id`, waiting until it has
    /// cleared all broker-side state. Returns false when there was none.
    pub async fn kick(&self, client_id: &ClientId, by: &Id) -> Result<bool> {
        let tx = self.peers.get(client_id).map(|e| e.tx.clone());
        let Some(tx) = tx else {
            return Ok(false);
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if tx.unbounded_send(Message::Kick(ack_tx, by.clone())).is_err() {
            // mailbox already gone, drop the stale entry
            self.peers.remove_if(client_id, |_, e| e.tx.is_closed());
            return Ok(false);
        }
        match tokio::time::timeout(Duration::from_secs(5), ack_rx).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(_)) => Ok(false),
            Err(_) => {
                log::warn!("{by} kick timeout, client_id: {client_id}");
                Ok(false)
            }
        }
    }

    /// Asks one session to shut down, waiting up to `timeout` for its
    /// teardown. Used during broker close.
    pub async fn close_session(&self, client_id: &ClientId, timeout: Duration) -> bool {
        let tx = self.peers.get(client_id).map(|e| e.tx.clone());
        let Some(tx) = tx else {
            return false;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if tx.unbounded_send(Message::Shutdown(ack_tx)).is_err() {
            return false;
        }
        matches!(tokio::time::timeout(timeout, ack_rx).await, Ok(Ok(())))
    }

    /// Registers a session, returning the entry it displaced.
    pub fn set(&self, session: Session, tx: Tx) -> Option<EntryItem> {
        self.peers.insert(session.id.client_id.clone(), EntryItem { session, tx })
    }

    /// Removes the entry only when it still belongs to `id`; a superseded
    /// session must not take out its replacement.
    pub fn remove(&self, id: &Id) -> Option<EntryItem> {
        let removed = self.peers.remove_if(&id.client_id, |_, e| e.session.id == *id).map(|(_, e)| e);
        if removed.is_some() {
            self.lockers.remove_if(&id.client_id, |_, l| Arc::strong_count(l) == 1);
        }
        removed
    }

    pub fn tx(&self, client_id: &ClientId) -> Option<(Tx, Id)> {
        self.peers.get(client_id).map(|e| (e.tx.clone(), e.session.id.clone()))
    }

    #[inline]
    pub fn exist(&self, client_id: &ClientId) -> bool {
        self.peers.contains_key(client_id)
    }

    #[inline]
    pub fn sessions_count(&self) -> usize {
        self.peers.len()
    }

    /// Client ids of every live session.
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.peers.iter().map(|e| e.key().clone()).collect()
    }

    /// Routes one publish to every matching local subscriber, QoS capped
    /// at each grant. Returns the number of mailboxes reached.
    pub async fn forwards(&self, scx: &ServerContext, from: Id, publish: Publish) -> Result<usize> {
        let subs = scx.router.matches(&publish.topic).await?;
        if subs.is_empty() {
            scx.hook
                .message_dropped(None, &from, &publish, Reason::from_static("no matched subscriptions"))
                .await;
            return Ok(0);
        }
        let mut delivered = 0;
        for (topic_filter, to, qos) in subs {
            let mut p = publish.clone();
            p.dup = false;
            p.retain = false;
            p.packet_id = None;
            p.qos = p.qos.less_value(qos);
            match self.tx(&to.client_id) {
                Some((tx, _)) => {
                    if tx.unbounded_send(Message::Forward(from.clone(), p.clone())).is_ok() {
                        delivered += 1;
                    } else {
                        log::debug!("forward failed, topic_filter: {topic_filter}, to: {to}");
                        scx.hook
                            .message_dropped(Some(&to), &from, &p, Reason::from_static("session mailbox closed"))
                            .await;
                    }
                }
                None => {
                    scx.hook
                        .message_dropped(Some(&to), &from, &p, Reason::from_static("session is not connected"))
                        .await;
                }
            }
        }
        Ok(delivered)
    }
}
