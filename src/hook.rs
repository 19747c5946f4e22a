//! Broker collaborators: authentication, authorization, persistence and
//! lifecycle notification.
//!
//! Every method has a default: authentication and authorization allow
//! everything, persistence and notifications do nothing. Embedders override
//! only what they need. Authorization failures are masked on the wire: a
//! denied PUBLISH is dropped yet still acknowledged at QoS 1, a denied
//! subscription turns into a failure code in the SUBACK.

use async_trait::async_trait;

use crate::packet::Publish;
use crate::session::Session;
use crate::types::{ConnectInfo, Id, QoS, Reason};

#[async_trait]
pub trait Hook: Sync + Send {
    /// Vets a CONNECT. Returning false refuses the connection with
    /// "not authorized".
    async fn client_authenticate(&self, connect_info: &ConnectInfo) -> bool {
        let _ = connect_info;
        true
    }

    /// Whether `id` may publish this message.
    async fn authorize_publish(&self, id: &Id, publish: &Publish) -> bool {
        let _ = (id, publish);
        true
    }

    /// Whether `id` may subscribe to `topic_filter`.
    async fn authorize_subscribe(&self, id: &Id, topic_filter: &str) -> bool {
        let _ = (id, topic_filter);
        true
    }

    /// Hands an accepted publish to external persistence before fan-out.
    async fn store_packet(&self, from: &Id, publish: &Publish) {
        let _ = (from, publish);
    }

    /// Called after a subscription is granted, before built-in retained
    /// delivery, so external stores can replay their own retained data.
    async fn forward_retained(&self, topic_filter: &str, session: &Session) {
        let _ = (topic_filter, session);
    }

    /// Restores externally persisted state into a freshly accepted
    /// non-clean session.
    async fn restore_client(&self, session: &Session) {
        let _ = session;
    }

    /// Persists a non-clean session's state at disconnect.
    async fn persist_client(&self, session: &Session) {
        let _ = session;
    }

    async fn client_connected(&self, session: &Session) {
        let _ = session;
    }

    /// A DISCONNECT packet arrived; teardown has not started yet.
    async fn client_disconnecting(&self, id: &Id) {
        let _ = id;
    }

    async fn client_disconnected(&self, id: &Id, reason: Reason) {
        let _ = (id, reason);
    }

    /// A publish was accepted and fanned out.
    async fn message_published(&self, from: &Id, publish: &Publish) {
        let _ = (from, publish);
    }

    /// A QoS 1 delivery was acknowledged by its subscriber.
    async fn message_acked(&self, to: &Id, publish: &Publish) {
        let _ = (to, publish);
    }

    async fn session_subscribed(&self, id: &Id, topic_filter: &str, qos: QoS) {
        let _ = (id, topic_filter, qos);
    }

    async fn session_unsubscribed(&self, id: &Id, topic_filter: &str) {
        let _ = (id, topic_filter);
    }

    /// A message could not be delivered (no subscriber mailbox, denied
    /// publish, closed session).
    async fn message_dropped(&self, to: Option<&Id>, from: &Id, publish: &Publish, reason: Reason) {
        let _ = (to, from, publish, reason);
    }
}

/// Allow-all, store-nothing defaults.
pub struct DefaultHook;

#[async_trait]
impl Hook for DefaultHook {}
