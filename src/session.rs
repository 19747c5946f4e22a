//! Client session: handshake, the per-connection run loop, and teardown.
//!
//! Each accepted connection runs [`process`] in its own task. The task owns
//! the packet stream exclusively; everything else reaches the session
//! through its mailbox ([`crate::types::Message`]).

use std::net::SocketAddr;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc;
use futures::StreamExt;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::context::ServerContext;
use crate::fanout::Bus as _;
use crate::hook::Hook as _;
use crate::inflight::Inflight;
use crate::retain::RetainStorage as _;
use crate::packet::{Connect, ConnectAckReason, Packet, Publish, SubscribeReturnCode, MQTT_LEVEL_311};
use crate::topic::{has_wildcards, Topic};
use crate::transport::PacketStream;
use crate::types::{ClientId, ConnectInfo, HashMap, Id, Message, QoS, Reason, Retain, Rx, TopicFilter, Tx};
use crate::utils::{timestamp_millis, TimestampMillis};
use crate::{Error, MqttError, Result};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct StateFlags: u8 {
        const KICKED = 0b0001;
        const DISCONNECT_RECEIVED = 0b0010;
        const SHUTDOWN = 0b0100;
    }
}

/// Shared, immutable-ish view of one client session.
#[derive(Clone)]
pub struct Session(Arc<SessionInner>);

pub struct SessionInner {
    pub id: Id,
    pub scx: ServerContext,
    pub connect_info: ConnectInfo,
    pub created_at: TimestampMillis,
    subscriptions: parking_lot::RwLock<HashMap<TopicFilter, QoS>>,
}

impl Deref for Session {
    type Target = SessionInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Session {{ id: {} }}", self.id)
    }
}

impl Session {
    pub fn new(id: Id, scx: ServerContext, connect_info: ConnectInfo) -> Self {
        Self(Arc::new(SessionInner {
            id,
            scx,
            connect_info,
            created_at: timestamp_millis(),
            subscriptions: parking_lot::RwLock::new(HashMap::default()),
        }))
    }

    #[inline]
    pub fn clean_session(&self) -> bool {
        self.connect_info.clean_session()
    }

    /// Disconnect deadline: 1.5 times the negotiated keep-alive. A zero
    /// keep-alive disables the timer.
    pub fn keep_alive_timeout(&self) -> Duration {
        let keep_alive = self.connect_info.keep_alive();
        if keep_alive == 0 {
            Duration::from_secs(u32::MAX as u64)
        } else {
            Duration::from_millis(keep_alive as u64 * 1500)
        }
    }

    pub fn subscriptions_add(&self, topic_filter: TopicFilter, qos: QoS) {
        self.subscriptions.write().insert(topic_filter, qos);
    }

    pub fn subscriptions_remove(&self, topic_filter: &str) -> Option<QoS> {
        self.subscriptions.write().remove(topic_filter)
    }

    pub fn subscriptions_drain(&self) -> Vec<TopicFilter> {
        self.subscriptions.write().drain().map(|(f, _)| f).collect()
    }

    #[inline]
    pub fn subscriptions_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id.to_json(),
            "clean_session": self.clean_session(),
            "created_at": self.created_at,
            "subscriptions": self.subscriptions.read().keys().collect::<Vec<_>>(),
        })
    }
}

/// Mutable half of a running session, owned by its connection task.
pub struct SessionState {
    session: Session,
    tx: Tx,
    inflight: Inflight,
}

impl Deref for SessionState {
    type Target = Session;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

/// Serves one connection to completion: CONNECT handshake, run loop,
/// teardown. The returned error describes why the session ended; the
/// connection is already cleaned up either way.
pub async fn process(scx: ServerContext, mut sink: Box<dyn PacketStream>, remote_addr: Option<SocketAddr>) -> Result<()> {
    let packet = match tokio::time::timeout(scx.settings.handshake_timeout(), sink.recv()).await {
        Ok(packet) => packet?,
        Err(_) => {
            let _ = sink.close().await;
            return Err(MqttError::Protocol(Reason::from_static("handshake timeout")).into());
        }
    };
    let connect = match packet {
        Some(Packet::Connect(connect)) => *connect,
        Some(packet) => {
            let _ = sink.close().await;
            return Err(MqttError::Protocol(
                format!("expected CONNECT, got {}", packet.packet_type()).into(),
            )
            .into());
        }
        None => return Err(MqttError::RemoteClose.into()),
    };

    match handshake(&scx, connect, remote_addr).await {
        Ok((state, rx)) => {
            sink.send(Packet::ConnectAck {
                session_present: false,
                return_code: ConnectAckReason::ConnectionAccepted,
            })
            .await?;
            log::info!("{} connected, clean_session: {}", state.id, state.clean_session());
            scx.hook.client_connected(&state.session).await;
            if !state.clean_session() {
                scx.hook.restore_client(&state.session).await;
            }
            state.run(sink, rx).await
        }
        Err((return_code, e)) => {
            log::info!("connection refused, {}, {:?}", return_code.reason(), e);
            let _ = sink.send(Packet::ConnectAck { session_present: false, return_code }).await;
            let _ = sink.close().await;
            Err(e)
        }
    }
}

async fn handshake(
    scx: &ServerContext,
    mut connect: Connect,
    remote_addr: Option<SocketAddr>,
) -> Result<(SessionState, Rx), (ConnectAckReason, Error)> {
    if connect.protocol_level != MQTT_LEVEL_311 {
        return Err((
            ConnectAckReason::UnacceptableProtocolVersion,
            MqttError::UnacceptableProtocolVersion.into(),
        ));
    }

    let max_len = scx.settings.max_clientid_len;
    if max_len > 0 && connect.client_id.len() > max_len {
        return Err((ConnectAckReason::IdentifierRejected, MqttError::IdentifierRejected.into()));
    }
    if connect.client_id.is_empty() {
        if connect.clean_session {
            connect.client_id = ClientId::from(Uuid::new_v4().simple().to_string());
        } else {
            // an assigned id cannot outlive the connection
            return Err((ConnectAckReason::IdentifierRejected, MqttError::IdentifierRejected.into()));
        }
    }

    if !scx.settings.allow_anonymous && connect.username.is_none() {
        return Err((
            ConnectAckReason::BadUserNameOrPassword,
            MqttError::AuthenticationDenied.into(),
        ));
    }

    let id = Id::new(connect.client_id.clone(), remote_addr, connect.username.clone());
    let connect_info = ConnectInfo::new(id.clone(), connect);
    if !scx.hook.client_authenticate(&connect_info).await {
        return Err((ConnectAckReason::NotAuthorized, MqttError::AuthenticationDenied.into()));
    }

    let _locker = scx
        .shared
        .try_lock(&id.client_id)
        .map_err(|e| (ConnectAckReason::ServiceUnavailable, Error::from(e)))?;

    // a second connection with the same id takes over; the first session
    // is asked to clear out and we wait until it has
    if scx.shared.exist(&id.client_id) {
        scx.shared
            .kick(&id.client_id, &id)
            .await
            .map_err(|e| (ConnectAckReason::ServiceUnavailable, e))?;
    }

    let session = Session::new(id, scx.clone(), connect_info);
    let (tx, rx) = mpsc::unbounded();
    scx.shared.set(session.clone(), tx.clone());
    Ok((SessionState { session, tx, inflight: Inflight::new() }, rx))
}

enum Action {
    KeepAliveTimeout,
    Msg(Option<Message>),
    Packet(Option<Packet>),
}

impl SessionState {
    async fn run(mut self, mut sink: Box<dyn PacketStream>, mut rx: Rx) -> Result<()> {
        let scx = self.scx.clone();
        let mut flags = StateFlags::empty();

        let (ack, reason, err) = match self.run_loop(&mut sink, &mut rx, &mut flags).await {
            Ok(ack) => {
                let reason = if flags.contains(StateFlags::DISCONNECT_RECEIVED) {
                    Reason::from_static("disconnect")
                } else if flags.contains(StateFlags::SHUTDOWN) {
                    Reason::from_static("server shutdown")
                } else {
                    Reason::from_static("kicked")
                };
                (ack, reason, None)
            }
            Err(e) => {
                log::debug!("{} session ended, {:?}", self.id, e);
                (None, Reason::from(e.to_string()), Some(e))
            }
        };

        // the will fires only when the client did not leave on purpose and
        // was not gracefully replaced or shut down
        if flags.is_empty() {
            self.publish_will(&scx).await;
        }

        if !self.clean_session() {
            scx.hook.persist_client(&self.session).await;
        }

        self.subscriptions_drain();
        if let Err(e) = scx.router.remove_client(&self.id).await {
            log::warn!("{} remove subscriptions failed, {:?}", self.id, e);
        }
        scx.retry.cancel_all(&self.id);
        scx.shared.remove(&self.id);
        let _ = sink.close().await;
        log::info!("{} disconnected, reason: {}", self.id, reason);
        scx.hook.client_disconnected(&self.id, reason).await;
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Ok carries the eviction acknowledger when the loop ended by kick or
    /// shutdown; any Err is an abnormal close.
    async fn run_loop(
        &mut self,
        sink: &mut Box<dyn PacketStream>,
        rx: &mut Rx,
        flags: &mut StateFlags,
    ) -> Result<Option<oneshot::Sender<()>>> {
        let keep_alive = self.keep_alive_timeout();
        let deadline = tokio::time::sleep(keep_alive);
        tokio::pin!(deadline);
        loop {
            let action = tokio::select! {
                _ = deadline.as_mut() => Action::KeepAliveTimeout,
                msg = rx.next() => Action::Msg(msg),
                packet = sink.recv() => Action::Packet(packet?),
            };
            match action {
                Action::KeepAliveTimeout => return Err(MqttError::KeepAliveTimeout.into()),
                Action::Msg(None) => return Err(MqttError::MailboxClosed.into()),
                Action::Msg(Some(msg)) => match msg {
                    Message::Forward(from, publish) => {
                        self.deliver(sink, from, publish).await?;
                    }
                    Message::Retry(publish) => {
                        sink.send(Packet::Publish(publish)).await?;
                    }
                    Message::Kick(ack, by) => {
                        log::debug!("{} kicked by {}", self.id, by);
                        flags.insert(StateFlags::KICKED);
                        return Ok(Some(ack));
                    }
                    Message::Shutdown(ack) => {
                        flags.insert(StateFlags::SHUTDOWN);
                        return Ok(Some(ack));
                    }
                },
                Action::Packet(None) => return Err(MqttError::RemoteClose.into()),
                Action::Packet(Some(packet)) => {
                    deadline.as_mut().reset(tokio::time::Instant::now() + keep_alive);
                    if self.process_packet(sink, flags, packet).await? {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Returns true when the packet was DISCONNECT.
    async fn process_packet(
        &mut self,
        sink: &mut Box<dyn PacketStream>,
        flags: &mut StateFlags,
        packet: Packet,
    ) -> Result<bool> {
        match packet {
            Packet::Publish(publish) => self.process_publish(sink, publish).await?,
            Packet::PublishAck { packet_id } => {
                if let Some(delivery) = self.scx.retry.acknowledge(&self.id.client_id, packet_id) {
                    self.inflight.remove(packet_id);
                    self.scx.hook.message_acked(&self.id, &delivery.publish).await;
                } else {
                    log::debug!("{} PUBACK for unknown packet_id: {}", self.id, packet_id);
                }
            }
            Packet::Subscribe { packet_id, topic_filters } => {
                self.process_subscribe(sink, packet_id, topic_filters).await?;
            }
            Packet::Unsubscribe { packet_id, topic_filters } => {
                self.process_unsubscribe(sink, packet_id, topic_filters).await?;
            }
            Packet::PingRequest => sink.send(Packet::PingResponse).await?,
            Packet::Disconnect => {
                flags.insert(StateFlags::DISCONNECT_RECEIVED);
                self.scx.hook.client_disconnecting(&self.id).await;
                return Ok(true);
            }
            Packet::Connect(_) => {
                return Err(MqttError::Protocol(Reason::from_static("duplicate CONNECT")).into());
            }
            packet => {
                return Err(MqttError::Protocol(
                    format!("unexpected packet: {}", packet.packet_type()).into(),
                )
                .into());
            }
        }
        Ok(false)
    }

    async fn process_publish(&mut self, sink: &mut Box<dyn PacketStream>, publish: Publish) -> Result<()> {
        if has_wildcards(&publish.topic) {
            return Err(MqttError::Protocol(Reason::from_static("wildcards in PUBLISH topic")).into());
        }
        Topic::from_str(&publish.topic)?;
        if publish.qos == QoS::AtLeastOnce && publish.packet_id.is_none() {
            return Err(MqttError::Protocol(Reason::from_static("QoS 1 PUBLISH without packet id")).into());
        }

        let scx = self.scx.clone();
        if scx.hook.authorize_publish(&self.id, &publish).await {
            self.dispatch(&scx, publish.clone()).await?;
        } else {
            // deny is masked: drop the message but acknowledge, so the
            // client is not left retrying
            log::warn!("{} publish to {} not authorized", self.id, publish.topic);
            scx.hook
                .message_dropped(None, &self.id, &publish, Reason::from_static("publish not authorized"))
                .await;
        }

        if let (QoS::AtLeastOnce, Some(packet_id)) = (publish.qos, publish.packet_id) {
            sink.send(Packet::PublishAck { packet_id }).await?;
        }
        Ok(())
    }

    async fn process_subscribe(
        &mut self,
        sink: &mut Box<dyn PacketStream>,
        packet_id: std::num::NonZeroU16,
        topic_filters: Vec<(TopicFilter, QoS)>,
    ) -> Result<()> {
        let scx = self.scx.clone();
        let mut status = Vec::with_capacity(topic_filters.len());
        let mut granted = Vec::new();
        for (topic_filter, qos) in topic_filters {
            if Topic::from_str(&topic_filter).is_err() {
                status.push(SubscribeReturnCode::Failure);
                continue;
            }
            if !scx.hook.authorize_subscribe(&self.id, &topic_filter).await {
                log::warn!("{} subscribe to {} not authorized", self.id, topic_filter);
                status.push(SubscribeReturnCode::Failure);
                continue;
            }
            let qos = qos.less_value(scx.settings.max_qos_allowed());
            scx.router.add(&topic_filter, self.id.clone(), qos).await?;
            self.subscriptions_add(topic_filter.clone(), qos);
            scx.hook.session_subscribed(&self.id, &topic_filter, qos).await;
            status.push(SubscribeReturnCode::Success(qos));
            granted.push((topic_filter, qos));
        }
        sink.send(Packet::SubscribeAck { packet_id, status }).await?;

        // retained messages follow the SUBACK
        for (topic_filter, qos) in granted {
            scx.hook.forward_retained(&topic_filter, &self.session).await;
            for (_, retained) in scx.retain.get(&topic_filter).await? {
                let mut publish = retained.publish;
                publish.retain = true;
                publish.dup = false;
                publish.packet_id = None;
                publish.qos = publish.qos.less_value(qos);
                self.deliver(sink, retained.from, publish).await?;
            }
        }
        Ok(())
    }

    async fn process_unsubscribe(
        &mut self,
        sink: &mut Box<dyn PacketStream>,
        packet_id: std::num::NonZeroU16,
        topic_filters: Vec<TopicFilter>,
    ) -> Result<()> {
        let scx = self.scx.clone();
        for topic_filter in topic_filters {
            // unknown filters are acknowledged all the same
            if scx.router.remove(&topic_filter, &self.id).await? {
                self.subscriptions_remove(&topic_filter);
                scx.hook.session_unsubscribed(&self.id, &topic_filter).await;
            }
        }
        sink.send(Packet::UnsubscribeAck { packet_id }).await?;
        Ok(())
    }

    /// Writes one message to the peer, reserving a packet id and arming
    /// retransmission when it goes out at QoS 1.
    async fn deliver(&mut self, sink: &mut Box<dyn PacketStream>, from: Id, mut publish: Publish) -> Result<()> {
        match publish.qos {
            QoS::AtMostOnce => {
                publish.packet_id = None;
                sink.send(Packet::Publish(publish)).await?;
            }
            QoS::AtLeastOnce => {
                let packet_id = self.inflight.next_id()?;
                publish.packet_id = Some(packet_id);
                sink.send(Packet::Publish(publish.clone())).await?;
                self.scx
                    .retry
                    .track(self.id.clone(), packet_id, from, publish, self.tx.clone());
            }
        }
        Ok(())
    }

    /// The fan-out every accepted publish takes: retained store,
    /// persistence hook, local routing, the external bus, then the
    /// published notification.
    async fn dispatch(&self, scx: &ServerContext, publish: Publish) -> Result<()> {
        if publish.retain {
            scx.retain
                .set(&publish.topic, Retain { from: self.id.clone(), publish: publish.clone() })
                .await?;
        }
        scx.hook.store_packet(&self.id, &publish).await;
        scx.shared.forwards(scx, self.id.clone(), publish.clone()).await?;
        scx.bus.publish(&publish.topic, &publish.payload).await?;
        scx.hook.message_published(&self.id, &publish).await;
        Ok(())
    }

    /// Wills go out through the same path as any accepted publish, so bus
    /// mirrors and persistence observers see them too.
    async fn publish_will(&self, scx: &ServerContext) {
        let Some(will) = self.connect_info.last_will() else {
            return;
        };
        let publish = Publish::from(will);
        log::debug!("{} publishing will to {}", self.id, publish.topic);
        if let Err(e) = self.dispatch(scx, publish).await {
            log::warn!("{} will publish failed, {:?}", self.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU16;

    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;

    use super::*;
    use crate::fanout::{Bus, BusTx};
    use crate::hook::Hook;
    use crate::packet::LastWill;
    use crate::retain::RetainStorage as _;
    use crate::transport::{channel, ChannelStream};
    use crate::types::TopicName;

    fn scx() -> ServerContext {
        ServerContext::new().build()
    }

    fn connect_packet(client_id: &str) -> Connect {
        Connect {
            protocol_level: MQTT_LEVEL_311,
            clean_session: true,
            keep_alive: 0,
            client_id: ClientId::from(client_id.to_owned()),
            last_will: None,
            username: None,
            password: None,
        }
    }

    async fn connect_with(scx: &ServerContext, connect: Connect) -> (ChannelStream, ConnectAckReason) {
        let (local, mut remote) = channel();
        let scx = scx.clone();
        tokio::spawn(async move {
            let _ = process(scx, Box::new(local), None).await;
        });
        remote.send(Packet::Connect(Box::new(connect))).await.unwrap();
        match remote.recv().await.unwrap() {
            Some(Packet::ConnectAck { return_code, .. }) => (remote, return_code),
            other => panic!("expected CONNACK, got {other:?}"),
        }
    }

    async fn connect(scx: &ServerContext, client_id: &str) -> ChannelStream {
        let (remote, code) = connect_with(scx, connect_packet(client_id)).await;
        assert!(code.success(), "{}", code.reason());
        remote
    }

    fn pid(v: u16) -> NonZeroU16 {
        NonZeroU16::new(v).unwrap()
    }

    async fn subscribe(remote: &mut ChannelStream, topic_filter: &str, qos: QoS) -> Vec<SubscribeReturnCode> {
        remote
            .send(Packet::Subscribe {
                packet_id: pid(1),
                topic_filters: vec![(TopicFilter::from(topic_filter.to_owned()), qos)],
            })
            .await
            .unwrap();
        match remote.recv().await.unwrap() {
            Some(Packet::SubscribeAck { status, .. }) => status,
            other => panic!("expected SUBACK, got {other:?}"),
        }
    }

    async fn recv_publish(remote: &mut ChannelStream) -> Publish {
        match remote.recv().await.unwrap() {
            Some(Packet::Publish(p)) => p,
            other => panic!("expected PUBLISH, got {other:?}"),
        }
    }

    async fn assert_silent(remote: &mut ChannelStream) {
        let got = tokio::time::timeout(Duration::from_millis(100), remote.recv()).await;
        assert!(got.is_err(), "expected no packet, got {got:?}");
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_connect_ping_disconnect() {
        let scx = scx();
        let mut c1 = connect(&scx, "c1").await;
        assert_eq!(scx.shared.sessions_count(), 1);

        c1.send(Packet::PingRequest).await.unwrap();
        assert_eq!(c1.recv().await.unwrap(), Some(Packet::PingResponse));

        c1.send(Packet::Disconnect).await.unwrap();
        wait_until(|| scx.shared.sessions_count() == 0).await;
    }

    #[tokio::test]
    async fn test_unacceptable_protocol_version() {
        let scx = scx();
        let mut connect = connect_packet("c1");
        connect.protocol_level = 3;
        let (mut remote, code) = connect_with(&scx, connect).await;
        assert_eq!(code, ConnectAckReason::UnacceptableProtocolVersion);
        assert_eq!(remote.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_empty_client_id() {
        let scx = scx();
        // clean session: broker assigns an id
        let (_remote, code) = connect_with(&scx, connect_packet("")).await;
        assert!(code.success());
        assert_eq!(scx.shared.sessions_count(), 1);

        // persistent session with no id is refused
        let mut connect = connect_packet("");
        connect.clean_session = false;
        let (_remote, code) = connect_with(&scx, connect).await;
        assert_eq!(code, ConnectAckReason::IdentifierRejected);
    }

    #[tokio::test]
    async fn test_first_packet_must_be_connect() {
        let scx = scx();
        let (local, mut remote) = channel();
        let scx2 = scx.clone();
        let handle = tokio::spawn(async move { process(scx2, Box::new(local), None).await });
        remote.send(Packet::PingRequest).await.unwrap();
        assert_eq!(remote.recv().await.unwrap(), None);
        assert!(handle.await.unwrap().is_err());
        assert_eq!(scx.shared.sessions_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_publish_qos0() {
        let scx = scx();
        let mut sub = connect(&scx, "sub1").await;
        let mut publ = connect(&scx, "pub1").await;

        let status = subscribe(&mut sub, "a/+", QoS::AtMostOnce).await;
        assert_eq!(status, vec![SubscribeReturnCode::Success(QoS::AtMostOnce)]);

        publ.send(Packet::Publish(Publish::new(
            TopicName::from_static("a/b"),
            QoS::AtMostOnce,
            Bytes::from_static(b"hello"),
        )))
        .await
        .unwrap();

        let p = recv_publish(&mut sub).await;
        assert_eq!(&*p.topic, "a/b");
        assert_eq!(p.payload.as_ref(), b"hello");
        assert_eq!(p.qos, QoS::AtMostOnce);
        assert!(!p.retain);
        assert!(p.packet_id.is_none());

        // deeper topics do not match a single-level wildcard
        publ.send(Packet::Publish(Publish::new(
            TopicName::from_static("a/b/c"),
            QoS::AtMostOnce,
            Bytes::from_static(b"nope"),
        )))
        .await
        .unwrap();
        assert_silent(&mut sub).await;
    }

    #[tokio::test]
    async fn test_invalid_filter_in_subscribe() {
        let scx = scx();
        let mut sub = connect(&scx, "sub1").await;
        sub.send(Packet::Subscribe {
            packet_id: pid(7),
            topic_filters: vec![
                (TopicFilter::from_static("ok/#"), QoS::AtMostOnce),
                (TopicFilter::from_static("bad/#/deeper"), QoS::AtMostOnce),
            ],
        })
        .await
        .unwrap();
        match sub.recv().await.unwrap() {
            Some(Packet::SubscribeAck { packet_id, status }) => {
                assert_eq!(packet_id, pid(7));
                assert_eq!(
                    status,
                    vec![SubscribeReturnCode::Success(QoS::AtMostOnce), SubscribeReturnCode::Failure]
                );
            }
            other => panic!("expected SUBACK, got {other:?}"),
        }
        assert_eq!(scx.router.relations_count(), 1);
    }

    #[tokio::test]
    async fn test_qos1_delivery_and_ack() {
        let scx = scx();
        let mut sub = connect(&scx, "sub1").await;
        let mut publ = connect(&scx, "pub1").await;
        subscribe(&mut sub, "q/1", QoS::AtLeastOnce).await;

        let mut publish = Publish::new(TopicName::from_static("q/1"), QoS::AtLeastOnce, Bytes::from_static(b"m1"));
        publish.packet_id = Some(pid(11));
        publ.send(Packet::Publish(publish)).await.unwrap();

        // the publisher is acknowledged with its own packet id
        assert_eq!(publ.recv().await.unwrap(), Some(Packet::PublishAck { packet_id: pid(11) }));

        // the subscriber copy carries a fresh id from its own session
        let p = recv_publish(&mut sub).await;
        assert_eq!(p.qos, QoS::AtLeastOnce);
        let packet_id = p.packet_id.unwrap();
        assert_eq!(scx.retry.pending_count(), 1);

        sub.send(Packet::PublishAck { packet_id }).await.unwrap();
        wait_until(|| scx.retry.pending_count() == 0).await;

        // an ack for an unknown id is ignored
        sub.send(Packet::PublishAck { packet_id: pid(999) }).await.unwrap();
        sub.send(Packet::PingRequest).await.unwrap();
        assert_eq!(sub.recv().await.unwrap(), Some(Packet::PingResponse));
    }

    #[tokio::test]
    async fn test_qos1_downgraded_to_grant() {
        let scx = scx();
        let mut sub = connect(&scx, "sub1").await;
        let mut publ = connect(&scx, "pub1").await;
        subscribe(&mut sub, "q/0", QoS::AtMostOnce).await;

        let mut publish = Publish::new(TopicName::from_static("q/0"), QoS::AtLeastOnce, Bytes::from_static(b"m1"));
        publish.packet_id = Some(pid(3));
        publ.send(Packet::Publish(publish)).await.unwrap();

        let p = recv_publish(&mut sub).await;
        assert_eq!(p.qos, QoS::AtMostOnce);
        assert!(p.packet_id.is_none());
        assert_eq!(scx.retry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_retained_messages() {
        let scx = scx();
        let mut publ = connect(&scx, "pub1").await;

        let publish = Publish::new(
            TopicName::from_static("sensors/room1/temp"),
            QoS::AtMostOnce,
            Bytes::from_static(b"21.5"),
        )
        .retain(true);
        publ.send(Packet::Publish(publish)).await.unwrap();
        // packets are processed in order, so the pong doubles as a barrier
        publ.send(Packet::PingRequest).await.unwrap();
        assert_eq!(publ.recv().await.unwrap(), Some(Packet::PingResponse));
        assert_eq!(scx.retain.count().await, 1);

        // a later subscriber receives the retained message after its SUBACK
        let mut sub = connect(&scx, "sub1").await;
        subscribe(&mut sub, "sensors/+/temp", QoS::AtLeastOnce).await;
        let p = recv_publish(&mut sub).await;
        assert!(p.retain);
        assert_eq!(&*p.topic, "sensors/room1/temp");
        assert_eq!(p.payload.as_ref(), b"21.5");
        assert_eq!(p.qos, QoS::AtMostOnce);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let scx = scx();
        let mut sub = connect(&scx, "sub1").await;
        let mut publ = connect(&scx, "pub1").await;
        subscribe(&mut sub, "u/1", QoS::AtMostOnce).await;

        // unsubscribing an unknown filter is acknowledged all the same
        sub.send(Packet::Unsubscribe {
            packet_id: pid(9),
            topic_filters: vec![TopicFilter::from_static("u/1"), TopicFilter::from_static("never/was")],
        })
        .await
        .unwrap();
        assert_eq!(sub.recv().await.unwrap(), Some(Packet::UnsubscribeAck { packet_id: pid(9) }));
        assert_eq!(scx.router.relations_count(), 0);

        publ.send(Packet::Publish(Publish::new(
            TopicName::from_static("u/1"),
            QoS::AtMostOnce,
            Bytes::from_static(b"late"),
        )))
        .await
        .unwrap();
        assert_silent(&mut sub).await;
    }

    #[tokio::test]
    async fn test_duplicate_client_id_evicts() {
        let scx = scx();
        let mut first = connect(&scx, "dup").await;
        subscribe(&mut first, "d/1", QoS::AtMostOnce).await;

        let _second = connect(&scx, "dup").await;
        // the first connection is closed and, by CONNACK time of the
        // second, its state is gone
        assert_eq!(first.recv().await.unwrap(), None);
        assert_eq!(scx.shared.sessions_count(), 1);
        assert_eq!(scx.router.relations_count(), 0);
    }

    #[tokio::test]
    async fn test_will_on_abnormal_close() {
        let scx = scx();
        let mut sub = connect(&scx, "sub1").await;
        subscribe(&mut sub, "will/t", QoS::AtMostOnce).await;

        let mut connect_pkt = connect_packet("doomed");
        connect_pkt.last_will = Some(LastWill {
            qos: QoS::AtMostOnce,
            retain: false,
            topic: TopicName::from_static("will/t"),
            message: Bytes::from_static(b"gone"),
        });
        let (mut doomed, code) = connect_with(&scx, connect_pkt).await;
        assert!(code.success());

        doomed.close().await.unwrap();

        let p = recv_publish(&mut sub).await;
        assert_eq!(&*p.topic, "will/t");
        assert_eq!(p.payload.as_ref(), b"gone");
    }

    struct RecordingBus {
        published: Mutex<Vec<(TopicName, Bytes)>>,
    }

    #[async_trait]
    impl Bus for RecordingBus {
        async fn publish(&self, topic: &TopicName, payload: &Bytes) -> Result<()> {
            self.published.lock().push((topic.clone(), payload.clone()));
            Ok(())
        }

        async fn subscribe(&self, _pattern: &str, _tx: BusTx) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingHook {
        stored: Mutex<Vec<TopicName>>,
        published: Mutex<Vec<TopicName>>,
    }

    #[async_trait]
    impl Hook for RecordingHook {
        async fn store_packet(&self, _from: &Id, publish: &Publish) {
            self.stored.lock().push(publish.topic.clone());
        }

        async fn message_published(&self, _from: &Id, publish: &Publish) {
            self.published.lock().push(publish.topic.clone());
        }
    }

    #[tokio::test]
    async fn test_will_reaches_bus_and_observers() {
        let bus = Arc::new(RecordingBus { published: Mutex::new(Vec::new()) });
        let hook = Arc::new(RecordingHook::default());
        let scx = ServerContext::new().hook(hook.clone()).bus(bus.clone()).build();

        let mut connect_pkt = connect_packet("doomed");
        connect_pkt.last_will = Some(LastWill {
            qos: QoS::AtMostOnce,
            retain: false,
            topic: TopicName::from_static("will/t"),
            message: Bytes::from_static(b"gone"),
        });
        let (mut doomed, code) = connect_with(&scx, connect_pkt).await;
        assert!(code.success());

        doomed.close().await.unwrap();
        wait_until(|| scx.shared.sessions_count() == 0).await;

        let mirrored = bus.published.lock();
        assert_eq!(mirrored.len(), 1);
        assert_eq!(&*mirrored[0].0, "will/t");
        assert_eq!(mirrored[0].1.as_ref(), b"gone");
        assert_eq!(hook.stored.lock().len(), 1);
        assert_eq!(&*hook.published.lock()[0], "will/t");
    }

    #[tokio::test]
    async fn test_will_suppressed_on_disconnect() {
        let scx = scx();
        let mut sub = connect(&scx, "sub1").await;
        subscribe(&mut sub, "will/t", QoS::AtMostOnce).await;

        let mut connect_pkt = connect_packet("polite");
        connect_pkt.last_will = Some(LastWill {
            qos: QoS::AtMostOnce,
            retain: false,
            topic: TopicName::from_static("will/t"),
            message: Bytes::from_static(b"gone"),
        });
        let (mut polite, code) = connect_with(&scx, connect_pkt).await;
        assert!(code.success());

        polite.send(Packet::Disconnect).await.unwrap();
        wait_until(|| scx.shared.sessions_count() == 1).await;
        assert_silent(&mut sub).await;
    }

    struct DenySecretHook;

    #[async_trait]
    impl Hook for DenySecretHook {
        async fn authorize_publish(&self, _id: &Id, publish: &Publish) -> bool {
            !publish.topic.starts_with("secret/")
        }

        async fn authorize_subscribe(&self, _id: &Id, topic_filter: &str) -> bool {
            !topic_filter.starts_with("secret/")
        }
    }

    #[tokio::test]
    async fn test_authorization_denied_is_masked() {
        let scx = ServerContext::new().hook(Arc::new(DenySecretHook)).build();
        let mut c1 = connect(&scx, "c1").await;

        let status = subscribe(&mut c1, "secret/x", QoS::AtMostOnce).await;
        assert_eq!(status, vec![SubscribeReturnCode::Failure]);
        assert_eq!(scx.router.relations_count(), 0);

        // a denied QoS 1 publish is dropped but still acknowledged
        let mut publish =
            Publish::new(TopicName::from_static("secret/x"), QoS::AtLeastOnce, Bytes::from_static(b"s"));
        publish.packet_id = Some(pid(5));
        c1.send(Packet::Publish(publish)).await.unwrap();
        assert_eq!(c1.recv().await.unwrap(), Some(Packet::PublishAck { packet_id: pid(5) }));
    }

    #[tokio::test]
    async fn test_publish_with_wildcard_topic_is_fatal() {
        let scx = scx();
        let mut c1 = connect(&scx, "c1").await;
        c1.send(Packet::Publish(Publish::new(
            TopicName::from_static("a/+"),
            QoS::AtMostOnce,
            Bytes::from_static(b"x"),
        )))
        .await
        .unwrap();
        assert_eq!(c1.recv().await.unwrap(), None);
        wait_until(|| scx.shared.sessions_count() == 0).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_timeout() {
        let scx = scx();
        let mut connect_pkt = connect_packet("idle");
        connect_pkt.keep_alive = 1;
        let (mut remote, code) = connect_with(&scx, connect_pkt).await;
        assert!(code.success());

        // no traffic: the broker closes at 1.5x the keep-alive
        assert_eq!(remote.recv().await.unwrap(), None);
        assert_eq!(scx.shared.sessions_count(), 0);
    }
}
