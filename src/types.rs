use std::fmt;
use std::net::SocketAddr;
use std::num::NonZeroU16;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::packet::{Connect, LastWill, Publish};
use crate::utils::{timestamp_millis, TimestampMillis};

pub type ClientId = bytestring::ByteString;
pub type TopicName = bytestring::ByteString;
pub type TopicFilter = bytestring::ByteString;
pub type UserName = bytestring::ByteString;
pub type Reason = bytestring::ByteString;

pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
pub type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;

/// Session mailbox handles.
pub type Tx = futures::channel::mpsc::UnboundedSender<Message>;
pub type Rx = futures::channel::mpsc::UnboundedReceiver<Message>;

/// Quality of service. Only levels 0 and 1 are spoken by this broker;
/// a level 2 flag on the wire is a decode error upstream of the core.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone, Serialize, Deserialize)]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
}

impl QoS {
    #[inline]
    pub fn value(self) -> u8 {
        self as u8
    }

    /// The lower of the two levels; used to cap delivery at the granted QoS.
    #[inline]
    pub fn less_value(self, other: QoS) -> QoS {
        if self < other {
            self
        } else {
            other
        }
    }
}

impl TryFrom<u8> for QoS {
    type Error = crate::MqttError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            _ => Err(crate::MqttError::Protocol(
                format!("unsupported QoS level: {v}").into(),
            )),
        }
    }
}

/// Identity of one accepted connection.
///
/// `create_time` distinguishes two lives of the same client id, so that a
/// superseded session tearing down late cannot clobber registry entries
/// belonging to its replacement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Id {
    pub client_id: ClientId,
    pub remote_addr: Option<SocketAddr>,
    pub username: Option<UserName>,
    pub create_time: TimestampMillis,
}

impl Id {
    pub fn new(client_id: ClientId, remote_addr: Option<SocketAddr>, username: Option<UserName>) -> Self {
        Self { client_id, remote_addr, username, create_time: timestamp_millis() }
    }

    #[inline]
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "client_id": self.client_id,
            "remote_addr": self.remote_addr.map(|a| a.to_string()),
            "username": self.username,
            "create_time": self.create_time,
        })
    }
}

impl PartialEq for Id {
    fn eq(&self, other: &Self) -> bool {
        self.client_id == other.client_id && self.create_time == other.create_time
    }
}

impl Eq for Id {}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}",
            self.client_id,
            self.remote_addr.map(|a| a.to_string()).unwrap_or_default()
        )
    }
}

/// CONNECT data kept for the lifetime of the session.
#[derive(Clone, Debug)]
pub struct ConnectInfo {
    pub id: Id,
    pub connect: Connect,
}

impl ConnectInfo {
    pub fn new(id: Id, connect: Connect) -> Self {
        Self { id, connect }
    }

    #[inline]
    pub fn clean_session(&self) -> bool {
        self.connect.clean_session
    }

    #[inline]
    pub fn keep_alive(&self) -> u16 {
        self.connect.keep_alive
    }

    #[inline]
    pub fn last_will(&self) -> Option<&LastWill> {
        self.connect.last_will.as_ref()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id.to_json(),
            "clean_session": self.clean_session(),
            "keep_alive": self.keep_alive(),
            "username": self.connect.username,
        })
    }
}

/// Control messages delivered to a session task through its mailbox.
#[derive(Debug)]
pub enum Message {
    /// An application message routed to this subscriber.
    Forward(Id, Publish),
    /// A QoS 1 redelivery scheduled by the retry sweeper; `dup` is set.
    Retry(Publish),
    /// Evict this session (duplicate client id, or admin). The sender is
    /// signalled once the session has cleared all broker-side state.
    Kick(oneshot::Sender<()>, Id),
    /// Broker shutdown; like a kick but the peer is not being replaced.
    Shutdown(oneshot::Sender<()>),
}

/// A retained message and the identity that published it.
#[derive(Clone, Debug)]
pub struct Retain {
    pub from: Id,
    pub publish: Publish,
}

/// Key of one unacknowledged QoS 1 delivery, broker wide.
pub type DeliveryKey = (ClientId, NonZeroU16);
