//! Decoded MQTT v3.1.1 control packets.
//!
//! The broker core works on these types only; framing to and from bytes is
//! the job of whatever [`crate::transport::PacketStream`] implementation
//! carries the connection.

use std::num::NonZeroU16;

use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

use crate::types::QoS;
use crate::utils::{timestamp_millis, TimestampMillis};

pub const MQTT_LEVEL_311: u8 = 4;

/// Connect flags and payload of a CONNECT packet.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Connect {
    /// Protocol level; `4` for MQTT 3.1.1.
    pub protocol_level: u8,
    /// false means the broker should attempt to resume a persisted session.
    pub clean_session: bool,
    /// Keep-alive interval in seconds; 0 disables the timer.
    pub keep_alive: u16,
    pub client_id: ByteString,
    pub last_will: Option<LastWill>,
    pub username: Option<ByteString>,
    pub password: Option<Bytes>,
}

/// Will message registered at CONNECT, published on abnormal disconnect.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct LastWill {
    pub qos: QoS,
    pub retain: bool,
    pub topic: ByteString,
    pub message: Bytes,
}

/// CONNACK return code.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectAckReason {
    ConnectionAccepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServiceUnavailable,
    BadUserNameOrPassword,
    NotAuthorized,
}

impl ConnectAckReason {
    #[inline]
    pub fn success(&self) -> bool {
        matches!(self, ConnectAckReason::ConnectionAccepted)
    }

    pub fn reason(&self) -> &'static str {
        match self {
            ConnectAckReason::ConnectionAccepted => "Connection Accepted",
            ConnectAckReason::UnacceptableProtocolVersion => "Connection Refused, unacceptable protocol version",
            ConnectAckReason::IdentifierRejected => "Connection Refused, identifier rejected",
            ConnectAckReason::ServiceUnavailable => "Connection Refused, Server unavailable",
            ConnectAckReason::BadUserNameOrPassword => "Connection Refused, bad user name or password",
            ConnectAckReason::NotAuthorized => "Connection Refused, not authorized",
        }
    }
}

/// Application message flowing through the broker.
///
/// Inbound PUBLISH packets, will messages and retained messages all take this
/// shape. `packet_id` is only set on QoS 1 copies handed to a concrete
/// subscriber; it is allocated from that subscriber's session, never carried
/// over from the publisher.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Publish {
    pub dup: bool,
    pub retain: bool,
    pub qos: QoS,
    pub topic: ByteString,
    pub packet_id: Option<NonZeroU16>,
    pub payload: Bytes,
    /// Broker-side receive time.
    pub create_time: TimestampMillis,
}

impl Publish {
    pub fn new(topic: ByteString, qos: QoS, payload: Bytes) -> Self {
        Self {
            dup: false,
            retain: false,
            qos,
            topic,
            packet_id: None,
            payload,
            create_time: timestamp_millis(),
        }
    }

    #[inline]
    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

impl From<&LastWill> for Publish {
    fn from(will: &LastWill) -> Self {
        Publish::new(will.topic.clone(), will.qos, will.message.clone()).retain(will.retain)
    }
}

/// Granted QoS or failure, one per filter in a SUBACK.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

/// MQTT v3.1.1 control packet.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Packet {
    Connect(Box<Connect>),
    ConnectAck {
        session_present: bool,
        return_code: ConnectAckReason,
    },
    Publish(Publish),
    PublishAck {
        packet_id: NonZeroU16,
    },
    Subscribe {
        packet_id: NonZeroU16,
        topic_filters: Vec<(ByteString, QoS)>,
    },
    SubscribeAck {
        packet_id: NonZeroU16,
        status: Vec<SubscribeReturnCode>,
    },
    Unsubscribe {
        packet_id: NonZeroU16,
        topic_filters: Vec<ByteString>,
    },
    UnsubscribeAck {
        packet_id: NonZeroU16,
    },
    PingRequest,
    PingResponse,
    Disconnect,
}

impl Packet {
    /// Short packet-type name for logs.
    pub fn packet_type(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnectAck { .. } => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PublishAck { .. } => "PUBACK",
            Packet::Subscribe { .. } => "SUBSCRIBE",
            Packet::SubscribeAck { .. } => "SUBACK",
            Packet::Unsubscribe { .. } => "UNSUBSCRIBE",
            Packet::UnsubscribeAck { .. } => "UNSUBACK",
            Packet::PingRequest => "PINGREQ",
            Packet::PingResponse => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }
}
