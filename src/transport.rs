//! Transport seam.
//!
//! The broker core consumes decoded [`Packet`] values through the
//! [`PacketStream`] trait; a [`Codec`] turns an accepted TCP connection into
//! one. [`ChannelStream`] is an in-process transport used by embedders and
//! throughout the test suite.

use std::net::SocketAddr;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use tokio::net::TcpStream;

use crate::packet::Packet;
use crate::{MqttError, Result};

/// One framed MQTT connection, already decoded.
#[async_trait]
pub trait PacketStream: Send {
    /// Next inbound packet; `Ok(None)` when the peer closed the
    /// connection.
    async fn recv(&mut self) -> Result<Option<Packet>, MqttError>;

    async fn send(&mut self, packet: Packet) -> Result<(), MqttError>;

    async fn close(&mut self) -> Result<(), MqttError> {
        Ok(())
    }
}

/// Factory binding accepted TCP connections to a wire codec.
pub trait Codec: Sync + Send {
    fn bind(&self, stream: TcpStream, remote_addr: SocketAddr) -> Box<dyn PacketStream>;
}

/// In-process packet transport. [`channel`] returns the two ends of a
/// connection; whatever one end sends, the other receives.
pub struct ChannelStream {
    tx: mpsc::UnboundedSender<Packet>,
    rx: mpsc::UnboundedReceiver<Packet>,
}

/// Creates a connected pair of in-process streams.
pub fn channel() -> (ChannelStream, ChannelStream) {
    let (ltx, lrx) = mpsc::unbounded();
    let (rtx, rrx) = mpsc::unbounded();
    (ChannelStream { tx: ltx, rx: rrx }, ChannelStream { tx: rtx, rx: lrx })
}

#[async_trait]
impl PacketStream for ChannelStream {
    async fn recv(&mut self) -> Result<Option<Packet>, MqttError> {
        Ok(self.rx.next().await)
    }

    async fn send(&mut self, packet: Packet) -> Result<(), MqttError> {
        self.tx
            .unbounded_send(packet)
            .map_err(|e| MqttError::Transport(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), MqttError> {
        self.tx.close_channel();
        self.rx.close();
        Ok(())
    }
}
